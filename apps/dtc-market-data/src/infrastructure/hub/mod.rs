//! Price Hub
//!
//! Fan-out of [`PriceUpdate`]s through one tokio broadcast channel per
//! [`SubscriptionKey`].
//!
//! # Architecture
//!
//! Channels belong to the hub, not to a session. Receivers obtained from
//! [`PriceHub::subscribe`] therefore survive reconnects and source changes:
//! the reconnect supervisor and the tick-file tailers both publish into the
//! same channel for a symbol.
//!
//! A receiver that falls more than `channel_capacity` updates behind gets
//! `RecvError::Lagged` and skips ahead; publishers never wait.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::domain::market_data::{PriceUpdate, SubscriptionKey};

/// Default capacity of each per-symbol channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration for hub channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Capacity of each per-symbol channel.
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Per-symbol broadcast channels.
///
/// # Example
///
/// ```rust
/// use dtc_market_data::domain::market_data::SubscriptionKey;
/// use dtc_market_data::infrastructure::hub::{HubConfig, PriceHub};
///
/// let hub = PriceHub::new(HubConfig::default());
/// let key = SubscriptionKey::new("ESZ25", "CME");
///
/// let _rx = hub.subscribe(&key);
/// assert_eq!(hub.receiver_count(&key), 1);
/// ```
#[derive(Debug)]
pub struct PriceHub {
    config: HubConfig,
    channels: RwLock<HashMap<SubscriptionKey, broadcast::Sender<PriceUpdate>>>,
}

impl Default for PriceHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl PriceHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            config: HubConfig {
                channel_capacity: config.channel_capacity.max(1),
            },
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Receiver for `key`, creating its channel on first use.
    #[must_use]
    pub fn subscribe(&self, key: &SubscriptionKey) -> broadcast::Receiver<PriceUpdate> {
        if let Some(tx) = self.channels.read().get(key) {
            return tx.subscribe();
        }
        self.channels
            .write()
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.config.channel_capacity).0)
            .subscribe()
    }

    /// Publish an update on its key's channel.
    ///
    /// Returns the number of receivers reached, or `None` when the key has
    /// no channel or no live receivers.
    #[must_use]
    pub fn publish(&self, update: PriceUpdate) -> Option<usize> {
        let channels = self.channels.read();
        let Some(tx) = channels.get(&update.key) else {
            tracing::trace!(symbol = %update.key, "No channel for update");
            return None;
        };
        tx.send(update).ok()
    }

    /// Live receivers for `key`.
    #[must_use]
    pub fn receiver_count(&self, key: &SubscriptionKey) -> usize {
        self.channels
            .read()
            .get(key)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Whether a channel exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.channels.read().contains_key(key)
    }

    /// Keys with a channel, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self.channels.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop the channel for `key`; its receivers observe `Closed`.
    pub fn remove(&self, key: &SubscriptionKey) -> bool {
        self.channels.write().remove(key).is_some()
    }

    /// Drop channels nobody listens to. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// Whether the hub has no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}
