//! Subscription Tracking
//!
//! Per-session book of market data subscriptions keyed by symbol id.
//!
//! # Design
//!
//! The book tracks, for every symbol id issued in a session:
//! - The subscription state (`Requested` until the first snapshot)
//! - The last known snapshot, mutated in place by incremental updates
//! - Updates that arrived before the snapshot, replayed once it lands
//!
//! The server has been observed to push trades for a fresh subscription
//! ahead of its snapshot, so those updates are buffered rather than dropped.
//! The book is plain data; locking and delivery live in the session layer.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::market_data::{MarketDelta, MarketSnapshot, SubscriptionKey, SymbolId};

/// Default cap on updates buffered before a snapshot.
pub const DEFAULT_PENDING_LIMIT: usize = 1024;

// =============================================================================
// State
// =============================================================================

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Subscribe sent, no snapshot yet.
    Requested,
    /// Snapshot received; updates flow.
    Active,
    /// Server refused the subscription.
    Rejected,
    /// Caller unsubscribed or the session tore it down.
    Unsubscribed,
}

impl SubscriptionState {
    /// Label used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Rejected => "rejected",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

// =============================================================================
// Rejections
// =============================================================================

/// Broad reason a subscription was refused.
///
/// Servers frequently reject market data with an empty or generic reason even
/// after a successful logon. Those land in [`RejectCategory::Entitlement`]:
/// the account is most likely not entitled to live data for the symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCategory {
    /// Not authorized for live data, or no usable reason given.
    Entitlement,
    /// Symbol unknown to the server.
    UnknownSymbol,
    /// Anything else.
    Other,
}

impl RejectCategory {
    /// Classify server reject text.
    #[must_use]
    pub fn classify(text: &str) -> Self {
        const ENTITLEMENT: [&str; 7] = [
            "not authorized",
            "unauthorized",
            "entitle",
            "permission",
            "not enabled",
            "not allowed",
            "not available for this account",
        ];

        let lower = text.trim().to_lowercase();
        if lower.is_empty() || lower == "rejected" || lower == "error" || lower == "unknown error" {
            return Self::Entitlement;
        }

        if ENTITLEMENT.iter().any(|needle| lower.contains(needle)) {
            return Self::Entitlement;
        }

        let mentions_symbol = lower.contains("symbol");
        let not_found = ["not found", "unknown", "invalid", "does not exist"]
            .iter()
            .any(|needle| lower.contains(needle));
        if mentions_symbol && not_found {
            return Self::UnknownSymbol;
        }

        Self::Other
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entitlement => "entitlement",
            Self::UnknownSymbol => "unknown_symbol",
            Self::Other => "other",
        }
    }
}

/// A refused subscription, as surfaced to the caller that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRejection {
    /// Classified reason.
    pub category: RejectCategory,
    /// Raw server text.
    pub text: String,
}

impl SubscriptionRejection {
    /// Build a rejection from raw server text.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            category: RejectCategory::classify(&text),
            text,
        }
    }
}

impl fmt::Display for SubscriptionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            write!(f, "{} (no reason given)", self.category.as_str())
        } else {
            write!(f, "{}: {}", self.category.as_str(), self.text)
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// One symbol subscription within a session.
#[derive(Debug, Clone)]
pub struct SymbolSubscription {
    id: SymbolId,
    key: SubscriptionKey,
    state: SubscriptionState,
    snapshot: MarketSnapshot,
    pending: VecDeque<MarketDelta>,
    rejection: Option<SubscriptionRejection>,
}

impl SymbolSubscription {
    fn new(id: SymbolId, key: SubscriptionKey) -> Self {
        Self {
            id,
            key,
            state: SubscriptionState::Requested,
            snapshot: MarketSnapshot::default(),
            pending: VecDeque::new(),
            rejection: None,
        }
    }

    /// Symbol id assigned by the book.
    #[must_use]
    pub const fn id(&self) -> SymbolId {
        self.id
    }

    /// Symbol and exchange.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Last known market state.
    #[must_use]
    pub const fn snapshot(&self) -> &MarketSnapshot {
        &self.snapshot
    }

    /// Number of updates waiting for the snapshot.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Rejection details when `state` is `Rejected`.
    #[must_use]
    pub const fn rejection(&self) -> Option<&SubscriptionRejection> {
        self.rejection.as_ref()
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of applying a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotApplied {
    /// Snapshot state before any replay.
    pub snapshot: MarketSnapshot,
    /// Buffered updates replayed on top of the snapshot, in arrival order.
    pub replayed: Vec<MarketDelta>,
    /// Whether this snapshot activated the subscription.
    pub activated: bool,
}

/// What happened to an incremental update.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    /// Applied to an active subscription; emit it.
    Applied(MarketDelta),
    /// Held until the snapshot arrives.
    Buffered {
        /// An older buffered update was discarded to make room.
        overflowed: bool,
    },
    /// Unknown id, or the subscription no longer accepts updates.
    Ignored,
}

/// Counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BookStats {
    /// Awaiting snapshot.
    pub requested: usize,
    /// Streaming.
    pub active: usize,
    /// Refused by the server.
    pub rejected: usize,
}

impl BookStats {
    /// Total tracked subscriptions.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.requested + self.active + self.rejected
    }
}

// =============================================================================
// Book
// =============================================================================

/// Subscriptions for one session.
///
/// # Example
///
/// ```rust
/// use dtc_market_data::domain::market_data::{MarketSnapshot, SubscriptionKey};
/// use dtc_market_data::domain::subscription::{SubscriptionBook, SubscriptionState};
///
/// let mut book = SubscriptionBook::default();
/// let id = book.open(SubscriptionKey::new("ESZ25", "CME"));
/// assert_eq!(book.get(id).unwrap().state(), SubscriptionState::Requested);
///
/// book.apply_snapshot(id, MarketSnapshot::default());
/// assert_eq!(book.get(id).unwrap().state(), SubscriptionState::Active);
/// ```
#[derive(Debug)]
pub struct SubscriptionBook {
    entries: HashMap<SymbolId, SymbolSubscription>,
    next_id: SymbolId,
    pending_limit: usize,
}

impl Default for SubscriptionBook {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_LIMIT)
    }
}

impl SubscriptionBook {
    /// Create a book capping pre-snapshot buffers at `pending_limit` updates.
    #[must_use]
    pub fn new(pending_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            pending_limit: pending_limit.max(1),
        }
    }

    /// Start tracking a subscription under a fresh symbol id.
    pub fn open(&mut self, key: SubscriptionKey) -> SymbolId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.entries.insert(id, SymbolSubscription::new(id, key));
        id
    }

    /// Apply a snapshot, activating the subscription and draining its buffer.
    ///
    /// Returns `None` for unknown or rejected ids.
    pub fn apply_snapshot(
        &mut self,
        id: SymbolId,
        snapshot: MarketSnapshot,
    ) -> Option<SnapshotApplied> {
        let entry = self.entries.get_mut(&id)?;
        let activated = match entry.state {
            SubscriptionState::Requested => true,
            SubscriptionState::Active => false,
            SubscriptionState::Rejected | SubscriptionState::Unsubscribed => return None,
        };

        entry.state = SubscriptionState::Active;
        entry.snapshot = snapshot.clone();
        let replayed: Vec<MarketDelta> = entry.pending.drain(..).collect();
        for delta in &replayed {
            entry.snapshot.apply(delta);
        }

        Some(SnapshotApplied {
            snapshot,
            replayed,
            activated,
        })
    }

    /// Apply or buffer an incremental update.
    pub fn apply_delta(&mut self, id: SymbolId, delta: MarketDelta) -> DeltaOutcome {
        let Some(entry) = self.entries.get_mut(&id) else {
            return DeltaOutcome::Ignored;
        };

        match entry.state {
            SubscriptionState::Active => {
                entry.snapshot.apply(&delta);
                DeltaOutcome::Applied(delta)
            }
            SubscriptionState::Requested => {
                let overflowed = entry.pending.len() >= self.pending_limit;
                if overflowed {
                    entry.pending.pop_front();
                }
                entry.pending.push_back(delta);
                DeltaOutcome::Buffered { overflowed }
            }
            SubscriptionState::Rejected | SubscriptionState::Unsubscribed => DeltaOutcome::Ignored,
        }
    }

    /// Mark a subscription rejected and discard anything it buffered.
    ///
    /// Returns `None` for unknown ids or ids already rejected.
    pub fn reject(&mut self, id: SymbolId, text: &str) -> Option<SubscriptionRejection> {
        let entry = self.entries.get_mut(&id)?;
        if entry.state == SubscriptionState::Rejected {
            return None;
        }
        let rejection = SubscriptionRejection::from_text(text);
        entry.state = SubscriptionState::Rejected;
        entry.pending.clear();
        entry.rejection = Some(rejection.clone());
        Some(rejection)
    }

    /// Stop tracking a subscription.
    pub fn remove(&mut self, id: SymbolId) -> Option<SymbolSubscription> {
        self.entries.remove(&id).map(|mut entry| {
            entry.state = SubscriptionState::Unsubscribed;
            entry
        })
    }

    /// Remove every subscription, as on session teardown.
    pub fn drain(&mut self) -> Vec<SymbolSubscription> {
        let mut drained: Vec<SymbolSubscription> = self
            .entries
            .drain()
            .map(|(_, mut entry)| {
                entry.state = SubscriptionState::Unsubscribed;
                entry
            })
            .collect();
        drained.sort_by_key(SymbolSubscription::id);
        drained
    }

    /// Look up a subscription.
    #[must_use]
    pub fn get(&self, id: SymbolId) -> Option<&SymbolSubscription> {
        self.entries.get(&id)
    }

    /// Find the live (not rejected) id for a key.
    #[must_use]
    pub fn find(&self, key: &SubscriptionKey) -> Option<SymbolId> {
        self.entries
            .values()
            .filter(|entry| entry.state != SubscriptionState::Rejected && &entry.key == key)
            .map(SymbolSubscription::id)
            .min()
    }

    /// Keys of every active subscription, ordered by id.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        let mut active: Vec<&SymbolSubscription> = self
            .entries
            .values()
            .filter(|entry| entry.state == SubscriptionState::Active)
            .collect();
        active.sort_by_key(|entry| entry.id);
        active.into_iter().map(|entry| entry.key.clone()).collect()
    }

    /// Number of tracked subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counts by state.
    #[must_use]
    pub fn stats(&self) -> BookStats {
        self.entries
            .values()
            .fold(BookStats::default(), |mut stats, entry| {
                match entry.state {
                    SubscriptionState::Requested => stats.requested += 1,
                    SubscriptionState::Active => stats.active += 1,
                    SubscriptionState::Rejected => stats.rejected += 1,
                    SubscriptionState::Unsubscribed => {}
                }
                stats
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
