//! Heartbeat Manager
//!
//! DTC keeps a session alive with `Heartbeat` messages in both directions.
//! The client sends one every interval; any inbound frame counts as
//! liveness. Silence for longer than 1.5x the interval marks the session
//! stale and ends it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Staleness threshold as a multiple of the heartbeat interval.
pub const STALE_FACTOR: f64 = 1.5;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between outbound heartbeats.
    pub interval: Duration,
    /// Inbound silence after which the session is stale.
    pub stale_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from_interval(Duration::from_secs(30))
    }
}

impl HeartbeatConfig {
    /// Create a configuration with custom values.
    #[must_use]
    pub const fn new(interval: Duration, stale_after: Duration) -> Self {
        Self {
            interval,
            stale_after,
        }
    }

    /// Derive the staleness threshold from the interval.
    #[must_use]
    pub fn from_interval(interval: Duration) -> Self {
        Self {
            interval,
            stale_after: interval.mul_f64(STALE_FACTOR),
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Time to send a heartbeat.
    SendHeartbeat,
    /// Nothing received for too long; the session should end.
    Stale {
        /// Silence observed.
        silent_for: Duration,
    },
}

/// Liveness timestamps shared between the session task and the manager.
#[derive(Debug)]
pub struct HeartbeatState {
    last_received: RwLock<Instant>,
    last_sent: RwLock<Option<Instant>>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_received: RwLock::new(Instant::now()),
            last_sent: RwLock::new(None),
        }
    }

    /// Record that a frame arrived.
    pub fn record_received(&self) {
        *self.last_received.write() = Instant::now();
    }

    /// Record that a heartbeat went out.
    pub fn record_sent(&self) {
        *self.last_sent.write() = Some(Instant::now());
    }

    /// Instant of the last inbound frame.
    #[must_use]
    pub fn last_received(&self) -> Instant {
        *self.last_received.read()
    }

    /// Instant of the last outbound heartbeat.
    #[must_use]
    pub fn last_sent(&self) -> Option<Instant> {
        *self.last_sent.read()
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn time_since_received(&self) -> Duration {
        self.last_received.read().elapsed()
    }

    /// Reset state for new connection.
    pub fn reset(&self) {
        *self.last_received.write() = Instant::now();
        *self.last_sent.write() = None;
    }
}

/// Heartbeat manager that monitors session liveness.
///
/// # Example
///
/// ```rust,no_run
/// use dtc_market_data::infrastructure::dtc::heartbeat::{
///     HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
/// };
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let config = HeartbeatConfig::from_interval(Duration::from_secs(30));
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(10);
///     let cancel = CancellationToken::new();
///
///     tokio::spawn(HeartbeatManager::new(config, state.clone(), event_tx, cancel).run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::SendHeartbeat => state.record_sent(),
///             HeartbeatEvent::Stale { .. } => break,
///         }
///     }
/// }
/// ```
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the heartbeat loop until cancelled or the session goes stale.
    pub async fn run(self) {
        let start = Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let deadline = self.state.last_received() + self.config.stale_after;

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.event_tx.send(HeartbeatEvent::SendHeartbeat).await.is_err() {
                        tracing::debug!("Event channel closed, stopping heartbeat");
                        break;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    let silent_for = self.state.time_since_received();
                    if silent_for >= self.config.stale_after {
                        tracing::warn!(
                            silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                            stale_after_ms = u64::try_from(self.config.stale_after.as_millis()).unwrap_or(u64::MAX),
                            "Heartbeat timeout detected"
                        );
                        let _ = self.event_tx.send(HeartbeatEvent::Stale { silent_for }).await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_threshold_is_one_and_a_half_intervals() {
        let config = HeartbeatConfig::from_interval(Duration::from_secs(30));
        assert_eq!(config.stale_after, Duration::from_secs(45));
        assert_eq!(HeartbeatConfig::default(), config);
    }

    #[tokio::test(start_paused = true)]
    async fn state_tracks_received_and_sent() {
        let state = HeartbeatState::new();
        assert!(state.last_sent().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(state.time_since_received(), Duration::from_secs(5));

        state.record_received();
        state.record_sent();
        assert_eq!(state.time_since_received(), Duration::ZERO);
        assert!(state.last_sent().is_some());

        state.reset();
        assert!(state.last_sent().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn manager_sends_heartbeat_each_interval() {
        let config = HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(100));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, state.clone(), event_tx, cancel.clone()).run(),
        );

        let started = Instant::now();
        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::SendHeartbeat));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::SendHeartbeat));
        assert_eq!(started.elapsed(), Duration::from_secs(20));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_threshold_is_stale() {
        let config = HeartbeatConfig::from_interval(Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle =
            tokio::spawn(HeartbeatManager::new(config, state, event_tx, cancel).run());

        let started = Instant::now();
        let mut stale = None;
        while let Some(event) = event_rx.recv().await {
            if let HeartbeatEvent::Stale { silent_for } = event {
                stale = Some(silent_for);
                break;
            }
        }

        assert_eq!(stale, Some(Duration::from_secs(15)));
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_traffic_postpones_staleness() {
        let config = HeartbeatConfig::from_interval(Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, state.clone(), event_tx, cancel.clone()).run(),
        );

        // Keep the session alive past several thresholds.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(8)).await;
            state.record_received();
        }
        while let Ok(event) = event_rx.try_recv() {
            assert_eq!(event, HeartbeatEvent::SendHeartbeat);
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn manager_cancellation() {
        let config = HeartbeatConfig::from_interval(Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, _event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(HeartbeatManager::new(config, state, event_tx, cancel.clone()).run());
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "manager should shut down on cancellation");
    }
}
