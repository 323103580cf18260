//! Reconnection
//!
//! [`ReconnectPolicy`] computes exponential backoff with jitter.
//! [`ReconnectSupervisor`] owns the session lifecycle: it connects, restores
//! subscriptions, forwards their updates into the [`PriceHub`], and starts
//! over when the session drops.
//!
//! # Restore Rules
//!
//! The supervisor keeps the set of keys callers want. After every logon it
//! re-issues, explicitly, each key that was active when the previous session
//! ended plus each key requested while disconnected or still awaiting a
//! snapshot. Nothing is carried over implicitly by the session itself.
//!
//! A rejected key leaves the set and is reported once through
//! [`SupervisorEvent::SubscriptionRejected`].
//!
//! # Stop Conditions
//!
//! - rejected logon (credentials never improve by retrying)
//! - server logoff with `DoNotReconnect` set
//! - the attempt budget runs out
//! - [`SupervisorHandle::shutdown`]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::logon::ServerCapabilities;
use super::market_data::{SubscriptionHandle, SubscriptionOutcome};
use super::session::{SessionClient, SessionConfig, SessionEnd, SessionEndReason, SessionState};
use crate::application::ports::Connector;
use crate::domain::market_data::{PriceUpdate, SubscriptionKey, SymbolId};
use crate::domain::subscription::SubscriptionRejection;
use crate::infrastructure::config::ReconnectSettings;
use crate::infrastructure::hub::PriceHub;
use crate::infrastructure::metrics;

/// Capacity of the supervisor event channel.
const EVENT_CAPACITY: usize = 256;

/// Time allowed for a graceful logoff at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

// =============================================================================
// Policy
// =============================================================================

/// `Stopped` reason when the supervisor was shut down on request.
pub const SHUTDOWN_REASON: &str = "shutdown";

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Retries allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Create a configuration with custom values.
    #[must_use]
    pub const fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_factor,
            max_attempts,
        }
    }

    /// Create configuration from environment settings.
    #[must_use]
    pub const fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.initial_delay,
            max_delay: settings.max_delay,
            multiplier: settings.multiplier,
            jitter_factor: settings.jitter,
            max_attempts: settings.max_attempts,
        }
    }
}

/// Exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use dtc_market_data::infrastructure::dtc::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// assert!(policy.next_delay().is_some());
///
/// // Logged on again
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt; `None` once the budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay)
    }

    /// Reset after a successful logon.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = adjusted_millis as u64;
        Duration::from_millis(adjusted)
    }
}

// =============================================================================
// Errors, Events & Status
// =============================================================================

/// Why the supervisor stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// Server refused the credentials.
    #[error("logon rejected: {0}")]
    LogonRejected(String),

    /// Retry budget exhausted.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),

    /// Server logged off and asked not to come back.
    #[error("server requested no reconnect: {0}")]
    ServerRequestedNoReconnect(String),

    /// The supervisor task is gone.
    #[error("supervisor stopped")]
    Stopped,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Logged on.
    Connected {
        /// Server identification from the logon response.
        server_name: String,
    },
    /// Session ended.
    Disconnected {
        /// Why it ended.
        reason: String,
    },
    /// Waiting before the next attempt.
    Reconnecting {
        /// Attempt number since the last logon.
        attempt: u32,
        /// Backoff delay.
        delay: Duration,
    },
    /// Server refused a subscription; it will not be retried.
    SubscriptionRejected {
        /// Refused key.
        key: SubscriptionKey,
        /// Server verdict.
        rejection: SubscriptionRejection,
    },
    /// Supervisor stopped for good.
    Stopped {
        /// Why.
        reason: String,
    },
}

/// Snapshot of supervisor progress, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    /// State of the current session.
    pub state: SessionState,
    /// Attempts since the last logon.
    pub attempts: u32,
    /// Successful logons after the first.
    pub reconnects: u64,
    /// Keys callers currently want.
    pub subscriptions: usize,
    /// Capabilities of the current or last server.
    pub capabilities: Option<ServerCapabilities>,
    /// Last connection or session error.
    pub last_error: Option<String>,
    /// Whether the supervisor has stopped.
    pub stopped: bool,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            attempts: 0,
            reconnects: 0,
            subscriptions: 0,
            capabilities: None,
            last_error: None,
            stopped: false,
        }
    }
}

#[derive(Debug)]
enum Command {
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
}

#[derive(Debug)]
enum Report {
    Rejected {
        key: SubscriptionKey,
        rejection: SubscriptionRejection,
    },
}

enum Served {
    Shutdown,
    Ended(SessionEnd),
}

// =============================================================================
// Handle
// =============================================================================

/// Caller side of a running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    hub: Arc<PriceHub>,
    events: broadcast::Sender<SupervisorEvent>,
    status: watch::Receiver<SupervisorStatus>,
    session: Arc<RwLock<Option<SessionClient>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), ReconnectError>>>>,
}

impl SupervisorHandle {
    /// Subscribe to `key`. The receiver keeps working across reconnects.
    #[must_use]
    pub fn subscribe(&self, key: SubscriptionKey) -> broadcast::Receiver<PriceUpdate> {
        let rx = self.hub.subscribe(&key);
        if self.commands.send(Command::Subscribe(key)).is_err() {
            tracing::debug!("Supervisor stopped; subscription not forwarded");
        }
        rx
    }

    /// Stop wanting `key` and unsubscribe it from the live session.
    pub fn unsubscribe(&self, key: SubscriptionKey) {
        let _ = self.commands.send(Command::Unsubscribe(key));
    }

    /// Receiver of lifecycle events from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// Receiver of status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    /// The live session, if logged on.
    #[must_use]
    pub fn session(&self) -> Option<SessionClient> {
        self.session.read().clone()
    }

    /// Hub the supervisor publishes into.
    #[must_use]
    pub fn hub(&self) -> &Arc<PriceHub> {
        &self.hub
    }

    /// Wait for the supervisor to stop on its own.
    ///
    /// # Errors
    ///
    /// Returns the [`ReconnectError`] that stopped it, or
    /// [`ReconnectError::Stopped`] if already joined.
    pub async fn join(&self) -> Result<(), ReconnectError> {
        let task = self.task.lock().take();
        match task {
            Some(task) => task.await.unwrap_or(Err(ReconnectError::Stopped)),
            None => Err(ReconnectError::Stopped),
        }
    }

    /// Log off and stop.
    ///
    /// # Errors
    ///
    /// Same as [`SupervisorHandle::join`].
    pub async fn shutdown(&self) -> Result<(), ReconnectError> {
        self.cancel.cancel();
        self.join().await
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct Forwarder {
    id: SymbolId,
    task: JoinHandle<()>,
}

/// Drives sessions until told to stop.
pub struct ReconnectSupervisor {
    connector: Arc<dyn Connector>,
    session_config: SessionConfig,
    reconnect: ReconnectConfig,
    hub: Arc<PriceHub>,
    events: broadcast::Sender<SupervisorEvent>,
    cancel: CancellationToken,
}

impl ReconnectSupervisor {
    /// Create a supervisor. Nothing happens until [`ReconnectSupervisor::spawn`].
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        session_config: SessionConfig,
        reconnect: ReconnectConfig,
        hub: Arc<PriceHub>,
    ) -> Self {
        Self {
            connector,
            session_config,
            reconnect,
            hub,
            events: broadcast::channel(EVENT_CAPACITY).0,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop when `parent` is cancelled too.
    #[must_use]
    pub fn with_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Receiver of events, including those emitted right after spawning.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Start the supervisor task, subscribing to `initial` keys.
    #[must_use]
    pub fn spawn(self, initial: impl IntoIterator<Item = SubscriptionKey>) -> SupervisorHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());
        let session = Arc::new(RwLock::new(None));

        let wanted: BTreeSet<SubscriptionKey> = initial.into_iter().collect();
        let handle = SupervisorHandle {
            commands: commands_tx,
            hub: self.hub.clone(),
            events: self.events.clone(),
            status: status_rx,
            session: session.clone(),
            cancel: self.cancel.clone(),
            task: Mutex::new(None),
        };

        let task = SupervisorTask {
            connector: self.connector,
            session_config: self.session_config,
            reconnect: self.reconnect,
            hub: self.hub,
            events: self.events,
            cancel: self.cancel,
            commands: commands_rx,
            status: status_tx,
            session,
            wanted,
            logons: 0,
        };
        *handle.task.lock() = Some(tokio::spawn(task.run()));
        handle
    }
}

struct SupervisorTask {
    connector: Arc<dyn Connector>,
    session_config: SessionConfig,
    reconnect: ReconnectConfig,
    hub: Arc<PriceHub>,
    events: broadcast::Sender<SupervisorEvent>,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<SupervisorStatus>,
    session: Arc<RwLock<Option<SessionClient>>>,
    wanted: BTreeSet<SubscriptionKey>,
    logons: u64,
}

impl SupervisorTask {
    async fn run(mut self) -> Result<(), ReconnectError> {
        let mut policy = ReconnectPolicy::new(self.reconnect.clone());
        let target = self.connector.describe();

        loop {
            self.apply_pending_commands();
            self.status.send_modify(|s| s.state = SessionState::Connecting);

            let connect = SessionClient::connect(self.connector.as_ref(), self.session_config.clone());
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(self.stop(SHUTDOWN_REASON)),
                result = connect => result,
            };

            match result {
                Ok(session) => {
                    policy.reset();
                    self.on_connected(&session);

                    let served = self.serve(&session).await;
                    *self.session.write() = None;

                    match served {
                        Served::Shutdown => {
                            session.close();
                            let _ = tokio::time::timeout(SHUTDOWN_GRACE, session.closed()).await;
                            return Ok(self.stop(SHUTDOWN_REASON));
                        }
                        Served::Ended(end) => {
                            if let Some(err) = self.on_session_end(&end) {
                                self.stop(&err.to_string());
                                return Err(err);
                            }
                        }
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    self.status.send_modify(|s| {
                        s.state = SessionState::Disconnected;
                        s.last_error = Some(message.clone());
                    });
                    if !err.is_retryable() {
                        tracing::error!(target = %target, error = %err, "Logon rejected, not retrying");
                        let err = ReconnectError::LogonRejected(message);
                        self.stop(&err.to_string());
                        return Err(err);
                    }
                    tracing::warn!(target = %target, error = %err, "Connection attempt failed");
                }
            }

            let Some(delay) = policy.next_delay() else {
                let err = ReconnectError::MaxAttemptsExceeded(self.reconnect.max_attempts);
                self.stop(&err.to_string());
                return Err(err);
            };
            let attempt = policy.attempt_count();
            metrics::record_reconnect();
            self.status.send_modify(|s| s.attempts = attempt);
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to DTC server"
            );
            self.emit(SupervisorEvent::Reconnecting { attempt, delay });

            tokio::select! {
                () = self.cancel.cancelled() => return Ok(self.stop(SHUTDOWN_REASON)),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn on_connected(&mut self, session: &SessionClient) {
        self.logons += 1;
        let reconnects = self.logons.saturating_sub(1);
        let capabilities = session.capabilities().clone();
        let server_name = capabilities.server_name.clone();
        let wanted = self.wanted.len();
        *self.session.write() = Some(session.clone());
        self.status.send_modify(|s| {
            s.state = SessionState::Active;
            s.attempts = 0;
            s.reconnects = reconnects;
            s.subscriptions = wanted;
            s.capabilities = Some(capabilities);
            s.last_error = None;
        });
        self.emit(SupervisorEvent::Connected { server_name });
    }

    /// Record the end of a session; returns an error when it must not be
    /// followed by another attempt.
    fn on_session_end(&mut self, end: &SessionEnd) -> Option<ReconnectError> {
        let reason = end.reason.to_string();
        tracing::warn!(
            reason = %reason,
            active = end.active.len(),
            "DTC session dropped"
        );
        self.status.send_modify(|s| {
            s.state = SessionState::Disconnected;
            s.last_error = Some(reason.clone());
        });
        self.emit(SupervisorEvent::Disconnected {
            reason: reason.clone(),
        });

        for key in &end.active {
            if self.wanted.insert(key.clone()) {
                tracing::debug!(symbol = %key, "Restoring subscription missing from wanted set");
            }
        }

        match &end.reason {
            SessionEndReason::ServerLogoff {
                reason,
                do_not_reconnect: true,
            } => Some(ReconnectError::ServerRequestedNoReconnect(reason.clone())),
            _ => None,
        }
    }

    async fn serve(&mut self, session: &SessionClient) -> Served {
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        let mut forwarders: HashMap<SubscriptionKey, Forwarder> = HashMap::new();

        let restore: Vec<SubscriptionKey> = self.wanted.iter().cloned().collect();
        if !restore.is_empty() {
            tracing::info!(subscriptions = restore.len(), "Issuing subscriptions");
        }
        for key in restore {
            self.start_forwarder(session, key, &mut forwarders, &reports_tx)
                .await;
        }

        let served = loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break Served::Shutdown,

                end = session.closed() => break Served::Ended(end),

                Some(command) = self.commands.recv() => match command {
                    Command::Subscribe(key) => {
                        if self.wanted.insert(key.clone()) {
                            self.start_forwarder(session, key, &mut forwarders, &reports_tx).await;
                        }
                    }
                    Command::Unsubscribe(key) => {
                        self.wanted.remove(&key);
                        if let Some(forwarder) = forwarders.remove(&key) {
                            forwarder.task.abort();
                            session.unsubscribe(forwarder.id).await;
                        }
                    }
                },

                Some(report) = reports_rx.recv() => match report {
                    Report::Rejected { key, rejection } => {
                        self.wanted.remove(&key);
                        forwarders.remove(&key);
                        self.emit(SupervisorEvent::SubscriptionRejected { key, rejection });
                    }
                },
            }
            let wanted = self.wanted.len();
            self.status.send_if_modified(|s| {
                let changed = s.subscriptions != wanted;
                s.subscriptions = wanted;
                changed
            });
        };

        for (_, forwarder) in forwarders {
            forwarder.task.abort();
        }
        served
    }

    async fn start_forwarder(
        &self,
        session: &SessionClient,
        key: SubscriptionKey,
        forwarders: &mut HashMap<SubscriptionKey, Forwarder>,
        reports: &mpsc::UnboundedSender<Report>,
    ) {
        match session.subscribe(key.clone()).await {
            Ok(handle) => {
                let id = handle.id();
                let task = tokio::spawn(forward(handle, self.hub.clone(), reports.clone()));
                forwarders.insert(key, Forwarder { id, task });
            }
            Err(err) => {
                tracing::debug!(symbol = %key, error = %err, "Subscribe deferred to next session");
            }
        }
    }

    fn apply_pending_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Subscribe(key) => {
                    self.wanted.insert(key);
                }
                Command::Unsubscribe(key) => {
                    self.wanted.remove(&key);
                }
            }
        }
        let wanted = self.wanted.len();
        self.status.send_modify(|s| s.subscriptions = wanted);
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    fn stop(&self, reason: &str) {
        tracing::info!(reason, "Reconnect supervisor stopped");
        self.status.send_modify(|s| {
            s.state = SessionState::Disconnected;
            s.stopped = true;
        });
        self.emit(SupervisorEvent::Stopped {
            reason: reason.to_string(),
        });
    }
}

/// Await the verdict, then copy updates into the hub until the
/// subscription goes away.
async fn forward(
    mut handle: SubscriptionHandle,
    hub: Arc<PriceHub>,
    reports: mpsc::UnboundedSender<Report>,
) {
    match handle.outcome().await {
        SubscriptionOutcome::Active(_) => {}
        SubscriptionOutcome::Rejected(rejection) => {
            let _ = reports.send(Report::Rejected {
                key: handle.key().clone(),
                rejection,
            });
            return;
        }
        SubscriptionOutcome::Cancelled => return,
    }
    while let Some(update) = handle.next_update().await {
        let _ = hub.publish(update);
    }
}
