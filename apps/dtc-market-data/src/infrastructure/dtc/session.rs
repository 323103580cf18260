//! DTC Session Client
//!
//! One TCP session to a DTC server, from handshake to teardown.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ─► Connecting ─► EncodingNegotiated ─► LoggedOn ─► Active
//!       ▲              │                │                 │          │
//!       └──────────────┴────────────────┴─────────────────┴──────────┘
//!                  socket error, close, logoff or heartbeat timeout
//! ```
//!
//! # Tasks
//!
//! [`SessionClient::connect`] performs the handshake inline and then spawns
//! one session task owning the socket. The task:
//! - decodes inbound frames strictly in order and routes them through a
//!   [`HandlerTable`]
//! - writes every outbound message from a single mpsc queue
//! - sends heartbeats and ends the session when the peer goes silent
//!
//! When the task ends, every in-flight subscription, historical request and
//! security lookup resolves as cancelled, and a [`SessionEnd`] listing the
//! subscriptions that were active is published.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::{DEFAULT_MAX_FRAME_LEN, JsonFrameCodec};
use super::dispatch::HandlerTable;
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::historical::{HistoricalFetcher, HistoricalStream};
use super::logon::{LogonConfig, LogonError, ServerCapabilities, negotiate};
use super::market_data::{DEFAULT_UPDATE_CAPACITY, MarketDataManager, SubscriptionHandle};
use super::messages::{Logoff, Message, MessageType, SecurityDefinitionResponse};
use super::security::SecurityDefinitions;
use crate::application::ports::{BoxedStream, ConnectionError, Connector, SessionStream};
use crate::domain::historical::{HistoricalQuery, RequestId};
use crate::domain::market_data::{MarketSnapshot, SubscriptionKey, SymbolId};
use crate::domain::subscription::{BookStats, DEFAULT_PENDING_LIMIT};
use crate::domain::time::TimeEncoding;
use crate::infrastructure::metrics;

/// Default capacity of the outbound writer queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Reason text of the logoff sent on a client-initiated close.
pub const CLIENT_LOGOFF_REASON: &str = "Client disconnect";

/// Time allowed for the closing logoff and socket shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No socket.
    Disconnected,
    /// Socket open, handshake not started or in progress.
    Connecting,
    /// Server accepted the JSON encoding.
    EncodingNegotiated,
    /// Server accepted the logon.
    LoggedOn,
    /// Serving requests.
    Active,
}

impl SessionState {
    /// Label used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::EncodingNegotiated => "encoding_negotiated",
            Self::LoggedOn => "logged_on",
            Self::Active => "active",
        }
    }

    /// Position in the lifecycle, for the state gauge.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::EncodingNegotiated => 2,
            Self::LoggedOn => 3,
            Self::Active => 4,
        }
    }

    /// Whether requests are being served.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Settings of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Handshake settings.
    pub logon: LogonConfig,
    /// Heartbeat cadence and staleness threshold.
    pub heartbeat: HeartbeatConfig,
    /// Capacity of the outbound writer queue.
    pub outbound_capacity: usize,
    /// Capacity of each subscription's update channel.
    pub update_capacity: usize,
    /// Cap on updates buffered before a snapshot.
    pub pending_limit: usize,
    /// How protocol timestamps are decoded.
    pub time_encoding: TimeEncoding,
    /// Longest unterminated frame accepted.
    pub max_frame_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(LogonConfig::default())
    }
}

impl SessionConfig {
    /// Defaults around a handshake configuration; the heartbeat follows the
    /// interval requested at logon.
    #[must_use]
    pub fn new(logon: LogonConfig) -> Self {
        Self {
            heartbeat: HeartbeatConfig::from_interval(logon.heartbeat_interval),
            logon,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            update_capacity: DEFAULT_UPDATE_CAPACITY,
            pending_limit: DEFAULT_PENDING_LIMIT,
            time_encoding: TimeEncoding::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

// =============================================================================
// Errors & Outcomes
// =============================================================================

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport could not be opened.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Handshake failed.
    #[error(transparent)]
    Logon(#[from] LogonError),

    /// The session has ended.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Whether a fresh session could succeed without operator action.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Closed => true,
            Self::Logon(err) => err.is_retryable(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEndReason {
    /// [`SessionClient::close`] was called.
    ClosedByClient,
    /// The server closed the socket.
    PeerClosed,
    /// No inbound traffic within the staleness threshold.
    HeartbeatTimeout {
        /// Silence observed.
        silent_for: Duration,
    },
    /// The server sent a logoff.
    ServerLogoff {
        /// Server reason text.
        reason: String,
        /// Server asked us not to reconnect.
        do_not_reconnect: bool,
    },
    /// Read or write failed.
    Transport(String),
}

impl std::fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClosedByClient => f.write_str("closed by client"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::HeartbeatTimeout { silent_for } => {
                write!(f, "heartbeat timeout after {silent_for:?} of silence")
            }
            Self::ServerLogoff { reason, .. } => write!(f, "server logoff: {reason}"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

/// Final report of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    /// Why it ended.
    pub reason: SessionEndReason,
    /// Subscriptions that were active at teardown, ordered by symbol id.
    pub active: Vec<SubscriptionKey>,
}

// =============================================================================
// Request Ids
// =============================================================================

/// Per-session allocator of request ids, starting at 1.
#[derive(Debug, Clone)]
pub struct RequestIds(Arc<AtomicU32>);

impl Default for RequestIds {
    fn default() -> Self {
        Self(Arc::new(AtomicU32::new(1)))
    }
}

impl RequestIds {
    /// Allocate the next id. Zero is never handed out.
    #[must_use]
    pub fn next_id(&self) -> RequestId {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

// =============================================================================
// Client
// =============================================================================

#[derive(Debug)]
struct Shared {
    peer: String,
    capabilities: ServerCapabilities,
    market_data: Arc<MarketDataManager>,
    historical: Arc<HistoricalFetcher>,
    security: Arc<SecurityDefinitions>,
    state: watch::Receiver<SessionState>,
    end: watch::Receiver<Option<SessionEnd>>,
    cancel: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a live session. Clones share the session; dropping the last
/// clone closes it.
#[derive(Debug, Clone)]
pub struct SessionClient {
    shared: Arc<Shared>,
}

impl SessionClient {
    /// Open a transport through `connector` and log on.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connection`] if the transport cannot be opened
    /// and [`SessionError::Logon`] if the handshake fails.
    pub async fn connect(
        connector: &dyn Connector,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let peer = connector.describe();
        tracing::info!(peer = %peer, "Connecting to DTC server");
        let stream = connector.connect().await?;
        Self::connect_stream(stream, peer, config).await
    }

    /// Log on over an already open stream.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Logon`] if the handshake fails.
    pub async fn connect_stream<S>(
        stream: S,
        peer: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Self, SessionError>
    where
        S: SessionStream + 'static,
    {
        let peer = peer.into();
        let stream: BoxedStream = Box::new(stream);
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        metrics::set_session_state(SessionState::Connecting);

        let mut framed = Framed::new(stream, JsonFrameCodec::with_max_frame_len(config.max_frame_len));
        let capabilities = match negotiate(&mut framed, &config.logon, &state_tx).await {
            Ok(capabilities) => capabilities,
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "Handshake failed");
                state_tx.send_replace(SessionState::Disconnected);
                metrics::set_session_state(SessionState::Disconnected);
                return Err(err.into());
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let ids = RequestIds::default();
        let market_data = Arc::new(MarketDataManager::new(
            outbound_tx.clone(),
            config.time_encoding,
            config.update_capacity,
            config.pending_limit,
        ));
        let historical = Arc::new(HistoricalFetcher::new(
            outbound_tx.clone(),
            ids.clone(),
            config.time_encoding,
        ));
        let security = Arc::new(SecurityDefinitions::new(outbound_tx, ids));

        let mut handlers = HandlerTable::new();
        handlers.register(
            &[
                MessageType::MarketDataReject,
                MessageType::MarketDataSnapshot,
                MessageType::MarketDataUpdateTrade,
                MessageType::MarketDataUpdateBidAsk,
            ],
            market_data.clone(),
        );
        handlers.register(
            &[
                MessageType::HistoricalPriceDataResponseHeader,
                MessageType::HistoricalPriceDataReject,
                MessageType::HistoricalPriceDataRecordResponse,
                MessageType::HistoricalPriceDataFinal,
            ],
            historical.clone(),
        );
        handlers.register(&[MessageType::SecurityDefinitionResponse], security.clone());

        let (end_tx, end_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        state_tx.send_replace(SessionState::Active);
        metrics::set_session_state(SessionState::Active);
        tracing::info!(peer = %peer, server = %capabilities.server_name, "Session active");

        let task = SessionTask {
            peer: peer.clone(),
            framed,
            outbound: outbound_rx,
            handlers,
            heartbeat: config.heartbeat,
            market_data: market_data.clone(),
            state: state_tx,
            end: end_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Ok(Self {
            shared: Arc::new(Shared {
                peer,
                capabilities,
                market_data,
                historical,
                security,
                state: state_rx,
                end: end_rx,
                cancel,
            }),
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receiver of state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.clone()
    }

    /// What the server said it supports at logon.
    #[must_use]
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.shared.capabilities
    }

    /// Server this session talks to.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Subscribe to live market data for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has ended.
    pub async fn subscribe(&self, key: SubscriptionKey) -> Result<SubscriptionHandle, SessionError> {
        self.shared.market_data.subscribe(key).await
    }

    /// Unsubscribe a symbol id. Returns `false` if it was not tracked.
    pub async fn unsubscribe(&self, id: SymbolId) -> bool {
        self.shared.market_data.unsubscribe(id).await
    }

    /// Request a historical range.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has ended.
    pub async fn fetch_historical(
        &self,
        query: HistoricalQuery,
        timeout: Option<Duration>,
    ) -> Result<HistoricalStream, SessionError> {
        self.shared.historical.fetch(query, timeout).await
    }

    /// Look up the server's definition of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session ends first.
    pub async fn security_definition(
        &self,
        key: &SubscriptionKey,
    ) -> Result<SecurityDefinitionResponse, SessionError> {
        self.shared.security.lookup(key).await
    }

    /// Keys of every active subscription.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.shared.market_data.active_keys()
    }

    /// Last known state of a subscription.
    #[must_use]
    pub fn snapshot(&self, id: SymbolId) -> Option<MarketSnapshot> {
        self.shared.market_data.snapshot(id)
    }

    /// Subscription counts by state.
    #[must_use]
    pub fn subscription_stats(&self) -> BookStats {
        self.shared.market_data.stats()
    }

    /// Historical requests still streaming.
    #[must_use]
    pub fn historical_in_flight(&self) -> usize {
        self.shared.historical.in_flight()
    }

    /// Send a logoff and close the socket. Returns immediately; await
    /// [`SessionClient::closed`] for the outcome.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Whether the session has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.end.borrow().is_some()
    }

    /// Wait for the session to end.
    pub async fn closed(&self) -> SessionEnd {
        let mut end = self.shared.end.clone();
        if let Ok(value) = end.wait_for(Option::is_some).await
            && let Some(report) = &*value
        {
            return report.clone();
        }
        SessionEnd {
            reason: SessionEndReason::Transport("session task ended unexpectedly".to_string()),
            active: Vec::new(),
        }
    }
}

// =============================================================================
// Session Task
// =============================================================================

struct SessionTask {
    peer: String,
    framed: Framed<BoxedStream, JsonFrameCodec>,
    outbound: mpsc::Receiver<Message>,
    handlers: HandlerTable,
    heartbeat: HeartbeatConfig,
    market_data: Arc<MarketDataManager>,
    state: watch::Sender<SessionState>,
    end: watch::Sender<Option<SessionEnd>>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(self) {
        let Self {
            peer,
            framed,
            mut outbound,
            handlers,
            heartbeat,
            market_data,
            state,
            end,
            cancel,
        } = self;
        let (mut sink, mut frames) = framed.split();

        let liveness = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
        let heartbeat_cancel = cancel.child_token();
        tokio::spawn(
            HeartbeatManager::new(heartbeat, liveness.clone(), heartbeat_tx, heartbeat_cancel.clone())
                .run(),
        );

        let reason = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    let logoff = Message::Logoff(Logoff {
                        reason: CLIENT_LOGOFF_REASON.to_string(),
                        do_not_reconnect: false,
                    });
                    match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(logoff)).await {
                        Ok(Ok(())) => tracing::debug!(peer = %peer, "Logoff sent"),
                        Ok(Err(err)) => tracing::debug!(peer = %peer, error = %err, "Logoff not sent"),
                        Err(_) => tracing::debug!(peer = %peer, "Logoff send timed out"),
                    }
                    break SessionEndReason::ClosedByClient;
                }

                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::SendHeartbeat => {
                        if let Err(err) = sink.send(Message::heartbeat_now()).await {
                            break SessionEndReason::Transport(err.to_string());
                        }
                        liveness.record_sent();
                    }
                    HeartbeatEvent::Stale { silent_for } => {
                        break SessionEndReason::HeartbeatTimeout { silent_for };
                    }
                },

                Some(message) = outbound.recv() => {
                    let type_code = message.type_code();
                    if let Err(err) = sink.send(message).await {
                        tracing::warn!(peer = %peer, type_code, error = %err, "Write failed");
                        break SessionEndReason::Transport(err.to_string());
                    }
                }

                frame = frames.next() => match frame {
                    Some(Ok(Ok(message))) => {
                        liveness.record_received();
                        metrics::record_frame_decoded(message.type_code());
                        if let Some(reason) = route(&handlers, message) {
                            break reason;
                        }
                    }
                    Some(Ok(Err(err))) => {
                        liveness.record_received();
                        metrics::record_decode_error();
                        tracing::warn!(peer = %peer, error = %err, "Dropping malformed frame");
                    }
                    Some(Err(err)) => break SessionEndReason::Transport(err.to_string()),
                    None => break SessionEndReason::PeerClosed,
                },
            }
        };

        heartbeat_cancel.cancel();
        if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
            tracing::debug!(peer = %peer, "Socket shutdown timed out");
        }

        state.send_replace(SessionState::Disconnected);
        metrics::set_session_state(SessionState::Disconnected);
        let active = market_data.active_keys();
        handlers.close_all();
        cancel.cancel();

        match &reason {
            SessionEndReason::ClosedByClient => {
                tracing::info!(peer = %peer, active = active.len(), "Session closed");
            }
            other => {
                tracing::warn!(peer = %peer, reason = %other, active = active.len(), "Session ended");
            }
        }
        end.send_replace(Some(SessionEnd { reason, active }));
    }
}

/// Handle session-level messages; hand the rest to the table.
fn route(handlers: &HandlerTable, message: Message) -> Option<SessionEndReason> {
    match message {
        Message::Heartbeat(heartbeat) => {
            if heartbeat.num_dropped_messages > 0 {
                tracing::warn!(
                    dropped = heartbeat.num_dropped_messages,
                    "Server reports dropped messages"
                );
            }
            None
        }
        Message::Logoff(logoff) => {
            tracing::info!(
                reason = %logoff.reason,
                do_not_reconnect = logoff.do_not_reconnect,
                "Server logged off"
            );
            Some(SessionEndReason::ServerLogoff {
                reason: logoff.reason,
                do_not_reconnect: logoff.do_not_reconnect,
            })
        }
        Message::GeneralLogMessage(log) => {
            tracing::info!(text = %log.message_text, "Server log message");
            None
        }
        other => {
            if let Err(unhandled) = handlers.dispatch(other) {
                tracing::debug!(type_code = unhandled.type_code(), "Unhandled message");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::domain::historical::{CancelReason, HistoricalEvent};
    use crate::domain::subscription::RejectCategory;
    use crate::infrastructure::dtc::historical::HistoricalError;
    use crate::infrastructure::dtc::market_data::SubscriptionOutcome;
    use crate::infrastructure::dtc::messages::{
        EncodingKind, EncodingResponse, GeneralLogMessage, HistoricalPriceDataFinal,
        HistoricalPriceDataRecordResponse, LogonResponse, MarketDataReject, RequestAction,
    };
    use crate::infrastructure::dtc::test_server::{connected, logon_ok, pair, snapshot, trade};

    fn key(symbol: &str) -> SubscriptionKey {
        SubscriptionKey::new(symbol, "CME")
    }

    fn query() -> HistoricalQuery {
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).single().unwrap();
        HistoricalQuery::new(key("ESZ25"), 60, start, None)
    }

    #[test]
    fn request_ids_start_at_one_and_are_shared() {
        let ids = RequestIds::default();
        let clone = ids.clone();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(clone.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn state_ordinals_follow_lifecycle() {
        let states = [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::EncodingNegotiated,
            SessionState::LoggedOn,
            SessionState::Active,
        ];
        for (expected, state) in states.iter().enumerate() {
            assert_eq!(usize::from(state.ordinal()), expected);
        }
        assert!(SessionState::Active.is_active());
        assert!(!SessionState::LoggedOn.is_active());
    }

    #[tokio::test]
    async fn logs_on_and_becomes_active() {
        let (session, _server) = connected(SessionConfig::default()).await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.capabilities().server_name, "Test DTC Server");
        assert!(session.capabilities().market_data);
    }

    #[tokio::test]
    async fn rejected_logon_is_not_retryable() {
        let (client, mut server) = pair();
        let handshake = async {
            assert!(matches!(server.recv().await, Some(Message::EncodingRequest(_))));
            server
                .send(Message::EncodingResponse(EncodingResponse {
                    protocol_version: 8,
                    encoding: EncodingKind::Json,
                    protocol_type: "DTC".to_string(),
                }))
                .await;
            assert!(matches!(server.recv().await, Some(Message::LogonRequest(_))));
            server
                .send(Message::LogonResponse(LogonResponse {
                    result: 2,
                    result_text: "Invalid password".to_string(),
                    ..LogonResponse::default()
                }))
                .await;
        };

        let (result, ()) = tokio::join!(
            SessionClient::connect_stream(client, "test", SessionConfig::default()),
            handshake
        );

        let err = result.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Invalid password"));
    }

    #[tokio::test]
    async fn trade_before_snapshot_is_replayed_after_it() {
        let (session, mut server) = connected(SessionConfig::default()).await;
        let mut handle = session.subscribe(key("ESZ25")).await.unwrap();
        let request = server.expect_subscribe().await;
        assert_eq!(request.request_action, RequestAction::Subscribe);
        assert_eq!(request.symbol, "ESZ25");

        server.send(trade(request.symbol_id, 6001.25)).await;
        server.send(snapshot(request.symbol_id, 6000.0)).await;

        match handle.outcome().await {
            SubscriptionOutcome::Active(snapshot) => {
                assert_eq!(snapshot.last_price, Some(6000.0));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            session.snapshot(handle.id()).unwrap().last_price,
            Some(6001.25)
        );
        let first = handle.next_update().await.unwrap();
        let second = handle.next_update().await.unwrap();
        assert_eq!(first.last_price(), Some(6000.0));
        assert_eq!(second.last_price(), Some(6001.25));
    }

    #[tokio::test]
    async fn reject_affects_only_its_symbol() {
        let (session, mut server) = connected(SessionConfig::default()).await;
        let mut good = session.subscribe(key("ESZ25")).await.unwrap();
        let good_request = server.expect_subscribe().await;
        let mut bad = session.subscribe(key("XXXX")).await.unwrap();
        let bad_request = server.expect_subscribe().await;

        server
            .send(Message::MarketDataReject(MarketDataReject {
                symbol_id: bad_request.symbol_id,
                reject_text: "Symbol not found".to_string(),
            }))
            .await;
        server.send(snapshot(good_request.symbol_id, 6000.0)).await;

        match bad.outcome().await {
            SubscriptionOutcome::Rejected(rejection) => {
                assert_eq!(rejection.category, RejectCategory::UnknownSymbol);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(good.outcome().await, SubscriptionOutcome::Active(_)));
        assert_eq!(session.active_keys(), vec![key("ESZ25")]);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn interleaved_historical_fetches_are_correlated() {
        let (session, mut server) = connected(SessionConfig::default()).await;
        let first = session.fetch_historical(query(), None).await.unwrap();
        let second = session.fetch_historical(query(), None).await.unwrap();
        let a = server.expect_historical().await.request_id;
        let b = server.expect_historical().await.request_id;
        assert_ne!(a, b);

        for (id, close) in [(b, 2.0), (a, 1.0), (b, 4.0), (a, 3.0)] {
            server
                .send(Message::HistoricalPriceDataRecordResponse(
                    HistoricalPriceDataRecordResponse {
                        request_id: id,
                        start_date_time: 45_659.0,
                        last_price: close,
                        ..HistoricalPriceDataRecordResponse::default()
                    },
                ))
                .await;
        }
        server
            .send(Message::HistoricalPriceDataFinal(HistoricalPriceDataFinal { request_id: a }))
            .await;
        server
            .send(Message::HistoricalPriceDataFinal(HistoricalPriceDataFinal { request_id: b }))
            .await;

        let closes = |records: Vec<crate::domain::market_data::TickRecord>| {
            records.iter().map(|r| r.close).collect::<Vec<_>>()
        };
        assert_eq!(closes(first.collect_records().await.unwrap()), vec![1.0, 3.0]);
        assert_eq!(closes(second.collect_records().await.unwrap()), vec![2.0, 4.0]);
    }

    #[tokio::test]
    async fn peer_close_cancels_in_flight_requests() {
        let (session, mut server) = connected(SessionConfig::default()).await;
        let mut handle = session.subscribe(key("ESZ25")).await.unwrap();
        let active = session.subscribe(key("NQZ25")).await.unwrap();
        let _ = server.expect_subscribe().await;
        let nq = server.expect_subscribe().await;
        server.send(snapshot(nq.symbol_id, 21_000.0)).await;
        let mut stream = session.fetch_historical(query(), None).await.unwrap();
        let _ = server.expect_historical().await;

        drop(server);

        let end = session.closed().await;
        assert_eq!(end.reason, SessionEndReason::PeerClosed);
        assert_eq!(end.active, vec![key("NQZ25")]);
        assert_eq!(handle.outcome().await, SubscriptionOutcome::Cancelled);
        assert_eq!(
            stream.next().await,
            Some(HistoricalEvent::Cancelled(CancelReason::SessionClosed))
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            session.subscribe(key("ESZ25")).await,
            Err(SessionError::Closed)
        ));
        drop(active);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_without_state_change() {
        let (session, mut server) = connected(SessionConfig::default()).await;
        let mut handle = session.subscribe(key("ESZ25")).await.unwrap();
        let request = server.expect_subscribe().await;

        server.send_raw(b"{\"Type\":104,\"SymbolID\":\0not json at all\0").await;
        server.send(snapshot(request.symbol_id, 6000.0)).await;

        assert!(matches!(handle.outcome().await, SubscriptionOutcome::Active(_)));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn server_logoff_ends_session() {
        let (session, mut server) = connected(SessionConfig::default()).await;
        server
            .send(Message::GeneralLogMessage(GeneralLogMessage {
                message_text: "Shutting down".to_string(),
            }))
            .await;
        server
            .send(Message::Logoff(Logoff {
                reason: "Server maintenance".to_string(),
                do_not_reconnect: true,
            }))
            .await;

        let end = session.closed().await;
        assert_eq!(
            end.reason,
            SessionEndReason::ServerLogoff {
                reason: "Server maintenance".to_string(),
                do_not_reconnect: true,
            }
        );
    }

    #[tokio::test]
    async fn close_sends_client_logoff() {
        let (session, mut server) = connected(SessionConfig::default()).await;
        session.close();

        match server.recv().await {
            Some(Message::Logoff(logoff)) => assert_eq!(logoff.reason, CLIENT_LOGOFF_REASON),
            other => panic!("expected logoff, got {other:?}"),
        }
        assert_eq!(session.closed().await.reason, SessionEndReason::ClosedByClient);
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_goes_stale() {
        let mut config = SessionConfig::default();
        config.heartbeat = HeartbeatConfig::from_interval(Duration::from_secs(2));
        let (session, _server) = connected(config).await;

        let end = session.closed().await;
        assert_eq!(
            end.reason,
            SessionEndReason::HeartbeatTimeout {
                silent_for: Duration::from_secs(3)
            }
        );
    }

    #[tokio::test]
    async fn security_definition_round_trip() {
        let (session, mut server) = connected(SessionConfig::default()).await;
        let lookup = tokio::spawn({
            let session = session.clone();
            async move { session.security_definition(&key("ESZ25")).await }
        });

        let request = match server.recv().await {
            Some(Message::SecurityDefinitionForSymbolRequest(request)) => request,
            other => panic!("unexpected message: {other:?}"),
        };
        server
            .send(Message::SecurityDefinitionResponse(SecurityDefinitionResponse {
                request_id: request.request_id,
                symbol: "ESZ25".to_string(),
                description: "E-mini S&P 500 Dec 25".to_string(),
                ..SecurityDefinitionResponse::default()
            }))
            .await;

        let response = lookup.await.unwrap().unwrap();
        assert_eq!(response.description, "E-mini S&P 500 Dec 25");
    }

    #[tokio::test(start_paused = true)]
    async fn historical_timeout_is_cancelled() {
        let mut config = SessionConfig::default();
        config.heartbeat = HeartbeatConfig::from_interval(Duration::from_secs(600));
        let (session, mut server) = connected(config).await;
        let stream = session
            .fetch_historical(query(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let _ = server.expect_historical().await;

        assert_eq!(
            stream.collect_records().await,
            Err(HistoricalError::Cancelled(CancelReason::TimedOut))
        );
        assert_eq!(session.historical_in_flight(), 0);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn logon_ok_fixture_is_success() {
        match logon_ok() {
            Message::LogonResponse(response) => assert!(response.is_success()),
            other => panic!("unexpected fixture: {other:?}"),
        }
    }
}
