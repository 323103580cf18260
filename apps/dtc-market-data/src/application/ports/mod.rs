//! Port Interfaces
//!
//! Contracts between the session machinery and the outside world,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Connector`]: opens the byte stream a DTC session runs over. The TCP
//!   adapter lives in `infrastructure::dtc::connector`; tests substitute
//!   in-memory duplex streams.
//!
//! ## Driving Ports (Inbound)
//!
//! - [`StatusProvider`]: point-in-time gateway status, read by the health
//!   endpoint.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::infrastructure::dtc::session::SessionState;

/// Socket-level failure. Always retryable.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Connecting failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Target address.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Connecting took too long.
    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout {
        /// Target address.
        addr: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// Peer closed the stream.
    #[error("connection closed by peer")]
    Closed,

    /// Read or write failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Byte stream a session can run over.
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased session stream.
pub type BoxedStream = Box<dyn SessionStream>;

/// Port for establishing the transport of a DTC session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh stream to the server.
    async fn connect(&self) -> Result<BoxedStream, ConnectionError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Connector handing out pre-built streams in order.
///
/// Once the queue is empty every attempt fails with [`ConnectionError::Closed`].
/// Used to script reconnect sequences without a network.
#[derive(Default)]
pub struct QueuedConnector {
    streams: Mutex<VecDeque<Result<BoxedStream, ConnectionError>>>,
}

impl QueuedConnector {
    /// Create an empty connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream for the next attempt.
    pub fn push_stream(&self, stream: impl SessionStream + 'static) {
        self.streams.lock().push_back(Ok(Box::new(stream)));
    }

    /// Queue a failure for the next attempt.
    pub fn push_error(&self, error: ConnectionError) {
        self.streams.lock().push_back(Err(error));
    }

    /// Attempts still queued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.streams.lock().len()
    }
}

#[async_trait]
impl Connector for QueuedConnector {
    async fn connect(&self) -> Result<BoxedStream, ConnectionError> {
        self.streams
            .lock()
            .pop_front()
            .unwrap_or(Err(ConnectionError::Closed))
    }

    fn describe(&self) -> String {
        "queued".to_string()
    }
}

/// Gateway status as reported to health checks.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// State of the protocol session.
    pub session_state: SessionState,
    /// Server name from the last logon.
    pub server_name: Option<String>,
    /// Reconnect attempts since the last logon.
    pub reconnect_attempts: u32,
    /// Successful logons after the first.
    pub reconnects: u64,
    /// Keys subscribed over the protocol.
    pub subscriptions: usize,
    /// Symbols served from tick files.
    pub tailers: usize,
    /// Whether the reconnect supervisor gave up.
    pub supervisor_stopped: bool,
    /// Last connection or session error.
    pub last_error: Option<String>,
}

/// Port exposing gateway status.
#[cfg_attr(test, mockall::automock)]
pub trait StatusProvider: Send + Sync {
    /// Current status.
    fn gateway_status(&self) -> GatewayStatus;
}
