//! DTC Session Handshake
//!
//! Brings a freshly connected stream to the `LoggedOn` state.
//!
//! # Handshake Flow
//!
//! 1. Send `EncodingRequest` for JSON
//! 2. Receive `EncodingResponse`; any other encoding is a reject
//! 3. Send `LogonRequest` with credentials and heartbeat interval
//! 4. Receive `LogonResponse`; result 1 (or 0) is success
//!
//! Heartbeats and log messages arriving during the handshake are tolerated.
//! Each phase has its own timeout; a timeout behaves like a reject.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use super::codec::{CodecError, JsonFrameCodec};
use super::messages::{
    EncodingKind, EncodingRequest, LogonRequest, LogonResponse, Message, PROTOCOL_VERSION,
};
use super::session::SessionState;

// =============================================================================
// Constants
// =============================================================================

/// Default time allowed for the encoding exchange.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for the logon exchange.
pub const DEFAULT_LOGON_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during the handshake.
#[derive(Debug, Error)]
pub enum LogonError {
    /// Server answered with a different encoding.
    #[error("encoding rejected: requested {requested:?}, server offered {offered:?}")]
    EncodingRejected {
        /// Encoding asked for.
        requested: EncodingKind,
        /// Encoding the server answered with.
        offered: EncodingKind,
    },

    /// Server refused the logon.
    #[error("logon rejected (result {code}): {reason}")]
    Rejected {
        /// Server result code.
        code: i32,
        /// Server result text.
        reason: String,
    },

    /// No encoding response in time.
    #[error("encoding negotiation timed out after {0:?}")]
    NegotiationTimeout(Duration),

    /// No logon response in time.
    #[error("logon timed out after {0:?}")]
    LogonTimeout(Duration),

    /// Server sent a logoff mid-handshake.
    #[error("server logged off during handshake: {0}")]
    ServerLogoff(String),

    /// Stream ended mid-handshake.
    #[error("connection closed during handshake")]
    Closed,

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[source] CodecError),
}

impl LogonError {
    /// Whether a later attempt could succeed without operator action.
    ///
    /// A rejected logon means bad credentials or a disabled account and is
    /// never retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// DTC server credentials.
///
/// Sierra Chart accepts empty credentials when server authentication is
/// disabled. The `Debug` implementation redacts the password.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Empty credentials.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Get the username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Get the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Handshake parameters.
#[derive(Debug, Clone)]
pub struct LogonConfig {
    /// Server credentials.
    pub credentials: Credentials,
    /// Client identification sent to the server.
    pub client_name: String,
    /// Heartbeat interval requested in the logon.
    pub heartbeat_interval: Duration,
    /// Time allowed for the encoding exchange.
    pub negotiation_timeout: Duration,
    /// Time allowed for the logon exchange.
    pub logon_timeout: Duration,
}

impl Default for LogonConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::anonymous(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            heartbeat_interval: Duration::from_secs(30),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            logon_timeout: DEFAULT_LOGON_TIMEOUT,
        }
    }
}

impl LogonConfig {
    /// Build the logon request.
    #[must_use]
    pub fn logon_request(&self) -> LogonRequest {
        LogonRequest {
            protocol_version: PROTOCOL_VERSION,
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            general_text_data: String::new(),
            heartbeat_interval_in_seconds: u32::try_from(self.heartbeat_interval.as_secs())
                .unwrap_or(u32::MAX),
            trade_mode: 0,
            client_name: self.client_name.clone(),
        }
    }
}

// =============================================================================
// Server Capabilities
// =============================================================================

/// Capabilities reported in the logon response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerCapabilities {
    /// Server identification.
    pub server_name: String,
    /// Live market data.
    pub market_data: bool,
    /// Historical bars.
    pub historical_price_data: bool,
    /// Security definitions.
    pub security_definitions: bool,
    /// Order entry.
    pub trading: bool,
    /// Market depth.
    pub market_depth: bool,
    /// Only one historical request per connection.
    pub one_historical_request_per_connection: bool,
}

impl From<&LogonResponse> for ServerCapabilities {
    fn from(response: &LogonResponse) -> Self {
        Self {
            server_name: response.server_name.clone(),
            market_data: response.market_data_supported,
            historical_price_data: response.historical_price_data_supported,
            security_definitions: response.security_definitions_supported,
            trading: response.trading_is_supported,
            market_depth: response.market_depth_is_supported,
            one_historical_request_per_connection: response
                .one_historical_price_data_request_per_connection,
        }
    }
}

impl ServerCapabilities {
    /// Log a warning for each capability this client relies on but the
    /// server does not advertise.
    pub fn warn_unsupported(&self) {
        if !self.market_data {
            tracing::warn!(server = %self.server_name, "Server does not advertise market data");
        }
        if !self.historical_price_data {
            tracing::warn!(server = %self.server_name, "Server does not advertise historical data");
        }
        if !self.security_definitions {
            tracing::debug!(server = %self.server_name, "Server does not advertise security definitions");
        }
    }
}

// =============================================================================
// Handshake
// =============================================================================

async fn next_message<S>(
    framed: &mut Framed<S, JsonFrameCodec>,
) -> Result<Message, LogonError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match framed.next().await {
            Some(Ok(Ok(message))) => return Ok(message),
            Some(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Dropping malformed frame during handshake");
            }
            Some(Err(e)) => return Err(LogonError::Transport(e)),
            None => return Err(LogonError::Closed),
        }
    }
}

async fn await_encoding<S>(
    framed: &mut Framed<S, JsonFrameCodec>,
    requested: EncodingKind,
) -> Result<(), LogonError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match next_message(framed).await? {
            Message::EncodingResponse(response) if response.encoding == requested => return Ok(()),
            Message::EncodingResponse(response) => {
                return Err(LogonError::EncodingRejected {
                    requested,
                    offered: response.encoding,
                });
            }
            Message::Logoff(logoff) => return Err(LogonError::ServerLogoff(logoff.reason)),
            Message::Heartbeat(_) => tracing::trace!("Heartbeat before encoding response"),
            other => tracing::debug!(
                type_code = other.type_code(),
                "Ignoring message before encoding response"
            ),
        }
    }
}

async fn await_logon<S>(framed: &mut Framed<S, JsonFrameCodec>) -> Result<LogonResponse, LogonError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match next_message(framed).await? {
            Message::LogonResponse(response) => return Ok(response),
            Message::Logoff(logoff) => return Err(LogonError::ServerLogoff(logoff.reason)),
            Message::GeneralLogMessage(log) => {
                tracing::info!(text = %log.message_text, "Server log message");
            }
            Message::Heartbeat(_) => tracing::trace!("Heartbeat before logon response"),
            other => tracing::debug!(
                type_code = other.type_code(),
                "Ignoring message before logon response"
            ),
        }
    }
}

/// Negotiate JSON encoding and log on.
///
/// Publishes `EncodingNegotiated` and `LoggedOn` on `state` as each phase
/// completes.
///
/// # Errors
///
/// Returns a [`LogonError`] if either phase is refused, times out, or the
/// stream fails.
pub async fn negotiate<S>(
    framed: &mut Framed<S, JsonFrameCodec>,
    config: &LogonConfig,
    state: &watch::Sender<SessionState>,
) -> Result<ServerCapabilities, LogonError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let requested = EncodingKind::Json;
    framed
        .send(Message::EncodingRequest(EncodingRequest::new(requested)))
        .await
        .map_err(LogonError::Transport)?;

    tokio::time::timeout(config.negotiation_timeout, await_encoding(framed, requested))
        .await
        .map_err(|_| LogonError::NegotiationTimeout(config.negotiation_timeout))??;
    state.send_replace(SessionState::EncodingNegotiated);
    tracing::debug!("Encoding negotiated");

    framed
        .send(Message::LogonRequest(config.logon_request()))
        .await
        .map_err(LogonError::Transport)?;

    let response = tokio::time::timeout(config.logon_timeout, await_logon(framed))
        .await
        .map_err(|_| LogonError::LogonTimeout(config.logon_timeout))??;

    if !response.is_success() {
        return Err(LogonError::Rejected {
            code: response.result,
            reason: response.result_text,
        });
    }

    state.send_replace(SessionState::LoggedOn);
    let capabilities = ServerCapabilities::from(&response);
    tracing::info!(
        server = %capabilities.server_name,
        market_data = capabilities.market_data,
        historical = capabilities.historical_price_data,
        "Logged on"
    );
    capabilities.warn_unsupported();
    Ok(capabilities)
}
