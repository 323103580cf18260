//! DTC Protocol Client
//!
//! Client side of Sierra Chart's Data and Trading Communications protocol,
//! JSON encoding:
//!
//! - **Framing**: NUL-terminated JSON objects (`codec`)
//! - **Session**: encoding negotiation, logon, heartbeats, one reader task
//!   routing messages through a handler table (`session`, `dispatch`)
//! - **Market data**: snapshot-then-delta subscriptions keyed by symbol id
//! - **Historical**: bar requests correlated by request id
//! - **Reconnect**: backoff, explicit re-subscription, hub forwarding

pub mod codec;
pub mod connector;
pub mod dispatch;
pub mod heartbeat;
pub mod historical;
pub mod logon;
pub mod market_data;
pub mod messages;
pub mod reconnect;
pub mod security;
pub mod session;

#[cfg(test)]
pub(crate) mod test_server;

pub use codec::{BinaryFrameCodec, CodecError, JsonFrameCodec};
pub use connector::TcpConnector;
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use historical::{HistoricalError, HistoricalFetcher, HistoricalStream};
pub use logon::{Credentials, LogonConfig, LogonError, ServerCapabilities};
pub use market_data::{MarketDataManager, SubscriptionHandle, SubscriptionOutcome};
pub use messages::Message;
pub use reconnect::{
    ReconnectConfig, ReconnectError, ReconnectPolicy, ReconnectSupervisor, SupervisorEvent,
    SupervisorHandle, SupervisorStatus,
};
pub use session::{
    SessionClient, SessionConfig, SessionEnd, SessionEndReason, SessionError, SessionState,
};
