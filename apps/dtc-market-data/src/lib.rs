#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! DTC Market Data - Sierra Chart Market Data Access Layer
//!
//! Client for Sierra Chart's DTC protocol (JSON encoding) with a `.scid`
//! tick file tailer as a fallback price source.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core market data types
//!   - `time`: Sierra Chart timestamp conversions
//!   - `market_data`: Subscription keys, snapshots, price updates
//!   - `subscription`: Per-session subscription book, reject classification
//!   - `historical`: Historical request state
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Connector and status provider interfaces
//!   - `services`: Market data facade with tick file fallback
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `dtc`: Framing, session, subscriptions, historical, reconnect
//!   - `scid`: Tick file decoding and tailing
//!   - `hub`: Per-symbol broadcast channels
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! DTC server ──► SessionClient ──► ReconnectSupervisor ──┐
//!                                                        ├──► PriceHub ──► subscribers
//! <SYMBOL>.scid ──► LiveFileTailer ──────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::historical::HistoricalQuery;
pub use domain::market_data::{
    MarketSnapshot, PriceSource, PriceUpdate, PriceUpdateKind, SubscriptionKey, SymbolId,
    TickRecord,
};
pub use domain::subscription::{RejectCategory, SubscriptionRejection};
pub use domain::time::TimeEncoding;

// Application
pub use application::ports::{Connector, ConnectionError, GatewayStatus, StatusProvider};
pub use application::services::{MarketDataService, ServiceConfig, ServiceError};

// DTC client
pub use infrastructure::dtc::{
    Credentials, LogonConfig, ReconnectConfig, ReconnectSupervisor, SessionClient, SessionConfig,
    SessionError, SessionState, SupervisorEvent, SupervisorHandle, TcpConnector,
};

// Tick files
pub use infrastructure::scid::{
    LiveFileTailer, TailEvent, TailerConfig, TickFileDecoder, TickFileReader, TickFileSummary,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, GatewayConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Price hub
pub use infrastructure::hub::{HubConfig, PriceHub};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
