//! Configuration Module
//!
//! Configuration loading for the market data gateway.

mod settings;

pub use settings::{
    ConfigError, DtcSettings, GatewayConfig, ReconnectSettings, ServerSettings, TickFileSettings,
    parse_symbols,
};
