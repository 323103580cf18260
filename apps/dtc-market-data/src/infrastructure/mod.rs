//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// DTC protocol client (framing, session, subscriptions, reconnect).
pub mod dtc;

/// Sierra Chart `.scid` tick file decoding and tailing.
pub mod scid;

/// Per-symbol broadcast channels for price updates.
pub mod hub;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
