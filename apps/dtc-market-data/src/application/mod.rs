//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (transport, health status).
pub mod ports;

/// Market data facade with tick file fallback.
pub mod services;
