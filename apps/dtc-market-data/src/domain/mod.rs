//! Domain Layer - Market data types and per-session bookkeeping.
//!
//! Pure types with no I/O: time conversion, prices and bars, the
//! subscription book, and historical request tracking.

/// Prices, bars, snapshots and incremental updates.
pub mod market_data;

/// Historical range request tracking.
pub mod historical;

/// Per-session subscription book.
pub mod subscription;

/// Sierra Chart time representations.
pub mod time;
