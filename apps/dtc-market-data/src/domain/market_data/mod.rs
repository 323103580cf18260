//! Market Data Types
//!
//! Canonical internal representation of prices coming out of either
//! source: the DTC session (snapshots and incremental updates) or a tailed
//! tick file (bars). These types are codec-agnostic.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::subscription::SubscriptionRejection;

/// Per-session identifier correlating market data messages with a subscription.
pub type SymbolId = u32;

// =============================================================================
// Subscription Key
// =============================================================================

/// Symbol plus exchange, the identity of a price stream across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Symbol as the server knows it, e.g. `ESZ25-CME`.
    pub symbol: String,
    /// Exchange, empty when the symbol already implies it.
    pub exchange: String,
}

impl SubscriptionKey {
    /// Create a key from a symbol and exchange.
    #[must_use]
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange: exchange.into(),
        }
    }

    /// Parse `SYMBOL` or `SYMBOL@EXCHANGE`.
    ///
    /// Returns `None` for an empty symbol.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (symbol, exchange) = s.trim().split_once('@').unwrap_or((s.trim(), ""));
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return None;
        }
        Some(Self::new(symbol, exchange.trim()))
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exchange.is_empty() {
            f.write_str(&self.symbol)
        } else {
            write!(f, "{}@{}", self.symbol, self.exchange)
        }
    }
}

// =============================================================================
// Tick Record
// =============================================================================

/// One bar or tick, from a tick file or a historical response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    /// Start of the bar.
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close (last) price.
    pub close: f64,
    /// Number of trades in the bar.
    pub num_trades: u32,
    /// Total volume.
    pub total_volume: u32,
    /// Volume traded at the bid.
    pub bid_volume: u32,
    /// Volume traded at the ask.
    pub ask_volume: u32,
}

// =============================================================================
// Snapshot and Deltas
// =============================================================================

/// Last known state of a subscription.
///
/// Fields the server never populated stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Last trade price.
    pub last_price: Option<f64>,
    /// Size of the last trade.
    pub last_volume: Option<f64>,
    /// Time of the last trade.
    pub last_trade_at: Option<DateTime<Utc>>,
    /// Best bid.
    pub bid: Option<f64>,
    /// Best bid size.
    pub bid_quantity: Option<f64>,
    /// Best ask.
    pub ask: Option<f64>,
    /// Best ask size.
    pub ask_quantity: Option<f64>,
    /// Session high.
    pub session_high: Option<f64>,
    /// Session low.
    pub session_low: Option<f64>,
    /// Session volume.
    pub session_volume: Option<f64>,
}

impl MarketSnapshot {
    /// Apply an incremental update, touching only the fields it carries.
    pub fn apply(&mut self, delta: &MarketDelta) {
        match delta {
            MarketDelta::Trade { price, volume, at } => {
                self.last_price = Some(*price);
                self.last_volume = Some(*volume);
                if at.is_some() {
                    self.last_trade_at = *at;
                }
                if self.session_high.is_none_or(|high| *price > high) {
                    self.session_high = Some(*price);
                }
                if self.session_low.is_none_or(|low| *price < low) {
                    self.session_low = Some(*price);
                }
                self.session_volume = Some(self.session_volume.unwrap_or(0.0) + volume);
            }
            MarketDelta::BidAsk {
                bid,
                bid_quantity,
                ask,
                ask_quantity,
            } => {
                if bid.is_some() {
                    self.bid = *bid;
                }
                if bid_quantity.is_some() {
                    self.bid_quantity = *bid_quantity;
                }
                if ask.is_some() {
                    self.ask = *ask;
                }
                if ask_quantity.is_some() {
                    self.ask_quantity = *ask_quantity;
                }
            }
        }
    }
}

/// Incremental change to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketDelta {
    /// A trade printed.
    Trade {
        /// Trade price.
        price: f64,
        /// Trade size.
        volume: f64,
        /// Trade time when reported.
        at: Option<DateTime<Utc>>,
    },
    /// Top of book changed; absent sides are unchanged.
    BidAsk {
        /// New best bid.
        bid: Option<f64>,
        /// New best bid size.
        bid_quantity: Option<f64>,
        /// New best ask.
        ask: Option<f64>,
        /// New best ask size.
        ask_quantity: Option<f64>,
    },
}

// =============================================================================
// Price Updates
// =============================================================================

/// Where a price update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// Pushed over the DTC session.
    Protocol,
    /// Decoded from a tailed tick file.
    TickFile,
}

impl PriceSource {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::TickFile => "tick_file",
        }
    }
}

/// Payload of a price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PriceUpdateKind {
    /// Full state after a snapshot.
    Snapshot(MarketSnapshot),
    /// Incremental change.
    Delta(MarketDelta),
    /// New bar from a tick file.
    Bar(TickRecord),
    /// The server refused the subscription and no fallback serves it. Last
    /// update on the channel.
    Rejected(SubscriptionRejection),
}

/// Event delivered to subscribers of a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Stream identity.
    pub key: SubscriptionKey,
    /// Origin of the update.
    pub source: PriceSource,
    /// Payload.
    pub kind: PriceUpdateKind,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

impl PriceUpdate {
    /// Build an update stamped with the current time.
    #[must_use]
    pub fn now(key: SubscriptionKey, source: PriceSource, kind: PriceUpdateKind) -> Self {
        Self {
            key,
            source,
            kind,
            received_at: Utc::now(),
        }
    }

    /// Most recent traded price carried by this update, if any.
    #[must_use]
    pub const fn last_price(&self) -> Option<f64> {
        match &self.kind {
            PriceUpdateKind::Snapshot(snapshot) => snapshot.last_price,
            PriceUpdateKind::Delta(MarketDelta::Trade { price, .. }) => Some(*price),
            PriceUpdateKind::Delta(MarketDelta::BidAsk { .. }) | PriceUpdateKind::Rejected(_) => {
                None
            }
            PriceUpdateKind::Bar(record) => Some(record.close),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
