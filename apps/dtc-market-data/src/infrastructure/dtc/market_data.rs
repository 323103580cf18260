//! Market Data Subscriptions
//!
//! Issues subscribe/unsubscribe requests and turns snapshots, trade updates
//! and bid/ask updates into [`PriceUpdate`]s for the subscriber that asked.
//!
//! # Reconciliation
//!
//! A subscription is `Requested` until its snapshot arrives. Updates received
//! before the snapshot are buffered in the [`SubscriptionBook`] and delivered
//! right after it, in arrival order. A reject resolves only the handle that
//! issued the request.
//!
//! # Delivery
//!
//! Each handle owns a bounded channel. The session task never waits on a
//! subscriber; a full channel drops the update and counts it.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::dispatch::MessageHandler;
use super::messages::{
    MarketDataReject, MarketDataRequest, MarketDataSnapshot, MarketDataUpdateBidAsk,
    MarketDataUpdateTrade, Message, RequestAction,
};
use super::session::SessionError;
use crate::domain::market_data::{
    MarketDelta, MarketSnapshot, PriceSource, PriceUpdate, PriceUpdateKind, SubscriptionKey,
    SymbolId,
};
use crate::domain::subscription::{
    BookStats, DeltaOutcome, SubscriptionBook, SubscriptionRejection,
};
use crate::domain::time::TimeEncoding;
use crate::infrastructure::metrics;

/// Default capacity of each subscriber's update channel.
pub const DEFAULT_UPDATE_CAPACITY: usize = 1024;

/// Prices at or above this are the server's "unset" sentinel.
const UNSET_PRICE: f64 = 1e300;

// =============================================================================
// Subscription Handle
// =============================================================================

/// How a subscription request was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionOutcome {
    /// Snapshot received.
    Active(MarketSnapshot),
    /// Server refused.
    Rejected(SubscriptionRejection),
    /// Unsubscribed or session ended before a verdict.
    Cancelled,
}

/// Caller side of one subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SymbolId,
    key: SubscriptionKey,
    updates: mpsc::Receiver<PriceUpdate>,
    outcome: oneshot::Receiver<SubscriptionOutcome>,
    resolved: Option<SubscriptionOutcome>,
}

impl SubscriptionHandle {
    /// Symbol id used on the wire.
    #[must_use]
    pub const fn id(&self) -> SymbolId {
        self.id
    }

    /// Symbol and exchange.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Wait for the snapshot, a reject, or cancellation.
    pub async fn outcome(&mut self) -> SubscriptionOutcome {
        if let Some(outcome) = &self.resolved {
            return outcome.clone();
        }
        let outcome = (&mut self.outcome)
            .await
            .unwrap_or(SubscriptionOutcome::Cancelled);
        self.resolved = Some(outcome.clone());
        outcome
    }

    /// Next update; `None` once the subscription is gone.
    pub async fn next_update(&mut self) -> Option<PriceUpdate> {
        self.updates.recv().await
    }
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Debug)]
struct Route {
    key: SubscriptionKey,
    updates: mpsc::Sender<PriceUpdate>,
    outcome: Option<oneshot::Sender<SubscriptionOutcome>>,
}

impl Route {
    fn resolve(&mut self, outcome: SubscriptionOutcome) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }

    fn deliver(&self, kind: PriceUpdateKind) {
        let update = PriceUpdate::now(self.key.clone(), PriceSource::Protocol, kind);
        match self.updates.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_updates_dropped(1);
                tracing::debug!(symbol = %self.key, "Subscriber lagging, update dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(symbol = %self.key, "Subscriber gone");
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    book: SubscriptionBook,
    routes: HashMap<SymbolId, Route>,
    closed: bool,
}

/// Market data side of a session.
#[derive(Debug)]
pub struct MarketDataManager {
    inner: Mutex<Inner>,
    outbound: mpsc::Sender<Message>,
    time: TimeEncoding,
    update_capacity: usize,
}

impl MarketDataManager {
    /// Create a manager writing requests to `outbound`.
    #[must_use]
    pub fn new(
        outbound: mpsc::Sender<Message>,
        time: TimeEncoding,
        update_capacity: usize,
        pending_limit: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                book: SubscriptionBook::new(pending_limit),
                routes: HashMap::new(),
                closed: false,
            }),
            outbound,
            time,
            update_capacity: update_capacity.max(1),
        }
    }

    /// Subscribe under a fresh symbol id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has ended.
    pub async fn subscribe(&self, key: SubscriptionKey) -> Result<SubscriptionHandle, SessionError> {
        let (update_tx, update_rx) = mpsc::channel(self.update_capacity);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let id = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SessionError::Closed);
            }
            let id = inner.book.open(key.clone());
            inner.routes.insert(
                id,
                Route {
                    key: key.clone(),
                    updates: update_tx,
                    outcome: Some(outcome_tx),
                },
            );
            id
        };

        let request = Self::request(RequestAction::Subscribe, id, &key);
        if self.outbound.send(request).await.is_err() {
            self.forget(id);
            return Err(SessionError::Closed);
        }
        tracing::debug!(symbol = %key, symbol_id = id, "Subscribe sent");

        Ok(SubscriptionHandle {
            id,
            key,
            updates: update_rx,
            outcome: outcome_rx,
            resolved: None,
        })
    }

    /// Unsubscribe and drop local state.
    ///
    /// Idempotent: returns `false` when the id is not tracked, and sends
    /// nothing in that case.
    pub async fn unsubscribe(&self, id: SymbolId) -> bool {
        let Some(key) = self.forget(id) else {
            return false;
        };
        let request = Self::request(RequestAction::Unsubscribe, id, &key);
        if self.outbound.send(request).await.is_err() {
            tracing::debug!(symbol = %key, "Session closed before unsubscribe was sent");
        }
        tracing::debug!(symbol = %key, symbol_id = id, "Unsubscribed");
        true
    }

    /// Keys of every active subscription, ordered by id.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.inner.lock().book.active_keys()
    }

    /// Live symbol id for a key.
    #[must_use]
    pub fn find(&self, key: &SubscriptionKey) -> Option<SymbolId> {
        self.inner.lock().book.find(key)
    }

    /// Last known state of a subscription.
    #[must_use]
    pub fn snapshot(&self, id: SymbolId) -> Option<MarketSnapshot> {
        self.inner
            .lock()
            .book
            .get(id)
            .map(|entry| entry.snapshot().clone())
    }

    /// Counts by state.
    #[must_use]
    pub fn stats(&self) -> BookStats {
        self.inner.lock().book.stats()
    }

    fn forget(&self, id: SymbolId) -> Option<SubscriptionKey> {
        let mut inner = self.inner.lock();
        let entry = inner.book.remove(id)?;
        if let Some(mut route) = inner.routes.remove(&id) {
            route.resolve(SubscriptionOutcome::Cancelled);
        }
        metrics::set_active_subscriptions(inner.book.stats().active);
        Some(entry.key().clone())
    }

    fn request(action: RequestAction, id: SymbolId, key: &SubscriptionKey) -> Message {
        Message::MarketDataRequest(MarketDataRequest {
            request_action: action,
            symbol_id: id,
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
            interval_for_snapshot_updates_in_milliseconds: 0,
        })
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn on_snapshot(&self, wire: &MarketDataSnapshot) {
        let snapshot = self.snapshot_from_wire(wire);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(applied) = inner.book.apply_snapshot(wire.symbol_id, snapshot) else {
            tracing::debug!(symbol_id = wire.symbol_id, "Snapshot for unknown symbol id");
            return;
        };
        let Some(route) = inner.routes.get_mut(&wire.symbol_id) else {
            return;
        };

        if applied.activated {
            tracing::info!(symbol = %route.key, symbol_id = wire.symbol_id, "Subscription active");
            route.resolve(SubscriptionOutcome::Active(applied.snapshot.clone()));
        }
        route.deliver(PriceUpdateKind::Snapshot(applied.snapshot));
        for delta in applied.replayed {
            route.deliver(PriceUpdateKind::Delta(delta));
        }

        metrics::set_active_subscriptions(inner.book.stats().active);
    }

    fn on_delta(&self, id: SymbolId, delta: MarketDelta) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.book.apply_delta(id, delta) {
            DeltaOutcome::Applied(delta) => {
                if let Some(route) = inner.routes.get(&id) {
                    route.deliver(PriceUpdateKind::Delta(delta));
                }
            }
            DeltaOutcome::Buffered { overflowed: true } => {
                tracing::warn!(symbol_id = id, "Pre-snapshot buffer full, oldest update dropped");
            }
            DeltaOutcome::Buffered { overflowed: false } => {
                tracing::trace!(symbol_id = id, "Update buffered until snapshot");
            }
            DeltaOutcome::Ignored => {
                tracing::trace!(symbol_id = id, "Update for inactive symbol id ignored");
            }
        }
    }

    fn on_reject(&self, wire: &MarketDataReject) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(rejection) = inner.book.reject(wire.symbol_id, &wire.reject_text) else {
            tracing::debug!(symbol_id = wire.symbol_id, "Reject for unknown symbol id");
            return;
        };
        metrics::record_subscription_reject(rejection.category);

        if let Some(mut route) = inner.routes.remove(&wire.symbol_id) {
            tracing::warn!(
                symbol = %route.key,
                category = rejection.category.as_str(),
                reason = %wire.reject_text,
                "Market data rejected"
            );
            route.resolve(SubscriptionOutcome::Rejected(rejection));
        }
        metrics::set_active_subscriptions(inner.book.stats().active);
    }

    // =========================================================================
    // Wire Conversion
    // =========================================================================

    fn snapshot_from_wire(&self, wire: &MarketDataSnapshot) -> MarketSnapshot {
        MarketSnapshot {
            last_price: price(wire.last_trade_price),
            last_volume: price(wire.last_trade_volume),
            last_trade_at: wire
                .last_trade_date_time
                .filter(|v| *v > 0.0)
                .and_then(|v| self.time.decode_value(v)),
            bid: price(wire.bid_price),
            bid_quantity: price(wire.bid_quantity),
            ask: price(wire.ask_price),
            ask_quantity: price(wire.ask_quantity),
            session_high: price(wire.session_high_price),
            session_low: price(wire.session_low_price),
            session_volume: price(wire.session_volume),
        }
    }

    fn trade_from_wire(&self, wire: &MarketDataUpdateTrade) -> MarketDelta {
        MarketDelta::Trade {
            price: wire.price,
            volume: wire.volume,
            at: wire
                .date_time
                .filter(|v| *v > 0.0)
                .and_then(|v| self.time.decode_value(v)),
        }
    }

    fn bid_ask_from_wire(wire: &MarketDataUpdateBidAsk) -> MarketDelta {
        MarketDelta::BidAsk {
            bid: price(wire.bid_price),
            bid_quantity: price(wire.bid_quantity),
            ask: price(wire.ask_price),
            ask_quantity: price(wire.ask_quantity),
        }
    }
}

fn price(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && v.abs() < UNSET_PRICE)
}

impl MessageHandler for MarketDataManager {
    fn handle(&self, message: Message) {
        match message {
            Message::MarketDataSnapshot(snapshot) => self.on_snapshot(&snapshot),
            Message::MarketDataUpdateTrade(trade) => {
                let delta = self.trade_from_wire(&trade);
                self.on_delta(trade.symbol_id, delta);
            }
            Message::MarketDataUpdateBidAsk(update) => {
                self.on_delta(update.symbol_id, Self::bid_ask_from_wire(&update));
            }
            Message::MarketDataReject(reject) => self.on_reject(&reject),
            other => tracing::trace!(type_code = other.type_code(), "Not a market data message"),
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let drained = inner.book.drain();
        for (_, mut route) in inner.routes.drain() {
            route.resolve(SubscriptionOutcome::Cancelled);
        }
        metrics::set_active_subscriptions(0);
        tracing::debug!(subscriptions = drained.len(), "Market data closed");
    }
}
