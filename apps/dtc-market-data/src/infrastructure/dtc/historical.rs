//! Historical Price Data
//!
//! Sends `HistoricalPriceDataRequest` and routes the response stream back to
//! the caller by request id. Any number of requests may be in flight at once.
//!
//! # Terminal Markers
//!
//! A request ends on the first of:
//! - `HistoricalPriceDataFinal` (804)
//! - a response header with `NoRecordsToReturn` set
//! - a record with `IsFinalRecord` set (its data is emitted first when present)
//! - `HistoricalPriceDataReject` (802)
//! - the caller's timeout or the end of the session (`Cancelled`)
//!
//! Response channels are unbounded: records are never dropped, and the
//! session task never waits on a slow reader.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::dispatch::MessageHandler;
use super::messages::{
    HistoricalPriceDataRecordResponse, HistoricalPriceDataRequest, Message,
};
use super::session::{RequestIds, SessionError};
use crate::domain::historical::{
    CancelReason, HistoricalEvent, HistoricalOutcome, HistoricalQuery, HistoricalRejection,
    HistoricalRequest, RequestId,
};
use crate::domain::market_data::TickRecord;
use crate::domain::time::TimeEncoding;
use crate::infrastructure::metrics::{self, RecordSource};

/// Why a historical fetch produced no complete result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoricalError {
    /// Server refused the request.
    #[error("historical request rejected: {0}")]
    Rejected(HistoricalRejection),

    /// Timed out or the session ended.
    #[error("historical request cancelled: {}", .0.as_str())]
    Cancelled(CancelReason),
}

// =============================================================================
// Stream
// =============================================================================

/// Response stream of one historical request.
#[derive(Debug)]
pub struct HistoricalStream {
    id: RequestId,
    events: mpsc::UnboundedReceiver<HistoricalEvent>,
    deadline: Option<Instant>,
    fetcher: Weak<HistoricalFetcher>,
    finished: bool,
}

impl HistoricalStream {
    /// Request id used on the wire.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Next event; `None` after the terminal event.
    pub async fn next(&mut self) -> Option<HistoricalEvent> {
        if self.finished {
            return None;
        }

        let received = match self.deadline {
            Some(deadline) => {
                let before_deadline = tokio::select! {
                    biased;
                    event = self.events.recv() => Some(event),
                    () = tokio::time::sleep_until(deadline) => None,
                };
                match before_deadline {
                    Some(event) => event,
                    None => {
                        self.deadline = None;
                        match self.fetcher.upgrade() {
                            Some(fetcher) => {
                                fetcher.cancel(self.id, CancelReason::TimedOut);
                                self.events.recv().await
                            }
                            None => Some(HistoricalEvent::Cancelled(CancelReason::TimedOut)),
                        }
                    }
                }
            }
            None => self.events.recv().await,
        };

        let event =
            received.unwrap_or(HistoricalEvent::Cancelled(CancelReason::SessionClosed));
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Drain the stream into its records.
    ///
    /// # Errors
    ///
    /// Returns a [`HistoricalError`] if the request was rejected or cancelled.
    pub async fn collect_records(mut self) -> Result<Vec<TickRecord>, HistoricalError> {
        let mut records = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                HistoricalEvent::Record(record) => records.push(record),
                HistoricalEvent::Complete { .. } => return Ok(records),
                HistoricalEvent::Rejected(rejection) => {
                    return Err(HistoricalError::Rejected(rejection));
                }
                HistoricalEvent::Cancelled(reason) => return Err(HistoricalError::Cancelled(reason)),
            }
        }
        Ok(records)
    }
}

impl Drop for HistoricalStream {
    fn drop(&mut self) {
        if !self.finished
            && let Some(fetcher) = self.fetcher.upgrade()
        {
            fetcher.forget(self.id);
        }
    }
}

// =============================================================================
// Fetcher
// =============================================================================

#[derive(Debug)]
struct InFlight {
    request: HistoricalRequest,
    events: mpsc::UnboundedSender<HistoricalEvent>,
    started: Instant,
}

impl InFlight {
    fn finish(mut self, outcome: HistoricalOutcome) {
        let Some(event) = self.request.finish(outcome) else {
            return;
        };
        let label = match &event {
            HistoricalEvent::Complete { .. } => "complete",
            HistoricalEvent::Rejected(_) => "rejected",
            HistoricalEvent::Cancelled(_) | HistoricalEvent::Record(_) => "cancelled",
        };
        metrics::record_historical_duration(label, self.started.elapsed());
        tracing::info!(
            request_id = self.request.id(),
            symbol = %self.request.query().key,
            records = self.request.records(),
            outcome = label,
            "Historical request finished"
        );
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Default)]
struct Inner {
    in_flight: HashMap<RequestId, InFlight>,
    closed: bool,
}

/// Historical side of a session.
#[derive(Debug)]
pub struct HistoricalFetcher {
    inner: Mutex<Inner>,
    outbound: mpsc::Sender<Message>,
    ids: RequestIds,
    time: TimeEncoding,
}

impl HistoricalFetcher {
    /// Create a fetcher writing requests to `outbound`.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Message>, ids: RequestIds, time: TimeEncoding) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            outbound,
            ids,
            time,
        }
    }

    /// Send a historical request.
    ///
    /// `timeout`, when given, bounds the whole response stream; expiry
    /// resolves the request as cancelled. Timed-out requests are not retried.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session has ended.
    pub async fn fetch(
        self: &Arc<Self>,
        query: HistoricalQuery,
        timeout: Option<Duration>,
    ) -> Result<HistoricalStream, SessionError> {
        let id = self.ids.next_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let request = HistoricalPriceDataRequest {
            request_id: id,
            symbol: query.key.symbol.clone(),
            exchange: query.key.exchange.clone(),
            record_interval: query.interval_seconds,
            start_date_time: query.start.timestamp(),
            end_date_time: query.end.map_or(0, |end| end.timestamp()),
            max_days_to_return: query.max_days,
            use_zlib_compression: 0,
        };

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SessionError::Closed);
            }
            inner.in_flight.insert(
                id,
                InFlight {
                    request: HistoricalRequest::new(id, query.clone()),
                    events: events_tx,
                    started: Instant::now(),
                },
            );
        }

        if self
            .outbound
            .send(Message::HistoricalPriceDataRequest(request))
            .await
            .is_err()
        {
            self.forget(id);
            return Err(SessionError::Closed);
        }
        tracing::info!(
            request_id = id,
            symbol = %query.key,
            interval_seconds = query.interval_seconds,
            start = %query.start,
            "Historical request sent"
        );

        Ok(HistoricalStream {
            id,
            events: events_rx,
            deadline: timeout.map(|t| Instant::now() + t),
            fetcher: Arc::downgrade(self),
            finished: false,
        })
    }

    /// Requests still awaiting a terminal event.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Resolve a request as cancelled.
    pub fn cancel(&self, id: RequestId, reason: CancelReason) {
        let entry = self.inner.lock().in_flight.remove(&id);
        if let Some(entry) = entry {
            entry.finish(HistoricalOutcome::Cancelled(reason));
        }
    }

    fn forget(&self, id: RequestId) {
        self.inner.lock().in_flight.remove(&id);
    }

    fn finish(&self, id: RequestId, outcome: HistoricalOutcome) {
        let entry = self.inner.lock().in_flight.remove(&id);
        match entry {
            Some(entry) => entry.finish(outcome),
            None => tracing::debug!(request_id = id, "Terminal event for unknown request id"),
        }
    }

    fn on_record(&self, wire: &HistoricalPriceDataRecordResponse) {
        let id = wire.request_id;
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.in_flight.get_mut(&id) else {
                tracing::debug!(request_id = id, "Record for unknown request id");
                return;
            };

            if has_data(wire) {
                match self.record_from_wire(wire) {
                    Some(record) => {
                        if entry.request.record_received() {
                            let _ = entry.events.send(HistoricalEvent::Record(record));
                        }
                    }
                    None => {
                        metrics::record_corrupt_records(RecordSource::Historical, 1);
                        tracing::warn!(
                            request_id = id,
                            start_date_time = wire.start_date_time,
                            "Skipping historical record with undecodable time"
                        );
                    }
                }
            }
        }

        if wire.is_final_record {
            self.finish(id, HistoricalOutcome::Complete);
        }
    }

    fn record_from_wire(&self, wire: &HistoricalPriceDataRecordResponse) -> Option<TickRecord> {
        let timestamp = self.time.decode_value(wire.start_date_time)?;
        Some(TickRecord {
            timestamp,
            open: wire.open_price,
            high: wire.high_price,
            low: wire.low_price,
            close: wire.last_price,
            num_trades: count(wire.num_trades),
            total_volume: count(wire.volume),
            bid_volume: count(wire.bid_volume),
            ask_volume: count(wire.ask_volume),
        })
    }
}

fn has_data(wire: &HistoricalPriceDataRecordResponse) -> bool {
    wire.start_date_time != 0.0 || wire.last_price != 0.0
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn count(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        0
    } else if value >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        value.round() as u32
    }
}

impl MessageHandler for HistoricalFetcher {
    fn handle(&self, message: Message) {
        match message {
            Message::HistoricalPriceDataResponseHeader(header) => {
                let id = header.request_id;
                let known = self
                    .inner
                    .lock()
                    .in_flight
                    .get_mut(&id)
                    .map(|entry| entry.request.begin_streaming());
                if known.is_none() {
                    tracing::debug!(request_id = id, "Header for unknown request id");
                } else if header.no_records_to_return {
                    self.finish(id, HistoricalOutcome::Complete);
                }
            }
            Message::HistoricalPriceDataReject(reject) => {
                self.finish(
                    reject.request_id,
                    HistoricalOutcome::Rejected(HistoricalRejection {
                        code: reject.reject_reason_code,
                        text: reject.reject_text,
                    }),
                );
            }
            Message::HistoricalPriceDataRecordResponse(record) => self.on_record(&record),
            Message::HistoricalPriceDataFinal(final_marker) => {
                self.finish(final_marker.request_id, HistoricalOutcome::Complete);
            }
            other => tracing::trace!(type_code = other.type_code(), "Not a historical message"),
        }
    }

    fn close(&self) {
        let drained: Vec<InFlight> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.in_flight.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.finish(HistoricalOutcome::Cancelled(CancelReason::SessionClosed));
        }
    }
}
