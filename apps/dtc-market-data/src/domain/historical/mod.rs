//! Historical Range Requests
//!
//! A historical request streams zero or more [`TickRecord`]s followed by
//! exactly one terminal event. Status only moves forward:
//!
//! ```text
//! Pending ──► Streaming ──► Complete
//!    │            │
//!    └────────────┴──────► Rejected | Cancelled
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::market_data::{SubscriptionKey, TickRecord};

/// Per-session identifier correlating historical responses with a request.
pub type RequestId = u32;

/// Parameters of a historical range fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoricalQuery {
    /// Symbol and exchange.
    pub key: SubscriptionKey,
    /// Bar width in seconds; 0 requests ticks.
    pub interval_seconds: u32,
    /// First instant of the range.
    pub start: DateTime<Utc>,
    /// Last instant of the range; `None` means up to now.
    pub end: Option<DateTime<Utc>>,
    /// Server-side cap on days returned; 0 leaves it to the server.
    pub max_days: u32,
}

impl HistoricalQuery {
    /// Build a query for `[start, end]`.
    #[must_use]
    pub const fn new(
        key: SubscriptionKey,
        interval_seconds: u32,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key,
            interval_seconds,
            start,
            end,
            max_days: 0,
        }
    }

    /// Cap the number of days the server returns.
    #[must_use]
    pub const fn with_max_days(mut self, max_days: u32) -> Self {
        self.max_days = max_days;
        self
    }
}

/// Progress of a historical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoricalStatus {
    /// Sent, nothing received yet.
    Pending,
    /// Header or records received.
    Streaming,
    /// Final marker received.
    Complete,
    /// Server refused the request.
    Rejected,
    /// Session closed or timeout expired first.
    Cancelled,
}

impl HistoricalStatus {
    /// Whether no further events can follow.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Rejected | Self::Cancelled)
    }
}

/// Reject details from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoricalRejection {
    /// Server reason code.
    pub code: i32,
    /// Server reason text.
    pub text: String,
}

impl fmt::Display for HistoricalRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.text)
    }
}

/// Why a request ended without a server verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Session disconnected or was closed.
    SessionClosed,
    /// Caller-supplied timeout expired.
    TimedOut,
}

impl CancelReason {
    /// Label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionClosed => "session_closed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// One item of a historical response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoricalEvent {
    /// A decoded record.
    Record(TickRecord),
    /// Terminal: all records delivered.
    Complete {
        /// Records delivered before completion.
        records: usize,
    },
    /// Terminal: server refused.
    Rejected(HistoricalRejection),
    /// Terminal: abandoned locally.
    Cancelled(CancelReason),
}

impl HistoricalEvent {
    /// Whether this event ends the stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Record(_))
    }
}

/// Tracking state for one outstanding request.
#[derive(Debug, Clone)]
pub struct HistoricalRequest {
    id: RequestId,
    query: HistoricalQuery,
    status: HistoricalStatus,
    records: usize,
}

impl HistoricalRequest {
    /// Start tracking a request.
    #[must_use]
    pub const fn new(id: RequestId, query: HistoricalQuery) -> Self {
        Self {
            id,
            query,
            status: HistoricalStatus::Pending,
            records: 0,
        }
    }

    /// Request id.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Original query.
    #[must_use]
    pub const fn query(&self) -> &HistoricalQuery {
        &self.query
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> HistoricalStatus {
        self.status
    }

    /// Records accepted so far.
    #[must_use]
    pub const fn records(&self) -> usize {
        self.records
    }

    /// Header received. Returns `false` once terminal.
    pub fn begin_streaming(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = HistoricalStatus::Streaming;
        true
    }

    /// Record received. Returns `false` once terminal.
    pub fn record_received(&mut self) -> bool {
        if !self.begin_streaming() {
            return false;
        }
        self.records += 1;
        true
    }

    /// Move to a terminal status, producing the terminal event.
    ///
    /// Returns `None` if a terminal status was already reached.
    pub fn finish(&mut self, outcome: HistoricalOutcome) -> Option<HistoricalEvent> {
        if self.status.is_terminal() {
            return None;
        }
        let event = match outcome {
            HistoricalOutcome::Complete => {
                self.status = HistoricalStatus::Complete;
                HistoricalEvent::Complete {
                    records: self.records,
                }
            }
            HistoricalOutcome::Rejected(rejection) => {
                self.status = HistoricalStatus::Rejected;
                HistoricalEvent::Rejected(rejection)
            }
            HistoricalOutcome::Cancelled(reason) => {
                self.status = HistoricalStatus::Cancelled;
                HistoricalEvent::Cancelled(reason)
            }
        };
        Some(event)
    }
}

/// Terminal verdict applied through [`HistoricalRequest::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoricalOutcome {
    /// Final marker received.
    Complete,
    /// Server refused.
    Rejected(HistoricalRejection),
    /// Abandoned locally.
    Cancelled(CancelReason),
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn request() -> HistoricalRequest {
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).single().unwrap();
        HistoricalRequest::new(
            7,
            HistoricalQuery::new(SubscriptionKey::new("ES", "CME"), 60, start, None),
        )
    }

    #[test]
    fn streams_then_completes() {
        let mut req = request();
        assert_eq!(req.status(), HistoricalStatus::Pending);
        assert!(req.begin_streaming());
        assert!(req.record_received());
        assert!(req.record_received());

        let event = req.finish(HistoricalOutcome::Complete).unwrap();

        assert_eq!(event, HistoricalEvent::Complete { records: 2 });
        assert_eq!(req.status(), HistoricalStatus::Complete);
    }

    #[test]
    fn exactly_one_terminal_event() {
        let mut req = request();
        let rejection = HistoricalRejection {
            code: 2,
            text: "No data".to_string(),
        };
        assert!(
            req.finish(HistoricalOutcome::Rejected(rejection))
                .is_some()
        );
        assert!(req.finish(HistoricalOutcome::Complete).is_none());
        assert!(!req.record_received());
        assert_eq!(req.records(), 0);
        assert_eq!(req.status(), HistoricalStatus::Rejected);
    }

    #[test]
    fn cancel_from_pending() {
        let mut req = request();
        let event = req
            .finish(HistoricalOutcome::Cancelled(CancelReason::TimedOut))
            .unwrap();
        assert_eq!(event, HistoricalEvent::Cancelled(CancelReason::TimedOut));
        assert!(event.is_terminal());
        assert!(req.status().is_terminal());
    }

    #[test]
    fn query_builder() {
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).single().unwrap();
        let query = HistoricalQuery::new(SubscriptionKey::new("ES", "CME"), 300, start, None)
            .with_max_days(5);
        assert_eq!(query.max_days, 5);
        assert_eq!(query.interval_seconds, 300);
    }
}
