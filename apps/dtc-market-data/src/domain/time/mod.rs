//! Sierra Chart Time Representations
//!
//! Sierra Chart counts time from 1899-12-30 00:00 UTC. Two encodings exist
//! in the wild:
//!
//! - **Day count**: an `f64` of whole days plus a fractional time-of-day.
//! - **Microseconds**: an `i64` count of microseconds since the same epoch
//!   (newer intraday file revisions).
//!
//! The protocol additionally reports some times as Unix seconds. Which form
//! a value takes is not announced anywhere, so [`TimeEncoding::Auto`] decides
//! by magnitude.
//!
//! # Auto Detection
//!
//! | Value | Interpretation |
//! |-------|----------------|
//! | `1 <= v < day_count_limit` | day count |
//! | `day_count_limit <= v < 1e11` | Unix seconds (protocol values only) |
//! | otherwise | microseconds since 1899-12-30 |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Microseconds in one day.
pub const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Days between 1899-12-30 and 1970-01-01.
pub const EPOCH_OFFSET_DAYS: i64 = 25_569;

/// Microseconds between 1899-12-30 and 1970-01-01.
pub const EPOCH_OFFSET_MICROS: i64 = EPOCH_OFFSET_DAYS * MICROS_PER_DAY;

/// Default upper bound for values treated as day counts.
pub const DEFAULT_DAY_COUNT_LIMIT: f64 = 100_000.0;

/// Protocol values below this (and above the day-count limit) are Unix seconds.
pub const UNIX_SECONDS_LIMIT: f64 = 1e11;

/// How an 8-byte or numeric time value should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimeEncoding {
    /// Detect the representation by magnitude.
    Auto {
        /// Values in `[1, day_count_limit)` are day counts.
        day_count_limit: f64,
    },
    /// Always a day count with fractional time-of-day.
    DayCount,
    /// Always microseconds since 1899-12-30.
    Microseconds,
}

impl Default for TimeEncoding {
    fn default() -> Self {
        Self::Auto {
            day_count_limit: DEFAULT_DAY_COUNT_LIMIT,
        }
    }
}

impl TimeEncoding {
    /// Parse from a configuration string.
    ///
    /// `limit` is used for `auto`; other modes ignore it.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str, limit: f64) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Some(Self::Auto {
                day_count_limit: limit,
            }),
            "day_count" | "daycount" | "days" => Some(Self::DayCount),
            "microseconds" | "micros" | "us" => Some(Self::Microseconds),
            _ => None,
        }
    }

    /// Returns the configuration name of this mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto { .. } => "auto",
            Self::DayCount => "day_count",
            Self::Microseconds => "microseconds",
        }
    }

    /// Decode the raw little-endian 8 bytes of a tick file time field.
    ///
    /// Returns `None` when the value does not map to a representable instant.
    #[must_use]
    pub fn decode_raw(self, raw: [u8; 8]) -> Option<DateTime<Utc>> {
        match self {
            Self::DayCount => from_day_count(f64::from_le_bytes(raw)),
            Self::Microseconds => from_epoch_micros(i64::from_le_bytes(raw)),
            Self::Auto { day_count_limit } => {
                let days = f64::from_le_bytes(raw);
                if (1.0..day_count_limit).contains(&days) {
                    from_day_count(days)
                } else {
                    from_epoch_micros(i64::from_le_bytes(raw))
                }
            }
        }
    }

    /// Encode an instant into the 8-byte time field.
    ///
    /// `Auto` writes microseconds, the representation of current file revisions.
    #[must_use]
    pub fn encode_raw(self, at: DateTime<Utc>) -> [u8; 8] {
        match self {
            Self::DayCount => to_day_count(at).to_le_bytes(),
            Self::Microseconds | Self::Auto { .. } => to_epoch_micros(at).to_le_bytes(),
        }
    }

    /// Decode a numeric time value received over the protocol.
    #[must_use]
    pub fn decode_value(self, value: f64) -> Option<DateTime<Utc>> {
        if !value.is_finite() {
            return None;
        }
        match self {
            Self::DayCount => from_day_count(value),
            Self::Microseconds => float_to_i64(value).and_then(from_epoch_micros),
            Self::Auto { day_count_limit } => {
                if value < day_count_limit {
                    from_day_count(value)
                } else if value < UNIX_SECONDS_LIMIT {
                    from_unix_seconds(value)
                } else {
                    float_to_i64(value).and_then(from_epoch_micros)
                }
            }
        }
    }
}

/// Convert a day count since 1899-12-30 into an instant.
#[must_use]
pub fn from_day_count(days: f64) -> Option<DateTime<Utc>> {
    if !days.is_finite() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let micros = ((days - EPOCH_OFFSET_DAYS as f64) * MICROS_PER_DAY as f64).round();
    float_to_i64(micros).and_then(DateTime::from_timestamp_micros)
}

/// Convert microseconds since 1899-12-30 into an instant.
#[must_use]
pub fn from_epoch_micros(micros: i64) -> Option<DateTime<Utc>> {
    micros
        .checked_sub(EPOCH_OFFSET_MICROS)
        .and_then(DateTime::from_timestamp_micros)
}

/// Convert fractional Unix seconds into an instant.
#[must_use]
pub fn from_unix_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    float_to_i64((seconds * 1_000_000.0).round()).and_then(DateTime::from_timestamp_micros)
}

/// Convert an instant into a day count since 1899-12-30.
#[must_use]
pub fn to_day_count(at: DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let days = at.timestamp_micros() as f64 / MICROS_PER_DAY as f64;
    #[allow(clippy::cast_precision_loss)]
    let offset = EPOCH_OFFSET_DAYS as f64;
    days + offset
}

/// Convert an instant into microseconds since 1899-12-30.
#[must_use]
pub fn to_epoch_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros().saturating_add(EPOCH_OFFSET_MICROS)
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn float_to_i64(value: f64) -> Option<i64> {
    let in_range = value.is_finite() && value >= i64::MIN as f64 && value <= i64::MAX as f64;
    in_range.then(|| value as i64)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Timelike};
    use test_case::test_case;

    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).single().unwrap()
    }

    #[test]
    fn epoch_reference_date_is_day_zero() {
        let at = from_day_count(0.0).unwrap();
        assert_eq!(at, utc(1899, 12, 30, 0, 0, 0));
    }

    #[test]
    fn unix_epoch_day_count() {
        let at = from_day_count(25_569.0).unwrap();
        assert_eq!(at.timestamp(), 0);
    }

    #[test]
    fn fractional_day_is_time_of_day() {
        let at = from_day_count(45_658.75).unwrap();
        assert_eq!((at.year(), at.month(), at.day()), (2025, 1, 1));
        assert_eq!((at.hour(), at.minute()), (18, 0));
    }

    #[test]
    fn microseconds_match_day_count() {
        let from_days = from_day_count(45_658.5).unwrap();
        let from_micros = from_epoch_micros(45_658 * MICROS_PER_DAY + MICROS_PER_DAY / 2).unwrap();
        assert_eq!(from_days, from_micros);
    }

    #[test]
    fn day_count_round_trips_within_a_second() {
        let at = utc(2024, 6, 14, 13, 30, 5);
        let back = from_day_count(to_day_count(at)).unwrap();
        assert!((back - at).num_milliseconds().abs() < 1_000);
    }

    #[test_case(TimeEncoding::DayCount ; "day count")]
    #[test_case(TimeEncoding::Microseconds ; "microseconds")]
    #[test_case(TimeEncoding::default() ; "auto")]
    fn raw_encoding_round_trips(encoding: TimeEncoding) {
        let at = utc(2023, 3, 9, 14, 45, 0);
        let decoded = encoding.decode_raw(encoding.encode_raw(at)).unwrap();
        assert!((decoded - at).num_milliseconds().abs() < 1_000);
    }

    #[test]
    fn auto_detects_day_count_bytes() {
        let raw = 45_000.25_f64.to_le_bytes();
        let at = TimeEncoding::default().decode_raw(raw).unwrap();
        assert_eq!(at, from_day_count(45_000.25).unwrap());
    }

    #[test]
    fn auto_detects_microsecond_bytes() {
        let micros = to_epoch_micros(utc(2025, 2, 3, 9, 30, 0));
        let at = TimeEncoding::default().decode_raw(micros.to_le_bytes()).unwrap();
        assert_eq!(at, utc(2025, 2, 3, 9, 30, 0));
    }

    #[test]
    fn lowered_limit_reinterprets_day_count_bytes() {
        let raw = 45_000.0_f64.to_le_bytes();
        let encoding = TimeEncoding::Auto {
            day_count_limit: 10_000.0,
        };
        let at = encoding.decode_raw(raw);
        assert_ne!(at, from_day_count(45_000.0));
    }

    #[test]
    fn protocol_value_detection() {
        let auto = TimeEncoding::default();
        assert_eq!(
            auto.decode_value(45_658.0).unwrap(),
            utc(2025, 1, 1, 0, 0, 0)
        );
        assert_eq!(
            auto.decode_value(1_735_689_600.0).unwrap(),
            utc(2025, 1, 1, 0, 0, 0)
        );
        #[allow(clippy::cast_precision_loss)]
        let micros = to_epoch_micros(utc(2025, 1, 1, 0, 0, 0)) as f64;
        assert_eq!(auto.decode_value(micros).unwrap(), utc(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        assert!(TimeEncoding::default().decode_value(f64::NAN).is_none());
        assert!(from_day_count(f64::INFINITY).is_none());
    }

    #[test]
    fn parse_modes() {
        assert_eq!(
            TimeEncoding::from_str_case_insensitive("AUTO", 5.0),
            Some(TimeEncoding::Auto {
                day_count_limit: 5.0
            })
        );
        assert_eq!(
            TimeEncoding::from_str_case_insensitive("day_count", 5.0),
            Some(TimeEncoding::DayCount)
        );
        assert_eq!(
            TimeEncoding::from_str_case_insensitive("micros", 5.0),
            Some(TimeEncoding::Microseconds)
        );
        assert_eq!(TimeEncoding::from_str_case_insensitive("ole", 5.0), None);
        assert_eq!(TimeEncoding::DayCount.as_str(), "day_count");
    }
}
