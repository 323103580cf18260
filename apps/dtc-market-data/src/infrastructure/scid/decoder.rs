//! Tick File Decoder
//!
//! Decodes Sierra Chart intraday files (`.scid`).
//!
//! # Layout
//!
//! All integers little-endian.
//!
//! ```text
//! header (56 bytes)
//!   0  [u8; 4]  file tag ("SCID")
//!   4  u32      header size
//!   8  u32      record size
//!  12  u16      version
//!  14  ...      reserved
//!
//! record (record size bytes, at least 40)
//!   0  8 bytes  time (day count f64 or microseconds i64)
//!   8  f32 x4   open, high, low, close
//!  24  u32 x4   trades, total volume, bid volume, ask volume
//! ```
//!
//! Header sizes are trusted over the constants; a zero size falls back to
//! the default.

use bytes::{Buf, BufMut, BytesMut};
use chrono::Datelike;
use std::io;
use std::path::PathBuf;

use crate::domain::market_data::TickRecord;
use crate::domain::time::TimeEncoding;

/// Minimum header length, and the default header size.
pub const HEADER_LEN: usize = 56;

/// Minimum record length, and the default record size.
pub const RECORD_LEN: usize = 40;

/// Tag written by current Sierra Chart versions.
pub const FILE_TAG: [u8; 4] = *b"SCID";

/// Records dated before this year are treated as corrupt.
pub const DEFAULT_MIN_YEAR: i32 = 2000;

/// Tick file errors.
#[derive(Debug, thiserror::Error)]
pub enum TickFileError {
    /// Header truncated or not a tick file.
    #[error("corrupt tick file header: {0}")]
    CorruptHeader(String),

    /// File does not exist.
    #[error("tick file not found: {}", path.display())]
    NotFound {
        /// Path that was polled.
        path: PathBuf,
    },

    /// Any other I/O failure, typically permissions.
    #[error("tick file access error on {}: {source}", path.display())]
    Access {
        /// Path that was polled.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl TickFileError {
    /// Classify an I/O error for `path`.
    #[must_use]
    pub fn from_io(path: PathBuf, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound { path }
        } else {
            Self::Access { path, source }
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CorruptHeader(_) => "corrupt_header",
            Self::NotFound { .. } => "not_found",
            Self::Access { .. } => "access",
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickFileHeader {
    /// Four-byte ASCII tag.
    pub tag: [u8; 4],
    /// Offset of the first record.
    pub header_size: u32,
    /// Bytes per record.
    pub record_size: u32,
    /// File format version.
    pub version: u16,
}

impl Default for TickFileHeader {
    fn default() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self {
            tag: FILE_TAG,
            header_size: HEADER_LEN as u32,
            record_size: RECORD_LEN as u32,
            version: 1,
        }
    }
}

impl TickFileHeader {
    /// Decode the first 56 bytes of a tick file.
    ///
    /// # Errors
    ///
    /// Returns [`TickFileError::CorruptHeader`] when fewer than 56 bytes are
    /// available, the tag is not printable ASCII, or a declared size is below
    /// its minimum.
    pub fn decode(bytes: &[u8]) -> Result<Self, TickFileError> {
        if bytes.len() < HEADER_LEN {
            return Err(TickFileError::CorruptHeader(format!(
                "{} bytes, need {HEADER_LEN}",
                bytes.len()
            )));
        }

        let mut buf = &bytes[..HEADER_LEN];
        let mut tag = [0u8; 4];
        buf.copy_to_slice(&mut tag);
        if !tag.iter().all(|b| b.is_ascii_graphic()) {
            return Err(TickFileError::CorruptHeader(format!(
                "tag {tag:02x?} is not printable ASCII"
            )));
        }

        let header_size = or_default(buf.get_u32_le(), HEADER_LEN);
        let record_size = or_default(buf.get_u32_le(), RECORD_LEN);
        let version = buf.get_u16_le();

        if (header_size as usize) < HEADER_LEN {
            return Err(TickFileError::CorruptHeader(format!(
                "header size {header_size} below {HEADER_LEN}"
            )));
        }
        if (record_size as usize) < RECORD_LEN {
            return Err(TickFileError::CorruptHeader(format!(
                "record size {record_size} below {RECORD_LEN}"
            )));
        }

        Ok(Self {
            tag,
            header_size,
            record_size,
            version,
        })
    }

    /// Encode into the 56-byte on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(&self.tag);
        buf.put_u32_le(self.header_size);
        buf.put_u32_le(self.record_size);
        buf.put_u16_le(self.version);
        out
    }

    /// Tag as text.
    #[must_use]
    pub fn tag_str(&self) -> &str {
        std::str::from_utf8(&self.tag).unwrap_or("????")
    }

    /// Complete records in a file of `file_len` bytes.
    #[must_use]
    pub fn record_count(&self, file_len: u64) -> u64 {
        file_len.saturating_sub(u64::from(self.header_size)) / u64::from(self.record_size)
    }

    /// Byte offset of record `index`, `None` past `u64::MAX`.
    #[must_use]
    pub fn record_offset(&self, index: u64) -> Option<u64> {
        index
            .checked_mul(u64::from(self.record_size))?
            .checked_add(u64::from(self.header_size))
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn or_default(value: u32, default: usize) -> u32 {
    if value == 0 { default as u32 } else { value }
}

// =============================================================================
// Records
// =============================================================================

/// Result of decoding a run of records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedRecords {
    /// Valid records, in file order.
    pub records: Vec<TickRecord>,
    /// Records skipped as corrupt.
    pub corrupt: u64,
    /// Index of the first record not consumed.
    pub next_index: u64,
}

/// Decoding options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderConfig {
    /// How the 8-byte time field is read.
    pub time_encoding: TimeEncoding,
    /// Records dated before this year are corrupt.
    pub min_year: i32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            time_encoding: TimeEncoding::default(),
            min_year: DEFAULT_MIN_YEAR,
        }
    }
}

/// Stateless decoder for tick file bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickFileDecoder {
    config: DecoderConfig,
}

impl TickFileDecoder {
    /// Create a decoder.
    #[must_use]
    pub const fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    /// Decoding options in use.
    #[must_use]
    pub const fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decode the header of a whole file.
    ///
    /// # Errors
    ///
    /// See [`TickFileHeader::decode`].
    pub fn decode_header(&self, bytes: &[u8]) -> Result<TickFileHeader, TickFileError> {
        TickFileHeader::decode(bytes)
    }

    /// Decode up to `count` records starting at `from_index`, reading from
    /// the bytes of a whole file.
    ///
    /// A partial trailing record is never decoded.
    #[must_use]
    pub fn decode_records(
        &self,
        bytes: &[u8],
        header: &TickFileHeader,
        from_index: u64,
        count: u64,
    ) -> DecodedRecords {
        let Some(start) = header
            .record_offset(from_index)
            .and_then(|offset| usize::try_from(offset).ok())
        else {
            return DecodedRecords {
                next_index: from_index,
                ..DecodedRecords::default()
            };
        };
        let block = bytes.get(start..).unwrap_or_default();
        let record_size = header.record_size as usize;
        let available = (block.len() / record_size) as u64;
        let take = usize::try_from(count.min(available)).unwrap_or(usize::MAX);
        let end = take.saturating_mul(record_size).min(block.len());
        self.decode_block(&block[..end], header, from_index)
    }

    /// Decode a byte range beginning at the record boundary of `first_index`.
    ///
    /// Trailing bytes short of a full record are ignored.
    #[must_use]
    pub fn decode_block(
        &self,
        block: &[u8],
        header: &TickFileHeader,
        first_index: u64,
    ) -> DecodedRecords {
        let record_size = header.record_size as usize;
        let mut decoded = DecodedRecords {
            records: Vec::with_capacity(block.len() / record_size),
            corrupt: 0,
            next_index: first_index,
        };

        for chunk in block.chunks_exact(record_size) {
            match self.decode_record(chunk) {
                Some(record) => decoded.records.push(record),
                None => decoded.corrupt += 1,
            }
            decoded.next_index += 1;
        }
        decoded
    }

    /// Decode one record, `None` when corrupt.
    #[must_use]
    pub fn decode_record(&self, bytes: &[u8]) -> Option<TickRecord> {
        if bytes.len() < RECORD_LEN {
            return None;
        }
        let mut buf = &bytes[..RECORD_LEN];
        let mut raw_time = [0u8; 8];
        buf.copy_to_slice(&mut raw_time);

        let open = f64::from(buf.get_f32_le());
        let high = f64::from(buf.get_f32_le());
        let low = f64::from(buf.get_f32_le());
        let close = f64::from(buf.get_f32_le());
        let num_trades = buf.get_u32_le();
        let total_volume = buf.get_u32_le();
        let bid_volume = buf.get_u32_le();
        let ask_volume = buf.get_u32_le();

        if !close.is_finite() || close <= 0.0 {
            return None;
        }
        let timestamp = self.config.time_encoding.decode_raw(raw_time)?;
        if timestamp.year() < self.config.min_year {
            return None;
        }

        Some(TickRecord {
            timestamp,
            open,
            high,
            low,
            close,
            num_trades,
            total_volume,
            bid_volume,
            ask_volume,
        })
    }
}

/// Encode a record into the 40-byte on-disk form.
///
/// Prices are narrowed to `f32`.
#[must_use]
pub fn encode_record(record: &TickRecord, encoding: TimeEncoding) -> [u8; RECORD_LEN] {
    let mut out = BytesMut::with_capacity(RECORD_LEN);
    out.put_slice(&encoding.encode_raw(record.timestamp));
    #[allow(clippy::cast_possible_truncation)]
    for price in [record.open, record.high, record.low, record.close] {
        out.put_f32_le(price as f32);
    }
    out.put_u32_le(record.num_trades);
    out.put_u32_le(record.total_volume);
    out.put_u32_le(record.bid_volume);
    out.put_u32_le(record.ask_volume);

    let mut fixed = [0u8; RECORD_LEN];
    fixed.copy_from_slice(&out);
    fixed
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn bar(at: DateTime<Utc>, close: f64) -> TickRecord {
        TickRecord {
            timestamp: at,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            num_trades: 3,
            total_volume: 10,
            bid_volume: 4,
            ask_volume: 6,
        }
    }

    fn new_year_2025() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().unwrap()
    }

    fn file(records: &[[u8; RECORD_LEN]]) -> Vec<u8> {
        let mut bytes = TickFileHeader::default().encode().to_vec();
        for record in records {
            bytes.extend_from_slice(record);
        }
        bytes
    }

    #[test]
    fn header_round_trips() {
        let header = TickFileHeader {
            version: 3,
            ..TickFileHeader::default()
        };
        let decoded = TickFileHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.tag_str(), "SCID");
    }

    #[test]
    fn zero_sizes_fall_back_to_defaults() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(b"SCID");
        let header = TickFileHeader::decode(&bytes).unwrap();
        assert_eq!(header.header_size, 56);
        assert_eq!(header.record_size, 40);
    }

    #[test_case(&[0u8; 20] ; "too short")]
    #[test_case(&[0u8; HEADER_LEN] ; "nul tag")]
    fn rejects_corrupt_header(bytes: &[u8]) {
        assert!(matches!(
            TickFileHeader::decode(bytes),
            Err(TickFileError::CorruptHeader(_))
        ));
    }

    #[test_case(8, 40 ; "header below minimum")]
    #[test_case(56, 12 ; "record below minimum")]
    fn rejects_undersized_layout(header_size: u32, record_size: u32) {
        let header = TickFileHeader {
            header_size,
            record_size,
            ..TickFileHeader::default()
        };
        assert!(TickFileHeader::decode(&header.encode()).is_err());
    }

    #[test]
    fn day_count_record_decodes_to_timestamp() {
        let mut raw = encode_record(&bar(new_year_2025(), 102.0), TimeEncoding::DayCount);
        raw[..8].copy_from_slice(&45_658.5_f64.to_le_bytes());

        let record = TickFileDecoder::default().decode_record(&raw).unwrap();
        assert_eq!(record.timestamp, new_year_2025());
        assert!((record.close - 102.0).abs() < f64::EPSILON);
        assert_eq!(record.total_volume, 10);
    }

    #[test]
    fn corrupt_records_are_skipped_and_counted() {
        let good = encode_record(&bar(new_year_2025(), 50.0), TimeEncoding::Microseconds);
        let zero_close = encode_record(&bar(new_year_2025(), 0.0), TimeEncoding::Microseconds);
        let ancient = encode_record(
            &bar(Utc.with_ymd_and_hms(1990, 5, 1, 0, 0, 0).single().unwrap(), 50.0),
            TimeEncoding::Microseconds,
        );
        let bytes = file(&[good, zero_close, ancient, good]);
        let header = TickFileHeader::decode(&bytes).unwrap();

        let decoded = TickFileDecoder::default().decode_records(&bytes, &header, 0, 10);
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.corrupt, 2);
        assert_eq!(decoded.next_index, 4);
    }

    #[test]
    fn partial_trailing_record_is_not_decoded() {
        let record = encode_record(&bar(new_year_2025(), 50.0), TimeEncoding::Microseconds);
        let mut bytes = file(&[record, record]);
        bytes.extend_from_slice(&record[..17]);
        let header = TickFileHeader::decode(&bytes).unwrap();

        assert_eq!(header.record_count(bytes.len() as u64), 2);
        let decoded = TickFileDecoder::default().decode_records(&bytes, &header, 1, 5);
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.next_index, 2);
    }

    #[test_case(u64::MAX / 8 ; "offset overflows")]
    #[test_case(u64::MAX ; "max index")]
    #[test_case(3 ; "past end of file")]
    fn out_of_range_index_decodes_nothing(from_index: u64) {
        let record = encode_record(&bar(new_year_2025(), 50.0), TimeEncoding::Microseconds);
        let bytes = file(&[record]);
        let header = TickFileHeader::decode(&bytes).unwrap();

        let decoded = TickFileDecoder::default().decode_records(&bytes, &header, from_index, 1);
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.corrupt, 0);
        assert_eq!(decoded.next_index, from_index);
    }

    #[test]
    fn record_offset_is_checked() {
        let header = TickFileHeader::default();
        assert_eq!(header.record_offset(2), Some(56 + 80));
        assert_eq!(header.record_offset(u64::MAX / 8), None);
    }

    #[test]
    fn wider_records_use_declared_size() {
        let header = TickFileHeader {
            record_size: 48,
            ..TickFileHeader::default()
        };
        let mut bytes = header.encode().to_vec();
        for close in [10.0, 20.0] {
            bytes.extend_from_slice(&encode_record(
                &bar(new_year_2025(), close),
                TimeEncoding::Microseconds,
            ));
            bytes.extend_from_slice(&[0xAA; 8]);
        }

        let header = TickFileHeader::decode(&bytes).unwrap();
        let decoded = TickFileDecoder::default().decode_records(&bytes, &header, 0, 2);
        let closes: Vec<f64> = decoded.records.iter().map(|r| r.close).collect();
        assert_eq!(closes, vec![10.0, 20.0]);
    }

    #[test]
    fn decode_block_starts_at_given_index() {
        let record = encode_record(&bar(new_year_2025(), 7.5), TimeEncoding::Microseconds);
        let decoded = TickFileDecoder::default().decode_block(
            &[record, record].concat(),
            &TickFileHeader::default(),
            40,
        );
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.next_index, 42);
    }

    proptest! {
        #[test]
        fn record_layout_round_trips(
            micros in 946_684_800_000_000_i64..4_102_444_800_000_000_i64,
            open in 0.01_f32..1.0e6,
            high in 0.01_f32..1.0e6,
            low in 0.01_f32..1.0e6,
            close in 0.01_f32..1.0e6,
            counts in any::<[u32; 4]>(),
        ) {
            let record = TickRecord {
                timestamp: DateTime::from_timestamp_micros(micros).unwrap(),
                open: f64::from(open),
                high: f64::from(high),
                low: f64::from(low),
                close: f64::from(close),
                num_trades: counts[0],
                total_volume: counts[1],
                bid_volume: counts[2],
                ask_volume: counts[3],
            };
            let bytes = encode_record(&record, TimeEncoding::Microseconds);
            let decoded = TickFileDecoder::default().decode_record(&bytes);
            prop_assert_eq!(decoded, Some(record));
        }
    }
}
