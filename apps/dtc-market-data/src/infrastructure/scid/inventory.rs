//! Tick File Inventory
//!
//! Lists the `.scid` files in a data directory with what each one holds:
//! record count, first and last valid record, and the price range of the
//! most recent records.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::decoder::TickFileError;
use super::reader::TickFileReader;
use crate::domain::market_data::TickRecord;

/// Leading records searched for the first valid one.
const FIRST_RECORD_PROBE: u64 = 16;

/// Trailing records used for the last record and the price range.
pub const SUMMARY_SAMPLE: u64 = 1000;

/// What one tick file holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickFileSummary {
    /// File stem, the symbol Sierra Chart stores it under.
    pub symbol: String,
    /// Full path.
    pub path: PathBuf,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Complete records, valid or not.
    pub records: u64,
    /// Oldest valid record near the start of the file.
    pub first: Option<TickRecord>,
    /// Newest valid record.
    pub last: Option<TickRecord>,
    /// Highest high over the trailing sample.
    pub high: Option<f64>,
    /// Lowest low over the trailing sample.
    pub low: Option<f64>,
    /// Last modification time.
    pub modified: Option<DateTime<Utc>>,
}

impl TickFileSummary {
    /// Close of the newest valid record.
    #[must_use]
    pub fn last_price(&self) -> Option<f64> {
        self.last.map(|r| r.close)
    }

    /// Time span between first and last valid record.
    #[must_use]
    pub fn span(&self) -> Option<chrono::Duration> {
        Some(self.last?.timestamp - self.first?.timestamp)
    }
}

impl TickFileReader {
    /// Summarize the tick file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`TickFileError`] when the file is missing, unreadable, or
    /// its header is corrupt.
    pub async fn summarize(&self, path: &Path) -> Result<TickFileSummary, TickFileError> {
        let mut open = self.open(path).await?;
        let modified = open
            .file
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        let records = open.record_count();

        let head = self
            .read_range(&mut open, path, 0, records.min(FIRST_RECORD_PROBE))
            .await?;
        let sample_from = records.saturating_sub(SUMMARY_SAMPLE);
        let tail = self
            .read_range(&mut open, path, sample_from, records - sample_from)
            .await?;

        let high = tail.records.iter().map(|r| r.high).reduce(f64::max);
        let low = tail.records.iter().map(|r| r.low).reduce(f64::min);

        Ok(TickFileSummary {
            symbol: symbol_of(path),
            path: path.to_path_buf(),
            size_bytes: open.len,
            records,
            first: head.records.first().or_else(|| tail.records.first()).copied(),
            last: tail.records.last().copied(),
            high,
            low,
            modified,
        })
    }

    /// Summarize every `.scid` file in `dir`, sorted by symbol.
    ///
    /// Files that cannot be read are logged and left out.
    ///
    /// # Errors
    ///
    /// Returns [`TickFileError`] when `dir` itself cannot be listed.
    pub async fn scan_directory(&self, dir: &Path) -> Result<Vec<TickFileSummary>, TickFileError> {
        let io_err = |source| TickFileError::from_io(dir.to_path_buf(), source);

        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if !is_tick_file(&path) {
                continue;
            }
            match self.summarize(&path).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable tick file");
                }
            }
        }

        summaries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        tracing::debug!(dir = %dir.display(), files = summaries.len(), "Tick files scanned");
        Ok(summaries)
    }
}

fn is_tick_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("scid"))
}

fn symbol_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domain::time::TimeEncoding;
    use crate::infrastructure::scid::decoder::{TickFileHeader, encode_record};

    fn bar(day: u32, close: f64) -> TickRecord {
        TickRecord {
            timestamp: Utc.with_ymd_and_hms(2025, 7, day, 14, 0, 0).single().unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            num_trades: 1,
            total_volume: 1,
            bid_volume: 0,
            ask_volume: 1,
        }
    }

    fn write(dir: &Path, name: &str, bars: &[TickRecord]) {
        let mut bytes = TickFileHeader::default().encode().to_vec();
        for bar in bars {
            bytes.extend_from_slice(&encode_record(bar, TimeEncoding::Microseconds));
        }
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[tokio::test]
    async fn summary_covers_first_last_and_range() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "ESZ25.scid",
            &[bar(1, 0.0), bar(2, 6000.0), bar(3, 6100.0), bar(4, 6050.0)],
        );

        let summary = TickFileReader::default()
            .summarize(&dir.path().join("ESZ25.scid"))
            .await
            .unwrap();
        assert_eq!(summary.symbol, "ESZ25");
        assert_eq!(summary.records, 4);
        assert_eq!(summary.size_bytes, 56 + 4 * 40);
        assert_eq!(summary.first.map(|r| r.close), Some(6000.0));
        assert_eq!(summary.last_price(), Some(6050.0));
        assert_eq!(summary.high, Some(6101.0));
        assert_eq!(summary.low, Some(5999.0));
        assert_eq!(summary.span(), Some(chrono::Duration::days(2)));
        assert!(summary.modified.is_some());
    }

    #[tokio::test]
    async fn empty_file_has_no_records() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "CLZ25.scid", &[]);

        let summary = TickFileReader::default()
            .summarize(&dir.path().join("CLZ25.scid"))
            .await
            .unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(summary.last, None);
        assert_eq!(summary.high, None);
        assert_eq!(summary.span(), None);
    }

    #[tokio::test]
    async fn scan_lists_tick_files_sorted_and_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "NQZ25.scid", &[bar(1, 21_000.0)]);
        write(dir.path(), "ESZ25.SCID", &[bar(1, 6000.0), bar(2, 6001.0)]);
        std::fs::write(dir.path().join("BROKEN.scid"), b"SC").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not a tick file").unwrap();

        let summaries = TickFileReader::default()
            .scan_directory(dir.path())
            .await
            .unwrap();
        let symbols: Vec<&str> = summaries.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["ESZ25", "NQZ25"]);
        assert_eq!(summaries[0].records, 2);
        assert_eq!(summaries[1].last_price(), Some(21_000.0));
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = TickFileReader::default()
            .scan_directory(&dir.path().join("absent"))
            .await;
        assert!(matches!(result, Err(TickFileError::NotFound { .. })));
    }
}
