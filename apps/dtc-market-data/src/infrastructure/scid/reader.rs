//! Tick File Reader
//!
//! One-shot reads of tick files already on disk: the newest records, the
//! last price, or an arbitrary index range. Unlike the tailer, nothing is
//! remembered between calls.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use super::decoder::{
    DecodedRecords, DecoderConfig, HEADER_LEN, TickFileDecoder, TickFileError, TickFileHeader,
};
use crate::domain::market_data::TickRecord;
use crate::infrastructure::metrics::{self, RecordSource};

/// Reads whole tick files with one decoder configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickFileReader {
    decoder: TickFileDecoder,
}

/// An open tick file with its decoded header.
pub(crate) struct OpenTickFile {
    pub file: File,
    pub header: TickFileHeader,
    pub len: u64,
}

impl OpenTickFile {
    pub fn record_count(&self) -> u64 {
        self.header.record_count(self.len)
    }
}

impl TickFileReader {
    /// Create a reader.
    #[must_use]
    pub const fn new(config: DecoderConfig) -> Self {
        Self {
            decoder: TickFileDecoder::new(config),
        }
    }

    /// Up to `count` of the newest valid records, oldest first.
    ///
    /// Corrupt records are skipped, so the window is widened until `count`
    /// valid records are found or the start of the file is reached.
    ///
    /// # Errors
    ///
    /// Returns [`TickFileError`] when the file is missing, unreadable, or
    /// its header is corrupt.
    pub async fn read_recent(
        &self,
        path: &Path,
        count: usize,
    ) -> Result<Vec<TickRecord>, TickFileError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut open = self.open(path).await?;
        let total = open.record_count();
        let mut window = u64::try_from(count).unwrap_or(u64::MAX);

        loop {
            let from = total.saturating_sub(window);
            let mut decoded = self.read_range(&mut open, path, from, total - from).await?;
            if decoded.records.len() >= count || from == 0 {
                let skip = decoded.records.len().saturating_sub(count);
                return Ok(decoded.records.split_off(skip));
            }
            window = window.saturating_mul(2);
        }
    }

    /// Newest valid record, if any.
    ///
    /// # Errors
    ///
    /// Same as [`TickFileReader::read_recent`].
    pub async fn last_record(&self, path: &Path) -> Result<Option<TickRecord>, TickFileError> {
        Ok(self.read_recent(path, 1).await?.pop())
    }

    /// Close of the newest valid record.
    ///
    /// # Errors
    ///
    /// Same as [`TickFileReader::read_recent`].
    pub async fn last_price(&self, path: &Path) -> Result<Option<f64>, TickFileError> {
        Ok(self.last_record(path).await?.map(|r| r.close))
    }

    /// Decode up to `count` records starting at `from_index`.
    ///
    /// # Errors
    ///
    /// Same as [`TickFileReader::read_recent`].
    pub async fn read_records(
        &self,
        path: &Path,
        from_index: u64,
        count: u64,
    ) -> Result<DecodedRecords, TickFileError> {
        let mut open = self.open(path).await?;
        let count = count.min(open.record_count().saturating_sub(from_index));
        self.read_range(&mut open, path, from_index, count).await
    }

    pub(crate) async fn open(&self, path: &Path) -> Result<OpenTickFile, TickFileError> {
        let io_err = |source| TickFileError::from_io(path.to_path_buf(), source);

        let mut file = File::open(path).await.map_err(io_err)?;
        let len = file.metadata().await.map_err(io_err)?.len();
        let header = read_header(&mut file, path, &self.decoder, len).await?;
        Ok(OpenTickFile { file, header, len })
    }

    pub(crate) async fn read_range(
        &self,
        open: &mut OpenTickFile,
        path: &Path,
        from_index: u64,
        count: u64,
    ) -> Result<DecodedRecords, TickFileError> {
        read_records(&mut open.file, path, &self.decoder, &open.header, from_index, count).await
    }
}

/// Read and decode the header of a file of `len` bytes.
pub(crate) async fn read_header(
    file: &mut File,
    path: &Path,
    decoder: &TickFileDecoder,
    len: u64,
) -> Result<TickFileHeader, TickFileError> {
    let available = usize::try_from(len).map_or(HEADER_LEN, |len| len.min(HEADER_LEN));
    let mut bytes = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0))
        .await
        .map_err(|source| TickFileError::from_io(path.to_path_buf(), source))?;
    file.read_exact(&mut bytes[..available])
        .await
        .map_err(|source| TickFileError::from_io(path.to_path_buf(), source))?;
    decoder.decode_header(&bytes[..available])
}

/// Decode `count` records from `from_index`. The file must hold them all.
pub(crate) async fn read_records(
    file: &mut File,
    path: &Path,
    decoder: &TickFileDecoder,
    header: &TickFileHeader,
    from_index: u64,
    count: u64,
) -> Result<DecodedRecords, TickFileError> {
    if count == 0 {
        return Ok(DecodedRecords {
            next_index: from_index,
            ..DecodedRecords::default()
        });
    }
    let io_err = |source| TickFileError::from_io(path.to_path_buf(), source);
    let too_large = || TickFileError::CorruptHeader(format!("range of {count} records too large"));

    let len = count
        .checked_mul(u64::from(header.record_size))
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(too_large)?;
    let offset = header.record_offset(from_index).ok_or_else(too_large)?;

    file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
    let mut block = vec![0u8; len];
    file.read_exact(&mut block).await.map_err(io_err)?;

    let decoded = decoder.decode_block(&block, header, from_index);
    metrics::record_corrupt_records(RecordSource::TickFile, decoded.corrupt);
    Ok(decoded)
}

/// Up to `count` of the newest valid records in `path`, using default
/// decoding options.
///
/// # Errors
///
/// See [`TickFileReader::read_recent`].
pub async fn read_recent(path: &Path, count: usize) -> Result<Vec<TickRecord>, TickFileError> {
    TickFileReader::default().read_recent(path, count).await
}
