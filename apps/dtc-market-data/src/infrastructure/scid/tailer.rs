//! Live File Tailer
//!
//! Polls a tick file that Sierra Chart keeps appending to and emits each new
//! complete record once, in order.
//!
//! # Poll Cycle
//!
//! | Observed size | Action |
//! |---------------|--------|
//! | smaller than last | rotation: reset to 0, resync from the header |
//! | larger than last | decode the complete records after the last index |
//! | unchanged | nothing |
//!
//! The file is opened, read and closed on every poll so the writer is never
//! blocked. Access faults are reported once per transition; polling keeps
//! going and a later success emits [`TailEvent::Recovered`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::decoder::{
    DecodedRecords, DecoderConfig, HEADER_LEN, TickFileDecoder, TickFileError, TickFileHeader,
};
use super::reader::read_records;
use crate::domain::market_data::TickRecord;
use crate::infrastructure::metrics;

/// Default delay between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Tick file for `symbol` under `data_dir`.
#[must_use]
pub fn tick_file_path(data_dir: &Path, symbol: &str) -> PathBuf {
    data_dir.join(format!("{symbol}.scid"))
}

/// Where tailing begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Emit every record already in the file.
    Beginning,
    /// Skip existing records; only emit what is appended.
    #[default]
    End,
}

/// Tailer configuration.
#[derive(Debug, Clone, Copy)]
pub struct TailerConfig {
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Where tailing begins.
    pub start: StartPosition,
    /// Record decoding options.
    pub decoder: DecoderConfig,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            start: StartPosition::default(),
            decoder: DecoderConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Something the tailer observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TailEvent {
    /// A new complete record.
    Record(TickRecord),
    /// The file shrank; tailing restarted from its beginning.
    Rotated {
        /// Size before.
        previous_len: u64,
        /// Size now.
        len: u64,
    },
    /// The file could not be read.
    Fault {
        /// Short label (`not_found`, `access`, `corrupt_header`).
        kind: &'static str,
        /// Error text.
        message: String,
    },
    /// The file is readable again after a fault.
    Recovered,
}

// =============================================================================
// Tailer
// =============================================================================

/// Polling state for one tick file.
#[derive(Debug)]
pub struct LiveFileTailer {
    path: PathBuf,
    config: TailerConfig,
    decoder: TickFileDecoder,
    header: Option<TickFileHeader>,
    last_len: u64,
    next_index: u64,
    last_record: Option<TickRecord>,
    fault: Option<&'static str>,
    primed: bool,
}

impl LiveFileTailer {
    /// Tail the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, config: TailerConfig) -> Self {
        Self {
            path: path.into(),
            decoder: TickFileDecoder::new(config.decoder),
            primed: config.start == StartPosition::Beginning,
            config,
            header: None,
            last_len: 0,
            next_index: 0,
            last_record: None,
            fault: None,
        }
    }

    /// File being tailed.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recent valid record seen, including the one found when priming.
    #[must_use]
    pub const fn last_record(&self) -> Option<&TickRecord> {
        self.last_record.as_ref()
    }

    /// Index of the next record to decode.
    #[must_use]
    pub const fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Size observed by the last successful poll.
    #[must_use]
    pub const fn last_len(&self) -> u64 {
        self.last_len
    }

    /// Check the file once.
    pub async fn poll(&mut self) -> Vec<TailEvent> {
        let mut events = Vec::new();
        match self.read_new(&mut events).await {
            Ok(()) => {
                if self.fault.take().is_some() {
                    tracing::info!(path = %self.path.display(), "Tick file readable again");
                    events.insert(0, TailEvent::Recovered);
                }
            }
            Err(err) => self.report_fault(&err, &mut events),
        }
        events
    }

    async fn read_new(&mut self, events: &mut Vec<TailEvent>) -> Result<(), TickFileError> {
        let io_err = |source| TickFileError::from_io(self.path.clone(), source);

        let len = tokio::fs::metadata(&self.path).await.map_err(io_err)?.len();
        if len < self.last_len {
            tracing::info!(
                path = %self.path.display(),
                previous_len = self.last_len,
                len,
                "Tick file rotated"
            );
            events.push(TailEvent::Rotated {
                previous_len: self.last_len,
                len,
            });
            self.header = None;
            self.last_len = 0;
            self.next_index = 0;
        }
        if len == self.last_len || len < HEADER_LEN as u64 {
            return Ok(());
        }

        let mut file = File::open(&self.path).await.map_err(io_err)?;
        let header = match self.header {
            Some(header) => header,
            None => {
                let mut bytes = [0u8; HEADER_LEN];
                file.read_exact(&mut bytes).await.map_err(io_err)?;
                let header = self.decoder.decode_header(&bytes)?;
                self.header = Some(header);
                header
            }
        };

        let total = header.record_count(len);
        if !self.primed {
            self.primed = true;
            self.next_index = total;
            self.last_len = len;
            if total > 0 {
                let last = self.read_range(&mut file, &header, total - 1, 1).await?;
                self.last_record = last.records.last().copied();
            }
            tracing::debug!(
                path = %self.path.display(),
                records = total,
                "Tailer primed at end of file"
            );
            return Ok(());
        }

        if total > self.next_index {
            let count = total - self.next_index;
            let decoded = self.read_range(&mut file, &header, self.next_index, count).await?;

            metrics::record_tick_records(decoded.records.len() as u64);
            if decoded.corrupt > 0 {
                tracing::debug!(
                    path = %self.path.display(),
                    corrupt = decoded.corrupt,
                    "Skipped corrupt tick records"
                );
            }

            self.next_index = decoded.next_index;
            if let Some(last) = decoded.records.last() {
                self.last_record = Some(*last);
            }
            events.extend(decoded.records.into_iter().map(TailEvent::Record));
        }
        self.last_len = len;
        Ok(())
    }

    async fn read_range(
        &self,
        file: &mut File,
        header: &TickFileHeader,
        from_index: u64,
        count: u64,
    ) -> Result<DecodedRecords, TickFileError> {
        read_records(file, &self.path, &self.decoder, header, from_index, count).await
    }

    fn report_fault(&mut self, err: &TickFileError, events: &mut Vec<TailEvent>) {
        let kind = err.kind();
        if self.fault == Some(kind) {
            return;
        }
        self.fault = Some(kind);
        metrics::record_tailer_fault(kind);
        tracing::warn!(path = %self.path.display(), error = %err, "Tick file unavailable");
        events.push(TailEvent::Fault {
            kind,
            message: err.to_string(),
        });
    }

    /// Run the poll loop on its own task.
    #[must_use]
    pub fn spawn(self) -> TailerHandle {
        let (tx, rx) = mpsc::channel(self.config.event_capacity.max(1));
        let cancel = CancellationToken::new();
        let last_record = Arc::new(RwLock::new(self.last_record));
        let control = TailerControl {
            path: Arc::from(self.path.as_path()),
            cancel: cancel.clone(),
            last_record: last_record.clone(),
        };

        let task = tokio::spawn(self.run(tx, cancel, last_record));
        TailerHandle {
            events: rx,
            control,
            task,
        }
    }

    async fn run(
        mut self,
        tx: mpsc::Sender<TailEvent>,
        cancel: CancellationToken,
        last_record: Arc<RwLock<Option<TickRecord>>>,
    ) {
        tracing::info!(
            path = %self.path.display(),
            interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Tailer started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'poll: loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let events = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                events = self.poll() => events,
            };
            *last_record.write() = self.last_record;

            for event in events {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break 'poll,
                    sent = tx.send(event) => if sent.is_err() { break 'poll },
                }
            }
        }
        tracing::info!(path = %self.path.display(), "Tailer stopped");
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable stop switch and status of a running tailer.
#[derive(Debug, Clone)]
pub struct TailerControl {
    path: Arc<Path>,
    cancel: CancellationToken,
    last_record: Arc<RwLock<Option<TickRecord>>>,
}

impl TailerControl {
    /// Stop polling now.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether [`TailerControl::stop`] was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// File being tailed.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recent valid record seen.
    #[must_use]
    pub fn last_record(&self) -> Option<TickRecord> {
        *self.last_record.read()
    }
}

/// Owner side of a running tailer. Dropping it stops the tailer.
#[derive(Debug)]
pub struct TailerHandle {
    events: mpsc::Receiver<TailEvent>,
    control: TailerControl,
    task: JoinHandle<()>,
}

impl TailerHandle {
    /// Next event; `None` once stopped.
    pub async fn recv(&mut self) -> Option<TailEvent> {
        self.events.recv().await
    }

    /// Stop switch that can outlive borrowing the handle.
    #[must_use]
    pub fn control(&self) -> TailerControl {
        self.control.clone()
    }

    /// Stop polling now.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Whether the poll task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TailerHandle {
    fn drop(&mut self) {
        self.control.stop();
    }
}
