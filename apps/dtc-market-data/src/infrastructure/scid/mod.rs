//! Sierra Chart Tick Files
//!
//! Decoding, one-shot reading, directory inventory and live tailing of
//! `.scid` intraday files, the fallback price source when the protocol
//! refuses market data.

pub mod decoder;
pub mod inventory;
pub mod reader;
pub mod tailer;

pub use decoder::{
    DecodedRecords, DecoderConfig, TickFileDecoder, TickFileError, TickFileHeader, encode_record,
};
pub use inventory::TickFileSummary;
pub use reader::{TickFileReader, read_recent};
pub use tailer::{
    LiveFileTailer, StartPosition, TailEvent, TailerConfig, TailerControl, TailerHandle,
    tick_file_path,
};
