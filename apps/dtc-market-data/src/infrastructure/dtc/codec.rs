//! DTC Frame Codecs
//!
//! - **JSON framing** ([`JsonFrameCodec`]): each message is one JSON object
//!   followed by a single NUL byte. Bytes accumulate until a NUL arrives;
//!   the trailing fragment is kept for the next read.
//! - **Binary framing** ([`BinaryFrameCodec`]): a little-endian `u16` size
//!   (counting the whole frame, header included), a little-endian `u16` type
//!   code, then the payload. Only framing is handled; this client speaks JSON.
//!
//! A complete JSON frame that fails to parse is reported as a
//! [`CodecError`] item on the stream and dropped; decoding carries on with
//! the next frame. Partial input is never an error.
//!
//! Encoded frames always put `Type` first, which some DTC servers require.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::infrastructure::dtc::messages::{Message, MessageType};

/// Byte terminating every JSON frame.
pub const FRAME_TERMINATOR: u8 = 0;

/// Default cap on a single unterminated JSON frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;

/// Size of the binary frame header.
pub const BINARY_HEADER_LEN: usize = 4;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame parsed but is not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// Object has no `Type` member.
    #[error("frame has no Type field")]
    MissingType,

    /// `Type` member is neither a known name nor a `u16`.
    #[error("invalid Type field: {0}")]
    InvalidType(String),

    /// Too many bytes arrived without a terminator; the buffer was discarded.
    #[error("frame exceeds {max} bytes without terminator")]
    FrameTooLarge {
        /// Configured limit.
        max: usize,
    },

    /// Stream ended in the middle of a frame.
    #[error("stream ended with {len} bytes of an unterminated frame")]
    TruncatedFrame {
        /// Bytes discarded.
        len: usize,
    },

    /// Binary frame header declares an impossible size.
    #[error("binary frame declares size {0}")]
    InvalidBinarySize(usize),

    /// Underlying transport failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of decoding one complete frame.
pub type DecodedFrame = Result<Message, CodecError>;

// =============================================================================
// JSON Framing
// =============================================================================

/// NUL-delimited JSON codec.
///
/// Usable directly through [`JsonFrameCodec::feed`] or as a
/// `tokio_util::codec` implementation under `Framed`.
///
/// # Example
///
/// ```rust
/// use dtc_market_data::infrastructure::dtc::codec::JsonFrameCodec;
/// use dtc_market_data::infrastructure::dtc::messages::Message;
///
/// let mut codec = JsonFrameCodec::new();
/// let frames = codec.feed(b"{\"Type\":7,\"Encoding\":2}\0{\"Type\":3");
///
/// assert_eq!(frames.len(), 1);
/// assert!(matches!(frames[0], Ok(Message::EncodingResponse(_))));
/// assert_eq!(codec.pending(), b"{\"Type\":3");
/// ```
#[derive(Debug)]
pub struct JsonFrameCodec {
    max_frame_len: usize,
    buffer: BytesMut,
}

impl Default for JsonFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonFrameCodec {
    /// Create a codec with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a codec rejecting frames longer than `max_frame_len`.
    #[must_use]
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            buffer: BytesMut::new(),
        }
    }

    /// Append received bytes and decode every complete frame.
    ///
    /// Returns one entry per complete non-empty frame, in order. The
    /// trailing partial frame stays buffered.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DecodedFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut frames = Vec::new();
        while let Some(frame) = self.split_frame(&mut buffer) {
            frames.push(frame);
        }
        self.buffer = buffer;
        frames
    }

    /// Bytes buffered after the last terminator.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Encode a message with its terminator.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        encode_frame(message)
    }

    fn split_frame(&self, src: &mut BytesMut) -> Option<DecodedFrame> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == FRAME_TERMINATOR) else {
                if src.len() > self.max_frame_len {
                    src.clear();
                    return Some(Err(CodecError::FrameTooLarge {
                        max: self.max_frame_len,
                    }));
                }
                return None;
            };

            let frame = src.split_to(pos + 1);
            if pos > self.max_frame_len {
                return Some(Err(CodecError::FrameTooLarge {
                    max: self.max_frame_len,
                }));
            }
            let body = &frame[..pos];
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(decode_frame(body));
        }
    }
}

impl Decoder for JsonFrameCodec {
    type Item = DecodedFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.split_frame(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.split_frame(src) {
            return Ok(Some(frame));
        }
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return Ok(None);
        }
        let len = src.len();
        src.clear();
        Ok(Some(Err(CodecError::TruncatedFrame { len })))
    }
}

impl Encoder<Message> for JsonFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&encode_frame(&item)?);
        Ok(())
    }
}

/// Decode one frame body (without terminator).
///
/// # Errors
///
/// Returns an error if the body is not a JSON object with a usable `Type`.
pub fn decode_frame(body: &[u8]) -> DecodedFrame {
    let value: Value = serde_json::from_slice(body)?;
    let type_code = read_type(&value)?;

    let Some(ty) = MessageType::from_code(type_code) else {
        return Ok(Message::Unknown {
            type_code,
            body: value,
        });
    };

    let message = match ty {
        MessageType::LogonRequest => Message::LogonRequest(serde_json::from_value(value)?),
        MessageType::LogonResponse => Message::LogonResponse(serde_json::from_value(value)?),
        MessageType::Heartbeat => Message::Heartbeat(serde_json::from_value(value)?),
        MessageType::Logoff => Message::Logoff(serde_json::from_value(value)?),
        MessageType::EncodingRequest => Message::EncodingRequest(serde_json::from_value(value)?),
        MessageType::EncodingResponse => {
            Message::EncodingResponse(serde_json::from_value(value)?)
        }
        MessageType::MarketDataRequest => {
            Message::MarketDataRequest(serde_json::from_value(value)?)
        }
        MessageType::MarketDataReject => Message::MarketDataReject(serde_json::from_value(value)?),
        MessageType::MarketDataSnapshot => {
            Message::MarketDataSnapshot(serde_json::from_value(value)?)
        }
        MessageType::MarketDataUpdateTrade => {
            Message::MarketDataUpdateTrade(serde_json::from_value(value)?)
        }
        MessageType::MarketDataUpdateBidAsk => {
            Message::MarketDataUpdateBidAsk(serde_json::from_value(value)?)
        }
        MessageType::SecurityDefinitionForSymbolRequest => {
            Message::SecurityDefinitionForSymbolRequest(serde_json::from_value(value)?)
        }
        MessageType::SecurityDefinitionResponse => {
            Message::SecurityDefinitionResponse(serde_json::from_value(value)?)
        }
        MessageType::GeneralLogMessage => {
            Message::GeneralLogMessage(serde_json::from_value(value)?)
        }
        MessageType::HistoricalPriceDataRequest => {
            Message::HistoricalPriceDataRequest(serde_json::from_value(value)?)
        }
        MessageType::HistoricalPriceDataResponseHeader => {
            Message::HistoricalPriceDataResponseHeader(serde_json::from_value(value)?)
        }
        MessageType::HistoricalPriceDataReject => {
            Message::HistoricalPriceDataReject(serde_json::from_value(value)?)
        }
        MessageType::HistoricalPriceDataRecordResponse => {
            Message::HistoricalPriceDataRecordResponse(serde_json::from_value(value)?)
        }
        MessageType::HistoricalPriceDataFinal => {
            Message::HistoricalPriceDataFinal(serde_json::from_value(value)?)
        }
    };
    Ok(message)
}

fn read_type(value: &Value) -> Result<u16, CodecError> {
    let Value::Object(map) = value else {
        return Err(CodecError::NotAnObject);
    };
    match map.get("Type") {
        None | Some(Value::Null) => Err(CodecError::MissingType),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|code| u16::try_from(code).ok())
            .ok_or_else(|| CodecError::InvalidType(n.to_string())),
        Some(Value::String(s)) => s
            .parse::<u16>()
            .ok()
            .or_else(|| MessageType::from_name(s).map(MessageType::code))
            .ok_or_else(|| CodecError::InvalidType(s.clone())),
        Some(other) => Err(CodecError::InvalidType(other.to_string())),
    }
}

/// Encode a message as `{"Type":N,...}` followed by the terminator.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, CodecError> {
    let body = match message {
        Message::LogonRequest(m) => serde_json::to_value(m)?,
        Message::LogonResponse(m) => serde_json::to_value(m)?,
        Message::Heartbeat(m) => serde_json::to_value(m)?,
        Message::Logoff(m) => serde_json::to_value(m)?,
        Message::EncodingRequest(m) => serde_json::to_value(m)?,
        Message::EncodingResponse(m) => serde_json::to_value(m)?,
        Message::MarketDataRequest(m) => serde_json::to_value(m)?,
        Message::MarketDataReject(m) => serde_json::to_value(m)?,
        Message::MarketDataSnapshot(m) => serde_json::to_value(m)?,
        Message::MarketDataUpdateTrade(m) => serde_json::to_value(m)?,
        Message::MarketDataUpdateBidAsk(m) => serde_json::to_value(m)?,
        Message::SecurityDefinitionForSymbolRequest(m) => serde_json::to_value(m)?,
        Message::SecurityDefinitionResponse(m) => serde_json::to_value(m)?,
        Message::GeneralLogMessage(m) => serde_json::to_value(m)?,
        Message::HistoricalPriceDataRequest(m) => serde_json::to_value(m)?,
        Message::HistoricalPriceDataResponseHeader(m) => serde_json::to_value(m)?,
        Message::HistoricalPriceDataReject(m) => serde_json::to_value(m)?,
        Message::HistoricalPriceDataRecordResponse(m) => serde_json::to_value(m)?,
        Message::HistoricalPriceDataFinal(m) => serde_json::to_value(m)?,
        Message::Unknown { body, .. } => body.clone(),
    };
    let Value::Object(fields) = body else {
        return Err(CodecError::NotAnObject);
    };

    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(b"{\"Type\":");
    out.extend_from_slice(message.type_code().to_string().as_bytes());
    for (key, value) in &fields {
        if key == "Type" {
            continue;
        }
        out.push(b',');
        serde_json::to_writer(&mut out, key)?;
        out.push(b':');
        serde_json::to_writer(&mut out, value)?;
    }
    out.push(b'}');
    out.push(FRAME_TERMINATOR);
    Ok(out)
}

// =============================================================================
// Binary Framing
// =============================================================================

/// One binary-framed message, payload undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    /// Wire type code.
    pub type_code: u16,
    /// Bytes after the 4-byte header.
    pub payload: Bytes,
}

impl BinaryFrame {
    /// Modelled type, if known.
    #[must_use]
    pub const fn message_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.type_code)
    }
}

/// Size/type prefixed binary framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryFrameCodec;

impl Decoder for BinaryFrameCodec {
    type Item = BinaryFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < BINARY_HEADER_LEN {
            return Ok(None);
        }
        let size = usize::from(u16::from_le_bytes([src[0], src[1]]));
        if size < BINARY_HEADER_LEN {
            return Err(CodecError::InvalidBinarySize(size));
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(size);
        let type_code = u16::from_le_bytes([frame[2], frame[3]]);
        frame.advance(BINARY_HEADER_LEN);
        Ok(Some(BinaryFrame {
            type_code,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<BinaryFrame> for BinaryFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: BinaryFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.payload.len() + BINARY_HEADER_LEN;
        let size_u16 = u16::try_from(size).map_err(|_| CodecError::FrameTooLarge {
            max: usize::from(u16::MAX),
        })?;
        dst.reserve(size);
        dst.put_u16_le(size_u16);
        dst.put_u16_le(item.type_code);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
