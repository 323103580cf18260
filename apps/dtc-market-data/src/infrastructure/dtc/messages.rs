//! DTC Message Types
//!
//! Wire types for the JSON encoding of the Data and Trading Communications
//! protocol as spoken by Sierra Chart. Every message is a JSON object with a
//! numeric `Type` field; field names are `PascalCase` with `ID` suffixes in
//! upper case.
//!
//! # Message Types
//!
//! ## Session
//! - `LogonRequest` (1) / `LogonResponse` (2)
//! - `Heartbeat` (3), `Logoff` (5)
//! - `EncodingRequest` (6) / `EncodingResponse` (7)
//!
//! ## Market Data
//! - `MarketDataRequest` (101), `MarketDataReject` (103)
//! - `MarketDataSnapshot` (104)
//! - `MarketDataUpdateTrade` (107), `MarketDataUpdateBidAsk` (108)
//!
//! ## Security Definitions
//! - `SecurityDefinitionForSymbolRequest` (506) / `SecurityDefinitionResponse` (507)
//!
//! ## Historical Price Data
//! - `HistoricalPriceDataRequest` (800)
//! - `HistoricalPriceDataResponseHeader` (801), `HistoricalPriceDataReject` (802)
//! - `HistoricalPriceDataRecordResponse` (803), `HistoricalPriceDataFinal` (804)
//!
//! ## Misc
//! - `GeneralLogMessage` (701)
//!
//! Boolean fields arrive as `0`/`1` from Sierra Chart and as `true`/`false`
//! from some other servers; both are accepted.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Protocol version sent in encoding and logon requests.
pub const PROTOCOL_VERSION: i32 = 8;

/// Protocol type sent in encoding requests.
pub const PROTOCOL_TYPE: &str = "DTC";

// =============================================================================
// Type Codes
// =============================================================================

/// DTC message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Client credentials.
    LogonRequest,
    /// Logon verdict and server capabilities.
    LogonResponse,
    /// Keep-alive, both directions.
    Heartbeat,
    /// Orderly disconnect.
    Logoff,
    /// Desired encoding.
    EncodingRequest,
    /// Accepted encoding.
    EncodingResponse,
    /// Subscribe/unsubscribe/snapshot request.
    MarketDataRequest,
    /// Market data refused for a symbol id.
    MarketDataReject,
    /// Full market state for a symbol id.
    MarketDataSnapshot,
    /// Trade print.
    MarketDataUpdateTrade,
    /// Top of book change.
    MarketDataUpdateBidAsk,
    /// Security definition lookup.
    SecurityDefinitionForSymbolRequest,
    /// Security definition result.
    SecurityDefinitionResponse,
    /// Free-form server log line.
    GeneralLogMessage,
    /// Historical bars request.
    HistoricalPriceDataRequest,
    /// Historical stream header.
    HistoricalPriceDataResponseHeader,
    /// Historical request refused.
    HistoricalPriceDataReject,
    /// One historical bar.
    HistoricalPriceDataRecordResponse,
    /// End of a historical stream.
    HistoricalPriceDataFinal,
}

impl MessageType {
    /// Every supported type.
    pub const ALL: [Self; 19] = [
        Self::LogonRequest,
        Self::LogonResponse,
        Self::Heartbeat,
        Self::Logoff,
        Self::EncodingRequest,
        Self::EncodingResponse,
        Self::MarketDataRequest,
        Self::MarketDataReject,
        Self::MarketDataSnapshot,
        Self::MarketDataUpdateTrade,
        Self::MarketDataUpdateBidAsk,
        Self::SecurityDefinitionForSymbolRequest,
        Self::SecurityDefinitionResponse,
        Self::GeneralLogMessage,
        Self::HistoricalPriceDataRequest,
        Self::HistoricalPriceDataResponseHeader,
        Self::HistoricalPriceDataReject,
        Self::HistoricalPriceDataRecordResponse,
        Self::HistoricalPriceDataFinal,
    ];

    /// Numeric wire code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::LogonRequest => 1,
            Self::LogonResponse => 2,
            Self::Heartbeat => 3,
            Self::Logoff => 5,
            Self::EncodingRequest => 6,
            Self::EncodingResponse => 7,
            Self::MarketDataRequest => 101,
            Self::MarketDataReject => 103,
            Self::MarketDataSnapshot => 104,
            Self::MarketDataUpdateTrade => 107,
            Self::MarketDataUpdateBidAsk => 108,
            Self::SecurityDefinitionForSymbolRequest => 506,
            Self::SecurityDefinitionResponse => 507,
            Self::GeneralLogMessage => 701,
            Self::HistoricalPriceDataRequest => 800,
            Self::HistoricalPriceDataResponseHeader => 801,
            Self::HistoricalPriceDataReject => 802,
            Self::HistoricalPriceDataRecordResponse => 803,
            Self::HistoricalPriceDataFinal => 804,
        }
    }

    /// Look up a type by wire code.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        let found = match code {
            1 => Self::LogonRequest,
            2 => Self::LogonResponse,
            3 => Self::Heartbeat,
            5 => Self::Logoff,
            6 => Self::EncodingRequest,
            7 => Self::EncodingResponse,
            101 => Self::MarketDataRequest,
            103 => Self::MarketDataReject,
            104 => Self::MarketDataSnapshot,
            107 => Self::MarketDataUpdateTrade,
            108 => Self::MarketDataUpdateBidAsk,
            506 => Self::SecurityDefinitionForSymbolRequest,
            507 => Self::SecurityDefinitionResponse,
            701 => Self::GeneralLogMessage,
            800 => Self::HistoricalPriceDataRequest,
            801 => Self::HistoricalPriceDataResponseHeader,
            802 => Self::HistoricalPriceDataReject,
            803 => Self::HistoricalPriceDataRecordResponse,
            804 => Self::HistoricalPriceDataFinal,
            _ => return None,
        };
        Some(found)
    }

    /// Message name as used in string-typed frames.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::LogonRequest => "LogonRequest",
            Self::LogonResponse => "LogonResponse",
            Self::Heartbeat => "Heartbeat",
            Self::Logoff => "Logoff",
            Self::EncodingRequest => "EncodingRequest",
            Self::EncodingResponse => "EncodingResponse",
            Self::MarketDataRequest => "MarketDataRequest",
            Self::MarketDataReject => "MarketDataReject",
            Self::MarketDataSnapshot => "MarketDataSnapshot",
            Self::MarketDataUpdateTrade => "MarketDataUpdateTrade",
            Self::MarketDataUpdateBidAsk => "MarketDataUpdateBidAsk",
            Self::SecurityDefinitionForSymbolRequest => "SecurityDefinitionForSymbolRequest",
            Self::SecurityDefinitionResponse => "SecurityDefinitionResponse",
            Self::GeneralLogMessage => "GeneralLogMessage",
            Self::HistoricalPriceDataRequest => "HistoricalPriceDataRequest",
            Self::HistoricalPriceDataResponseHeader => "HistoricalPriceDataResponseHeader",
            Self::HistoricalPriceDataReject => "HistoricalPriceDataReject",
            Self::HistoricalPriceDataRecordResponse => "HistoricalPriceDataRecordResponse",
            Self::HistoricalPriceDataFinal => "HistoricalPriceDataFinal",
        }
    }

    /// Look up a type by name.
    ///
    /// Accepts `LogonResponse`, `logonresponse` and `LOGON_RESPONSE`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self::ALL
            .into_iter()
            .find(|ty| ty.name().eq_ignore_ascii_case(&normalized))
    }
}

// =============================================================================
// Enumerated Fields
// =============================================================================

/// Encoding identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum EncodingKind {
    /// Fixed-layout binary.
    Binary,
    /// Binary with variable-length strings.
    BinaryVls,
    /// JSON objects, NUL terminated.
    #[default]
    Json,
    /// JSON arrays, NUL terminated.
    JsonCompact,
    /// Protocol buffers.
    Protobuf,
    /// Unrecognized id.
    Other(i32),
}

impl From<i32> for EncodingKind {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Binary,
            1 => Self::BinaryVls,
            2 => Self::Json,
            3 => Self::JsonCompact,
            4 => Self::Protobuf,
            other => Self::Other(other),
        }
    }
}

impl From<EncodingKind> for i32 {
    fn from(value: EncodingKind) -> Self {
        match value {
            EncodingKind::Binary => 0,
            EncodingKind::BinaryVls => 1,
            EncodingKind::Json => 2,
            EncodingKind::JsonCompact => 3,
            EncodingKind::Protobuf => 4,
            EncodingKind::Other(other) => other,
        }
    }
}

/// Market data request action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum RequestAction {
    /// Start streaming.
    Subscribe,
    /// Stop streaming.
    Unsubscribe,
    /// One snapshot, no stream.
    Snapshot,
}

impl TryFrom<i32> for RequestAction {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Subscribe),
            2 => Ok(Self::Unsubscribe),
            3 => Ok(Self::Snapshot),
            other => Err(format!("unknown request action {other}")),
        }
    }
}

impl From<RequestAction> for i32 {
    fn from(value: RequestAction) -> Self {
        match value {
            RequestAction::Subscribe => 1,
            RequestAction::Unsubscribe => 2,
            RequestAction::Snapshot => 3,
        }
    }
}

/// Logon result code for success.
pub const LOGON_SUCCESS: i32 = 1;

/// Logon result some servers send for success.
pub const LOGON_SUCCESS_ALT: i32 = 0;

// =============================================================================
// Session Messages
// =============================================================================

/// Encoding negotiation request (6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncodingRequest {
    /// Protocol version.
    pub protocol_version: i32,
    /// Desired encoding.
    pub encoding: EncodingKind,
    /// Always `"DTC"`.
    pub protocol_type: String,
}

impl EncodingRequest {
    /// Request the given encoding.
    #[must_use]
    pub fn new(encoding: EncodingKind) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            encoding,
            protocol_type: PROTOCOL_TYPE.to_string(),
        }
    }
}

/// Encoding negotiation response (7).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EncodingResponse {
    /// Protocol version.
    pub protocol_version: i32,
    /// Accepted encoding.
    pub encoding: EncodingKind,
    /// Protocol type.
    pub protocol_type: String,
}

/// Logon request (1).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogonRequest {
    /// Protocol version.
    pub protocol_version: i32,
    /// Account name; may be empty.
    pub username: String,
    /// Password; may be empty.
    pub password: String,
    /// Free-form text passed to the server.
    pub general_text_data: String,
    /// Heartbeat interval the client wants.
    pub heartbeat_interval_in_seconds: u32,
    /// 0 = live trade mode; irrelevant for market data.
    pub trade_mode: i32,
    /// Client identification.
    pub client_name: String,
}

impl std::fmt::Debug for LogonRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogonRequest")
            .field("protocol_version", &self.protocol_version)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("heartbeat_interval_in_seconds", &self.heartbeat_interval_in_seconds)
            .field("client_name", &self.client_name)
            .finish_non_exhaustive()
    }
}

/// Logon response (2).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogonResponse {
    /// Protocol version.
    pub protocol_version: i32,
    /// Result code; missing results decode as -1.
    #[serde(default = "missing_result")]
    pub result: i32,
    /// Server reason text.
    pub result_text: String,
    /// Server identification.
    pub server_name: String,
    /// Live market data available.
    #[serde(deserialize_with = "flag", serialize_with = "serialize_flag")]
    pub market_data_supported: bool,
    /// Historical bars available.
    #[serde(deserialize_with = "flag", serialize_with = "serialize_flag")]
    pub historical_price_data_supported: bool,
    /// Security definitions available.
    #[serde(deserialize_with = "flag", serialize_with = "serialize_flag")]
    pub security_definitions_supported: bool,
    /// Trading available.
    #[serde(deserialize_with = "flag", serialize_with = "serialize_flag")]
    pub trading_is_supported: bool,
    /// Depth available.
    #[serde(deserialize_with = "flag", serialize_with = "serialize_flag")]
    pub market_depth_is_supported: bool,
    /// Server only accepts one historical request per connection.
    #[serde(deserialize_with = "flag", serialize_with = "serialize_flag")]
    pub one_historical_price_data_request_per_connection: bool,
}

impl LogonResponse {
    /// Whether the result code means success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result == LOGON_SUCCESS || self.result == LOGON_SUCCESS_ALT
    }
}

const fn missing_result() -> i32 {
    -1
}

/// Heartbeat (3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Heartbeat {
    /// Messages the sender dropped since the last heartbeat.
    pub num_dropped_messages: u32,
    /// Sender clock, Unix seconds.
    pub current_date_time: i64,
}

/// Logoff (5).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Logoff {
    /// Reason text.
    pub reason: String,
    /// Sender asks the peer not to reconnect.
    #[serde(deserialize_with = "flag", serialize_with = "serialize_flag")]
    pub do_not_reconnect: bool,
}

/// Free-form log line from the server (701).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GeneralLogMessage {
    /// Log text.
    pub message_text: String,
}

// =============================================================================
// Market Data Messages
// =============================================================================

/// Market data request (101).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MarketDataRequest {
    /// Subscribe, unsubscribe or snapshot.
    pub request_action: RequestAction,
    /// Correlation id chosen by the client.
    #[serde(rename = "SymbolID")]
    pub symbol_id: u32,
    /// Symbol.
    pub symbol: String,
    /// Exchange.
    pub exchange: String,
    /// 0 streams every update.
    pub interval_for_snapshot_updates_in_milliseconds: u32,
}

/// Market data reject (103).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MarketDataReject {
    /// Correlation id.
    #[serde(rename = "SymbolID")]
    pub symbol_id: u32,
    /// Reason text, frequently empty.
    pub reject_text: String,
}

/// Market data snapshot (104).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MarketDataSnapshot {
    /// Correlation id.
    #[serde(rename = "SymbolID")]
    pub symbol_id: u32,
    /// Settlement price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_settlement_price: Option<f64>,
    /// Session open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_open_price: Option<f64>,
    /// Session high.
    #[serde(alias = "High", skip_serializing_if = "Option::is_none")]
    pub session_high_price: Option<f64>,
    /// Session low.
    #[serde(alias = "Low", skip_serializing_if = "Option::is_none")]
    pub session_low_price: Option<f64>,
    /// Session volume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_volume: Option<f64>,
    /// Best bid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_price: Option<f64>,
    /// Best ask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_price: Option<f64>,
    /// Best bid size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_quantity: Option<f64>,
    /// Best ask size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_quantity: Option<f64>,
    /// Last trade price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_price: Option<f64>,
    /// Last trade size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_volume: Option<f64>,
    /// Last trade time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_date_time: Option<f64>,
}

/// Trade update (107).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MarketDataUpdateTrade {
    /// Correlation id.
    #[serde(rename = "SymbolID")]
    pub symbol_id: u32,
    /// 1 = at bid, 2 = at ask.
    pub at_bid_or_ask: u8,
    /// Trade price.
    pub price: f64,
    /// Trade size.
    pub volume: f64,
    /// Trade time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<f64>,
}

/// Bid/ask update (108).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MarketDataUpdateBidAsk {
    /// Correlation id.
    #[serde(rename = "SymbolID")]
    pub symbol_id: u32,
    /// Best bid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_price: Option<f64>,
    /// Best bid size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_quantity: Option<f64>,
    /// Best ask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_price: Option<f64>,
    /// Best ask size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_quantity: Option<f64>,
    /// Update time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<f64>,
}

// =============================================================================
// Security Definition Messages
// =============================================================================

/// Security definition lookup (506).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityDefinitionForSymbolRequest {
    /// Correlation id.
    #[serde(rename = "RequestID")]
    pub request_id: u32,
    /// Symbol.
    pub symbol: String,
    /// Exchange.
    pub exchange: String,
}

/// Security definition result (507).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SecurityDefinitionResponse {
    /// Correlation id.
    #[serde(rename = "RequestID")]
    pub request_id: u32,
    /// Symbol.
    pub symbol: String,
    /// Exchange.
    pub exchange: String,
    /// Human-readable description.
    pub description: String,
    /// Minimum price increment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_price_increment: Option<f64>,
    /// Currency value of one tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_value_per_increment: Option<f64>,
}

// =============================================================================
// Historical Price Data Messages
// =============================================================================

/// Historical bars request (800).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoricalPriceDataRequest {
    /// Correlation id.
    #[serde(rename = "RequestID")]
    pub request_id: u32,
    /// Symbol.
    pub symbol: String,
    /// Exchange.
    pub exchange: String,
    /// Bar width in seconds; 0 = ticks.
    pub record_interval: u32,
    /// Range start, Unix seconds.
    pub start_date_time: i64,
    /// Range end, Unix seconds; 0 = now.
    pub end_date_time: i64,
    /// Cap on days returned; 0 = server default.
    pub max_days_to_return: u32,
    /// Always 0: compression is not supported.
    #[serde(rename = "UseZLibCompression")]
    pub use_zlib_compression: u8,
}

/// Historical stream header (801).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HistoricalPriceDataResponseHeader {
    /// Correlation id.
    #[serde(rename = "RequestID")]
    pub request_id: u32,
    /// Bar width in seconds.
    pub record_interval: u32,
    /// Compression in use.
    #[serde(rename = "UseZLibCompression")]
    pub use_zlib_compression: u8,
    /// Non-zero when the range is empty.
    #[serde(deserialize_with = "flag", serialize_with = "serialize_flag")]
    pub no_records_to_return: bool,
}

/// Historical request reject (802).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HistoricalPriceDataReject {
    /// Correlation id.
    #[serde(rename = "RequestID")]
    pub request_id: u32,
    /// Reason text.
    pub reject_text: String,
    /// Reason code.
    pub reject_reason_code: i32,
    /// Server-suggested retry delay.
    pub retry_time_in_seconds: u32,
}

/// One historical bar (803).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HistoricalPriceDataRecordResponse {
    /// Correlation id.
    #[serde(rename = "RequestID")]
    pub request_id: u32,
    /// Bar start; day count, Unix seconds or microseconds.
    pub start_date_time: f64,
    /// Open.
    pub open_price: f64,
    /// High.
    pub high_price: f64,
    /// Low.
    pub low_price: f64,
    /// Close.
    pub last_price: f64,
    /// Total volume.
    pub volume: f64,
    /// Trade count (servers reuse this field for open interest).
    #[serde(alias = "OpenInterest")]
    pub num_trades: f64,
    /// Volume at the bid.
    pub bid_volume: f64,
    /// Volume at the ask.
    pub ask_volume: f64,
    /// Non-zero on the last record of the stream.
    #[serde(deserialize_with = "flag", serialize_with = "serialize_flag")]
    pub is_final_record: bool,
}

/// End of historical stream (804).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HistoricalPriceDataFinal {
    /// Correlation id.
    #[serde(rename = "RequestID")]
    pub request_id: u32,
}

// =============================================================================
// Message Union
// =============================================================================

/// One decoded DTC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// 1
    LogonRequest(LogonRequest),
    /// 2
    LogonResponse(LogonResponse),
    /// 3
    Heartbeat(Heartbeat),
    /// 5
    Logoff(Logoff),
    /// 6
    EncodingRequest(EncodingRequest),
    /// 7
    EncodingResponse(EncodingResponse),
    /// 101
    MarketDataRequest(MarketDataRequest),
    /// 103
    MarketDataReject(MarketDataReject),
    /// 104
    MarketDataSnapshot(MarketDataSnapshot),
    /// 107
    MarketDataUpdateTrade(MarketDataUpdateTrade),
    /// 108
    MarketDataUpdateBidAsk(MarketDataUpdateBidAsk),
    /// 506
    SecurityDefinitionForSymbolRequest(SecurityDefinitionForSymbolRequest),
    /// 507
    SecurityDefinitionResponse(SecurityDefinitionResponse),
    /// 701
    GeneralLogMessage(GeneralLogMessage),
    /// 800
    HistoricalPriceDataRequest(HistoricalPriceDataRequest),
    /// 801
    HistoricalPriceDataResponseHeader(HistoricalPriceDataResponseHeader),
    /// 802
    HistoricalPriceDataReject(HistoricalPriceDataReject),
    /// 803
    HistoricalPriceDataRecordResponse(HistoricalPriceDataRecordResponse),
    /// 804
    HistoricalPriceDataFinal(HistoricalPriceDataFinal),
    /// A well-formed frame of a type this client does not model.
    Unknown {
        /// Raw type code.
        type_code: u16,
        /// Full frame.
        body: serde_json::Value,
    },
}

impl Message {
    /// Modelled type, `None` for [`Message::Unknown`].
    #[must_use]
    pub const fn message_type(&self) -> Option<MessageType> {
        let ty = match self {
            Self::LogonRequest(_) => MessageType::LogonRequest,
            Self::LogonResponse(_) => MessageType::LogonResponse,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::Logoff(_) => MessageType::Logoff,
            Self::EncodingRequest(_) => MessageType::EncodingRequest,
            Self::EncodingResponse(_) => MessageType::EncodingResponse,
            Self::MarketDataRequest(_) => MessageType::MarketDataRequest,
            Self::MarketDataReject(_) => MessageType::MarketDataReject,
            Self::MarketDataSnapshot(_) => MessageType::MarketDataSnapshot,
            Self::MarketDataUpdateTrade(_) => MessageType::MarketDataUpdateTrade,
            Self::MarketDataUpdateBidAsk(_) => MessageType::MarketDataUpdateBidAsk,
            Self::SecurityDefinitionForSymbolRequest(_) => {
                MessageType::SecurityDefinitionForSymbolRequest
            }
            Self::SecurityDefinitionResponse(_) => MessageType::SecurityDefinitionResponse,
            Self::GeneralLogMessage(_) => MessageType::GeneralLogMessage,
            Self::HistoricalPriceDataRequest(_) => MessageType::HistoricalPriceDataRequest,
            Self::HistoricalPriceDataResponseHeader(_) => {
                MessageType::HistoricalPriceDataResponseHeader
            }
            Self::HistoricalPriceDataReject(_) => MessageType::HistoricalPriceDataReject,
            Self::HistoricalPriceDataRecordResponse(_) => {
                MessageType::HistoricalPriceDataRecordResponse
            }
            Self::HistoricalPriceDataFinal(_) => MessageType::HistoricalPriceDataFinal,
            Self::Unknown { .. } => return None,
        };
        Some(ty)
    }

    /// Wire type code.
    #[must_use]
    pub const fn type_code(&self) -> u16 {
        match self {
            Self::Unknown { type_code, .. } => *type_code,
            other => match other.message_type() {
                Some(ty) => ty.code(),
                None => 0,
            },
        }
    }

    /// A heartbeat stamped with the current time.
    #[must_use]
    pub fn heartbeat_now() -> Self {
        Self::Heartbeat(Heartbeat {
            num_dropped_messages: 0,
            current_date_time: chrono::Utc::now().timestamp(),
        })
    }
}

// =============================================================================
// Flag (de)serialization
// =============================================================================

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        serde_json::Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_flag<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u8(u8::from(*value))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn codes_round_trip() {
        for ty in MessageType::ALL {
            assert_eq!(MessageType::from_code(ty.code()), Some(ty));
            assert_eq!(MessageType::from_name(ty.name()), Some(ty));
        }
        assert_eq!(MessageType::from_code(4), None);
    }

    #[test]
    fn names_accept_screaming_snake() {
        assert_eq!(
            MessageType::from_name("LOGON_RESPONSE"),
            Some(MessageType::LogonResponse)
        );
        assert_eq!(
            MessageType::from_name("encodingresponse"),
            Some(MessageType::EncodingResponse)
        );
        assert_eq!(MessageType::from_name("Nope"), None);
    }

    #[test]
    fn logon_response_flags_accept_ints_and_bools() {
        let response: LogonResponse = serde_json::from_value(json!({
            "Result": 1,
            "ServerName": "SC DTC Server",
            "MarketDataSupported": 1,
            "HistoricalPriceDataSupported": true,
            "SecurityDefinitionsSupported": 0
        }))
        .unwrap();

        assert!(response.is_success());
        assert!(response.market_data_supported);
        assert!(response.historical_price_data_supported);
        assert!(!response.security_definitions_supported);
        assert!(!response.trading_is_supported);
        assert_eq!(response.server_name, "SC DTC Server");
    }

    #[test]
    fn logon_response_missing_result_is_not_success() {
        let response: LogonResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(response.result, -1);
        assert!(!response.is_success());

        let zero: LogonResponse = serde_json::from_value(json!({"Result": 0})).unwrap();
        assert!(zero.is_success());
    }

    #[test]
    fn market_data_request_wire_names() {
        let request = MarketDataRequest {
            request_action: RequestAction::Subscribe,
            symbol_id: 3,
            symbol: "ESZ25".to_string(),
            exchange: "CME".to_string(),
            interval_for_snapshot_updates_in_milliseconds: 0,
        };
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["RequestAction"], 1);
        assert_eq!(value["SymbolID"], 3);
        assert_eq!(value["Symbol"], "ESZ25");
        assert_eq!(value["IntervalForSnapshotUpdatesInMilliseconds"], 0);
    }

    #[test]
    fn snapshot_accepts_short_high_low_names() {
        let snapshot: MarketDataSnapshot = serde_json::from_value(json!({
            "SymbolID": 1,
            "LastTradePrice": 5000.25,
            "High": 5010.0,
            "Low": 4990.5
        }))
        .unwrap();
        assert_eq!(snapshot.session_high_price, Some(5010.0));
        assert_eq!(snapshot.session_low_price, Some(4990.5));
        assert_eq!(snapshot.bid_price, None);
    }

    #[test]
    fn encoding_kind_from_int() {
        assert_eq!(EncodingKind::from(2), EncodingKind::Json);
        assert_eq!(EncodingKind::from(9), EncodingKind::Other(9));
        assert_eq!(i32::from(EncodingKind::BinaryVls), 1);
    }

    #[test]
    fn logon_request_debug_redacts_password() {
        let request = LogonRequest {
            protocol_version: PROTOCOL_VERSION,
            username: "trader".to_string(),
            password: "hunter2".to_string(),
            general_text_data: String::new(),
            heartbeat_interval_in_seconds: 30,
            trade_mode: 0,
            client_name: "test".to_string(),
        };
        let debug = format!("{request:?}");
        assert!(debug.contains("trader"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn unknown_message_reports_raw_code() {
        let message = Message::Unknown {
            type_code: 999,
            body: json!({"Type": 999}),
        };
        assert_eq!(message.type_code(), 999);
        assert_eq!(message.message_type(), None);
        assert_eq!(Message::heartbeat_now().type_code(), 3);
    }
}
