//! Gateway Configuration Settings
//!
//! Configuration types for the market data layer, loaded from environment
//! variables. Unset variables take their defaults; set but unparsable ones
//! are errors.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::market_data::SubscriptionKey;
use crate::domain::time::{DEFAULT_DAY_COUNT_LIMIT, TimeEncoding};
use crate::infrastructure::dtc::logon::{
    Credentials, DEFAULT_LOGON_TIMEOUT, DEFAULT_NEGOTIATION_TIMEOUT, LogonConfig,
};
use crate::infrastructure::dtc::session::SessionConfig;
use crate::infrastructure::scid::decoder::DecoderConfig;
use crate::infrastructure::scid::tailer::{DEFAULT_POLL_INTERVAL, StartPosition, TailerConfig};

/// DTC server connection settings.
#[derive(Debug, Clone)]
pub struct DtcSettings {
    /// Server host.
    pub host: String,
    /// Server port for the main session.
    pub port: u16,
    /// Separate port for historical requests (`None` = main session).
    pub historical_port: Option<u16>,
    /// Logon credentials.
    pub credentials: Credentials,
    /// Client name sent at logon.
    pub client_name: String,
    /// Heartbeat interval requested at logon.
    pub heartbeat_interval: Duration,
    /// Encoding negotiation timeout.
    pub negotiation_timeout: Duration,
    /// Logon response timeout.
    pub logon_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Default timeout for historical fetches.
    pub historical_timeout: Duration,
}

impl Default for DtcSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 11099,
            historical_port: None,
            credentials: Credentials::anonymous(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            heartbeat_interval: Duration::from_secs(30),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            logon_timeout: DEFAULT_LOGON_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            historical_timeout: Duration::from_secs(120),
        }
    }
}

/// Reconnection backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Symmetric jitter fraction.
    pub jitter: f64,
    /// Retries before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 0, // Unlimited
        }
    }
}

/// Tick file fallback settings.
#[derive(Debug, Clone)]
pub struct TickFileSettings {
    /// Directory holding `<SYMBOL>.scid` files (`None` = fallback disabled).
    pub data_dir: Option<PathBuf>,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// How record times are read.
    pub time_encoding: TimeEncoding,
    /// Fall back on every reject, not only entitlement rejects.
    pub fallback_on_any_reject: bool,
}

impl Default for TickFileSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            time_encoding: TimeEncoding::default(),
            fallback_on_any_reject: false,
        }
    }
}

/// Server port and channel settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
    /// Capacity of each per-symbol hub channel.
    pub hub_channel_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8090,
            hub_channel_capacity: 1024,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// DTC server settings.
    pub dtc: DtcSettings,
    /// Reconnect backoff.
    pub reconnect: ReconnectSettings,
    /// Tick file fallback.
    pub tick_files: TickFileSettings,
    /// Ports and channels.
    pub server: ServerSettings,
    /// Symbols subscribed at startup.
    pub symbols: Vec<SubscriptionKey>,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is set to
    /// something that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`GatewayConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let dtc_defaults = DtcSettings::default();
        let dtc = DtcSettings {
            host: env.string("SIERRACHART_HOST", &dtc_defaults.host),
            port: env.parse("SIERRACHART_PORT", dtc_defaults.port)?,
            historical_port: env.optional("SIERRACHART_HISTORICAL_PORT")?,
            credentials: Credentials::new(
                env.string("SIERRACHART_USERNAME", ""),
                env.string("SIERRACHART_PASSWORD", ""),
            ),
            client_name: env.string("DTC_CLIENT_NAME", &dtc_defaults.client_name),
            heartbeat_interval: env
                .secs("DTC_HEARTBEAT_INTERVAL_SECS", dtc_defaults.heartbeat_interval)?,
            negotiation_timeout: env
                .secs("DTC_NEGOTIATION_TIMEOUT_SECS", dtc_defaults.negotiation_timeout)?,
            logon_timeout: env.secs("DTC_LOGON_TIMEOUT_SECS", dtc_defaults.logon_timeout)?,
            connect_timeout: env.secs("DTC_CONNECT_TIMEOUT_SECS", dtc_defaults.connect_timeout)?,
            historical_timeout: env
                .secs("DTC_HISTORICAL_TIMEOUT_SECS", dtc_defaults.historical_timeout)?,
        };

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            initial_delay: env.millis("DTC_RECONNECT_INITIAL_MS", reconnect_defaults.initial_delay)?,
            max_delay: env.millis("DTC_RECONNECT_MAX_MS", reconnect_defaults.max_delay)?,
            multiplier: env.parse("DTC_RECONNECT_MULTIPLIER", reconnect_defaults.multiplier)?,
            jitter: env.parse("DTC_RECONNECT_JITTER", reconnect_defaults.jitter)?,
            max_attempts: env.parse("DTC_RECONNECT_MAX_ATTEMPTS", reconnect_defaults.max_attempts)?,
        };
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(ConfigError::invalid(
                "DTC_RECONNECT_JITTER",
                reconnect.jitter.to_string(),
            ));
        }
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "DTC_RECONNECT_MULTIPLIER",
                reconnect.multiplier.to_string(),
            ));
        }

        let limit: f64 = env.parse("SCID_DAY_COUNT_LIMIT", DEFAULT_DAY_COUNT_LIMIT)?;
        let encoding_name = env.string("SCID_TIME_ENCODING", "auto");
        let time_encoding = TimeEncoding::from_str_case_insensitive(&encoding_name, limit)
            .ok_or_else(|| ConfigError::invalid("SCID_TIME_ENCODING", encoding_name.clone()))?;

        let tick_defaults = TickFileSettings::default();
        let tick_files = TickFileSettings {
            data_dir: lookup("SCID_DATA_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            poll_interval: env.millis("SCID_POLL_INTERVAL_MS", tick_defaults.poll_interval)?,
            time_encoding,
            fallback_on_any_reject: env.bool("SCID_FALLBACK_ON_ANY_REJECT", false)?,
        };
        if tick_files.poll_interval.is_zero() {
            return Err(ConfigError::invalid("SCID_POLL_INTERVAL_MS", "0"));
        }

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            health_port: env.parse("HEALTH_PORT", server_defaults.health_port)?,
            hub_channel_capacity: env
                .parse("HUB_CHANNEL_CAPACITY", server_defaults.hub_channel_capacity)?,
        };

        let symbols = parse_symbols(&env.string("DTC_SYMBOLS", ""))?;

        Ok(Self {
            dtc,
            reconnect,
            tick_files,
            server,
            symbols,
        })
    }

    /// Handshake settings for a session.
    #[must_use]
    pub fn logon_config(&self) -> LogonConfig {
        LogonConfig {
            credentials: self.dtc.credentials.clone(),
            client_name: self.dtc.client_name.clone(),
            heartbeat_interval: self.dtc.heartbeat_interval,
            negotiation_timeout: self.dtc.negotiation_timeout,
            logon_timeout: self.dtc.logon_timeout,
        }
    }

    /// Session settings derived from this configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            time_encoding: self.tick_files.time_encoding,
            ..SessionConfig::new(self.logon_config())
        }
    }

    /// Tailer settings derived from this configuration.
    #[must_use]
    pub fn tailer_config(&self) -> TailerConfig {
        TailerConfig {
            poll_interval: self.tick_files.poll_interval,
            start: StartPosition::End,
            decoder: DecoderConfig {
                time_encoding: self.tick_files.time_encoding,
                ..DecoderConfig::default()
            },
            ..TailerConfig::default()
        }
    }

    /// `host:port` of the main session.
    #[must_use]
    pub fn dtc_addr(&self) -> String {
        format!("{}:{}", self.dtc.host, self.dtc.port)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable is set but cannot be used.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

/// Parse `SYM[@EXCH]` entries separated by commas.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] for an entry without a symbol.
pub fn parse_symbols(list: &str) -> Result<Vec<SubscriptionKey>, ConfigError> {
    let mut keys: Vec<SubscriptionKey> = Vec::new();
    for entry in list.split(',').filter(|e| !e.trim().is_empty()) {
        let key = SubscriptionKey::parse(entry)
            .ok_or_else(|| ConfigError::invalid("DTC_SYMBOLS", entry.trim()))?;
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    Ok(keys)
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    fn optional<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.raw(key) {
            None => Ok(None),
            Some(v) if v.is_empty() => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::invalid(key, v)),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self.optional::<u64>(key)?.map_or(default, Duration::from_secs))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .optional::<u64>(key)?
            .map_or(default, Duration::from_millis))
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "" => Ok(default),
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, v)),
            },
        }
    }
}
