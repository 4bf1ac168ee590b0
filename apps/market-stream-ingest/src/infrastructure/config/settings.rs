//! Ingest Configuration Settings
//!
//! Configuration types for the ingest service, loaded from environment
//! variables. Blank variables fall back to defaults; malformed ones fail
//! startup.

use std::str::FromStr;
use std::time::Duration;

use crate::domain::notification::DEFAULT_THROTTLE_INTERVAL;

/// Default Finnhub websocket endpoint.
pub const DEFAULT_WEBSOCKET_URL: &str = "wss://ws.finnhub.io";

/// Finnhub secrets.
#[derive(Clone, Default)]
pub struct Credentials {
    api_key: String,
    webhook_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, webhook_secret: String) -> Self {
        Self {
            api_key,
            webhook_secret,
        }
    }

    /// Stream API token.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Webhook shared secret, `None` when unset.
    #[must_use]
    pub fn webhook_secret(&self) -> Option<&str> {
        Some(self.webhook_secret.as_str()).filter(|s| !s.is_empty())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &redact(&self.api_key))
            .field("webhook_secret", &redact(&self.webhook_secret))
            .finish()
    }
}

const fn redact(value: &str) -> &'static str {
    if value.is_empty() { "[UNSET]" } else { "[REDACTED]" }
}

/// Upstream stream settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Administrative switch.
    pub enabled: bool,
    /// Websocket endpoint without the token.
    pub url: String,
    /// Delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Ceiling when a multiplier above 1.0 is configured.
    pub reconnect_max_delay: Duration,
    /// Delay growth factor (1.0 = fixed).
    pub reconnect_multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.0 = none).
    pub reconnect_jitter: f64,
    /// Attempts before giving up (0 = unlimited).
    pub reconnect_max_attempts: u32,
    /// Upstream concurrent subscription cap.
    pub max_subscriptions: usize,
    /// Control-message queue capacity.
    pub outbound_capacity: usize,
    /// Websocket handshake timeout.
    pub connect_timeout: Duration,
    /// Client ping interval.
    pub heartbeat_interval: Duration,
    /// Silence that marks the session dead.
    pub idle_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_WEBSOCKET_URL.to_string(),
            reconnect_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(5),
            reconnect_multiplier: 1.0,
            reconnect_jitter: 0.0,
            reconnect_max_attempts: 0,
            max_subscriptions: 50,
            outbound_capacity: 256,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Listener ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Public listener (webhook).
    pub http_port: u16,
    /// Health, metrics and admin listener.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8080,
            health_port: 8082,
        }
    }
}

/// Complete ingest configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Finnhub secrets.
    pub credentials: Credentials,
    /// Upstream stream settings.
    pub stream: StreamSettings,
    /// Listener ports.
    pub server: ServerSettings,
    /// Minimum gap between notifications per ticker.
    pub notification_throttle: Duration,
    /// Tickers seeding the in-memory watchlist and snapshots.
    pub seed_tickers: Vec<String>,
}

impl IngestConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparseable or
    /// out-of-range value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparseable or
    /// out-of-range value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = StreamSettings::default();

        let credentials = Credentials::new(
            env.string("FINNHUB_API_KEY").unwrap_or_default(),
            env.string("FINNHUB_WEBHOOK_SECRET").unwrap_or_default(),
        );

        let reconnect_delay =
            env.duration_secs("FINNHUB_RECONNECT_DELAY_SECS", defaults.reconnect_delay)?;
        let stream = StreamSettings {
            enabled: env.flag("FINNHUB_STREAM_ENABLED", defaults.enabled)?,
            url: env
                .string("FINNHUB_WEBSOCKET_URL")
                .unwrap_or(defaults.url),
            reconnect_delay,
            reconnect_max_delay: env
                .duration_secs("FINNHUB_RECONNECT_MAX_DELAY_SECS", reconnect_delay)?,
            reconnect_multiplier: env
                .parse("FINNHUB_RECONNECT_MULTIPLIER", defaults.reconnect_multiplier)?,
            reconnect_jitter: env.parse("FINNHUB_RECONNECT_JITTER", defaults.reconnect_jitter)?,
            reconnect_max_attempts: env
                .parse("FINNHUB_RECONNECT_MAX_ATTEMPTS", defaults.reconnect_max_attempts)?,
            max_subscriptions: env
                .parse("FINNHUB_MAX_SUBSCRIPTIONS", defaults.max_subscriptions)?,
            outbound_capacity: env
                .parse("FINNHUB_OUTBOUND_QUEUE_CAPACITY", defaults.outbound_capacity)?,
            connect_timeout: env
                .duration_secs("FINNHUB_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            heartbeat_interval: env
                .duration_secs("FINNHUB_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            idle_timeout: env.duration_secs("FINNHUB_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
        };
        validate_stream(&stream)?;

        let server = ServerSettings {
            http_port: env.parse("HTTP_PORT", ServerSettings::default().http_port)?,
            health_port: env.parse("HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        let notification_throttle =
            env.duration_secs("NOTIFICATION_THROTTLE_SECS", DEFAULT_THROTTLE_INTERVAL)?;

        let seed_tickers = env
            .string("WATCHLIST_SEED_TICKERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            credentials,
            stream,
            server,
            notification_throttle,
            seed_tickers,
        })
    }

    /// Whether the upstream stream should run: switched on, with a token
    /// and an endpoint.
    #[must_use]
    pub fn is_streaming_enabled(&self) -> bool {
        self.stream.enabled
            && !self.credentials.api_key().is_empty()
            && !self.stream.url.is_empty()
    }
}

fn validate_stream(stream: &StreamSettings) -> Result<(), ConfigError> {
    if stream.max_subscriptions == 0 {
        return Err(ConfigError::OutOfRange {
            key: "FINNHUB_MAX_SUBSCRIPTIONS".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if stream.outbound_capacity == 0 {
        return Err(ConfigError::OutOfRange {
            key: "FINNHUB_OUTBOUND_QUEUE_CAPACITY".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if !stream.reconnect_multiplier.is_finite() || stream.reconnect_multiplier < 1.0 {
        return Err(ConfigError::OutOfRange {
            key: "FINNHUB_RECONNECT_MULTIPLIER".to_string(),
            reason: "must be a finite number >= 1.0".to_string(),
        });
    }
    if !(0.0..=1.0).contains(&stream.reconnect_jitter) {
        return Err(ConfigError::OutOfRange {
            key: "FINNHUB_RECONNECT_JITTER".to_string(),
            reason: "must be between 0.0 and 1.0".to_string(),
        });
    }
    if stream.heartbeat_interval.is_zero() {
        return Err(ConfigError::OutOfRange {
            key: "FINNHUB_HEARTBEAT_INTERVAL_SECS".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Variable is set but cannot be parsed.
    #[error("invalid value {value:?} for environment variable {key}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
    /// Variable parsed but is outside the accepted range.
    #[error("environment variable {key} {reason}")]
    OutOfRange {
        /// Variable name.
        key: String,
        /// What was expected.
        reason: String,
    },
}

// =============================================================================
// Variable Parsing
// =============================================================================

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-blank value.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                }),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.string(key) else {
            return Ok(default);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        }
    }
}
