//! Client Configuration Settings
//!
//! Configuration types for the stream client, loaded from environment variables.

use std::time::Duration;

use crate::domain::subscription::DEFAULT_MAX_TOPICS;
use crate::domain::topic::{Topic, TopicError};

const LIVE_STREAM_URL: &str = "wss://stream.binance.com:9443/ws";
const TESTNET_STREAM_URL: &str = "wss://testnet.binance.vision/ws";
const LIVE_REST_URL: &str = "https://api.binance.com/api/v3/";
const TESTNET_REST_URL: &str = "https://testnet.binance.vision/api/v3/";

/// Venue environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Production venue.
    #[default]
    Live,
    /// Spot testnet.
    Testnet,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TESTNET" | "TEST" => Self::Testnet,
            _ => Self::Live,
        }
    }

    /// Check if this is the production venue.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Testnet => "testnet",
        }
    }

    /// Default stream URL for this environment.
    #[must_use]
    pub const fn stream_url(&self) -> &'static str {
        match self {
            Self::Live => LIVE_STREAM_URL,
            Self::Testnet => TESTNET_STREAM_URL,
        }
    }

    /// Default REST base URL for this environment.
    #[must_use]
    pub const fn rest_url(&self) -> &'static str {
        match self {
            Self::Live => LIVE_REST_URL,
            Self::Testnet => TESTNET_REST_URL,
        }
    }
}

/// API key and secret.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Venue endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// WebSocket stream URL.
    pub stream_url: String,
    /// REST base URL, with trailing slash.
    pub rest_url: String,
}

impl EndpointSettings {
    /// Endpoints for an environment.
    #[must_use]
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            stream_url: environment.stream_url().to_string(),
            rest_url: environment.rest_url().to_string(),
        }
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

/// Streaming connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Ceiling on acknowledged topics per connection.
    pub max_topics: usize,
    /// Minimum spacing between outbound control frames.
    pub min_send_spacing: Duration,
    /// How long to wait for the transport to report closure.
    pub close_timeout: Duration,
    /// Upper bound on a single outbound send.
    pub send_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_topics: DEFAULT_MAX_TOPICS,
            min_send_spacing: Duration::from_millis(500),
            close_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Reconnection backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Initial reconnection delay.
    pub delay_initial: Duration,
    /// Maximum reconnection delay.
    pub delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub delay_multiplier: f64,
    /// Maximum consecutive failed dials before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            delay_initial: Duration::from_millis(500),
            delay_max: Duration::from_secs(30),
            delay_multiplier: 2.0,
            max_attempts: 0, // Unlimited
        }
    }
}

/// Broadcast channel settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Capacity of the candle channel.
    pub candles_capacity: usize,
    /// Capacity of the aggregate trade channel.
    pub aggregate_trades_capacity: usize,
    /// Capacity of the trade channel.
    pub trades_capacity: usize,
    /// Capacity of the mini ticker channel.
    pub mini_tickers_capacity: usize,
    /// Capacity of the ticker channel.
    pub tickers_capacity: usize,
    /// Capacity of the account position channel.
    pub account_positions_capacity: usize,
    /// Capacity of the ack and error channels.
    pub control_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            candles_capacity: 1_000,
            aggregate_trades_capacity: 10_000,
            trades_capacity: 10_000,
            mini_tickers_capacity: 5_000,
            tickers_capacity: 5_000,
            account_positions_capacity: 256,
            control_capacity: 256,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Venue environment.
    pub environment: Environment,
    /// API credentials, required only for keyed REST calls.
    pub credentials: Option<Credentials>,
    /// Venue endpoints.
    pub endpoints: EndpointSettings,
    /// Topics subscribed at startup.
    pub streams: Vec<Topic>,
    /// Streaming connection settings.
    pub stream: StreamSettings,
    /// Reconnection settings.
    pub reconnect: ReconnectSettings,
    /// Broadcast channel settings.
    pub broadcast: BroadcastSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// `recvWindow` sent with signed REST calls.
    pub recv_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            credentials: None,
            endpoints: EndpointSettings::default(),
            streams: Vec::new(),
            stream: StreamSettings::default(),
            reconnect: ReconnectSettings::default(),
            broadcast: BroadcastSettings::default(),
            server: ServerSettings::default(),
            recv_window: Duration::from_millis(5000),
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if only one half of the credentials is set, or a
    /// topic in `BINANCE_STREAMS` is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`ClientConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let environment = env
            .get("BINANCE_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let credentials = match (env.get("BINANCE_API_KEY"), env.get("BINANCE_API_SECRET")) {
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::MissingEnvVar("BINANCE_API_SECRET".to_string()));
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingEnvVar("BINANCE_API_KEY".to_string()));
            }
            (Some(key), Some(_)) if key.is_empty() => {
                return Err(ConfigError::EmptyValue("BINANCE_API_KEY".to_string()));
            }
            (Some(_), Some(secret)) if secret.is_empty() => {
                return Err(ConfigError::EmptyValue("BINANCE_API_SECRET".to_string()));
            }
            (Some(key), Some(secret)) => Some(Credentials::new(key, secret)),
        };

        let defaults = EndpointSettings::for_environment(environment);
        let endpoints = EndpointSettings {
            stream_url: env
                .non_empty("BINANCE_STREAM_URL")
                .unwrap_or(defaults.stream_url),
            rest_url: env
                .non_empty("BINANCE_REST_URL")
                .map(with_trailing_slash)
                .unwrap_or(defaults.rest_url),
        };

        let streams = env
            .get("BINANCE_STREAMS")
            .map(|raw| parse_topics(&raw))
            .transpose()?
            .unwrap_or_default();

        let stream_defaults = StreamSettings::default();
        let stream = StreamSettings {
            max_topics: env.usize("STREAM_MAX_TOPICS", stream_defaults.max_topics),
            min_send_spacing: env.duration_millis(
                "STREAM_MIN_SEND_SPACING_MS",
                stream_defaults.min_send_spacing,
            ),
            close_timeout: env
                .duration_secs("STREAM_CLOSE_TIMEOUT_SECS", stream_defaults.close_timeout),
            send_timeout: env
                .duration_secs("STREAM_SEND_TIMEOUT_SECS", stream_defaults.send_timeout),
        };

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            delay_initial: env.duration_millis(
                "STREAM_RECONNECT_DELAY_INITIAL_MS",
                reconnect_defaults.delay_initial,
            ),
            delay_max: env.duration_secs(
                "STREAM_RECONNECT_DELAY_MAX_SECS",
                reconnect_defaults.delay_max,
            ),
            delay_multiplier: env.f64(
                "STREAM_RECONNECT_DELAY_MULTIPLIER",
                reconnect_defaults.delay_multiplier,
            ),
            max_attempts: env.u32(
                "STREAM_MAX_RECONNECT_ATTEMPTS",
                reconnect_defaults.max_attempts,
            ),
        };

        let broadcast_defaults = BroadcastSettings::default();
        let broadcast = BroadcastSettings {
            candles_capacity: env.usize(
                "STREAM_CANDLES_CAPACITY",
                broadcast_defaults.candles_capacity,
            ),
            aggregate_trades_capacity: env.usize(
                "STREAM_AGGREGATE_TRADES_CAPACITY",
                broadcast_defaults.aggregate_trades_capacity,
            ),
            trades_capacity: env
                .usize("STREAM_TRADES_CAPACITY", broadcast_defaults.trades_capacity),
            mini_tickers_capacity: env.usize(
                "STREAM_MINI_TICKERS_CAPACITY",
                broadcast_defaults.mini_tickers_capacity,
            ),
            tickers_capacity: env.usize(
                "STREAM_TICKERS_CAPACITY",
                broadcast_defaults.tickers_capacity,
            ),
            account_positions_capacity: env.usize(
                "STREAM_ACCOUNT_POSITIONS_CAPACITY",
                broadcast_defaults.account_positions_capacity,
            ),
            control_capacity: env.usize(
                "STREAM_CONTROL_CAPACITY",
                broadcast_defaults.control_capacity,
            ),
        };

        let server = ServerSettings {
            health_port: env.u16("STREAM_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let recv_window =
            env.duration_millis("BINANCE_RECV_WINDOW_MS", Duration::from_millis(5000));

        Ok(Self {
            environment,
            credentials,
            endpoints,
            streams,
            stream,
            reconnect,
            broadcast,
            server,
            recv_window,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// A configured topic is malformed.
    #[error("invalid topic {topic:?} in BINANCE_STREAMS: {source}")]
    InvalidTopic {
        /// The offending entry.
        topic: String,
        /// Why it was rejected.
        source: TopicError,
    },
}

fn parse_topics(raw: &str) -> Result<Vec<Topic>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            Topic::parse(entry).map_err(|source| ConfigError::InvalidTopic {
                topic: entry.to_string(),
                source,
            })
        })
        .collect()
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parsed(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parsed(key).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parsed(key).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parsed(key).unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key).map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key)
            .map_or(default, Duration::from_millis)
    }
}
