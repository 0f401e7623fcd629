use secrecy::{ExposeSecret, Secret};
use serde::{Serialize, Serializer};
use std::env;
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::Uri;

const WS_PATH_SEGMENT: &str = "ws";

/// Exponential backoff settings used between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackoffConfig {
    #[serde(serialize_with = "serialize_millis")]
    pub initial_delay: Duration,
    #[serde(serialize_with = "serialize_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay used as symmetric random jitter (0.2 = ±20%).
    pub jitter_factor: f64,
    /// 0 = retry forever.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub endpoint: Secret<String>,
    pub auth_token: Option<Secret<String>>,
    /// Reconnect automatically after an unexpected disconnect.
    pub reconnect: bool,
    /// Heartbeat cadence, `Duration::ZERO` disables heartbeats.
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on how long `stop()` waits for the background task.
    pub stop_grace_period: Duration,
    pub backoff: BackoffConfig,
}

// Endpoints carry the access token in their path, so neither is ever serialized
impl Serialize for StreamConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("StreamConfig", 7)?;
        state.serialize_field("endpoint", "[REDACTED]")?;
        state.serialize_field(
            "auth_token",
            &self.auth_token.as_ref().map(|_| "[REDACTED]"),
        )?;
        state.serialize_field("reconnect", &self.reconnect)?;
        state.serialize_field("ping_interval_ms", &duration_millis(self.ping_interval))?;
        state.serialize_field("connect_timeout_ms", &duration_millis(self.connect_timeout))?;
        state.serialize_field(
            "stop_grace_period_ms",
            &duration_millis(self.stop_grace_period),
        )?;
        state.serialize_field("backoff", &self.backoff)?;
        state.end()
    }
}

impl StreamConfig {
    /// Create a configuration for the given endpoint with default settings
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Secret::new(endpoint.into()),
            auth_token: None,
            reconnect: true,
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            stop_grace_period: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `ENDPOINT` (falls back to `QUICKNODE_ENDPOINT`)
    /// - `AUTH_TOKEN` (optional, sent as a bearer token)
    /// - `STREAM_RECONNECT` (optional, defaults to true)
    /// - `STREAM_PING_INTERVAL_SECS` (optional, 0 disables heartbeats)
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = env::var("ENDPOINT")
            .or_else(|_| env::var("QUICKNODE_ENDPOINT"))
            .map_err(|_| ConfigError::MissingEnvironmentVariable("ENDPOINT".to_string()))?;

        let mut config = Self::new(endpoint);

        if let Ok(token) = env::var("AUTH_TOKEN") {
            if !token.is_empty() {
                config.auth_token = Some(Secret::new(token));
            }
        }

        if let Ok(raw) = env::var("STREAM_RECONNECT") {
            config.reconnect = raw.trim().parse::<bool>().map_err(|_| {
                ConfigError::InvalidConfiguration(format!(
                    "STREAM_RECONNECT must be true or false, got '{}'",
                    raw
                ))
            })?;
        }

        if let Ok(raw) = env::var("STREAM_PING_INTERVAL_SECS") {
            let secs = raw.trim().parse::<u64>().map_err(|_| {
                ConfigError::InvalidConfiguration(format!(
                    "STREAM_PING_INTERVAL_SECS must be a whole number of seconds, got '{}'",
                    raw
                ))
            })?;
            config.ping_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Load a `.env` file (if present) and then read the environment
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file() -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(".env")
    }

    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // no file, fall through to the process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env()
    }

    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(Secret::new(token.into()));
        self
    }

    #[must_use]
    pub const fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub const fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Raw endpoint as configured (use carefully - may contain an access token)
    pub fn endpoint(&self) -> &str {
        self.endpoint.expose_secret()
    }

    pub fn websocket_url(&self) -> Result<String, ConfigError> {
        to_websocket_url(self.endpoint())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint().trim().is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "endpoint cannot be empty".to_string(),
            ));
        }

        let backoff = &self.backoff;
        if backoff.initial_delay.is_zero() || backoff.initial_delay > backoff.max_delay {
            return Err(ConfigError::InvalidConfiguration(format!(
                "backoff initial delay {:?} must be non-zero and not exceed max delay {:?}",
                backoff.initial_delay, backoff.max_delay
            )));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfiguration(format!(
                "backoff multiplier must be >= 1.0, got {}",
                backoff.multiplier
            )));
        }
        if !(0.0..1.0).contains(&backoff.jitter_factor) {
            return Err(ConfigError::InvalidConfiguration(format!(
                "backoff jitter factor must be in [0, 1), got {}",
                backoff.jitter_factor
            )));
        }

        self.websocket_url().map(|_| ())
    }
}

/// Convert an HTTP(S) or WS(S) endpoint into the WebSocket URL the stream connects to.
///
/// `https://host/TOKEN` becomes `wss://host/TOKEN/ws`; URLs whose path already
/// ends in `/ws` keep their path.
pub fn to_websocket_url(endpoint: &str) -> Result<String, ConfigError> {
    let trimmed = endpoint.trim();
    let (scheme, rest) = trimmed.split_once("://").ok_or_else(|| {
        ConfigError::InvalidEndpoint("endpoint is missing a scheme".to_string())
    })?;

    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConfigError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };

    let (location, query) = match rest.split_once('?') {
        Some((location, query)) => (location, Some(query)),
        None => (rest, None),
    };
    let location = location.trim_end_matches('/');
    if location.is_empty() {
        return Err(ConfigError::InvalidEndpoint(
            "endpoint is missing a host".to_string(),
        ));
    }

    let path_is_ws = location
        .rsplit_once('/')
        .is_some_and(|(_, last)| last == WS_PATH_SEGMENT);
    let mut url = if path_is_ws {
        format!("{}://{}", ws_scheme, location)
    } else {
        format!("{}://{}/{}", ws_scheme, location, WS_PATH_SEGMENT)
    };
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }

    let uri = url
        .parse::<Uri>()
        .map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;
    if uri.host().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidEndpoint(
            "endpoint is missing a host".to_string(),
        ));
    }

    Ok(url)
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration_millis(*duration))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_endpoint_becomes_wss() {
        let url = to_websocket_url("https://example.quiknode.pro/TOKEN").unwrap();
        assert_eq!(url, "wss://example.quiknode.pro/TOKEN/ws");
    }

    #[test]
    fn test_ws_endpoint_keeps_path() {
        let url = to_websocket_url("wss://api.hyperliquid.xyz/ws").unwrap();
        assert_eq!(url, "wss://api.hyperliquid.xyz/ws");

        let url = to_websocket_url("http://127.0.0.1:8080/").unwrap();
        assert_eq!(url, "ws://127.0.0.1:8080/ws");
    }

    #[test]
    fn test_query_is_preserved() {
        let url = to_websocket_url("https://host.example/TOKEN?region=eu").unwrap();
        assert_eq!(url, "wss://host.example/TOKEN/ws?region=eu");
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(to_websocket_url("not a url").is_err());
        assert!(to_websocket_url("ftp://host/path").is_err());
        assert!(to_websocket_url("https://").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = StreamConfig::new("https://host.example/TOKEN");
        assert!(config.validate().is_ok());

        config.backoff.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        config.backoff = BackoffConfig {
            initial_delay: Duration::from_secs(60),
            ..BackoffConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization_redacts_secrets() {
        let config = StreamConfig::new("https://host.example/SUPERSECRET").auth_token("tok");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("SUPERSECRET"));
        assert!(!json.contains("\"tok\""));
        assert!(json.contains("[REDACTED]"));
        assert!(json.contains("\"ping_interval_ms\":30000"));
    }

    #[test]
    fn test_builder_setters() {
        let config = StreamConfig::new("wss://host.example/ws")
            .reconnect(false)
            .ping_interval(Duration::ZERO)
            .stop_grace_period(Duration::from_millis(250));
        assert!(!config.reconnect);
        assert!(config.ping_interval.is_zero());
        assert_eq!(config.stop_grace_period, Duration::from_millis(250));
    }
}
