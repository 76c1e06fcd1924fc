use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_wait_slice_ms: u64,
    /// After a failed connect, requests skip MQTT for this long. 0 disables.
    pub mqtt_retry_backoff_ms: u64,

    /// Topic prefix every published topic hangs under, without trailing slash.
    pub entry_point: String,

    pub proxy_url: String,
    pub proxy_path: String,
    pub proxy_enabled: bool,
    pub proxy_timeout_ms: u64,

    pub verbose: bool,
    pub http_addr: SocketAddr,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

const MIN_TIMEOUT: u64 = 100;
const MAX_TIMEOUT: u64 = 1_000_000;

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("OBSERVER_MQTT_CONNECT_TIMEOUT_MS", self.mqtt_connect_timeout_ms),
            ("OBSERVER_MQTT_WAIT_SLICE_MS", self.mqtt_wait_slice_ms),
            ("OBSERVER_PROXY_TIMEOUT_MS", self.proxy_timeout_ms),
        ] {
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        if self.mqtt_retry_backoff_ms > MAX_TIMEOUT {
            return Err(ConfigError::ParsingError(format!(
                "OBSERVER_MQTT_RETRY_BACKOFF_MS must not exceed {} ms",
                MAX_TIMEOUT
            )));
        }

        if self.mqtt_wait_slice_ms > self.mqtt_connect_timeout_ms {
            return Err(ConfigError::ParsingError(
                "OBSERVER_MQTT_WAIT_SLICE_MS must not exceed OBSERVER_MQTT_CONNECT_TIMEOUT_MS"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let parse_u64 = |key: &str, default: &str| {
            var(key, default)
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", key)))
        };

        let client_id = var("OBSERVER_MQTT_CLIENTID", "observerip-proxy");
        let client_id = if client_id.trim().is_empty() {
            format!("observer_bridge_{}", Uuid::new_v4())
        } else {
            client_id
        };

        let http_addr = var("OBSERVER_HTTP_ADDR", "0.0.0.0:8080");

        let config = Self {
            // MQTT Configuration
            mqtt_host: var("OBSERVER_MQTT_HOST", "192.168.1.1"),
            mqtt_port: var("OBSERVER_MQTT_PORT", "1883")
                .trim()
                .parse::<u16>()
                .map_err(|_| {
                    ConfigError::ParsingError("OBSERVER_MQTT_PORT must be a valid number".to_string())
                })?,
            mqtt_client_id: client_id,
            mqtt_username: var("OBSERVER_MQTT_USERNAME", ""),
            mqtt_password: var("OBSERVER_MQTT_PASSWORD", ""),
            mqtt_connect_timeout_ms: parse_u64("OBSERVER_MQTT_CONNECT_TIMEOUT_MS", "5000")?,
            mqtt_wait_slice_ms: parse_u64("OBSERVER_MQTT_WAIT_SLICE_MS", "1000")?,
            mqtt_retry_backoff_ms: parse_u64("OBSERVER_MQTT_RETRY_BACKOFF_MS", "2000")?,
            entry_point: var("OBSERVER_MQTT_ENTRYPOINT", "/test/meteo")
                .trim_end_matches('/')
                .to_string(),

            // Upstream collector
            proxy_url: var("OBSERVER_PROXY_URL", "http://rtupdate.wunderground.com")
                .trim_end_matches('/')
                .to_string(),
            proxy_path: var(
                "OBSERVER_PROXY_PATH",
                "/weatherstation/updateweatherstation.php",
            ),
            proxy_enabled: parse_bool("OBSERVER_PROXY_ENABLED", &var("OBSERVER_PROXY_ENABLED", "false"))?,
            proxy_timeout_ms: parse_u64("OBSERVER_PROXY_TIMEOUT_MS", "10000")?,

            verbose: parse_bool("OBSERVER_VERBOSE", &var("OBSERVER_VERBOSE", "false"))?,
            http_addr: http_addr
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::MissingOrInvalid("OBSERVER_HTTP_ADDR".to_string()))?,
        };

        if config.proxy_path.is_empty() {
            return Err(ConfigError::MissingOrInvalid("OBSERVER_PROXY_PATH".to_string()));
        }

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    /// Joins the entry point and a topic suffix into a full topic.
    pub fn topic(&self, suffix: &str) -> String {
        prepend_root_topic(&self.entry_point, suffix)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_connect_timeout_ms)
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.mqtt_wait_slice_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.mqtt_retry_backoff_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }
}

fn prepend_root_topic(root: &str, topic: &str) -> String {
    if !root.is_empty() {
        format!("{}/{}", root.trim_end_matches('/'), topic.trim_start_matches('/'))
    } else {
        topic.to_string()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::ParsingError(format!("{} must be a boolean", key))),
    }
}

#[cfg(test)]
impl Config {
    /// Defaults with forwarding off, for tests that need a config value.
    pub fn for_tests() -> Self {
        Self::from_source(|_| None).expect("default configuration is valid")
    }
}
