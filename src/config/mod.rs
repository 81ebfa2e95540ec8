//! Configuration loading for trainwatch.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `TRAINWATCH_`, producing a typed, validated [`AppConfig`]. The same
//! configuration drives both the collector (`serve`) and the MQTT bridge
//! (`bridge`); each component receives the slice it needs at construction.

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "TRAINWATCH_";

/// Path of the collector's ingestion endpoint, relative to its base URL.
pub const INGESTION_PATH: &str = "/api/train/detection";

/// Application configuration derived from `TRAINWATCH_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Broker session settings for the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct MqttConfig {
    /// Broker URL, e.g. `tcp://broker.local:1883`
    ///
    /// Environment variable: `TRAINWATCH_MQTT_BROKER_URL`
    #[serde(default = "default_mqtt_broker_url")]
    pub broker_url: String,

    /// Environment variable: `TRAINWATCH_MQTT_CLIENT_ID`
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    /// Topic the device publishes detections to
    ///
    /// Environment variable: `TRAINWATCH_MQTT_TOPIC`
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Time allowed for CONNACK + SUBACK
    #[serde(default = "default_mqtt_connection_timeout_seconds")]
    pub connection_timeout_seconds: u64,

    #[serde(default = "default_mqtt_keep_alive_seconds")]
    pub keep_alive_seconds: u64,

    /// Subscription QoS (0, 1 or 2); at-least-once by default
    #[serde(default = "default_mqtt_qos")]
    pub qos: u8,

    /// Re-establish the session after it drops
    #[serde(default = "default_mqtt_automatic_reconnect")]
    pub automatic_reconnect: bool,

    /// Capacity of the channel between the MQTT event loop and the relay worker
    #[serde(default = "default_mqtt_channel_capacity")]
    pub channel_capacity: usize,

    /// First reconnect delay; doubles per consecutive failure
    #[serde(default = "default_mqtt_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Reconnect delay ceiling
    #[serde(default = "default_mqtt_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

/// Forwarding settings for the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RelayConfig {
    /// Base URL of the collector; events are posted to `{base}/api/train/detection`
    ///
    /// Environment variable: `TRAINWATCH_RELAY_COLLECTOR_BASE_URL`
    #[serde(default = "default_relay_collector_base_url")]
    pub collector_base_url: String,

    /// Per-attempt timeout for a forward call
    #[serde(default = "default_relay_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Forward attempts per message, including the first one
    #[serde(default = "default_relay_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt
    #[serde(default = "default_relay_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Retry delay ceiling
    #[serde(default = "default_relay_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Random extra delay as a fraction of the computed backoff (0.0-1.0)
    #[serde(default = "default_relay_jitter_factor")]
    pub jitter_factor: f64,
}

/// Host and port of the MQTT broker, parsed from [`MqttConfig::broker_url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            mqtt: MqttConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: default_mqtt_broker_url(),
            client_id: default_mqtt_client_id(),
            topic: default_mqtt_topic(),
            username: None,
            password: None,
            connection_timeout_seconds: default_mqtt_connection_timeout_seconds(),
            keep_alive_seconds: default_mqtt_keep_alive_seconds(),
            qos: default_mqtt_qos(),
            automatic_reconnect: default_mqtt_automatic_reconnect(),
            channel_capacity: default_mqtt_channel_capacity(),
            reconnect_base_ms: default_mqtt_reconnect_base_ms(),
            reconnect_max_ms: default_mqtt_reconnect_max_ms(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            collector_base_url: default_relay_collector_base_url(),
            request_timeout_ms: default_relay_request_timeout_ms(),
            max_attempts: default_relay_max_attempts(),
            retry_base_ms: default_relay_retry_base_ms(),
            retry_max_ms: default_relay_retry_max_ms(),
            jitter_factor: default_relay_jitter_factor(),
        }
    }
}

impl MqttConfig {
    /// Parse the broker URL into host and port.
    pub fn endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let url = Url::parse(&self.broker_url).map_err(|source| ConfigError::InvalidBrokerUrl {
            value: self.broker_url.clone(),
            reason: source.to_string(),
        })?;

        if !matches!(url.scheme(), "tcp" | "mqtt") {
            return Err(ConfigError::InvalidBrokerUrl {
                value: self.broker_url.clone(),
                reason: format!("unsupported scheme '{}', expected tcp or mqtt", url.scheme()),
            });
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl {
                value: self.broker_url.clone(),
                reason: "missing host".to_string(),
            })?;

        Ok(BrokerEndpoint {
            host: host.to_string(),
            port: url.port().unwrap_or(1883),
        })
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }

    /// Validate broker session settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;

        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingMqttClientId);
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::MissingMqttTopic);
        }
        if self.qos > 2 {
            return Err(ConfigError::InvalidMqttQos { value: self.qos });
        }
        if self.connection_timeout_seconds == 0 {
            return Err(ConfigError::InvalidMqttConnectionTimeout {
                value: self.connection_timeout_seconds,
            });
        }
        // rumqttc refuses keep-alive intervals below five seconds
        if self.keep_alive_seconds < 5 {
            return Err(ConfigError::InvalidMqttKeepAlive {
                value: self.keep_alive_seconds,
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidMqttChannelCapacity);
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(ConfigError::InvalidReconnectBounds {
                base: self.reconnect_base_ms,
                max: self.reconnect_max_ms,
            });
        }
        if self.username.is_none() && self.password.is_some() {
            return Err(ConfigError::PasswordWithoutUsername);
        }

        Ok(())
    }
}

impl RelayConfig {
    /// Full URL of the collector's ingestion endpoint.
    pub fn ingestion_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCollectorUrl {
            value: self.collector_base_url.clone(),
            reason,
        };

        let base = Url::parse(&self.collector_base_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", base.scheme())));
        }

        let joined = format!(
            "{}{}",
            base.as_str().trim_end_matches('/'),
            INGESTION_PATH
        );
        Url::parse(&joined).map_err(|e| invalid(e.to_string()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate forwarding settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ingestion_url()?;

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidRelayTimeout {
                value: self.request_timeout_ms,
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRelayMaxAttempts);
        }
        if self.retry_base_ms > self.retry_max_ms {
            return Err(ConfigError::InvalidRetryBounds {
                base: self.retry_base_ms,
                max: self.retry_max_ms,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRelayJitter {
                value: self.jitter_factor,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.mqtt.password.is_some() {
            config.mqtt.password = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error for any setting the
    /// bridge or collector could not run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.mqtt.validate()?;
        self.relay.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://trainwatch.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_mqtt_broker_url() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_mqtt_client_id() -> String {
    "trainwatch-bridge".to_string()
}

fn default_mqtt_topic() -> String {
    "train/detection".to_string()
}

fn default_mqtt_connection_timeout_seconds() -> u64 {
    10
}

fn default_mqtt_keep_alive_seconds() -> u64 {
    60
}

fn default_mqtt_qos() -> u8 {
    1 // at-least-once
}

fn default_mqtt_automatic_reconnect() -> bool {
    true
}

fn default_mqtt_channel_capacity() -> usize {
    64
}

fn default_mqtt_reconnect_base_ms() -> u64 {
    1000
}

fn default_mqtt_reconnect_max_ms() -> u64 {
    60_000 // 1 minute
}

fn default_relay_collector_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_relay_request_timeout_ms() -> u64 {
    5000
}

fn default_relay_max_attempts() -> u32 {
    5
}

fn default_relay_retry_base_ms() -> u64 {
    500
}

fn default_relay_retry_max_ms() -> u64 {
    10_000
}

fn default_relay_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("database URL is missing; set TRAINWATCH_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("invalid broker URL '{value}': {reason}")]
    InvalidBrokerUrl { value: String, reason: String },
    #[error("MQTT client id is missing; set TRAINWATCH_MQTT_CLIENT_ID")]
    MissingMqttClientId,
    #[error("MQTT topic is missing; set TRAINWATCH_MQTT_TOPIC")]
    MissingMqttTopic,
    #[error("MQTT QoS must be 0, 1 or 2, got {value}")]
    InvalidMqttQos { value: u8 },
    #[error("MQTT connection timeout must be positive, got {value}")]
    InvalidMqttConnectionTimeout { value: u64 },
    #[error("MQTT keep-alive must be at least 5 seconds, got {value}")]
    InvalidMqttKeepAlive { value: u64 },
    #[error("MQTT channel capacity must be positive")]
    InvalidMqttChannelCapacity,
    #[error("reconnect base delay ({base}ms) must be positive and not exceed max delay ({max}ms)")]
    InvalidReconnectBounds { base: u64, max: u64 },
    #[error("MQTT password is set without a username")]
    PasswordWithoutUsername,
    #[error("invalid collector base URL '{value}': {reason}")]
    InvalidCollectorUrl { value: String, reason: String },
    #[error("relay request timeout must be positive, got {value}")]
    InvalidRelayTimeout { value: u64 },
    #[error("relay max attempts must be at least 1")]
    InvalidRelayMaxAttempts,
    #[error("relay retry base delay ({base}ms) cannot be greater than max delay ({max}ms)")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("relay jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRelayJitter { value: f64 },
}

/// Loads configuration using layered `.env` files and `TRAINWATCH_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    ///
    /// Precedence, lowest first: `.env`, `.env.local`, `.env.{profile}`,
    /// `.env.{profile}.local`, process environment.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections =
            take_parsed(&mut layered, "DB_MAX_CONNECTIONS", default_db_max_connections)?;
        let db_acquire_timeout_ms =
            take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS", default_db_acquire_timeout_ms)?;

        let mqtt = MqttConfig {
            broker_url: take_string(&mut layered, "MQTT_BROKER_URL")
                .unwrap_or_else(default_mqtt_broker_url),
            client_id: take_string(&mut layered, "MQTT_CLIENT_ID")
                .unwrap_or_else(default_mqtt_client_id),
            topic: take_string(&mut layered, "MQTT_TOPIC").unwrap_or_else(default_mqtt_topic),
            username: take_string(&mut layered, "MQTT_USERNAME"),
            password: take_string(&mut layered, "MQTT_PASSWORD"),
            connection_timeout_seconds: take_parsed(
                &mut layered,
                "MQTT_CONNECTION_TIMEOUT_SECONDS",
                default_mqtt_connection_timeout_seconds,
            )?,
            keep_alive_seconds: take_parsed(
                &mut layered,
                "MQTT_KEEP_ALIVE_SECONDS",
                default_mqtt_keep_alive_seconds,
            )?,
            qos: take_parsed(&mut layered, "MQTT_QOS", default_mqtt_qos)?,
            automatic_reconnect: take_bool(
                &mut layered,
                "MQTT_AUTOMATIC_RECONNECT",
                default_mqtt_automatic_reconnect,
            )?,
            channel_capacity: take_parsed(
                &mut layered,
                "MQTT_CHANNEL_CAPACITY",
                default_mqtt_channel_capacity,
            )?,
            reconnect_base_ms: take_parsed(
                &mut layered,
                "MQTT_RECONNECT_BASE_MS",
                default_mqtt_reconnect_base_ms,
            )?,
            reconnect_max_ms: take_parsed(
                &mut layered,
                "MQTT_RECONNECT_MAX_MS",
                default_mqtt_reconnect_max_ms,
            )?,
        };

        let relay = RelayConfig {
            collector_base_url: take_string(&mut layered, "RELAY_COLLECTOR_BASE_URL")
                .unwrap_or_else(default_relay_collector_base_url),
            request_timeout_ms: take_parsed(
                &mut layered,
                "RELAY_REQUEST_TIMEOUT_MS",
                default_relay_request_timeout_ms,
            )?,
            max_attempts: take_parsed(
                &mut layered,
                "RELAY_MAX_ATTEMPTS",
                default_relay_max_attempts,
            )?,
            retry_base_ms: take_parsed(
                &mut layered,
                "RELAY_RETRY_BASE_MS",
                default_relay_retry_base_ms,
            )?,
            retry_max_ms: take_parsed(
                &mut layered,
                "RELAY_RETRY_MAX_MS",
                default_relay_retry_max_ms,
            )?,
            jitter_factor: take_parsed(
                &mut layered,
                "RELAY_JITTER_FACTOR",
                default_relay_jitter_factor,
            )?,
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            mqtt,
            relay,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn take_parsed<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> Result<T, ConfigError> {
    match take_string(layered, key) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value,
        }),
        None => Ok(default()),
    }
}

fn take_bool(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> bool,
) -> Result<bool, ConfigError> {
    match take_string(layered, key) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                value,
            }),
        },
        None => Ok(default()),
    }
}
