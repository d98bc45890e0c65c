//!
//! Configuration of the relay.
//!
//! The TOML file only needs to contain the values that differ from the
//! defaults below. Every section and value is optional.
//!

use std::{
    fs,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    num::NonZeroUsize,
    path::Path,
    str::FromStr,
    time::Duration,
};

use ipns_publisher::{
    CoordinatorSettings, FreshnessPolicy, IngestSettings, PublisherSettings,
    DEFAULT_COLLISION_BACKOFF, DEFAULT_CONCURRENCY, DEFAULT_KUBO_API_URL, DEFAULT_LOOKUP_TIMEOUT,
    DEFAULT_PUT_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::log_level::{LogLevel, TargetLevel};

pub const DEFAULT_LISTEN_SOCKET: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8000));
pub const DEFAULT_FEED_ENDPOINT: &str = "wss://name.web3.storage";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Example configuration file
pub const SAMPLE_CONFIG: &str = include_str!("../config.sample.toml");

#[derive(Debug, thiserror::Error)]
pub enum ConfigReadError {
    /// The file did not exist or could not be read.
    #[error("config file not found: {0}")]
    ConfigFileNotFound(#[from] std::io::Error),
    /// The TOML was syntactically invalid.
    #[error("config file is not valid TOML: {0}")]
    ConfigFileNotValid(#[from] toml::de::Error),
    /// A value is out of its allowed range.
    #[error("invalid config value {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct RelayToml {
    pub enabled: Option<bool>,
    pub listen_socket: Option<SocketAddr>,
    /// Value the `Authorization` header of `/broadcast` must have.
    pub auth_secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct FeedToml {
    pub enabled: Option<bool>,
    pub endpoint: Option<Url>,
    pub reconnect_delay_s: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PublisherToml {
    pub concurrency: Option<usize>,
    pub collision_backoff_s: Option<u64>,
    pub put_timeout_s: Option<u64>,
    pub freshness: Option<FreshnessPolicy>,
    pub lookup_timeout_s: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct StoreToml {
    pub kubo_api_url: Option<Url>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct LoggingToml {
    pub level: Option<LogLevel>,
    pub module_levels: Option<Vec<TargetLevel>>,
}

/// The config file as written.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ConfigToml {
    pub relay: Option<RelayToml>,
    pub feed: Option<FeedToml>,
    pub publisher: Option<PublisherToml>,
    pub store: Option<StoreToml>,
    pub logging: Option<LoggingToml>,
}

impl ConfigToml {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigReadError> {
        let raw = fs::read_to_string(path)?;
        Ok(raw.parse()?)
    }
}

impl FromStr for ConfigToml {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub module_levels: Vec<TargetLevel>,
}

/// Resolved relay configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Serve `/broadcast`.
    pub server_enabled: bool,
    pub listen_socket: SocketAddr,
    /// Required `Authorization` header value. No authorization if `None`.
    pub auth_secret: Option<String>,

    /// Watch the name feed.
    pub feed_enabled: bool,
    pub feed_endpoint: Url,
    pub reconnect_delay: Duration,

    pub concurrency: NonZeroUsize,
    pub collision_backoff: Duration,
    pub put_timeout: Duration,
    pub freshness: FreshnessPolicy,
    pub lookup_timeout: Duration,

    pub kubo_api_url: Url,

    /// Only set when the config file has a `[logging]` section.
    pub logging: Option<LoggingConfig>,
}

fn seconds(key: &'static str, value: Option<u64>, default: Duration) -> Result<Duration, ConfigReadError> {
    match value {
        None => Ok(default),
        Some(0) => Err(ConfigReadError::InvalidValue {
            key,
            reason: "must be at least 1 second".to_string(),
        }),
        Some(value) => Ok(Duration::from_secs(value)),
    }
}

fn default_url(url: &str) -> Url {
    Url::parse(url).expect("default urls are valid")
}

impl Config {
    /// Load the config from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigReadError> {
        Self::try_from(ConfigToml::from_file(path)?)
    }

    /// Parse the config from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigReadError> {
        Self::try_from(raw.parse::<ConfigToml>()?)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        let mut publisher = PublisherSettings::new();
        publisher.put_timeout(self.put_timeout);
        let mut settings = CoordinatorSettings::new();
        settings
            .concurrency(self.concurrency)
            .collision_backoff(self.collision_backoff)
            .publisher(publisher);
        settings
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        let mut settings = IngestSettings::new();
        settings
            .freshness(self.freshness)
            .lookup_timeout(self.lookup_timeout);
        settings
    }
}

impl TryFrom<ConfigToml> for Config {
    type Error = ConfigReadError;

    fn try_from(toml: ConfigToml) -> Result<Self, Self::Error> {
        let relay = toml.relay.unwrap_or_default();
        let feed = toml.feed.unwrap_or_default();
        let publisher = toml.publisher.unwrap_or_default();
        let store = toml.store.unwrap_or_default();

        let concurrency = NonZeroUsize::new(publisher.concurrency.unwrap_or(DEFAULT_CONCURRENCY))
            .ok_or(ConfigReadError::InvalidValue {
                key: "publisher.concurrency",
                reason: "must be at least 1".to_string(),
            })?;

        Ok(Config {
            server_enabled: relay.enabled.unwrap_or(true),
            listen_socket: relay.listen_socket.unwrap_or(DEFAULT_LISTEN_SOCKET),
            auth_secret: relay.auth_secret.filter(|secret| !secret.is_empty()),
            feed_enabled: feed.enabled.unwrap_or(true),
            feed_endpoint: feed
                .endpoint
                .unwrap_or_else(|| default_url(DEFAULT_FEED_ENDPOINT)),
            reconnect_delay: seconds(
                "feed.reconnect_delay_s",
                feed.reconnect_delay_s,
                DEFAULT_RECONNECT_DELAY,
            )?,
            concurrency,
            collision_backoff: seconds(
                "publisher.collision_backoff_s",
                publisher.collision_backoff_s,
                DEFAULT_COLLISION_BACKOFF,
            )?,
            put_timeout: seconds(
                "publisher.put_timeout_s",
                publisher.put_timeout_s,
                DEFAULT_PUT_TIMEOUT,
            )?,
            freshness: publisher.freshness.unwrap_or_default(),
            lookup_timeout: seconds(
                "publisher.lookup_timeout_s",
                publisher.lookup_timeout_s,
                DEFAULT_LOOKUP_TIMEOUT,
            )?,
            kubo_api_url: store
                .kubo_api_url
                .unwrap_or_else(|| default_url(DEFAULT_KUBO_API_URL)),
            logging: toml.logging.map(|logging| LoggingConfig {
                level: logging.level.unwrap_or_default(),
                module_levels: logging.module_levels.unwrap_or_default(),
            }),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_enabled: true,
            listen_socket: DEFAULT_LISTEN_SOCKET,
            auth_secret: None,
            feed_enabled: true,
            feed_endpoint: default_url(DEFAULT_FEED_ENDPOINT),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            concurrency: NonZeroUsize::new(DEFAULT_CONCURRENCY).unwrap_or(NonZeroUsize::MIN),
            collision_backoff: DEFAULT_COLLISION_BACKOFF,
            put_timeout: DEFAULT_PUT_TIMEOUT,
            freshness: FreshnessPolicy::default(),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            kubo_api_url: default_url(DEFAULT_KUBO_API_URL),
            logging: None,
        }
    }
}
