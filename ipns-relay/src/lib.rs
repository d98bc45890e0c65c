//! Relays IPNS record updates from an HTTP endpoint and a websocket name feed
//! to the DHT, through [ipns_publisher].

mod auth;
pub mod config;
mod feed;
mod http_error;
mod log_level;
mod relay;
mod server;
pub mod tracing;

pub use auth::{AuthorizationLayer, AuthorizationMiddleware};
pub use config::{Config, ConfigReadError, ConfigToml};
pub use feed::{FeedWatcher, WATCH_PATH};
pub use log_level::{LevelParseError, LogLevel, TargetLevel};
pub use relay::IpnsRelay;
pub use server::{BroadcastServer, BroadcastServerBuilder};
