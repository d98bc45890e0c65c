//! Log levels as they appear in the `[logging]` config section.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing_subscriber::filter::{Directive, LevelFilter};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LevelParseError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    #[error("invalid module log level, expected `module=level`: {0}")]
    InvalidDirective(String),
}

/// Global level, e.g. `info`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLevel(pub LevelFilter);

impl Default for LogLevel {
    fn default() -> Self {
        Self(LevelFilter::INFO)
    }
}

impl FromStr for LogLevel {
    type Err = LevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse()
            .map(Self)
            .map_err(|_| LevelParseError::InvalidLevel(s.to_string()))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<LogLevel> for Directive {
    fn from(level: LogLevel) -> Self {
        level.0.into()
    }
}

/// Level of a single module, e.g. `ipns_publisher=debug`.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetLevel(pub Directive);

impl FromStr for TargetLevel {
    type Err = LevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((target, level)) = s.split_once('=') else {
            return Err(LevelParseError::InvalidDirective(s.to_string()));
        };
        if target.is_empty() || level.parse::<LevelFilter>().is_err() {
            return Err(LevelParseError::InvalidDirective(s.to_string()));
        }
        s.parse()
            .map(Self)
            .map_err(|_| LevelParseError::InvalidDirective(s.to_string()))
    }
}

impl fmt::Display for TargetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<TargetLevel> for Directive {
    fn from(level: TargetLevel) -> Self {
        level.0
    }
}

macro_rules! serde_via_str {
    ($type:ty) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_str!(LogLevel);
serde_via_str!(TargetLevel);
