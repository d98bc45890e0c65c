//!
//! Tracing initialisation.
//!
//! `RUST_LOG` always wins. Otherwise the `[logging]` section of the config is
//! used and, without one, the filter passed on the command line.
//!

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Filter used when neither `RUST_LOG`, the config nor the CLI set one.
pub const DEFAULT_ENV_FILTER: &str = "ipns_relay=info,ipns_publisher=info,tower_http=debug";

/// Builds the filter from the config, falling back to `fallback`.
pub fn config_filter(logging: Option<&LoggingConfig>, fallback: Option<&str>) -> EnvFilter {
    match logging {
        Some(logging) => {
            let mut filter = EnvFilter::new("").add_directive(logging.level.clone().into());
            for module_level in logging.module_levels.iter() {
                filter = filter.add_directive(module_level.clone().into());
            }
            filter
        }
        None => EnvFilter::new(fallback.unwrap_or(DEFAULT_ENV_FILTER)),
    }
}

/// Initialise the global tracing subscriber.
pub fn init_tracing(logging: Option<&LoggingConfig>, fallback: Option<&str>) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config_filter(logging, fallback));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_from_config() {
        let logging = LoggingConfig {
            level: "warn".parse().unwrap(),
            module_levels: vec!["ipns_publisher=debug".parse().unwrap()],
        };
        let filter = config_filter(Some(&logging), Some("trace")).to_string();
        assert!(filter.contains("ipns_publisher=debug"), "{filter}");
        assert!(filter.contains("warn"), "{filter}");
    }

    #[test]
    fn fallback_filter() {
        let filter = config_filter(None, Some("ipns_relay=trace")).to_string();
        assert_eq!(filter, "ipns_relay=trace");
        let filter = config_filter(None, None).to_string();
        assert!(filter.contains("ipns_publisher=info"), "{filter}");
    }
}
