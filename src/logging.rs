//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{AppResult, DaqError};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level so operators can raise
/// verbosity for a single run without touching the configuration file.
pub fn init(config: &LoggingConfig) -> AppResult<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(config)?)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| DaqError::Configuration(format!("Logging already initialized: {e}")))
}

fn filter(config: &LoggingConfig) -> AppResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| DaqError::Configuration(format!("Invalid log filter: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_builds_a_filter() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json: true,
        };
        assert!(filter(&config).is_ok());
    }
}
