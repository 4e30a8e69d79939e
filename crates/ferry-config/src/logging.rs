//! Tracing subscriber setup
//!
//! Installs a global `tracing-subscriber` registry writing to stderr. Only the
//! first successful call installs anything; embedders that already set a
//! subscriber keep theirs.

use crate::settings::{LogFormat, LoggingConfig};
use crate::{ConfigError, ConfigResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber described by `config`
///
/// Returns `Ok(false)` when another subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> ConfigResult<bool> {
    let filter = build_filter(&config.filter)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Compact => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init()
            .is_ok(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr).pretty())
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::debug!(filter = %config.filter, format = %config.format, "logging initialised");
    }
    Ok(installed)
}

fn build_filter(directive: &str) -> ConfigResult<EnvFilter> {
    EnvFilter::try_new(directive).map_err(|e| ConfigError::InvalidValue {
        field: "logging.filter".to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_is_rejected() {
        let config = LoggingConfig {
            filter: "ferry=loudest".to_string(),
            format: LogFormat::Compact,
        };
        assert!(matches!(
            init_logging(&config),
            Err(ConfigError::InvalidValue { field, .. }) if field == "logging.filter"
        ));
    }

    #[test]
    fn test_second_init_reports_existing_subscriber() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config).unwrap();
        assert!(!init_logging(&config).unwrap());
    }
}
