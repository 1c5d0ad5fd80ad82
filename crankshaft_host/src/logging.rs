//! Tracing subscriber setup for host processes.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::HostConfig;

/// Build the filter: `RUST_LOG` when set, otherwise `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber described by `config`.
///
/// Returns false when a subscriber was already installed, which is normal
/// in tests and when embedding the host.
pub fn init_logging(config: &HostConfig) -> bool {
    let filter = env_filter(&config.log_level);

    let result = if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let config = HostConfig::default();
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let filter = env_filter("not a level ][");
        assert!(!filter.to_string().is_empty());
    }
}
