//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Build the filter for `level`, letting `RUST_LOG` take precedence.
pub fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()))
}

/// Install the global fmt subscriber.
///
/// Returns `false` when a subscriber was already installed, which leaves the
/// existing one in place.
pub fn init(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(&config.level))
        .try_init()
        .is_ok()
}
