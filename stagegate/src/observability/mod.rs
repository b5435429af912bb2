//! Logging bootstrap and span helpers.

mod span;

pub use span::{stage_span, SpanTimer};

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::WorkflowError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs a global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter.
///
/// # Errors
///
/// Returns [`WorkflowError::Config`] if the filter is invalid or a global
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), WorkflowError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| WorkflowError::Config(format!("invalid log filter '{}': {e}", config.filter)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
    };
    result.map_err(|e| WorkflowError::Config(format!("tracing already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig::default().with_filter("stagegate=verbose");
        assert!(matches!(init_tracing(&config), Err(WorkflowError::Config(_))));
    }
}
