//! Structured logging setup
//!
//! JSON logs through tracing-subscriber, filtered by `RUST_LOG` when set.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,capi_operator=debug,capi_operator_provider=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Emit JSON lines (default) or human-readable output
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: true,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Install the global tracing subscriber
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        let config = TelemetryConfig::default();
        assert!(config.json);
        assert!(EnvFilter::try_new(&config.default_filter).is_ok());
    }
}
