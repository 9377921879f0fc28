//! Logging initialisation and span helpers.
//!
//! Every refresh and every retention operation runs inside a span created
//! here so that log lines carry the table, reason and tier consistently.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
/// `RUST_LOG` controls levels (e.g. `info`, `tidemark_flow=debug`).
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates the span a single table refresh runs in.
///
/// # Example
///
/// ```rust
/// use tidemark_core::observability::refresh_span;
///
/// let span = refresh_span("orders_clean", "INCREMENTAL", "incremental");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn refresh_span(table: &str, reason: &str, tier: &str) -> Span {
    tracing::info_span!("refresh", table = table, reason = reason, tier = tier)
}

/// Creates the span for a retention store operation.
#[must_use]
pub fn retention_span(operation: &str, table: &str) -> Span {
    tracing::info_span!("retention", op = operation, table = table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn test_log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_spans_enter() {
        let span = refresh_span("orders_clean", "FORCED", "bulk");
        let _guard = span.enter();
        tracing::info!("inside refresh span");
        let span = retention_span("snapshot", "orders_clean");
        let _guard = span.enter();
        tracing::info!("inside retention span");
    }
}
