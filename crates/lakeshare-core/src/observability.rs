//! Observability infrastructure.
//!
//! Structured logging with consistent spans. Every invocation of the
//! dispatcher, grant handler, or admin bootstrap runs inside one of the spans
//! built here so that log lines can be correlated per listing and per grant key.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
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
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "log format must be json or pretty (got {other})"
            ))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Logs go to stderr. Call once at startup. Safe to call multiple times;
/// subsequent calls are no-ops. `RUST_LOG` controls levels (e.g. `info`,
/// `lakeshare_flow=debug`).
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

/// Creates a span for a dispatcher invocation.
#[must_use]
pub fn dispatch_span(event_id: &str, listing_id: &str, detail_type: &str) -> Span {
    tracing::info_span!(
        "dispatch",
        event_id = event_id,
        listing_id = listing_id,
        detail_type = detail_type,
    )
}

/// Creates a span for a grant handler invocation, keyed like the ledger.
#[must_use]
pub fn grant_span(event_id: &str, principal: &str, asset: &str) -> Span {
    tracing::info_span!(
        "grant",
        event_id = event_id,
        principal = principal,
        asset = asset,
    )
}

/// Creates a span for an admin reconciliation run.
#[must_use]
pub fn reconcile_span(account_id: &str, declared: usize) -> Span {
    tracing::info_span!("reconcile_admins", account_id = account_id, declared = declared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json); // no-op
    }

    #[test]
    fn test_log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_spans_enter() {
        let span = grant_span("evt-1", "arn:aws:iam::222222222222:role/consumer", "sales.orders");
        let _guard = span.enter();
        tracing::info!("inside grant span");
    }
}
