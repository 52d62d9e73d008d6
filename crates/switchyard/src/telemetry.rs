//! Structured telemetry initialisation for hub processes.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use switchyard_config::{Config, LogFormat};

const TELEMETRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::telemetry");

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global tracing subscriber on first use.
///
/// The subscriber writes to stderr in the configured [`LogFormat`], filtered
/// by [`Config::log_filter`]. JSON events carry the enclosing provider span,
/// so every line emitted through a provider logger names its instance key.
/// Later calls return a fresh [`TelemetryHandle`] without touching the
/// global subscriber, even when their settings differ.
///
/// # Examples
///
/// ```rust
/// use switchyard::telemetry;
/// use switchyard_config::Config;
///
/// # fn main() -> Result<(), telemetry::TelemetryError> {
/// let config = Config::default();
/// let first = telemetry::initialise(&config)?;
/// let second = telemetry::initialise(&config)?;
///
/// // Only the first call installed the subscriber.
/// drop(first);
/// drop(second);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] when the filter expression does not
/// parse and [`TelemetryError::Subscriber`] when another global subscriber
/// was installed outside this module.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| TelemetryHandle)
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let builder = |filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_thread_names(true)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_timer(fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(
            builder(filter)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .finish(),
        ),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)?;
    tracing::debug!(
        target: TELEMETRY_TARGET,
        filter = config.log_filter(),
        format = %config.log_format(),
        "telemetry installed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_filters_before_installing() {
        let config = Config {
            log_filter: Some("switchyard=loudest".to_owned()),
            ..Config::default()
        };

        let error = install_subscriber(&config).expect_err("filter must be rejected");

        assert!(matches!(error, TelemetryError::Filter(_)));
    }
}
