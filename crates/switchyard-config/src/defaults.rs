use std::time::Duration;

/// Default log filter expression used by the hub runtime.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Grace period granted to provider shutdown before the process is forced
/// to exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default log filter expression used by the hub runtime.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Default logging format for the hub runtime.
#[must_use]
pub const fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

/// Default shutdown grace period.
#[must_use]
pub const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
}
