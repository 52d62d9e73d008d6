//! Runtime settings shared by the switchyard hub and its binaries.
//!
//! Settings are resolved with layered precedence: compiled defaults, then an
//! optional configuration file, then `SWITCHYARD_*` environment variables,
//! then command-line flags. Provider-level configuration lives in a separate
//! providers file (see [`Config::providers_file`]) and is bound by the hub
//! itself; this crate only decides where that file lives and how the hub
//! process behaves around it.

mod arguments;
mod defaults;
mod logging;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};

pub use arguments::{SETTINGS_CLI_FLAGS, SettingsArgumentSplit, split_settings_arguments};
pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_SHUTDOWN_TIMEOUT_SECS, default_log_filter, default_log_format,
    default_shutdown_timeout,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Hub runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "SWITCHYARD")]
pub struct Config {
    /// Path of the providers file describing which instances to build.
    pub providers_file: Option<String>,
    /// `tracing` filter expression applied to the subscriber.
    #[ortho_config(default = DEFAULT_LOG_FILTER.to_owned())]
    pub log_filter: Option<String>,
    /// Output format of the subscriber.
    pub log_format: Option<LogFormat>,
    /// Seconds granted to Close before the process is forced to exit.
    #[ortho_config(default = DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    pub shutdown_timeout_secs: Option<u64>,
}

impl Config {
    /// Loads settings from the process arguments and environment.
    pub fn load_with_args<I>(args: I) -> Result<Self, Arc<OrthoError>>
    where
        I: IntoIterator<Item = OsString>,
    {
        let collected: Vec<OsString> = args.into_iter().collect();
        Self::load_from_iter(collected)
    }

    /// Providers file path, when one was configured.
    #[must_use]
    pub fn providers_file(&self) -> Option<Utf8PathBuf> {
        self.providers_file.as_deref().map(Utf8PathBuf::from)
    }

    /// Effective log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Effective log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or_else(default_log_format)
    }

    /// Effective shutdown grace period.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout_secs
            .map_or_else(default_shutdown_timeout, Duration::from_secs)
    }
}
