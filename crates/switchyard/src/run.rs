//! Process entry point wiring settings, telemetry and the hub together.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoError;
use serde_json::{Map, Value};
use thiserror::Error;

use switchyard_config::{Config, split_settings_arguments};

use crate::binding::deep_merge;
use crate::error::HubError;
use crate::hub::{HUB_TARGET, Hub, InitOutcome};
use crate::listener::StructuredListener;
use crate::registry::Registry;
use crate::shutdown::{ShutdownError, SystemShutdownSignal};
use crate::telemetry::{self, TelemetryError};

/// Errors that end a hub process.
#[derive(Debug, Error)]
pub enum RunError {
    /// Hub settings failed to load.
    #[error("failed to load settings: {0}")]
    Settings(#[source] Arc<OrthoError>),
    /// Telemetry could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// The providers file could not be read.
    #[error("failed to read providers file {path}: {source}")]
    Load {
        /// File that failed to load.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The providers file is not valid YAML or JSON.
    #[error("failed to parse providers configuration {origin}: {message}")]
    Parse {
        /// File path, or `inline` for embedded content.
        origin: String,
        /// Parser message.
        message: String,
    },
    /// The hub failed.
    #[error(transparent)]
    Hub(#[from] HubError),
    /// Signal handlers could not be installed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    /// Writing `--providers` or `--graph` output failed.
    #[error("failed to write output: {0}")]
    Output(#[source] io::Error),
}

/// How a binary locates its provider configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    name: String,
    providers_file: Option<Utf8PathBuf>,
    content: Option<String>,
    defaults: Option<Value>,
}

impl RunOptions {
    /// Options for a binary called `name`; the providers file defaults to
    /// `<name>.yaml` in the working directory.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Providers file used when the settings do not name one.
    #[must_use]
    pub fn with_providers_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.providers_file = Some(path.into());
        self
    }

    /// YAML or JSON content used when no providers file is found.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Configuration filling keys the providers file does not define.
    #[must_use]
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.defaults = Some(defaults);
        self
    }

    fn default_file(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.yaml", self.name))
    }
}

/// Runs the hub with the process arguments and environment.
///
/// # Errors
///
/// See [`run_with_args`].
pub fn run(registry: Arc<Registry>, options: RunOptions) -> Result<(), RunError> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_with_args(registry, options, std::env::args_os(), &mut out)
}

/// Loads settings and provider configuration, initialises the hub and runs
/// it until every provider returns or a shutdown signal closes it.
///
/// `--providers`, `--graph` and `--help` write to `out` and return without
/// starting providers.
///
/// # Errors
///
/// Returns the first settings, configuration, Init, Start or Close failure.
pub fn run_with_args<I>(
    registry: Arc<Registry>,
    options: RunOptions,
    args: I,
    out: &mut dyn Write,
) -> Result<(), RunError>
where
    I: IntoIterator<Item = OsString>,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = split_settings_arguments(&args);
    let settings =
        Config::load_with_args(split.settings_arguments).map_err(RunError::Settings)?;
    telemetry::initialise(&settings)?;

    let providers = load_providers(&options, &settings)?;
    let hub = Hub::builder(registry)
        .with_listener(StructuredListener::new())
        .with_shutdown_timeout(settings.shutdown_timeout())
        .build();

    let outcome = match hub.init(&providers, &split.hub_arguments) {
        Ok(outcome) => outcome,
        Err(error) if error.is_display_request() => {
            return write!(out, "{error}").map_err(RunError::Output);
        }
        Err(error) => {
            hub.notify_exit(Some(&error));
            return Err(error.into());
        }
    };

    match outcome {
        InitOutcome::Ready => {}
        InitOutcome::ListProviders(text) | InitOutcome::ShowGraph(text) => {
            return out.write_all(text.as_bytes()).map_err(RunError::Output);
        }
    }

    let signal = SystemShutdownSignal::install()?;
    hub.start_with_shutdown(Arc::new(signal))?;
    Ok(())
}

/// Reads the providers configuration selected by `settings` and `options`.
pub(crate) fn load_providers(options: &RunOptions, settings: &Config) -> Result<Value, RunError> {
    let mut config = match configured_file(options, settings) {
        Some(path) => {
            let text = fs::read_to_string(&path).map_err(|source| RunError::Load {
                path: path.clone(),
                source,
            })?;
            tracing::info!(target: HUB_TARGET, path = %path, "loading providers file");
            parse_providers(&text, Some(&path))?
        }
        None => match &options.content {
            Some(content) => parse_providers(content, None)?,
            None => Value::Object(Map::new()),
        },
    };

    if let Some(defaults) = &options.defaults {
        let mut merged = defaults.clone();
        if !config.is_null() {
            deep_merge(&mut merged, config);
        }
        config = merged;
    }
    Ok(config)
}

fn configured_file(options: &RunOptions, settings: &Config) -> Option<Utf8PathBuf> {
    if let Some(path) = settings.providers_file() {
        return Some(path);
    }
    if let Some(path) = &options.providers_file {
        return Some(path.clone());
    }
    let fallback = options.default_file();
    fallback.exists().then_some(fallback)
}

/// Parses YAML for inline content and `.yaml`/`.yml` files, JSON otherwise.
pub(crate) fn parse_providers(text: &str, path: Option<&Utf8Path>) -> Result<Value, RunError> {
    let origin = path.map_or_else(|| "inline".to_owned(), Utf8Path::to_string);
    let is_yaml = path.is_none_or(|file| {
        file.extension().is_some_and(|extension| {
            extension.eq_ignore_ascii_case("yaml") || extension.eq_ignore_ascii_case("yml")
        })
    });
    if is_yaml {
        serde_saphyr::from_str::<Value>(text).map_err(|error| RunError::Parse {
            origin,
            message: error.to_string(),
        })
    } else {
        serde_json::from_str(text).map_err(|error| RunError::Parse {
            origin,
            message: error.to_string(),
        })
    }
}
