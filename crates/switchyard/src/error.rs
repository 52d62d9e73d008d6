//! Error taxonomy for hub construction and the provider lifecycle.

use std::fmt;

use thiserror::Error;

use crate::hub::HubState;
use crate::provider::ProviderError;
use crate::shutdown::ShutdownError;

/// Errors raised while populating a [`Registry`](crate::Registry).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A definition was already registered under this name.
    #[error("provider {name} already registered")]
    DuplicateProvider {
        /// Name registered twice.
        name: String,
    },
}

/// Malformed or inconsistent provider configuration.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The configuration root is not a mapping.
    #[error("provider configuration must be a mapping")]
    NotAMapping,
    /// A provider block is neither a mapping nor empty.
    #[error("configuration block of {key} must be a mapping")]
    MalformedBlock {
        /// Offending configuration key.
        key: String,
    },
    /// A reserved key inside a block carries the wrong type.
    #[error("reserved key {field} of {key} must be a {expected}")]
    InvalidReservedKey {
        /// Configuration key of the block.
        key: String,
        /// Reserved key, such as `_enable`.
        field: &'static str,
        /// Expected value type.
        expected: &'static str,
    },
    /// An entry of the `providers` list does not name its provider.
    #[error("entry {index} of the providers list has no _name")]
    MissingName {
        /// Position of the entry in the list.
        index: usize,
    },
    /// A configuration key derives an empty provider name.
    #[error("provider name of {key} must not be empty")]
    EmptyProviderName {
        /// Offending configuration key.
        key: String,
    },
    /// The same instance key was configured twice.
    #[error("provider instance {key} configured more than once")]
    DuplicateInstance {
        /// Instance key seen twice.
        key: String,
    },
    /// No definition is registered under the requested name.
    #[error("provider {name} not found (configured as {key})")]
    ProviderNotFound {
        /// Provider name looked up in the registry.
        name: String,
        /// Configuration key that referenced it.
        key: String,
    },
    /// A dependency names a service whose only providers are disabled.
    #[error("provider {requester} depends on service {service}, which is only offered by disabled instances")]
    DisabledDependency {
        /// Requested service.
        service: String,
        /// Provider declaring the dependency.
        requester: String,
    },
    /// The compiled defaults of a configuration struct failed to serialise.
    #[error("failed to build default configuration of provider {provider}: {source}")]
    Defaults {
        /// Provider whose defaults failed.
        provider: String,
        /// Underlying serialisation error.
        #[source]
        source: serde_json::Error,
    },
    /// The merged configuration does not fit the configuration struct.
    #[error("invalid configuration for provider {key}: {source}")]
    Decode {
        /// Instance key.
        key: String,
        /// Underlying decoding error.
        #[source]
        source: serde_json::Error,
    },
    /// An environment or flag override could not be applied.
    #[error("invalid {origin} override {value:?} for {key}.{field}: {reason}")]
    InvalidOverride {
        /// Instance key.
        key: String,
        /// Dotted configuration field path.
        field: String,
        /// Override origin (`environment` or `flag`).
        origin: &'static str,
        /// Raw override text.
        value: String,
        /// Why coercion failed.
        reason: String,
    },
    /// Two instances bind the same command-line flag.
    #[error("flag --{flag} is bound by both {first} and {second}")]
    DuplicateFlag {
        /// Flag name without dashes.
        flag: String,
        /// First instance binding the flag.
        first: String,
        /// Second instance binding the flag.
        second: String,
    },
    /// Command-line parsing failed or requested help output.
    #[error("{source}")]
    Flags {
        /// Error reported by the flag parser.
        #[source]
        source: clap::Error,
    },
}

/// Conflicting service registrations among configured providers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Two different providers expose the same service name.
    #[error("service {service} conflict between {first} and {second}")]
    ServiceConflict {
        /// Contested service name.
        service: String,
        /// Provider that claimed the service first.
        first: String,
        /// Provider that claimed it second.
        second: String,
    },
    /// Two different providers declare the same service type.
    #[error("service type {service_type} conflict between {first} and {second}")]
    ServiceTypeConflict {
        /// Contested type name.
        service_type: String,
        /// Provider that declared the type first.
        first: String,
        /// Provider that declared it second.
        second: String,
    },
}

/// Dependencies that cannot be bound to exactly one instance.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// No enabled instance offers the requested service.
    #[error("missing provider of service {service} (required by {requester})")]
    MissingService {
        /// Requested service, including any label.
        service: String,
        /// Provider declaring the dependency.
        requester: String,
    },
    /// Several instances offer the service and none is the default.
    #[error(
        "service {service} required by {requester} is ambiguous between {}; request one with @label",
        .candidates.join(", ")
    )]
    AmbiguousService {
        /// Requested service.
        service: String,
        /// Provider declaring the dependency.
        requester: String,
        /// Instance keys that could satisfy the request.
        candidates: Vec<String>,
    },
    /// The dependency graph contains a cycle.
    #[error("dependency cycle between {}\n{graph}", .unresolved.join(", "))]
    Cycle {
        /// Provider names left unresolved.
        unresolved: Vec<String>,
        /// Rendered dependency graph.
        graph: String,
    },
}

/// One failed provider task or close call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    key: String,
    message: String,
}

impl TaskFailure {
    /// Records a failure of the task owned by `key`.
    #[must_use]
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Instance key (or key and task name) the failure belongs to.
    #[must_use]
    pub const fn key(&self) -> &str {
        self.key.as_str()
    }

    /// Rendered failure message.
    #[must_use]
    pub const fn message(&self) -> &str {
        self.message.as_str()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.key, self.message)
    }
}

fn write_failures(
    formatter: &mut fmt::Formatter<'_>,
    phase: &str,
    failures: &[TaskFailure],
) -> fmt::Result {
    write!(formatter, "{} provider(s) failed to {phase}", failures.len())?;
    for failure in failures {
        write!(formatter, "; {failure}")?;
    }
    Ok(())
}

/// Every failure reported by tasks launched during Start.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub struct StartError {
    failures: Vec<TaskFailure>,
}

impl StartError {
    pub(crate) const fn new(failures: Vec<TaskFailure>) -> Self {
        Self { failures }
    }

    /// Individual task failures, in completion order.
    #[must_use]
    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }
}

impl fmt::Display for StartError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_failures(formatter, "run", &self.failures)
    }
}

/// Every failure reported while closing providers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub struct CloseError {
    failures: Vec<TaskFailure>,
}

impl CloseError {
    pub(crate) const fn new(failures: Vec<TaskFailure>) -> Self {
        Self { failures }
    }

    /// Individual close failures, in the order Close was issued.
    #[must_use]
    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_failures(formatter, "close", &self.failures)
    }
}

/// Errors surfaced by the hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// Provider configuration is malformed.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// Providers claim conflicting services.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    /// Dependencies cannot be resolved.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// A provider initializer failed.
    #[error("failed to initialize provider {key}: {source}")]
    Init {
        /// Instance key of the failing provider.
        key: String,
        /// Error returned by the initializer.
        #[source]
        source: ProviderError,
    },
    /// A lifecycle listener rejected a transition.
    #[error("lifecycle listener failed during {stage}: {source}")]
    Listener {
        /// Lifecycle hook that failed.
        stage: &'static str,
        /// Error returned by the listener.
        #[source]
        source: ProviderError,
    },
    /// Provider tasks failed while running.
    #[error(transparent)]
    Start(#[from] StartError),
    /// Providers failed to close.
    #[error(transparent)]
    Close(#[from] CloseError),
    /// An operation was requested in the wrong lifecycle state.
    #[error("hub is {actual}, expected {expected}")]
    InvalidState {
        /// State required by the operation.
        expected: HubState,
        /// Current state.
        actual: HubState,
    },
    /// The shutdown signal bridge could not be installed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

impl HubError {
    /// Returns `true` when the error only carries help or version output.
    #[must_use]
    pub fn is_display_request(&self) -> bool {
        match self {
            Self::Configuration(ConfigurationError::Flags { source }) => matches!(
                source.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_error_lists_every_failure() {
        let error = StartError::new(vec![
            TaskFailure::new("worker", "boom"),
            TaskFailure::new("cache@replica", "lost connection"),
        ]);

        assert_eq!(
            error.to_string(),
            "2 provider(s) failed to run; worker: boom; cache@replica: lost connection"
        );
    }

    #[test]
    fn ambiguity_names_candidates() {
        let error = ResolutionError::AmbiguousService {
            service: "cache".to_owned(),
            requester: "reporting".to_owned(),
            candidates: vec!["cache@primary".to_owned(), "cache@replica".to_owned()],
        };

        let message = error.to_string();
        assert!(message.contains("cache@primary, cache@replica"), "{message}");
        assert!(message.contains("reporting"), "{message}");
    }
}
