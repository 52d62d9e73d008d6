//! Dependency-resolving lifecycle hub for pluggable providers.
//!
//! Providers are registered by name in a [`Registry`], instantiated from a
//! configuration mapping, ordered by their declared dependencies and driven
//! through Init, a concurrent Start and a signal-triggered Close. The
//! [`Hub`] also acts as a service locator for `service` and
//! `service@label` lookups.

mod binding;
mod cancel;
mod context;
mod error;
mod events;
mod flags;
mod graph;
mod hub;
mod lifecycle;
mod listener;
mod locator;
mod provider;
mod registry;
mod resolve;
mod run;
mod shutdown;
pub mod telemetry;

pub use cancel::CancelToken;
pub use context::{DependencyBinding, InitContext, ProviderInstance, ProviderLogger};
pub use error::{
    CloseError, ConfigurationError, HubError, RegistrationError, RegistryError, ResolutionError,
    StartError, TaskFailure,
};
pub use events::{HubEvents, Stage, StageOutcome};
pub use flags::usage;
pub use graph::{ProviderGraph, ServiceBinding};
pub use hub::{DEFAULT_SHUTDOWN_TIMEOUT, Hub, HubBuilder, HubState, InitOutcome, ShutdownExpiry};
pub use listener::{LifecycleListener, StructuredListener};
pub use locator::{Caller, LocatorError, ServiceOption, ServiceRequest};
pub use provider::{
    AsAny, CancellableRun, FactoryService, Initializer, Injected, Provider, ProviderError,
    Runnable, Service, StartStop,
};
pub use registry::{
    ConfigSpec, FieldBinding, Injection, InjectionSource, ProviderDefinition, ProviderFactory,
    Registry, ServiceType,
};
pub use resolve::{CycleError, DependencyGraph, GraphNode};
pub use run::{RunError, RunOptions, run, run_with_args};
pub use shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal};

#[cfg(test)]
mod tests;
