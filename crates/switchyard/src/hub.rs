//! The hub: configuration, graph building and sequential Init.

use std::ffi::OsString;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use serde_json::Value;
use strum::Display;

use crate::error::HubError;
use crate::events::HubEvents;
use crate::flags;
use crate::graph::ProviderGraph;
use crate::listener::LifecycleListener;
use crate::registry::Registry;

pub(crate) const HUB_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::hub");

/// Default grace period granted to Close after a shutdown signal.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Invoked when Close overruns the shutdown grace period.
pub type ShutdownExpiry = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle states of a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum HubState {
    /// Built, no configuration applied yet.
    Unconfigured,
    /// Provider graph built.
    Configured,
    /// Every instance initialised.
    Initialized,
    /// Runnable instances and background tasks launched.
    Started,
    /// Close in progress.
    Closing,
    /// Close finished.
    Closed,
}

/// Result of a successful [`Hub::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// Every instance is initialised; the hub can start.
    Ready,
    /// `--providers` was given: listing of registered providers.
    ListProviders(String),
    /// `--graph` was given: rendered dependency graph.
    ShowGraph(String),
}

pub(crate) struct Lifecycle {
    pub(crate) state: HubState,
    pub(crate) running: usize,
}

pub(crate) struct Shared {
    pub(crate) registry: Arc<Registry>,
    pub(crate) listeners: Vec<Arc<dyn LifecycleListener>>,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) expiry: ShutdownExpiry,
    pub(crate) graph: OnceLock<ProviderGraph>,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) idle: Condvar,
    pub(crate) events: HubEvents,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clonable handle driving providers through Init, Start and Close.
#[derive(Clone)]
pub struct Hub {
    pub(crate) shared: Arc<Shared>,
}

/// Builder for [`Hub`].
pub struct HubBuilder {
    registry: Arc<Registry>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    shutdown_timeout: Duration,
    expiry: ShutdownExpiry,
}

impl HubBuilder {
    /// Adds a lifecycle listener. Listeners run in registration order.
    #[must_use]
    pub fn with_listener<L>(mut self, listener: L) -> Self
    where
        L: LifecycleListener + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Grace period granted to Close after a shutdown signal.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Replaces the action taken when Close overruns the grace period.
    ///
    /// The default exits the process with status 1.
    #[must_use]
    pub fn with_shutdown_expiry<F>(mut self, expiry: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.expiry = Arc::new(expiry);
        self
    }

    /// Builds the hub.
    #[must_use]
    pub fn build(self) -> Hub {
        let events = HubEvents::new();
        let mut listeners = self.listeners;
        listeners.push(Arc::new(events.listener()));
        Hub {
            shared: Arc::new(Shared {
                registry: self.registry,
                listeners,
                shutdown_timeout: self.shutdown_timeout,
                expiry: self.expiry,
                graph: OnceLock::new(),
                lifecycle: Mutex::new(Lifecycle {
                    state: HubState::Unconfigured,
                    running: 0,
                }),
                idle: Condvar::new(),
                events,
            }),
        }
    }
}

impl Hub {
    /// Starts building a hub over `registry`.
    #[must_use]
    pub fn builder(registry: Arc<Registry>) -> HubBuilder {
        HubBuilder {
            registry,
            listeners: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            expiry: Arc::new(|| std::process::exit(1)),
        }
    }

    /// Builds a hub with default settings.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::builder(registry).build()
    }

    /// Registry backing the hub.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HubState {
        self.shared.lock().state
    }

    /// Shutdown grace period.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shared.shutdown_timeout
    }

    /// Provider graph, once configured.
    #[must_use]
    pub fn provider_graph(&self) -> Option<&ProviderGraph> {
        self.shared.graph.get()
    }

    /// Instance keys in Init order, empty before configuration.
    #[must_use]
    pub fn init_order(&self) -> Vec<String> {
        self.provider_graph()
            .map(ProviderGraph::order_keys)
            .unwrap_or_default()
    }

    /// Builds the provider graph from `config`, applies `args` and
    /// initialises every instance in dependency order.
    ///
    /// `args` starts with the program name. `--providers` and `--graph`
    /// return early with their listing and skip Init.
    ///
    /// # Errors
    ///
    /// Returns the first configuration, resolution, listener or Init
    /// failure. Configuration of every instance is bound before any Init
    /// runs. Instances initialised before an Init failure are not closed.
    pub fn init(&self, config: &Value, args: &[OsString]) -> Result<InitOutcome, HubError> {
        self.expect_state(HubState::Unconfigured)?;
        for listener in &self.shared.listeners {
            listener
                .before_initialization(self)
                .map_err(|source| HubError::Listener {
                    stage: "before_initialization",
                    source,
                })?;
        }

        let graph = ProviderGraph::build(&self.shared.registry, config)?;
        let parsed = flags::parse(&self.shared.registry, &graph, args)?;
        let installed = self.install_graph(graph)?;
        tracing::info!(
            target: HUB_TARGET,
            instances = installed.instances().len(),
            disabled = installed.disabled().len(),
            "provider graph built"
        );

        if parsed.list_providers {
            return Ok(InitOutcome::ListProviders(flags::usage(&self.shared.registry)));
        }
        if parsed.show_graph {
            return Ok(InitOutcome::ShowGraph(installed.describe()));
        }

        for instance in installed.order() {
            instance.bind_config(&parsed.values)?;
        }
        for instance in installed.order() {
            instance.init(self)?;
            tracing::info!(
                target: HUB_TARGET,
                key = instance.key(),
                provider = instance.name(),
                "provider initialized"
            );
        }
        self.shared.lock().state = HubState::Initialized;

        for listener in &self.shared.listeners {
            listener
                .after_initialization(self)
                .map_err(|source| HubError::Listener {
                    stage: "after_initialization",
                    source,
                })?;
        }
        Ok(InitOutcome::Ready)
    }

    /// Notifies listeners that the process is about to exit.
    pub fn notify_exit(&self, error: Option<&HubError>) {
        for listener in &self.shared.listeners {
            listener.before_exit(self, error);
        }
    }

    fn install_graph(&self, graph: ProviderGraph) -> Result<&ProviderGraph, HubError> {
        let mut lifecycle = self.shared.lock();
        if lifecycle.state != HubState::Unconfigured {
            return Err(HubError::InvalidState {
                expected: HubState::Unconfigured,
                actual: lifecycle.state,
            });
        }
        if self.shared.graph.set(graph).is_err() {
            return Err(HubError::InvalidState {
                expected: HubState::Unconfigured,
                actual: HubState::Configured,
            });
        }
        lifecycle.state = HubState::Configured;
        drop(lifecycle);
        self.provider_graph().ok_or(HubError::InvalidState {
            expected: HubState::Configured,
            actual: HubState::Unconfigured,
        })
    }

    pub(crate) fn expect_state(&self, expected: HubState) -> Result<(), HubError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(HubError::InvalidState { expected, actual })
        }
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Hub")
            .field("state", &self.state())
            .field("providers", &self.shared.registry.len())
            .field("shutdown_timeout", &self.shared.shutdown_timeout)
            .finish_non_exhaustive()
    }
}
