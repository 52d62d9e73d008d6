//! Observers of hub lifecycle transitions.

use std::sync::Arc;

use crate::error::HubError;
use crate::hub::Hub;
use crate::provider::ProviderError;

/// Hooks invoked around the hub lifecycle. Every hook defaults to a no-op.
pub trait LifecycleListener: Send + Sync {
    /// Invoked before the provider graph is built.
    ///
    /// # Errors
    ///
    /// A failure aborts Init.
    fn before_initialization(&self, hub: &Hub) -> Result<(), ProviderError> {
        let _ = hub;
        Ok(())
    }

    /// Invoked once every instance is initialised.
    ///
    /// # Errors
    ///
    /// A failure aborts Init.
    fn after_initialization(&self, hub: &Hub) -> Result<(), ProviderError> {
        let _ = hub;
        Ok(())
    }

    /// Invoked once every runnable instance and task has been launched.
    fn after_start(&self, hub: &Hub) {
        let _ = hub;
    }

    /// Invoked before the process exits, with the error ending the run.
    fn before_exit(&self, hub: &Hub, error: Option<&HubError>) {
        let _ = (hub, error);
    }
}

impl<T> LifecycleListener for Arc<T>
where
    T: LifecycleListener + ?Sized,
{
    fn before_initialization(&self, hub: &Hub) -> Result<(), ProviderError> {
        (**self).before_initialization(hub)
    }

    fn after_initialization(&self, hub: &Hub) -> Result<(), ProviderError> {
        (**self).after_initialization(hub)
    }

    fn after_start(&self, hub: &Hub) {
        (**self).after_start(hub);
    }

    fn before_exit(&self, hub: &Hub, error: Option<&HubError>) {
        (**self).before_exit(hub, error);
    }
}

const LIFECYCLE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::lifecycle");

/// Listener that records lifecycle transitions using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredListener;

impl StructuredListener {
    /// Builds a new listener.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LifecycleListener for StructuredListener {
    fn before_initialization(&self, hub: &Hub) -> Result<(), ProviderError> {
        tracing::info!(
            target: LIFECYCLE_TARGET,
            event = "before_initialization",
            providers = hub.registry().len(),
            "initializing providers"
        );
        Ok(())
    }

    fn after_initialization(&self, hub: &Hub) -> Result<(), ProviderError> {
        tracing::info!(
            target: LIFECYCLE_TARGET,
            event = "after_initialization",
            order = ?hub.init_order(),
            "providers initialized"
        );
        Ok(())
    }

    fn after_start(&self, hub: &Hub) {
        tracing::info!(
            target: LIFECYCLE_TARGET,
            event = "after_start",
            state = %hub.state(),
            "providers started"
        );
    }

    fn before_exit(&self, _hub: &Hub, error: Option<&HubError>) {
        let Some(failure) = error else {
            tracing::info!(target: LIFECYCLE_TARGET, event = "before_exit", "hub exiting");
            return;
        };
        tracing::error!(
            target: LIFECYCLE_TARGET,
            event = "before_exit",
            error = %failure,
            "hub exiting with error"
        );
    }
}
