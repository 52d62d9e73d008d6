//! Per-instance state and the context handed to initialisers.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde_json::{Map, Value};
use tracing::Span;

use crate::binding::{self, BindingScope};
use crate::cancel::CancelToken;
use crate::error::{ConfigurationError, HubError};
use crate::flags::FlagValues;
use crate::hub::Hub;
use crate::locator::{Caller, LocatorError, ServiceOption};
use crate::provider::{Injected, Provider, ProviderError, Service};
use crate::registry::{InjectionSource, ProviderDefinition};

pub(crate) const PROVIDER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::provider");

/// Logger scoped to one provider instance.
///
/// Events are emitted inside a span carrying the instance `key` and
/// `provider` name.
#[derive(Clone)]
pub struct ProviderLogger {
    span: Span,
}

impl ProviderLogger {
    pub(crate) fn new(key: &str, provider: &str) -> Self {
        Self {
            span: tracing::info_span!(target: PROVIDER_TARGET, "provider", key, provider),
        }
    }

    /// Span enclosing every event of the instance.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Emits a debug event.
    pub fn debug(&self, message: &str) {
        self.span
            .in_scope(|| tracing::debug!(target: PROVIDER_TARGET, "{message}"));
    }

    /// Emits an info event.
    pub fn info(&self, message: &str) {
        self.span
            .in_scope(|| tracing::info!(target: PROVIDER_TARGET, "{message}"));
    }

    /// Emits a warning.
    pub fn warn(&self, message: &str) {
        self.span
            .in_scope(|| tracing::warn!(target: PROVIDER_TARGET, "{message}"));
    }

    /// Emits an error event.
    pub fn error(&self, message: &str) {
        self.span
            .in_scope(|| tracing::error!(target: PROVIDER_TARGET, "{message}"));
    }
}

impl fmt::Debug for ProviderLogger {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ProviderLogger")
            .field("span", &self.span.metadata().map(|meta| meta.name()))
            .finish()
    }
}

/// Dependency request of an instance and the instance chosen for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyBinding {
    request: String,
    key: String,
    provider: String,
}

impl DependencyBinding {
    pub(crate) fn new(request: &str, key: &str, provider: &str) -> Self {
        Self {
            request: request.to_owned(),
            key: key.to_owned(),
            provider: provider.to_owned(),
        }
    }

    /// Requested service, as declared.
    #[must_use]
    pub const fn request(&self) -> &str {
        self.request.as_str()
    }

    /// Key of the instance bound to the request.
    #[must_use]
    pub const fn key(&self) -> &str {
        self.key.as_str()
    }

    /// Provider name of the bound instance.
    #[must_use]
    pub const fn provider(&self) -> &str {
        self.provider.as_str()
    }
}

type TaskFn = Box<dyn FnOnce(CancelToken) -> Result<(), ProviderError> + Send>;

/// Work registered during Init and run on its own thread during Start.
pub(crate) struct BackgroundTask {
    pub(crate) name: String,
    pub(crate) run: TaskFn,
}

/// One configured provider instance.
pub struct ProviderInstance {
    key: String,
    name: String,
    label: String,
    definition: Arc<ProviderDefinition>,
    block: Map<String, Value>,
    provider: Arc<dyn Provider>,
    logger: ProviderLogger,
    config: OnceLock<Service>,
    dependencies: OnceLock<Vec<DependencyBinding>>,
    tasks: Mutex<Vec<BackgroundTask>>,
    cancel: CancelToken,
}

impl ProviderInstance {
    pub(crate) fn new(
        key: String,
        name: String,
        label: String,
        definition: Arc<ProviderDefinition>,
        block: Map<String, Value>,
    ) -> Self {
        let provider = definition.instantiate();
        let logger = ProviderLogger::new(&key, &name);
        Self {
            key,
            name,
            label,
            definition,
            block,
            provider,
            logger,
            config: OnceLock::new(),
            dependencies: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
            cancel: CancelToken::new(),
        }
    }

    /// Configuration key, `name` or `name@label`.
    #[must_use]
    pub const fn key(&self) -> &str {
        self.key.as_str()
    }

    /// Provider name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Label, empty for the canonical instance.
    #[must_use]
    pub const fn label(&self) -> &str {
        self.label.as_str()
    }

    /// Definition the instance was built from.
    #[must_use]
    pub fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    /// Raw configuration block.
    #[must_use]
    pub const fn block(&self) -> &Map<String, Value> {
        &self.block
    }

    /// The provider value.
    #[must_use]
    pub const fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Scoped logger.
    #[must_use]
    pub const fn logger(&self) -> &ProviderLogger {
        &self.logger
    }

    /// Merged configuration, once bound.
    #[must_use]
    pub fn config(&self) -> Option<Service> {
        self.config.get().cloned()
    }

    /// Resolved dependencies, once the graph is built.
    #[must_use]
    pub fn dependencies(&self) -> &[DependencyBinding] {
        self.dependencies
            .get()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Identity presented to factory services.
    #[must_use]
    pub fn caller(&self) -> Caller {
        Caller::new(&self.key, &self.name, &self.label)
    }

    pub(crate) const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn set_dependencies(&self, dependencies: Vec<DependencyBinding>) {
        if self.dependencies.set(dependencies).is_err() {
            self.logger.debug("dependencies already bound");
        }
    }

    pub(crate) fn take_tasks(&self) -> Vec<BackgroundTask> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *tasks)
    }

    fn push_task(&self, task: BackgroundTask) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Merges defaults, file block, environment and flags into the config.
    pub(crate) fn bind_config(&self, flags: &FlagValues) -> Result<(), ConfigurationError> {
        let value = match self.definition.config() {
            Some(spec) => {
                let scope = BindingScope {
                    key: &self.key,
                    label: &self.label,
                    flags,
                };
                let merged = binding::merged_value(&self.name, spec, &self.block, &scope)?;
                spec.decode(merged)
                    .map_err(|source| ConfigurationError::Decode {
                        key: self.key.clone(),
                        source,
                    })?
            }
            None => Arc::new(Value::Object(binding::strip_reserved(&self.block))),
        };
        if self.config.set(value).is_err() {
            self.logger.debug("configuration already bound");
        }
        Ok(())
    }

    /// Injects fields and runs the initializer.
    pub(crate) fn init(self: &Arc<Self>, hub: &Hub) -> Result<(), HubError> {
        self.inject(hub)?;
        if let Some(initializer) = self.provider.initializer() {
            let context = InitContext {
                hub,
                instance: self,
            };
            initializer
                .init(&context)
                .map_err(|source| HubError::Init {
                    key: self.key.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    fn inject(&self, hub: &Hub) -> Result<(), HubError> {
        for injection in self.definition.injections() {
            let value = match injection.source() {
                InjectionSource::Logger => Injected::Logger(self.logger.clone()),
                InjectionSource::Config => match self.config() {
                    Some(config) => Injected::Config(config),
                    None => continue,
                },
                InjectionSource::Service(requested) => {
                    let service = hub
                        .locate(Some(&self.caller()), requested, None)
                        .map_err(|error| HubError::Init {
                            key: self.key.clone(),
                            source: Box::new(error),
                        })?;
                    Injected::Service(service)
                }
            };
            if !self.provider.inject(injection.field(), value) {
                tracing::debug!(
                    target: PROVIDER_TARGET,
                    key = %self.key,
                    field = injection.field(),
                    "provider declined injected field"
                );
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProviderInstance {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ProviderInstance")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("label", &self.label)
            .field("dependencies", &self.dependencies())
            .finish_non_exhaustive()
    }
}

/// View of the hub and the instance being initialised.
pub struct InitContext<'a> {
    hub: &'a Hub,
    instance: &'a Arc<ProviderInstance>,
}

impl InitContext<'_> {
    /// Hub driving the lifecycle.
    #[must_use]
    pub const fn hub(&self) -> &Hub {
        self.hub
    }

    /// Instance key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.instance.key()
    }

    /// Instance label, empty for the canonical instance.
    #[must_use]
    pub fn label(&self) -> &str {
        self.instance.label()
    }

    /// Provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.instance.name()
    }

    /// The provider being initialised.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        self.instance.provider()
    }

    /// Scoped logger.
    #[must_use]
    pub fn logger(&self) -> &ProviderLogger {
        self.instance.logger()
    }

    /// Merged configuration, type-erased.
    #[must_use]
    pub fn config(&self) -> Option<Service> {
        self.instance.config()
    }

    /// Merged configuration as `C`.
    #[must_use]
    pub fn config_as<C>(&self) -> Option<Arc<C>>
    where
        C: Any + Send + Sync,
    {
        self.config()
            .and_then(|config| config.downcast::<C>().ok())
    }

    /// Resolves `requested` with this instance as caller.
    ///
    /// # Errors
    ///
    /// See [`Hub::locate`].
    pub fn service(&self, requested: &str) -> Result<Service, LocatorError> {
        self.hub
            .locate(Some(&self.instance.caller()), requested, None)
    }

    /// Resolves `requested` with caller-specific `options`.
    ///
    /// # Errors
    ///
    /// See [`Hub::locate`].
    pub fn service_with(
        &self,
        requested: &str,
        options: ServiceOption,
    ) -> Result<Service, LocatorError> {
        self.hub
            .locate(Some(&self.instance.caller()), requested, Some(options))
    }

    /// Resolves `requested` and downcasts it to `T`.
    ///
    /// # Errors
    ///
    /// See [`Hub::locate`]; fails with [`LocatorError::Downcast`] when the
    /// service is not a `T`.
    pub fn service_as<T>(&self, requested: &str) -> Result<Arc<T>, LocatorError>
    where
        T: Any + Send + Sync,
    {
        self.service(requested)?
            .downcast::<T>()
            .map_err(|_| LocatorError::Downcast {
                service: requested.to_owned(),
            })
    }

    /// Resolves the service declared as type `T`.
    ///
    /// Type lookups add no ordering; declare the service as a dependency
    /// when it must be initialised first.
    ///
    /// # Errors
    ///
    /// See [`Hub::locate_type`].
    pub fn service_of<T>(&self) -> Result<Arc<T>, LocatorError>
    where
        T: Any + Send + Sync,
    {
        self.hub
            .locate_type::<T>(Some(&self.instance.caller()), None)
    }

    /// Registers work to run on its own thread during Start.
    ///
    /// The task receives the instance's cancellation token, which fires on
    /// Close.
    pub fn add_task<F>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancelToken) -> Result<(), ProviderError> + Send + 'static,
    {
        self.instance.push_task(BackgroundTask {
            name: name.into(),
            run: Box::new(task),
        });
    }
}
