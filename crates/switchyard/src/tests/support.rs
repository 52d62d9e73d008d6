//! Test providers and harness utilities for the hub suites.

use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    CancelToken, CancellableRun, ConfigSpec, FactoryService, FieldBinding, Hub, HubError,
    InitContext, Initializer, Injected, InjectionSource, LifecycleListener, Provider,
    ProviderDefinition, ProviderError, ProviderLogger, Registry, Runnable, Service,
    ServiceRequest, ShutdownError, ShutdownSignal, StartStop,
};

/// Ordered record of provider and listener events.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, event: impl Into<String>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Keys recorded with `prefix`, such as `init:`.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|event| event.strip_prefix(prefix).map(str::to_owned))
            .collect()
    }
}

/// What a [`TestProvider`] does when started.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Not runnable.
    Plain,
    /// Runs until its cancellation token fires.
    Cancellable,
    /// Fails after the delay with the message.
    FailAfter(Duration, &'static str),
    /// Start blocks until `stop` is called.
    StartStop,
    /// Start blocks until `stop`, which then fails.
    FailingStop,
    /// Init fails.
    FailInit,
    /// Ignores cancellation and returns once the latch fires.
    Hang(CancelToken),
}

/// Configurable provider recording its lifecycle into a [`Journal`].
pub struct TestProvider {
    journal: Journal,
    behaviour: Behaviour,
    key: OnceLock<String>,
    stopped: CancelToken,
}

impl TestProvider {
    pub fn new(journal: Journal, behaviour: Behaviour) -> Self {
        Self {
            journal,
            behaviour,
            key: OnceLock::new(),
            stopped: CancelToken::new(),
        }
    }

    pub fn key(&self) -> &str {
        self.key.get().map_or("", String::as_str)
    }
}

impl Provider for TestProvider {
    fn initializer(&self) -> Option<&dyn Initializer> {
        Some(self)
    }

    fn runnable(&self) -> Option<Runnable<'_>> {
        match self.behaviour {
            Behaviour::Plain | Behaviour::FailInit => None,
            Behaviour::StartStop | Behaviour::FailingStop => Some(Runnable::StartStop(self)),
            Behaviour::Cancellable | Behaviour::FailAfter(..) | Behaviour::Hang(_) => {
                Some(Runnable::Cancellable(self))
            }
        }
    }
}

impl Initializer for TestProvider {
    fn init(&self, context: &InitContext<'_>) -> Result<(), ProviderError> {
        let _ = self.key.set(context.key().to_owned());
        if matches!(self.behaviour, Behaviour::FailInit) {
            return Err(format!("{} refused to initialise", context.key()).into());
        }
        self.journal.record(format!("init:{}", context.key()));
        Ok(())
    }
}

impl CancellableRun for TestProvider {
    fn run(&self, cancel: &CancelToken) -> Result<(), ProviderError> {
        self.journal.record(format!("run:{}", self.key()));
        match &self.behaviour {
            Behaviour::FailAfter(delay, message) => {
                thread::sleep(*delay);
                self.journal.record(format!("failed:{}", self.key()));
                Err((*message).into())
            }
            Behaviour::Hang(latch) => {
                latch.wait();
                Ok(())
            }
            _ => {
                cancel.wait();
                self.journal.record(format!("cancelled:{}", self.key()));
                Ok(())
            }
        }
    }
}

impl StartStop for TestProvider {
    fn start(&self) -> Result<(), ProviderError> {
        self.journal.record(format!("start:{}", self.key()));
        self.stopped.wait();
        Ok(())
    }

    fn stop(&self) -> Result<(), ProviderError> {
        self.journal.record(format!("stop:{}", self.key()));
        self.stopped.cancel();
        if matches!(self.behaviour, Behaviour::FailingStop) {
            return Err(format!("{} failed to stop", self.key()).into());
        }
        Ok(())
    }
}

/// Shape of one registered test provider.
pub struct Spec {
    pub name: &'static str,
    pub services: &'static [&'static str],
    pub dependencies: &'static [&'static str],
    pub behaviour: Behaviour,
}

impl Spec {
    pub fn new(name: &'static str, services: &'static [&'static str]) -> Self {
        Self {
            name,
            services,
            dependencies: &[],
            behaviour: Behaviour::Plain,
        }
    }

    pub fn depends_on(mut self, dependencies: &'static [&'static str]) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn behaving(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }
}

/// Registers every spec as a [`TestProvider`] writing to `journal`.
pub fn registry(journal: &Journal, specs: Vec<Spec>) -> Registry {
    let mut registry = Registry::new();
    for spec in specs {
        let journal = journal.clone();
        let behaviour = spec.behaviour;
        let definition = ProviderDefinition::new(move || {
            TestProvider::new(journal.clone(), behaviour.clone())
        })
        .with_services(spec.services.iter().copied())
        .with_dependencies(spec.dependencies.iter().copied());
        if let Err(error) = registry.register(spec.name, definition) {
            panic!("test registry rejected {}: {error}", spec.name);
        }
    }
    registry
}

/// The `db`, `cache`, `api` topology used across the suites.
pub fn storage_registry(journal: &Journal) -> Registry {
    registry(
        journal,
        vec![
            Spec::new("db", &["db"]),
            Spec::new("cache", &["cache"]),
            Spec::new("api", &["api"]).depends_on(&["db", "cache@primary"]),
            Spec::new("reporting", &[]).depends_on(&["cache"]),
        ],
    )
}

/// Builds a hub over `registry` with a short grace period.
pub fn hub(registry: Registry) -> Hub {
    Hub::builder(Arc::new(registry))
        .with_shutdown_timeout(Duration::from_millis(200))
        .build()
}

/// Program name followed by `args`.
pub fn args(args: &[&str]) -> Vec<std::ffi::OsString> {
    std::iter::once("switchyard")
        .chain(args.iter().copied())
        .map(std::ffi::OsString::from)
        .collect()
}

/// Shutdown signal fired by the test.
#[derive(Debug, Default)]
pub struct ManualShutdownSignal {
    state: Mutex<Option<bool>>,
    changed: Condvar,
}

impl ManualShutdownSignal {
    pub fn trigger(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = Some(true);
        self.changed.notify_all();
    }
}

impl ShutdownSignal for ManualShutdownSignal {
    fn wait(&self) -> Result<bool, ShutdownError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(requested) = *state {
                return Ok(requested);
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_none() {
            *state = Some(false);
        }
        self.changed.notify_all();
    }
}

/// Listener recording each hook into the journal.
pub struct RecordingListener {
    pub journal: Journal,
    pub fail_before_initialization: bool,
}

impl LifecycleListener for RecordingListener {
    fn before_initialization(&self, _hub: &Hub) -> Result<(), ProviderError> {
        self.journal.record("hook:before_initialization");
        if self.fail_before_initialization {
            return Err("listener vetoed initialisation".into());
        }
        Ok(())
    }

    fn after_initialization(&self, _hub: &Hub) -> Result<(), ProviderError> {
        self.journal.record("hook:after_initialization");
        Ok(())
    }

    fn after_start(&self, _hub: &Hub) {
        self.journal.record("hook:after_start");
    }

    fn before_exit(&self, _hub: &Hub, error: Option<&HubError>) {
        let outcome = if error.is_some() { "error" } else { "ok" };
        self.journal.record(format!("hook:before_exit:{outcome}"));
    }
}

/// Configuration of [`Greeter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreeterConfig {
    pub message: String,
    pub repeat: u32,
    pub loud: bool,
}

/// Provider exercising injection and configuration binding.
#[derive(Default)]
pub struct Greeter {
    pub logger: OnceLock<ProviderLogger>,
    pub config: OnceLock<Arc<GreeterConfig>>,
    pub store: OnceLock<Service>,
}

impl Provider for Greeter {
    fn inject(&self, field: &str, value: Injected) -> bool {
        match field {
            "logger" => value
                .into_logger()
                .is_some_and(|logger| self.logger.set(logger).is_ok()),
            "config" => value
                .into_config::<GreeterConfig>()
                .is_some_and(|config| self.config.set(config).is_ok()),
            "store" => match value {
                Injected::Service(service) => self.store.set(service).is_ok(),
                _ => false,
            },
            _ => false,
        }
    }
}

/// Definition of [`Greeter`] with env and flag bindings on `message` and
/// `repeat`.
pub fn greeter_definition(env: &str) -> ProviderDefinition {
    ProviderDefinition::new(Greeter::default)
        .with_services(["greeter"])
        .with_config(
            ConfigSpec::of::<GreeterConfig>()
                .bind(FieldBinding::new("message").env(env).flag("greeting"))
                .bind(FieldBinding::new("repeat").flag("repeat")),
        )
        .with_injection("logger", InjectionSource::Logger)
        .with_injection("config", InjectionSource::Config)
        .with_injection("store", InjectionSource::Service("db".to_owned()))
        .with_injection("unknown", InjectionSource::Logger)
}

/// Hands each caller a greeting naming the caller's key.
pub struct Personaliser;

impl Provider for Personaliser {
    fn factory(&self) -> Option<&dyn FactoryService> {
        Some(self)
    }
}

impl FactoryService for Personaliser {
    fn provide(&self, request: &ServiceRequest) -> Option<Service> {
        let caller = request.caller()?;
        let punctuation = request.options_as::<char>().copied().unwrap_or('.');
        Some(Arc::new(format!("hello {}{punctuation}", caller.key())))
    }
}
