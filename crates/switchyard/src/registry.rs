//! Provider definitions keyed by provider name.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::RegistryError;
use crate::provider::{Provider, Service};

/// Builds a fresh provider value for each configured instance.
pub type ProviderFactory = Arc<dyn Fn() -> Arc<dyn Provider> + Send + Sync>;

/// Where an injected field gets its value from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionSource {
    /// The instance's scoped logger.
    Logger,
    /// The instance's merged configuration.
    Config,
    /// A service, optionally labeled as `service@label`.
    Service(String),
}

/// One entry of a definition's injection list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    field: String,
    source: InjectionSource,
}

impl Injection {
    /// Field identifier passed to [`Provider::inject`].
    #[must_use]
    pub const fn field(&self) -> &str {
        self.field.as_str()
    }

    /// Source of the injected value.
    #[must_use]
    pub const fn source(&self) -> &InjectionSource {
        &self.source
    }
}

/// Environment and flag binding for one configuration field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldBinding {
    field: String,
    env: Option<String>,
    flag: Option<String>,
    help: Option<String>,
}

impl FieldBinding {
    /// Binds the field at the dotted path `field`.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ..Self::default()
        }
    }

    /// Environment variable overriding the field.
    #[must_use]
    pub fn env(mut self, name: impl Into<String>) -> Self {
        self.env = Some(name.into());
        self
    }

    /// Long flag (without dashes) overriding the field.
    #[must_use]
    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.flag = Some(name.into());
        self
    }

    /// Help text shown for the flag.
    #[must_use]
    pub fn help(mut self, text: impl Into<String>) -> Self {
        self.help = Some(text.into());
        self
    }

    /// Dotted field path.
    #[must_use]
    pub const fn field(&self) -> &str {
        self.field.as_str()
    }

    /// Bound environment variable, if any.
    #[must_use]
    pub fn env_name(&self) -> Option<&str> {
        self.env.as_deref()
    }

    /// Bound flag, if any.
    #[must_use]
    pub fn flag_name(&self) -> Option<&str> {
        self.flag.as_deref()
    }

    /// Flag help text, if any.
    #[must_use]
    pub fn help_text(&self) -> Option<&str> {
        self.help.as_deref()
    }
}

type DefaultsFn = fn() -> Result<Value, serde_json::Error>;
type DecodeFn = fn(Value) -> Result<Service, serde_json::Error>;

/// Typed configuration of a provider: compiled defaults, decoder and bindings.
#[derive(Clone)]
pub struct ConfigSpec {
    defaults: DefaultsFn,
    decode: DecodeFn,
    bindings: Vec<FieldBinding>,
}

fn defaults_of<C>() -> Result<Value, serde_json::Error>
where
    C: Serialize + Default,
{
    serde_json::to_value(C::default())
}

fn decode_as<C>(value: Value) -> Result<Service, serde_json::Error>
where
    C: DeserializeOwned + Send + Sync + 'static,
{
    let config: C = serde_json::from_value(value)?;
    Ok(Arc::new(config))
}

impl ConfigSpec {
    /// Describes configuration decoded into `C`, defaulting to `C::default()`.
    #[must_use]
    pub fn of<C>() -> Self
    where
        C: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    {
        Self {
            defaults: defaults_of::<C>,
            decode: decode_as::<C>,
            bindings: Vec::new(),
        }
    }

    /// Adds an environment or flag binding.
    #[must_use]
    pub fn bind(mut self, binding: FieldBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Declared bindings.
    #[must_use]
    pub fn bindings(&self) -> &[FieldBinding] {
        &self.bindings
    }

    pub(crate) fn defaults(&self) -> Result<Value, serde_json::Error> {
        (self.defaults)()
    }

    pub(crate) fn decode(&self, value: Value) -> Result<Service, serde_json::Error> {
        (self.decode)(value)
    }
}

impl fmt::Debug for ConfigSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ConfigSpec")
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

/// Rust type a provider's service value can be located by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceType {
    id: TypeId,
    name: &'static str,
}

impl ServiceType {
    /// Service type for `T`.
    #[must_use]
    pub fn of<T>() -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Identifier used by the type index.
    #[must_use]
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// Type name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Everything the hub needs to build and wire instances of one provider.
#[derive(Clone)]
pub struct ProviderDefinition {
    factory: ProviderFactory,
    services: Vec<String>,
    service_types: Vec<ServiceType>,
    dependencies: Vec<String>,
    description: Option<String>,
    config: Option<ConfigSpec>,
    injections: Vec<Injection>,
}

impl ProviderDefinition {
    /// Builds a definition whose instances come from `factory`.
    #[must_use]
    pub fn new<P, F>(factory: F) -> Self
    where
        P: Provider,
        F: Fn() -> P + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(move || Arc::new(factory()) as Arc<dyn Provider>),
            services: Vec::new(),
            service_types: Vec::new(),
            dependencies: Vec::new(),
            description: None,
            config: None,
            injections: Vec::new(),
        }
    }

    /// Declares the services the provider exposes.
    #[must_use]
    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.extend(services.into_iter().map(Into::into));
        self
    }

    /// Makes the provider's service value locatable as a `T`.
    ///
    /// The value handed out for a name lookup must downcast to `T`.
    #[must_use]
    pub fn with_service_type<T>(mut self) -> Self
    where
        T: Any + Send + Sync,
    {
        let service_type = ServiceType::of::<T>();
        if !self.service_types.contains(&service_type) {
            self.service_types.push(service_type);
        }
        self
    }

    /// Declares services that must be initialised first.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// One-line description shown by `--providers`.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Typed configuration of the provider.
    #[must_use]
    pub fn with_config(mut self, config: ConfigSpec) -> Self {
        self.config = Some(config);
        self
    }

    /// Injects `source` into `field` before Init.
    ///
    /// Service injections also count as dependencies.
    #[must_use]
    pub fn with_injection(mut self, field: impl Into<String>, source: InjectionSource) -> Self {
        self.injections.push(Injection {
            field: field.into(),
            source,
        });
        self
    }

    /// Declared services.
    #[must_use]
    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Declared service types.
    #[must_use]
    pub fn service_types(&self) -> &[ServiceType] {
        &self.service_types
    }

    /// Explicit dependencies followed by injected services, without repeats.
    #[must_use]
    pub fn dependencies(&self) -> Vec<String> {
        let injected = self
            .injections
            .iter()
            .filter_map(|injection| match &injection.source {
                InjectionSource::Service(service) => Some(service),
                _ => None,
            });
        let mut dependencies: Vec<String> = Vec::new();
        for dependency in self.dependencies.iter().chain(injected) {
            if !dependencies.contains(dependency) {
                dependencies.push(dependency.clone());
            }
        }
        dependencies
    }

    /// Description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Typed configuration binding, if any.
    #[must_use]
    pub const fn config(&self) -> Option<&ConfigSpec> {
        self.config.as_ref()
    }

    /// Injection list in declaration order.
    #[must_use]
    pub fn injections(&self) -> &[Injection] {
        &self.injections
    }

    pub(crate) fn instantiate(&self) -> Arc<dyn Provider> {
        (self.factory)()
    }
}

impl fmt::Debug for ProviderDefinition {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ProviderDefinition")
            .field("services", &self.services)
            .field("service_types", &self.service_types)
            .field("dependencies", &self.dependencies)
            .field("description", &self.description)
            .field("config", &self.config)
            .field("injections", &self.injections)
            .finish_non_exhaustive()
    }
}

/// Provider definitions available to a hub.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    definitions: BTreeMap<String, Arc<ProviderDefinition>>,
}

impl Registry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `definition` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateProvider`] when `name` is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        definition: ProviderDefinition,
    ) -> Result<(), RegistryError> {
        let provider = name.into();
        if self.definitions.contains_key(&provider) {
            return Err(RegistryError::DuplicateProvider { name: provider });
        }
        self.definitions.insert(provider, Arc::new(definition));
        Ok(())
    }

    /// Definition registered under `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<ProviderDefinition>> {
        self.definitions.get(name).cloned()
    }

    /// Definitions in name order.
    pub fn definitions(&self) -> impl Iterator<Item = (&str, &ProviderDefinition)> {
        self.definitions
            .iter()
            .map(|(name, definition)| (name.as_str(), definition.as_ref()))
    }

    /// Number of registered definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    struct Inert;

    impl Provider for Inert {}

    #[rstest]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register("db", ProviderDefinition::new(|| Inert))
            .expect("first registration");

        let error = registry
            .register("db", ProviderDefinition::new(|| Inert))
            .expect_err("second registration must fail");

        assert_eq!(
            error,
            RegistryError::DuplicateProvider {
                name: "db".to_owned()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[rstest]
    fn injected_services_count_as_dependencies() {
        let definition = ProviderDefinition::new(|| Inert)
            .with_dependencies(["db", "cache"])
            .with_injection("log", InjectionSource::Logger)
            .with_injection("store", InjectionSource::Service("db".to_owned()))
            .with_injection("queue", InjectionSource::Service("queue".to_owned()));

        assert_eq!(definition.dependencies(), vec!["db", "cache", "queue"]);
    }

    #[rstest]
    fn definitions_iterate_in_name_order() {
        let mut registry = Registry::new();
        for name in ["worker", "api", "db"] {
            registry
                .register(name, ProviderDefinition::new(|| Inert))
                .expect("registration");
        }

        let names: Vec<&str> = registry.definitions().map(|(name, _)| name).collect();

        assert_eq!(names, vec!["api", "db", "worker"]);
    }
}
