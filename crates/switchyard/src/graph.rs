//! Construction of provider instances and their dependency graph.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::{DependencyBinding, ProviderInstance};
use crate::error::{ConfigurationError, HubError, RegistrationError, ResolutionError};
use crate::registry::Registry;
use crate::resolve::{DependencyGraph, GraphNode};

pub(crate) const GRAPH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::graph");

const PROVIDERS_KEY: &str = "providers";

/// Instances of one provider that expose a service.
#[derive(Debug, Clone)]
pub struct ServiceBinding {
    provider: String,
    instances: Vec<Arc<ProviderInstance>>,
}

impl ServiceBinding {
    /// Provider name owning the service.
    #[must_use]
    pub const fn provider(&self) -> &str {
        self.provider.as_str()
    }

    /// Candidate instances in configuration order.
    #[must_use]
    pub fn instances(&self) -> &[Arc<ProviderInstance>] {
        &self.instances
    }
}

/// Outcome of choosing one instance for a service request.
pub(crate) enum Selection<'a> {
    Found(&'a Arc<ProviderInstance>),
    Missing,
    Ambiguous(Vec<String>),
}

/// Picks the instance answering `service` (optionally `@label`).
///
/// A labeled request needs the candidate whose key is exactly `requested`.
/// An unlabeled request prefers the canonical `name` instance, then a sole
/// candidate.
pub(crate) fn select<'a>(
    binding: &'a ServiceBinding,
    requested: &str,
    label: Option<&str>,
) -> Selection<'a> {
    let candidates = &binding.instances;
    if label.is_some() {
        return candidates
            .iter()
            .find(|instance| instance.key() == requested)
            .map_or(Selection::Missing, Selection::Found);
    }
    if let Some(canonical) = candidates
        .iter()
        .find(|instance| instance.key() == binding.provider)
    {
        return Selection::Found(canonical);
    }
    match candidates.as_slice() {
        [] => Selection::Missing,
        [only] => Selection::Found(only),
        many => Selection::Ambiguous(many.iter().map(|instance| instance.key().to_owned()).collect()),
    }
}

/// Splits `service@label` into its parts; an empty label counts as none.
pub(crate) fn split_request(requested: &str) -> (&str, Option<&str>) {
    match requested.split_once('@') {
        Some((service, label)) if !label.is_empty() => (service, Some(label)),
        Some((service, _)) => (service, None),
        None => (requested, None),
    }
}

/// Provider block skipped with `_enable: false`.
#[derive(Debug, Clone)]
struct DisabledBlock {
    key: String,
    name: String,
    label: String,
}

/// One enabled provider block.
struct ConfiguredBlock {
    key: String,
    name: String,
    label: String,
    block: Map<String, Value>,
}

#[derive(Default)]
struct CollectedBlocks {
    enabled: Vec<ConfiguredBlock>,
    disabled: Vec<DisabledBlock>,
}

impl CollectedBlocks {
    fn contains(&self, key: &str) -> bool {
        self.enabled.iter().any(|block| block.key == key)
            || self.disabled.iter().any(|block| block.key == key)
    }

    fn push(
        &mut self,
        key: String,
        value: &Value,
        list_label: Option<String>,
    ) -> Result<(), ConfigurationError> {
        let block = match value {
            Value::Null => Map::new(),
            Value::Object(block) => block.clone(),
            _ => return Err(ConfigurationError::MalformedBlock { key }),
        };

        let enabled = match block.get("_enable") {
            None => true,
            Some(Value::Bool(enabled)) => *enabled,
            Some(_) => {
                return Err(ConfigurationError::InvalidReservedKey {
                    key,
                    field: "_enable",
                    expected: "boolean",
                });
            }
        };

        let (derived_name, derived_label) = match key.split_once('@') {
            Some((name, label)) => (name.to_owned(), label.to_owned()),
            None => (key.clone(), String::new()),
        };
        let name = match block.get("_name") {
            None => derived_name,
            Some(Value::String(name)) => name.clone(),
            Some(_) => {
                return Err(ConfigurationError::InvalidReservedKey {
                    key,
                    field: "_name",
                    expected: "string",
                });
            }
        };
        let label = match (list_label, block.get("_label")) {
            (Some(label), _) => label,
            (None, None) => derived_label,
            (None, Some(Value::String(label))) => label.clone(),
            (None, Some(_)) => {
                return Err(ConfigurationError::InvalidReservedKey {
                    key,
                    field: "_label",
                    expected: "string",
                });
            }
        };

        if name.is_empty() {
            return Err(ConfigurationError::EmptyProviderName { key });
        }
        if self.contains(&key) {
            return Err(ConfigurationError::DuplicateInstance { key });
        }

        if enabled {
            self.enabled.push(ConfiguredBlock {
                key,
                name,
                label,
                block,
            });
        } else {
            tracing::debug!(target: GRAPH_TARGET, key = %key, "provider instance disabled");
            self.disabled.push(DisabledBlock { key, name, label });
        }
        Ok(())
    }

    fn push_list(&mut self, items: &[Value]) -> Result<(), ConfigurationError> {
        for (index, item) in items.iter().enumerate() {
            let Value::Object(block) = item else {
                return Err(ConfigurationError::MalformedBlock {
                    key: format!("{PROVIDERS_KEY}[{index}]"),
                });
            };
            let Some(Value::String(name)) = block.get("_name") else {
                return Err(ConfigurationError::MissingName { index });
            };
            let label = match block.get("_label") {
                None => String::new(),
                Some(Value::String(label)) => label.clone(),
                Some(_) => {
                    return Err(ConfigurationError::InvalidReservedKey {
                        key: format!("{PROVIDERS_KEY}[{index}]"),
                        field: "_label",
                        expected: "string",
                    });
                }
            };
            let key = if label.is_empty() {
                name.clone()
            } else {
                format!("{name}@{label}")
            };
            self.push(key, item, Some(label))?;
        }
        Ok(())
    }
}

fn collect_blocks(config: &Value) -> Result<CollectedBlocks, ConfigurationError> {
    let mut blocks = CollectedBlocks::default();
    let root = match config {
        Value::Null => return Ok(blocks),
        Value::Object(root) => root,
        _ => return Err(ConfigurationError::NotAMapping),
    };

    for (key, value) in root {
        if key != PROVIDERS_KEY {
            blocks.push(key.clone(), value, None)?;
            continue;
        }
        match value {
            Value::Null => {}
            Value::Object(nested) => {
                for (nested_key, nested_value) in nested {
                    blocks.push(nested_key.clone(), nested_value, None)?;
                }
            }
            Value::Array(items) => blocks.push_list(items)?,
            _ => {
                return Err(ConfigurationError::MalformedBlock {
                    key: PROVIDERS_KEY.to_owned(),
                });
            }
        }
    }
    Ok(blocks)
}

/// Instances, service index and resolved order built from configuration.
#[derive(Debug)]
pub struct ProviderGraph {
    instances: Vec<Arc<ProviderInstance>>,
    order: Vec<Arc<ProviderInstance>>,
    services: BTreeMap<String, ServiceBinding>,
    types: BTreeMap<TypeId, ServiceBinding>,
    graph: DependencyGraph,
    disabled: Vec<String>,
}

impl ProviderGraph {
    /// Builds every enabled instance of `config` and resolves their order.
    ///
    /// # Errors
    ///
    /// Fails on malformed configuration, unknown providers, service
    /// conflicts, unresolvable dependencies or cycles.
    pub fn build(registry: &Registry, config: &Value) -> Result<Self, HubError> {
        let blocks = collect_blocks(config)?;

        let mut instances = Vec::with_capacity(blocks.enabled.len());
        for block in blocks.enabled {
            let definition = registry.lookup(&block.name).ok_or_else(|| {
                ConfigurationError::ProviderNotFound {
                    name: block.name.clone(),
                    key: block.key.clone(),
                }
            })?;
            instances.push(Arc::new(ProviderInstance::new(
                block.key,
                block.name,
                block.label,
                definition,
                block.block,
            )));
        }

        let services = index_services(&instances)?;
        let types = index_service_types(&instances)?;
        for instance in &instances {
            let bindings = bind_dependencies(instance, &services, registry, &blocks.disabled)?;
            instance.set_dependencies(bindings);
        }

        let graph = dependency_graph(&instances);
        let names = graph.resolve().map_err(|error| {
            let dump = graph.to_string();
            tracing::error!(target: GRAPH_TARGET, graph = %dump, "dependency cycle detected");
            ResolutionError::Cycle {
                unresolved: error.into_unresolved(),
                graph: dump,
            }
        })?;

        let order = names
            .iter()
            .flat_map(|name| {
                instances
                    .iter()
                    .filter(move |instance| instance.name() == name)
                    .cloned()
            })
            .collect();

        Ok(Self {
            instances,
            order,
            services,
            types,
            graph,
            disabled: blocks.disabled.into_iter().map(|block| block.key).collect(),
        })
    }

    /// Instances in configuration order.
    #[must_use]
    pub fn instances(&self) -> &[Arc<ProviderInstance>] {
        &self.instances
    }

    /// Instances in initialisation order.
    #[must_use]
    pub fn order(&self) -> &[Arc<ProviderInstance>] {
        &self.order
    }

    /// Keys in initialisation order.
    #[must_use]
    pub fn order_keys(&self) -> Vec<String> {
        self.order
            .iter()
            .map(|instance| instance.key().to_owned())
            .collect()
    }

    /// Instance configured under `key`.
    #[must_use]
    pub fn instance(&self, key: &str) -> Option<&Arc<ProviderInstance>> {
        self.instances.iter().find(|instance| instance.key() == key)
    }

    /// Instances exposing `service`.
    #[must_use]
    pub fn service(&self, service: &str) -> Option<&ServiceBinding> {
        self.services.get(service)
    }

    /// Instances whose service value is locatable as the type `id`.
    #[must_use]
    pub fn service_type(&self, id: TypeId) -> Option<&ServiceBinding> {
        self.types.get(&id)
    }

    /// Dependency graph over provider names.
    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Keys of disabled blocks.
    #[must_use]
    pub fn disabled(&self) -> &[String] {
        &self.disabled
    }

    /// Human-readable graph and instance order.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut text = String::from("Dependency graph:\n");
        for line in self.graph.to_string().lines() {
            text.push_str("  ");
            text.push_str(line);
            text.push('\n');
        }
        text.push_str("Initialization order:\n");
        for instance in &self.order {
            text.push_str("  ");
            text.push_str(instance.key());
            text.push('\n');
        }
        text
    }
}

fn index_services(
    instances: &[Arc<ProviderInstance>],
) -> Result<BTreeMap<String, ServiceBinding>, RegistrationError> {
    let mut services: BTreeMap<String, ServiceBinding> = BTreeMap::new();
    for instance in instances {
        for service in instance.definition().services() {
            let binding = services
                .entry(service.clone())
                .or_insert_with(|| ServiceBinding {
                    provider: instance.name().to_owned(),
                    instances: Vec::new(),
                });
            if binding.provider != instance.name() {
                return Err(RegistrationError::ServiceConflict {
                    service: service.clone(),
                    first: binding.provider.clone(),
                    second: instance.name().to_owned(),
                });
            }
            binding.instances.push(Arc::clone(instance));
        }
    }
    Ok(services)
}

fn index_service_types(
    instances: &[Arc<ProviderInstance>],
) -> Result<BTreeMap<TypeId, ServiceBinding>, RegistrationError> {
    let mut types: BTreeMap<TypeId, ServiceBinding> = BTreeMap::new();
    for instance in instances {
        for service_type in instance.definition().service_types() {
            let binding = types
                .entry(service_type.id())
                .or_insert_with(|| ServiceBinding {
                    provider: instance.name().to_owned(),
                    instances: Vec::new(),
                });
            if binding.provider != instance.name() {
                return Err(RegistrationError::ServiceTypeConflict {
                    service_type: service_type.name().to_owned(),
                    first: binding.provider.clone(),
                    second: instance.name().to_owned(),
                });
            }
            binding.instances.push(Arc::clone(instance));
        }
    }
    Ok(types)
}

fn bind_dependencies(
    instance: &ProviderInstance,
    services: &BTreeMap<String, ServiceBinding>,
    registry: &Registry,
    disabled: &[DisabledBlock],
) -> Result<Vec<DependencyBinding>, HubError> {
    let mut bindings = Vec::new();
    for requested in instance.definition().dependencies() {
        let (service, label) = split_request(&requested);
        let selection = services
            .get(service)
            .map_or(Selection::Missing, |binding| {
                select(binding, &requested, label)
            });
        match selection {
            Selection::Found(target) => bindings.push(DependencyBinding::new(
                &requested,
                target.key(),
                target.name(),
            )),
            Selection::Ambiguous(candidates) => {
                return Err(ResolutionError::AmbiguousService {
                    service: requested,
                    requester: instance.key().to_owned(),
                    candidates,
                }
                .into());
            }
            Selection::Missing => {
                let disabled_offer = disabled.iter().any(|block| {
                    offers(registry, &block.name, service)
                        && (label.is_none() || block.key == requested)
                });
                if disabled_offer {
                    return Err(ConfigurationError::DisabledDependency {
                        service: requested,
                        requester: instance.key().to_owned(),
                    }
                    .into());
                }
                return Err(ResolutionError::MissingService {
                    service: requested,
                    requester: instance.key().to_owned(),
                }
                .into());
            }
        }
    }
    Ok(bindings)
}

fn offers(registry: &Registry, provider: &str, service: &str) -> bool {
    registry.lookup(provider).is_some_and(|definition| {
        definition
            .services()
            .iter()
            .any(|offered| offered == service)
    })
}

fn dependency_graph(instances: &[Arc<ProviderInstance>]) -> DependencyGraph {
    let mut names: Vec<&str> = Vec::new();
    let mut edges: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for instance in instances {
        if !names.contains(&instance.name()) {
            names.push(instance.name());
        }
        let node = edges.entry(instance.name()).or_default();
        for binding in instance.dependencies() {
            if !node.iter().any(|existing| existing == binding.provider()) {
                node.push(binding.provider().to_owned());
            }
        }
    }

    let mut graph = DependencyGraph::new();
    for name in names {
        graph.push(GraphNode::new(name, edges.remove(name).unwrap_or_default()));
    }
    graph
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::provider::Provider;
    use crate::registry::ProviderDefinition;

    struct Inert;

    impl Provider for Inert {}

    fn registry() -> Registry {
        let mut registry = Registry::new();
        let definitions = [
            ("db", ProviderDefinition::new(|| Inert).with_services(["db"])),
            ("cache", ProviderDefinition::new(|| Inert).with_services(["cache"])),
            (
                "api",
                ProviderDefinition::new(|| Inert)
                    .with_services(["api"])
                    .with_dependencies(["db", "cache@primary"]),
            ),
            (
                "audit",
                ProviderDefinition::new(|| Inert).with_dependencies(["cache@replica"]),
            ),
            (
                "reporting",
                ProviderDefinition::new(|| Inert).with_dependencies(["cache"]),
            ),
            (
                "session",
                ProviderDefinition::new(|| Inert)
                    .with_services(["session"])
                    .with_dependencies(["db"]),
            ),
        ];
        for (name, definition) in definitions {
            registry.register(name, definition).expect("registration");
        }
        registry
    }

    fn build(config: Value) -> Result<ProviderGraph, HubError> {
        ProviderGraph::build(&registry(), &config)
    }

    #[rstest]
    fn orders_labeled_instances_before_their_dependents() {
        let graph = build(json!({
            "api": {},
            "cache@primary": {},
            "cache@replica": {},
            "db": {},
        }))
        .expect("graph builds");

        assert_eq!(
            graph.order_keys(),
            vec!["cache@primary", "cache@replica", "db", "api"]
        );
        let api = graph.instance("api").expect("api instance");
        let bound: Vec<&str> = api.dependencies().iter().map(DependencyBinding::key).collect();
        assert_eq!(bound, vec!["db", "cache@primary"]);
    }

    #[rstest]
    fn unlabeled_request_between_labeled_instances_is_ambiguous() {
        let error = build(json!({
            "db": {},
            "cache@primary": {},
            "cache@replica": {},
            "reporting": {},
        }))
        .expect_err("bare cache is ambiguous");

        match error {
            HubError::Resolution(ResolutionError::AmbiguousService { candidates, .. }) => {
                assert_eq!(candidates, vec!["cache@primary", "cache@replica"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    fn unlabeled_request_prefers_the_canonical_instance() {
        let graph = build(json!({
            "cache@replica": {},
            "cache": {},
            "reporting": {},
        }))
        .expect("graph builds");

        let reporting = graph.instance("reporting").expect("reporting instance");
        assert_eq!(reporting.dependencies()[0].key(), "cache");
    }

    #[rstest]
    fn labeled_dependency_binds_the_labeled_instance() {
        let graph = build(json!({
            "cache": {},
            "cache@replica": {},
            "audit": {},
        }))
        .expect("graph builds");

        let audit = graph.instance("audit").expect("audit instance");
        assert_eq!(audit.dependencies()[0].key(), "cache@replica");
    }

    #[rstest]
    fn labeled_dependency_ignores_siblings_sharing_the_label() {
        let graph = build(json!({
            "db": {},
            "store@primary": {"_name": "cache"},
            "cache@primary": {},
            "api": {},
        }))
        .expect("graph builds");

        let api = graph.instance("api").expect("api instance");
        let bound: Vec<&str> = api.dependencies().iter().map(DependencyBinding::key).collect();
        assert_eq!(bound, vec!["db", "cache@primary"]);
    }

    #[rstest]
    fn labeled_dependency_needs_the_exact_key() {
        let error = build(json!({
            "store@replica": {"_name": "cache"},
            "audit": {},
        }))
        .expect_err("no instance is keyed cache@replica");

        assert!(
            matches!(
                error,
                HubError::Resolution(ResolutionError::MissingService { ref service, .. })
                    if service == "cache@replica"
            ),
            "unexpected error: {error}"
        );
    }

    #[rstest]
    fn providers_list_entries_name_themselves() {
        let graph = build(json!({
            "providers": [
                {"_name": "cache", "_label": "primary"},
                {"_name": "db"},
            ],
        }))
        .expect("graph builds");

        assert_eq!(graph.order_keys(), vec!["cache@primary", "db"]);
        let cache = graph.instance("cache@primary").expect("listed instance");
        assert_eq!(cache.label(), "primary");
    }

    #[rstest]
    fn name_override_picks_the_provider() {
        let graph = build(json!({"store": {"_name": "db"}})).expect("graph builds");

        let store = graph.instance("store").expect("renamed instance");
        assert_eq!(store.name(), "db");
    }

    #[rstest]
    fn disabled_instances_are_skipped() {
        let graph = build(json!({
            "db": {},
            "cache@replica": {"_enable": false},
        }))
        .expect("graph builds");

        assert_eq!(graph.order_keys(), vec!["db"]);
        assert_eq!(graph.disabled(), ["cache@replica"]);
        assert!(graph.service("cache").is_none());
    }

    #[rstest]
    fn dependency_on_disabled_instance_is_reported() {
        let error = build(json!({
            "db": {"_enable": false},
            "session": {},
        }))
        .expect_err("db is disabled");

        assert!(
            matches!(
                error,
                HubError::Configuration(ConfigurationError::DisabledDependency { ref service, .. })
                    if service == "db"
            ),
            "unexpected error: {error}"
        );
    }

    #[rstest]
    fn missing_labeled_dependency_is_reported() {
        let error = build(json!({"cache": {}, "audit": {}}))
            .expect_err("no replica configured");

        assert!(
            matches!(
                error,
                HubError::Resolution(ResolutionError::MissingService { ref service, .. })
                    if service == "cache@replica"
            ),
            "unexpected error: {error}"
        );
    }

    #[rstest]
    #[case::scalar_root(json!([1, 2]))]
    #[case::scalar_block(json!({"db": 3}))]
    #[case::bad_enable(json!({"db": {"_enable": "no"}}))]
    #[case::unnamed_entry(json!({"providers": [{"_label": "x"}]}))]
    #[case::empty_name(json!({"@label": {}}))]
    #[case::duplicate_key(json!({"db": {}, "providers": {"db": {}}}))]
    #[case::unknown_provider(json!({"queue": {}}))]
    fn malformed_configuration_is_rejected(#[case] config: Value) {
        let error = build(config).expect_err("configuration must be rejected");

        assert!(
            matches!(error, HubError::Configuration(_)),
            "unexpected error: {error}"
        );
    }

    #[rstest]
    fn service_conflict_names_both_providers() {
        let mut registry = registry();
        registry
            .register(
                "redis",
                ProviderDefinition::new(|| Inert).with_services(["cache"]),
            )
            .expect("registration");

        let error = ProviderGraph::build(&registry, &json!({"cache": {}, "redis": {}}))
            .expect_err("conflicting services");

        match error {
            HubError::Registration(RegistrationError::ServiceConflict {
                service,
                first,
                second,
            }) => {
                assert_eq!(service, "cache");
                assert_eq!(first, "cache");
                assert_eq!(second, "redis");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    fn cycles_are_reported_with_the_graph() {
        let mut registry = Registry::new();
        registry
            .register(
                "a",
                ProviderDefinition::new(|| Inert)
                    .with_services(["a"])
                    .with_dependencies(["b"]),
            )
            .expect("registration");
        registry
            .register(
                "b",
                ProviderDefinition::new(|| Inert)
                    .with_services(["b"])
                    .with_dependencies(["a"]),
            )
            .expect("registration");

        let error = ProviderGraph::build(&registry, &json!({"a": {}, "b": {}}))
            .expect_err("cycle");

        match error {
            HubError::Resolution(ResolutionError::Cycle { unresolved, graph }) => {
                assert_eq!(unresolved, vec!["a", "b"]);
                assert!(graph.contains("a -> b"), "{graph}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
