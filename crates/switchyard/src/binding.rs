//! Merging of compiled defaults, file blocks and overrides.

use std::env;

use serde_json::map::Entry;
use serde_json::{Map, Value};

use crate::error::ConfigurationError;
use crate::flags::FlagValues;
use crate::registry::{ConfigSpec, FieldBinding};

/// Block keys consumed by the graph builder.
pub(crate) const RESERVED_KEYS: [&str; 3] = ["_name", "_label", "_enable"];

/// Flag bound by a labeled instance: `<flag>-<label>`.
pub(crate) fn instance_flag(flag: &str, label: &str) -> String {
    if label.is_empty() {
        flag.to_owned()
    } else {
        format!("{flag}-{label}")
    }
}

/// Environment variable bound by a labeled instance: `<ENV>_<LABEL>`.
pub(crate) fn instance_env(env: &str, label: &str) -> String {
    if label.is_empty() {
        return env.to_owned();
    }
    let suffix: String = label
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{env}_{suffix}")
}

/// The block without its reserved keys.
pub(crate) fn strip_reserved(block: &Map<String, Value>) -> Map<String, Value> {
    block
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Overlays `overlay` onto `base`, merging nested mappings key by key.
pub(crate) fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.entry(key) {
                    Entry::Occupied(mut slot) => deep_merge(slot.get_mut(), value),
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Inputs shared by every binding of one instance.
pub(crate) struct BindingScope<'a> {
    pub(crate) key: &'a str,
    pub(crate) label: &'a str,
    pub(crate) flags: &'a FlagValues,
}

/// Builds the merged configuration value of one instance.
pub(crate) fn merged_value(
    provider: &str,
    spec: &ConfigSpec,
    block: &Map<String, Value>,
    scope: &BindingScope<'_>,
) -> Result<Value, ConfigurationError> {
    let mut value = spec
        .defaults()
        .map_err(|source| ConfigurationError::Defaults {
            provider: provider.to_owned(),
            source,
        })?;
    if value.is_null() {
        value = Value::Object(Map::new());
    }
    deep_merge(&mut value, Value::Object(strip_reserved(block)));

    for binding in spec.bindings() {
        if let Some(raw) = env_override(binding, scope)? {
            apply_override(&mut value, binding.field(), &raw)
                .map_err(|reason| invalid(scope, binding, "environment", &raw, reason))?;
        }
    }
    for binding in spec.bindings() {
        let Some(flag) = binding.flag_name() else {
            continue;
        };
        if let Some(raw) = scope.flags.get(&instance_flag(flag, scope.label)) {
            apply_override(&mut value, binding.field(), raw)
                .map_err(|reason| invalid(scope, binding, "flag", raw, reason))?;
        }
    }
    Ok(value)
}

fn env_override(
    binding: &FieldBinding,
    scope: &BindingScope<'_>,
) -> Result<Option<String>, ConfigurationError> {
    let Some(name) = binding.env_name() else {
        return Ok(None);
    };
    match env::var(instance_env(name, scope.label)) {
        Ok(raw) => Ok(Some(raw)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(raw)) => Err(invalid(
            scope,
            binding,
            "environment",
            &raw.to_string_lossy(),
            "value is not valid UTF-8".to_owned(),
        )),
    }
}

fn invalid(
    scope: &BindingScope<'_>,
    binding: &FieldBinding,
    origin: &'static str,
    raw: &str,
    reason: String,
) -> ConfigurationError {
    ConfigurationError::InvalidOverride {
        key: scope.key.to_owned(),
        field: binding.field().to_owned(),
        origin,
        value: raw.to_owned(),
        reason,
    }
}

/// Writes `raw` at the dotted `path`, coerced to the type already there.
pub(crate) fn apply_override(root: &mut Value, path: &str, raw: &str) -> Result<(), String> {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(format!("{segment} is not inside a mapping"));
        };
        if segments.peek().is_none() {
            let coerced = coerce(map.get(segment), raw)?;
            map.insert(segment.to_owned(), coerced);
            return Ok(());
        }
        current = map
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Err("empty field path".to_owned())
}

/// Parses `raw` as the JSON type of `existing`.
pub(crate) fn coerce(existing: Option<&Value>, raw: &str) -> Result<Value, String> {
    match existing {
        Some(Value::Bool(_)) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
            _ => Err("expected a boolean".to_owned()),
        },
        Some(Value::Number(_)) => match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value @ Value::Number(_)) => Ok(value),
            _ => Err("expected a number".to_owned()),
        },
        Some(Value::Array(items)) => raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| coerce(items.first(), item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Some(Value::Object(_)) => match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Object(_)) => Ok(value),
            _ => Err("expected a JSON object".to_owned()),
        },
        Some(Value::String(_) | Value::Null) | None => Ok(Value::String(raw.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::unlabeled("greeting", "", "greeting")]
    #[case::labeled("greeting", "primary", "greeting-primary")]
    fn flags_are_namespaced_by_label(#[case] flag: &str, #[case] label: &str, #[case] expected: &str) {
        assert_eq!(instance_flag(flag, label), expected);
    }

    #[rstest]
    #[case::unlabeled("CACHE_SIZE", "", "CACHE_SIZE")]
    #[case::labeled("CACHE_SIZE", "replica", "CACHE_SIZE_REPLICA")]
    #[case::punctuated("CACHE_SIZE", "eu-west.2", "CACHE_SIZE_EU_WEST_2")]
    fn environment_is_namespaced_by_label(
        #[case] env: &str,
        #[case] label: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(instance_env(env, label), expected);
    }

    #[rstest]
    fn deep_merge_keeps_untouched_defaults() {
        let mut base = json!({"pool": {"size": 4, "timeout": 30}, "name": "db"});

        deep_merge(&mut base, json!({"pool": {"size": 8}}));

        assert_eq!(base, json!({"pool": {"size": 8, "timeout": 30}, "name": "db"}));
    }

    #[rstest]
    #[case::boolean(json!(false), "true", json!(true))]
    #[case::integer(json!(4), "16", json!(16))]
    #[case::float(json!(0.5), "0.25", json!(0.25))]
    #[case::list(json!(["a"]), "x, y,z", json!(["x", "y", "z"]))]
    #[case::number_list(json!([1]), "2,3", json!([2, 3]))]
    #[case::object(json!({}), r#"{"k": 1}"#, json!({"k": 1}))]
    #[case::string(json!("old"), "new", json!("new"))]
    fn overrides_follow_the_default_type(
        #[case] existing: Value,
        #[case] raw: &str,
        #[case] expected: Value,
    ) {
        assert_eq!(coerce(Some(&existing), raw), Ok(expected));
    }

    #[rstest]
    #[case::boolean(json!(true), "maybe")]
    #[case::number(json!(1), "many")]
    #[case::object(json!({}), "[1]")]
    fn mistyped_overrides_are_rejected(#[case] existing: Value, #[case] raw: &str) {
        assert!(coerce(Some(&existing), raw).is_err());
    }

    #[rstest]
    fn override_creates_nested_path() {
        let mut root = json!({});

        apply_override(&mut root, "pool.size", "8").expect("override applies");

        assert_eq!(root, json!({"pool": {"size": "8"}}));
    }

    #[rstest]
    fn reserved_keys_are_stripped() {
        let block = json!({"_name": "cache", "_label": "a", "_enable": true, "size": 1});
        let Value::Object(block) = block else {
            panic!("fixture is a mapping");
        };

        assert_eq!(Value::Object(strip_reserved(&block)), json!({"size": 1}));
    }
}
