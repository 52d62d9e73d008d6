//! Command-line flags contributed by providers.

use std::collections::BTreeMap;
use std::ffi::OsString;

use clap::{Arg, ArgAction, Command};

use crate::binding::instance_flag;
use crate::error::ConfigurationError;
use crate::graph::ProviderGraph;
use crate::registry::Registry;

const PROVIDERS_FLAG: &str = "providers";
const GRAPH_FLAG: &str = "graph";
const BUILT_IN_OWNER: &str = "switchyard";

/// Flag values given on the command line, keyed by long flag name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FlagValues {
    values: BTreeMap<String, String>,
}

impl FlagValues {
    pub(crate) fn get(&self, flag: &str) -> Option<&str> {
        self.values.get(flag).map(String::as_str)
    }
}

/// Outcome of parsing the hub's share of the command line.
#[derive(Debug, Default)]
pub(crate) struct ParsedFlags {
    pub(crate) list_providers: bool,
    pub(crate) show_graph: bool,
    pub(crate) values: FlagValues,
}

fn command(registry: &Registry, graph: &ProviderGraph) -> Result<Command, ConfigurationError> {
    let mut owners: BTreeMap<String, String> = BTreeMap::new();
    for built_in in [PROVIDERS_FLAG, GRAPH_FLAG, "help"] {
        owners.insert(built_in.to_owned(), BUILT_IN_OWNER.to_owned());
    }

    let mut command = Command::new(BUILT_IN_OWNER)
        .about("Provider hub")
        .after_help(usage(registry))
        .arg(
            Arg::new(PROVIDERS_FLAG)
                .short('p')
                .long(PROVIDERS_FLAG)
                .action(ArgAction::SetTrue)
                .help("List registered providers and exit"),
        )
        .arg(
            Arg::new(GRAPH_FLAG)
                .short('g')
                .long(GRAPH_FLAG)
                .action(ArgAction::SetTrue)
                .help("Print the provider dependency graph and exit"),
        );

    for instance in graph.instances() {
        let Some(spec) = instance.definition().config() else {
            continue;
        };
        for binding in spec.bindings() {
            let Some(flag) = binding.flag_name() else {
                continue;
            };
            let qualified = instance_flag(flag, instance.label());
            if let Some(first) = owners.get(&qualified) {
                return Err(ConfigurationError::DuplicateFlag {
                    flag: qualified,
                    first: first.clone(),
                    second: instance.key().to_owned(),
                });
            }
            owners.insert(qualified.clone(), instance.key().to_owned());

            let help = binding.help_text().map_or_else(
                || format!("Override {}.{}", instance.key(), binding.field()),
                str::to_owned,
            );
            command = command.arg(
                Arg::new(qualified.clone())
                    .long(qualified)
                    .value_name("VALUE")
                    .action(ArgAction::Set)
                    .value_parser(clap::value_parser!(String))
                    .help(help),
            );
        }
    }
    Ok(command)
}

/// Parses `args` (program name first) against the built-in and provider
/// flags of `graph`.
pub(crate) fn parse(
    registry: &Registry,
    graph: &ProviderGraph,
    args: &[OsString],
) -> Result<ParsedFlags, ConfigurationError> {
    let command = command(registry, graph)?;
    let flag_ids: Vec<String> = command
        .get_arguments()
        .filter(|arg| arg.get_action().takes_values())
        .map(|arg| arg.get_id().to_string())
        .collect();
    let matches = command
        .try_get_matches_from(args)
        .map_err(|source| ConfigurationError::Flags { source })?;

    let values = flag_ids
        .into_iter()
        .filter_map(|id| {
            let value = matches.get_one::<String>(&id)?.clone();
            Some((id, value))
        })
        .collect();

    Ok(ParsedFlags {
        list_providers: matches.get_flag(PROVIDERS_FLAG),
        show_graph: matches.get_flag(GRAPH_FLAG),
        values: FlagValues { values },
    })
}

/// Listing of registered providers printed by `--providers`.
#[must_use]
pub fn usage(registry: &Registry) -> String {
    let mut text = String::from("Registered providers:\n");
    let width = registry
        .definitions()
        .map(|(name, _)| name.len())
        .max()
        .unwrap_or(0);
    for (name, definition) in registry.definitions() {
        text.push_str(&format!("  {name:<width$}"));
        if let Some(description) = definition.description() {
            text.push_str(&format!("  {description}"));
        }
        if !definition.services().is_empty() {
            text.push_str(&format!(" [services: {}]", definition.services().join(", ")));
        }
        let dependencies = definition.dependencies();
        if !dependencies.is_empty() {
            text.push_str(&format!(" [depends on: {}]", dependencies.join(", ")));
        }
        text.push('\n');
    }
    text
}
