//! Splits process arguments between the settings loader and the hub.
//!
//! `ortho_config` rejects flags it does not know, while the hub registers
//! provider flags dynamically. The splitter routes the settings flags listed
//! in [`SETTINGS_CLI_FLAGS`] (and their values) to the settings loader and
//! leaves every other token for the hub's provider flag parser. Both halves
//! keep the program name as their first element.

use std::ffi::{OsStr, OsString};

/// Flags consumed by the settings loader rather than the hub.
pub const SETTINGS_CLI_FLAGS: &[&str] = &[
    "--config-path",
    "--providers-file",
    "--log-filter",
    "--log-format",
    "--shutdown-timeout-secs",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

/// Arguments partitioned between the settings loader and the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsArgumentSplit {
    /// Program name followed by the settings flags and their values.
    pub settings_arguments: Vec<OsString>,
    /// Program name followed by every remaining token, in order.
    pub hub_arguments: Vec<OsString>,
}

fn classify(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    if !text.starts_with("--") {
        return FlagAction::Skip;
    }

    let (flag, has_inline_value) = text
        .split_once('=')
        .map_or((&*text, false), |(name, _)| (name, true));

    if SETTINGS_CLI_FLAGS.contains(&flag) {
        return FlagAction::Include {
            needs_value: !has_inline_value,
        };
    }

    FlagAction::Skip
}

/// Routes settings flags to the settings loader and the rest to the hub.
#[must_use]
pub fn split_settings_arguments(args: &[OsString]) -> SettingsArgumentSplit {
    let Some((program, rest)) = args.split_first() else {
        return SettingsArgumentSplit::default();
    };

    let mut split = SettingsArgumentSplit {
        settings_arguments: vec![program.clone()],
        hub_arguments: vec![program.clone()],
    };

    let mut pending_value = false;
    for argument in rest {
        if pending_value {
            split.settings_arguments.push(argument.clone());
            pending_value = false;
            continue;
        }

        match classify(argument) {
            FlagAction::Include { needs_value } => {
                split.settings_arguments.push(argument.clone());
                pending_value = needs_value;
            }
            FlagAction::Skip => split.hub_arguments.push(argument.clone()),
        }
    }

    split
}
