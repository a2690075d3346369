// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::ffi::OsString;

/// Runtime configuration, from the CLI and the environment. Nothing is
/// persisted.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Wayland socket name; auto-generated when unset.
    pub socket_name: Option<OsString>,

    /// A client command to spawn with WAYLAND_DISPLAY set.
    pub command: Vec<OsString>,

    /// Force a server round trip after every dispatch pass, for debugging.
    pub synchronize: bool,

    /// Guess window-manager states from dimensions while the property
    /// notify lags behind the configure notify.
    pub apply_state_workaround: bool,

    /// Disable the short batching window for configure events.
    pub direct_state_changes: bool,

    /// The output scale windows are laid out at.
    pub global_scale: i32,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            socket_name: None,
            command: Vec::new(),
            synchronize: env_flag("SYNCHRONIZE"),
            apply_state_workaround: env_flag("APPLY_STATE_WORKAROUND"),
            direct_state_changes: env_flag("DIRECT_STATE_CHANGES"),
            global_scale: 1,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|v| !v.is_empty() && v != "0")
}
