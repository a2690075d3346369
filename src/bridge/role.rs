// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use wayland_protocols::xdg::shell::server::xdg_surface;

use crate::bridge::xdg::XdgRole;

slotmap::new_key_type! { pub struct RoleKey; }

/// The role kinds a surface can adopt. A surface adopts at most one kind
/// over its lifetime; the kind sticks even if the role object is destroyed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RoleKind {
    Xdg,
}

/// A bound role. Hooks dispatch by matching on the variant; there is no
/// vtable.
pub enum Role {
    Xdg(XdgRole),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Xdg(_) => RoleKind::Xdg,
        }
    }

    pub fn as_xdg(&self) -> &XdgRole {
        match self {
            Role::Xdg(role) => role,
        }
    }

    pub fn as_xdg_mut(&mut self) -> &mut XdgRole {
        match self {
            Role::Xdg(role) => role,
        }
    }
}

/// What the role wants done with a commit, decided before any state is
/// merged.
pub enum Precommit {
    Proceed,
    /// Accumulate this commit in the cached state; it will be applied after
    /// the configure handshake completes.
    Defer,
    Reject(xdg_surface::Error, String),
}
