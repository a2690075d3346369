// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The toplevel role: the window-manager dialogue.
//!
//! The awkward part is that the X side reports state changes and size
//! changes through unordered channels (property notify vs configure
//! notify). Changes are batched over a short window and, with the
//! workaround enabled, missing state flags are guessed from a per-state
//! size history until the property catches up.

use std::time::Duration;

use hashbrown::HashMap;
use tracing::{debug, trace, warn};
use wayland_protocols::xdg::{
    decoration::zv1::server::zxdg_toplevel_decoration_v1::{self, Mode},
    shell::server::xdg_toplevel,
};
use wayland_server::{Resource as _, WEnum};

use crate::bridge::{
    callbacks::CallbackKey,
    region::{Rect, Region},
    surface::{SurfaceHook, SurfaceKey},
    xdg::XdgPart,
    xserver::MoveResizeDirection,
    State, TimerEvent,
};

/// How long to batch state and size changes before flushing a configure, so
/// the unordered notifies can coalesce.
pub const STATE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct WmStates {
    pub maximized: bool,
    pub fullscreen: bool,
    pub activated: bool,
    pub resizing: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Capabilities {
    pub window_menu: bool,
    pub maximize: bool,
    pub fullscreen: bool,
    pub minimize: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            window_menu: true,
            maximize: true,
            fullscreen: true,
            minimize: true,
        }
    }
}

pub struct ToplevelRole {
    pub xdg_toplevel: xdg_toplevel::XdgToplevel,

    pub initial_configure_sent: bool,

    pub title: Option<String>,
    pub app_id: Option<String>,

    pub states: WmStates,
    pub capabilities: Capabilities,

    pub parent: Option<SurfaceKey>,
    /// Hooks registered on the parent's unmap/destroy lists, so they can be
    /// unregistered when the link changes.
    pub parent_hooks: Option<(SurfaceKey, CallbackKey, CallbackKey)>,

    pub min_size: (i32, i32),
    pub max_size: (i32, i32),
    pub pending_min_size: Option<(i32, i32)>,
    pub pending_max_size: Option<(i32, i32)>,

    pub decoration: Option<zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1>,
    pub decoration_mode: Mode,
    pub pending_decoration: Option<Mode>,

    /// Active interactive resize, with the accumulated west/north offsets
    /// to apply once the client catches up.
    pub resize_edges: Option<xdg_toplevel::ResizeEdge>,
    pub resize_offset: (i32, i32),
    pub last_geometry_size: (i32, i32),

    /// The most recent size the window manager gave us.
    pub wm_size: (u16, u16),
    /// Observed window position, for offset moves.
    pub wm_pos: (i32, i32),

    /// Size at the time each (maximized, fullscreen) combination was last
    /// seen, for guessing states from dimensions.
    pub size_history: HashMap<(bool, bool), (u16, u16)>,

    pub state_timer: Option<crate::bridge::TimerKey>,
    /// Armed while an interactive resize is live; clears the resizing flag
    /// when the configure stream goes quiet.
    pub settle_timer: Option<crate::bridge::TimerKey>,
}

impl ToplevelRole {
    pub fn new(xdg_toplevel: xdg_toplevel::XdgToplevel) -> Self {
        Self {
            xdg_toplevel,

            initial_configure_sent: false,

            title: None,
            app_id: None,

            states: WmStates::default(),
            capabilities: Capabilities::default(),

            parent: None,
            parent_hooks: None,

            min_size: (0, 0),
            max_size: (0, 0),
            pending_min_size: None,
            pending_max_size: None,

            decoration: None,
            decoration_mode: Mode::ServerSide,
            pending_decoration: None,

            resize_edges: None,
            resize_offset: (0, 0),
            last_geometry_size: (0, 0),

            wm_size: (0, 0),
            wm_pos: (0, 0),

            size_history: HashMap::new(),

            state_timer: None,
            settle_timer: None,
        }
    }

    fn raw_states(&self) -> Vec<u8> {
        let mut states = Vec::new();
        if self.states.maximized {
            states.push(xdg_toplevel::State::Maximized);
        }
        if self.states.fullscreen {
            states.push(xdg_toplevel::State::Fullscreen);
        }
        if self.states.activated {
            states.push(xdg_toplevel::State::Activated);
        }
        if self.states.resizing {
            states.push(xdg_toplevel::State::Resizing);
        }

        states
            .into_iter()
            .flat_map(|st| {
                let v: u32 = st.into();
                v.to_ne_bytes()
            })
            .collect()
    }

    fn raw_capabilities(&self) -> Vec<u8> {
        let mut caps = Vec::new();
        if self.capabilities.window_menu {
            caps.push(xdg_toplevel::WmCapabilities::WindowMenu);
        }
        if self.capabilities.maximize {
            caps.push(xdg_toplevel::WmCapabilities::Maximize);
        }
        if self.capabilities.fullscreen {
            caps.push(xdg_toplevel::WmCapabilities::Fullscreen);
        }
        if self.capabilities.minimize {
            caps.push(xdg_toplevel::WmCapabilities::Minimize);
        }

        caps.into_iter()
            .flat_map(|c| {
                let v: u32 = c.into();
                v.to_ne_bytes()
            })
            .collect()
    }
}

/// Guesses the (maximized, fullscreen) flags for a size the window manager
/// chose, from the history of sizes each combination was last seen at. Used
/// while the configure notify has arrived but the property notify hasn't.
pub fn guess_states_from_size(
    history: &HashMap<(bool, bool), (u16, u16)>,
    size: (u16, u16),
) -> Option<(bool, bool)> {
    // Prefer the more specific combinations.
    for combo in [(true, true), (false, true), (true, false), (false, false)] {
        if history.get(&combo) == Some(&size) {
            return Some(combo);
        }
    }

    None
}

impl State {
    /// Sends the very first configure for a toplevel, in response to the
    /// client's first content commit.
    pub fn toplevel_send_initial_configure(&mut self, id: SurfaceKey) {
        let screen = (
            self.xs.screen.width_in_pixels,
            self.xs.screen.height_in_pixels,
        );

        let Some(role) = self.xdg_role_mut(id) else {
            return;
        };

        let XdgPart::Toplevel(ref mut toplevel) = role.part else {
            return;
        };

        toplevel.initial_configure_sent = true;

        if toplevel.xdg_toplevel.version() >= 5 {
            let caps = toplevel.raw_capabilities();
            toplevel.xdg_toplevel.wm_capabilities(caps);
        }

        if toplevel.xdg_toplevel.version() >= 4 {
            toplevel
                .xdg_toplevel
                .configure_bounds(screen.0 as i32, screen.1 as i32);
        }

        trace!(surface = ?self.surfaces[id], "sending initial configure");
        self.toplevel_send_configure(id);
    }

    /// Emits xdg_toplevel.configure with the current states and size,
    /// followed by the serial-carrying xdg_surface.configure.
    pub fn toplevel_send_configure(&mut self, id: SurfaceKey) {
        let factor = match self.surfaces.get(id) {
            Some(surface) => 1.0_f64.max(surface.factor),
            None => return,
        };

        let Some(role) = self.xdg_role_mut(id) else {
            return;
        };

        let XdgPart::Toplevel(ref mut toplevel) = role.part else {
            return;
        };

        let (w, h) = toplevel.wm_size;
        let (w, h) = (
            (w as f64 / factor).round() as i32,
            (h as f64 / factor).round() as i32,
        );

        let states = toplevel.raw_states();
        toplevel.xdg_toplevel.configure(w, h, states);

        if toplevel.wm_size != (0, 0) {
            toplevel
                .size_history
                .insert((toplevel.states.maximized, toplevel.states.fullscreen), toplevel.wm_size);
        }

        self.xdg_send_configure(id);
    }

    /// The toplevel part of the commit hook: mapping policy and deferred
    /// size-hint updates.
    pub fn toplevel_committed(&mut self, id: SurfaceKey) {
        let has_buffer = self.surfaces[id].current.buffer.is_some();

        let Some(role) = self.xdg_role_mut(id) else {
            return;
        };
        let window = role.window;
        let mapped = role.mapped;
        let in_handshake = role.waiting_ack_configure || role.waiting_ack_commit;

        let XdgPart::Toplevel(ref mut toplevel) = role.part else {
            return;
        };

        // Track geometry changes during an interactive resize from a west
        // or north edge: the window must shift so the opposite edge stays
        // put, once the resized content actually lands.
        let geometry_size = role
            .geometry
            .map(|g| (g.width, g.height))
            .unwrap_or(toplevel.last_geometry_size);

        if let Some(edges) = toplevel.resize_edges {
            let (old_w, old_h) = toplevel.last_geometry_size;
            if geometry_size != (old_w, old_h) && (old_w, old_h) != (0, 0) {
                let (mut dx, mut dy) = toplevel.resize_offset;
                if matches!(
                    edges,
                    xdg_toplevel::ResizeEdge::Left
                        | xdg_toplevel::ResizeEdge::TopLeft
                        | xdg_toplevel::ResizeEdge::BottomLeft
                ) {
                    dx += old_w - geometry_size.0;
                }
                if matches!(
                    edges,
                    xdg_toplevel::ResizeEdge::Top
                        | xdg_toplevel::ResizeEdge::TopLeft
                        | xdg_toplevel::ResizeEdge::TopRight
                ) {
                    dy += old_h - geometry_size.1;
                }
                toplevel.resize_offset = (dx, dy);
            }
        }
        toplevel.last_geometry_size = geometry_size;

        let mut hints_dirty = false;
        if let Some(min) = toplevel.pending_min_size.take() {
            toplevel.min_size = min;
            hints_dirty = true;
        }
        if let Some(max) = toplevel.pending_max_size.take() {
            toplevel.max_size = max;
            hints_dirty = true;
        }

        if !has_buffer {
            // A commit with no buffer unmaps the window, and the next map
            // needs a fresh initial configure.
            toplevel.initial_configure_sent = false;

            if mapped {
                let role = self.roles[self.surfaces[id].role.unwrap()].as_xdg_mut();
                role.mapped = false;
                role.frame_clock.cancel();
                role.frame_callbacks_gated = false;

                if let Err(err) = self.xs.unmap_window(window) {
                    warn!(?err, window, "unmap failed");
                }

                debug!(window, "unmapped toplevel");
                self.surface_unmapped(id);
            }

            return;
        }

        if hints_dirty {
            self.toplevel_rewrite_size_hints(id);
        }

        if !mapped && !in_handshake {
            let role = self.roles[self.surfaces[id].role.unwrap()].as_xdg_mut();
            role.mapped = true;

            let XdgPart::Toplevel(ref toplevel) = role.part else {
                return;
            };
            let title = toplevel.title.clone();
            let app_id = toplevel.app_id.clone();

            if let Some(title) = title {
                let _ = self.xs.set_title(window, &title);
            }
            if let Some(app_id) = app_id {
                let _ = self.xs.set_class(window, &app_id);
            }

            if let Err(err) = self.xs.map_window(window) {
                warn!(?err, window, "map failed");
            }

            debug!(window, "mapped toplevel");
        }
    }

    pub fn toplevel_set_title(&mut self, id: SurfaceKey, title: String) {
        let Some(role) = self.xdg_role_mut(id) else {
            return;
        };
        let window = role.window;
        let mapped = role.mapped;

        if let XdgPart::Toplevel(ref mut toplevel) = role.part {
            toplevel.title = Some(title.clone());
        }

        if mapped {
            if let Err(err) = self.xs.set_title(window, &title) {
                warn!(?err, window, "failed to set title");
            }
        }
    }

    pub fn toplevel_set_app_id(&mut self, id: SurfaceKey, app_id: String) {
        let Some(role) = self.xdg_role_mut(id) else {
            return;
        };
        let window = role.window;
        let mapped = role.mapped;

        if let XdgPart::Toplevel(ref mut toplevel) = role.part {
            toplevel.app_id = Some(app_id.clone());
        }

        // Class hints only make sense before the window is mapped.
        if !mapped {
            if let Err(err) = self.xs.set_class(window, &app_id) {
                warn!(?err, window, "failed to set class");
            }
        }
    }

    /// Updates the transient-for link. Linking to one's own descendant (or
    /// self) would make the chain cyclic and is refused.
    pub fn toplevel_set_parent(
        &mut self,
        id: SurfaceKey,
        parent: Option<SurfaceKey>,
    ) -> Result<(), (xdg_toplevel::Error, String)> {
        if self.xdg_role(id).and_then(|r| r.toplevel()).is_none() {
            return Ok(());
        }

        if let Some(parent_id) = parent {
            let mut cursor = Some(parent_id);
            while let Some(ancestor) = cursor {
                if ancestor == id {
                    return Err((
                        xdg_toplevel::Error::InvalidParent,
                        "Parent chain would form a cycle.".into(),
                    ));
                }

                cursor = self
                    .xdg_role(ancestor)
                    .and_then(|r| r.toplevel())
                    .and_then(|t| t.parent);
            }
        }

        self.toplevel_unlink_parent(id);

        if let Some(parent_id) = parent {
            let hook = SurfaceHook::ReparentToGrandparent { child: id };
            let Some(parent_surface) = self.surfaces.get_mut(parent_id) else {
                return Ok(());
            };
            let unmap_key = parent_surface.unmap_callbacks.push_back(hook);
            let destroy_key = parent_surface.destroy_callbacks.push_back(hook);

            if let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) {
                toplevel.parent = Some(parent_id);
                toplevel.parent_hooks = Some((parent_id, unmap_key, destroy_key));
            }
        }

        Ok(())
    }

    pub(super) fn toplevel_unlink_parent(&mut self, id: SurfaceKey) {
        let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) else {
            return;
        };

        toplevel.parent = None;
        let Some((parent_id, unmap_key, destroy_key)) = toplevel.parent_hooks.take() else {
            return;
        };

        if let Some(parent) = self.surfaces.get_mut(parent_id) {
            parent.unmap_callbacks.remove(unmap_key);
            parent.destroy_callbacks.remove(destroy_key);
        }
    }

    /// A parent went away; hand its children to the grandparent. The cycle
    /// check in set_parent keeps the chain finite.
    pub fn reparent_to_grandparent(&mut self, child: SurfaceKey, parent: SurfaceKey) {
        let grandparent = self
            .xdg_role(parent)
            .and_then(|r| r.toplevel())
            .and_then(|t| t.parent);

        trace!(?child, ?grandparent, "reparenting orphaned toplevel");

        // The old link to `parent` is already being torn down.
        if let Some(toplevel) = self.xdg_role_mut(child).and_then(|r| r.toplevel_mut()) {
            toplevel.parent = None;
            toplevel.parent_hooks = None;
        }

        if self.toplevel_set_parent(child, grandparent).is_err() {
            // A cycle through the grandparent can't happen unless state is
            // already corrupt; drop the link instead.
            let _ = self.toplevel_set_parent(child, None);
        }
    }

    pub fn toplevel_set_maximized(&mut self, id: SurfaceKey, on: bool) {
        let Some(role) = self.xdg_role(id) else {
            return;
        };
        let window = role.window;

        let (vert, horz) = (
            self.xs.atoms._NET_WM_STATE_MAXIMIZED_VERT,
            self.xs.atoms._NET_WM_STATE_MAXIMIZED_HORZ,
        );
        if let Err(err) = self.xs.request_wm_state(window, on, vert, horz) {
            warn!(?err, window, "maximize request failed");
        }
        let _ = self.xs.flush();
    }

    pub fn toplevel_set_fullscreen(&mut self, id: SurfaceKey, on: bool) {
        let Some(role) = self.xdg_role(id) else {
            return;
        };
        let window = role.window;

        let fullscreen = self.xs.atoms._NET_WM_STATE_FULLSCREEN;
        if let Err(err) = self
            .xs
            .request_wm_state(window, on, fullscreen, x11rb::NONE)
        {
            warn!(?err, window, "fullscreen request failed");
        }
        let _ = self.xs.flush();
    }

    pub fn toplevel_set_minimized(&mut self, id: SurfaceKey) {
        let Some(role) = self.xdg_role(id) else {
            return;
        };
        let window = role.window;

        if let Err(err) = self.xs.request_minimize(window) {
            warn!(?err, window, "minimize request failed");
        }
        let _ = self.xs.flush();
    }

    pub fn toplevel_move(&mut self, id: SurfaceKey) {
        let Some(role) = self.xdg_role(id) else {
            return;
        };
        let window = role.window;

        if let Err(err) = self
            .xs
            .request_move_resize(window, MoveResizeDirection::Move)
        {
            warn!(?err, window, "move request failed");
        }
        let _ = self.xs.flush();
    }

    pub fn toplevel_resize(&mut self, id: SurfaceKey, edges: WEnum<xdg_toplevel::ResizeEdge>) {
        let Ok(edges) = edges.into_result() else {
            return;
        };

        let direction = match edges {
            xdg_toplevel::ResizeEdge::Top => MoveResizeDirection::SizeTop,
            xdg_toplevel::ResizeEdge::Bottom => MoveResizeDirection::SizeBottom,
            xdg_toplevel::ResizeEdge::Left => MoveResizeDirection::SizeLeft,
            xdg_toplevel::ResizeEdge::Right => MoveResizeDirection::SizeRight,
            xdg_toplevel::ResizeEdge::TopLeft => MoveResizeDirection::SizeTopLeft,
            xdg_toplevel::ResizeEdge::TopRight => MoveResizeDirection::SizeTopRight,
            xdg_toplevel::ResizeEdge::BottomLeft => MoveResizeDirection::SizeBottomLeft,
            xdg_toplevel::ResizeEdge::BottomRight => MoveResizeDirection::SizeBottomRight,
            _ => return,
        };

        let Some(role) = self.xdg_role_mut(id) else {
            return;
        };
        let window = role.window;

        if let XdgPart::Toplevel(ref mut toplevel) = role.part {
            toplevel.resize_edges = Some(edges);
            toplevel.states.resizing = true;
        }

        if let Err(err) = self.xs.request_move_resize(window, direction) {
            warn!(?err, window, "resize request failed");
        }
        let _ = self.xs.flush();

        // Broadcast the resizing state right away.
        self.toplevel_send_configure(id);
    }

    /// The handshake commit landed; shift the window by the offsets an
    /// edge resize accumulated.
    pub fn apply_resize_offsets(&mut self, id: SurfaceKey) {
        let Some(role) = self.xdg_role_mut(id) else {
            return;
        };
        let window = role.window;
        let (w, h) = role.window_size();

        let XdgPart::Toplevel(ref mut toplevel) = role.part else {
            return;
        };

        let (dx, dy) = std::mem::replace(&mut toplevel.resize_offset, (0, 0));
        if (dx, dy) == (0, 0) {
            return;
        }

        let (x, y) = toplevel.wm_pos;
        let (x, y) = (x + dx, y + dy);
        toplevel.wm_pos = (x, y);

        if let Err(err) = self.xs.move_resize_window(window, x, y, w, h) {
            warn!(?err, window, "offset move failed");
        }
    }

    pub fn toplevel_set_min_size(
        &mut self,
        id: SurfaceKey,
        width: i32,
        height: i32,
    ) -> Result<(), (xdg_toplevel::Error, String)> {
        if width < 0 || height < 0 {
            return Err((
                xdg_toplevel::Error::InvalidSize,
                "Negative minimum size.".into(),
            ));
        }

        if let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) {
            toplevel.pending_min_size = Some((width, height));
        }

        Ok(())
    }

    pub fn toplevel_set_max_size(
        &mut self,
        id: SurfaceKey,
        width: i32,
        height: i32,
    ) -> Result<(), (xdg_toplevel::Error, String)> {
        if width < 0 || height < 0 {
            return Err((
                xdg_toplevel::Error::InvalidSize,
                "Negative maximum size.".into(),
            ));
        }

        if let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) {
            toplevel.pending_max_size = Some((width, height));
        }

        Ok(())
    }

    /// Writes WM_NORMAL_HINTS from the committed min/max sizes, scaled to
    /// device pixels.
    pub fn toplevel_rewrite_size_hints(&mut self, id: SurfaceKey) {
        let factor = self.surfaces[id].factor;
        let Some(role) = self.xdg_role(id) else {
            return;
        };
        let window = role.window;

        let Some(toplevel) = role.toplevel() else {
            return;
        };

        let scale = |(w, h): (i32, i32)| {
            (
                (w as f64 * factor).round() as i32,
                (h as f64 * factor).round() as i32,
            )
        };

        let min = (toplevel.min_size != (0, 0)).then(|| scale(toplevel.min_size));
        let max = (toplevel.max_size != (0, 0)).then(|| scale(toplevel.max_size));
        let size = role.geometry.map(|g| scale((g.width, g.height)));

        if let Err(err) = self.xs.set_size_hints(window, size, min, max, None) {
            warn!(?err, window, "failed to write size hints");
        }
    }

    /// A configure notify arrived for the backing window. The new size is
    /// batched; a resize drag flushes immediately.
    pub fn toplevel_wm_configured(
        &mut self,
        id: SurfaceKey,
        x: i32,
        y: i32,
        width: u16,
        height: u16,
    ) {
        let direct = self.config.direct_state_changes;

        // The window's placement is the part of the output the surface
        // occupies.
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.outputs =
                Region::from_rect(Rect::new(x, y, width as i32, height as i32));
        }

        let Some(role) = self.xdg_role_mut(id) else {
            return;
        };

        let size_changed = {
            let XdgPart::Toplevel(ref mut toplevel) = role.part else {
                return;
            };

            toplevel.wm_pos = (x, y);
            let changed = toplevel.wm_size != (width, height);
            toplevel.wm_size = (width, height);
            changed
        };

        if size_changed {
            // Until the client commits for the new size, bounds changes on
            // our side must not fight the window manager.
            role.temporary_bounds = true;
        }

        let resizing = role
            .toplevel()
            .map(|t| t.states.resizing)
            .unwrap_or_default();

        if resizing {
            // With no button release to observe, the resize is over when
            // the configure stream goes quiet for a full batch window.
            let old = {
                let toplevel = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()).unwrap();
                toplevel.settle_timer.take()
            };
            if let Some(old) = old {
                self.timers.cancel(old);
            }

            let timer = self
                .timers
                .arm(STATE_DELAY * 2, TimerEvent::ResizeSettle { surface: id });
            if let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) {
                toplevel.settle_timer = Some(timer);
            }
        }

        if !size_changed {
            return;
        }

        if resizing || direct {
            self.toplevel_flush_wm_state(id);
        } else {
            self.toplevel_arm_state_timer(id);
        }
    }

    /// A `_NET_WM_STATE` property notify arrived.
    pub fn toplevel_wm_state_changed(&mut self, id: SurfaceKey) {
        let Some(role) = self.xdg_role(id) else {
            return;
        };
        let window = role.window;

        let atoms = match self.xs.read_net_wm_state(window) {
            Ok(atoms) => atoms,
            Err(err) => {
                warn!(?err, window, "failed to read _NET_WM_STATE");
                return;
            }
        };

        let maximized = atoms.contains(&self.xs.atoms._NET_WM_STATE_MAXIMIZED_VERT)
            && atoms.contains(&self.xs.atoms._NET_WM_STATE_MAXIMIZED_HORZ);
        let fullscreen = atoms.contains(&self.xs.atoms._NET_WM_STATE_FULLSCREEN);
        let activated = atoms.contains(&self.xs.atoms._NET_WM_STATE_FOCUSED);

        let direct = self.config.direct_state_changes;
        let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) else {
            return;
        };

        let new = WmStates {
            maximized,
            fullscreen,
            activated,
            resizing: toplevel.states.resizing,
        };

        if new == toplevel.states {
            return;
        }
        toplevel.states = new;

        if toplevel.states.resizing || direct {
            self.toplevel_flush_wm_state(id);
        } else {
            self.toplevel_arm_state_timer(id);
        }
    }

    /// `_NET_WM_ALLOWED_ACTIONS` changed; recompute the capability mask.
    pub fn toplevel_wm_actions_changed(&mut self, id: SurfaceKey) {
        let Some(role) = self.xdg_role(id) else {
            return;
        };
        let window = role.window;

        let atoms = match self.xs.read_allowed_actions(window) {
            Ok(atoms) => atoms,
            Err(err) => {
                warn!(?err, window, "failed to read allowed actions");
                return;
            }
        };

        let capabilities = Capabilities {
            window_menu: true,
            maximize: atoms.contains(&self.xs.atoms._NET_WM_ACTION_MAXIMIZE_HORZ)
                && atoms.contains(&self.xs.atoms._NET_WM_ACTION_MAXIMIZE_VERT),
            fullscreen: atoms.contains(&self.xs.atoms._NET_WM_ACTION_FULLSCREEN),
            minimize: atoms.contains(&self.xs.atoms._NET_WM_ACTION_MINIMIZE),
        };

        let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) else {
            return;
        };

        if capabilities == toplevel.capabilities {
            return;
        }
        toplevel.capabilities = capabilities;

        if toplevel.xdg_toplevel.version() >= 5 {
            let caps = toplevel.raw_capabilities();
            toplevel.xdg_toplevel.wm_capabilities(caps);
        }
    }

    fn toplevel_arm_state_timer(&mut self, id: SurfaceKey) {
        let Some(toplevel) = self.xdg_role(id).and_then(|r| r.toplevel()) else {
            return;
        };

        if toplevel.state_timer.is_some() {
            return;
        }

        let timer = self
            .timers
            .arm(STATE_DELAY, TimerEvent::FlushWmState { surface: id });

        if let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) {
            toplevel.state_timer = Some(timer);
        }
    }

    /// Flushes batched state and size changes as one configure. With the
    /// workaround enabled, a size that matches a remembered combination
    /// fills in state flags the property notify hasn't delivered yet.
    pub fn toplevel_flush_wm_state(&mut self, id: SurfaceKey) {
        let workaround = self.config.apply_state_workaround;

        {
            let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) else {
                return;
            };

            if let Some(timer) = toplevel.state_timer.take() {
                self.timers.cancel(timer);
            }
        }

        // Re-borrow; cancel needed the timers field.
        let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) else {
            return;
        };

        if workaround {
            if let Some((maximized, fullscreen)) =
                guess_states_from_size(&toplevel.size_history, toplevel.wm_size)
            {
                toplevel.states.maximized = maximized;
                toplevel.states.fullscreen = fullscreen;
            }
        }

        self.toplevel_send_configure(id);
    }

    /// An interactive resize settled: no configure arrived for a full batch
    /// window. Clear the flag and re-broadcast.
    pub fn toplevel_resize_settled(&mut self, id: SurfaceKey) {
        let Some(toplevel) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) else {
            return;
        };

        toplevel.settle_timer = None;
        if !toplevel.states.resizing {
            return;
        }

        toplevel.states.resizing = false;
        toplevel.resize_edges = None;
        self.toplevel_send_configure(id);
    }

    /// The client destroyed its xdg_toplevel; the surface reverts to a bare
    /// xdg_surface and the window disappears until a new role maps it.
    pub fn toplevel_destroyed(&mut self, id: SurfaceKey, resource: &xdg_toplevel::XdgToplevel) {
        {
            let Some(role) = self.xdg_role(id) else {
                return;
            };

            if !role.toplevel().is_some_and(|t| t.xdg_toplevel == *resource) {
                return;
            }
        }

        self.toplevel_unlink_parent(id);

        let role = self.xdg_role_mut(id).unwrap();
        let window = role.window;
        let was_mapped = role.mapped;
        role.mapped = false;
        role.frame_clock.cancel();
        role.frame_callbacks_gated = false;

        if let Some(toplevel) = role.toplevel() {
            let timers = [toplevel.state_timer, toplevel.settle_timer];
            for timer in timers.into_iter().flatten() {
                self.timers.cancel(timer);
            }
        }

        let role = self.xdg_role_mut(id).unwrap();
        role.part = XdgPart::Bare;

        if was_mapped {
            if let Err(err) = self.xs.unmap_window(window) {
                warn!(?err, window, "unmap failed");
            }
            self.surface_unmapped(id);
        }

        debug!(window, "toplevel destroyed");
    }

    /// The window manager asked the window to close.
    pub fn toplevel_close(&mut self, id: SurfaceKey) {
        if let Some(toplevel) = self.xdg_role(id).and_then(|r| r.toplevel()) {
            toplevel.xdg_toplevel.close();
        }
    }

    /// Applies a decoration mode negotiated earlier, once the handshake
    /// commit lands. Transitions rewrite the motif hints.
    pub fn apply_pending_decoration(&mut self, id: SurfaceKey) {
        let Some(role) = self.xdg_role_mut(id) else {
            return;
        };
        let window = role.window;

        let XdgPart::Toplevel(ref mut toplevel) = role.part else {
            return;
        };

        let Some(mode) = toplevel.pending_decoration.take() else {
            return;
        };

        if mode == toplevel.decoration_mode {
            return;
        }
        toplevel.decoration_mode = mode;

        let decorated = mode == Mode::ServerSide;
        if let Err(err) = self.xs.set_motif_hints(window, decorated) {
            warn!(?err, window, "failed to write motif hints");
        }
        let _ = self.xs.flush();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn guesses_most_specific_combo_first() {
        let mut history = HashMap::new();
        history.insert((false, false), (800, 600));
        history.insert((true, false), (1920, 1043));
        history.insert((false, true), (1920, 1080));

        assert_eq!(
            guess_states_from_size(&history, (1920, 1080)),
            Some((false, true))
        );
        assert_eq!(
            guess_states_from_size(&history, (1920, 1043)),
            Some((true, false))
        );
        assert_eq!(
            guess_states_from_size(&history, (800, 600)),
            Some((false, false))
        );
        assert_eq!(guess_states_from_size(&history, (640, 480)), None);
    }

    #[test]
    fn ambiguous_sizes_prefer_fullscreen() {
        let mut history = HashMap::new();
        history.insert((false, false), (1920, 1080));
        history.insert((false, true), (1920, 1080));

        // A fullscreen window and a floating one can share dimensions; the
        // guess prefers the state the window manager reached last via the
        // more specific combination.
        assert_eq!(
            guess_states_from_size(&history, (1920, 1080)),
            Some((false, true))
        );
    }
}
