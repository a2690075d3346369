// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The xdg_surface role: a surface backed by a real server window.
//!
//! This is where the configure handshake lives. A configure event freezes
//! the frame clock and makes commits accumulate in the cached state; the
//! ack clears the first gate and the following commit clears the second,
//! unfreezing the clock and applying anything that waited on the handshake.

use tracing::{debug, trace, warn};
use wayland_protocols::xdg::shell::server::{xdg_surface, xdg_wm_base};
use x11rb::protocol::{sync, xproto};

use crate::bridge::{
    callbacks::CallbackList,
    frame_clock::{FrameClock, FrameEvent, StartFrame},
    region::Rect,
    release::ReleaseTracker,
    role::{Precommit, Role, RoleKey, RoleKind},
    surface::{PendingMask, SurfaceKey},
    toplevel::ToplevelRole,
    ConstraintKey, State,
};

/// What sits on top of the bare xdg_surface.
pub enum XdgPart {
    Bare,
    Toplevel(ToplevelRole),
}

/// Hooks external consumers hang on the window's movements.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReconstrainHook {
    /// Re-evaluate a pointer constraint against the new window position.
    UpdateConstraint { constraint: ConstraintKey },
}

pub struct XdgRole {
    pub surface: SurfaceKey,
    pub xdg_surface: xdg_surface::XdgSurface,
    pub wm_base: xdg_wm_base::XdgWmBase,

    pub window: xproto::Window,
    pub frame_counters: [sync::Counter; 2],
    pub frame_clock: FrameClock,
    pub release: ReleaseTracker,

    /// A configure event is in flight and hasn't been acked.
    pub waiting_ack_configure: bool,
    /// The ack arrived but the matching commit hasn't.
    pub waiting_ack_commit: bool,
    /// Suppresses window resizes between a server-driven size change and
    /// the client catching up with it.
    pub temporary_bounds: bool,
    /// The compositing manager can scan the window out directly.
    pub direct_present: bool,

    /// Emitted configure serials the client hasn't acked, oldest first.
    pub outstanding_configures: Vec<u32>,
    pub last_acked: Option<u32>,

    pub pending_geometry: Option<Rect>,
    pub geometry: Option<Rect>,

    /// Last known bounding box of the surface's view tree.
    pub bounds: Rect,

    pub mapped: bool,

    /// Frame callbacks are due but gated on the release queue draining.
    pub frame_callbacks_gated: bool,

    /// Window-manager pings awaiting the client's pong.
    pub pending_pings: Vec<u32>,

    pub reconstrain_configure: CallbackList<ReconstrainHook>,
    pub reconstrain_moved: CallbackList<ReconstrainHook>,

    pub part: XdgPart,
}

impl XdgRole {
    pub fn toplevel(&self) -> Option<&ToplevelRole> {
        match &self.part {
            XdgPart::Toplevel(t) => Some(t),
            XdgPart::Bare => None,
        }
    }

    pub fn toplevel_mut(&mut self) -> Option<&mut ToplevelRole> {
        match &mut self.part {
            XdgPart::Toplevel(t) => Some(t),
            XdgPart::Bare => None,
        }
    }

    /// The size the server window should have: the window geometry if the
    /// client set one, the view bounds otherwise.
    pub fn window_size(&self) -> (u16, u16) {
        let rect = self.geometry.unwrap_or(self.bounds);
        (
            rect.width.clamp(1, u16::MAX as i32) as u16,
            rect.height.clamp(1, u16::MAX as i32) as u16,
        )
    }
}

impl State {
    /// Creates the backing window and role state for an xdg_surface.
    pub fn create_xdg_role(
        &mut self,
        id: SurfaceKey,
        wm_base: xdg_wm_base::XdgWmBase,
        xdg_surface: xdg_surface::XdgSurface,
    ) -> anyhow::Result<RoleKey> {
        self.xs.trap_begin()?;
        let window = self.xs.create_window(1, 1)?;
        let frame_counters = self.xs.create_frame_counters(window)?;
        if let Some(err) = self.xs.trap_end()? {
            // Most likely the server is out of memory; the caller posts
            // no-memory on the wayland side.
            anyhow::bail!("failed to create server window: {:?}", err);
        }

        let role = self.roles.insert(Role::Xdg(XdgRole {
            surface: id,
            xdg_surface,
            wm_base,

            window,
            frame_counters,
            frame_clock: FrameClock::new(),
            release: ReleaseTracker::new(),

            waiting_ack_configure: false,
            waiting_ack_commit: false,
            temporary_bounds: false,
            direct_present: self.xs.has_present,

            outstanding_configures: Vec::new(),
            last_acked: None,

            pending_geometry: None,
            geometry: None,
            bounds: Rect::default(),

            mapped: false,
            frame_callbacks_gated: false,
            pending_pings: Vec::new(),

            reconstrain_configure: CallbackList::new(),
            reconstrain_moved: CallbackList::new(),

            part: XdgPart::Bare,
        }));

        self.windows.insert(window, role);

        let surface = &mut self.surfaces[id];
        surface.role = Some(role);
        surface.role_kind = Some(RoleKind::Xdg);

        let view = surface.view;
        self.renderer.view_set_target(view, Some(window));

        debug!(window, surface = ?self.surfaces[id], "created xdg role");

        Ok(role)
    }

    /// Tears the role down: the release queue is drained with a renderer
    /// round trip first so no idle callback is still in flight.
    pub fn detach_role(&mut self, id: SurfaceKey) {
        let Some(role_key) = self.surfaces.get(id).and_then(|s| s.role) else {
            return;
        };

        // A transient link leaves hooks on the parent; take them down first.
        self.toplevel_unlink_parent(id);

        let Some(Role::Xdg(mut role)) = self.roles.remove(role_key) else {
            return;
        };
        self.surfaces[id].role = None;

        if let Err(err) = self.renderer.sync() {
            warn!(?err, "renderer sync failed during role teardown");
        }

        for record in role.release.drain() {
            if let Some(buffer) = self.buffers.get_mut(record.buffer) {
                buffer.release();
            }
            self.destroy_buffer_if_dead(record.buffer);
        }

        role.frame_clock.cancel();

        self.windows.remove(&role.window);
        let view = self.surfaces[id].view;
        self.renderer.view_set_target(view, None);

        let _ = self.xs.destroy_frame_counters(role.frame_counters);
        let _ = self.xs.destroy_window(role.window);
        let _ = self.xs.flush();

        debug!(window = role.window, "detached xdg role");
    }

    pub fn role_precommit(&mut self, id: SurfaceKey) -> Precommit {
        let Some(role) = self.xdg_role(id) else {
            return Precommit::Proceed;
        };

        let pending = &self.surfaces[id].pending;
        let attaching = pending.mask.contains(PendingMask::BUFFER) && pending.buffer.is_some();

        if attaching && matches!(role.part, XdgPart::Bare) {
            // An xdg_surface without a role object can't show content.
            return Precommit::Reject(
                xdg_surface::Error::UnconfiguredBuffer,
                "A buffer was attached before a role object was created.".into(),
            );
        }

        let needs_initial = matches!(role.part, XdgPart::Toplevel(ref t) if !t.initial_configure_sent);

        if attaching && needs_initial {
            // The content can only land once the initial configure round
            // trip completes; park it in the cached state until then.
            self.toplevel_send_initial_configure(id);
            return Precommit::Defer;
        }

        if self.xdg_role(id).is_some_and(|role| role.waiting_ack_configure) {
            return Precommit::Defer;
        }

        Precommit::Proceed
    }

    /// The role's commit hook, after state has been merged and applied.
    pub fn role_committed(&mut self, id: SurfaceKey) {
        let Some(role_key) = self.surfaces.get(id).and_then(|s| s.role) else {
            return;
        };

        // Window geometry applies on commit. The margins around it are
        // published as frame extents.
        let new_geometry = {
            let role = self.roles[role_key].as_xdg_mut();
            match role.pending_geometry.take() {
                Some(geometry) => {
                    role.geometry = Some(geometry);
                    Some((geometry, role.bounds, role.window))
                }
                None => None,
            }
        };

        if let Some((geometry, bounds, window)) = new_geometry {
            let extents = [
                geometry.x.max(0) as u32,
                (bounds.width - geometry.x - geometry.width).max(0) as u32,
                geometry.y.max(0) as u32,
                (bounds.height - geometry.y - geometry.height).max(0) as u32,
            ];

            if let Err(err) = self.xs.set_frame_extents(window, extents) {
                warn!(?err, window, "failed to write frame extents");
            }
        }

        // The commit after the ack completes the handshake.
        let handshake_done = {
            let role = self.roles[role_key].as_xdg_mut();
            if role.waiting_ack_commit && !role.waiting_ack_configure {
                role.waiting_ack_commit = false;
                role.temporary_bounds = false;
                if role.frame_clock.frozen() {
                    role.frame_clock.unfreeze();
                }
                true
            } else {
                false
            }
        };

        if handshake_done {
            self.apply_resize_offsets(id);
            self.run_reconstrain_moved(role_key);
        }

        self.toplevel_committed(id);
        self.sync_window_size(id);

        // Pace the frame: bracket this commit's content with the counter.
        let now_ms = self.clock.current().as_u64();
        self.role_note_frame(role_key, FrameEvent::Started, 0, now_ms);

        // While the clock is frozen the client can't get a frame callback
        // from a draw, so run them now.
        if self.roles[role_key].as_xdg().frame_clock.frozen() {
            self.flush_frame_callbacks_early(id);
        }
    }

    /// Allocates a serial and sends xdg_surface.configure, freezing the
    /// clock until the handshake completes.
    pub fn xdg_send_configure(&mut self, id: SurfaceKey) -> Option<u32> {
        let serial = self.serial.next();
        let role_key = self.surfaces.get(id).and_then(|s| s.role)?;
        let role = self.roles[role_key].as_xdg_mut();

        role.xdg_surface.configure(serial);
        role.outstanding_configures.push(serial);

        if !role.waiting_ack_configure && !role.waiting_ack_commit {
            role.frame_clock.freeze();
        }
        role.waiting_ack_configure = true;
        role.waiting_ack_commit = true;

        trace!(serial, window = role.window, "sent configure");

        Some(serial)
    }

    pub fn xdg_ack_configure(
        &mut self,
        id: SurfaceKey,
        serial: u32,
    ) -> Result<(), (xdg_surface::Error, String)> {
        let Some(role_key) = self.surfaces.get(id).and_then(|s| s.role) else {
            return Err((
                xdg_surface::Error::NotConstructed,
                "Surface has no role.".into(),
            ));
        };

        let role = self.roles[role_key].as_xdg_mut();

        // Acks must name an emitted serial, each at most once, in order.
        let position = role
            .outstanding_configures
            .iter()
            .position(|s| *s == serial);

        let Some(position) = position else {
            return Err((
                xdg_surface::Error::InvalidSerial,
                format!("Serial {serial} was never sent, or was already acked."),
            ));
        };

        // Skipped serials are implicitly acked by a later one.
        role.outstanding_configures.drain(..=position);
        let previous = role.last_acked.replace(serial);

        if role.outstanding_configures.is_empty() {
            role.waiting_ack_configure = false;
        }

        trace!(serial, ?previous, window = role.window, "configure acked");

        Ok(())
    }

    /// The renderer recomputed the bounding box under this surface.
    pub fn role_bounds_changed(&mut self, id: SurfaceKey) {
        let Some(role_key) = self.surfaces.get(id).and_then(|s| s.role) else {
            return;
        };

        let view = self.surfaces[id].view;
        let bounds = self.renderer.view_bounds(view);

        let role = self.roles[role_key].as_xdg_mut();
        if bounds == role.bounds {
            return;
        }
        role.bounds = bounds;

        self.sync_window_size(id);
        self.role_opaque_region_changed(id);
        self.role_input_region_changed(id);
    }

    /// Resizes the server window to match geometry/bounds, unless a
    /// server-driven resize is mid-flight.
    fn sync_window_size(&mut self, id: SurfaceKey) {
        let Some(role) = self.xdg_role(id) else {
            return;
        };

        if role.temporary_bounds || !role.mapped {
            return;
        }

        let (w, h) = role.window_size();
        let window = role.window;
        if let Err(err) = self.xs.resize_window(window, w, h) {
            warn!(?err, window, "window resize failed");
        }
    }

    pub fn role_opaque_region_changed(&mut self, id: SurfaceKey) {
        let Some(role) = self.xdg_role(id) else {
            return;
        };

        let window = role.window;
        let mut region = self.surfaces[id].current.opaque.clone();
        if let Some(geometry) = role.geometry {
            region.translate(-geometry.x, -geometry.y);
        }

        if let Err(err) = self.xs.set_opaque_region(window, &region) {
            warn!(?err, window, "failed to write opaque region");
        }
    }

    pub fn role_input_region_changed(&mut self, id: SurfaceKey) {
        let Some(role) = self.xdg_role(id) else {
            return;
        };

        let window = role.window;
        match &self.surfaces[id].current.input {
            None => {
                // Infinite input region; drop the shape so the whole window
                // accepts input.
                if let Err(err) = self.xs.clear_input_shape(window) {
                    warn!(?err, window, "failed to clear input shape");
                }
            }
            Some(input) => {
                let mut region = input.clone();
                region.scale(self.surfaces[id].factor);
                if let Some(geometry) = self.xdg_role(id).unwrap().geometry {
                    region.translate(-geometry.x, -geometry.y);
                }

                if let Err(err) = self.xs.set_input_shape(window, &region) {
                    warn!(?err, window, "failed to set input shape");
                }
            }
        }
    }

    /// The surface scale changed; size hints and geometry derive from it.
    pub fn role_rescale(&mut self, id: SurfaceKey) {
        if self.xdg_role(id).is_none() {
            return;
        }

        self.toplevel_rewrite_size_hints(id);
        self.sync_window_size(id);
    }

    /// Frame-clock input from the compositing manager.
    pub fn role_note_frame(
        &mut self,
        role_key: RoleKey,
        event: FrameEvent,
        frame_id: u64,
        time_ms: u64,
    ) {
        let Some(role) = self.roles.get_mut(role_key) else {
            return;
        };
        let role = role.as_xdg_mut();
        let id = role.surface;
        let window = role.window;

        match event {
            FrameEvent::Started => {
                if !role.mapped {
                    return;
                }

                let extended = role.frame_counters[1];
                match role.frame_clock.start_frame(time_ms, false) {
                    StartFrame::Started(odd) => {
                        let even = role.frame_clock.end_frame();
                        let _ = self.xs.set_counter(extended, odd);
                        if let Some(even) = even {
                            let _ = self.xs.set_counter(extended, even);
                        }
                        let _ = self.xs.flush();
                    }
                    StartFrame::Batched => (),
                    StartFrame::Refused => {
                        trace!(window, "frame refused");
                    }
                }
            }
            FrameEvent::Complete => {
                if !role.frame_clock.handle_frame_drawn(frame_id, time_ms) {
                    trace!(frame_id, window, "stale frame-drawn");
                    return;
                }

                if role.release.is_empty() {
                    self.fire_frame_callbacks(id, time_ms);
                } else {
                    // Clients expect their buffers back before the callback.
                    role.frame_callbacks_gated = true;
                }
            }
            FrameEvent::Presented => {
                if role.frame_clock.handle_frame_timings(frame_id, 0) && role.direct_present {
                    let _ = self.xs.set_bypass_compositor(window, 0);
                }
            }
            FrameEvent::NotifyDisablePresent => {
                let _ = self.xs.set_bypass_compositor(window, 2);
            }
        }
    }

    /// The renderer reported textures idle; drain matching deferred
    /// releases, and fire gated frame callbacks once a queue empties.
    pub fn process_idle_textures(&mut self) {
        let idle = self.renderer.drain_idle();
        if idle.is_empty() {
            return;
        }

        let role_keys: Vec<RoleKey> = self.roles.keys().collect();
        for texture in idle {
            for role_key in &role_keys {
                let Some(role) = self.roles.get_mut(*role_key) else {
                    continue;
                };
                let role = role.as_xdg_mut();
                let id = role.surface;

                let released = role.release.note_idle(texture);
                let drained = !released.is_empty() && role.release.is_empty();
                for buffer_id in released {
                    if let Some(buffer) = self.buffers.get_mut(buffer_id) {
                        buffer.release();
                    }
                    self.destroy_buffer_if_dead(buffer_id);
                }

                if drained {
                    let role = self.roles[*role_key].as_xdg_mut();
                    if role.frame_callbacks_gated {
                        role.frame_callbacks_gated = false;
                        let time = role.frame_clock.frame_time();
                        self.fire_frame_callbacks(id, time);
                    }
                }
            }
        }
    }

    /// A window-manager ping; stash it and ping the client through the
    /// wm_base. The pong answers every queued ping.
    pub fn role_wm_ping(&mut self, role_key: RoleKey, timestamp: u32) {
        let serial = self.serial.next();
        let Some(role) = self.roles.get_mut(role_key) else {
            return;
        };
        let role = role.as_xdg_mut();

        role.pending_pings.push(timestamp);
        role.wm_base.ping(serial);
        self.ping_serials.insert(serial, role_key);
    }

    pub fn role_client_pong(&mut self, serial: u32) {
        let Some(role_key) = self.ping_serials.remove(&serial) else {
            return;
        };

        let Some(role) = self.roles.get_mut(role_key) else {
            return;
        };
        let role = role.as_xdg_mut();
        let window = role.window;

        for timestamp in std::mem::take(&mut role.pending_pings) {
            let _ = self.xs.reply_ping(window, timestamp);
        }
        let _ = self.xs.flush();
    }

    pub fn run_reconstrain_configure(&mut self, role_key: RoleKey) {
        let Some(role) = self.roles.get_mut(role_key) else {
            return;
        };
        for key in role.as_xdg().reconstrain_configure.keys() {
            let hook = self.roles[role_key]
                .as_xdg()
                .reconstrain_configure
                .get(key)
                .copied();
            if let Some(hook) = hook {
                self.run_reconstrain_hook(hook);
            }
        }
    }

    pub fn run_reconstrain_moved(&mut self, role_key: RoleKey) {
        let Some(role) = self.roles.get_mut(role_key) else {
            return;
        };
        for key in role.as_xdg().reconstrain_moved.keys() {
            let hook = self.roles[role_key]
                .as_xdg()
                .reconstrain_moved
                .get(key)
                .copied();
            if let Some(hook) = hook {
                self.run_reconstrain_hook(hook);
            }
        }
    }

    fn run_reconstrain_hook(&mut self, hook: ReconstrainHook) {
        match hook {
            ReconstrainHook::UpdateConstraint { constraint } => {
                self.update_pointer_constraint(constraint);
            }
        }
    }

    pub fn xdg_role(&self, id: SurfaceKey) -> Option<&XdgRole> {
        let role = self.surfaces.get(id)?.role?;
        Some(self.roles.get(role)?.as_xdg())
    }

    pub fn xdg_role_mut(&mut self, id: SurfaceKey) -> Option<&mut XdgRole> {
        let role = self.surfaces.get(id)?.role?;
        Some(self.roles.get_mut(role)?.as_xdg_mut())
    }

    /// Checks that a surface may become an xdg_surface.
    pub fn can_assign_xdg(&self, id: SurfaceKey) -> Result<(), (xdg_wm_base::Error, String)> {
        let Some(surface) = self.surfaces.get(id) else {
            return Err((
                xdg_wm_base::Error::DefunctSurfaces,
                "Surface is gone.".into(),
            ));
        };

        if surface.role.is_some()
            || surface.role_kind.is_some_and(|k| k != RoleKind::Xdg)
        {
            return Err((
                xdg_wm_base::Error::Role,
                "Surface already has a role.".into(),
            ));
        }

        if surface.current.buffer.is_some() || surface.pending.mask.contains(PendingMask::BUFFER) {
            return Err((
                xdg_wm_base::Error::InvalidSurfaceState,
                "Surface already has a buffer attached.".into(),
            ));
        }

        Ok(())
    }
}
