// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Surfaces and the commit pipeline.
//!
//! A surface carries three state records. Requests accumulate in `pending`;
//! a commit normally merges pending into `current` and pushes every dirty
//! aspect to the renderer view. While a configure handshake is in flight the
//! role defers the merge and pending accumulates in `cached` instead, so the
//! client's commits stay atomic across the ack.

use std::os::fd::{AsFd as _, OwnedFd};

use tracing::{debug, trace, warn};
use wayland_protocols::wp::linux_explicit_synchronization::zv1::server::{
    zwp_linux_buffer_release_v1, zwp_linux_surface_synchronization_v1,
};
use wayland_protocols::wp::viewporter::server::wp_viewport;
use wayland_protocols::xdg::shell::server::xdg_surface;
use wayland_server::{
    protocol::{wl_callback, wl_output, wl_surface},
    Resource as _,
};

use crate::bridge::{
    buffers::BufferKey,
    callbacks::CallbackList,
    region::Region,
    renderer::{SrcRect, ViewKey},
    role::{Precommit, RoleKey, RoleKind},
    timestamp::Timestamp,
    State,
};

slotmap::new_key_type! { pub struct SurfaceKey; }

/// How long to wait on an acquire fence before giving up and committing the
/// buffer as-is.
const ACQUIRE_FENCE_TIMEOUT_MS: u16 = 5000;

/// Which aspects of a state record are live.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PendingMask(u32);

impl PendingMask {
    pub const BUFFER: Self = Self(1 << 0);
    pub const OFFSET: Self = Self(1 << 1);
    pub const SCALE: Self = Self(1 << 2);
    pub const TRANSFORM: Self = Self(1 << 3);
    pub const INPUT: Self = Self(1 << 4);
    pub const OPAQUE: Self = Self(1 << 5);
    pub const VIEWPORT_SRC: Self = Self(1 << 6);
    pub const VIEWPORT_DST: Self = Self(1 << 7);
    pub const BUFFER_DAMAGE: Self = Self(1 << 8);
    pub const SURFACE_DAMAGE: Self = Self(1 << 9);
    pub const FRAME_CALLBACKS: Self = Self(1 << 10);

    /// Only meaningful on the current state: the attached buffer was already
    /// released during commit.
    pub const BUFFER_RELEASED: Self = Self(1 << 11);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PendingMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One phase of double-buffered surface state.
pub struct SurfaceState {
    pub mask: PendingMask,

    /// `None` with the BUFFER bit set means the buffer was detached.
    pub buffer: Option<BufferKey>,
    pub offset: (i32, i32),
    pub buffer_scale: i32,
    pub transform: wl_output::Transform,

    pub src: Option<SrcRect>,
    pub dst: Option<(i32, i32)>,

    pub buffer_damage: Region,
    pub surface_damage: Region,
    pub opaque: Region,
    /// `None` means the input region is infinite.
    pub input: Option<Region>,

    pub frame_callbacks: CallbackList<wl_callback::WlCallback>,
}

impl Default for SurfaceState {
    fn default() -> Self {
        Self {
            mask: PendingMask::default(),
            buffer: None,
            offset: (0, 0),
            buffer_scale: 1,
            transform: wl_output::Transform::Normal,
            src: None,
            dst: None,
            buffer_damage: Region::new(),
            surface_damage: Region::new(),
            opaque: Region::new(),
            input: None,
            frame_callbacks: CallbackList::new(),
        }
    }
}

impl SurfaceState {
    /// Merges this record into `dst`, consuming the live aspects. Damage
    /// moves rather than copies, and frame callbacks are spliced, so this
    /// record comes out empty either way.
    pub fn merge_into(&mut self, dst: &mut SurfaceState) {
        let mask = self.mask;

        if mask.contains(PendingMask::BUFFER) {
            dst.buffer = self.buffer.take();
        }
        if mask.contains(PendingMask::OFFSET) {
            dst.offset = self.offset;
        }
        if mask.contains(PendingMask::SCALE) {
            dst.buffer_scale = self.buffer_scale;
        }
        if mask.contains(PendingMask::TRANSFORM) {
            dst.transform = self.transform;
        }
        if mask.contains(PendingMask::INPUT) {
            dst.input = self.input.take();
        }
        if mask.contains(PendingMask::OPAQUE) {
            dst.opaque = std::mem::take(&mut self.opaque);
        }
        if mask.contains(PendingMask::VIEWPORT_SRC) {
            dst.src = self.src;
        }
        if mask.contains(PendingMask::VIEWPORT_DST) {
            dst.dst = self.dst;
        }
        if mask.contains(PendingMask::BUFFER_DAMAGE) {
            dst.buffer_damage.union_move(&mut self.buffer_damage);
        }
        if mask.contains(PendingMask::SURFACE_DAMAGE) {
            dst.surface_damage.union_move(&mut self.surface_damage);
        }
        if mask.contains(PendingMask::FRAME_CALLBACKS) {
            dst.frame_callbacks.splice_back(&mut self.frame_callbacks);
        }

        dst.mask.insert(mask);
        self.mask = PendingMask::default();
    }
}

/// Typed callbacks surfaces run on commit, unmap and destroy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SurfaceHook {
    /// A transient child outlives its parent; relink it to the grandparent.
    ReparentToGrandparent { child: SurfaceKey },
    /// Apply a negotiated decoration mode once the handshake commit lands.
    ApplyDecoration,
}

pub struct Surface {
    pub wl_surface: wl_surface::WlSurface,

    pub pending: SurfaceState,
    pub cached: SurfaceState,
    pub current: SurfaceState,
    /// Whether `cached` holds deferred commits.
    pub cached_live: bool,

    pub role: Option<RoleKey>,
    /// Set once; a surface can never adopt a different role kind, even after
    /// the role object goes away.
    pub role_kind: Option<RoleKind>,

    pub view: ViewKey,
    pub under_view: ViewKey,

    /// Surface-to-device scale, derived from the buffer scale and the global
    /// scale.
    pub factor: f64,

    /// The part of the output this surface currently occupies.
    pub outputs: Region,

    pub acquire_fence: Option<OwnedFd>,
    pub sync_resource:
        Option<zwp_linux_surface_synchronization_v1::ZwpLinuxSurfaceSynchronizationV1>,
    pub pending_release: Option<zwp_linux_buffer_release_v1::ZwpLinuxBufferReleaseV1>,
    pub viewport: Option<wp_viewport::WpViewport>,

    pub commit_callbacks: CallbackList<SurfaceHook>,
    pub unmap_callbacks: CallbackList<SurfaceHook>,
    pub destroy_callbacks: CallbackList<SurfaceHook>,
}

impl Surface {
    pub fn new(wl_surface: wl_surface::WlSurface, view: ViewKey, under_view: ViewKey) -> Self {
        Self {
            wl_surface,

            pending: SurfaceState::default(),
            cached: SurfaceState::default(),
            current: SurfaceState::default(),
            cached_live: false,

            role: None,
            role_kind: None,

            view,
            under_view,

            factor: 1.0,
            outputs: Region::new(),

            acquire_fence: None,
            sync_resource: None,
            pending_release: None,
            viewport: None,

            commit_callbacks: CallbackList::new(),
            unmap_callbacks: CallbackList::new(),
            destroy_callbacks: CallbackList::new(),
        }
    }

    /// The input region, defaulting to infinite.
    pub fn input_region(&self) -> Region {
        self.current
            .input
            .clone()
            .unwrap_or_else(Region::infinite)
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<wl_surface@{} {:?}>",
            self.wl_surface.id().protocol_id(),
            self.role_kind,
        )
    }
}

/// The surface-to-device scale. With the buffer ahead of the global scale
/// the content is shrunk, behind it it is blown up.
pub fn effective_scale(buffer_scale: i32, global_scale: i32) -> f64 {
    let e = global_scale - buffer_scale;
    if e >= 0 {
        (buffer_scale * (e + 1)) as f64
    } else {
        buffer_scale as f64 / (e - 1).abs() as f64
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ViewportError {
    BadSize,
    OutOfBuffer,
}

/// Validates a committed viewport against the attached buffer. With the
/// destination unset the source doubles as the destination, so any source
/// problem surfaces as a bad size; otherwise an oversized source is an
/// out-of-buffer error.
pub fn validate_viewport(
    src: Option<SrcRect>,
    dst: Option<(i32, i32)>,
    buffer_dim: Option<(u32, u32)>,
    buffer_scale: i32,
    transform: wl_output::Transform,
) -> Result<(), ViewportError> {
    let Some(src) = src else {
        return Ok(());
    };

    if dst.is_none() && (src.width.fract() != 0.0 || src.height.fract() != 0.0) {
        return Err(ViewportError::BadSize);
    }

    let Some((buf_w, buf_h)) = buffer_dim else {
        return Ok(());
    };

    let (buf_w, buf_h) = match transform {
        wl_output::Transform::_90
        | wl_output::Transform::_270
        | wl_output::Transform::Flipped90
        | wl_output::Transform::Flipped270 => (buf_h, buf_w),
        _ => (buf_w, buf_h),
    };

    let max_w = buf_w as f64 / buffer_scale as f64;
    let max_h = buf_h as f64 / buffer_scale as f64;

    if src.x < 0.0 || src.y < 0.0 || src.x + src.width > max_w || src.y + src.height > max_h {
        return match dst {
            None => Err(ViewportError::BadSize),
            Some(_) => Err(ViewportError::OutOfBuffer),
        };
    }

    Ok(())
}

pub struct CommitError(pub xdg_surface::Error, pub String);

impl State {
    /// Handles wl_surface.commit.
    pub fn surface_commit(&mut self, id: SurfaceKey) -> Result<(), CommitError> {
        // An explicit-sync commit needs a buffer to synchronize against.
        {
            let surface = &self.surfaces[id];
            let will_have_buffer = if surface.pending.mask.contains(PendingMask::BUFFER) {
                surface.pending.buffer.is_some()
            } else {
                surface.current.buffer.is_some()
            };

            if !will_have_buffer
                && (surface.acquire_fence.is_some() || surface.pending_release.is_some())
            {
                if let Some(sync) = &surface.sync_resource {
                    sync.post_error(
                        zwp_linux_surface_synchronization_v1::Error::NoBuffer,
                        "Fence or release set on a commit with no buffer.",
                    );
                }

                let surface = &mut self.surfaces[id];
                surface.acquire_fence = None;
                surface.pending_release = None;
            }
        }

        match self.role_precommit(id) {
            Precommit::Proceed => (),
            Precommit::Defer => {
                let surface = &mut self.surfaces[id];
                let mut pending = std::mem::take(&mut surface.pending);
                pending.merge_into(&mut surface.cached);
                surface.cached_live = true;

                trace!(surface = ?surface, "commit deferred to cached state");

                // The client may be waiting on a frame callback before it
                // acks; while the clock is frozen those run eagerly.
                self.flush_frame_callbacks_early(id);
                return Ok(());
            }
            Precommit::Reject(code, msg) => return Err(CommitError(code, msg)),
        }

        let mut staged = {
            let surface = &mut self.surfaces[id];
            let mut pending = std::mem::take(&mut surface.pending);
            if surface.cached_live {
                let mut cached = std::mem::take(&mut surface.cached);
                pending.merge_into(&mut cached);
                surface.cached_live = false;
                cached
            } else {
                pending
            }
        };

        self.internal_commit(id, &mut staged);

        // Commit callbacks run newest-first and observe current state.
        for key in self.surfaces[id].commit_callbacks.keys_rev() {
            let Some(hook) = self.surfaces[id].commit_callbacks.get(key).copied() else {
                continue;
            };
            self.run_surface_hook(id, hook);

            // Decoration application is one-shot.
            if matches!(hook, SurfaceHook::ApplyDecoration) {
                self.surfaces[id].commit_callbacks.remove(key);
            }
        }

        self.await_acquire_fence(id);
        self.role_committed(id);
        self.attempt_early_release(id);

        Ok(())
    }

    /// Merges a staged state record into current, applying every dirty
    /// aspect to the renderer view in a fixed order.
    fn internal_commit(&mut self, id: SurfaceKey, staged: &mut SurfaceState) {
        let mask = staged.mask;

        // The buffer swap happens first, since the old buffer's release may
        // depend on the renderer picking up the new content.
        if mask.contains(PendingMask::BUFFER) {
            let old = self.surfaces[id].current.buffer;
            let new = staged.buffer;

            if old != new {
                if let Some(old) = old {
                    self.release_or_defer(id, old);
                }

                if let Some(new) = new {
                    if let Some(buffer) = self.buffers.get_mut(new) {
                        buffer.needs_release = true;
                        buffer.explicit_release = self.surfaces[id].pending_release.take();
                        let texture = buffer.texture;
                        let view = self.surfaces[id].view;
                        self.renderer.view_attach(view, Some(texture));
                    }
                } else {
                    let view = self.surfaces[id].view;
                    self.renderer.view_attach(view, None);
                }
            }

            let surface = &mut self.surfaces[id];
            surface.current.buffer = new;
            surface.current.mask.remove(PendingMask::BUFFER_RELEASED);
        }

        if mask.contains(PendingMask::SCALE) {
            let surface = &mut self.surfaces[id];
            surface.current.buffer_scale = staged.buffer_scale;

            let factor = effective_scale(staged.buffer_scale, self.global_scale);
            if factor != surface.factor {
                surface.factor = factor;
                let view = surface.view;
                self.renderer.view_set_scale(view, factor);
                self.role_rescale(id);
            }
        }

        if mask.contains(PendingMask::TRANSFORM) {
            self.surfaces[id].current.transform = staged.transform;
            let view = self.surfaces[id].view;
            self.renderer.view_set_transform(view, staged.transform);
        }

        if mask.contains(PendingMask::INPUT) {
            self.surfaces[id].current.input = staged.input.take();
            self.role_input_region_changed(id);
        }

        if mask.contains(PendingMask::OPAQUE) {
            let mut opaque = std::mem::take(&mut staged.opaque);
            opaque.scale(self.surfaces[id].factor);

            let view = self.surfaces[id].view;
            self.renderer.view_set_opaque(view, &opaque);
            self.surfaces[id].current.opaque = opaque;
            self.role_opaque_region_changed(id);
        }

        if mask.contains(PendingMask::VIEWPORT_SRC) || mask.contains(PendingMask::VIEWPORT_DST) {
            let surface = &self.surfaces[id];
            let src = if mask.contains(PendingMask::VIEWPORT_SRC) {
                staged.src
            } else {
                surface.current.src
            };
            let dst = if mask.contains(PendingMask::VIEWPORT_DST) {
                staged.dst
            } else {
                surface.current.dst
            };

            let buffer_dim = surface
                .current
                .buffer
                .and_then(|b| self.buffers.get(b))
                .map(|b| b.dimensions());

            // Scale and transform were already merged above, so the current
            // values are authoritative here.
            match validate_viewport(
                src,
                dst,
                buffer_dim,
                surface.current.buffer_scale,
                surface.current.transform,
            ) {
                Ok(()) => {
                    let surface = &mut self.surfaces[id];
                    surface.current.src = src;
                    surface.current.dst = dst;
                    let view = surface.view;
                    self.renderer.view_set_viewport(view, src, dst);
                }
                Err(err) => {
                    // The current state keeps the previous viewport.
                    match &self.surfaces[id].viewport {
                        Some(viewport) => {
                            let (code, msg) = match err {
                                ViewportError::BadSize => (
                                    wp_viewport::Error::BadSize,
                                    "Invalid viewport dimensions.",
                                ),
                                ViewportError::OutOfBuffer => (
                                    wp_viewport::Error::OutOfBuffer,
                                    "Source rectangle extends outside the buffer.",
                                ),
                            };
                            viewport.post_error(code, msg);
                        }
                        None => {
                            // The viewport resource is already gone; the
                            // original marks this case undefined.
                            debug!(?err, "viewport error on destroyed viewport resource");
                        }
                    }
                }
            }
        }

        if mask.contains(PendingMask::OFFSET) {
            self.surfaces[id].current.offset = staged.offset;
            let view = self.surfaces[id].view;
            self.renderer
                .view_set_offset(view, staged.offset.0, staged.offset.1);
        }

        if mask.contains(PendingMask::BUFFER_DAMAGE) {
            let surface = &mut self.surfaces[id];
            let mut damage = std::mem::take(&mut staged.buffer_damage);
            // Buffer damage is in buffer pixels; bring it to device space.
            damage.scale(surface.factor / surface.current.buffer_scale as f64);

            let view = surface.view;
            self.renderer.view_set_damage(view, &damage);
        }

        if mask.contains(PendingMask::SURFACE_DAMAGE) {
            let surface = &mut self.surfaces[id];
            let mut damage = std::mem::take(&mut staged.surface_damage);
            damage.scale(surface.factor);

            let view = surface.view;
            self.renderer.view_set_damage(view, &damage);
        }

        if mask.contains(PendingMask::FRAME_CALLBACKS) {
            let surface = &mut self.surfaces[id];
            surface
                .current
                .frame_callbacks
                .splice_back(&mut staged.frame_callbacks);
        }

        let surface = &mut self.surfaces[id];
        surface.current.mask.insert(mask);
        surface.current.mask.remove(
            PendingMask::BUFFER_DAMAGE | PendingMask::SURFACE_DAMAGE | PendingMask::FRAME_CALLBACKS,
        );
    }

    /// Releases the previous buffer, or parks it with the role's tracker if
    /// the renderer is still reading from it.
    // TODO: for a synchronized subsurface this choice may be wrong; the
    // cached buffer can outlive the parent commit that applies it.
    fn release_or_defer(&mut self, id: SurfaceKey, buffer_id: BufferKey) {
        let Some(buffer) = self.buffers.get(buffer_id) else {
            return;
        };

        if !buffer.needs_release {
            return;
        }

        let texture = buffer.texture;
        if self.renderer.can_release_now(texture) {
            self.buffers[buffer_id].release();
            self.destroy_buffer_if_dead(buffer_id);
            return;
        }

        let deferred = match self.surfaces[id].role.and_then(|k| self.roles.get_mut(k)) {
            Some(role) => {
                role.as_xdg_mut().release.defer(buffer_id, texture);
                true
            }
            None => false,
        };

        if deferred {
            self.renderer.watch_idle(texture);
        } else {
            // Without a window nothing is pacing the surface; give the
            // buffer back immediately.
            self.buffers[buffer_id].release();
            self.destroy_buffer_if_dead(buffer_id);
        }
    }

    /// Blocks this surface's commit on the acquire fence, if one was
    /// attached. A fence that never signals is fatal only for the surface:
    /// the commit proceeds with the buffer as-is.
    fn await_acquire_fence(&mut self, id: SurfaceKey) {
        let Some(fence) = self.surfaces[id].acquire_fence.take() else {
            return;
        };

        let mut fds = [nix::poll::PollFd::new(
            fence.as_fd(),
            nix::poll::PollFlags::POLLIN,
        )];

        match nix::poll::poll(&mut fds, ACQUIRE_FENCE_TIMEOUT_MS) {
            Ok(0) => warn!(
                surface = ?self.surfaces[id],
                "acquire fence timed out; committing anyway"
            ),
            Ok(_) => (),
            Err(err) => warn!(?err, "acquire fence poll failed"),
        }
    }

    /// Releases the committed buffer right away when the renderer has
    /// already copied it (the shm path, or a renderer-side texture copy).
    fn attempt_early_release(&mut self, id: SurfaceKey) {
        let surface = &self.surfaces[id];
        let Some(buffer_id) = surface.current.buffer else {
            return;
        };

        if surface.current.mask.contains(PendingMask::BUFFER_RELEASED) {
            return;
        }

        let Some(buffer) = self.buffers.get(buffer_id) else {
            return;
        };

        if buffer.needs_release && self.renderer.can_release_now(buffer.texture) {
            self.buffers[buffer_id].release();
            self.surfaces[id]
                .current
                .mask
                .insert(PendingMask::BUFFER_RELEASED);
        }
    }

    /// Runs frame callbacks now rather than at the next frame completion.
    /// Used while the clock is frozen so clients waiting to ack don't
    /// deadlock on a callback that will never fire.
    pub fn flush_frame_callbacks_early(&mut self, id: SurfaceKey) {
        let now = Timestamp::callback_time(self.clock.current().as_u64());
        let surface = &mut self.surfaces[id];

        for callback in surface.pending.frame_callbacks.drain() {
            callback.done(now);
        }
        for callback in surface.current.frame_callbacks.drain() {
            callback.done(now);
        }
    }

    /// Fires the current frame callbacks with the given timestamp. The
    /// release queue must have drained first.
    pub fn fire_frame_callbacks(&mut self, id: SurfaceKey, time_ms: u64) {
        let now = Timestamp::callback_time(time_ms);
        for callback in self.surfaces[id].current.frame_callbacks.drain() {
            callback.done(now);
        }
    }

    pub fn run_surface_hook(&mut self, id: SurfaceKey, hook: SurfaceHook) {
        match hook {
            SurfaceHook::ReparentToGrandparent { child } => self.reparent_to_grandparent(child, id),
            SurfaceHook::ApplyDecoration => self.apply_pending_decoration(id),
        }
    }

    /// Fires unmap callbacks, newest first. The callbacks are one-shot;
    /// whoever needs to hear about the next unmap registers again.
    pub fn surface_unmapped(&mut self, id: SurfaceKey) {
        for key in self.surfaces[id].unmap_callbacks.keys_rev() {
            let Some(hook) = self.surfaces[id].unmap_callbacks.remove(key) else {
                continue;
            };
            self.run_surface_hook(id, hook);
        }
    }

    /// Cleans up for a surface destroyed by the client.
    pub fn surface_destroyed(&mut self, id: SurfaceKey) {
        // Destroy callbacks fire while the surface is still reachable.
        for key in self.surfaces[id].destroy_callbacks.keys_rev() {
            let Some(hook) = self.surfaces[id].destroy_callbacks.remove(key) else {
                continue;
            };
            self.run_surface_hook(id, hook);
        }

        self.detach_role(id);

        let Some(mut surface) = self.surfaces.remove(id) else {
            return;
        };

        if let Some(buffer_id) = surface.current.buffer.take() {
            if let Some(buffer) = self.buffers.get_mut(buffer_id) {
                buffer.release();
            }
            self.destroy_buffer_if_dead(buffer_id);
        }

        self.renderer.destroy_view(surface.view);
        self.renderer.destroy_view(surface.under_view);

        trace!(surface = ?surface, "surface destroyed");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::region::Rect;
    use pretty_assertions::assert_eq;

    #[test]
    fn merge_moves_damage() {
        let mut src = SurfaceState::default();
        src.surface_damage.add(Rect::new(0, 0, 10, 10));
        src.mask.insert(PendingMask::SURFACE_DAMAGE);

        let mut dst = SurfaceState::default();
        dst.surface_damage.add(Rect::new(20, 0, 10, 10));

        src.merge_into(&mut dst);

        assert!(src.surface_damage.is_empty());
        assert!(src.mask.is_empty());
        assert_eq!(dst.surface_damage.extents(), Rect::new(0, 0, 30, 10));
        assert!(dst.mask.contains(PendingMask::SURFACE_DAMAGE));
    }

    #[test]
    fn merge_only_live_aspects() {
        let mut src = SurfaceState::default();
        src.buffer_scale = 3;
        src.transform = wl_output::Transform::_90;
        src.mask.insert(PendingMask::TRANSFORM);

        let mut dst = SurfaceState::default();
        src.merge_into(&mut dst);

        // The scale bit wasn't set, so the scale didn't travel.
        assert_eq!(dst.buffer_scale, 1);
        assert_eq!(dst.transform, wl_output::Transform::_90);
    }

    #[test]
    fn merge_detaches_buffer() {
        let mut buffers = slotmap::SlotMap::<BufferKey, ()>::with_key();
        let key = buffers.insert(());

        let mut dst = SurfaceState::default();
        dst.buffer = Some(key);

        let mut src = SurfaceState::default();
        src.buffer = None;
        src.mask.insert(PendingMask::BUFFER);

        src.merge_into(&mut dst);
        assert_eq!(dst.buffer, None);
    }

    #[test]
    fn effective_scale_formula() {
        assert_eq!(effective_scale(1, 1), 1.0);
        assert_eq!(effective_scale(2, 2), 2.0);
        assert_eq!(effective_scale(1, 2), 2.0);
        assert_eq!(effective_scale(1, 3), 3.0);
        assert_eq!(effective_scale(2, 1), 1.0);
        assert_eq!(effective_scale(3, 1), 1.0);
    }

    #[test]
    fn viewport_rejects_oversized_source() {
        // A 50x50 buffer at scale 1 with a 60x60 source and no destination.
        let src = Some(SrcRect {
            x: 0.0,
            y: 0.0,
            width: 60.0,
            height: 60.0,
        });

        assert_eq!(
            validate_viewport(src, None, Some((50, 50)), 1, wl_output::Transform::Normal),
            Err(ViewportError::BadSize)
        );

        // With a destination set, the same source is out-of-buffer instead.
        assert_eq!(
            validate_viewport(
                src,
                Some((32, 32)),
                Some((50, 50)),
                1,
                wl_output::Transform::Normal
            ),
            Err(ViewportError::OutOfBuffer)
        );
    }

    #[test]
    fn viewport_fractional_source_needs_destination() {
        let src = Some(SrcRect {
            x: 0.0,
            y: 0.0,
            width: 10.5,
            height: 10.0,
        });

        assert_eq!(
            validate_viewport(src, None, Some((50, 50)), 1, wl_output::Transform::Normal),
            Err(ViewportError::BadSize)
        );
        assert_eq!(
            validate_viewport(
                src,
                Some((21, 20)),
                Some((50, 50)),
                1,
                wl_output::Transform::Normal
            ),
            Ok(())
        );
    }

    #[test]
    fn viewport_respects_transform_and_scale() {
        // A 100x50 buffer rotated 90 degrees presents as 50x100.
        let src = Some(SrcRect {
            x: 0.0,
            y: 0.0,
            width: 50.0,
            height: 100.0,
        });

        assert_eq!(
            validate_viewport(src, None, Some((100, 50)), 1, wl_output::Transform::_90),
            Ok(())
        );

        // At scale 2 only half the coordinate space is addressable.
        assert_eq!(
            validate_viewport(src, None, Some((100, 50)), 2, wl_output::Transform::_90),
            Err(ViewportError::BadSize)
        );
    }

    #[test]
    fn mask_ops() {
        let mut mask = PendingMask::default();
        mask.insert(PendingMask::BUFFER | PendingMask::SCALE);

        assert!(mask.contains(PendingMask::BUFFER));
        assert!(!mask.contains(PendingMask::BUFFER | PendingMask::INPUT));

        mask.remove(PendingMask::BUFFER);
        assert!(!mask.contains(PendingMask::BUFFER));
        assert!(mask.contains(PendingMask::SCALE));
    }
}
