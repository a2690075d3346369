// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::{Arc, RwLock};

use wayland_server::{
    protocol::{wl_callback, wl_compositor, wl_region, wl_surface},
    Resource as _,
};

use crate::bridge::{
    region::{Rect, Region, COORD_MAX},
    surface::{CommitError, PendingMask, Surface, SurfaceKey},
    State,
};

impl wayland_server::GlobalDispatch<wl_compositor::WlCompositor, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_compositor::WlCompositor>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wl_compositor::WlCompositor, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                let view = state.renderer.create_view();
                let under_view = state.renderer.create_view();

                state
                    .surfaces
                    .insert_with_key(|k| Surface::new(data_init.init(id, k), view, under_view));
            }
            wl_compositor::Request::CreateRegion { id } => {
                data_init.init(id, Arc::new(RwLock::new(Region::new())));
            }
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_surface::WlSurface, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_surface::Request::Attach { buffer, x, y } => {
                if resource.version() >= 5 && (x != 0 || y != 0) {
                    resource.post_error(
                        wl_surface::Error::InvalidOffset,
                        "Non-zero attach offsets require wl_surface.offset.",
                    );
                    return;
                }

                let surface = state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry");

                surface.pending.buffer = buffer.map(|buf| {
                    *buf.data::<crate::bridge::buffers::BufferKey>()
                        .expect("buffer has no userdata")
                });
                surface.pending.offset = (x, y);
                surface
                    .pending
                    .mask
                    .insert(PendingMask::BUFFER | PendingMask::OFFSET);
            }
            wl_surface::Request::Damage {
                x,
                y,
                width,
                height,
            } => {
                let surface = state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry");

                surface
                    .pending
                    .surface_damage
                    .add(Rect::new(x, y, width, height));
                surface.pending.mask.insert(PendingMask::SURFACE_DAMAGE);
            }
            wl_surface::Request::DamageBuffer {
                x,
                y,
                width,
                height,
            } => {
                let surface = state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry");

                surface
                    .pending
                    .buffer_damage
                    .add(Rect::new(x, y, width, height));
                surface.pending.mask.insert(PendingMask::BUFFER_DAMAGE);
            }
            wl_surface::Request::Frame { callback } => {
                let callback = data_init.init(callback, *data);
                let surface = state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry");

                surface.pending.frame_callbacks.push_back(callback);
                surface.pending.mask.insert(PendingMask::FRAME_CALLBACKS);
            }
            wl_surface::Request::SetOpaqueRegion { region } => {
                let contents = copy_region(region.as_ref());
                let surface = state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry");

                surface.pending.opaque = contents.unwrap_or_default();
                surface.pending.mask.insert(PendingMask::OPAQUE);
            }
            wl_surface::Request::SetInputRegion { region } => {
                let contents = copy_region(region.as_ref());
                let surface = state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry");

                // A null region means infinite input.
                surface.pending.input = contents;
                surface.pending.mask.insert(PendingMask::INPUT);
            }
            wl_surface::Request::SetBufferTransform { transform } => {
                let Ok(transform) = transform.into_result() else {
                    resource.post_error(
                        wl_surface::Error::InvalidTransform,
                        "Invalid buffer transform.",
                    );
                    return;
                };

                let surface = state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry");

                surface.pending.transform = transform;
                surface.pending.mask.insert(PendingMask::TRANSFORM);
            }
            wl_surface::Request::SetBufferScale { scale } => {
                if scale < 1 {
                    resource.post_error(wl_surface::Error::InvalidScale, "Scale must be >= 1.");
                    return;
                }

                let surface = state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry");

                surface.pending.buffer_scale = scale;
                surface.pending.mask.insert(PendingMask::SCALE);
            }
            wl_surface::Request::Offset { x, y } => {
                let surface = state
                    .surfaces
                    .get_mut(*data)
                    .expect("surface has no entry");

                surface.pending.offset = (x, y);
                surface.pending.mask.insert(PendingMask::OFFSET);
            }
            wl_surface::Request::Commit => {
                if let Err(CommitError(code, msg)) = state.surface_commit(*data) {
                    resource.post_error(code, msg);
                }
            }
            wl_surface::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_surface::WlSurface,
        data: &SurfaceKey,
    ) {
        state.surface_destroyed(*data);
    }
}

fn copy_region(region: Option<&wl_region::WlRegion>) -> Option<Region> {
    let region = region?;
    let contents = region
        .data::<Arc<RwLock<Region>>>()
        .expect("region has no userdata");

    let mut copied = contents.read().unwrap().clone();
    copied.intersect_rect(Rect::new(0, 0, COORD_MAX, COORD_MAX));
    Some(copied)
}

impl wayland_server::Dispatch<wl_region::WlRegion, Arc<RwLock<Region>>> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_region::WlRegion,
        request: wl_region::Request,
        data: &Arc<RwLock<Region>>,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_region::Request::Add {
                x,
                y,
                width,
                height,
            } => {
                data.write().unwrap().add(Rect::new(x, y, width, height));
            }
            wl_region::Request::Subtract {
                x,
                y,
                width,
                height,
            } => {
                data.write()
                    .unwrap()
                    .subtract(Rect::new(x, y, width, height));
            }
            wl_region::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_callback::WlCallback, SurfaceKey> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_callback::WlCallback,
        _request: wl_callback::Request,
        _data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}
