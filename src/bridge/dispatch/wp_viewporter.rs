// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use wayland_protocols::wp::viewporter::server::{wp_viewport, wp_viewporter};
use wayland_server::Resource as _;

use crate::bridge::{
    renderer::SrcRect,
    surface::{PendingMask, SurfaceKey},
    State,
};

impl wayland_server::GlobalDispatch<wp_viewporter::WpViewporter, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wp_viewporter::WpViewporter>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<wp_viewporter::WpViewporter, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wp_viewporter::WpViewporter,
        request: wp_viewporter::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wp_viewporter::Request::GetViewport { id, surface } => {
                let surface_id = *surface
                    .data::<SurfaceKey>()
                    .expect("surface has no userdata");

                let viewport = data_init.init(id, surface_id);

                let Some(surface) = state.surfaces.get_mut(surface_id) else {
                    return;
                };

                if surface.viewport.is_some() {
                    resource.post_error(
                        wp_viewporter::Error::ViewportExists,
                        "The surface already has a viewport.",
                    );
                    return;
                }

                surface.viewport = Some(viewport);
            }
            wp_viewporter::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wp_viewport::WpViewport, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wp_viewport::WpViewport,
        request: wp_viewport::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wp_viewport::Request::SetSource {
                x,
                y,
                width,
                height,
            } => {
                let Some(surface) = state.surfaces.get_mut(*data) else {
                    resource.post_error(
                        wp_viewport::Error::NoSurface,
                        "The surface is gone.",
                    );
                    return;
                };

                let unset = x == -1.0 && y == -1.0 && width == -1.0 && height == -1.0;
                if unset {
                    surface.pending.src = None;
                } else if x < 0.0 || y < 0.0 || width <= 0.0 || height <= 0.0 {
                    resource.post_error(
                        wp_viewport::Error::BadValue,
                        "Invalid source rectangle.",
                    );
                    return;
                } else {
                    surface.pending.src = Some(SrcRect {
                        x,
                        y,
                        width,
                        height,
                    });
                }

                surface.pending.mask.insert(PendingMask::VIEWPORT_SRC);
            }
            wp_viewport::Request::SetDestination { width, height } => {
                let Some(surface) = state.surfaces.get_mut(*data) else {
                    resource.post_error(
                        wp_viewport::Error::NoSurface,
                        "The surface is gone.",
                    );
                    return;
                };

                let unset = width == -1 && height == -1;
                if unset {
                    surface.pending.dst = None;
                } else if width <= 0 || height <= 0 {
                    resource.post_error(
                        wp_viewport::Error::BadValue,
                        "Invalid destination size.",
                    );
                    return;
                } else {
                    surface.pending.dst = Some((width, height));
                }

                surface.pending.mask.insert(PendingMask::VIEWPORT_DST);
            }
            wp_viewport::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &wp_viewport::WpViewport,
        data: &SurfaceKey,
    ) {
        let Some(surface) = state.surfaces.get_mut(*data) else {
            return;
        };

        if surface.viewport.as_ref() == Some(resource) {
            surface.viewport = None;

            // Destroying the viewport unsets the crop and scale.
            surface.pending.src = None;
            surface.pending.dst = None;
            surface
                .pending
                .mask
                .insert(PendingMask::VIEWPORT_SRC | PendingMask::VIEWPORT_DST);
        }
    }
}
