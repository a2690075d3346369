// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use wayland_protocols::wp::linux_explicit_synchronization::zv1::server::{
    zwp_linux_buffer_release_v1, zwp_linux_explicit_synchronization_v1,
    zwp_linux_surface_synchronization_v1,
};
use wayland_server::Resource as _;

use crate::bridge::{surface::SurfaceKey, State};

impl
    wayland_server::GlobalDispatch<
        zwp_linux_explicit_synchronization_v1::ZwpLinuxExplicitSynchronizationV1,
        (),
    > for State
{
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<
            zwp_linux_explicit_synchronization_v1::ZwpLinuxExplicitSynchronizationV1,
        >,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl
    wayland_server::Dispatch<
        zwp_linux_explicit_synchronization_v1::ZwpLinuxExplicitSynchronizationV1,
        (),
    > for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &zwp_linux_explicit_synchronization_v1::ZwpLinuxExplicitSynchronizationV1,
        request: zwp_linux_explicit_synchronization_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_linux_explicit_synchronization_v1::Request::GetSynchronization {
                id,
                surface,
            } => {
                let surface_id = *surface
                    .data::<SurfaceKey>()
                    .expect("surface has no userdata");

                let sync = data_init.init(id, surface_id);

                let Some(surface) = state.surfaces.get_mut(surface_id) else {
                    return;
                };

                if surface.sync_resource.is_some() {
                    resource.post_error(
                        zwp_linux_explicit_synchronization_v1::Error::SynchronizationExists,
                        "The surface already has a synchronization object.",
                    );
                    return;
                }

                surface.sync_resource = Some(sync);
            }
            zwp_linux_explicit_synchronization_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl
    wayland_server::Dispatch<
        zwp_linux_surface_synchronization_v1::ZwpLinuxSurfaceSynchronizationV1,
        SurfaceKey,
    > for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &zwp_linux_surface_synchronization_v1::ZwpLinuxSurfaceSynchronizationV1,
        request: zwp_linux_surface_synchronization_v1::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_linux_surface_synchronization_v1::Request::SetAcquireFence { fd } => {
                let Some(surface) = state.surfaces.get_mut(*data) else {
                    resource.post_error(
                        zwp_linux_surface_synchronization_v1::Error::NoSurface,
                        "The surface is gone.",
                    );
                    return;
                };

                if surface.acquire_fence.is_some() {
                    resource.post_error(
                        zwp_linux_surface_synchronization_v1::Error::DuplicateFence,
                        "A fence was already set for this commit.",
                    );
                    return;
                }

                surface.acquire_fence = Some(fd);
            }
            zwp_linux_surface_synchronization_v1::Request::GetRelease { release } => {
                let Some(surface) = state.surfaces.get_mut(*data) else {
                    resource.post_error(
                        zwp_linux_surface_synchronization_v1::Error::NoSurface,
                        "The surface is gone.",
                    );
                    return;
                };

                if surface.pending_release.is_some() {
                    resource.post_error(
                        zwp_linux_surface_synchronization_v1::Error::DuplicateRelease,
                        "A release was already requested for this commit.",
                    );
                    return;
                }

                let release = data_init.init(release, ());
                surface.pending_release = Some(release);
            }
            zwp_linux_surface_synchronization_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &zwp_linux_surface_synchronization_v1::ZwpLinuxSurfaceSynchronizationV1,
        data: &SurfaceKey,
    ) {
        if let Some(surface) = state.surfaces.get_mut(*data) {
            if surface.sync_resource.as_ref() == Some(resource) {
                surface.sync_resource = None;
            }
        }
    }
}

impl wayland_server::Dispatch<zwp_linux_buffer_release_v1::ZwpLinuxBufferReleaseV1, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_linux_buffer_release_v1::ZwpLinuxBufferReleaseV1,
        _request: zwp_linux_buffer_release_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}
