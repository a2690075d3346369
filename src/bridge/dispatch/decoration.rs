// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use wayland_protocols::xdg::decoration::zv1::server::{
    zxdg_decoration_manager_v1,
    zxdg_toplevel_decoration_v1::{self, Mode},
};
use wayland_server::{Resource as _, WEnum};

use crate::bridge::{surface::{SurfaceHook, SurfaceKey}, State};

impl wayland_server::GlobalDispatch<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1, ()>
    for State
{
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zxdg_decoration_manager_v1::ZxdgDecorationManagerV1,
        request: zxdg_decoration_manager_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zxdg_decoration_manager_v1::Request::GetToplevelDecoration { id, toplevel } => {
                let surface_id = *toplevel
                    .data::<SurfaceKey>()
                    .expect("toplevel has no userdata");

                let decoration = data_init.init(id, surface_id);

                let Some(tl) = state.xdg_role_mut(surface_id).and_then(|r| r.toplevel_mut())
                else {
                    decoration.post_error(
                        zxdg_toplevel_decoration_v1::Error::Orphaned,
                        "The toplevel is gone.",
                    );
                    return;
                };

                if tl.decoration.is_some() {
                    decoration.post_error(
                        zxdg_toplevel_decoration_v1::Error::AlreadyConstructed,
                        "The toplevel already has a decoration object.",
                    );
                    return;
                }

                tl.decoration = Some(decoration);
            }
            zxdg_decoration_manager_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1, SurfaceKey>
    for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1,
        request: zxdg_toplevel_decoration_v1::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zxdg_toplevel_decoration_v1::Request::SetMode { mode } => {
                let mode = match mode {
                    WEnum::Value(mode) => mode,
                    WEnum::Unknown(_) => Mode::ServerSide,
                };

                state.decoration_mode_requested(*data, mode, resource);
            }
            zxdg_toplevel_decoration_v1::Request::UnsetMode => {
                // Without a preference, the window manager decorates.
                state.decoration_mode_requested(*data, Mode::ServerSide, resource);
            }
            zxdg_toplevel_decoration_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1,
        data: &SurfaceKey,
    ) {
        if let Some(tl) = state.xdg_role_mut(*data).and_then(|r| r.toplevel_mut()) {
            if tl.decoration.as_ref() == Some(resource) {
                tl.decoration = None;
                tl.pending_decoration = None;
            }
        }
    }
}

impl State {
    /// Negotiates a decoration mode: the decision is sent immediately, but
    /// the motif hints only change once the handshake commit lands.
    fn decoration_mode_requested(
        &mut self,
        id: SurfaceKey,
        mode: Mode,
        resource: &zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1,
    ) {
        let Some(tl) = self.xdg_role_mut(id).and_then(|r| r.toplevel_mut()) else {
            resource.post_error(
                zxdg_toplevel_decoration_v1::Error::Orphaned,
                "The toplevel is gone.",
            );
            return;
        };

        tl.pending_decoration = Some(mode);
        resource.configure(mode);

        self.surfaces[id]
            .commit_callbacks
            .push_back(SurfaceHook::ApplyDecoration);

        self.toplevel_send_configure(id);
    }
}
