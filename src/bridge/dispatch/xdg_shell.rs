// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use tracing::warn;
use wayland_protocols::xdg::shell::server::{
    xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base,
};
use wayland_server::Resource as _;

use crate::bridge::{
    region::Rect, surface::SurfaceKey, toplevel::ToplevelRole, xdg::XdgPart, State,
};

impl wayland_server::GlobalDispatch<xdg_wm_base::XdgWmBase, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<xdg_wm_base::XdgWmBase>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<xdg_wm_base::XdgWmBase, ()> for State {
    fn request(
        state: &mut Self,
        client: &wayland_server::Client,
        resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::CreatePositioner { id } => {
                // Positioners only matter for popups.
                data_init.init(id, ());
            }
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let surface_id = *surface
                    .data::<SurfaceKey>()
                    .expect("surface has no userdata");

                if let Err((code, msg)) = state.can_assign_xdg(surface_id) {
                    resource.post_error(code, msg);
                    return;
                }

                let xdg_surface = data_init.init(id, surface_id);

                if let Err(err) = state.create_xdg_role(surface_id, resource.clone(), xdg_surface)
                {
                    // The server couldn't back the window, most likely for
                    // lack of memory.
                    warn!(?err, "failed to create xdg role");
                    state.post_no_memory(client);
                }
            }
            xdg_wm_base::Request::Pong { serial } => {
                state.role_client_pong(serial);
            }
            xdg_wm_base::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<xdg_surface::XdgSurface, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let xdg_toplevel = data_init.init(id, *data);

                let Some(role) = state.xdg_role_mut(*data) else {
                    resource.post_error(
                        xdg_surface::Error::NotConstructed,
                        "Surface has no backing window.",
                    );
                    return;
                };

                if !matches!(role.part, XdgPart::Bare) {
                    resource.post_error(
                        xdg_surface::Error::AlreadyConstructed,
                        "A role object was already created from this xdg_surface.",
                    );
                    return;
                }

                role.part = XdgPart::Toplevel(ToplevelRole::new(xdg_toplevel));
            }
            xdg_surface::Request::GetPopup { id, .. } => {
                // Popups are dismissed immediately; nothing maps them.
                let popup = data_init.init(id, ());
                popup.popup_done();
            }
            xdg_surface::Request::AckConfigure { serial } => {
                if let Err((code, msg)) = state.xdg_ack_configure(*data, serial) {
                    resource.post_error(code, msg);
                }
            }
            xdg_surface::Request::SetWindowGeometry {
                x,
                y,
                width,
                height,
            } => {
                if width <= 0 || height <= 0 {
                    resource.post_error(
                        xdg_surface::Error::InvalidSize,
                        "Window geometry must have positive size.",
                    );
                    return;
                }

                if let Some(role) = state.xdg_role_mut(*data) {
                    role.pending_geometry = Some(Rect::new(x, y, width, height));
                }
            }
            xdg_surface::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &xdg_surface::XdgSurface,
        data: &SurfaceKey,
    ) {
        let Some(role) = state.xdg_role(*data) else {
            return;
        };

        if role.xdg_surface != *resource {
            return;
        }

        // Destroying the xdg_surface while a toplevel still exists is a
        // protocol violation.
        if matches!(role.part, XdgPart::Toplevel(_)) {
            resource.post_error(
                xdg_surface::Error::DefunctRoleObject,
                "The role object must be destroyed first.",
            );
        }

        state.detach_role(*data);
    }
}

impl wayland_server::Dispatch<xdg_positioner::XdgPositioner, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &xdg_positioner::XdgPositioner,
        _request: xdg_positioner::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}

impl wayland_server::Dispatch<xdg_popup::XdgPopup, ()> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_popup::XdgPopup,
        request: xdg_popup::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            xdg_popup::Request::Grab { .. } => {
                resource.popup_done();
            }
            xdg_popup::Request::Reposition { .. } => (),
            xdg_popup::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<xdg_toplevel::XdgToplevel, SurfaceKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        data: &SurfaceKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            xdg_toplevel::Request::SetTitle { title } => {
                state.toplevel_set_title(*data, title);
            }
            xdg_toplevel::Request::SetAppId { app_id } => {
                state.toplevel_set_app_id(*data, app_id);
            }
            xdg_toplevel::Request::SetParent { parent } => {
                let parent_id = parent.as_ref().map(|p| {
                    *p.data::<SurfaceKey>()
                        .expect("toplevel has no userdata")
                });

                if let Err((code, msg)) = state.toplevel_set_parent(*data, parent_id) {
                    resource.post_error(code, msg);
                }
            }
            xdg_toplevel::Request::Move { .. } => {
                state.toplevel_move(*data);
            }
            xdg_toplevel::Request::Resize { edges, .. } => {
                state.toplevel_resize(*data, edges);
            }
            xdg_toplevel::Request::SetMaxSize { width, height } => {
                if let Err((code, msg)) = state.toplevel_set_max_size(*data, width, height) {
                    resource.post_error(code, msg);
                }
            }
            xdg_toplevel::Request::SetMinSize { width, height } => {
                if let Err((code, msg)) = state.toplevel_set_min_size(*data, width, height) {
                    resource.post_error(code, msg);
                }
            }
            xdg_toplevel::Request::SetMaximized => {
                state.toplevel_set_maximized(*data, true);
            }
            xdg_toplevel::Request::UnsetMaximized => {
                state.toplevel_set_maximized(*data, false);
            }
            xdg_toplevel::Request::SetFullscreen { .. } => {
                state.toplevel_set_fullscreen(*data, true);
            }
            xdg_toplevel::Request::UnsetFullscreen => {
                state.toplevel_set_fullscreen(*data, false);
            }
            xdg_toplevel::Request::SetMinimized => {
                state.toplevel_set_minimized(*data);
            }
            xdg_toplevel::Request::ShowWindowMenu { .. } => (),
            xdg_toplevel::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        resource: &xdg_toplevel::XdgToplevel,
        data: &SurfaceKey,
    ) {
        state.toplevel_destroyed(*data, resource);
    }
}
