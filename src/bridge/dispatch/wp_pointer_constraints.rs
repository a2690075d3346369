// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::{Arc, RwLock};

use wayland_protocols::wp::pointer_constraints::zv1::server::{
    zwp_confined_pointer_v1, zwp_locked_pointer_v1, zwp_pointer_constraints_v1,
};
use wayland_server::Resource as _;

use crate::bridge::{
    region::Region,
    surface::SurfaceKey,
    xdg::ReconstrainHook,
    ConstraintKey, PointerConstraint, State,
};

impl wayland_server::GlobalDispatch<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, ()>
    for State
{
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl wayland_server::Dispatch<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &zwp_pointer_constraints_v1::ZwpPointerConstraintsV1,
        request: zwp_pointer_constraints_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_pointer_constraints_v1::Request::LockPointer {
                id,
                surface,
                region,
                lifetime,
                ..
            } => {
                let surface_id = *surface
                    .data::<SurfaceKey>()
                    .expect("surface has no userdata");

                if state.has_constraint(surface_id) {
                    resource.post_error(
                        zwp_pointer_constraints_v1::Error::AlreadyConstrained,
                        "The surface already has a pointer constraint.",
                    );
                    return;
                }

                let oneshot = lifetime.into_result().ok()
                    == Some(zwp_pointer_constraints_v1::Lifetime::Oneshot);

                let region = region.as_ref().map(copy_region);
                let key = state.insert_constraint(surface_id, region, oneshot);
                data_init.init(id, key);
            }
            zwp_pointer_constraints_v1::Request::ConfinePointer {
                id,
                surface,
                region,
                lifetime,
                ..
            } => {
                let surface_id = *surface
                    .data::<SurfaceKey>()
                    .expect("surface has no userdata");

                if state.has_constraint(surface_id) {
                    resource.post_error(
                        zwp_pointer_constraints_v1::Error::AlreadyConstrained,
                        "The surface already has a pointer constraint.",
                    );
                    return;
                }

                let oneshot = lifetime.into_result().ok()
                    == Some(zwp_pointer_constraints_v1::Lifetime::Oneshot);

                let region = region.as_ref().map(copy_region);
                let key = state.insert_constraint(surface_id, region, oneshot);
                data_init.init(id, key);
            }
            zwp_pointer_constraints_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

fn copy_region(region: &wayland_server::protocol::wl_region::WlRegion) -> Region {
    region
        .data::<Arc<RwLock<Region>>>()
        .expect("region has no userdata")
        .read()
        .unwrap()
        .clone()
}

impl wayland_server::Dispatch<zwp_locked_pointer_v1::ZwpLockedPointerV1, ConstraintKey>
    for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_locked_pointer_v1::ZwpLockedPointerV1,
        request: zwp_locked_pointer_v1::Request,
        data: &ConstraintKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_locked_pointer_v1::Request::SetRegion { region } => {
                if let Some(constraint) = state.constraints.get_mut(*data) {
                    constraint.region = region.as_ref().map(copy_region);
                }
                state.update_pointer_constraint(*data);
            }
            zwp_locked_pointer_v1::Request::SetCursorPositionHint { .. } => (),
            zwp_locked_pointer_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &zwp_locked_pointer_v1::ZwpLockedPointerV1,
        data: &ConstraintKey,
    ) {
        state.remove_constraint(*data);
    }
}

impl wayland_server::Dispatch<zwp_confined_pointer_v1::ZwpConfinedPointerV1, ConstraintKey>
    for State
{
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_confined_pointer_v1::ZwpConfinedPointerV1,
        request: zwp_confined_pointer_v1::Request,
        data: &ConstraintKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_confined_pointer_v1::Request::SetRegion { region } => {
                if let Some(constraint) = state.constraints.get_mut(*data) {
                    constraint.region = region.as_ref().map(copy_region);
                }
                state.update_pointer_constraint(*data);
            }
            zwp_confined_pointer_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &zwp_confined_pointer_v1::ZwpConfinedPointerV1,
        data: &ConstraintKey,
    ) {
        state.remove_constraint(*data);
    }
}

impl State {
    fn has_constraint(&self, surface: SurfaceKey) -> bool {
        self.constraints.values().any(|c| c.surface == surface)
    }

    fn insert_constraint(
        &mut self,
        surface: SurfaceKey,
        region: Option<Region>,
        oneshot: bool,
    ) -> ConstraintKey {
        let key = self.constraints.insert(PointerConstraint {
            surface,
            region,
            oneshot,
            moved_hook: None,
            configure_hook: None,
        });

        // Track window movement, so the barrier region follows along.
        if let Some(role) = self.xdg_role_mut(surface) {
            let moved = role
                .reconstrain_moved
                .push_back(ReconstrainHook::UpdateConstraint { constraint: key });
            let configured = role
                .reconstrain_configure
                .push_back(ReconstrainHook::UpdateConstraint { constraint: key });

            let constraint = &mut self.constraints[key];
            constraint.moved_hook = Some(moved);
            constraint.configure_hook = Some(configured);
        }

        key
    }

    fn remove_constraint(&mut self, key: ConstraintKey) {
        let Some(constraint) = self.constraints.remove(key) else {
            return;
        };

        if let Some(role) = self.xdg_role_mut(constraint.surface) {
            if let Some(hook) = constraint.moved_hook {
                role.reconstrain_moved.remove(hook);
            }
            if let Some(hook) = constraint.configure_hook {
                role.reconstrain_configure.remove(hook);
            }
        }
    }
}
