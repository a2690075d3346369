// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use wayland_server::protocol::wl_buffer;

use crate::bridge::{buffers::BufferKey, State};

impl wayland_server::Dispatch<wl_buffer::WlBuffer, BufferKey> for State {
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        _data: &BufferKey,
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_buffer::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_buffer::WlBuffer,
        data: &BufferKey,
    ) {
        // The record sticks around until any pending release resolves; this
        // marks it for destruction then.
        if let Some(buffer) = state.buffers.get_mut(*data) {
            buffer.needs_destruction = true;
        }

        state.destroy_buffer_if_dead(*data);
    }
}
