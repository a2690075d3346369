// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::{Arc, RwLock};

use tracing::debug;
use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_feedback_v1, zwp_linux_dmabuf_v1,
};
use wayland_server::{Resource as _, WEnum};

use crate::bridge::{
    buffers::{Buffer, BufferBacking},
    dmabuf::{BufferParams, PendingImport},
    renderer::PlaneMetadata,
    State,
};

use super::make_u64;

impl wayland_server::GlobalDispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for State {
    fn bind(
        state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let resource = data_init.init(resource, ());

        // From v4 on the format list arrives via explicit feedback.
        if resource.version() < 4 {
            state.dmabuf_feedback.announce(&resource);
        }
    }
}

impl wayland_server::Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        request: zwp_linux_dmabuf_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_linux_dmabuf_v1::Request::CreateParams { params_id } => {
                data_init.init(params_id, Arc::new(RwLock::new(BufferParams::default())));
            }
            zwp_linux_dmabuf_v1::Request::GetDefaultFeedback { id } => {
                let feedback = data_init.init(id, ());
                state.dmabuf_feedback.emit(&feedback);
            }
            zwp_linux_dmabuf_v1::Request::GetSurfaceFeedback { id, .. } => {
                let feedback = data_init.init(id, ());
                state.dmabuf_feedback.emit(&feedback);
            }
            zwp_linux_dmabuf_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }
}

impl
    wayland_server::Dispatch<
        zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        Arc<RwLock<BufferParams>>,
    > for State
{
    fn request(
        state: &mut Self,
        client: &wayland_server::Client,
        resource: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        request: zwp_linux_buffer_params_v1::Request,
        data: &Arc<RwLock<BufferParams>>,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            zwp_linux_buffer_params_v1::Request::Add {
                fd,
                plane_idx,
                offset,
                stride,
                modifier_hi,
                modifier_lo,
            } => {
                let modifier = make_u64(modifier_hi, modifier_lo);

                let mut params = data.write().unwrap();
                if let Err((code, msg)) = params.add(plane_idx, fd, offset, stride, modifier) {
                    resource.post_error(code, msg);
                }
            }
            zwp_linux_buffer_params_v1::Request::Create {
                width,
                height,
                format,
                flags,
            } => {
                let flags = match flags {
                    WEnum::Value(f) => f.bits(),
                    WEnum::Unknown(raw) => raw,
                };

                let validated = data.write().unwrap().validate_create(width, height, flags);
                let (planes, modifier, flags) = match validated {
                    Ok(v) => v,
                    Err((code, msg)) => {
                        resource.post_error(code, msg);
                        return;
                    }
                };

                let fourcc = match state.check_dmabuf_format(resource, format, modifier) {
                    Ok(fourcc) => fourcc,
                    Err(posted) => {
                        if !posted {
                            resource.failed();
                        }
                        return;
                    }
                };

                // The import itself completes from the idle pass.
                state.pending_imports.push(PendingImport {
                    params: resource.clone(),
                    client: client.clone(),
                    planes,
                    metadata: PlaneMetadata {
                        format: fourcc,
                        width: width as u32,
                        height: height as u32,
                        stride: 0,
                        offset: 0,
                    },
                    modifier,
                    flags,
                });
            }
            zwp_linux_buffer_params_v1::Request::CreateImmed {
                buffer_id,
                width,
                height,
                format,
                flags,
            } => {
                let flags = match flags {
                    WEnum::Value(f) => f.bits(),
                    WEnum::Unknown(raw) => raw,
                };

                let validated = data.write().unwrap().validate_create(width, height, flags);
                let (planes, modifier, flags) = match validated {
                    Ok(v) => v,
                    Err((code, msg)) => {
                        resource.post_error(code, msg);
                        return;
                    }
                };

                let fourcc = match state.check_dmabuf_format(resource, format, modifier) {
                    Ok(fourcc) => fourcc,
                    Err(posted) => {
                        if !posted {
                            resource.failed();
                        }
                        return;
                    }
                };

                let metadata = PlaneMetadata {
                    format: fourcc,
                    width: width as u32,
                    height: height as u32,
                    stride: 0,
                    offset: 0,
                };

                let res = state.buffers.try_insert_with_key(|k| {
                    let wl_buffer = data_init.init(buffer_id, k);
                    state
                        .renderer
                        .import_dmabuf(planes, metadata, modifier, flags)
                        .map(|texture| Buffer {
                            wl_buffer,
                            backing: BufferBacking::Dmabuf {
                                format: metadata,
                                modifier,
                            },
                            texture,
                            needs_release: false,
                            needs_destruction: false,
                            explicit_release: None,
                        })
                });

                if let Err(err) = res {
                    debug!(?err, "immediate dmabuf import failed");
                    resource.post_error(
                        zwp_linux_buffer_params_v1::Error::InvalidWlBuffer,
                        "Import failed.",
                    );
                }
            }
            zwp_linux_buffer_params_v1::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        _state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        data: &Arc<RwLock<BufferParams>>,
    ) {
        // A create may still be in flight; tombstone it.
        data.write().unwrap().dead = true;
    }
}

impl wayland_server::Dispatch<zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1, ()>
    for State
{
    fn request(
        _state: &mut Self,
        _client: &wayland_server::Client,
        _resource: &zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1,
        _request: zwp_linux_dmabuf_feedback_v1::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        _data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
    }
}
