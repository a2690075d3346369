// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    os::fd::AsRawFd as _,
    sync::{Arc, RwLock},
};

use tracing::error;
use wayland_server::{
    protocol::{wl_shm, wl_shm_pool},
    Resource as _,
};

use crate::bridge::{
    buffers::{plane_metadata, Buffer, BufferBacking},
    shm::{MappedPool, ShmPoolKey},
    State,
};

impl wayland_server::GlobalDispatch<wl_shm::WlShm, ()> for State {
    fn bind(
        _state: &mut Self,
        _handle: &wayland_server::DisplayHandle,
        _client: &wayland_server::Client,
        resource: wayland_server::New<wl_shm::WlShm>,
        _global_data: &(),
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        let wl_shm = data_init.init(resource, ());
        wl_shm.format(wl_shm::Format::Xrgb8888);
        wl_shm.format(wl_shm::Format::Argb8888);
    }
}

impl wayland_server::Dispatch<wl_shm::WlShm, ()> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        wl_shm: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_shm::Request::CreatePool { id, fd, size } => {
                if size <= 0 {
                    wl_shm.post_error(
                        wl_shm::Error::InvalidStride,
                        "Negative or zero size provided.",
                    );
                }

                let fd_debug = fd.as_raw_fd();
                let pool = match MappedPool::new(fd, size as usize) {
                    Ok(p) => p,
                    Err(err) => {
                        error!(?err, fd = fd_debug, size, "failed to map client shm");
                        wl_shm.post_error(wl_shm::Error::InvalidFd, "mmap failed.");
                        return;
                    }
                };

                // Buffers cut from the pool share the mapping until the last
                // one goes away.
                let key = state.shm_pools.insert(Arc::new(RwLock::new(pool)));
                data_init.init(id, key);
            }
            _ => unreachable!(),
        }
    }
}

impl wayland_server::Dispatch<wl_shm_pool::WlShmPool, ShmPoolKey> for State {
    fn request(
        state: &mut Self,
        _client: &wayland_server::Client,
        resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        data: &ShmPoolKey,
        _dhandle: &wayland_server::DisplayHandle,
        data_init: &mut wayland_server::DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let pool = state
                    .shm_pools
                    .get(*data)
                    .expect("shm_pool has no entry")
                    .clone();

                let format = match format.into_result() {
                    Ok(wl_shm::Format::Argb8888) => drm_fourcc::DrmFourcc::Argb8888,
                    Ok(wl_shm::Format::Xrgb8888) => drm_fourcc::DrmFourcc::Xrgb8888,
                    _ => {
                        resource.post_error(wl_shm::Error::InvalidFormat, "Invalid format.");
                        return;
                    }
                };

                let metadata = match plane_metadata(format, 4, offset, width, height, stride) {
                    Ok(metadata) => metadata,
                    Err(msg) => {
                        resource.post_error(wl_shm::Error::InvalidStride, msg);
                        return;
                    }
                };

                let len = (metadata.stride * metadata.height) as usize;
                if pool
                    .read()
                    .unwrap()
                    .bytes(metadata.offset as usize, len)
                    .is_none()
                {
                    resource.post_error(
                        wl_shm::Error::InvalidStride,
                        "Buffer extends past the end of the pool.",
                    );
                    return;
                }

                let res = state.buffers.try_insert_with_key(|k| {
                    let wl_buffer = data_init.init(id, k);
                    state
                        .renderer
                        .import_shm(pool.clone(), metadata)
                        .map(|texture| Buffer {
                            wl_buffer,
                            backing: BufferBacking::Shm {
                                format: metadata,
                                pool,
                            },
                            texture,
                            needs_release: false,
                            needs_destruction: false,
                            explicit_release: None,
                        })
                });

                if let Err(err) = res {
                    error!(?err, "shm import failed");
                    resource.post_error(wl_shm::Error::InvalidFd, "Import failed.");
                }
            }
            wl_shm_pool::Request::Resize { size } => {
                let pool = state
                    .shm_pools
                    .get(*data)
                    .expect("shm_pool has no entry")
                    .clone();

                // The protocol forbids shrinking a pool.
                if size <= 0 || (size as usize) <= pool.read().unwrap().len() {
                    resource.post_error(wl_shm::Error::InvalidStride, "Pools can only grow.");
                    return;
                }

                let grow_result = pool.write().unwrap().grow(size as usize);
                if let Err(err) = grow_result {
                    error!(?err, "shm pool remap failed");
                    resource.post_error(wl_shm::Error::InvalidFd, "mmap failed.");
                }
            }
            wl_shm_pool::Request::Destroy => (),
            _ => unreachable!(),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: wayland_server::backend::ClientId,
        _resource: &wl_shm_pool::WlShmPool,
        data: &ShmPoolKey,
    ) {
        state.shm_pools.remove(*data);
    }
}
