// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::{Arc, RwLock};

use drm_fourcc::DrmFourcc;
use tracing::trace;
use wayland_protocols::wp::linux_explicit_synchronization::zv1::server::zwp_linux_buffer_release_v1;
use wayland_server::{protocol::wl_buffer, Resource as _};

use crate::bridge::{
    renderer::{PlaneMetadata, TextureKey},
    shm::MappedPool,
};

slotmap::new_key_type! { pub struct BufferKey; }

pub struct Buffer {
    pub wl_buffer: wl_buffer::WlBuffer,
    pub backing: BufferBacking,
    pub texture: TextureKey,

    /// The client is waiting for us to release this buffer.
    pub needs_release: bool,

    /// Next time we release this buffer, we should drop the record too.
    pub needs_destruction: bool,

    /// An explicit-synchronization release object armed by the commit this
    /// buffer belongs to.
    pub explicit_release: Option<zwp_linux_buffer_release_v1::ZwpLinuxBufferReleaseV1>,
}

impl Buffer {
    pub fn dimensions(&self) -> (u32, u32) {
        let format = match &self.backing {
            BufferBacking::Shm { format, .. } => format,
            BufferBacking::Dmabuf { format, .. } => format,
        };

        (format.width, format.height)
    }

    /// The pixels this buffer contributes to its client's badness score.
    pub fn pixels(&self) -> u64 {
        let (w, h) = self.dimensions();
        w as u64 * h as u64
    }

    /// Releases the buffer back to the client. Idempotent; a buffer is
    /// released at most once per attach cycle.
    pub fn release(&mut self) {
        if !self.needs_release {
            return;
        }

        trace!(
            wl_buffer = self.wl_buffer.id().protocol_id(),
            "releasing buffer"
        );

        if let Some(release) = self.explicit_release.take() {
            release.immediate_release();
        }

        self.wl_buffer.release();
        self.needs_release = false;
    }
}

pub enum BufferBacking {
    Shm {
        format: PlaneMetadata,
        pool: Arc<RwLock<MappedPool>>,
    },
    Dmabuf {
        format: PlaneMetadata,
        modifier: u64,
    },
}

/// Checks client-supplied buffer geometry and derives the plane layout.
/// `bpp` is the byte width of one pixel in `format`.
pub fn plane_metadata(
    format: DrmFourcc,
    bpp: u32,
    offset: i32,
    width: i32,
    height: i32,
    stride: i32,
) -> Result<PlaneMetadata, String> {
    if width <= 0 || height <= 0 {
        return Err(format!("Invalid dimensions {width}x{height}."));
    }

    if offset < 0 || stride <= 0 {
        return Err(format!(
            "Invalid layout (offset {offset}, stride {stride})."
        ));
    }

    if (stride as u64) < width as u64 * bpp as u64 {
        return Err(format!("Stride {stride} too small for width {width}."));
    }

    // The whole plane has to stay addressable with 32-bit offsets.
    let end = offset as u64 + stride as u64 * height as u64;
    if end > i32::MAX as u64 {
        return Err(format!("Buffer ends past the addressable range ({end})."));
    }

    Ok(PlaneMetadata {
        format,
        width: width as u32,
        height: height as u32,
        stride: stride as u32,
        offset: offset as u32,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const ARGB: DrmFourcc = DrmFourcc::Argb8888;

    #[test]
    fn geometry_validation() {
        let plane = plane_metadata(ARGB, 4, 0, 64, 64, 256).unwrap();
        assert_eq!(plane.width, 64);
        assert_eq!(plane.stride, 256);

        // A padded stride is fine.
        assert!(plane_metadata(ARGB, 4, 0, 64, 64, 320).is_ok());

        assert!(plane_metadata(ARGB, 4, -1, 64, 64, 256).is_err());
        assert!(plane_metadata(ARGB, 4, 0, 0, 64, 256).is_err());
        assert!(plane_metadata(ARGB, 4, 0, 64, -5, 256).is_err());
        // Stride too small for the width.
        assert!(plane_metadata(ARGB, 4, 0, 64, 64, 64).is_err());
        // Ends past the 32-bit addressable range.
        assert!(plane_metadata(ARGB, 4, i32::MAX, 64, 64, i32::MAX).is_err());
    }
}
