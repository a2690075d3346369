// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Dmabuf import.
//!
//! Clients stage up to four plane descriptors on a params object, then ask
//! for a buffer. Creation is asynchronous: validation happens inline, but
//! the actual import runs from the idle pass so a failed server-side import
//! can be reported without blocking the request. A params object destroyed
//! mid-creation tombstones the job.

use std::{
    fs::File,
    io::{Seek as _, SeekFrom, Write as _},
    os::fd::{AsFd as _, AsRawFd as _, OwnedFd},
};

use drm_fourcc::DrmFourcc;
use nix::{
    fcntl::{fcntl, FcntlArg, SealFlag},
    sys::memfd::{memfd_create, MemFdCreateFlag},
};
use tracing::{debug, trace};
use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_feedback_v1, zwp_linux_dmabuf_v1,
};
use wayland_server::{protocol::wl_buffer, Resource as _};

use crate::bridge::{
    buffers::{Buffer, BufferBacking},
    renderer::{DmabufFlags, DmabufPlane, FormatModifier, PlaneMetadata},
    State,
};

pub const MAX_PLANES: usize = 4;

/// The implicit modifier, advertised to clients that predate modifiers.
pub const MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

pub struct PlaneEntry {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// The temporary set of planes staged on one params object.
#[derive(Default)]
pub struct BufferParams {
    pub planes: [Option<PlaneEntry>; MAX_PLANES],
    pub modifier: Option<u64>,

    /// Create was already issued; the object is inert.
    pub used: bool,

    /// The resource was destroyed; completion drops its work.
    pub dead: bool,
}

impl BufferParams {
    /// Stages one plane. On any error the descriptor is closed (dropped).
    pub fn add(
        &mut self,
        plane_idx: u32,
        fd: OwnedFd,
        offset: u32,
        stride: u32,
        modifier: u64,
    ) -> Result<(), (zwp_linux_buffer_params_v1::Error, String)> {
        if self.used {
            return Err((
                zwp_linux_buffer_params_v1::Error::AlreadyUsed,
                "Params already consumed.".into(),
            ));
        }

        let Some(slot) = self.planes.get_mut(plane_idx as usize) else {
            return Err((
                zwp_linux_buffer_params_v1::Error::PlaneIdx,
                format!("Plane index {plane_idx} out of range."),
            ));
        };

        if slot.is_some() {
            return Err((
                zwp_linux_buffer_params_v1::Error::PlaneSet,
                format!("Plane {plane_idx} already set."),
            ));
        }

        // All planes of one buffer share a layout.
        match self.modifier {
            Some(m) if m != modifier => {
                return Err((
                    zwp_linux_buffer_params_v1::Error::InvalidFormat,
                    "Modifier differs between planes.".into(),
                ));
            }
            _ => self.modifier = Some(modifier),
        }

        *slot = Some(PlaneEntry { fd, offset, stride });

        Ok(())
    }

    /// Checks the staged set against the requested dimensions, consuming
    /// the planes on success.
    pub fn validate_create(
        &mut self,
        width: i32,
        height: i32,
        flags: u32,
    ) -> Result<(Vec<DmabufPlane>, u64, DmabufFlags), (zwp_linux_buffer_params_v1::Error, String)>
    {
        if self.used {
            return Err((
                zwp_linux_buffer_params_v1::Error::AlreadyUsed,
                "Params already consumed.".into(),
            ));
        }

        if self.planes[0].is_none() {
            return Err((
                zwp_linux_buffer_params_v1::Error::Incomplete,
                "Plane 0 not set.".into(),
            ));
        }

        // No gaps: a set plane implies all lower indices are set.
        let count = self.planes.iter().take_while(|p| p.is_some()).count();
        if self.planes[count..].iter().any(|p| p.is_some()) {
            return Err((
                zwp_linux_buffer_params_v1::Error::Incomplete,
                "Plane set has gaps.".into(),
            ));
        }

        if !(0..=65535).contains(&width) || !(0..=65535).contains(&height) {
            return Err((
                zwp_linux_buffer_params_v1::Error::OutOfBounds,
                format!("Invalid dimensions {width}x{height}."),
            ));
        }

        let known = zwp_linux_buffer_params_v1::Flags::all().bits();
        if flags & !known != 0 {
            return Err((
                zwp_linux_buffer_params_v1::Error::InvalidFormat,
                "Unknown flags.".into(),
            ));
        }

        let flags = DmabufFlags {
            y_invert: flags & zwp_linux_buffer_params_v1::Flags::YInvert.bits() != 0,
            interlaced: flags & zwp_linux_buffer_params_v1::Flags::Interlaced.bits() != 0,
            bottom_first: flags & zwp_linux_buffer_params_v1::Flags::BottomFirst.bits() != 0,
        };

        self.used = true;

        let planes = self
            .planes
            .iter_mut()
            .filter_map(|p| p.take())
            .map(|p| DmabufPlane {
                fd: p.fd,
                offset: p.offset,
                stride: p.stride,
            })
            .collect();

        Ok((planes, self.modifier.unwrap_or(MOD_INVALID), flags))
    }
}

/// The cached v4 feedback: a sealed format table plus the device it names.
pub struct DmabufFeedback {
    formats: Vec<FormatModifier>,
    table: File,
    table_len: usize,
    main_device: u64,
}

impl DmabufFeedback {
    pub fn new(formats: &[FormatModifier], main_device: u64) -> anyhow::Result<Self> {
        // 16 bytes a row: format code, padding, modifier.
        let mut rows = vec![0_u8; 16 * formats.len()];
        for (idx, fm) in formats.iter().enumerate() {
            let off = idx * 16;
            let code = fm.format as u32;
            trace!(idx, code, modifier = fm.modifier, "adding format to table");

            rows[off..off + 4].copy_from_slice(&code.to_ne_bytes());
            rows[off + 8..off + 16].copy_from_slice(&fm.modifier.to_ne_bytes());
        }

        Ok(Self {
            formats: formats.to_vec(),
            table: seal_table(&rows)?,
            table_len: rows.len(),
            main_device,
        })
    }

    pub fn contains(&self, format: u32, modifier: u64) -> bool {
        self.formats
            .iter()
            .any(|fm| fm.format as u32 == format && fm.modifier == modifier)
    }

    /// The v4 feedback sequence: table, main device, one tranche covering
    /// every entry.
    pub fn emit(&self, feedback: &zwp_linux_dmabuf_feedback_v1::ZwpLinuxDmabufFeedbackV1) {
        let dev = self.main_device.to_ne_bytes().to_vec();
        feedback.main_device(dev.clone());
        feedback.format_table(self.table.as_fd(), self.table_len as u32);
        feedback.tranche_target_device(dev);
        feedback.tranche_flags(zwp_linux_dmabuf_feedback_v1::TrancheFlags::empty());

        let indices = (0..(self.formats.len() as u16))
            .flat_map(|i| i.to_ne_bytes())
            .collect::<Vec<_>>();
        feedback.tranche_formats(indices);
        feedback.tranche_done();
        feedback.done();
    }

    /// The pre-feedback announcement on bind: modifier events from v3 on,
    /// bare format codes with the implicit modifier before that.
    pub fn announce(&self, resource: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1) {
        if resource.version() >= 3 {
            for fm in &self.formats {
                resource.modifier(
                    fm.format as u32,
                    (fm.modifier >> 32) as u32,
                    (fm.modifier & 0xFFFF_FFFF) as u32,
                );
            }
        } else {
            let mut seen = Vec::new();
            for fm in &self.formats {
                let code = fm.format as u32;
                if !seen.contains(&code) {
                    seen.push(code);
                    resource.format(code);
                }
            }
        }
    }
}

/// Writes the table rows into a memfd and seals it, so clients can map the
/// descriptor read-only and trust it never changes under them.
fn seal_table(rows: &[u8]) -> anyhow::Result<File> {
    let fd = memfd_create(
        c"waybridge-formats",
        MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
    )?;

    let mut file = File::from(fd);
    file.write_all(rows)?;
    file.seek(SeekFrom::Start(0))?;

    let seals = SealFlag::F_SEAL_SHRINK
        | SealFlag::F_SEAL_GROW
        | SealFlag::F_SEAL_WRITE
        | SealFlag::F_SEAL_SEAL;
    fcntl(file.as_raw_fd(), FcntlArg::F_ADD_SEALS(seals))?;

    Ok(file)
}

/// An import waiting for the idle pass.
pub struct PendingImport {
    pub params: zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
    pub client: wayland_server::Client,
    pub planes: Vec<DmabufPlane>,
    pub metadata: PlaneMetadata,
    pub modifier: u64,
    pub flags: DmabufFlags,
}

impl State {
    /// Runs queued dmabuf imports. Completion checks that the params object
    /// is still alive; a dead one drops the imported buffer on the floor.
    pub fn process_pending_imports(&mut self) {
        for job in std::mem::take(&mut self.pending_imports) {
            if !job.params.is_alive() {
                debug!("dropping import for destroyed params");
                continue;
            }

            match self.renderer.import_dmabuf(
                job.planes,
                job.metadata,
                job.modifier,
                job.flags,
            ) {
                Ok(texture) => {
                    let res = self.buffers.try_insert_with_key(|key| {
                        let wl_buffer = job.client.create_resource::<wl_buffer::WlBuffer, _, State>(
                            &self.display,
                            1,
                            key,
                        )?;

                        job.params.created(&wl_buffer);

                        Ok::<_, wayland_server::backend::InvalidId>(Buffer {
                            wl_buffer,
                            backing: BufferBacking::Dmabuf {
                                format: job.metadata,
                                modifier: job.modifier,
                            },
                            texture,
                            needs_release: false,
                            needs_destruction: false,
                            explicit_release: None,
                        })
                    });

                    match res {
                        Ok(key) => trace!(?key, "dmabuf import finished"),
                        Err(_) => {
                            // The client disconnected mid-import.
                            self.renderer.destroy_texture(texture);
                        }
                    }
                }
                Err(err) => {
                    debug!(?err, "dmabuf import failed");
                    job.params.failed();
                }
            }
        }
    }

    /// Validates a Create against the announced format table. A pair we
    /// never announced is a protocol error from v4 on, a soft failure
    /// before that.
    pub fn check_dmabuf_format(
        &self,
        resource: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        format: u32,
        modifier: u64,
    ) -> Result<DrmFourcc, bool> {
        let known = DrmFourcc::try_from(format).ok();

        match known {
            Some(fourcc) if self.dmabuf_feedback.contains(format, modifier) => Ok(fourcc),
            _ => {
                if resource.version() >= 4 {
                    resource.post_error(
                        zwp_linux_buffer_params_v1::Error::InvalidFormat,
                        format!("Format {format:#x} with modifier {modifier:#x} not supported."),
                    );
                    Err(true)
                } else {
                    Err(false)
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fake_fd() -> OwnedFd {
        std::fs::File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn add_rejects_out_of_range_plane() {
        let mut params = BufferParams::default();
        let err = params.add(4, fake_fd(), 0, 256, 0).unwrap_err();
        assert_eq!(err.0, zwp_linux_buffer_params_v1::Error::PlaneIdx);
    }

    #[test]
    fn add_rejects_duplicate_plane() {
        let mut params = BufferParams::default();
        params.add(0, fake_fd(), 0, 256, 0).unwrap();
        let err = params.add(0, fake_fd(), 0, 256, 0).unwrap_err();
        assert_eq!(err.0, zwp_linux_buffer_params_v1::Error::PlaneSet);
    }

    #[test]
    fn add_rejects_modifier_mismatch() {
        let mut params = BufferParams::default();
        params.add(0, fake_fd(), 0, 256, 42).unwrap();
        let err = params.add(1, fake_fd(), 0, 256, 43).unwrap_err();
        assert_eq!(err.0, zwp_linux_buffer_params_v1::Error::InvalidFormat);
    }

    #[test]
    fn create_requires_plane_zero() {
        let mut params = BufferParams::default();
        params.add(1, fake_fd(), 0, 256, 0).unwrap();
        let err = params.validate_create(64, 64, 0).unwrap_err();
        assert_eq!(err.0, zwp_linux_buffer_params_v1::Error::Incomplete);
    }

    #[test]
    fn create_rejects_gaps() {
        let mut params = BufferParams::default();
        params.add(0, fake_fd(), 0, 256, 0).unwrap();
        params.add(2, fake_fd(), 0, 256, 0).unwrap();
        let err = params.validate_create(64, 64, 0).unwrap_err();
        assert_eq!(err.0, zwp_linux_buffer_params_v1::Error::Incomplete);
    }

    #[test]
    fn create_rejects_oversize() {
        let mut params = BufferParams::default();
        params.add(0, fake_fd(), 0, 256, 0).unwrap();
        let err = params.validate_create(65536, 64, 0).unwrap_err();
        assert_eq!(err.0, zwp_linux_buffer_params_v1::Error::OutOfBounds);
    }

    #[test]
    fn create_consumes_params() {
        let mut params = BufferParams::default();
        params.add(0, fake_fd(), 0, 256, 0).unwrap();
        let (planes, modifier, _) = params.validate_create(64, 64, 0).unwrap();
        assert_eq!(planes.len(), 1);
        assert_eq!(modifier, 0);

        let err = params.validate_create(64, 64, 0).unwrap_err();
        assert_eq!(err.0, zwp_linux_buffer_params_v1::Error::AlreadyUsed);
    }
}
