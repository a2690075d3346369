// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Client shared-memory pools.
//!
//! The bridge never scans out of client memory; the renderer copies buffer
//! contents out of the pool at import or damage time. That keeps the
//! mapping read-only, and it only has to be valid while a copy is running.

use std::{num::NonZeroUsize, os::fd::OwnedFd, ptr::NonNull};

use anyhow::bail;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

slotmap::new_key_type! { pub struct ShmPoolKey; }

/// A client pool, mapped for reading.
///
/// The protocol only ever grows a pool, and `grow` enforces that, so a
/// buffer validated against the pool once stays valid. Reads go through
/// [`MappedPool::bytes`], which bounds-checks against the live mapping.
// TODO: a client can still truncate the file underneath us and SIGBUS the
// copy; that needs a fault handler around the renderer's reads.
pub struct MappedPool {
    fd: OwnedFd,
    mapping: NonNull<u8>,
    len: usize,
}

// The loop is single-threaded; the Arc around a pool shares ownership with
// buffers cut from it, never concurrent access.
unsafe impl Send for MappedPool {}

unsafe impl Sync for MappedPool {}

impl MappedPool {
    pub fn new(fd: OwnedFd, len: usize) -> anyhow::Result<Self> {
        let mapping = map(&fd, len)?;

        Ok(Self { fd, mapping, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A view of a byte range, or `None` when it runs off the pool.
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }

        Some(unsafe { std::slice::from_raw_parts(self.mapping.as_ptr().add(offset), len) })
    }

    /// Remaps the pool at a larger size.
    pub fn grow(&mut self, len: usize) -> anyhow::Result<()> {
        if len <= self.len {
            bail!("pools only grow ({} -> {len})", self.len);
        }

        let mapping = map(&self.fd, len)?;
        unsafe { munmap(self.mapping.cast(), self.len).expect("munmap failed") };

        self.mapping = mapping;
        self.len = len;

        Ok(())
    }
}

fn map(fd: &OwnedFd, len: usize) -> anyhow::Result<NonNull<u8>> {
    let Some(len) = NonZeroUsize::new(len) else {
        bail!("zero-sized pool");
    };

    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )?
    };

    Ok(ptr.cast())
}

impl Drop for MappedPool {
    fn drop(&mut self) {
        unsafe { munmap(self.mapping.cast(), self.len).expect("munmap failed") };
    }
}
