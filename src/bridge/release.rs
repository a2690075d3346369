// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Deferred buffer release.
//!
//! When the renderer can't confirm at commit time that a buffer's contents
//! have been copied, the release is parked here until the renderer reports
//! the texture idle. Frame callbacks gate on the queue draining: clients
//! expect their buffers back before the next frame callback.

use crate::bridge::{
    buffers::BufferKey,
    callbacks::{CallbackKey, CallbackList},
    renderer::TextureKey,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReleaseRecord {
    pub buffer: BufferKey,
    pub texture: TextureKey,
}

#[derive(Default)]
pub struct ReleaseTracker {
    queue: CallbackList<ReleaseRecord>,
}

impl ReleaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Parks a release until the renderer reports `texture` idle.
    pub fn defer(&mut self, buffer: BufferKey, texture: TextureKey) -> CallbackKey {
        self.queue.push_back(ReleaseRecord { buffer, texture })
    }

    /// Unlinks a record early, e.g. when the buffer is destroyed while
    /// queued.
    pub fn unlink(&mut self, key: CallbackKey) -> Option<ReleaseRecord> {
        self.queue.remove(key)
    }

    /// The renderer reported `texture` idle; returns every buffer now
    /// releasable.
    pub fn note_idle(&mut self, texture: TextureKey) -> Vec<BufferKey> {
        let mut out = Vec::new();
        for key in self.queue.keys() {
            if self.queue.get(key).is_some_and(|r| r.texture == texture) {
                let record = self.queue.remove(key).unwrap();
                out.push(record.buffer);
            }
        }

        out
    }

    /// Empties the queue unconditionally. The caller must have synchronized
    /// with the renderer first so no idle notification is still in flight.
    pub fn drain(&mut self) -> Vec<ReleaseRecord> {
        self.queue.drain()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn keys() -> (BufferKey, BufferKey, TextureKey, TextureKey) {
        let mut buffers = slotmap::SlotMap::<BufferKey, ()>::with_key();
        let mut textures = slotmap::SlotMap::<TextureKey, ()>::with_key();
        (
            buffers.insert(()),
            buffers.insert(()),
            textures.insert(()),
            textures.insert(()),
        )
    }

    #[test]
    fn idle_releases_matching() {
        let (b1, b2, t1, t2) = keys();
        let mut tracker = ReleaseTracker::new();
        tracker.defer(b1, t1);
        tracker.defer(b2, t2);

        assert_eq!(tracker.note_idle(t2), vec![b2]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.note_idle(t2), vec![]);
        assert_eq!(tracker.note_idle(t1), vec![b1]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn unlink_prevents_release() {
        let (b1, _, t1, _) = keys();
        let mut tracker = ReleaseTracker::new();
        let key = tracker.defer(b1, t1);

        assert!(tracker.unlink(key).is_some());
        assert_eq!(tracker.note_idle(t1), vec![]);
    }

    #[test]
    fn drain_empties() {
        let (b1, b2, t1, _) = keys();
        let mut tracker = ReleaseTracker::new();
        tracker.defer(b1, t1);
        tracker.defer(b2, t1);

        assert_eq!(tracker.drain().len(), 2);
        assert!(tracker.is_empty());
    }
}
