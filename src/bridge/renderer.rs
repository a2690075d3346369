// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The renderer seam.
//!
//! The bridge never touches pixels. Buffer import, view composition and
//! idle-tracking live behind [`RenderBackend`]; the picture/glyph backends
//! implement it against the server's render machinery. The core only relies
//! on the contract spelled out here.

use std::{
    os::fd::OwnedFd,
    sync::{Arc, RwLock},
};

use drm_fourcc::DrmFourcc;
use wayland_server::protocol::wl_output;

use crate::bridge::{
    region::{Rect, Region},
    shm::MappedPool,
};

slotmap::new_key_type! {
    pub struct TextureKey;
    pub struct ViewKey;
}

/// A format/modifier pair the renderer can import.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FormatModifier {
    pub format: DrmFourcc,
    pub modifier: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PlaneMetadata {
    pub format: DrmFourcc,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub offset: u32,
}

/// One plane of a dmabuf import.
#[derive(Debug)]
pub struct DmabufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct DmabufFlags {
    pub y_invert: bool,
    pub interlaced: bool,
    pub bottom_first: bool,
}

/// A viewport in buffer coordinates. Fractional, per the protocol.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SrcRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("unsupported format: {0:?}")]
    UnsupportedFormat(DrmFourcc),
    #[error("buffer import failed: {0}")]
    Failed(String),
}

pub trait RenderBackend {
    /// Every importable format/modifier pair, used for the dmabuf feedback
    /// table. Entries with `DrmModifier::Invalid` cover the implicit case.
    fn formats(&self) -> &[FormatModifier];

    /// The dev_t of the device feedback should advertise as primary.
    fn main_device(&self) -> u64;

    fn import_shm(
        &mut self,
        pool: Arc<RwLock<MappedPool>>,
        format: PlaneMetadata,
    ) -> Result<TextureKey, ImportError>;

    fn import_dmabuf(
        &mut self,
        planes: Vec<DmabufPlane>,
        format: PlaneMetadata,
        modifier: u64,
        flags: DmabufFlags,
    ) -> Result<TextureKey, ImportError>;

    fn destroy_texture(&mut self, texture: TextureKey);

    /// Whether the texture contents have already been copied out of the
    /// client buffer, so the buffer can be released during commit.
    fn can_release_now(&self, texture: TextureKey) -> bool;

    /// Asks for `texture` to appear in a later `drain_idle` once the server
    /// is done reading from it.
    fn watch_idle(&mut self, texture: TextureKey);

    /// Textures that have become idle since the last call.
    fn drain_idle(&mut self) -> Vec<TextureKey>;

    /// Round-trips with the server so that no idle notification is still in
    /// flight. Used on tracker teardown.
    fn sync(&mut self) -> anyhow::Result<()>;

    fn create_view(&mut self) -> ViewKey;
    fn destroy_view(&mut self, view: ViewKey);

    /// Points the view at a server window, or detaches it.
    fn view_set_target(&mut self, view: ViewKey, window: Option<u32>);

    fn view_attach(&mut self, view: ViewKey, texture: Option<TextureKey>);
    fn view_set_damage(&mut self, view: ViewKey, damage: &Region);
    fn view_set_opaque(&mut self, view: ViewKey, region: &Region);
    fn view_set_scale(&mut self, view: ViewKey, factor: f64);
    fn view_set_transform(&mut self, view: ViewKey, transform: wl_output::Transform);
    fn view_set_viewport(
        &mut self,
        view: ViewKey,
        src: Option<SrcRect>,
        dst: Option<(i32, i32)>,
    );
    fn view_set_offset(&mut self, view: ViewKey, x: i32, y: i32);

    /// The bounding box of the view tree rooted at `view`, in window
    /// coordinates. Drives window resizes.
    fn view_bounds(&self, view: ViewKey) -> Rect;
}

#[cfg(test)]
pub mod testing {
    //! A headless backend for exercising the commit pipeline in tests.

    use hashbrown::HashSet;

    use super::*;

    #[derive(Default)]
    pub struct TestBackend {
        pub formats: Vec<FormatModifier>,
        pub textures: slotmap::SlotMap<TextureKey, ()>,
        pub views: slotmap::SlotMap<ViewKey, Rect>,
        pub copies_immediately: bool,
        pub watched: HashSet<TextureKey>,
        pub idle: Vec<TextureKey>,
        pub synced: u32,
    }

    impl TestBackend {
        pub fn mark_idle(&mut self, texture: TextureKey) {
            if self.watched.remove(&texture) {
                self.idle.push(texture);
            }
        }
    }

    impl RenderBackend for TestBackend {
        fn formats(&self) -> &[FormatModifier] {
            &self.formats
        }

        fn main_device(&self) -> u64 {
            0xdead
        }

        fn import_shm(
            &mut self,
            _pool: Arc<RwLock<MappedPool>>,
            _format: PlaneMetadata,
        ) -> Result<TextureKey, ImportError> {
            Ok(self.textures.insert(()))
        }

        fn import_dmabuf(
            &mut self,
            _planes: Vec<DmabufPlane>,
            format: PlaneMetadata,
            modifier: u64,
            _flags: DmabufFlags,
        ) -> Result<TextureKey, ImportError> {
            if !self
                .formats
                .iter()
                .any(|fm| fm.format == format.format && fm.modifier == modifier)
            {
                return Err(ImportError::UnsupportedFormat(format.format));
            }

            Ok(self.textures.insert(()))
        }

        fn destroy_texture(&mut self, texture: TextureKey) {
            self.textures.remove(texture);
        }

        fn can_release_now(&self, _texture: TextureKey) -> bool {
            self.copies_immediately
        }

        fn watch_idle(&mut self, texture: TextureKey) {
            self.watched.insert(texture);
        }

        fn drain_idle(&mut self) -> Vec<TextureKey> {
            std::mem::take(&mut self.idle)
        }

        fn sync(&mut self) -> anyhow::Result<()> {
            self.synced += 1;
            self.idle.extend(self.watched.drain());
            Ok(())
        }

        fn create_view(&mut self) -> ViewKey {
            self.views.insert(Rect::default())
        }

        fn destroy_view(&mut self, view: ViewKey) {
            self.views.remove(view);
        }

        fn view_set_target(&mut self, _view: ViewKey, _window: Option<u32>) {}

        fn view_attach(&mut self, _view: ViewKey, _texture: Option<TextureKey>) {}
        fn view_set_damage(&mut self, _view: ViewKey, _damage: &Region) {}
        fn view_set_opaque(&mut self, _view: ViewKey, _region: &Region) {}
        fn view_set_scale(&mut self, _view: ViewKey, _factor: f64) {}
        fn view_set_transform(&mut self, _view: ViewKey, _transform: wl_output::Transform) {}

        fn view_set_viewport(
            &mut self,
            _view: ViewKey,
            _src: Option<SrcRect>,
            _dst: Option<(i32, i32)>,
        ) {
        }

        fn view_set_offset(&mut self, _view: ViewKey, _x: i32, _y: i32) {}

        fn view_bounds(&self, view: ViewKey) -> Rect {
            self.views.get(view).copied().unwrap_or_default()
        }
    }
}
