// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The software render backend.
//!
//! Client shm buffers are copied into server pixmaps as soon as they are
//! imported or damaged, which means buffers can always be released early.
//! Views blit their pixmap into the backing window. Dmabuf import belongs
//! to the DRI3 backend, which this build doesn't carry; the format table is
//! left empty so well-behaved clients never attempt it.
//!
//! The backend keeps its own server connection. Renderer traffic is bulky
//! and synchronizing it with the protocol connection is exactly the kind of
//! coupling the seam is meant to avoid.

use std::sync::{Arc, RwLock};

use anyhow::Context as _;
use tracing::{trace, warn};
use x11rb::{
    connection::Connection as _,
    protocol::xproto::{self, ConnectionExt as _},
    rust_connection::RustConnection,
};

use crate::bridge::{
    region::{Rect, Region},
    renderer::{
        DmabufFlags, DmabufPlane, FormatModifier, ImportError, PlaneMetadata, RenderBackend,
        SrcRect, TextureKey, ViewKey,
    },
    shm::MappedPool,
};

struct Texture {
    pixmap: xproto::Pixmap,
    pool: Arc<RwLock<MappedPool>>,
    format: PlaneMetadata,
}

#[derive(Default)]
struct View {
    target: Option<xproto::Window>,
    texture: Option<TextureKey>,
    offset: (i32, i32),
    scale: f64,
    dst: Option<(i32, i32)>,
}

pub struct PixmapBackend {
    conn: RustConnection,
    root: xproto::Window,
    depth: u8,
    gc: xproto::Gcontext,

    textures: slotmap::SlotMap<TextureKey, Texture>,
    views: slotmap::SlotMap<ViewKey, View>,

    formats: Vec<FormatModifier>,
}

impl PixmapBackend {
    pub fn new() -> anyhow::Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).context("renderer connection failed")?;
        let screen = conn.setup().roots[screen_num].clone();

        let gc = conn.generate_id()?;
        conn.create_gc(
            gc,
            screen.root,
            &xproto::CreateGCAux::default().graphics_exposures(0),
        )?;
        conn.flush()?;

        Ok(Self {
            conn,
            root: screen.root,
            depth: screen.root_depth,
            gc,

            textures: slotmap::SlotMap::default(),
            views: slotmap::SlotMap::default(),

            formats: Vec::new(),
        })
    }

    /// Uploads rows from the pool into the pixmap, chunked to stay inside
    /// the request size limit.
    fn upload(&self, texture: &Texture, rows: std::ops::Range<u32>) -> anyhow::Result<()> {
        let format = texture.format;
        let pool = texture.pool.read().unwrap();

        let row_bytes = format.stride as usize;
        let max_rows = (1 << 16) / row_bytes.max(1);
        let mut y = rows.start;

        while y < rows.end {
            let count = max_rows.max(1).min((rows.end - y) as usize) as u32;
            let offset = format.offset as usize + y as usize * row_bytes;
            let data = pool
                .bytes(offset, count as usize * row_bytes)
                .context("buffer range left the pool")?;

            self.conn.put_image(
                xproto::ImageFormat::Z_PIXMAP,
                texture.pixmap,
                self.gc,
                format.width as u16,
                count as u16,
                0,
                y as i16,
                0,
                self.depth,
                data,
            )?;

            y += count;
        }

        Ok(())
    }

    fn present(&self, view: &View) {
        let (Some(target), Some(texture_key)) = (view.target, view.texture) else {
            return;
        };
        let Some(texture) = self.textures.get(texture_key) else {
            return;
        };

        let (w, h) = match view.dst {
            // Destination scaling needs a render backend; blit unscaled.
            Some((w, h)) => (w as u16, h as u16),
            None => (texture.format.width as u16, texture.format.height as u16),
        };

        let res = self.conn.copy_area(
            texture.pixmap,
            target,
            self.gc,
            0,
            0,
            view.offset.0 as i16,
            view.offset.1 as i16,
            w,
            h,
        );

        if let Err(err) = res.and_then(|_| Ok(self.conn.flush()?)) {
            warn!(?err, "present failed");
        }
    }
}

impl RenderBackend for PixmapBackend {
    fn formats(&self) -> &[FormatModifier] {
        &self.formats
    }

    fn main_device(&self) -> u64 {
        0
    }

    fn import_shm(
        &mut self,
        pool: Arc<RwLock<MappedPool>>,
        format: PlaneMetadata,
    ) -> Result<TextureKey, ImportError> {
        let pixmap = self
            .conn
            .generate_id()
            .map_err(|e| ImportError::Failed(e.to_string()))?;

        self.conn
            .create_pixmap(
                self.depth,
                pixmap,
                self.root,
                format.width as u16,
                format.height as u16,
            )
            .map_err(|e| ImportError::Failed(e.to_string()))?;

        let texture = Texture {
            pixmap,
            pool,
            format,
        };

        // The copy happens now, so the client buffer is immediately free.
        if let Err(err) = self.upload(&texture, 0..format.height) {
            let _ = self.conn.free_pixmap(pixmap);
            return Err(ImportError::Failed(err.to_string()));
        }

        trace!(pixmap, width = format.width, height = format.height, "imported shm buffer");

        Ok(self.textures.insert(texture))
    }

    fn import_dmabuf(
        &mut self,
        _planes: Vec<DmabufPlane>,
        format: PlaneMetadata,
        _modifier: u64,
        _flags: DmabufFlags,
    ) -> Result<TextureKey, ImportError> {
        // Direct scanout buffers need the DRI3 backend.
        Err(ImportError::UnsupportedFormat(format.format))
    }

    fn destroy_texture(&mut self, texture: TextureKey) {
        if let Some(texture) = self.textures.remove(texture) {
            let _ = self.conn.free_pixmap(texture.pixmap);
        }
    }

    fn can_release_now(&self, _texture: TextureKey) -> bool {
        // Content always lives in our pixmap by the time commit asks.
        true
    }

    fn watch_idle(&mut self, _texture: TextureKey) {}

    fn drain_idle(&mut self) -> Vec<TextureKey> {
        Vec::new()
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        let _ = self.conn.get_input_focus()?.reply()?;
        Ok(())
    }

    fn create_view(&mut self) -> ViewKey {
        self.views.insert(View {
            scale: 1.0,
            ..View::default()
        })
    }

    fn destroy_view(&mut self, view: ViewKey) {
        self.views.remove(view);
    }

    fn view_set_target(&mut self, view: ViewKey, window: Option<u32>) {
        if let Some(view) = self.views.get_mut(view) {
            view.target = window;
        }
    }

    fn view_attach(&mut self, view: ViewKey, texture: Option<TextureKey>) {
        let Some(v) = self.views.get_mut(view) else {
            return;
        };
        v.texture = texture;

        if let Some(v) = self.views.get(view) {
            self.present(v);
        }
    }

    fn view_set_damage(&mut self, view: ViewKey, damage: &Region) {
        let Some(v) = self.views.get(view) else {
            return;
        };

        // Refresh the damaged rows from the pool, then blit.
        if let Some(texture) = v.texture.and_then(|t| self.textures.get(t)) {
            let extents = damage.extents();
            let y0 = extents.y.clamp(0, texture.format.height as i32) as u32;
            let y1 = extents.y2().clamp(0, texture.format.height as i32) as u32;
            if y1 > y0 {
                if let Err(err) = self.upload(texture, y0..y1) {
                    warn!(?err, "damage upload failed");
                }
            }
        }

        self.present(v);
    }

    fn view_set_opaque(&mut self, _view: ViewKey, _region: &Region) {}

    fn view_set_scale(&mut self, view: ViewKey, factor: f64) {
        if let Some(view) = self.views.get_mut(view) {
            view.scale = factor;
        }
    }

    fn view_set_transform(
        &mut self,
        _view: ViewKey,
        transform: wayland_server::protocol::wl_output::Transform,
    ) {
        if transform != wayland_server::protocol::wl_output::Transform::Normal {
            warn!(?transform, "buffer transforms need a render backend");
        }
    }

    fn view_set_viewport(
        &mut self,
        view: ViewKey,
        _src: Option<SrcRect>,
        dst: Option<(i32, i32)>,
    ) {
        if let Some(view) = self.views.get_mut(view) {
            view.dst = dst;
        }
    }

    fn view_set_offset(&mut self, view: ViewKey, x: i32, y: i32) {
        if let Some(view) = self.views.get_mut(view) {
            view.offset = (x, y);
        }
    }

    fn view_bounds(&self, view: ViewKey) -> Rect {
        let Some(view) = self.views.get(view) else {
            return Rect::default();
        };

        if let Some((w, h)) = view.dst {
            let scale = view.scale.max(1.0);
            return Rect::new(
                view.offset.0,
                view.offset.1,
                (w as f64 * scale).round() as i32,
                (h as f64 * scale).round() as i32,
            );
        }

        match view.texture.and_then(|t| self.textures.get(t)) {
            Some(texture) => Rect::new(
                view.offset.0,
                view.offset.1,
                texture.format.width as i32,
                texture.format.height as i32,
            ),
            None => Rect::default(),
        }
    }
}
