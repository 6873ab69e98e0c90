use std::rc::Rc;

use anyhow::{ensure, Context};
use smithay::backend::allocator::Fourcc;
use smithay::utils::{Buffer as BufferCoords, Rectangle, Size};
use tracing::debug;

use super::{read_pixel, Color};
use crate::backend::allocator::{format_info, Buffer};
use crate::utils::Region;

enum Storage {
    /// A CPU copy of client pixels, updated in place on damage.
    Image { data: Vec<u8>, stride: usize },
    /// The client buffer itself.
    Imported(Rc<Buffer>),
}

/// GPU-less texture of a surface, cursor or decoration.
pub struct Texture {
    size: Size<i32, BufferCoords>,
    format: Fourcc,
    storage: Storage,
}

impl Texture {
    pub fn from_pixels(
        size: Size<i32, BufferCoords>,
        format: Fourcc,
        data: Vec<u8>,
        stride: usize,
    ) -> anyhow::Result<Self> {
        let info = format_info(format).with_context(|| format!("unsupported format {format:?}"))?;
        ensure!(info.planes == 1, "multi-planar format {format:?} cannot be uploaded");
        ensure!(size.w > 0 && size.h > 0, "invalid texture size {size:?}");
        ensure!(
            stride >= size.w as usize * info.bytes_per_pixel,
            "stride {stride} too small for width {}",
            size.w
        );
        ensure!(
            data.len() >= stride * size.h as usize,
            "texture data is too short"
        );

        Ok(Self {
            size,
            format,
            storage: Storage::Image { data, stride },
        })
    }

    /// Creates a texture filled with one unpremultiplied RGBA color.
    pub fn solid(size: Size<i32, BufferCoords>, rgba: [u8; 4]) -> anyhow::Result<Self> {
        let [r, g, b, a] = rgba;
        let pixels = (size.w.max(0) * size.h.max(0)) as usize;
        let data = [b, g, r, a].repeat(pixels);
        Self::from_pixels(size, Fourcc::Argb8888, data, size.w.max(0) as usize * 4)
    }

    /// Wraps a client buffer without copying it.
    pub fn from_buffer(buffer: Rc<Buffer>) -> Self {
        let size = buffer.size();
        Self {
            size: Size::from((size.w, size.h)),
            format: buffer.format(),
            storage: Storage::Imported(buffer),
        }
    }

    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// The client buffer this texture samples from, if it was imported.
    pub fn buffer(&self) -> Option<&Rc<Buffer>> {
        match &self.storage {
            Storage::Imported(buffer) => Some(buffer),
            Storage::Image { .. } => None,
        }
    }

    /// Whether the format has no alpha channel.
    pub fn is_opaque(&self) -> bool {
        format_info(self.format).is_some_and(|info| !info.has_alpha)
    }

    /// Copies the damaged part of new client pixels into this texture.
    ///
    /// Returns `false` if the texture cannot be updated in place and must be recreated.
    pub fn update(&mut self, src: &[u8], src_stride: usize, damage: &Region<BufferCoords>) -> bool {
        let _span = tracy_client::span!("Texture::update");

        let Some(info) = format_info(self.format) else {
            return false;
        };
        let Storage::Image { data, stride } = &mut self.storage else {
            return false;
        };
        let width = self.size.w.max(0) as usize;
        let height = self.size.h.max(0) as usize;
        let Some(row_len) = width.checked_mul(info.bytes_per_pixel) else {
            return false;
        };
        let needed = height
            .checked_sub(1)
            .and_then(|rows| rows.checked_mul(src_stride))
            .and_then(|before_last| before_last.checked_add(row_len));
        if src_stride < row_len || needed.map_or(true, |needed| src.len() < needed) {
            debug!("ignoring {} bytes with stride {src_stride} for {width}x{height}", src.len());
            return false;
        }

        let bounds = Rectangle::from_size(self.size);
        for r in damage.intersect_rect(bounds).rects() {
            let offset = r.loc.x as usize * info.bytes_per_pixel;
            let len = r.size.w as usize * info.bytes_per_pixel;
            for y in r.loc.y..r.loc.y + r.size.h {
                let y = y as usize;
                let dst = &mut data[y * *stride + offset..][..len];
                dst.copy_from_slice(&src[y * src_stride + offset..][..len]);
            }
        }
        true
    }

    /// Samples the texel at integer coordinates.
    pub fn texel(&self, x: i32, y: i32) -> Option<Color> {
        if x < 0 || y < 0 || x >= self.size.w || y >= self.size.h {
            return None;
        }

        let (data, stride) = match &self.storage {
            Storage::Image { data, stride } => (&data[..], *stride),
            Storage::Imported(buffer) => buffer.pixels()?,
        };
        let bpp = format_info(self.format)?.bytes_per_pixel;
        let offset = y as usize * stride + x as usize * bpp;
        read_pixel(self.format, data.get(offset..offset + bpp)?)
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let storage = match self.storage {
            Storage::Image { .. } => "image",
            Storage::Imported(_) => "imported",
        };
        f.debug_struct("Texture")
            .field("size", &self.size)
            .field("format", &self.format)
            .field("storage", &storage)
            .finish()
    }
}
