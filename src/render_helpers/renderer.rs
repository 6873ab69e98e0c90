//! Item renderers draw scene quads into layer buffers.

use anyhow::{bail, ensure};
use kwin_config::RendererKind;
use smithay::utils::{Physical, Rectangle};
use tracing::trace;

use super::{read_pixel, write_pixel, Color, Texture};
use crate::backend::allocator::Buffer;
use crate::scene::quad::{Quad, QuadFill};
use crate::utils::Region;

pub trait ItemRenderer {
    /// Prepares to draw into `target`. Fails if the target cannot be rendered to.
    fn begin_frame(&mut self, target: &mut Buffer) -> anyhow::Result<()>;

    fn clear(&mut self, target: &mut Buffer, region: &Region<Physical>, color: Color);

    /// Draws a quad restricted to `clip`.
    fn draw_quad(
        &mut self,
        target: &mut Buffer,
        quad: &Quad<Physical>,
        texture: Option<&Texture>,
        clip: &Region<Physical>,
        opacity: f32,
    );

    fn end_frame(&mut self, target: &mut Buffer) -> anyhow::Result<()>;
}

/// One recorded draw call.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Clear(Region<Physical>),
    Quad {
        geometry: Rectangle<i32, Physical>,
        clip: Region<Physical>,
    },
}

/// Records draw calls without touching pixels.
#[derive(Debug, Default)]
pub struct NullRenderer {
    ops: Vec<DrawOp>,
    frames: u64,
}

impl NullRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw calls of the last frame.
    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl ItemRenderer for NullRenderer {
    fn begin_frame(&mut self, _target: &mut Buffer) -> anyhow::Result<()> {
        self.ops.clear();
        Ok(())
    }

    fn clear(&mut self, _target: &mut Buffer, region: &Region<Physical>, _color: Color) {
        if !region.is_empty() {
            self.ops.push(DrawOp::Clear(region.clone()));
        }
    }

    fn draw_quad(
        &mut self,
        _target: &mut Buffer,
        quad: &Quad<Physical>,
        _texture: Option<&Texture>,
        clip: &Region<Physical>,
        _opacity: f32,
    ) {
        let clip = clip.intersect_rect(quad.geometry);
        if !clip.is_empty() {
            self.ops.push(DrawOp::Quad {
                geometry: quad.geometry,
                clip,
            });
        }
    }

    fn end_frame(&mut self, _target: &mut Buffer) -> anyhow::Result<()> {
        self.frames += 1;
        Ok(())
    }
}

/// Rasterizes quads on the CPU into memory buffers.
#[derive(Debug, Default)]
pub struct SoftwareRenderer {
    pixels_written: u64,
}

impl SoftwareRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pixels written since creation.
    pub fn pixels_written(&self) -> u64 {
        self.pixels_written
    }

    fn fill(
        &mut self,
        target: &mut Buffer,
        area: &Region<Physical>,
        mut shade: impl FnMut(i32, i32) -> Option<Color>,
        blend: bool,
    ) {
        let format = target.format();
        let size = target.size();
        let Some((data, stride)) = target.pixels_mut() else {
            return;
        };

        for r in area.intersect_rect(Rectangle::from_size(size)).rects() {
            for y in r.loc.y..r.loc.y + r.size.h {
                for x in r.loc.x..r.loc.x + r.size.w {
                    let Some(color) = shade(x, y) else {
                        continue;
                    };
                    let offset = y as usize * stride + x as usize * 4;
                    let px = &mut data[offset..offset + 4];
                    let color = if blend {
                        let dst = read_pixel(format, px).unwrap_or(Color::TRANSPARENT);
                        color.over(dst)
                    } else {
                        color
                    };
                    write_pixel(format, px, color);
                    self.pixels_written += 1;
                }
            }
        }
    }
}

impl ItemRenderer for SoftwareRenderer {
    fn begin_frame(&mut self, target: &mut Buffer) -> anyhow::Result<()> {
        let format = target.format();
        ensure!(
            read_pixel(format, &[0; 4]).is_some(),
            "cannot render into {format:?}"
        );
        if target.pixels().is_none() {
            bail!("target buffer is not CPU-accessible");
        }
        Ok(())
    }

    fn clear(&mut self, target: &mut Buffer, region: &Region<Physical>, color: Color) {
        let _span = tracy_client::span!("SoftwareRenderer::clear");
        self.fill(target, region, |_, _| Some(color), false);
    }

    fn draw_quad(
        &mut self,
        target: &mut Buffer,
        quad: &Quad<Physical>,
        texture: Option<&Texture>,
        clip: &Region<Physical>,
        opacity: f32,
    ) {
        let _span = tracy_client::span!("SoftwareRenderer::draw_quad");

        let g = quad.geometry;
        if g.size.w <= 0 || g.size.h <= 0 || opacity <= 0. {
            return;
        }
        let area = clip.intersect_rect(g);

        match quad.fill {
            QuadFill::Solid(color) => {
                let color = color.scaled(opacity);
                let blend = !color.is_opaque();
                self.fill(target, &area, |_, _| Some(color), blend);
            }
            QuadFill::Texture { src } => {
                let Some(texture) = texture else {
                    trace!("skipping textured quad without a texture");
                    return;
                };
                let sx = f64::from(src.size.w) / f64::from(g.size.w);
                let sy = f64::from(src.size.h) / f64::from(g.size.h);
                let sample = |x: i32, y: i32| {
                    let u = src.loc.x + ((f64::from(x - g.loc.x) + 0.5) * sx) as i32;
                    let v = src.loc.y + ((f64::from(y - g.loc.y) + 0.5) * sy) as i32;
                    texture.texel(u, v).map(|c| c.scaled(opacity))
                };
                self.fill(target, &area, sample, true);
            }
        }
    }

    fn end_frame(&mut self, _target: &mut Buffer) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The renderer selected in the configuration.
#[derive(Debug)]
pub enum Renderer {
    Software(SoftwareRenderer),
    Null(NullRenderer),
}

impl Renderer {
    pub fn new(kind: RendererKind) -> Self {
        match kind {
            RendererKind::Software => Self::Software(SoftwareRenderer::new()),
            RendererKind::None => Self::Null(NullRenderer::new()),
        }
    }

    pub fn as_null(&self) -> Option<&NullRenderer> {
        match self {
            Self::Null(renderer) => Some(renderer),
            Self::Software(_) => None,
        }
    }

    fn inner(&mut self) -> &mut dyn ItemRenderer {
        match self {
            Self::Software(renderer) => renderer,
            Self::Null(renderer) => renderer,
        }
    }
}

impl ItemRenderer for Renderer {
    fn begin_frame(&mut self, target: &mut Buffer) -> anyhow::Result<()> {
        self.inner().begin_frame(target)
    }

    fn clear(&mut self, target: &mut Buffer, region: &Region<Physical>, color: Color) {
        self.inner().clear(target, region, color)
    }

    fn draw_quad(
        &mut self,
        target: &mut Buffer,
        quad: &Quad<Physical>,
        texture: Option<&Texture>,
        clip: &Region<Physical>,
        opacity: f32,
    ) {
        self.inner()
            .draw_quad(target, quad, texture, clip, opacity)
    }

    fn end_frame(&mut self, target: &mut Buffer) -> anyhow::Result<()> {
        self.inner().end_frame(target)
    }
}
