//! Geometry handed to item renderers.

use smithay::utils::{Buffer as BufferCoords, Logical, Physical, Point, Rectangle, Size};

use crate::render_helpers::Color;
use crate::utils::{rect, to_device_rect};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuadFill {
    Solid(Color),
    /// Samples this part of the item's texture.
    Texture { src: Rectangle<i32, BufferCoords> },
}

/// A rectangle to draw, either a solid fill or a piece of a texture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad<Kind> {
    pub geometry: Rectangle<i32, Kind>,
    pub fill: QuadFill,
}

impl Quad<Logical> {
    pub fn translated(self, offset: Point<i32, Logical>) -> Self {
        Self {
            geometry: Rectangle::new(self.geometry.loc + offset, self.geometry.size),
            fill: self.fill,
        }
    }

    pub fn to_device(self, origin: Point<i32, Logical>, scale: f64) -> Quad<Physical> {
        Quad {
            geometry: to_device_rect(self.geometry, origin, scale),
            fill: self.fill,
        }
    }
}

/// Widths of the fixed borders of a nine-patch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Insets {
    pub left: i32,
    pub right: i32,
    pub top: i32,
    pub bottom: i32,
}

pub fn solid_quads(size: Size<i32, Logical>, color: Color) -> Vec<Quad<Logical>> {
    if size.w <= 0 || size.h <= 0 {
        return Vec::new();
    }
    vec![Quad {
        geometry: Rectangle::from_size(size),
        fill: QuadFill::Solid(color),
    }]
}

/// One quad stretching the whole texture over the item.
pub fn texture_quads(
    size: Size<i32, Logical>,
    texture_size: Size<i32, BufferCoords>,
) -> Vec<Quad<Logical>> {
    if size.w <= 0 || size.h <= 0 || texture_size.w <= 0 || texture_size.h <= 0 {
        return Vec::new();
    }
    vec![Quad {
        geometry: Rectangle::from_size(size),
        fill: QuadFill::Texture {
            src: Rectangle::from_size(texture_size),
        },
    }]
}

/// Splits a texture into corners that keep their size, edges that stretch along one axis and a
/// center that stretches along both.
pub fn nine_patch_quads(
    size: Size<i32, Logical>,
    texture_size: Size<i32, BufferCoords>,
    insets: Insets,
) -> Vec<Quad<Logical>> {
    if size.w <= 0 || size.h <= 0 || texture_size.w <= 0 || texture_size.h <= 0 {
        return Vec::new();
    }

    let left = insets.left.clamp(0, size.w.min(texture_size.w));
    let right = insets.right.clamp(0, (size.w - left).min(texture_size.w - left));
    let top = insets.top.clamp(0, size.h.min(texture_size.h));
    let bottom = insets
        .bottom
        .clamp(0, (size.h - top).min(texture_size.h - top));

    let dst_x = [0, left, size.w - right, size.w];
    let dst_y = [0, top, size.h - bottom, size.h];
    let src_x = [0, left, texture_size.w - right, texture_size.w];
    let src_y = [0, top, texture_size.h - bottom, texture_size.h];

    let mut quads = Vec::with_capacity(9);
    for row in 0..3 {
        for col in 0..3 {
            let geometry = rect(
                dst_x[col],
                dst_y[row],
                dst_x[col + 1] - dst_x[col],
                dst_y[row + 1] - dst_y[row],
            );
            let src = rect(
                src_x[col],
                src_y[row],
                src_x[col + 1] - src_x[col],
                src_y[row + 1] - src_y[row],
            );
            if geometry.size.w == 0 || geometry.size.h == 0 || src.size.w == 0 || src.size.h == 0 {
                continue;
            }
            quads.push(Quad {
                geometry,
                fill: QuadFill::Texture { src },
            });
        }
    }
    quads
}
