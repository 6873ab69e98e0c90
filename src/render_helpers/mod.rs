use smithay::backend::allocator::Fourcc;

pub mod renderer;
pub mod texture;

pub use renderer::{ItemRenderer, NullRenderer, Renderer, SoftwareRenderer};
pub use texture::Texture;

/// Premultiplied RGBA color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Self = Self::new(0., 0., 0., 0.);
    pub const BLACK: Self = Self::new(0., 0., 0., 1.);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn from_rgba8_unpremul(rgba: [u8; 4]) -> Self {
        let [r, g, b, a] = rgba.map(|v| f32::from(v) / 255.);
        Self::new(r * a, g * a, b * a, a)
    }

    pub fn is_opaque(&self) -> bool {
        self.a >= 1.
    }

    pub fn scaled(self, factor: f32) -> Self {
        Self::new(
            self.r * factor,
            self.g * factor,
            self.b * factor,
            self.a * factor,
        )
    }

    /// Composites `self` over `dst`.
    pub fn over(self, dst: Self) -> Self {
        let inv = 1. - self.a;
        Self::new(
            self.r + dst.r * inv,
            self.g + dst.g * inv,
            self.b + dst.b * inv,
            self.a + dst.a * inv,
        )
    }
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0., 1.) * 255.).round() as u8
}

/// Decodes one pixel of an 8-bit-per-channel format.
pub fn read_pixel(format: Fourcc, px: &[u8]) -> Option<Color> {
    let c = |v: u8| f32::from(v) / 255.;
    let color = match format {
        Fourcc::Argb8888 => Color::new(c(px[2]), c(px[1]), c(px[0]), c(px[3])),
        Fourcc::Xrgb8888 => Color::new(c(px[2]), c(px[1]), c(px[0]), 1.),
        Fourcc::Abgr8888 => Color::new(c(px[0]), c(px[1]), c(px[2]), c(px[3])),
        Fourcc::Xbgr8888 => Color::new(c(px[0]), c(px[1]), c(px[2]), 1.),
        _ => return None,
    };
    Some(color)
}

/// Encodes one pixel of an 8-bit-per-channel format. Returns `false` for other formats.
pub fn write_pixel(format: Fourcc, px: &mut [u8], color: Color) -> bool {
    let [r, g, b, a] = [color.r, color.g, color.b, color.a].map(to_u8);
    let bytes = match format {
        Fourcc::Argb8888 => [b, g, r, a],
        Fourcc::Xrgb8888 => [b, g, r, 255],
        Fourcc::Abgr8888 => [r, g, b, a],
        Fourcc::Xbgr8888 => [r, g, b, 255],
        _ => return false,
    };
    px[..4].copy_from_slice(&bytes);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_encoding_matches_byte_order() {
        let mut px = [0; 4];
        let red = Color::new(1., 0., 0., 1.);
        assert!(write_pixel(Fourcc::Argb8888, &mut px, red));
        assert_eq!(px, [0, 0, 255, 255]);
        assert_eq!(read_pixel(Fourcc::Argb8888, &px), Some(red));

        assert!(write_pixel(Fourcc::Abgr8888, &mut px, red));
        assert_eq!(px, [255, 0, 0, 255]);
        assert!(!write_pixel(Fourcc::Rgb565, &mut px, red));
    }

    #[test]
    fn half_transparent_over_opaque() {
        let src = Color::from_rgba8_unpremul([255, 255, 255, 128]);
        let out = src.over(Color::BLACK);
        assert!((out.r - 128. / 255.).abs() < 1e-6);
        assert_eq!(out.a, 1.);
    }
}
