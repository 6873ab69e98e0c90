use std::time::Duration;

use smithay::utils::{Logical, Physical, Point, Rectangle, Size};

pub mod region;

pub use region::{rect, rect_intersection, Region};

pub fn get_monotonic_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime() only writes into the provided timespec.
    let rv = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rv != 0 {
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Converts a physical size to logical coordinates, rounding to the nearest pixel.
pub fn to_logical_size(size: Size<i32, Physical>, scale: f64) -> Size<i32, Logical> {
    let w = (f64::from(size.w) / scale).round() as i32;
    let h = (f64::from(size.h) / scale).round() as i32;
    Size::from((w.max(0), h.max(0)))
}

/// Maps a rectangle from a view's logical coordinates to device pixels, rounding outwards.
pub fn to_device_rect(
    r: Rectangle<i32, Logical>,
    origin: Point<i32, Logical>,
    scale: f64,
) -> Rectangle<i32, Physical> {
    let x0 = (f64::from(r.loc.x - origin.x) * scale).floor() as i32;
    let y0 = (f64::from(r.loc.y - origin.y) * scale).floor() as i32;
    let x1 = (f64::from(r.loc.x - origin.x + r.size.w) * scale).ceil() as i32;
    let y1 = (f64::from(r.loc.y - origin.y + r.size.h) * scale).ceil() as i32;
    rect(x0, y0, x1 - x0, y1 - y0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_rect_is_relative_to_origin() {
        let r = to_device_rect(rect(110, 20, 10, 10), Point::from((100, 0)), 2.);
        assert_eq!(r, rect(20, 40, 20, 20));
    }

    #[test]
    fn monotonic_time_advances() {
        let a = get_monotonic_time();
        let b = get_monotonic_time();
        assert!(b >= a);
        assert!(!a.is_zero());
    }
}
