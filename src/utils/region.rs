//! Integer damage regions.
//!
//! A [`Region`] is a set of pixels stored as non-overlapping rectangles. Damage only ever needs to
//! be conservative, so when a region fragments into too many rectangles it collapses into its
//! bounding rectangle.

use std::fmt;

use smithay::utils::{Logical, Physical, Point, Rectangle, Size};

/// Above this many rectangles a region is replaced by its bounding rectangle.
const MAX_RECTS: usize = 128;

const INFINITE_ORIGIN: i32 = -(1 << 30);
const INFINITE_EXTENT: i32 = i32::MAX;

/// Builds a rectangle, clamping negative sizes to zero.
pub fn rect<Kind>(x: i32, y: i32, w: i32, h: i32) -> Rectangle<i32, Kind> {
    Rectangle::new(Point::from((x, y)), Size::from((w.max(0), h.max(0))))
}

fn is_empty_rect<Kind>(r: &Rectangle<i32, Kind>) -> bool {
    r.size.w <= 0 || r.size.h <= 0
}

fn is_infinite_rect<Kind>(r: &Rectangle<i32, Kind>) -> bool {
    r.loc.x <= INFINITE_ORIGIN
        && r.loc.y <= INFINITE_ORIGIN
        && r.size.w == INFINITE_EXTENT
        && r.size.h == INFINITE_EXTENT
}

fn edges<Kind>(r: &Rectangle<i32, Kind>) -> (i64, i64, i64, i64) {
    let x0 = i64::from(r.loc.x);
    let y0 = i64::from(r.loc.y);
    (x0, y0, x0 + i64::from(r.size.w), y0 + i64::from(r.size.h))
}

fn from_edges<Kind>(x0: i64, y0: i64, x1: i64, y1: i64) -> Rectangle<i32, Kind> {
    let clamp = |v: i64| v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    let (x0, y0) = (clamp(x0), clamp(y0));
    let w = clamp(x1 - i64::from(x0));
    let h = clamp(y1 - i64::from(y0));
    rect(x0, y0, w, h)
}

/// Intersection of two rectangles, `None` if they do not overlap.
pub fn rect_intersection<Kind>(
    a: Rectangle<i32, Kind>,
    b: Rectangle<i32, Kind>,
) -> Option<Rectangle<i32, Kind>> {
    intersect_rects(&a, &b)
}

fn intersect_rects<Kind>(
    a: &Rectangle<i32, Kind>,
    b: &Rectangle<i32, Kind>,
) -> Option<Rectangle<i32, Kind>> {
    let (ax0, ay0, ax1, ay1) = edges(a);
    let (bx0, by0, bx1, by1) = edges(b);
    let (x0, y0) = (ax0.max(bx0), ay0.max(by0));
    let (x1, y1) = (ax1.min(bx1), ay1.min(by1));
    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some(from_edges(x0, y0, x1, y1))
}

/// Splits `a` minus `b` into at most four rectangles.
fn subtract_rects<Kind>(
    a: &Rectangle<i32, Kind>,
    b: &Rectangle<i32, Kind>,
) -> Vec<Rectangle<i32, Kind>> {
    let Some(overlap) = intersect_rects(a, b) else {
        return vec![*a];
    };

    let (ax0, ay0, ax1, ay1) = edges(a);
    let (ox0, oy0, ox1, oy1) = edges(&overlap);

    let mut rv = Vec::with_capacity(4);
    // Full-width bands above and below the overlap, then the sides within its rows.
    if ay0 < oy0 {
        rv.push(from_edges(ax0, ay0, ax1, oy0));
    }
    if oy1 < ay1 {
        rv.push(from_edges(ax0, oy1, ax1, ay1));
    }
    if ax0 < ox0 {
        rv.push(from_edges(ax0, oy0, ox0, oy1));
    }
    if ox1 < ax1 {
        rv.push(from_edges(ox1, oy0, ax1, oy1));
    }
    rv
}

/// A set of pixels in the `Kind` coordinate space.
pub struct Region<Kind> {
    rects: Vec<Rectangle<i32, Kind>>,
}

impl<Kind> Region<Kind> {
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    /// A region covering everything; consumers clip it against their own bounds.
    pub fn infinite() -> Self {
        Self::from_rect(rect(
            INFINITE_ORIGIN,
            INFINITE_ORIGIN,
            INFINITE_EXTENT,
            INFINITE_EXTENT,
        ))
    }

    pub fn from_rect(r: Rectangle<i32, Kind>) -> Self {
        let mut region = Self::new();
        region.add_rect(r);
        region
    }

    pub fn from_rects(rects: impl IntoIterator<Item = Rectangle<i32, Kind>>) -> Self {
        let mut region = Self::new();
        for r in rects {
            region.add_rect(r);
        }
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn is_infinite(&self) -> bool {
        self.rects.iter().any(is_infinite_rect)
    }

    pub fn rects(&self) -> impl Iterator<Item = &Rectangle<i32, Kind>> + '_ {
        self.rects.iter()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn add_rect(&mut self, r: Rectangle<i32, Kind>) {
        if is_empty_rect(&r) || self.is_infinite() {
            return;
        }
        if is_infinite_rect(&r) {
            self.rects.clear();
            self.rects.push(r);
            return;
        }

        let mut pieces = vec![r];
        for existing in &self.rects {
            pieces = pieces
                .iter()
                .flat_map(|piece| subtract_rects(piece, existing))
                .collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);

        if self.rects.len() > MAX_RECTS {
            if let Some(bbox) = self.bounding_rect() {
                self.rects.clear();
                self.rects.push(bbox);
            }
        }
    }

    pub fn add_region(&mut self, other: &Self) {
        for r in &other.rects {
            self.add_rect(*r);
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut rv = self.clone();
        rv.add_region(other);
        rv
    }

    pub fn intersect_rect(&self, clip: Rectangle<i32, Kind>) -> Self {
        Self {
            rects: self
                .rects
                .iter()
                .filter_map(|r| intersect_rects(r, &clip))
                .collect(),
        }
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut rv = Self::new();
        for a in &self.rects {
            for b in &other.rects {
                if let Some(r) = intersect_rects(a, b) {
                    rv.rects.push(r);
                }
            }
        }
        rv
    }

    pub fn subtract_rect(&self, hole: Rectangle<i32, Kind>) -> Self {
        Self {
            rects: self
                .rects
                .iter()
                .flat_map(|r| subtract_rects(r, &hole))
                .collect(),
        }
    }

    pub fn subtract(&self, other: &Self) -> Self {
        let mut rv = self.clone();
        for hole in &other.rects {
            rv = rv.subtract_rect(*hole);
            if rv.is_empty() {
                break;
            }
        }
        rv
    }

    pub fn translated(&self, offset: Point<i32, Kind>) -> Self {
        if self.is_infinite() {
            return Self::infinite();
        }

        Self {
            rects: self
                .rects
                .iter()
                .map(|r| {
                    let (x0, y0, x1, y1) = edges(r);
                    let (dx, dy) = (i64::from(offset.x), i64::from(offset.y));
                    from_edges(x0 + dx, y0 + dy, x1 + dx, y1 + dy)
                })
                .collect(),
        }
    }

    pub fn bounding_rect(&self) -> Option<Rectangle<i32, Kind>> {
        let mut iter = self.rects.iter().map(edges);
        let first = iter.next()?;
        let (x0, y0, x1, y1) = iter.fold(first, |(ax0, ay0, ax1, ay1), (x0, y0, x1, y1)| {
            (ax0.min(x0), ay0.min(y0), ax1.max(x1), ay1.max(y1))
        });
        Some(from_edges(x0, y0, x1, y1))
    }

    /// Number of pixels in the region.
    pub fn area(&self) -> i64 {
        self.rects
            .iter()
            .map(|r| i64::from(r.size.w) * i64::from(r.size.h))
            .sum()
    }

    pub fn contains_point(&self, point: Point<i32, Kind>) -> bool {
        self.rects.iter().any(|r| {
            let (x0, y0, x1, y1) = edges(r);
            let (x, y) = (i64::from(point.x), i64::from(point.y));
            x0 <= x && x < x1 && y0 <= y && y < y1
        })
    }

    /// Whether `other` is fully contained in this region.
    pub fn contains_region(&self, other: &Self) -> bool {
        other.subtract(self).is_empty()
    }

    fn map_rects<Other>(
        &self,
        f: impl Fn(f64, f64, f64, f64) -> (i64, i64, i64, i64),
    ) -> Region<Other> {
        if self.is_infinite() {
            return Region::infinite();
        }

        Region::from_rects(self.rects.iter().map(|r| {
            let (x0, y0, x1, y1) = edges(r);
            let (x0, y0, x1, y1) = f(x0 as f64, y0 as f64, x1 as f64, y1 as f64);
            from_edges(x0, y0, x1, y1)
        }))
    }
}

impl Region<Logical> {
    /// Maps to device pixels, rounding outwards so no touched pixel is lost.
    pub fn to_physical(&self, scale: f64) -> Region<Physical> {
        self.map_rects(|x0, y0, x1, y1| {
            (
                (x0 * scale).floor() as i64,
                (y0 * scale).floor() as i64,
                (x1 * scale).ceil() as i64,
                (y1 * scale).ceil() as i64,
            )
        })
    }
}

impl<Kind> Default for Region<Kind> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Kind> Clone for Region<Kind> {
    fn clone(&self) -> Self {
        Self {
            rects: self.rects.clone(),
        }
    }
}

/// Regions compare as pixel sets, independent of how they are split into rectangles.
impl<Kind> PartialEq for Region<Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.area() == other.area() && self.contains_region(other)
    }
}

impl<Kind> Eq for Region<Kind> {}

impl<Kind> From<Rectangle<i32, Kind>> for Region<Kind> {
    fn from(r: Rectangle<i32, Kind>) -> Self {
        Self::from_rect(r)
    }
}

impl<Kind> fmt::Debug for Region<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<Kind> fmt::Display for Region<Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            return f.write_str("[infinite]");
        }

        let mut rects: Vec<_> = self.rects.iter().map(edges).collect();
        rects.sort_unstable_by_key(|&(x0, y0, _, _)| (y0, x0));

        f.write_str("[")?;
        for (i, (x0, y0, x1, y1)) in rects.into_iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}x{}+{}+{}", x1 - x0, y1 - y0, x0, y0)?;
        }
        f.write_str("]")
    }
}
