use std::collections::HashSet;
use std::fmt;

use smithay::utils::{Logical, Physical, Point, Rectangle, Size};

use crate::utils::Region;
use crate::window::{Window, WindowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub(super) u32);

/// Returns `true` for windows a view must not show.
pub type WindowFilter = Box<dyn Fn(&Window) -> bool>;

/// A projection of part of the scene onto one output layer.
pub struct SceneView {
    viewport: Rectangle<i32, Logical>,
    scale: f64,
    filters: Vec<WindowFilter>,
    /// Windows the filters hid at the last evaluation.
    hidden: HashSet<WindowId>,
    damage: Region<Physical>,
}

impl SceneView {
    pub fn new(viewport: Rectangle<i32, Logical>, scale: f64) -> Self {
        Self {
            viewport,
            scale,
            filters: Vec::new(),
            hidden: HashSet::new(),
            // A new view has never been painted.
            damage: Region::infinite(),
        }
    }

    /// The scene area this view shows, in scene coordinates.
    pub fn viewport(&self) -> Rectangle<i32, Logical> {
        self.viewport
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn origin(&self) -> Point<i32, Logical> {
        self.viewport.loc
    }

    /// Size of the viewport in device pixels.
    pub fn device_size(&self) -> Size<i32, Physical> {
        let w = (f64::from(self.viewport.size.w) * self.scale).round() as i32;
        let h = (f64::from(self.viewport.size.h) * self.scale).round() as i32;
        Size::from((w.max(0), h.max(0)))
    }

    /// Moves or rescales the view. Everything it shows has to be repainted.
    pub fn set_viewport(&mut self, viewport: Rectangle<i32, Logical>, scale: f64) {
        if self.viewport == viewport && self.scale == scale {
            return;
        }
        self.viewport = viewport;
        self.scale = scale;
        self.damage = Region::infinite();
    }

    /// Hides every window for which `filter` returns `true`.
    ///
    /// Takes effect at the next scene dispatch.
    pub fn add_window_filter(&mut self, filter: impl Fn(&Window) -> bool + 'static) {
        self.filters.push(Box::new(filter));
    }

    pub fn should_hide_window(&self, window: &Window) -> bool {
        self.filters.iter().any(|filter| filter(window))
    }

    /// Whether the window was hidden at the last filter evaluation.
    pub fn is_hidden(&self, window: WindowId) -> bool {
        self.hidden.contains(&window)
    }

    /// Re-evaluates the filters for a window and returns whether the result flipped.
    pub(super) fn refresh_window(&mut self, window: &Window) -> bool {
        let hide = self.should_hide_window(window);
        let changed = if hide {
            self.hidden.insert(window.id())
        } else {
            self.hidden.remove(&window.id())
        };
        if changed {
            self.damage = Region::infinite();
        }
        changed
    }

    pub(super) fn forget_window(&mut self, window: WindowId) {
        self.hidden.remove(&window);
    }

    /// Maps a scene-space region into device pixels of this view.
    pub fn to_device(&self, region: &Region<Logical>) -> Region<Physical> {
        if region.is_infinite() {
            return Region::infinite();
        }
        region
            .intersect_rect(self.viewport)
            .translated(Point::from((-self.viewport.loc.x, -self.viewport.loc.y)))
            .to_physical(self.scale)
    }

    /// Adds scene-space damage.
    pub fn add_damage(&mut self, region: &Region<Logical>) {
        let device = self.to_device(region);
        self.add_device_damage(&device);
    }

    pub fn add_device_damage(&mut self, region: &Region<Physical>) {
        if region.is_infinite() {
            self.damage = Region::infinite();
        } else if !self.damage.is_infinite() {
            self.damage.add_region(region);
        }
    }

    pub fn damage(&self) -> &Region<Physical> {
        &self.damage
    }

    pub fn take_damage(&mut self) -> Region<Physical> {
        std::mem::take(&mut self.damage)
    }
}

impl fmt::Debug for SceneView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneView")
            .field("viewport", &self.viewport)
            .field("scale", &self.scale)
            .field("filters", &self.filters.len())
            .field("hidden", &self.hidden)
            .field("damage", &self.damage)
            .finish()
    }
}
