//! The scene graph.
//!
//! Items form a tree owned by the [`Scene`]: each item owns its children and refers to its parent
//! by id only. Mutations queue repaints in scene coordinates; [`Scene::dispatch()`] delivers them
//! to every [`SceneView`] once per event loop iteration. Damage added to an item is also merged
//! into all of its ancestors on the spot, so an ancestor's accumulated damage always covers its
//! descendants' damage.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use anyhow::Context;
use smithay::utils::{Buffer as BufferCoords, Logical, Physical, Point, Rectangle, Size};
use tracing::{trace, warn};

use crate::backend::allocator::Buffer;
use crate::effects::{WindowPaintData, WindowPaintFlags};
use crate::render_helpers::{Color, ItemRenderer, Texture};
use crate::utils::{rect, rect_intersection, to_device_rect, Region};
use crate::window::{Window, WindowId};

mod item;
pub mod quad;
mod view;

pub use item::{Item, ItemId, ItemKind, SurfaceContent};
pub use view::{SceneView, ViewId, WindowFilter};

use quad::Quad;

const BACKGROUND: Color = Color::BLACK;

#[derive(Debug)]
struct Repaint {
    region: Region<Logical>,
    window: Option<WindowId>,
}

/// One item prepared for painting into a view.
#[derive(Debug)]
struct PaintNode {
    item: ItemId,
    quads: Vec<Quad<Physical>>,
    bounds: Rectangle<i32, Physical>,
    clip: Option<Rectangle<i32, Physical>>,
    opacity: f32,
    opaque: Region<Physical>,
}

#[derive(Debug)]
pub struct Scene {
    items: HashMap<ItemId, Item>,
    root: ItemId,
    windows: BTreeMap<WindowId, Window>,
    views: BTreeMap<ViewId, SceneView>,
    pending: Vec<Repaint>,
    next_item_id: u32,
    next_window_id: u32,
    next_view_id: u32,
}

impl Scene {
    pub fn new() -> Self {
        let root = ItemId(0);
        let mut items = HashMap::new();
        items.insert(root, Item::new(None, None, ItemKind::Container));

        Self {
            items,
            root,
            windows: BTreeMap::new(),
            views: BTreeMap::new(),
            pending: Vec::new(),
            next_item_id: 1,
            next_window_id: 1,
            next_view_id: 1,
        }
    }

    /// The item everything else descends from. Its coordinates are scene coordinates.
    pub fn root(&self) -> ItemId {
        self.root
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.items.get(&id)
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn create_item(&mut self, parent: ItemId, kind: ItemKind) -> Option<ItemId> {
        let (window, visible) = {
            let parent = self.items.get(&parent)?;
            (parent.window, parent.effective_visible)
        };

        let id = ItemId(self.next_item_id);
        self.next_item_id += 1;

        let mut item = Item::new(Some(parent), window, kind);
        item.effective_visible = visible;
        self.items.insert(id, item);
        if let Some(parent) = self.items.get_mut(&parent) {
            parent.children.push(id);
        }
        Some(id)
    }

    /// Destroys an item with its whole subtree and repaints the hole it leaves.
    pub fn remove_item(&mut self, id: ItemId) -> bool {
        if id == self.root || !self.items.contains_key(&id) {
            return false;
        }

        if let Some(window) = self
            .windows
            .values()
            .find(|w| w.root() == id)
            .map(|w| w.id())
        {
            return self.remove_window(window);
        }

        self.remove_subtree(id);
        true
    }

    fn remove_subtree(&mut self, id: ItemId) {
        let footprint = self.footprint(id);
        let window = self.items.get(&id).and_then(|item| item.window);
        self.queue_repaint(footprint, window);

        self.detach(id);

        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if let Some(item) = self.items.remove(&id) {
                stack.extend(item.children);
            }
        }
    }

    fn detach(&mut self, id: ItemId) {
        let parent = self.items.get(&id).and_then(|item| item.parent);
        if let Some(parent) = parent.and_then(|p| self.items.get_mut(&p)) {
            parent.children.retain(|child| *child != id);
        }
    }

    pub fn add_window(&mut self, pid: Option<u32>, title: impl Into<String>) -> WindowId {
        let id = WindowId(self.next_window_id);
        self.next_window_id += 1;

        let root = ItemId(self.next_item_id);
        self.next_item_id += 1;
        let item = Item::new(Some(self.root), Some(id), ItemKind::Container);
        self.items.insert(root, item);
        if let Some(scene_root) = self.items.get_mut(&self.root) {
            scene_root.children.push(root);
        }

        self.windows
            .insert(id, Window::new(id, pid, title.into(), root));
        id
    }

    /// Unmaps a window, destroying its items.
    pub fn remove_window(&mut self, id: WindowId) -> bool {
        let Some(window) = self.windows.remove(&id) else {
            return false;
        };
        self.remove_subtree(window.root());
        for view in self.views.values_mut() {
            view.forget_window(id);
        }
        true
    }

    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.get(&id)
    }

    pub fn windows(&self) -> impl Iterator<Item = &Window> + '_ {
        self.windows.values()
    }

    /// Windows that pass the filters of a view.
    pub fn windows_in_view(&self, view: ViewId) -> Vec<&Window> {
        let Some(view) = self.views.get(&view) else {
            return Vec::new();
        };
        self.windows
            .values()
            .filter(|w| !view.is_hidden(w.id()))
            .collect()
    }

    pub fn set_exclude_from_capture(&mut self, id: WindowId, value: bool) {
        if let Some(window) = self.windows.get_mut(&id) {
            window.set_exclude_from_capture(value);
        }
    }

    pub fn add_view(&mut self, view: SceneView) -> ViewId {
        let id = ViewId(self.next_view_id);
        self.next_view_id += 1;
        self.views.insert(id, view);
        id
    }

    pub fn remove_view(&mut self, id: ViewId) -> Option<SceneView> {
        self.views.remove(&id)
    }

    pub fn view(&self, id: ViewId) -> Option<&SceneView> {
        self.views.get(&id)
    }

    pub fn view_mut(&mut self, id: ViewId) -> Option<&mut SceneView> {
        self.views.get_mut(&id)
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Origin of an item and its effective clip, both in scene coordinates.
    fn scene_transform(
        &self,
        id: ItemId,
    ) -> Option<(Point<i32, Logical>, Option<Rectangle<i32, Logical>>)> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            let item = self.items.get(&id)?;
            chain.push(item);
            current = item.parent;
        }

        let mut origin = Point::from((0, 0));
        let mut clip: Option<Rectangle<i32, Logical>> = None;
        for item in chain.into_iter().rev() {
            origin += item.position;
            if let Some(item_clip) = item.clip {
                let item_clip = Rectangle::new(item_clip.loc + origin, item_clip.size);
                clip = Some(match clip {
                    Some(clip) => {
                        rect_intersection(clip, item_clip).unwrap_or_else(|| rect(0, 0, 0, 0))
                    }
                    None => item_clip,
                });
            }
        }
        Some((origin, clip))
    }

    /// Rectangle enclosing the item and its visible descendants, in the item's coordinates.
    pub fn bounding_rect(&self, id: ItemId) -> Option<Rectangle<i32, Logical>> {
        let item = self.items.get(&id)?;

        let mut region = Region::from_rect(item.rect());
        for child_id in &item.children {
            let Some(child) = self.items.get(child_id) else {
                continue;
            };
            if !child.visible {
                continue;
            }
            let Some(mut bounds) = self.bounding_rect(*child_id) else {
                continue;
            };
            if let Some(clip) = child.clip {
                match rect_intersection(bounds, clip) {
                    Some(clipped) => bounds = clipped,
                    None => continue,
                }
            }
            region.add_rect(Rectangle::new(bounds.loc + child.position, bounds.size));
        }

        Some(
            region
                .bounding_rect()
                .unwrap_or_else(|| rect(0, 0, 0, 0)),
        )
    }

    /// The scene area an item currently covers on screen.
    fn footprint(&self, id: ItemId) -> Region<Logical> {
        let Some(item) = self.items.get(&id) else {
            return Region::new();
        };
        if !item.effective_visible {
            return Region::new();
        }
        let (Some((origin, clip)), Some(bounds)) =
            (self.scene_transform(id), self.bounding_rect(id))
        else {
            return Region::new();
        };

        let region = Region::from_rect(Rectangle::new(bounds.loc + origin, bounds.size));
        match clip {
            Some(clip) => region.intersect_rect(clip),
            None => region,
        }
    }

    fn queue_repaint(&mut self, region: Region<Logical>, window: Option<WindowId>) {
        if region.is_empty() {
            return;
        }
        if let Some(last) = self.pending.last_mut() {
            if last.window == window {
                last.region.add_region(&region);
                return;
            }
        }
        self.pending.push(Repaint { region, window });
    }

    /// Marks part of an item as changed, in the item's coordinates.
    pub fn add_damage(&mut self, id: ItemId, region: &Region<Logical>) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if !item.effective_visible || region.is_empty() {
            return;
        }

        let window = item.window;
        let mut region = match item.clip {
            Some(clip) => region.intersect_rect(clip),
            None => region.clone(),
        };
        item.damage.add_region(&region);

        let mut current = id;
        loop {
            let Some(item) = self.items.get(&current) else {
                return;
            };
            let Some(parent) = item.parent else {
                break;
            };
            region = region.translated(item.position);

            let Some(parent_item) = self.items.get_mut(&parent) else {
                return;
            };
            if let Some(clip) = parent_item.clip {
                region = region.intersect_rect(clip);
            }
            parent_item.damage.add_region(&region);
            current = parent;
        }

        self.queue_repaint(region, window);
    }

    /// Repaints the whole area of an item and its children.
    pub fn schedule_repaint(&mut self, id: ItemId) {
        if let Some(bounds) = self.bounding_rect(id) {
            self.add_damage(id, &Region::from_rect(bounds));
        }
    }

    /// Runs `f` on an item, repainting both the area it covered before and the area it covers
    /// after.
    fn with_footprint_repaint(&mut self, id: ItemId, f: impl FnOnce(&mut Self)) {
        let window = self.items.get(&id).and_then(|item| item.window);
        let mut region = self.footprint(id);
        f(self);
        region.add_region(&self.footprint(id));
        self.queue_repaint(region, window);
    }

    pub fn set_position(&mut self, id: ItemId, position: Point<i32, Logical>) {
        if self.items.get(&id).map_or(true, |item| item.position == position) {
            return;
        }
        self.with_footprint_repaint(id, |scene| {
            if let Some(item) = scene.items.get_mut(&id) {
                item.position = position;
            }
        });
    }

    pub fn set_size(&mut self, id: ItemId, size: Size<i32, Logical>) {
        let size = Size::from((size.w.max(0), size.h.max(0)));
        if self.items.get(&id).map_or(true, |item| item.size == size) {
            return;
        }
        self.with_footprint_repaint(id, |scene| {
            if let Some(item) = scene.items.get_mut(&id) {
                item.size = size;
            }
        });
    }

    pub fn set_geometry(&mut self, id: ItemId, geometry: Rectangle<i32, Logical>) {
        let size = Size::from((geometry.size.w.max(0), geometry.size.h.max(0)));
        if self
            .items
            .get(&id)
            .map_or(true, |item| item.position == geometry.loc && item.size == size)
        {
            return;
        }
        self.with_footprint_repaint(id, |scene| {
            if let Some(item) = scene.items.get_mut(&id) {
                item.position = geometry.loc;
                item.size = size;
            }
        });
    }

    /// Sets the stacking key among siblings. Equal keys keep insertion order.
    pub fn set_z(&mut self, id: ItemId, z: i32) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if item.z == z {
            return;
        }
        item.z = z;
        let window = item.window;
        let footprint = self.footprint(id);
        self.queue_repaint(footprint, window);
    }

    /// Puts an item directly above a sibling.
    pub fn stack_above(&mut self, id: ItemId, sibling: ItemId) -> bool {
        self.restack(id, sibling, 1)
    }

    /// Puts an item directly below a sibling.
    pub fn stack_below(&mut self, id: ItemId, sibling: ItemId) -> bool {
        self.restack(id, sibling, 0)
    }

    fn restack(&mut self, id: ItemId, sibling: ItemId, offset: usize) -> bool {
        if id == sibling {
            return false;
        }
        let (Some(item), Some(other)) = (self.items.get(&id), self.items.get(&sibling)) else {
            return false;
        };
        let Some(parent) = item.parent.filter(|p| Some(*p) == other.parent) else {
            warn!("cannot restack items with different parents");
            return false;
        };
        let z = other.z;

        let Some(parent) = self.items.get_mut(&parent) else {
            return false;
        };
        parent.children.retain(|child| *child != id);
        let Some(index) = parent.children.iter().position(|child| *child == sibling) else {
            return false;
        };
        parent.children.insert(index + offset, id);

        if let Some(item) = self.items.get_mut(&id) {
            item.z = z;
        }
        for id in [id, sibling] {
            let window = self.items.get(&id).and_then(|item| item.window);
            let footprint = self.footprint(id);
            self.queue_repaint(footprint, window);
        }
        true
    }

    pub fn set_visible(&mut self, id: ItemId, visible: bool) {
        let Some(item) = self.items.get(&id) else {
            return;
        };
        if item.visible == visible {
            return;
        }
        let parent_visible = item
            .parent
            .and_then(|p| self.items.get(&p))
            .map_or(true, |parent| parent.effective_visible);

        self.with_footprint_repaint(id, |scene| {
            if let Some(item) = scene.items.get_mut(&id) {
                item.visible = visible;
            }
            scene.update_effective_visibility(id, parent_visible);
        });
    }

    fn update_effective_visibility(&mut self, id: ItemId, parent_visible: bool) {
        let mut stack = vec![(id, parent_visible)];
        while let Some((id, parent_visible)) = stack.pop() {
            let Some(item) = self.items.get_mut(&id) else {
                continue;
            };
            item.effective_visible = parent_visible && item.visible;
            let visible = item.effective_visible;
            stack.extend(item.children.iter().map(|child| (*child, visible)));
        }
    }

    pub fn set_opacity(&mut self, id: ItemId, opacity: f64) {
        let opacity = opacity.clamp(0., 1.);
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        if item.opacity == opacity {
            return;
        }
        item.opacity = opacity;
        self.schedule_repaint(id);
    }

    pub fn set_clip(&mut self, id: ItemId, clip: Option<Rectangle<i32, Logical>>) {
        if self.items.get(&id).map_or(true, |item| item.clip == clip) {
            return;
        }
        self.with_footprint_repaint(id, |scene| {
            if let Some(item) = scene.items.get_mut(&id) {
                item.clip = clip;
            }
        });
    }

    pub fn set_color(&mut self, id: ItemId, color: Color) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        let ItemKind::SolidRect(current) = &mut item.kind else {
            return;
        };
        if *current == color {
            return;
        }
        *current = color;
        let bounds = item.rect();
        self.add_damage(id, &Region::from_rect(bounds));
    }

    /// Replaces the texture of a textured item. The previous texture is dropped.
    pub fn set_texture(&mut self, id: ItemId, texture: Option<Texture>) -> bool {
        let Some(item) = self.items.get_mut(&id) else {
            return false;
        };
        let Some(slot) = item.texture_mut() else {
            return false;
        };
        *slot = texture;
        let bounds = item.rect();
        self.add_damage(id, &Region::from_rect(bounds));
        true
    }

    pub fn set_opaque_region(&mut self, id: ItemId, region: Region<Logical>) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        let ItemKind::Surface(content) = &mut item.kind else {
            return;
        };
        if content.opaque_region == region {
            return;
        }
        content.opaque_region = region;
        let bounds = item.rect();
        self.add_damage(id, &Region::from_rect(bounds));
    }

    /// Uploads the damaged part of new surface contents.
    ///
    /// Returns `false` if the texture cannot be updated in place.
    pub fn commit_surface(
        &mut self,
        id: ItemId,
        pixels: &[u8],
        stride: usize,
        damage: &Region<BufferCoords>,
    ) -> bool {
        let _span = tracy_client::span!("Scene::commit_surface");

        let Some(item) = self.items.get_mut(&id) else {
            return false;
        };
        let size = item.size;
        let Some(Some(texture)) = item.texture_mut() else {
            return false;
        };
        if !texture.update(pixels, stride, damage) {
            return false;
        }

        let tex_size = texture.size();
        let sx = f64::from(size.w) / f64::from(tex_size.w.max(1));
        let sy = f64::from(size.h) / f64::from(tex_size.h.max(1));
        let local = Region::from_rects(damage.rects().map(|r| {
            let x0 = (f64::from(r.loc.x) * sx).floor() as i32;
            let y0 = (f64::from(r.loc.y) * sy).floor() as i32;
            let x1 = (f64::from(r.loc.x + r.size.w) * sx).ceil() as i32;
            let y1 = (f64::from(r.loc.y + r.size.h) * sy).ceil() as i32;
            rect(x0, y0, x1 - x0, y1 - y0)
        }));
        self.add_damage(id, &local);
        true
    }

    /// Moves an item under a new parent, keeping its relative position.
    pub fn reparent(&mut self, id: ItemId, new_parent: ItemId) -> bool {
        if id == self.root || !self.items.contains_key(&id) {
            return false;
        }
        // Refuse to create a cycle.
        let mut current = Some(new_parent);
        while let Some(ancestor) = current {
            if ancestor == id {
                return false;
            }
            let Some(item) = self.items.get(&ancestor) else {
                return false;
            };
            current = item.parent;
        }

        let (window, parent_visible) = {
            let Some(parent) = self.items.get(&new_parent) else {
                return false;
            };
            (parent.window, parent.effective_visible)
        };

        self.with_footprint_repaint(id, |scene| {
            scene.detach(id);
            if let Some(parent) = scene.items.get_mut(&new_parent) {
                parent.children.push(id);
            }
            if let Some(item) = scene.items.get_mut(&id) {
                item.parent = Some(new_parent);
            }
            scene.update_effective_visibility(id, parent_visible);

            let mut stack = vec![id];
            while let Some(id) = stack.pop() {
                if let Some(item) = scene.items.get_mut(&id) {
                    item.window = window;
                    stack.extend(item.children.iter().copied());
                }
            }
        });
        true
    }

    /// Delivers queued repaints to the views.
    ///
    /// Window filters are re-evaluated first; a view whose filter result flipped for any window
    /// repaints entirely. Returns the views that have damage afterwards.
    pub fn dispatch(&mut self) -> Vec<ViewId> {
        let _span = tracy_client::span!("Scene::dispatch");

        for view in self.views.values_mut() {
            for window in self.windows.values() {
                if view.refresh_window(window) {
                    trace!("filter result flipped for {:?}", window.id());
                }
            }
        }

        for Repaint { region, window } in self.pending.drain(..) {
            for view in self.views.values_mut() {
                if window.is_some_and(|w| view.is_hidden(w)) {
                    continue;
                }
                view.add_damage(&region);
            }
        }

        for item in self.items.values_mut() {
            item.damage.clear();
        }

        self.views
            .iter()
            .filter(|(_, view)| !view.damage().is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_nodes(
        &self,
        view: &SceneView,
        windows: &HashMap<WindowId, WindowPaintData>,
        id: ItemId,
        parent_origin: Point<i32, Logical>,
        parent_clip: Option<Rectangle<i32, Logical>>,
        parent_opacity: f64,
        parent_translucent: bool,
        out: &mut Vec<PaintNode>,
    ) {
        let Some(item) = self.items.get(&id) else {
            return;
        };
        if !item.visible {
            return;
        }

        let mut opacity = parent_opacity * item.opacity;
        let mut translucent = parent_translucent;
        if let Some(window) = item.window.and_then(|w| self.windows.get(&w)) {
            if window.root() == id {
                if view.is_hidden(window.id()) {
                    return;
                }
                let data = windows.get(&window.id()).copied().unwrap_or_default();
                if data.flags.contains(WindowPaintFlags::DISABLED) {
                    return;
                }
                opacity *= data.opacity;
                translucent |= data.flags.contains(WindowPaintFlags::TRANSLUCENT);
            }
        }

        let origin = parent_origin + item.position;
        let clip = match item.clip {
            Some(own) => {
                let own = Rectangle::new(own.loc + origin, own.size);
                match parent_clip {
                    Some(parent) => {
                        Some(rect_intersection(parent, own).unwrap_or_else(|| rect(0, 0, 0, 0)))
                    }
                    None => Some(own),
                }
            }
            None => parent_clip,
        };

        let quads: Vec<_> = item
            .quads()
            .into_iter()
            .map(|quad| quad.translated(origin).to_device(view.origin(), view.scale()))
            .collect();
        if !quads.is_empty() && opacity > 0. {
            let geometry = Rectangle::new(origin, item.size);
            // Outward rounding at fractional scales would let partly covered pixels occlude.
            let integral_scale = view.scale().fract() == 0.;
            let opaque = if !translucent && opacity >= 1. && integral_scale {
                let opaque = item.opaque_region().translated(origin);
                let opaque = match clip {
                    Some(clip) => opaque.intersect_rect(clip),
                    None => opaque,
                };
                view.to_device(&opaque)
            } else {
                Region::new()
            };

            out.push(PaintNode {
                item: id,
                quads,
                bounds: to_device_rect(geometry, view.origin(), view.scale()),
                clip: clip.map(|clip| to_device_rect(clip, view.origin(), view.scale())),
                opacity: opacity as f32,
                opaque,
            });
        }

        let mut children = item.children.clone();
        children.sort_by_key(|child| self.items.get(child).map_or(0, |item| item.z));
        for child in children {
            self.collect_nodes(
                view,
                windows,
                child,
                origin,
                clip,
                opacity,
                translucent,
                out,
            );
        }
    }

    /// Finds a client buffer that can be shown on the whole view without composition.
    ///
    /// That is the buffer of the top-most item, if that item is a DMA-BUF surface whose opaque
    /// part covers the entire view.
    pub fn scanout_candidate(
        &self,
        view: ViewId,
        windows: &HashMap<WindowId, WindowPaintData>,
    ) -> Option<Rc<Buffer>> {
        let view = self.views.get(&view)?;

        let mut nodes = Vec::new();
        self.collect_nodes(
            view,
            windows,
            self.root,
            Point::from((0, 0)),
            None,
            1.,
            false,
            &mut nodes,
        );

        let screen = Rectangle::from_size(view.device_size());
        let top = nodes
            .iter()
            .rev()
            .find(|node| rect_intersection(node.bounds, screen).is_some())?;
        if !top.opaque.contains_region(&Region::from_rect(screen)) {
            return None;
        }

        let item = self.items.get(&top.item)?;
        if !matches!(item.kind, ItemKind::Surface(_)) {
            return None;
        }
        let buffer = item.texture()?.buffer()?;
        buffer.is_dmabuf().then(|| buffer.clone())
    }

    /// Paints a view into `target`, touching only pixels inside `repaint`.
    ///
    /// Items fully hidden behind opaque items above them are skipped. Returns the region that was
    /// actually painted.
    pub fn paint(
        &self,
        view: ViewId,
        renderer: &mut dyn ItemRenderer,
        target: &mut Buffer,
        repaint: &Region<Physical>,
        windows: &HashMap<WindowId, WindowPaintData>,
    ) -> anyhow::Result<Region<Physical>> {
        let _span = tracy_client::span!("Scene::paint");

        let view = self.views.get(&view).context("view does not exist")?;
        let repaint = repaint.intersect_rect(Rectangle::from_size(target.size()));

        let mut nodes = Vec::new();
        self.collect_nodes(
            view,
            windows,
            self.root,
            Point::from((0, 0)),
            None,
            1.,
            false,
            &mut nodes,
        );

        // Walk top to bottom, handing each node what is still uncovered.
        let mut uncovered = repaint.clone();
        let mut clips = Vec::with_capacity(nodes.len());
        for node in nodes.iter().rev() {
            let mut clip = uncovered.intersect_rect(node.bounds);
            if let Some(item_clip) = node.clip {
                clip = clip.intersect_rect(item_clip);
            }
            clips.push(clip);
            if !node.opaque.is_empty() {
                uncovered = uncovered.subtract(&node.opaque);
            }
        }
        clips.reverse();

        renderer
            .begin_frame(target)
            .context("error starting the frame")?;
        renderer.clear(target, &uncovered, BACKGROUND);
        for (node, clip) in nodes.iter().zip(&clips) {
            if clip.is_empty() {
                trace!("{:?} is occluded", node.item);
                continue;
            }
            let texture = self.items.get(&node.item).and_then(|item| item.texture());
            for quad in &node.quads {
                renderer.draw_quad(target, quad, texture, clip, node.opacity);
            }
        }
        renderer
            .end_frame(target)
            .context("error finishing the frame")?;

        Ok(repaint)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use proptest::prelude::*;
    use smithay::backend::allocator::Fourcc;

    use super::*;
    use crate::backend::allocator::{Allocator, MemoryAllocator};
    use crate::render_helpers::renderer::{DrawOp, NullRenderer};

    fn solid(scene: &mut Scene, parent: ItemId, geometry: Rectangle<i32, Logical>) -> ItemId {
        let id = scene
            .create_item(parent, ItemKind::SolidRect(Color::BLACK))
            .unwrap();
        scene.set_geometry(id, geometry);
        id
    }

    fn scene_with_view(viewport: Rectangle<i32, Logical>) -> (Scene, ViewId) {
        let mut scene = Scene::new();
        let view = scene.add_view(SceneView::new(viewport, 1.));
        scene.dispatch();
        scene.view_mut(view).unwrap().take_damage();
        (scene, view)
    }

    fn target(w: i32, h: i32) -> Buffer {
        MemoryAllocator::new()
            .create_buffer(Size::from((w, h)), Fourcc::Xrgb8888, &[])
            .unwrap()
    }

    fn painted_quads(scene: &Scene, view: ViewId) -> Vec<Rectangle<i32, Physical>> {
        let mut renderer = NullRenderer::new();
        let mut buffer = target(100, 100);
        scene
            .paint(
                view,
                &mut renderer,
                &mut buffer,
                &Region::infinite(),
                &HashMap::new(),
            )
            .unwrap();
        renderer
            .ops()
            .iter()
            .filter_map(|op| match op {
                DrawOp::Quad { geometry, .. } => Some(*geometry),
                DrawOp::Clear(_) => None,
            })
            .collect()
    }

    #[test]
    fn moving_item_repaints_old_and_new_position() {
        let (mut scene, view) = scene_with_view(rect(0, 0, 100, 100));
        let window = scene.add_window(None, "a");
        let root = scene.window(window).unwrap().root();
        let item = solid(&mut scene, root, rect(0, 0, 10, 10));
        scene.dispatch();
        scene.view_mut(view).unwrap().take_damage();

        scene.set_position(item, Point::from((50, 0)));
        assert_eq!(scene.dispatch(), vec![view]);
        let damage = scene.view_mut(view).unwrap().take_damage();
        assert_snapshot!(damage, @"[10x10+0+0, 10x10+50+0]");
    }

    #[test]
    fn hiding_parent_repaints_hole() {
        let (mut scene, view) = scene_with_view(rect(0, 0, 100, 100));
        let root = scene.root();
        let parent = solid(&mut scene, root, rect(10, 10, 20, 20));
        let child = solid(&mut scene, parent, rect(30, 0, 10, 10));
        scene.dispatch();
        scene.view_mut(view).unwrap().take_damage();

        scene.set_visible(parent, false);
        assert!(!scene.item(child).unwrap().is_visible());
        scene.dispatch();
        let damage = scene.view_mut(view).unwrap().take_damage();
        assert_eq!(damage, Region::from_rect(rect(10, 10, 40, 20)));

        // Damage on invisible items goes nowhere.
        scene.add_damage(child, &Region::from_rect(rect(0, 0, 5, 5)));
        assert!(scene.dispatch().is_empty());

        scene.set_visible(parent, true);
        assert!(scene.item(child).unwrap().is_visible());
    }

    #[test]
    fn removing_window_repaints_every_view() {
        let mut scene = Scene::new();
        let left = scene.add_view(SceneView::new(rect(0, 0, 100, 100), 1.));
        let right = scene.add_view(SceneView::new(rect(100, 0, 100, 100), 1.));
        let window = scene.add_window(Some(1), "a");
        let root = scene.window(window).unwrap().root();
        solid(&mut scene, root, rect(90, 0, 20, 10));
        scene.dispatch();
        scene.view_mut(left).unwrap().take_damage();
        scene.view_mut(right).unwrap().take_damage();

        assert!(scene.remove_window(window));
        assert!(scene.window(window).is_none());
        assert_eq!(scene.item_count(), 1);

        assert_eq!(scene.dispatch(), vec![left, right]);
        assert_snapshot!(scene.view_mut(left).unwrap().take_damage(), @"[10x10+90+0]");
        assert_snapshot!(scene.view_mut(right).unwrap().take_damage(), @"[10x10+0+0]");
    }

    #[test]
    fn degenerate_item_paints_nothing() {
        let (mut scene, view) = scene_with_view(rect(0, 0, 10, 10));
        let root = scene.root();
        solid(&mut scene, root, rect(0, 0, 0, 10));
        scene.dispatch();

        let mut renderer = NullRenderer::new();
        let mut buffer = target(10, 10);
        scene
            .paint(
                view,
                &mut renderer,
                &mut buffer,
                &Region::infinite(),
                &HashMap::new(),
            )
            .unwrap();
        assert_eq!(
            renderer.ops(),
            &[DrawOp::Clear(Region::from_rect(rect(0, 0, 10, 10)))]
        );
    }

    #[test]
    fn occluded_items_are_skipped() {
        let (mut scene, view) = scene_with_view(rect(0, 0, 100, 100));
        let below = scene.add_window(None, "below");
        let above = scene.add_window(None, "above");
        let below_root = scene.window(below).unwrap().root();
        let above_root = scene.window(above).unwrap().root();
        solid(&mut scene, below_root, rect(10, 10, 20, 20));
        solid(&mut scene, above_root, rect(0, 0, 50, 50));
        scene.dispatch();

        let mut renderer = NullRenderer::new();
        let mut buffer = target(100, 100);
        let repaint = Region::from_rect(rect(0, 0, 100, 100));
        scene
            .paint(view, &mut renderer, &mut buffer, &repaint, &HashMap::new())
            .unwrap();
        // Background outside the opaque window, then only the top window.
        assert_eq!(renderer.ops().len(), 2);
        assert!(matches!(
            renderer.ops()[1],
            DrawOp::Quad { geometry, .. } if geometry == rect(0, 0, 50, 50)
        ));

        // An effect making the top window translucent uncovers the lower one.
        let mut data = HashMap::new();
        data.insert(
            above,
            WindowPaintData {
                flags: WindowPaintFlags::TRANSLUCENT,
                opacity: 1.,
            },
        );
        scene
            .paint(view, &mut renderer, &mut buffer, &repaint, &data)
            .unwrap();
        assert_eq!(renderer.ops().len(), 3);
    }

    #[test]
    fn property_changes_repaint_and_uncover() {
        let (mut scene, view) = scene_with_view(rect(0, 0, 100, 100));
        let root = scene.root();
        let below = solid(&mut scene, root, rect(0, 0, 20, 20));
        let above = solid(&mut scene, root, rect(5, 5, 10, 10));
        scene.dispatch();
        scene.view_mut(view).unwrap().take_damage();

        scene.set_color(above, Color::BLACK);
        assert!(scene.dispatch().is_empty());

        scene.set_color(above, Color::new(1., 0., 0., 1.));
        assert_eq!(scene.dispatch(), vec![view]);
        assert_snapshot!(scene.view_mut(view).unwrap().take_damage(), @"[10x10+5+5]");

        assert!(scene.stack_above(below, above));
        scene.dispatch();
        assert_snapshot!(scene.view_mut(view).unwrap().take_damage(), @"[20x20+0+0]");
        assert_eq!(painted_quads(&scene, view), vec![rect(0, 0, 20, 20)]);

        scene.set_opacity(below, 0.5);
        assert_eq!(scene.dispatch(), vec![view]);
        assert_eq!(
            painted_quads(&scene, view),
            vec![rect(5, 5, 10, 10), rect(0, 0, 20, 20)]
        );
    }

    #[test]
    fn declared_opaque_region_hides_what_is_below() {
        let (mut scene, view) = scene_with_view(rect(0, 0, 100, 100));
        let root = scene.root();
        solid(&mut scene, root, rect(2, 2, 10, 10));
        let surface = scene.create_item(root, ItemKind::surface()).unwrap();
        scene.set_geometry(surface, rect(0, 0, 20, 20));
        let texture = Texture::solid(Size::from((20, 20)), [255, 255, 255, 128]).unwrap();
        assert!(scene.set_texture(surface, Some(texture)));
        scene.dispatch();
        assert!(painted_quads(&scene, view).contains(&rect(2, 2, 10, 10)));

        scene.set_opaque_region(surface, Region::from_rect(rect(0, 0, 20, 20)));
        assert_eq!(scene.dispatch(), vec![view]);
        assert!(!painted_quads(&scene, view).contains(&rect(2, 2, 10, 10)));
    }

    #[test]
    fn z_order_is_stable() {
        let (mut scene, view) = scene_with_view(rect(0, 0, 10, 10));
        let root = scene.root();
        let a = solid(&mut scene, root, rect(0, 0, 1, 1));
        let b = solid(&mut scene, root, rect(1, 0, 1, 1));
        let c = solid(&mut scene, root, rect(2, 0, 1, 1));
        scene.set_z(a, 1);
        assert!(scene.stack_below(c, b));
        scene.dispatch();

        let mut renderer = NullRenderer::new();
        let mut buffer = target(10, 10);
        scene
            .paint(
                view,
                &mut renderer,
                &mut buffer,
                &Region::infinite(),
                &HashMap::new(),
            )
            .unwrap();
        let order: Vec<_> = renderer
            .ops()
            .iter()
            .filter_map(|op| match op {
                DrawOp::Quad { geometry, .. } => Some(geometry.loc.x),
                DrawOp::Clear(_) => None,
            })
            .collect();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn reparent_refuses_cycles() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = solid(&mut scene, root, rect(0, 0, 10, 10));
        let b = solid(&mut scene, a, rect(0, 0, 5, 5));
        assert!(!scene.reparent(a, b));
        assert!(!scene.reparent(root, a));
        assert!(scene.reparent(b, root));
        assert_eq!(scene.item(b).unwrap().parent(), Some(root));
        assert!(scene.item(a).unwrap().children().is_empty());
    }

    #[test]
    fn clip_limits_damage_and_bounds() {
        let (mut scene, view) = scene_with_view(rect(0, 0, 100, 100));
        let root = scene.root();
        let parent = solid(&mut scene, root, rect(0, 0, 10, 10));
        scene.set_clip(parent, Some(rect(0, 0, 10, 10)));
        let child = solid(&mut scene, parent, rect(5, 5, 20, 20));
        scene.dispatch();
        scene.view_mut(view).unwrap().take_damage();

        scene.add_damage(child, &Region::from_rect(rect(0, 0, 20, 20)));
        scene.dispatch();
        assert_snapshot!(scene.view_mut(view).unwrap().take_damage(), @"[5x5+5+5]");
    }

    #[test]
    fn surface_commit_damages_scaled_area() {
        let (mut scene, view) = scene_with_view(rect(0, 0, 100, 100));
        let root = scene.root();
        let surface = scene.create_item(root, ItemKind::surface()).unwrap();
        scene.set_geometry(surface, rect(0, 0, 20, 20));
        let texture = Texture::solid(Size::from((10, 10)), [0, 0, 0, 255]).unwrap();
        assert!(scene.set_texture(surface, Some(texture)));
        scene.dispatch();
        scene.view_mut(view).unwrap().take_damage();

        let pixels = vec![255; 10 * 10 * 4];
        let damage = Region::from_rect(rect(1, 1, 2, 2));
        assert!(scene.commit_surface(surface, &pixels, 40, &damage));
        scene.dispatch();
        assert_snapshot!(scene.view_mut(view).unwrap().take_damage(), @"[4x4+2+2]");
    }

    fn arb_tree() -> impl Strategy<Value = Vec<(usize, i32, i32, i32, i32, i32, i32)>> {
        // (parent index, x, y, damage x, y, w, h)
        prop::collection::vec(
            (
                0usize..8,
                -50..50,
                -50..50,
                -20..20,
                -20..20,
                1..30,
                1..30,
            ),
            1..8,
        )
    }

    #[test]
    fn fullscreen_dmabuf_surface_is_scanout_candidate() {
        use smithay::backend::allocator::Modifier;

        use crate::backend::allocator::DmabufPlane;

        let (mut scene, view) = scene_with_view(rect(0, 0, 100, 100));
        let window = scene.add_window(Some(7), "game");
        let root = scene.window(window).unwrap().root();
        let surface = scene.create_item(root, ItemKind::surface()).unwrap();
        scene.set_geometry(surface, rect(0, 0, 100, 100));

        let plane = DmabufPlane {
            handle: 1,
            offset: 0,
            stride: 400,
        };
        let buffer = Rc::new(Buffer::dmabuf(
            Size::from((100, 100)),
            Fourcc::Xrgb8888,
            Modifier::Linear,
            vec![plane],
        ));
        scene.set_texture(surface, Some(Texture::from_buffer(buffer.clone())));

        let windows = HashMap::new();
        let candidate = scene.scanout_candidate(view, &windows).unwrap();
        assert_eq!(candidate.id(), buffer.id());

        // Anything on top prevents scanout.
        let scene_root = scene.root();
        let overlay = solid(&mut scene, scene_root, rect(90, 90, 5, 5));
        assert!(scene.scanout_candidate(view, &windows).is_none());
        scene.remove_item(overlay);

        // So does an effect making the window translucent.
        let mut translucent = HashMap::new();
        translucent.insert(
            window,
            WindowPaintData {
                flags: WindowPaintFlags::TRANSLUCENT,
                opacity: 1.,
            },
        );
        assert!(scene.scanout_candidate(view, &translucent).is_none());
        assert!(scene.scanout_candidate(view, &windows).is_some());
    }

    proptest! {
        #[test]
        fn root_damage_is_union_of_transformed_child_damage(tree in arb_tree()) {
            let mut scene = Scene::new();
            let root = scene.root();
            let mut ids = vec![root];
            let mut origins = vec![Point::<i32, Logical>::from((0, 0))];

            for &(parent, x, y, ..) in &tree {
                let parent = parent % ids.len();
                let id = scene.create_item(ids[parent], ItemKind::Container).unwrap();
                scene.set_position(id, Point::from((x, y)));
                ids.push(id);
                origins.push(origins[parent] + Point::from((x, y)));
            }
            scene.dispatch();

            let mut expected = Region::new();
            for (i, &(_, _, _, dx, dy, w, h)) in tree.iter().enumerate() {
                let damage = Region::from_rect(rect(dx, dy, w, h));
                scene.add_damage(ids[i + 1], &damage);
                expected.add_region(&damage.translated(origins[i + 1]));
            }

            prop_assert_eq!(scene.item(root).unwrap().damage(), &expected);
        }
    }
}
