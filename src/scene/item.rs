use smithay::utils::{Logical, Point, Rectangle, Size};

use super::quad::{nine_patch_quads, solid_quads, texture_quads, Insets, Quad};
use crate::render_helpers::{Color, Texture};
use crate::utils::Region;
use crate::window::WindowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub(super) u32);

/// Client surface content.
#[derive(Debug, Default)]
pub struct SurfaceContent {
    pub texture: Option<Texture>,
    /// Part of the surface the client declared opaque, in item coordinates.
    pub opaque_region: Region<Logical>,
}

#[derive(Debug)]
pub enum ItemKind {
    /// Only groups children.
    Container,
    SolidRect(Color),
    Surface(SurfaceContent),
    /// Decoration or shadow texture with fixed corners.
    NinePatch {
        texture: Option<Texture>,
        insets: Insets,
    },
    Cursor {
        texture: Option<Texture>,
        hotspot: Point<i32, Logical>,
    },
}

impl ItemKind {
    pub fn surface() -> Self {
        Self::Surface(SurfaceContent::default())
    }
}

/// A node of the scene graph.
#[derive(Debug)]
pub struct Item {
    pub(super) parent: Option<ItemId>,
    pub(super) children: Vec<ItemId>,
    pub(super) window: Option<WindowId>,
    pub(super) position: Point<i32, Logical>,
    pub(super) size: Size<i32, Logical>,
    pub(super) z: i32,
    pub(super) visible: bool,
    pub(super) effective_visible: bool,
    pub(super) opacity: f64,
    pub(super) clip: Option<Rectangle<i32, Logical>>,
    pub(super) damage: Region<Logical>,
    pub(super) kind: ItemKind,
}

impl Item {
    pub(super) fn new(parent: Option<ItemId>, window: Option<WindowId>, kind: ItemKind) -> Self {
        Self {
            parent,
            children: Vec::new(),
            window,
            position: Point::from((0, 0)),
            size: Size::from((0, 0)),
            z: 0,
            visible: true,
            effective_visible: true,
            opacity: 1.,
            clip: None,
            damage: Region::new(),
            kind,
        }
    }

    pub fn parent(&self) -> Option<ItemId> {
        self.parent
    }

    pub fn children(&self) -> &[ItemId] {
        &self.children
    }

    pub fn window(&self) -> Option<WindowId> {
        self.window
    }

    /// Position relative to the parent.
    pub fn position(&self) -> Point<i32, Logical> {
        self.position
    }

    pub fn size(&self) -> Size<i32, Logical> {
        self.size
    }

    /// The item's own rectangle in its local coordinates.
    pub fn rect(&self) -> Rectangle<i32, Logical> {
        Rectangle::from_size(self.size)
    }

    /// Geometry relative to the parent.
    pub fn geometry(&self) -> Rectangle<i32, Logical> {
        Rectangle::new(self.position, self.size)
    }

    pub fn z(&self) -> i32 {
        self.z
    }

    /// Whether this item and all of its ancestors are visible.
    pub fn is_visible(&self) -> bool {
        self.effective_visible
    }

    pub fn opacity(&self) -> f64 {
        self.opacity
    }

    /// Clip rectangle in local coordinates, applying to the item and its children.
    pub fn clip(&self) -> Option<Rectangle<i32, Logical>> {
        self.clip
    }

    /// Damage accumulated since the scene last delivered it, in local coordinates.
    pub fn damage(&self) -> &Region<Logical> {
        &self.damage
    }

    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    pub fn texture(&self) -> Option<&Texture> {
        match &self.kind {
            ItemKind::Surface(content) => content.texture.as_ref(),
            ItemKind::NinePatch { texture, .. } | ItemKind::Cursor { texture, .. } => {
                texture.as_ref()
            }
            ItemKind::Container | ItemKind::SolidRect(_) => None,
        }
    }

    pub(super) fn texture_mut(&mut self) -> Option<&mut Option<Texture>> {
        match &mut self.kind {
            ItemKind::Surface(content) => Some(&mut content.texture),
            ItemKind::NinePatch { texture, .. } | ItemKind::Cursor { texture, .. } => Some(texture),
            ItemKind::Container | ItemKind::SolidRect(_) => None,
        }
    }

    /// Quads in local coordinates. Empty for containers and degenerate sizes.
    pub fn quads(&self) -> Vec<Quad<Logical>> {
        match &self.kind {
            ItemKind::Container => Vec::new(),
            ItemKind::SolidRect(color) => solid_quads(self.size, *color),
            ItemKind::NinePatch {
                texture: Some(texture),
                insets,
            } => nine_patch_quads(self.size, texture.size(), *insets),
            ItemKind::Surface(SurfaceContent {
                texture: Some(texture),
                ..
            })
            | ItemKind::Cursor {
                texture: Some(texture),
                ..
            } => texture_quads(self.size, texture.size()),
            _ => Vec::new(),
        }
    }

    /// The part of the item guaranteed to hide what is below, in local coordinates.
    pub fn opaque_region(&self) -> Region<Logical> {
        if self.opacity < 1. {
            return Region::new();
        }

        match &self.kind {
            ItemKind::SolidRect(color) if color.is_opaque() => Region::from_rect(self.rect()),
            ItemKind::Surface(content) => match &content.texture {
                Some(texture) if texture.is_opaque() => Region::from_rect(self.rect()),
                Some(_) => content.opaque_region.intersect_rect(self.rect()),
                None => Region::new(),
            },
            _ => Region::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::rect;

    #[test]
    fn opaque_region_follows_content() {
        let mut item = Item::new(None, None, ItemKind::SolidRect(Color::BLACK));
        item.size = Size::from((10, 10));
        assert_eq!(item.opaque_region(), Region::from_rect(rect(0, 0, 10, 10)));

        item.opacity = 0.5;
        assert!(item.opaque_region().is_empty());

        let mut surface = Item::new(None, None, ItemKind::surface());
        surface.size = Size::from((10, 10));
        assert!(surface.opaque_region().is_empty());
        assert!(surface.quads().is_empty());

        let texture = Texture::solid(Size::from((5, 5)), [0, 0, 0, 0]).unwrap();
        surface.kind = ItemKind::Surface(SurfaceContent {
            texture: Some(texture),
            opaque_region: Region::from_rect(rect(0, 0, 20, 5)),
        });
        assert_eq!(surface.opaque_region(), Region::from_rect(rect(0, 0, 10, 5)));
        assert_eq!(surface.quads().len(), 1);
    }
}
