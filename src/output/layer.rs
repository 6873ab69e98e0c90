//! Composable planes of an output.
//!
//! A layer owns a swapchain and hands out one slot per frame. Hardware layers commit their slots
//! to a display plane and get them back on vblank; virtual layers (screencasts, screenshots and the
//! like) have no plane and no render loop, and copy every finished frame out instead.

use std::rc::Rc;

use kwin_config::Config;
use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::utils::{Physical, Point, Rectangle, Size};
use tracing::{debug, trace, warn};

use super::OutputId;
use crate::backend::allocator::{Buffer, FormatSet, MemoryAllocator};
use crate::backend::headless::{HeadlessPlane, ScanoutSource};
use crate::backend::swapchain::{SlotId, Swapchain};
use crate::utils::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Primary,
    Cursor,
    Overlay,
    /// Off-screen layer feeding a capture.
    Virtual,
}

/// How much of the layer a frame redraws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepaintPolicy {
    /// Only what changed, widened by the buffer age of the slot.
    Damage,
    /// Everything, every frame.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConfig {
    pub slots: usize,
    pub journal_depth: usize,
    pub buffer_age: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            slots: 2,
            journal_depth: 10,
            buffer_age: true,
        }
    }
}

impl LayerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            slots: config.swapchain.slots.get() as usize,
            journal_depth: config.swapchain.damage_journal_depth.get() as usize,
            buffer_age: !config.debug.disable_buffer_age,
        }
    }
}

#[derive(Debug)]
enum LayerTarget {
    Plane(HeadlessPlane),
    Offscreen,
}

/// A frame started with [`OutputLayer::begin_frame()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFrame {
    pub slot: SlotId,
    /// Age of the slot when it was acquired.
    pub age: u32,
    /// New damage of this frame, clipped to the layer.
    pub damage: Region<Physical>,
    /// What has to be redrawn into the slot: the damage plus whatever the slot missed.
    pub repaint: Region<Physical>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BeginFrameError {
    #[error("no free buffer")]
    NoFreeBuffer,
    #[error("a frame is already in progress")]
    FrameInProgress,
}

/// Pixels of the last frame rendered by a virtual layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub size: Size<i32, Physical>,
    pub format: Fourcc,
    pub data: Vec<u8>,
    pub stride: usize,
    pub damage: Region<Physical>,
}

#[derive(Debug)]
pub struct OutputLayer {
    kind: LayerKind,
    /// Output whose render loop paces this layer.
    render_loop: Option<OutputId>,
    target: LayerTarget,
    policy: RepaintPolicy,
    size: Size<i32, Physical>,
    format: Fourcc,
    formats: FormatSet,
    swapchain: Option<Swapchain>,
    allocator: MemoryAllocator,
    config: LayerConfig,
    /// Damage the layer owes on top of what the scene reports.
    repaint: Region<Physical>,
    frame: Option<SlotId>,
    /// Client buffers committed for scanout, kept alive until the plane lets go of them.
    scanout_buffers: Vec<Rc<Buffer>>,
    position: Point<i32, Physical>,
    capture: Option<CapturedFrame>,
}

impl OutputLayer {
    /// Creates a layer committing to a display plane of `output`.
    pub fn new_hardware(
        kind: LayerKind,
        output: OutputId,
        size: Size<i32, Physical>,
        format: Fourcc,
        formats: FormatSet,
        allocator: MemoryAllocator,
        config: LayerConfig,
    ) -> Self {
        let policy = if config.buffer_age {
            RepaintPolicy::Damage
        } else {
            RepaintPolicy::Full
        };

        Self {
            kind,
            render_loop: Some(output),
            target: LayerTarget::Plane(HeadlessPlane::new()),
            policy,
            size,
            format,
            formats,
            swapchain: None,
            allocator,
            config,
            repaint: Region::infinite(),
            frame: None,
            scanout_buffers: Vec::new(),
            position: Point::from((0, 0)),
            capture: None,
        }
    }

    /// Creates an off-screen layer. It is never scanned out and repaints fully every frame.
    pub fn new_virtual(
        size: Size<i32, Physical>,
        allocator: MemoryAllocator,
        config: LayerConfig,
    ) -> Self {
        Self {
            kind: LayerKind::Virtual,
            render_loop: None,
            target: LayerTarget::Offscreen,
            policy: RepaintPolicy::Full,
            size,
            format: Fourcc::Argb8888,
            formats: FormatSet::new(),
            swapchain: None,
            allocator,
            config,
            repaint: Region::infinite(),
            frame: None,
            scanout_buffers: Vec::new(),
            position: Point::from((0, 0)),
            capture: None,
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn render_loop(&self) -> Option<OutputId> {
        self.render_loop
    }

    pub fn policy(&self) -> RepaintPolicy {
        self.policy
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    pub fn position(&self) -> Point<i32, Physical> {
        self.position
    }

    pub fn set_position(&mut self, position: Point<i32, Physical>) {
        self.position = position;
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    pub fn plane(&self) -> Option<&HeadlessPlane> {
        match &self.target {
            LayerTarget::Plane(plane) => Some(plane),
            LayerTarget::Offscreen => None,
        }
    }

    pub fn plane_mut(&mut self) -> Option<&mut HeadlessPlane> {
        match &mut self.target {
            LayerTarget::Plane(plane) => Some(plane),
            LayerTarget::Offscreen => None,
        }
    }

    pub fn repaint(&self) -> &Region<Physical> {
        &self.repaint
    }

    pub fn frame_in_progress(&self) -> bool {
        self.frame.is_some()
    }

    /// Formats and modifiers this layer can scan out directly.
    ///
    /// Empty for layers that always need composition.
    pub fn supported_drm_formats(&self) -> &FormatSet {
        &self.formats
    }

    /// Makes the next frame redraw `region` even if the scene reports no damage there.
    pub fn add_repaint(&mut self, region: &Region<Physical>) {
        if region.is_infinite() {
            self.repaint = Region::infinite();
        } else if !self.repaint.is_infinite() {
            self.repaint.add_region(region);
        }
    }

    pub fn set_size(&mut self, size: Size<i32, Physical>) {
        if self.size == size {
            return;
        }
        debug!("resizing {:?} layer to {}x{}", self.kind, size.w, size.h);
        self.size = size;
        self.repaint = Region::infinite();
    }

    fn modifiers(&self) -> Vec<Modifier> {
        match self.formats.get(&self.format) {
            Some(modifiers) if !modifiers.is_empty() => modifiers.clone(),
            _ => vec![Modifier::Linear],
        }
    }

    /// Starts a frame with the given new damage.
    ///
    /// Returns `Ok(None)` when there is nothing to redraw. On [`BeginFrameError::NoFreeBuffer`]
    /// the caller skips this frame and tries again later; the damage it passed in is its own to
    /// keep.
    pub fn begin_frame(
        &mut self,
        damage: &Region<Physical>,
    ) -> Result<Option<LayerFrame>, BeginFrameError> {
        let _span = tracy_client::span!("OutputLayer::begin_frame");

        if self.frame.is_some() {
            return Err(BeginFrameError::FrameInProgress);
        }

        let bounds = Rectangle::from_size(self.size);
        let damage = match self.policy {
            RepaintPolicy::Full => Region::from_rect(bounds),
            RepaintPolicy::Damage => damage.union(&self.repaint).intersect_rect(bounds),
        };
        if damage.is_empty() {
            trace!("{:?} layer has nothing to redraw", self.kind);
            return Ok(None);
        }

        let modifiers = self.modifiers();
        let recreate = self
            .swapchain
            .as_ref()
            .map_or(true, |sc| !sc.matches(self.size, self.format, &modifiers));
        if recreate {
            debug!(
                "creating {:?} swapchain {}x{} {:?}",
                self.kind, self.size.w, self.size.h, self.format
            );
            self.swapchain = Some(Swapchain::new(
                self.size,
                self.format,
                modifiers,
                self.config.slots,
                self.config.journal_depth,
            ));
        }
        let Some(swapchain) = self.swapchain.as_mut() else {
            return Err(BeginFrameError::NoFreeBuffer);
        };

        let Some(slot) = swapchain.acquire(&mut self.allocator) else {
            return Err(BeginFrameError::NoFreeBuffer);
        };

        let repaint = match self.policy {
            RepaintPolicy::Full => Region::from_rect(bounds),
            RepaintPolicy::Damage => match swapchain.journal().accumulate(slot.age) {
                Some(missed) => missed.union(&damage).intersect_rect(bounds),
                None => Region::from_rect(bounds),
            },
        };
        trace!("slot {:?} age {} repaint {repaint}", slot.id, slot.age);

        self.repaint.clear();
        self.frame = Some(slot.id);
        Ok(Some(LayerFrame {
            slot: slot.id,
            age: slot.age,
            damage,
            repaint,
        }))
    }

    /// The buffer to render a started frame into.
    pub fn buffer_mut(&mut self, frame: &LayerFrame) -> Option<&mut Buffer> {
        self.swapchain.as_mut()?.buffer_mut(frame.slot)
    }

    /// Gives up on a started frame without presenting it.
    pub fn abort_frame(&mut self, frame: LayerFrame) {
        if self.frame != Some(frame.slot) {
            return;
        }
        self.frame = None;
        if let Some(swapchain) = &mut self.swapchain {
            swapchain.abort(frame.slot);
        }
        self.add_repaint(&frame.damage);
    }

    /// Commits a rendered frame.
    ///
    /// `rendered` is what was drawn into the slot, `damaged` is what changed on screen. Returns
    /// `false` if the display rejected the commit; the slot then goes back to the pool and the
    /// layer redraws `rendered` next time.
    pub fn end_frame(
        &mut self,
        frame: LayerFrame,
        rendered: &Region<Physical>,
        damaged: &Region<Physical>,
    ) -> bool {
        let _span = tracy_client::span!("OutputLayer::end_frame");

        if self.frame != Some(frame.slot) {
            warn!("ending a frame that was not started");
            return false;
        }
        self.frame = None;

        let Some(swapchain) = self.swapchain.as_mut() else {
            return false;
        };

        match &mut self.target {
            LayerTarget::Plane(plane) => {
                if plane.commit(ScanoutSource::Slot(frame.slot)) {
                    swapchain.submit(frame.slot, damaged);
                    true
                } else {
                    swapchain.abort(frame.slot);
                    self.add_repaint(rendered);
                    false
                }
            }
            LayerTarget::Offscreen => {
                swapchain.submit(frame.slot, damaged);
                self.capture = swapchain.buffer(frame.slot).and_then(|buffer| {
                    let (data, stride) = buffer.pixels()?;
                    Some(CapturedFrame {
                        size: buffer.size(),
                        format: buffer.format(),
                        data: data.to_vec(),
                        stride,
                        damage: rendered.clone(),
                    })
                });
                // Nothing scans out of a virtual layer.
                swapchain.release(frame.slot);
                true
            }
        }
    }

    /// Takes the pixels of the last frame of a virtual layer.
    pub fn take_capture(&mut self) -> Option<CapturedFrame> {
        self.capture.take()
    }

    /// Latches the pending commit on vblank and releases whatever it replaced.
    ///
    /// Returns `true` if a commit was latched.
    pub fn on_vblank(&mut self) -> bool {
        let LayerTarget::Plane(plane) = &mut self.target else {
            return false;
        };
        if plane.pending().is_none() {
            return false;
        }

        match plane.flip() {
            Some(ScanoutSource::Slot(id)) => {
                if let Some(swapchain) = &mut self.swapchain {
                    swapchain.release(id);
                }
            }
            Some(ScanoutSource::Client(id)) => {
                self.scanout_buffers.retain(|buffer| buffer.id() != id);
            }
            None => (),
        }
        true
    }

    /// Tries to show a client buffer without composition.
    ///
    /// The buffer must match the layer size and use a format and modifier from
    /// [`supported_drm_formats()`](Self::supported_drm_formats). On success the layer forgets its
    /// damage history, so the next composited frame is a full repaint.
    pub fn try_scanout(&mut self, buffer: &Rc<Buffer>) -> bool {
        let _span = tracy_client::span!("OutputLayer::try_scanout");

        if self.kind != LayerKind::Primary || self.frame.is_some() {
            return false;
        }
        if !buffer.is_dmabuf() || buffer.size() != self.size {
            return false;
        }
        let supported = self
            .formats
            .get(&buffer.format())
            .is_some_and(|modifiers| modifiers.contains(&buffer.modifier()));
        if !supported {
            trace!(
                "cannot scan out {:?} {:?}",
                buffer.format(),
                buffer.modifier()
            );
            return false;
        }

        let LayerTarget::Plane(plane) = &mut self.target else {
            return false;
        };
        if !plane.commit(ScanoutSource::Client(buffer.id())) {
            return false;
        }

        self.scanout_buffers.push(buffer.clone());
        if let Some(swapchain) = &mut self.swapchain {
            swapchain.invalidate_damage();
        }
        true
    }

    /// Drops every buffer reference. Safe to call at any time, any number of times.
    pub fn release_buffers(&mut self) {
        if self.swapchain.is_some() || !self.scanout_buffers.is_empty() {
            debug!("releasing {:?} layer buffers", self.kind);
        }

        self.frame = None;
        self.swapchain = None;
        self.scanout_buffers.clear();
        self.capture = None;
        if let LayerTarget::Plane(plane) = &mut self.target {
            plane.reset();
        }
        self.repaint = Region::infinite();
    }
}
