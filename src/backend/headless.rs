//! Headless backend.
//!
//! Outputs are virtual monitors. Each layer commits into a [`HeadlessPlane`] that behaves like a
//! display plane: it accepts one pending buffer at a time, flips it on vblank and hands back the
//! buffer it stopped scanning out. Vblanks come from a timer at the output's refresh rate, or are
//! delivered by hand in manual mode.

use std::time::Duration;

use calloop::timer::{TimeoutAction, Timer};
use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::utils::{Physical, Size};
use tracing::{debug, trace, warn};

use super::allocator::{BufferId, FormatSet, MemoryAllocator};
use super::swapchain::SlotId;
use crate::kwin::Kwin;
use crate::output::layer::{LayerConfig, LayerKind, OutputLayer};
use crate::output::OutputId;
use crate::utils::get_monotonic_time;

pub const CURSOR_SIZE: i32 = 64;

/// What a plane is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanoutSource {
    Slot(SlotId),
    /// A client buffer scanned out directly.
    Client(BufferId),
}

#[derive(Debug, Default)]
pub struct HeadlessPlane {
    current: Option<ScanoutSource>,
    pending: Option<ScanoutSource>,
    fail_commits: u32,
    commits: u64,
}

impl HeadlessPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a buffer for the next vblank. Fails while another buffer is pending.
    pub fn commit(&mut self, source: ScanoutSource) -> bool {
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            debug!("rejecting commit of {source:?}");
            return false;
        }
        if self.pending.is_some() {
            warn!("commit while a flip is pending");
            return false;
        }
        self.pending = Some(source);
        self.commits += 1;
        true
    }

    /// Latches the pending buffer and returns the one it replaced.
    pub fn flip(&mut self) -> Option<ScanoutSource> {
        let pending = self.pending.take()?;
        self.current.replace(pending)
    }

    pub fn current(&self) -> Option<ScanoutSource> {
        self.current
    }

    pub fn pending(&self) -> Option<ScanoutSource> {
        self.pending
    }

    /// Number of accepted commits.
    pub fn commits(&self) -> u64 {
        self.commits
    }

    /// Makes the next `count` commits fail.
    pub fn fail_next_commits(&mut self, count: u32) {
        self.fail_commits = count;
    }

    /// Stops scanning out anything.
    pub fn reset(&mut self) {
        self.current = None;
        self.pending = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VblankMode {
    /// Vblanks fire on a timer one refresh interval after each commit.
    Timer,
    /// Vblanks are delivered by calling [`Kwin::on_vblank()`].
    Manual,
}

pub struct Headless {
    allocator: MemoryAllocator,
    primary_formats: FormatSet,
    vblank_mode: VblankMode,
}

impl Headless {
    pub fn new() -> Self {
        let mut primary_formats = FormatSet::new();
        primary_formats.insert(
            Fourcc::Xrgb8888,
            vec![Modifier::Linear, Modifier::I915_x_tiled],
        );
        primary_formats.insert(Fourcc::Argb8888, vec![Modifier::Linear]);

        Self {
            allocator: MemoryAllocator::new(),
            primary_formats,
            vblank_mode: VblankMode::Timer,
        }
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    pub fn vblank_mode(&self) -> VblankMode {
        self.vblank_mode
    }

    pub fn set_vblank_mode(&mut self, mode: VblankMode) {
        self.vblank_mode = mode;
    }

    /// Creates the primary and cursor layers of an output.
    pub fn create_layers(
        &self,
        output: OutputId,
        size: Size<i32, Physical>,
        config: LayerConfig,
    ) -> Vec<OutputLayer> {
        let mut cursor_formats = FormatSet::new();
        cursor_formats.insert(Fourcc::Argb8888, vec![Modifier::Linear]);

        vec![
            OutputLayer::new_hardware(
                LayerKind::Primary,
                output,
                size,
                Fourcc::Xrgb8888,
                self.primary_formats.clone(),
                self.allocator.clone(),
                config,
            ),
            OutputLayer::new_hardware(
                LayerKind::Cursor,
                output,
                Size::from((CURSOR_SIZE, CURSOR_SIZE)),
                Fourcc::Argb8888,
                cursor_formats,
                self.allocator.clone(),
                config,
            ),
        ]
    }

    /// Called after a frame was committed on an output.
    pub fn frame_submitted(&mut self, kwin: &mut Kwin, output: OutputId, refresh: Duration) {
        if self.vblank_mode == VblankMode::Manual {
            return;
        }

        let Some(output_state) = kwin.outputs.get_mut(&output) else {
            return;
        };
        // One vblank latches every layer of the output.
        if output_state.vblank_timer.is_some() {
            return;
        }

        trace!("queueing vblank for {output:?} in {refresh:?}");
        let timer = Timer::from_duration(refresh);
        let res = kwin.event_loop.insert_source(timer, move |_, _, state| {
            if let Some(entry) = state.kwin.outputs.get_mut(&output) {
                entry.vblank_timer = None;
            }
            state.kwin.on_vblank(output, get_monotonic_time());
            TimeoutAction::Drop
        });
        match res {
            Ok(token) => output_state.vblank_timer = Some(token),
            Err(err) => warn!("error queueing vblank timer: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_holds_one_pending_buffer() {
        let mut plane = HeadlessPlane::new();
        let a = ScanoutSource::Client(BufferId::for_tests(1));
        let b = ScanoutSource::Client(BufferId::for_tests(2));

        assert!(plane.commit(a));
        assert!(!plane.commit(b));
        assert_eq!(plane.flip(), None);
        assert_eq!(plane.current(), Some(a));

        assert!(plane.commit(b));
        assert_eq!(plane.flip(), Some(a));
        assert_eq!(plane.flip(), None);
        assert_eq!(plane.commits(), 2);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let mut plane = HeadlessPlane::new();
        plane.fail_next_commits(2);
        let source = ScanoutSource::Client(BufferId::for_tests(1));
        assert!(!plane.commit(source));
        assert!(!plane.commit(source));
        assert!(plane.commit(source));
    }

    #[test]
    fn layers_of_an_output() {
        let headless = Headless::new();
        let layers = headless.create_layers(
            OutputId::for_tests(1),
            Size::from((320, 200)),
            LayerConfig::default(),
        );
        let kinds: Vec<_> = layers.iter().map(|l| l.kind()).collect();
        assert_eq!(kinds, vec![LayerKind::Primary, LayerKind::Cursor]);
        assert_eq!(layers[1].size(), Size::from((CURSOR_SIZE, CURSOR_SIZE)));
        assert!(layers[0].supported_drm_formats()[&Fourcc::Xrgb8888]
            .contains(&Modifier::I915_x_tiled));
    }
}
