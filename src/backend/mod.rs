use std::time::Duration;

use smithay::utils::{Physical, Size};

use crate::kwin::Kwin;
use crate::output::layer::{LayerConfig, OutputLayer};
use crate::output::OutputId;

pub mod allocator;
pub mod headless;
pub mod swapchain;

pub use headless::Headless;

use allocator::MemoryAllocator;

pub enum Backend {
    Headless(Headless),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderResult {
    /// The frame was submitted to the backend for presentation.
    Submitted,
    /// Rendering succeeded, but there was no damage.
    NoDamage,
    /// The frame was not rendered and submitted, due to an error or otherwise.
    Skipped,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Headless(_) => "headless",
        }
    }

    /// Creates the layers of a newly enabled output.
    pub fn create_layers(
        &self,
        output: OutputId,
        size: Size<i32, Physical>,
        config: LayerConfig,
    ) -> Vec<OutputLayer> {
        match self {
            Backend::Headless(headless) => headless.create_layers(output, size, config),
        }
    }

    /// Allocator for off-screen layers.
    pub fn allocator(&self) -> MemoryAllocator {
        match self {
            Backend::Headless(headless) => headless.allocator().clone(),
        }
    }

    /// Called after a frame of `output` reached the display.
    pub fn frame_submitted(&mut self, kwin: &mut Kwin, output: OutputId, refresh: Duration) {
        match self {
            Backend::Headless(headless) => headless.frame_submitted(kwin, output, refresh),
        }
    }

    pub fn headless(&self) -> &Headless {
        match self {
            Backend::Headless(headless) => headless,
        }
    }

    pub fn headless_mut(&mut self) -> &mut Headless {
        match self {
            Backend::Headless(headless) => headless,
        }
    }
}
