use std::time::Duration;

use calloop::RegistrationToken;
use smithay::utils::{Logical, Physical, Point, Rectangle, Size};

use crate::scene::ViewId;
use crate::utils::{to_logical_size, Region};

pub mod layer;
pub mod render_loop;

use layer::{LayerKind, OutputLayer};
use render_loop::RenderLoop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(u32);

impl OutputId {
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub fn for_tests(id: u32) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub size: Size<i32, Physical>,
    /// Refresh rate in mHz.
    pub refresh_mhz: u32,
}

impl Mode {
    pub fn new(width: i32, height: i32, refresh_mhz: u32) -> Self {
        Self {
            size: Size::from((width, height)),
            refresh_mhz: refresh_mhz.max(1),
        }
    }

    /// Converts a configured mode, using `fallback_rate` (Hz) when no refresh rate is given.
    pub fn from_config(mode: &kwin_config::Mode, fallback_rate: f64) -> Self {
        let rate = mode.refresh.unwrap_or(fallback_rate);
        let refresh_mhz = (rate * 1000.).round().clamp(1., f64::from(u32::MAX)) as u32;
        Self::new(i32::from(mode.width), i32::from(mode.height), refresh_mhz)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000_000 / u64::from(self.refresh_mhz.max(1)))
    }
}

/// Per-frame information passed down the composition of one output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    /// Sequence of the render loop when the frame started.
    pub sequence: u64,
    pub target_presentation_time: Duration,
    /// Damage handed out by the render loop.
    pub damage: Region<Physical>,
}

#[derive(Debug)]
pub struct Output {
    pub id: OutputId,
    pub name: String,
    pub mode: Mode,
    pub scale: f64,
    pub position: Point<i32, Logical>,
    pub enabled: bool,
    pub render_loop: RenderLoop,
    pub layers: Vec<OutputLayer>,
    /// View of the scene shown on the primary layer, while enabled.
    pub view: Option<ViewId>,
    /// Pending frame timer.
    pub tick: Option<RegistrationToken>,
    /// Timer standing in for the vblank of a committed frame.
    pub vblank_timer: Option<RegistrationToken>,
}

impl Output {
    pub fn new(
        id: OutputId,
        name: String,
        mode: Mode,
        scale: f64,
        position: Point<i32, Logical>,
        max_commit_failures: u32,
    ) -> Self {
        Self {
            id,
            name,
            mode,
            scale,
            position,
            enabled: false,
            render_loop: RenderLoop::new(mode.refresh_interval(), max_commit_failures),
            layers: Vec::new(),
            view: None,
            tick: None,
            vblank_timer: None,
        }
    }

    /// The area of the scene this output shows.
    pub fn logical_geometry(&self) -> Rectangle<i32, Logical> {
        Rectangle::new(self.position, to_logical_size(self.mode.size, self.scale))
    }

    pub fn layer(&self, kind: LayerKind) -> Option<&OutputLayer> {
        self.layers.iter().find(|layer| layer.kind() == kind)
    }

    pub fn layer_mut(&mut self, kind: LayerKind) -> Option<&mut OutputLayer> {
        self.layers.iter_mut().find(|layer| layer.kind() == kind)
    }

    pub fn primary_layer(&self) -> Option<&OutputLayer> {
        self.layer(LayerKind::Primary)
    }

    pub fn primary_layer_mut(&mut self) -> Option<&mut OutputLayer> {
        self.layer_mut(LayerKind::Primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::rect;

    #[test]
    fn refresh_interval_from_mode() {
        let mode = Mode::new(1920, 1080, 60_000);
        assert_eq!(mode.refresh_interval(), Duration::from_nanos(16_666_666));

        let configured = kwin_config::Mode {
            width: 800,
            height: 600,
            refresh: None,
        };
        let mode = Mode::from_config(&configured, 144.);
        assert_eq!(mode.refresh_mhz, 144_000);
        assert_eq!(mode.size, Size::from((800, 600)));
    }

    #[test]
    fn logical_geometry_follows_scale() {
        let output = Output::new(
            OutputId::for_tests(1),
            String::from("HEADLESS-1"),
            Mode::new(3000, 2000, 60_000),
            2.,
            Point::from((100, 0)),
            3,
        );
        assert_eq!(output.logical_geometry(), rect(100, 0, 1500, 1000));
    }
}
