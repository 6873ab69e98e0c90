use std::time::Duration;

use calloop::EventLoop;
use kwin_config::{Config, RendererKind};
use smithay::backend::allocator::Fourcc;
use smithay::utils::{Logical, Physical, Point, Rectangle};

use crate::backend::headless::{HeadlessPlane, VblankMode};
use crate::backend::swapchain::Swapchain;
use crate::kwin::{Kwin, State};
use crate::output::layer::{CapturedFrame, LayerKind, OutputLayer};
use crate::output::render_loop::RenderLoopState;
use crate::output::{Mode, Output, OutputId};
use crate::render_helpers::renderer::DrawOp;
use crate::render_helpers::{read_pixel, Color};
use crate::scene::{ItemId, ItemKind};
use crate::utils::{get_monotonic_time, Region};
use crate::window::WindowId;

/// A compositor on the headless backend with presentation feedback delivered by hand.
pub struct Fixture {
    pub event_loop: EventLoop<'static, State>,
    pub state: State,
}

/// Records draw calls and never starts the watchdog.
pub fn null_config() -> Config {
    let mut config = Config::default();
    config.renderer = RendererKind::None;
    config.watchdog.off = true;
    config
}

/// Rasterizes into memory, for tests that look at pixels.
pub fn software_config() -> Config {
    let mut config = Config::default();
    config.renderer = RendererKind::Software;
    config.watchdog.off = true;
    config
}

pub const RED: Color = Color::new(1., 0., 0., 1.);
pub const GREEN: Color = Color::new(0., 1., 0., 1.);

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(null_config())
    }

    pub fn with_config(config: Config) -> Self {
        let event_loop = EventLoop::try_new().unwrap();
        let mut state = State::new(config, event_loop.handle(), event_loop.get_signal()).unwrap();
        state
            .backend
            .headless_mut()
            .set_vblank_mode(VblankMode::Manual);
        Self { event_loop, state }
    }

    pub fn kwin(&mut self) -> &mut Kwin {
        &mut self.state.kwin
    }

    pub fn add_output(&mut self, name: &str, width: i32, height: i32) -> OutputId {
        let state = &mut self.state;
        state.kwin.add_output(
            &state.backend,
            name.to_owned(),
            Mode::new(width, height, 60_000),
            1.,
            Point::from((0, 0)),
        )
    }

    pub fn output(&self, id: OutputId) -> &Output {
        &self.state.kwin.outputs[&id]
    }

    pub fn output_mut(&mut self, id: OutputId) -> &mut Output {
        self.state.kwin.outputs.get_mut(&id).unwrap()
    }

    pub fn render_state(&self, id: OutputId) -> RenderLoopState {
        self.output(id).render_loop.state()
    }

    pub fn primary(&self, id: OutputId) -> &OutputLayer {
        self.output(id).primary_layer().unwrap()
    }

    pub fn primary_plane(&self, id: OutputId) -> &HeadlessPlane {
        self.primary(id).plane().unwrap()
    }

    pub fn primary_plane_mut(&mut self, id: OutputId) -> &mut HeadlessPlane {
        self.output_mut(id)
            .primary_layer_mut()
            .unwrap()
            .plane_mut()
            .unwrap()
    }

    pub fn cursor_plane(&self, id: OutputId) -> &HeadlessPlane {
        self.output(id)
            .layer(LayerKind::Cursor)
            .unwrap()
            .plane()
            .unwrap()
    }

    pub fn swapchain(&self, id: OutputId) -> &Swapchain {
        self.primary(id).swapchain().unwrap()
    }

    /// Runs one event loop iteration worth of compositor work.
    pub fn refresh(&mut self) {
        self.state.refresh_and_redraw();
    }

    /// Delivers presentation feedback for an output.
    pub fn vblank(&mut self, id: OutputId) {
        self.state.kwin.on_vblank(id, get_monotonic_time());
    }

    /// Drops pending frame timers, as if they all fired.
    pub fn fire_ticks(&mut self) {
        let handle = self.event_loop.handle();
        for output in self.state.kwin.outputs.values_mut() {
            if let Some(token) = output.tick.take() {
                handle.remove(token);
            }
        }
        self.event_loop
            .dispatch(Duration::ZERO, &mut self.state)
            .unwrap();
    }

    /// Adds a solid rectangle directly below the scene root.
    pub fn add_rect(&mut self, geometry: Rectangle<i32, Logical>, color: Color) -> ItemId {
        let scene = &mut self.state.kwin.scene;
        let item = scene
            .create_item(scene.root(), ItemKind::SolidRect(color))
            .unwrap();
        scene.set_geometry(item, geometry);
        item
    }

    /// Maps a window drawn as one solid rectangle.
    pub fn add_window(
        &mut self,
        pid: u32,
        geometry: Rectangle<i32, Logical>,
        color: Color,
    ) -> WindowId {
        let scene = &mut self.state.kwin.scene;
        let window = scene.add_window(Some(pid), format!("window of {pid}"));
        let root = scene.window(window).unwrap().root();
        scene.set_geometry(root, geometry);
        let body = scene.create_item(root, ItemKind::SolidRect(color)).unwrap();
        scene.set_geometry(body, Rectangle::from_size(geometry.size));
        window
    }

    /// Number of frames the renderer finished.
    pub fn rendered_frames(&self) -> u64 {
        self.state.kwin.renderer.as_null().unwrap().frames()
    }

    /// Everything the last rendered frame touched.
    pub fn painted(&self) -> Region<Physical> {
        let mut region = Region::new();
        for op in self.state.kwin.renderer.as_null().unwrap().ops() {
            match op {
                DrawOp::Clear(clear) => region.add_region(clear),
                DrawOp::Quad { clip, .. } => region.add_region(clip),
            }
        }
        region
    }
}

pub fn pixel(frame: &CapturedFrame, x: usize, y: usize) -> Color {
    assert_eq!(frame.format, Fourcc::Argb8888);
    let offset = y * frame.stride + x * 4;
    read_pixel(frame.format, &frame.data[offset..offset + 4]).unwrap()
}
