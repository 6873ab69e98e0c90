//! Compositor state.
//!
//! [`State`] pairs the backend with [`Kwin`], the context every part of the compositor goes
//! through: the scene, the outputs with their render loops, the effect chain and the renderer.
//! Nothing is global; callbacks from the event loop receive the [`State`] and reach everything
//! from there.

mod outputs;
mod render;
mod screencast;

use std::collections::{BTreeMap, HashSet};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{LoopHandle, LoopSignal};
use kwin_config::Config;
use smithay::utils::{Logical, Point};
use tracing::{debug, error, trace, warn};

pub use screencast::{Capture, CaptureId, CaptureKind};

use crate::backend::allocator::MemoryAllocator;
use crate::backend::{Backend, Headless};
use crate::effects::EffectChain;
use crate::output::layer::LayerKind;
use crate::output::render_loop::RenderLoopState;
use crate::output::{Output, OutputId};
use crate::render_helpers::{Renderer, Texture};
use crate::scene::Scene;
use crate::watchdog::Watchdog;

pub struct State {
    pub backend: Backend,
    pub kwin: Kwin,
}

impl State {
    pub fn new(
        config: Config,
        event_loop: LoopHandle<'static, State>,
        stop_signal: LoopSignal,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("State::new");

        let backend = Backend::Headless(Headless::new());
        let kwin = Kwin::new(config, event_loop, stop_signal, &backend)?;
        Ok(Self { backend, kwin })
    }

    /// Brings the outputs up to date with the scene. Runs once per event loop iteration.
    pub fn refresh_and_redraw(&mut self) {
        let _span = tracy_client::span!("State::refresh_and_redraw");

        if let Some(watchdog) = &self.kwin.watchdog {
            watchdog.arm();
        }

        self.kwin.refresh();
        self.kwin.redraw_queued_outputs(&mut self.backend);

        if let Some(watchdog) = &self.kwin.watchdog {
            watchdog.disarm();
        }
    }
}

/// The cursor image shown on the cursor layers.
#[derive(Debug, Default)]
pub struct Cursor {
    texture: Option<Texture>,
    hotspot: Point<i32, Logical>,
    position: Point<i32, Logical>,
    /// Outputs whose cursor layer shows an outdated image.
    dirty: HashSet<OutputId>,
}

impl Cursor {
    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    pub fn position(&self) -> Point<i32, Logical> {
        self.position
    }

    pub fn hotspot(&self) -> Point<i32, Logical> {
        self.hotspot
    }
}

pub struct Kwin {
    pub config: Config,
    pub event_loop: LoopHandle<'static, State>,
    pub stop_signal: LoopSignal,

    pub scene: Scene,
    pub outputs: BTreeMap<OutputId, Output>,
    pub effects: EffectChain,
    pub renderer: Renderer,
    pub captures: Vec<Capture>,
    pub cursor: Cursor,

    pub watchdog: Option<Watchdog>,
    /// Raised by the watchdog thread after it fired.
    stalled: Arc<AtomicBool>,
    /// Connection the watchdog shuts down when the compositor stalls.
    guarded_connection: Arc<Mutex<Option<UnixStream>>>,

    /// Allocator for off-screen layers.
    allocator: MemoryAllocator,
    next_output_id: u32,
    next_capture_id: u32,
    /// Frames presented over all outputs.
    pub presented_frames: u64,
}

impl Kwin {
    pub fn new(
        config: Config,
        event_loop: LoopHandle<'static, State>,
        stop_signal: LoopSignal,
        backend: &Backend,
    ) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("Kwin::new");

        let stalled = Arc::new(AtomicBool::new(false));
        let guarded_connection = Arc::new(Mutex::new(None::<UnixStream>));

        let watchdog = if config.watchdog.off {
            None
        } else {
            let stalled = stalled.clone();
            let guarded = guarded_connection.clone();
            let timeout = Duration::from_millis(config.watchdog.timeout_ms);
            let watchdog = Watchdog::start(timeout, move || {
                stalled.store(true, Ordering::SeqCst);
                let stream = guarded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(stream) = stream {
                    if let Err(err) = stream.shutdown(Shutdown::Both) {
                        warn!("error shutting down the guarded connection: {err}");
                    }
                }
            })
            .context("error starting the watchdog")?;
            Some(watchdog)
        };

        debug!("starting with the {} backend", backend.name());

        Ok(Self {
            renderer: Renderer::new(config.renderer),
            config,
            event_loop,
            stop_signal,
            scene: Scene::new(),
            outputs: BTreeMap::new(),
            effects: EffectChain::new(),
            captures: Vec::new(),
            cursor: Cursor::default(),
            watchdog,
            stalled,
            guarded_connection,
            allocator: backend.allocator(),
            next_output_id: 1,
            next_capture_id: 1,
            presented_frames: 0,
        })
    }

    /// Lets the watchdog sever `stream` if the compositor thread hangs.
    pub fn guard_connection(&self, stream: &UnixStream) -> anyhow::Result<()> {
        let stream = stream
            .try_clone()
            .context("error duplicating the connection socket")?;
        *self
            .guarded_connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(stream);
        Ok(())
    }

    /// Whether the watchdog fired since the last call.
    pub fn take_stalled(&self) -> bool {
        self.stalled.swap(false, Ordering::SeqCst)
    }

    /// Delivers scene changes to the render loops.
    pub fn refresh(&mut self) {
        let _span = tracy_client::span!("Kwin::refresh");

        if self.take_stalled() {
            error!("the compositor stalled and its guarded connection was shut down");
        }

        let damaged = self.scene.dispatch();

        // Captures render after their source output, so their damage has to wake it up.
        let sources: Vec<_> = damaged
            .iter()
            .filter_map(|view| self.capture_source(*view))
            .collect();
        for source in sources {
            self.queue_redraw(source);
        }

        for output in self.outputs.values_mut() {
            let Some(view) = output.view else {
                continue;
            };
            if !damaged.contains(&view) {
                continue;
            }
            let Some(view) = self.scene.view_mut(view) else {
                continue;
            };

            let damage = view.take_damage();
            if output.render_loop.schedule_repaint(&damage) {
                trace!("scheduled a frame on {}", output.name);
            }
        }
    }

    /// Asks for a frame on an output even without damage.
    pub fn queue_redraw(&mut self, output: OutputId) {
        if let Some(output) = self.outputs.get_mut(&output) {
            output.render_loop.schedule_frame();
        }
    }

    /// Holds off redrawing an output for `delay`.
    pub(crate) fn arm_tick(&mut self, output_id: OutputId, delay: Duration) {
        let Some(output) = self.outputs.get_mut(&output_id) else {
            return;
        };
        if output.tick.is_some() {
            return;
        }

        let timer = Timer::from_duration(delay);
        let res = self.event_loop.insert_source(timer, move |_, _, state| {
            if let Some(output) = state.kwin.outputs.get_mut(&output_id) {
                output.tick = None;
            }
            TimeoutAction::Drop
        });
        match res {
            Ok(token) => output.tick = Some(token),
            Err(err) => warn!("error arming the frame timer: {err}"),
        }
    }

    /// Presentation feedback from the backend.
    pub fn on_vblank(&mut self, output_id: OutputId, presentation_time: Duration) {
        let _span = tracy_client::span!("Kwin::on_vblank");

        let Some(output) = self.outputs.get_mut(&output_id) else {
            return;
        };
        if output.render_loop.is_disposed() {
            trace!("vblank on disabled output {}", output.name);
            return;
        }

        let mut latched = false;
        for layer in &mut output.layers {
            latched |= layer.on_vblank();
        }
        if !latched {
            trace!("vblank on {} without a committed frame", output.name);
            return;
        }

        // Cursor-only commits also end up here.
        if !matches!(output.render_loop.state(), RenderLoopState::Presented { .. }) {
            return;
        }

        self.presented_frames += 1;
        if output.render_loop.presented(presentation_time) {
            trace!("another frame is due on {}", output.name);
        }
    }

    pub fn set_cursor_image(&mut self, texture: Option<Texture>, hotspot: Point<i32, Logical>) {
        self.cursor.texture = texture;
        self.cursor.hotspot = hotspot;
        self.cursor.dirty = self
            .outputs
            .values()
            .filter(|output| output.enabled)
            .map(|output| output.id)
            .collect();
        self.update_cursor_layers();

        let dirty: Vec<_> = self.cursor.dirty.iter().copied().collect();
        for output in dirty {
            self.queue_redraw(output);
        }
    }

    pub fn move_cursor(&mut self, position: Point<i32, Logical>) {
        self.cursor.position = position;
        self.update_cursor_layers();
    }

    fn update_cursor_layers(&mut self) {
        let hotspot = self.cursor.hotspot;
        let position = self.cursor.position;
        for output in self.outputs.values_mut() {
            let local = position - output.position - hotspot;
            let local = local.to_f64().to_physical(output.scale).to_i32_round();
            if let Some(layer) = output.layer_mut(LayerKind::Cursor) {
                layer.set_position(local);
            }
        }
    }
}
