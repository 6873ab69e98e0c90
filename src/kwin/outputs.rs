//! Output lifecycle.
//!
//! Outputs start disabled. Enabling one creates its layers and the scene view it shows; disabling
//! it disposes the render loop so that nothing more is composed for it, and drops every buffer.

use smithay::utils::{Logical, Point};
use tracing::{debug, info, trace};

use super::Kwin;
use crate::backend::Backend;
use crate::output::layer::LayerConfig;
use crate::output::render_loop::RenderLoop;
use crate::output::{Mode, Output, OutputId};
use crate::scene::SceneView;
use crate::utils::Region;

// =============================================================================
// Adding and Removing
// =============================================================================

impl Kwin {
    /// Adds an output as reported by the backend.
    ///
    /// Settings from the `output` section with the same name take precedence over what the
    /// backend reported. The output is enabled right away unless the config turns it off.
    pub fn add_output(
        &mut self,
        backend: &Backend,
        name: String,
        mut mode: Mode,
        mut scale: f64,
        mut position: Point<i32, Logical>,
    ) -> OutputId {
        let _span = tracy_client::span!("Kwin::add_output");

        let mut off = false;
        if let Some(config) = self.config.output(&name) {
            if let Some(configured) = &config.mode {
                mode = Mode::from_config(configured, self.config.render_loop.refresh_rate);
            }
            if let Some(configured) = config.scale {
                scale = configured;
            }
            if let Some(configured) = config.position {
                position = Point::from((configured.x, configured.y));
            }
            off = config.off;
        }
        if !(scale.is_finite() && scale > 0.) {
            debug!("ignoring invalid scale {scale} for {name}");
            scale = 1.;
        }

        let id = OutputId::new(self.next_output_id);
        self.next_output_id += 1;

        info!(
            "adding output {name}: {}x{}@{:.3} scale {scale}",
            mode.size.w,
            mode.size.h,
            f64::from(mode.refresh_mhz) / 1000.,
        );
        let max_failures = self.config.render_loop.max_commit_failures.get();
        let output = Output::new(id, name, mode, scale, position, max_failures);
        self.outputs.insert(id, output);

        if !off {
            self.enable_output(backend, id);
        }
        id
    }

    /// Disables and forgets an output.
    pub fn remove_output(&mut self, id: OutputId) {
        self.disable_output(id);
        if let Some(output) = self.outputs.remove(&id) {
            info!("removed output {}", output.name);
        }
    }

    /// Logs output sections that match none of the connected outputs.
    pub fn log_unmatched_output_configs(&self) {
        for config in &self.config.outputs {
            if !self.outputs.values().any(|output| output.name == config.name) {
                debug!("no output named {}, ignoring its config", config.name);
            }
        }
    }

    // =========================================================================
    // Enabling and Disabling
    // =========================================================================

    pub fn enable_output(&mut self, backend: &Backend, id: OutputId) {
        let _span = tracy_client::span!("Kwin::enable_output");

        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        if output.enabled {
            return;
        }
        debug!("enabling {}", output.name);

        output.layers = backend.create_layers(
            id,
            output.mode.size,
            LayerConfig::from_config(&self.config),
        );
        if output.render_loop.is_disposed() {
            output.render_loop = RenderLoop::new(
                output.mode.refresh_interval(),
                self.config.render_loop.max_commit_failures.get(),
            );
        }

        let view = SceneView::new(output.logical_geometry(), output.scale);
        output.view = Some(self.scene.add_view(view));
        output.enabled = true;
        output.render_loop.schedule_repaint(&Region::infinite());

        if self.cursor.texture().is_some() {
            self.cursor.dirty.insert(id);
        }
        self.update_cursor_layers();
    }

    /// Stops composing for an output and releases its buffers.
    ///
    /// A frame scheduled on the output is dropped together with its damage.
    pub fn disable_output(&mut self, id: OutputId) {
        let _span = tracy_client::span!("Kwin::disable_output");

        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        if !output.enabled {
            return;
        }
        debug!("disabling {}", output.name);

        output.render_loop.dispose();
        for layer in &mut output.layers {
            layer.release_buffers();
        }
        output.layers.clear();

        if let Some(view) = output.view.take() {
            self.scene.remove_view(view);
        }
        if let Some(token) = output.tick.take() {
            self.event_loop.remove(token);
        }
        // The committed frame will never be presented.
        if let Some(token) = output.vblank_timer.take() {
            self.event_loop.remove(token);
        }
        output.enabled = false;

        self.cursor.dirty.remove(&id);
        self.stop_captures_for_output(id);
    }

    // =========================================================================
    // Reconfiguration
    // =========================================================================

    /// Switches an output to another mode. The next frame is a full repaint into a new swapchain.
    pub fn set_output_mode(&mut self, id: OutputId, mode: Mode) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        if output.mode == mode {
            return;
        }
        debug!(
            "{} mode changed to {}x{}@{}",
            output.name, mode.size.w, mode.size.h, mode.refresh_mhz
        );

        output.mode = mode;
        output.render_loop.set_refresh_interval(mode.refresh_interval());
        if let Some(layer) = output.primary_layer_mut() {
            layer.set_size(mode.size);
        }
        self.update_view(id);
    }

    pub fn set_output_scale(&mut self, id: OutputId, scale: f64) {
        if !(scale.is_finite() && scale > 0.) {
            debug!("ignoring invalid scale {scale}");
            return;
        }
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        if output.scale == scale {
            return;
        }

        output.scale = scale;
        self.update_view(id);
        self.update_cursor_layers();
    }

    pub fn set_output_position(&mut self, id: OutputId, position: Point<i32, Logical>) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        if output.position == position {
            return;
        }

        output.position = position;
        self.update_view(id);
        self.update_cursor_layers();
    }

    /// Points the output's view at its current geometry and repaints everything.
    fn update_view(&mut self, id: OutputId) {
        let Some(output) = self.outputs.get_mut(&id) else {
            return;
        };
        let Some(view) = output.view.and_then(|view| self.scene.view_mut(view)) else {
            return;
        };

        trace!("{} now shows {:?}", output.name, output.logical_geometry());
        view.set_viewport(output.logical_geometry(), output.scale);
        if let Some(layer) = output.primary_layer_mut() {
            layer.add_repaint(&Region::infinite());
        }
        output.render_loop.schedule_repaint(&Region::infinite());

        self.update_captures_for_output(id);
    }
}
