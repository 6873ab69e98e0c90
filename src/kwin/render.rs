//! Frame composition.

use smithay::utils::{Physical, Rectangle};
use tracing::{debug, error, trace, warn};

use super::Kwin;
use crate::backend::allocator::Buffer;
use crate::backend::{Backend, RenderResult};
use crate::effects::{ScreenPaintFlags, ScreenPrePaintData};
use crate::output::layer::LayerKind;
use crate::output::render_loop::{FrameFailure, RenderLoopState};
use crate::output::{OutputFrame, OutputId};
use crate::render_helpers::{Color, ItemRenderer, Texture};
use crate::scene::quad::{Quad, QuadFill};
use crate::utils::{get_monotonic_time, rect, Region};

/// How composing the primary layer went.
#[derive(Debug)]
enum Outcome {
    Submitted,
    NoDamage,
    Deferred,
    Failed(FrameFailure),
}

// =============================================================================
// Output Redraw
// =============================================================================

impl Kwin {
    /// Redraws every output whose render loop has a frame scheduled.
    pub fn redraw_queued_outputs(&mut self, backend: &mut Backend) {
        let _span = tracy_client::span!("Kwin::redraw_queued_outputs");

        let queued: Vec<_> = self
            .outputs
            .values()
            .filter(|output| {
                output.enabled
                    && output.tick.is_none()
                    && output.render_loop.state() == RenderLoopState::Scheduled
            })
            .map(|output| output.id)
            .collect();

        for output in queued {
            self.redraw(backend, output);
        }
    }

    /// Composes and submits one frame of an output.
    pub fn redraw(&mut self, backend: &mut Backend, output_id: OutputId) -> RenderResult {
        let _span = tracy_client::span!("Kwin::redraw");

        let Some(output) = self.outputs.get_mut(&output_id) else {
            return RenderResult::Skipped;
        };
        if !output.enabled {
            return RenderResult::Skipped;
        }
        let Some(view) = output.view else {
            return RenderResult::Skipped;
        };
        let Some(damage) = output.render_loop.begin_frame() else {
            return RenderResult::Skipped;
        };
        let refresh = output.render_loop.refresh_interval();

        let now = get_monotonic_time();
        let mut frame = OutputFrame {
            sequence: output.render_loop.sequence(),
            target_presentation_time: output.render_loop.next_presentation_time(now),
            damage,
        };
        trace!(
            "redrawing {} frame {} damage {}",
            output.name,
            frame.sequence,
            frame.damage
        );

        let mut screen_data = ScreenPrePaintData {
            output: output_id,
            flags: ScreenPaintFlags::empty(),
            damage: frame.damage.clone(),
            presentation_time: frame.target_presentation_time,
        };
        if self.config.debug.force_full_repaint {
            screen_data.flags |= ScreenPaintFlags::FULL_REPAINT;
        }
        self.effects.pre_paint_screen(&mut screen_data);
        frame.damage = screen_data.damage;

        let windows = self
            .effects
            .pre_paint_windows(output_id, self.scene.windows_in_view(view));

        let scanned_out = !self.config.debug.disable_direct_scanout
            && self
                .scene
                .scanout_candidate(view, &windows)
                .is_some_and(|buffer| {
                    output
                        .primary_layer_mut()
                        .is_some_and(|layer| layer.try_scanout(&buffer))
                });

        let outcome = if scanned_out {
            trace!("scanning out a client buffer on {}", output.name);
            output.render_loop.frame_submitted();
            Outcome::Submitted
        } else if let Some(layer) = output.primary_layer_mut() {
            match layer.begin_frame(&frame.damage) {
                Err(err) => {
                    debug!("deferring frame on {}: {err}", output.name);
                    output.render_loop.frame_deferred();
                    Outcome::Deferred
                }
                Ok(None) => {
                    output.render_loop.frame_skipped();
                    Outcome::NoDamage
                }
                Ok(Some(layer_frame)) => {
                    let res = match layer.buffer_mut(&layer_frame) {
                        Some(buffer) => self.scene.paint(
                            view,
                            &mut self.renderer,
                            buffer,
                            &layer_frame.repaint,
                            &windows,
                        ),
                        None => Err(anyhow::anyhow!("the acquired slot has no buffer")),
                    };

                    match res {
                        Ok(_) => {
                            let rendered = layer_frame.repaint.clone();
                            let damaged = layer_frame.damage.clone();
                            if layer.end_frame(layer_frame, &rendered, &damaged) {
                                output.render_loop.frame_submitted();
                                Outcome::Submitted
                            } else {
                                warn!("{}: commit rejected", output.name);
                                Outcome::Failed(output.render_loop.frame_failed())
                            }
                        }
                        Err(err) => {
                            layer.abort_frame(layer_frame);
                            warn!("error painting {}: {err:?}", output.name);
                            Outcome::Failed(output.render_loop.frame_failed())
                        }
                    }
                }
            }
        } else {
            output.render_loop.frame_skipped();
            Outcome::NoDamage
        };

        match outcome {
            Outcome::Submitted => {
                backend.frame_submitted(self, output_id, refresh);
                self.render_captures(output_id);
                self.render_cursor(output_id);
                self.post_paint(output_id);
                RenderResult::Submitted
            }
            Outcome::NoDamage => {
                self.render_captures(output_id);
                if self.render_cursor(output_id) {
                    backend.frame_submitted(self, output_id, refresh);
                }
                if self.post_paint(output_id) {
                    // Nothing paces an undamaged frame, so wait for a refresh cycle.
                    self.arm_tick(output_id, refresh);
                }
                RenderResult::NoDamage
            }
            Outcome::Deferred | Outcome::Failed(FrameFailure::Retry) => {
                self.arm_tick(output_id, refresh);
                RenderResult::Skipped
            }
            Outcome::Failed(FrameFailure::Fatal) => {
                let name = self.outputs.get(&output_id).map(|o| o.name.clone());
                error!(
                    "too many failed frames on {}, disabling it",
                    name.as_deref().unwrap_or("unknown output")
                );
                self.disable_output(output_id);
                RenderResult::Skipped
            }
        }
    }

    /// Runs the post-paint effect hooks. Returns `true` if an effect asked for another frame.
    fn post_paint(&mut self, output_id: OutputId) -> bool {
        if !self.effects.post_paint_screen(output_id) {
            return false;
        }
        if let Some(output) = self.outputs.get_mut(&output_id) {
            output.render_loop.schedule_frame();
        }
        true
    }

    // =========================================================================
    // Cursor
    // =========================================================================

    /// Redraws the cursor layer of an output if its image changed.
    ///
    /// Returns `true` if a new cursor image was committed.
    fn render_cursor(&mut self, output_id: OutputId) -> bool {
        let _span = tracy_client::span!("Kwin::render_cursor");

        if !self.cursor.dirty.contains(&output_id) {
            return false;
        }
        let Some(output) = self.outputs.get_mut(&output_id) else {
            return false;
        };
        let Some(layer) = output.layer_mut(LayerKind::Cursor) else {
            self.cursor.dirty.remove(&output_id);
            return false;
        };

        let frame = match layer.begin_frame(&Region::infinite()) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.cursor.dirty.remove(&output_id);
                return false;
            }
            Err(err) => {
                debug!("not updating the cursor: {err}");
                return false;
            }
        };

        let bounds = Rectangle::from_size(layer.size());
        let res = match layer.buffer_mut(&frame) {
            Some(buffer) => paint_cursor(
                &mut self.renderer,
                buffer,
                self.cursor.texture.as_ref(),
                bounds,
            ),
            None => Err(anyhow::anyhow!("the acquired slot has no buffer")),
        };
        if let Err(err) = res {
            warn!("error painting the cursor: {err:?}");
            layer.abort_frame(frame);
            return false;
        }

        let rendered = frame.repaint.clone();
        if !layer.end_frame(frame, &rendered, &rendered) {
            return false;
        }
        self.cursor.dirty.remove(&output_id);
        true
    }
}

fn paint_cursor(
    renderer: &mut dyn ItemRenderer,
    target: &mut Buffer,
    texture: Option<&Texture>,
    bounds: Rectangle<i32, Physical>,
) -> anyhow::Result<()> {
    let clip = Region::from_rect(bounds);

    renderer.begin_frame(target)?;
    renderer.clear(target, &clip, Color::TRANSPARENT);
    if let Some(texture) = texture {
        let size = texture.size();
        let quad = Quad {
            geometry: rect(0, 0, size.w, size.h),
            fill: QuadFill::Texture {
                src: Rectangle::from_size(size),
            },
        };
        renderer.draw_quad(target, &quad, Some(texture), &clip, 1.);
    }
    renderer.end_frame(target)
}
