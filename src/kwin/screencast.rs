//! Capture layers: screencasts, zoom, screenshots and the color picker.
//!
//! Captures render into virtual layers that have no render loop of their own. Screencasts and
//! zoom views are refreshed right after their source output submits a frame, so they follow its
//! pacing; screenshots and color picks render once, on demand.

use anyhow::{bail, Context};
use smithay::utils::{Logical, Physical, Point, Rectangle, Size};
use tracing::{debug, trace, warn};

use super::Kwin;
use crate::output::layer::{CapturedFrame, LayerConfig, OutputLayer};
use crate::output::OutputId;
use crate::render_helpers::{read_pixel, Color};
use crate::scene::{SceneView, ViewId};
use crate::utils::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaptureId(u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureKind {
    /// The whole output, minus excluded windows.
    Screencast,
    /// A magnified part of the output.
    Zoom {
        center: Point<i32, Logical>,
        factor: f64,
    },
}

#[derive(Debug)]
pub struct Capture {
    id: CaptureId,
    kind: CaptureKind,
    source: OutputId,
    layer: OutputLayer,
    view: ViewId,
    last: Option<CapturedFrame>,
    frames: u64,
}

impl Capture {
    pub fn id(&self) -> CaptureId {
        self.id
    }

    pub fn kind(&self) -> CaptureKind {
        self.kind
    }

    pub fn source(&self) -> OutputId {
        self.source
    }

    pub fn view(&self) -> ViewId {
        self.view
    }

    pub fn layer(&self) -> &OutputLayer {
        &self.layer
    }

    /// The last rendered frame.
    pub fn last_frame(&self) -> Option<&CapturedFrame> {
        self.last.as_ref()
    }

    pub fn take_frame(&mut self) -> Option<CapturedFrame> {
        self.last.take()
    }

    /// Number of frames rendered so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Scene area shown by a zoom view.
fn zoom_viewport(
    output: Rectangle<i32, Logical>,
    center: Point<i32, Logical>,
    factor: f64,
) -> Rectangle<i32, Logical> {
    let factor = factor.max(1.);
    let w = ((f64::from(output.size.w) / factor).round() as i32).max(1);
    let h = ((f64::from(output.size.h) / factor).round() as i32).max(1);

    // Keep the viewport on the output.
    let max_x = output.loc.x + output.size.w - w;
    let max_y = output.loc.y + output.size.h - h;
    let x = (center.x - w / 2).clamp(output.loc.x, max_x.max(output.loc.x));
    let y = (center.y - h / 2).clamp(output.loc.y, max_y.max(output.loc.y));
    Rectangle::new(Point::from((x, y)), Size::from((w, h)))
}

// =============================================================================
// Starting and Stopping
// =============================================================================

impl Kwin {
    /// Starts capturing an output.
    ///
    /// Windows marked as excluded from capture never appear, and neither do windows of
    /// `exclude_pid`, typically the process recording the screen.
    pub fn start_screencast(
        &mut self,
        output: OutputId,
        exclude_pid: Option<u32>,
    ) -> anyhow::Result<CaptureId> {
        let (viewport, scale, size) = {
            let output = self.outputs.get(&output).context("output does not exist")?;
            if !output.enabled {
                bail!("output {} is disabled", output.name);
            }
            (output.logical_geometry(), output.scale, output.mode.size)
        };

        let mut view = SceneView::new(viewport, scale);
        view.add_window_filter(move |window| {
            window.exclude_from_capture()
                || exclude_pid.is_some_and(|pid| window.pid() == Some(pid))
        });

        let id = self.add_capture(CaptureKind::Screencast, output, view, size);
        debug!("started screencast {id:?} of {output:?}");
        Ok(id)
    }

    /// Starts magnifying the area around `center` on an output.
    pub fn start_zoom(
        &mut self,
        output: OutputId,
        center: Point<i32, Logical>,
        factor: f64,
    ) -> anyhow::Result<CaptureId> {
        let (viewport, scale, size) = {
            let output = self.outputs.get(&output).context("output does not exist")?;
            if !output.enabled {
                bail!("output {} is disabled", output.name);
            }
            let viewport = zoom_viewport(output.logical_geometry(), center, factor);
            (viewport, output.scale * factor.max(1.), output.mode.size)
        };

        let view = SceneView::new(viewport, scale);
        let kind = CaptureKind::Zoom { center, factor };
        let id = self.add_capture(kind, output, view, size);
        debug!("started zoom {id:?} of {output:?} at {factor}x");
        Ok(id)
    }

    /// Moves or rescales a zoom view.
    pub fn set_zoom(&mut self, id: CaptureId, center: Point<i32, Logical>, factor: f64) {
        let Some(capture) = self.captures.iter_mut().find(|c| c.id == id) else {
            return;
        };
        if !matches!(capture.kind, CaptureKind::Zoom { .. }) {
            return;
        }
        let Some(output) = self.outputs.get_mut(&capture.source) else {
            return;
        };

        capture.kind = CaptureKind::Zoom { center, factor };
        let viewport = zoom_viewport(output.logical_geometry(), center, factor);
        if let Some(view) = self.scene.view_mut(capture.view) {
            view.set_viewport(viewport, output.scale * factor.max(1.));
        }
        output.render_loop.schedule_frame();
    }

    fn add_capture(
        &mut self,
        kind: CaptureKind,
        source: OutputId,
        view: SceneView,
        size: Size<i32, Physical>,
    ) -> CaptureId {
        let id = CaptureId(self.next_capture_id);
        self.next_capture_id += 1;

        let layer = OutputLayer::new_virtual(
            size,
            self.allocator.clone(),
            LayerConfig::from_config(&self.config),
        );
        let view = self.scene.add_view(view);
        self.captures.push(Capture {
            id,
            kind,
            source,
            layer,
            view,
            last: None,
            frames: 0,
        });

        // The first frame of a capture cannot wait for the output to change.
        if let Some(output) = self.outputs.get_mut(&source) {
            output.render_loop.schedule_frame();
        }
        id
    }

    /// Stops a capture. Returns `false` if there was no such capture.
    pub fn stop_capture(&mut self, id: CaptureId) -> bool {
        let Some(idx) = self.captures.iter().position(|c| c.id == id) else {
            return false;
        };
        let mut capture = self.captures.remove(idx);
        debug!("stopping capture {id:?}");
        capture.layer.release_buffers();
        self.scene.remove_view(capture.view);
        true
    }

    pub(super) fn stop_captures_for_output(&mut self, output: OutputId) {
        let ids: Vec<_> = self
            .captures
            .iter()
            .filter(|c| c.source == output)
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.stop_capture(id);
        }
    }

    /// Follows a change of the source output's geometry.
    pub(super) fn update_captures_for_output(&mut self, output_id: OutputId) {
        let Some(output) = self.outputs.get(&output_id) else {
            return;
        };
        for capture in self.captures.iter_mut().filter(|c| c.source == output_id) {
            let (viewport, scale) = match capture.kind {
                CaptureKind::Screencast => (output.logical_geometry(), output.scale),
                CaptureKind::Zoom { center, factor } => (
                    zoom_viewport(output.logical_geometry(), center, factor),
                    output.scale * factor.max(1.),
                ),
            };
            if let Some(view) = self.scene.view_mut(capture.view) {
                view.set_viewport(viewport, scale);
            }
            capture.layer.set_size(output.mode.size);
        }
    }

    /// The output a capture view belongs to, if `view` is one.
    pub(super) fn capture_source(&self, view: ViewId) -> Option<OutputId> {
        self.captures
            .iter()
            .find(|c| c.view == view)
            .map(|c| c.source)
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    /// Renders the captures of an output that changed since their last frame.
    pub(super) fn render_captures(&mut self, source: OutputId) {
        let _span = tracy_client::span!("Kwin::render_captures");

        for capture in self.captures.iter_mut().filter(|c| c.source == source) {
            let Some(view) = self.scene.view_mut(capture.view) else {
                continue;
            };
            // Nothing changed since the last frame this capture delivered.
            if capture.frames > 0 && view.damage().is_empty() {
                continue;
            }
            let bounds = Rectangle::from_size(capture.layer.size());
            let damage = view.take_damage().intersect_rect(bounds);

            let frame = match capture.layer.begin_frame(&damage) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(err) => {
                    debug!("skipping capture frame of {:?}: {err}", capture.id);
                    if let Some(view) = self.scene.view_mut(capture.view) {
                        view.add_device_damage(&damage);
                    }
                    continue;
                }
            };

            let windows = self
                .effects
                .pre_paint_windows(source, self.scene.windows_in_view(capture.view));
            let res = match capture.layer.buffer_mut(&frame) {
                Some(buffer) => self.scene.paint(
                    capture.view,
                    &mut self.renderer,
                    buffer,
                    &frame.repaint,
                    &windows,
                ),
                None => Err(anyhow::anyhow!("the acquired slot has no buffer")),
            };
            if let Err(err) = res {
                warn!("error rendering capture {:?}: {err:?}", capture.id);
                capture.layer.abort_frame(frame);
                continue;
            }

            let rendered = frame.repaint.clone();
            if !capture.layer.end_frame(frame, &rendered, &damage) {
                continue;
            }
            if let Some(mut captured) = capture.layer.take_capture() {
                // Consumers want to know what changed, not what was redrawn.
                captured.damage = damage;
                capture.last = Some(captured);
                capture.frames += 1;
                trace!("capture {:?} frame {}", capture.id, capture.frames);
            }
        }
    }

    /// Renders one frame of an output into memory.
    pub fn screenshot(&mut self, output: OutputId) -> anyhow::Result<CapturedFrame> {
        let _span = tracy_client::span!("Kwin::screenshot");

        let (viewport, scale, size) = {
            let output = self.outputs.get(&output).context("output does not exist")?;
            (output.logical_geometry(), output.scale, output.mode.size)
        };
        self.render_offscreen(output, viewport, scale, size)
    }

    /// Reads the color of the scene at a point.
    pub fn pick_color(&mut self, point: Point<i32, Logical>) -> anyhow::Result<Color> {
        let _span = tracy_client::span!("Kwin::pick_color");

        let output = self
            .outputs
            .values()
            .find(|output| output.enabled && output.logical_geometry().contains(point))
            .map(|output| output.id)
            .context("no output at this point")?;

        let viewport = Rectangle::new(point, Size::from((1, 1)));
        let frame = self.render_offscreen(output, viewport, 1., Size::from((1, 1)))?;
        let px = frame.data.get(..4).context("captured frame is empty")?;
        read_pixel(frame.format, px).context("unsupported capture format")
    }

    fn render_offscreen(
        &mut self,
        output: OutputId,
        viewport: Rectangle<i32, Logical>,
        scale: f64,
        size: Size<i32, Physical>,
    ) -> anyhow::Result<CapturedFrame> {
        let view = self.scene.add_view(SceneView::new(viewport, scale));
        let mut layer = OutputLayer::new_virtual(
            size,
            self.allocator.clone(),
            LayerConfig::from_config(&self.config),
        );

        let res = (|| -> anyhow::Result<CapturedFrame> {
            let frame = layer
                .begin_frame(&Region::infinite())
                .context("error starting the frame")?
                .context("nothing to render")?;

            let windows = self
                .effects
                .pre_paint_windows(output, self.scene.windows_in_view(view));
            let buffer = layer
                .buffer_mut(&frame)
                .context("the acquired slot has no buffer")?;
            self.scene
                .paint(view, &mut self.renderer, buffer, &frame.repaint, &windows)?;

            let rendered = frame.repaint.clone();
            if !layer.end_frame(frame, &rendered, &rendered) {
                bail!("error finishing the frame");
            }
            layer.take_capture().context("the layer kept no pixels")
        })();

        layer.release_buffers();
        self.scene.remove_view(view);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::rect;

    #[test]
    fn zoom_viewport_stays_on_the_output() {
        let output = rect(0, 0, 1000, 500);
        assert_eq!(
            zoom_viewport(output, Point::from((500, 250)), 2.),
            rect(250, 125, 500, 250)
        );
        assert_eq!(
            zoom_viewport(output, Point::from((0, 0)), 2.),
            rect(0, 0, 500, 250)
        );
        assert_eq!(
            zoom_viewport(output, Point::from((1000, 500)), 4.),
            rect(750, 375, 250, 125)
        );
        // Zooming out is not a thing.
        assert_eq!(zoom_viewport(output, Point::from((10, 10)), 0.5), output);
    }
}
