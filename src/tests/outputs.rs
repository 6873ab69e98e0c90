use std::thread;
use std::time::Duration;

use kwin_config::{Output as OutputConfig, Position};
use smithay::utils::{Point, Size};

use super::fixture::*;
use crate::backend::headless::VblankMode;
use crate::output::layer::LayerKind;
use crate::output::render_loop::RenderLoopState;
use crate::output::Mode;
use crate::render_helpers::Texture;
use crate::utils::rect;

#[test]
fn config_overrides_what_the_backend_reports() {
    let mut config = null_config();
    config.outputs.push(OutputConfig {
        name: "HEADLESS-1".to_owned(),
        off: false,
        mode: Some(kwin_config::Mode {
            width: 320,
            height: 200,
            refresh: Some(30.),
        }),
        scale: Some(2.),
        position: Some(Position { x: 100, y: 0 }),
    });
    config.outputs.push(OutputConfig {
        name: "HEADLESS-2".to_owned(),
        off: true,
        mode: None,
        scale: None,
        position: None,
    });

    let mut f = Fixture::with_config(config);
    let first = f.add_output("HEADLESS-1", 640, 480);
    let second = f.add_output("HEADLESS-2", 640, 480);

    let output = f.output(first);
    assert!(output.enabled);
    assert_eq!(output.mode, Mode::new(320, 200, 30_000));
    assert_eq!(output.scale, 2.);
    assert_eq!(output.logical_geometry(), rect(100, 0, 160, 100));
    assert_eq!(
        output.render_loop.refresh_interval(),
        Mode::new(320, 200, 30_000).refresh_interval()
    );
    assert_eq!(f.primary(first).size(), Size::from((320, 200)));

    let output = f.output(second);
    assert!(!output.enabled);
    assert!(output.layers.is_empty());
    assert!(output.view.is_none());

    // Only the enabled output gets a frame.
    f.refresh();
    assert_eq!(
        f.render_state(first),
        RenderLoopState::Presented {
            redraw_needed: false
        }
    );
    assert_eq!(f.render_state(second), RenderLoopState::Idle);
}

#[test]
fn invalid_scale_falls_back_to_one() {
    let mut f = Fixture::new();
    let state = &mut f.state;
    let output = state.kwin.add_output(
        &state.backend,
        "HEADLESS-1".to_owned(),
        Mode::new(100, 100, 60_000),
        0.,
        Point::from((0, 0)),
    );
    assert_eq!(f.output(output).scale, 1.);

    f.kwin().set_output_scale(output, f64::NAN);
    assert_eq!(f.output(output).scale, 1.);
}

#[test]
fn mode_change_repaints_into_a_new_swapchain() {
    let mut f = Fixture::new();
    let output = f.add_output("HEADLESS-1", 100, 100);
    f.add_rect(rect(0, 0, 200, 100), RED);
    f.refresh();
    f.vblank(output);
    assert_eq!(f.swapchain(output).size(), Size::from((100, 100)));

    let mode = Mode::new(200, 100, 120_000);
    f.kwin().set_output_mode(output, mode);
    f.refresh();

    assert_eq!(f.swapchain(output).size(), Size::from((200, 100)));
    assert_eq!(f.painted().area(), 200 * 100);
    assert_eq!(
        f.output(output).render_loop.refresh_interval(),
        mode.refresh_interval()
    );
}

#[test]
fn moving_an_output_shows_another_part_of_the_scene() {
    let mut f = Fixture::new();
    let output = f.add_output("HEADLESS-1", 100, 100);
    f.refresh();
    f.vblank(output);

    f.kwin().set_output_position(output, Point::from((50, 0)));
    f.refresh();

    let view = f.output(output).view.unwrap();
    let view = f.state.kwin.scene.view(view).unwrap();
    assert_eq!(view.viewport(), rect(50, 0, 100, 100));
    assert_eq!(f.painted().area(), 100 * 100);
}

#[test]
fn cursor_updates_without_composing() {
    let mut f = Fixture::new();
    let output = f.add_output("HEADLESS-1", 100, 100);
    f.refresh();
    f.vblank(output);
    let commits = f.primary_plane(output).commits();
    let presented = f.state.kwin.presented_frames;

    let texture = Texture::solid(Size::from((16, 16)), [255, 255, 255, 255]).unwrap();
    f.kwin().set_cursor_image(Some(texture), Point::from((2, 3)));
    f.kwin().move_cursor(Point::from((30, 40)));
    f.refresh();

    assert_eq!(f.primary_plane(output).commits(), commits);
    assert_eq!(f.cursor_plane(output).commits(), 1);
    assert!(f.cursor_plane(output).pending().is_some());
    assert_eq!(f.render_state(output), RenderLoopState::Idle);
    assert_eq!(
        f.output(output)
            .layer(LayerKind::Cursor)
            .unwrap()
            .position(),
        Point::from((28, 37))
    );

    // Cursor flips are not frames of the output.
    f.vblank(output);
    assert!(f.cursor_plane(output).current().is_some());
    assert!(f.cursor_plane(output).pending().is_none());
    assert_eq!(f.state.kwin.presented_frames, presented);

    // The image is committed once.
    f.kwin().queue_redraw(output);
    f.refresh();
    assert_eq!(f.cursor_plane(output).commits(), 1);
}

#[test]
fn removed_output_is_forgotten() {
    let mut f = Fixture::new();
    let output = f.add_output("HEADLESS-1", 100, 100);
    f.refresh();
    let view = f.output(output).view.unwrap();

    f.kwin().remove_output(output);

    assert!(!f.state.kwin.outputs.contains_key(&output));
    assert!(f.state.kwin.scene.view(view).is_none());
    assert_eq!(f.state.backend.allocator().bytes_in_use(), 0);

    // Feedback for a gone output is ignored.
    f.vblank(output);
    f.refresh();
}

/// Lets the vblank timers of a 60 Hz output expire and runs them.
fn wait_for_vblank_timers(f: &mut Fixture) {
    thread::sleep(Duration::from_millis(40));
    f.event_loop
        .dispatch(Duration::ZERO, &mut f.state)
        .unwrap();
}

#[test]
fn reenabled_output_gets_no_stale_vblank() {
    let mut f = Fixture::new();
    f.state
        .backend
        .headless_mut()
        .set_vblank_mode(VblankMode::Timer);
    let output = f.add_output("HEADLESS-1", 100, 100);

    f.refresh();
    assert!(f.output(output).vblank_timer.is_some());
    wait_for_vblank_timers(&mut f);
    assert_eq!(f.state.kwin.presented_frames, 1);
    assert!(f.output(output).vblank_timer.is_none());
    assert_eq!(f.render_state(output), RenderLoopState::Idle);

    // Disable the output with a frame in flight.
    f.add_rect(rect(0, 0, 10, 10), RED);
    f.refresh();
    assert!(f.output(output).vblank_timer.is_some());
    f.kwin().disable_output(output);
    assert!(f.output(output).vblank_timer.is_none());

    let state = &mut f.state;
    state.kwin.enable_output(&state.backend, output);
    wait_for_vblank_timers(&mut f);

    assert_eq!(f.state.kwin.presented_frames, 1);
    assert_eq!(f.render_state(output), RenderLoopState::Scheduled);
    assert!(f.primary_plane(output).current().is_none());
}
