use smithay::utils::Point;

use super::fixture::*;
use crate::kwin::{CaptureId, CaptureKind};
use crate::output::OutputId;
use crate::render_helpers::Color;
use crate::utils::{rect, Region};
use crate::window::WindowId;

/// A 64x64 output showing a red window of pid 100 and a green window of pid 200.
fn two_windows() -> (Fixture, OutputId, WindowId) {
    let mut f = Fixture::with_config(software_config());
    let output = f.add_output("HEADLESS-1", 64, 64);
    f.add_window(100, rect(10, 10, 20, 20), RED);
    let green = f.add_window(200, rect(40, 40, 10, 10), GREEN);
    (f, output, green)
}

fn frames(f: &Fixture, id: CaptureId) -> u64 {
    f.state
        .kwin
        .captures
        .iter()
        .find(|c| c.id() == id)
        .unwrap()
        .frames()
}

#[test]
fn screencast_hides_excluded_windows() {
    let (mut f, output, _) = two_windows();
    let cast = f.kwin().start_screencast(output, Some(100)).unwrap();
    f.refresh();

    let capture = &f.state.kwin.captures[0];
    assert_eq!(capture.id(), cast);
    assert_eq!(capture.kind(), CaptureKind::Screencast);
    assert_eq!(capture.frames(), 1);
    let frame = capture.last_frame().unwrap();
    assert_eq!(pixel(frame, 15, 15), Color::BLACK);
    assert_eq!(pixel(frame, 45, 45), GREEN);

    // The screen itself still shows the window.
    let shot = f.kwin().screenshot(output).unwrap();
    assert_eq!(pixel(&shot, 15, 15), RED);
    assert_eq!(pixel(&shot, 45, 45), GREEN);
}

#[test]
fn toggling_capture_exclusion_produces_a_frame() {
    let (mut f, output, green) = two_windows();
    let cast = f.kwin().start_screencast(output, None).unwrap();
    f.refresh();
    f.vblank(output);
    assert_eq!(frames(&f, cast), 1);

    let commits = f.primary_plane(output).commits();
    f.kwin().scene.set_exclude_from_capture(green, true);
    f.refresh();

    // Only the capture changed, the output has nothing new to show.
    assert_eq!(f.primary_plane(output).commits(), commits);
    assert_eq!(frames(&f, cast), 2);
    let frame = f.state.kwin.captures[0].last_frame().unwrap();
    assert!(frame
        .damage
        .contains_region(&Region::from_rect(rect(40, 40, 10, 10))));
    assert_eq!(pixel(frame, 45, 45), Color::BLACK);
    assert_eq!(pixel(frame, 15, 15), RED);

    f.kwin().scene.set_exclude_from_capture(green, false);
    f.refresh();
    assert_eq!(frames(&f, cast), 3);
    let frame = f.state.kwin.captures[0].last_frame().unwrap();
    assert_eq!(pixel(frame, 45, 45), GREEN);
}

#[test]
fn unchanged_capture_is_not_rendered_again() {
    let (mut f, output, _) = two_windows();
    let cast = f.kwin().start_screencast(output, None).unwrap();
    f.refresh();
    f.vblank(output);

    let item = f.add_rect(rect(0, 0, 4, 4), GREEN);
    f.refresh();
    assert_eq!(frames(&f, cast), 2);
    f.vblank(output);

    // A redraw without damage leaves the capture alone.
    assert!(f.kwin().captures[0].take_frame().is_some());
    f.kwin().queue_redraw(output);
    f.refresh();
    assert_eq!(frames(&f, cast), 2);
    assert!(f.state.kwin.captures[0].last_frame().is_none());

    f.kwin().scene.remove_item(item);
    f.refresh();
    assert_eq!(frames(&f, cast), 3);
}

#[test]
fn zoom_magnifies_around_the_center() {
    let (mut f, output, _) = two_windows();
    let zoom = f
        .kwin()
        .start_zoom(output, Point::from((20, 20)), 2.)
        .unwrap();
    f.refresh();

    let capture = &f.state.kwin.captures[0];
    assert_eq!(
        capture.kind(),
        CaptureKind::Zoom {
            center: Point::from((20, 20)),
            factor: 2.
        }
    );
    let view = f.state.kwin.scene.view(capture.view()).unwrap();
    assert_eq!(view.viewport(), rect(4, 4, 32, 32));

    let frame = capture.last_frame().unwrap();
    // Device (30, 30) shows scene (19, 19).
    assert_eq!(pixel(frame, 30, 30), RED);
    assert_eq!(pixel(frame, 2, 2), Color::BLACK);

    // Near the edge the viewport stays on the output.
    f.vblank(output);
    f.kwin().set_zoom(zoom, Point::from((60, 60)), 2.);
    f.refresh();
    let capture = &f.state.kwin.captures[0];
    let view = f.state.kwin.scene.view(capture.view()).unwrap();
    assert_eq!(view.viewport(), rect(32, 32, 32, 32));
    assert_eq!(capture.frames(), 2);
    // Device (20, 20) shows scene (42, 42).
    assert_eq!(pixel(capture.last_frame().unwrap(), 20, 20), GREEN);
}

#[test]
fn pick_color_reads_the_scene() {
    let (mut f, _, _) = two_windows();
    f.refresh();

    assert_eq!(f.kwin().pick_color(Point::from((15, 15))).unwrap(), RED);
    assert_eq!(f.kwin().pick_color(Point::from((45, 45))).unwrap(), GREEN);
    assert_eq!(
        f.kwin().pick_color(Point::from((60, 2))).unwrap(),
        Color::BLACK
    );
    assert!(f.kwin().pick_color(Point::from((100, 100))).is_err());
}

#[test]
fn offscreen_renders_leave_nothing_behind() {
    let (mut f, output, _) = two_windows();
    f.refresh();
    let views = f.state.kwin.scene.view_count();
    let bytes = f.state.backend.allocator().bytes_in_use();

    f.kwin().screenshot(output).unwrap();
    f.kwin().pick_color(Point::from((1, 1))).unwrap();

    assert_eq!(f.state.kwin.scene.view_count(), views);
    assert_eq!(f.state.backend.allocator().bytes_in_use(), bytes);
}

#[test]
fn captures_end_with_their_output() {
    let (mut f, output, _) = two_windows();
    let cast = f.kwin().start_screencast(output, None).unwrap();
    f.kwin().start_zoom(output, Point::from((0, 0)), 4.).unwrap();
    f.refresh();
    let view = f.state.kwin.captures[0].view();

    assert!(f.kwin().stop_capture(cast));
    assert!(!f.kwin().stop_capture(cast));
    assert!(f.state.kwin.scene.view(view).is_none());
    assert_eq!(f.state.kwin.captures.len(), 1);

    f.kwin().disable_output(output);
    assert!(f.state.kwin.captures.is_empty());
    assert!(f.kwin().start_screencast(output, None).is_err());
}
