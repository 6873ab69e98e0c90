use std::env;

use anyhow::Context;
use calloop::signals::{Signal, Signals};
use calloop::EventLoop;
use clap::Parser;
use kwin::cli::Cli;
use kwin::kwin::State;
use kwin::output::Mode;
use kwin::render_helpers::{Color, Texture};
use kwin::scene::{ItemId, ItemKind};
use kwin::utils::rect;
use kwin_config::Config;
use smithay::utils::{Logical, Point, Rectangle, Size};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "kwin=debug";

/// A rectangle bouncing across one output.
struct DemoWindow {
    root: ItemId,
    area: Rectangle<i32, Logical>,
    size: Size<i32, Logical>,
}

impl DemoWindow {
    fn position_at(&self, step: u64) -> Point<i32, Logical> {
        let span = i64::from((self.area.size.w - self.size.w).max(1));
        let step = (step * 8) as i64 % (span * 2);
        let x = if step < span { step } else { span * 2 - step };
        Point::from((
            self.area.loc.x + x as i32,
            self.area.loc.y + (self.area.size.h - self.size.h) / 2,
        ))
    }
}

fn main() -> anyhow::Result<()> {
    let directives = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();

    let _client = tracy_client::Client::start();

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                warn!("{err:?}");
                Config::default()
            }
        },
        None => Config::default(),
    };

    let mut event_loop = EventLoop::<State>::try_new().context("error creating event loop")?;
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
        .context("error listening for signals")?;
    event_loop
        .handle()
        .insert_source(signals, |event, _, state| {
            info!("got {:?}, quitting", event.signal());
            state.kwin.stop_signal.stop();
        })
        .map_err(|err| err.error)
        .context("error inserting signal source")?;

    let refresh_rate = config.render_loop.refresh_rate;
    let mut state = State::new(config, event_loop.handle(), event_loop.get_signal())?;

    let (w, h) = cli.size;
    let refresh_mhz = (refresh_rate * 1000.).round() as u32;
    let mut demos = Vec::new();
    let mut x = 0;
    for i in 1..=cli.outputs {
        let id = state.kwin.add_output(
            &state.backend,
            format!("HEADLESS-{i}"),
            Mode::new(i32::from(w), i32::from(h), refresh_mhz),
            1.,
            Point::from((x, 0)),
        );
        let Some(output) = state.kwin.outputs.get(&id) else {
            continue;
        };
        let area = output.logical_geometry();
        x = area.loc.x + area.size.w;

        let scene = &mut state.kwin.scene;
        let window = scene.add_window(Some(std::process::id()), format!("demo {i}"));
        let root = scene.window(window).context("demo window vanished")?.root();
        let size = Size::from((area.size.w / 4, area.size.h / 4));
        scene.set_geometry(root, Rectangle::new(area.loc, size));
        let body = scene
            .create_item(root, ItemKind::SolidRect(Color::new(0.2, 0.4, 0.8, 1.)))
            .context("error creating demo item")?;
        scene.set_geometry(body, rect(0, 0, size.w, size.h));

        demos.push(DemoWindow { root, area, size });
    }
    state.kwin.log_unmatched_output_configs();

    let cursor = Texture::solid(Size::from((16, 16)), [255, 255, 255, 255])?;
    state.kwin.set_cursor_image(Some(cursor), Point::from((0, 0)));

    let frames = cli.frames;
    let mut step = 0;
    state.refresh_and_redraw();
    event_loop
        .run(None, &mut state, |state| {
            step += 1;
            for demo in &demos {
                let pos = demo.position_at(step);
                state.kwin.scene.set_position(demo.root, pos);
                state.kwin.move_cursor(pos);
            }

            state.refresh_and_redraw();

            if frames > 0 && state.kwin.presented_frames >= frames {
                info!("presented {} frames, quitting", state.kwin.presented_frames);
                state.kwin.stop_signal.stop();
            }
        })
        .context("error running event loop")?;

    Ok(())
}
