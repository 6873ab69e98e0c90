//! Configuration for the compositing core.
//!
//! The configuration is a KDL document decoded with `knuffel`. Every section is optional and an
//! empty document yields [`Config::default()`].

use std::fs;
use std::path::Path;
use std::str::FromStr;

use knuffel::errors::DecodeError;
use miette::{miette, Context, IntoDiagnostic};
use tracing::debug;

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Config {
    #[knuffel(child, unwrap(argument, str), default)]
    pub renderer: RendererKind,
    #[knuffel(child, default)]
    pub render_loop: RenderLoop,
    #[knuffel(child, default)]
    pub swapchain: Swapchain,
    #[knuffel(child, default)]
    pub watchdog: Watchdog,
    #[knuffel(child, default)]
    pub debug: DebugConfig,
    #[knuffel(children(name = "output"))]
    pub outputs: Vec<Output>,
}

/// Which item renderer composes frames.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    /// CPU rasterization into memory buffers.
    #[default]
    Software,
    /// Records draw calls without producing pixels.
    None,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct RenderLoop {
    /// Consecutive rejected commits after which the output is disabled.
    #[knuffel(child, unwrap(argument), default = NonZero(3))]
    pub max_commit_failures: NonZero,
    /// Refresh rate used when the backend cannot report one, in Hz.
    #[knuffel(child, unwrap(argument), default = 60.)]
    pub refresh_rate: f64,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Swapchain {
    #[knuffel(child, unwrap(argument), default = NonZero(2))]
    pub slots: NonZero,
    #[knuffel(child, unwrap(argument), default = NonZero(10))]
    pub damage_journal_depth: NonZero,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Watchdog {
    #[knuffel(child)]
    pub off: bool,
    #[knuffel(child, unwrap(argument), default = 5000)]
    pub timeout_ms: u64,
}

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct DebugConfig {
    #[knuffel(child)]
    pub disable_buffer_age: bool,
    #[knuffel(child)]
    pub disable_direct_scanout: bool,
    #[knuffel(child)]
    pub force_full_repaint: bool,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Output {
    #[knuffel(argument)]
    pub name: String,
    #[knuffel(child)]
    pub off: bool,
    #[knuffel(child, unwrap(argument, str))]
    pub mode: Option<Mode>,
    #[knuffel(child, unwrap(argument))]
    pub scale: Option<f64>,
    #[knuffel(child)]
    pub position: Option<Position>,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    #[knuffel(property)]
    pub x: i32,
    #[knuffel(property)]
    pub y: i32,
}

/// Output mode in physical pixels, with an optional refresh rate in Hz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mode {
    pub width: u16,
    pub height: u16,
    pub refresh: Option<f64>,
}

/// A strictly positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NonZero(pub u32);

impl NonZero {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for RenderLoop {
    fn default() -> Self {
        Self {
            max_commit_failures: NonZero(3),
            refresh_rate: 60.,
        }
    }
}

impl Default for Swapchain {
    fn default() -> Self {
        Self {
            slots: NonZero(2),
            damage_journal_depth: NonZero(10),
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self {
            off: false,
            timeout_ms: 5000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            renderer: RendererKind::default(),
            render_loop: RenderLoop::default(),
            swapchain: Swapchain::default(),
            watchdog: Watchdog::default(),
            debug: DebugConfig::default(),
            outputs: Vec::new(),
        }
    }
}

impl Config {
    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let _span = tracy_client::span!("Config::parse");
        knuffel::parse(filename, text)
    }

    pub fn load(path: &Path) -> miette::Result<Self> {
        let _span = tracy_client::span!("Config::load");

        let contents = fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("config.kdl");
        let config = Self::parse(filename, &contents).context("error parsing")?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    /// Returns the configuration of the output with this name, if any.
    pub fn output(&self, name: &str) -> Option<&Output> {
        self.outputs
            .iter()
            .find(|output| output.name.eq_ignore_ascii_case(name))
    }
}

impl FromStr for RendererKind {
    type Err = miette::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "software" => Ok(Self::Software),
            "none" => Ok(Self::None),
            _ => Err(miette!(r#"invalid renderer, can be "software" or "none""#)),
        }
    }
}

impl FromStr for Mode {
    type Err = miette::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((width, rest)) = s.split_once('x') else {
            return Err(miette!("no 'x' separator found"));
        };

        let (height, refresh) = match rest.split_once('@') {
            Some((height, refresh)) => {
                let refresh = refresh
                    .parse::<f64>()
                    .map_err(|_| miette!("error parsing refresh rate"))?;
                if !(refresh.is_finite() && refresh > 0.) {
                    return Err(miette!("refresh rate must be positive"));
                }
                (height, Some(refresh))
            }
            None => (rest, None),
        };

        let width = width
            .parse::<u16>()
            .map_err(|_| miette!("error parsing width"))?;
        let height = height
            .parse::<u16>()
            .map_err(|_| miette!("error parsing height"))?;
        if width == 0 || height == 0 {
            return Err(miette!("mode size must not be zero"));
        }

        Ok(Self {
            width,
            height,
            refresh,
        })
    }
}

impl<S: knuffel::traits::ErrorSpan> knuffel::DecodeScalar<S> for NonZero {
    fn type_check(
        type_name: &Option<knuffel::span::Spanned<knuffel::ast::TypeName, S>>,
        ctx: &mut knuffel::decode::Context<S>,
    ) {
        if let Some(type_name) = &type_name {
            ctx.emit_error(DecodeError::unexpected(
                type_name,
                "type name",
                "no type name expected for this node",
            ));
        }
    }

    fn raw_decode(
        val: &knuffel::span::Spanned<knuffel::ast::Literal, S>,
        ctx: &mut knuffel::decode::Context<S>,
    ) -> Result<NonZero, DecodeError<S>> {
        let value = <u32 as knuffel::DecodeScalar<S>>::raw_decode(val, ctx)?;
        if value == 0 {
            ctx.emit_error(DecodeError::conversion(
                val,
                "value must be greater than zero",
            ));
        }
        Ok(Self(value.max(1)))
    }
}
