//! Hooks that let effects alter composition.
//!
//! Each composition pass calls [`Effect::pre_paint_screen`] once, [`Effect::pre_paint_window`]
//! for every window the view shows, then [`Effect::post_paint_screen`] after the frame is
//! submitted.

use std::collections::HashMap;
use std::time::Duration;

use bitflags::bitflags;
use smithay::utils::Physical;
use tracing::debug;

use crate::output::OutputId;
use crate::utils::Region;
use crate::window::{Window, WindowId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScreenPaintFlags: u32 {
        /// Repaint the whole output regardless of damage.
        const FULL_REPAINT = 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WindowPaintFlags: u32 {
        /// The window may show what is below it, so it must not occlude anything.
        const TRANSLUCENT = 1;
        /// Do not paint the window at all.
        const DISABLED = 1 << 1;
    }
}

#[derive(Debug, Clone)]
pub struct ScreenPrePaintData {
    pub output: OutputId,
    pub flags: ScreenPaintFlags,
    pub damage: Region<Physical>,
    /// When the frame is expected to reach the screen.
    pub presentation_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPaintData {
    pub flags: WindowPaintFlags,
    pub opacity: f64,
}

impl Default for WindowPaintData {
    fn default() -> Self {
        Self {
            flags: WindowPaintFlags::empty(),
            opacity: 1.,
        }
    }
}

pub trait Effect {
    fn name(&self) -> &str;

    fn pre_paint_screen(&mut self, _data: &mut ScreenPrePaintData) {}

    fn pre_paint_window(
        &mut self,
        _output: OutputId,
        _window: &Window,
        _data: &mut WindowPaintData,
    ) {
    }

    /// Returns `true` to request another frame, for example while animating.
    fn post_paint_screen(&mut self, _output: OutputId) -> bool {
        false
    }
}

/// Active effects in the order they were loaded.
#[derive(Default)]
pub struct EffectChain {
    effects: Vec<Box<dyn Effect>>,
}

impl EffectChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, effect: Box<dyn Effect>) {
        debug!("loading effect {}", effect.name());
        self.effects.push(effect);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let len = self.effects.len();
        self.effects.retain(|effect| effect.name() != name);
        len != self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn pre_paint_screen(&mut self, data: &mut ScreenPrePaintData) {
        for effect in &mut self.effects {
            effect.pre_paint_screen(data);
        }
        if data.flags.contains(ScreenPaintFlags::FULL_REPAINT) {
            data.damage = Region::infinite();
        }
    }

    pub fn pre_paint_windows<'a>(
        &mut self,
        output: OutputId,
        windows: impl IntoIterator<Item = &'a Window>,
    ) -> HashMap<WindowId, WindowPaintData> {
        let mut rv = HashMap::new();
        for window in windows {
            let mut data = WindowPaintData::default();
            for effect in &mut self.effects {
                effect.pre_paint_window(output, window, &mut data);
            }
            if data.opacity < 1. {
                data.flags |= WindowPaintFlags::TRANSLUCENT;
            }
            rv.insert(window.id(), data);
        }
        rv
    }

    pub fn post_paint_screen(&mut self, output: OutputId) -> bool {
        let mut more = false;
        for effect in &mut self.effects {
            more |= effect.post_paint_screen(output);
        }
        more
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Scene;

    struct Fade(f64);

    impl Effect for Fade {
        fn name(&self) -> &str {
            "fade"
        }

        fn pre_paint_window(
            &mut self,
            _output: OutputId,
            _window: &Window,
            data: &mut WindowPaintData,
        ) {
            data.opacity *= self.0;
        }
    }

    #[test]
    fn faded_windows_are_translucent() {
        let mut scene = Scene::new();
        let id = scene.add_window(None, "a");
        let output = OutputId::for_tests(1);

        let mut chain = EffectChain::new();
        let data = chain.pre_paint_windows(output, scene.window(id));
        assert_eq!(data[&id], WindowPaintData::default());

        chain.push(Box::new(Fade(0.5)));
        chain.push(Box::new(Fade(0.5)));
        let data = chain.pre_paint_windows(output, scene.window(id));
        assert_eq!(data[&id].opacity, 0.25);
        assert!(data[&id].flags.contains(WindowPaintFlags::TRANSLUCENT));

        assert!(chain.remove("fade"));
        assert!(chain.is_empty());
        assert!(!chain.remove("fade"));
    }

    #[test]
    fn full_repaint_flag_widens_damage() {
        let mut chain = EffectChain::new();
        let mut data = ScreenPrePaintData {
            output: OutputId::for_tests(1),
            flags: ScreenPaintFlags::FULL_REPAINT,
            damage: Region::new(),
            presentation_time: Duration::ZERO,
        };
        chain.pre_paint_screen(&mut data);
        assert!(data.damage.is_infinite());
    }
}
