//! Frame scheduling of one output.
//!
//! The render loop decides when an output composes. It coalesces repaint requests into one pending
//! region, allows at most one frame in flight, and only advances the animation clock when a frame
//! was actually presented. Timers are armed by the owner; the loop itself only tracks state.

use std::mem;
use std::time::Duration;

use smithay::utils::Physical;
use tracing::{debug, error, trace};

use crate::animation::Clock;
use crate::utils::{get_monotonic_time, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderLoopState {
    /// Nothing to do.
    Idle,
    /// A frame should be composed at the next tick.
    Scheduled,
    /// A frame is being composed.
    Rendering,
    /// A frame was submitted and is waiting for presentation feedback.
    Presented {
        /// Damage or a frame request arrived while waiting.
        redraw_needed: bool,
    },
    /// The output is gone or was disabled. Terminal.
    Disposed,
}

/// What to do after a rejected commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFailure {
    /// Try again with the same damage at the next tick.
    Retry,
    /// Too many consecutive failures; the output should be disabled.
    Fatal,
}

#[derive(Debug)]
pub struct RenderLoop {
    state: RenderLoopState,
    /// Damage waiting for the next frame.
    pending: Region<Physical>,
    /// Damage of the frame being composed or waiting for presentation.
    in_flight: Region<Physical>,
    /// A frame was requested without damage, for example by a running animation.
    frame_requested: bool,
    refresh_interval: Duration,
    last_presentation_time: Option<Duration>,
    consecutive_failures: u32,
    max_failures: u32,
    sequence: u64,
    clock: Clock,
}

impl RenderLoop {
    pub fn new(refresh_interval: Duration, max_failures: u32) -> Self {
        Self {
            state: RenderLoopState::Idle,
            pending: Region::new(),
            in_flight: Region::new(),
            frame_requested: false,
            refresh_interval,
            last_presentation_time: None,
            consecutive_failures: 0,
            max_failures: max_failures.max(1),
            sequence: 0,
            clock: Clock::new(),
        }
    }

    pub fn state(&self) -> RenderLoopState {
        self.state
    }

    pub fn is_disposed(&self) -> bool {
        self.state == RenderLoopState::Disposed
    }

    pub fn pending(&self) -> &Region<Physical> {
        &self.pending
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Number of presented frames.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn set_refresh_interval(&mut self, interval: Duration) {
        self.refresh_interval = interval;
        // Old timestamps no longer line up with the new cadence.
        self.last_presentation_time = None;
    }

    /// Adds damage for the next frame.
    ///
    /// Returns `true` if the loop went from idle to scheduled and the caller must arm a tick.
    /// Repeated requests before the tick only grow the pending region.
    pub fn schedule_repaint(&mut self, region: &Region<Physical>) -> bool {
        if self.is_disposed() {
            return false;
        }
        if region.is_infinite() {
            self.pending = Region::infinite();
        } else if !self.pending.is_infinite() {
            self.pending.add_region(region);
        }
        self.schedule()
    }

    /// Asks for a frame even without damage.
    pub fn schedule_frame(&mut self) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.frame_requested = true;
        self.schedule()
    }

    fn schedule(&mut self) -> bool {
        match self.state {
            RenderLoopState::Idle => {
                self.state = RenderLoopState::Scheduled;
                true
            }
            RenderLoopState::Presented { .. } => {
                self.state = RenderLoopState::Presented {
                    redraw_needed: true,
                };
                false
            }
            RenderLoopState::Scheduled
            | RenderLoopState::Rendering
            | RenderLoopState::Disposed => false,
        }
    }

    /// Starts composing at a tick and returns the damage to render.
    ///
    /// Returns `None` unless a frame is scheduled.
    pub fn begin_frame(&mut self) -> Option<Region<Physical>> {
        if self.state != RenderLoopState::Scheduled {
            trace!("tick in {:?}, not rendering", self.state);
            return None;
        }

        self.state = RenderLoopState::Rendering;
        self.frame_requested = false;
        self.in_flight = mem::take(&mut self.pending);
        Some(self.in_flight.clone())
    }

    /// The frame reached the display and awaits presentation feedback.
    pub fn frame_submitted(&mut self) {
        match self.state {
            RenderLoopState::Rendering => {
                self.state = RenderLoopState::Presented {
                    redraw_needed: !self.pending.is_empty() || self.frame_requested,
                };
            }
            state => error!("frame submitted in unexpected state {state:?}"),
        }
    }

    /// Nothing needed presenting. Returns `true` if a new tick must be armed.
    pub fn frame_skipped(&mut self) -> bool {
        if self.state != RenderLoopState::Rendering {
            error!("frame skipped in unexpected state {:?}", self.state);
            return false;
        }

        self.in_flight.clear();
        if self.pending.is_empty() && !self.frame_requested {
            self.state = RenderLoopState::Idle;
            false
        } else {
            self.state = RenderLoopState::Scheduled;
            true
        }
    }

    /// The frame could not start, for example because no buffer was free.
    ///
    /// The damage goes back to pending and the loop stays scheduled; the caller arms a tick one
    /// refresh later.
    pub fn frame_deferred(&mut self) {
        if self.state != RenderLoopState::Rendering {
            error!("frame deferred in unexpected state {:?}", self.state);
            return;
        }
        self.restore_in_flight();
        self.state = RenderLoopState::Scheduled;
    }

    /// The display rejected the frame.
    ///
    /// The same damage is retried and the clock does not move.
    pub fn frame_failed(&mut self) -> FrameFailure {
        if self.state != RenderLoopState::Rendering {
            error!("frame failed in unexpected state {:?}", self.state);
            return FrameFailure::Retry;
        }

        self.restore_in_flight();
        self.state = RenderLoopState::Scheduled;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.max_failures {
            debug!(
                "{} consecutive frames failed, giving up",
                self.consecutive_failures
            );
            FrameFailure::Fatal
        } else {
            FrameFailure::Retry
        }
    }

    fn restore_in_flight(&mut self) {
        let in_flight = mem::take(&mut self.in_flight);
        if in_flight.is_infinite() || self.pending.is_infinite() {
            self.pending = Region::infinite();
        } else {
            self.pending.add_region(&in_flight);
        }
    }

    /// Presentation feedback for the submitted frame.
    ///
    /// Returns `true` if another frame is due and the caller must arm a tick.
    pub fn presented(&mut self, presentation_time: Duration) -> bool {
        let RenderLoopState::Presented { redraw_needed } = self.state else {
            error!("presentation feedback in unexpected state {:?}", self.state);
            return false;
        };

        // Zero means the backend does not know when the frame was shown.
        let presentation_time = if presentation_time.is_zero() {
            get_monotonic_time()
        } else {
            presentation_time
        };

        if !self.clock.advance_to(presentation_time) {
            debug!("presentation time went backwards");
        }
        self.last_presentation_time = Some(presentation_time);
        self.consecutive_failures = 0;
        self.sequence += 1;
        self.in_flight.clear();

        if redraw_needed || !self.pending.is_empty() || self.frame_requested {
            self.state = RenderLoopState::Scheduled;
            true
        } else {
            self.state = RenderLoopState::Idle;
            false
        }
    }

    /// Predicts when a frame started now would be presented.
    pub fn next_presentation_time(&self, now: Duration) -> Duration {
        let Some(last) = self.last_presentation_time else {
            return now + self.refresh_interval;
        };
        if self.refresh_interval.is_zero() || last > now {
            return last.max(now) + self.refresh_interval;
        }

        let since_last = (now - last).as_nanos();
        let interval = self.refresh_interval.as_nanos();
        let frames = since_last / interval + 1;
        last + Duration::from_nanos((frames * interval) as u64)
    }

    /// Stops the loop for good.
    pub fn dispose(&mut self) {
        self.state = RenderLoopState::Disposed;
        self.pending.clear();
        self.in_flight.clear();
        self.frame_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;
    use crate::utils::rect;

    const REFRESH: Duration = Duration::from_micros(16_667);

    fn region(x: i32) -> Region<Physical> {
        Region::from_rect(rect(x, 0, 10, 10))
    }

    #[test]
    fn repaints_coalesce_until_tick() {
        let mut rl = RenderLoop::new(REFRESH, 3);
        assert!(rl.schedule_repaint(&region(0)));
        assert!(!rl.schedule_repaint(&region(20)));
        assert_eq!(rl.state(), RenderLoopState::Scheduled);

        let damage = rl.begin_frame().unwrap();
        assert_snapshot!(damage, @"[10x10+0+0, 10x10+20+0]");
        assert!(rl.begin_frame().is_none());
    }

    #[test]
    fn damage_during_rendering_schedules_after_presentation() {
        let mut rl = RenderLoop::new(REFRESH, 3);
        rl.schedule_repaint(&region(0));
        rl.begin_frame().unwrap();
        assert!(!rl.schedule_repaint(&region(50)));
        rl.frame_submitted();
        assert_eq!(
            rl.state(),
            RenderLoopState::Presented {
                redraw_needed: true
            }
        );

        assert!(rl.presented(Duration::from_millis(16)));
        assert_eq!(rl.state(), RenderLoopState::Scheduled);
        assert_eq!(rl.begin_frame(), Some(region(50)));
    }

    #[test]
    fn presented_without_damage_goes_idle() {
        let mut rl = RenderLoop::new(REFRESH, 3);
        rl.schedule_repaint(&region(0));
        rl.begin_frame().unwrap();
        rl.frame_submitted();
        assert!(!rl.presented(Duration::from_millis(16)));
        assert_eq!(rl.state(), RenderLoopState::Idle);
        assert_eq!(rl.clock().now(), Duration::from_millis(16));
        assert_eq!(rl.sequence(), 1);
    }

    #[test]
    fn failed_commit_retries_same_damage_without_advancing_clock() {
        let mut rl = RenderLoop::new(REFRESH, 3);
        rl.schedule_repaint(&region(0));
        rl.begin_frame().unwrap();

        assert_eq!(rl.frame_failed(), FrameFailure::Retry);
        assert_eq!(rl.state(), RenderLoopState::Scheduled);
        assert_eq!(rl.clock().frames(), 0);
        assert_eq!(rl.begin_frame(), Some(region(0)));

        assert_eq!(rl.frame_failed(), FrameFailure::Retry);
        rl.begin_frame().unwrap();
        assert_eq!(rl.frame_failed(), FrameFailure::Fatal);
        assert_eq!(rl.consecutive_failures(), 3);
    }

    #[test]
    fn successful_presentation_resets_failures() {
        let mut rl = RenderLoop::new(REFRESH, 3);
        rl.schedule_repaint(&region(0));
        rl.begin_frame().unwrap();
        rl.frame_failed();
        rl.begin_frame().unwrap();
        rl.frame_submitted();
        rl.presented(Duration::from_millis(16));
        assert_eq!(rl.consecutive_failures(), 0);
    }

    #[test]
    fn deferred_frame_keeps_damage() {
        let mut rl = RenderLoop::new(REFRESH, 3);
        rl.schedule_repaint(&region(0));
        rl.begin_frame().unwrap();
        rl.frame_deferred();
        assert_eq!(rl.state(), RenderLoopState::Scheduled);
        assert_eq!(rl.pending(), &region(0));
    }

    #[test]
    fn skipped_frame_goes_idle() {
        let mut rl = RenderLoop::new(REFRESH, 3);
        rl.schedule_frame();
        assert_eq!(rl.begin_frame(), Some(Region::new()));
        assert!(!rl.frame_skipped());
        assert_eq!(rl.state(), RenderLoopState::Idle);
    }

    #[test]
    fn disposed_loop_ignores_everything() {
        let mut rl = RenderLoop::new(REFRESH, 3);
        rl.schedule_repaint(&region(0));
        rl.dispose();
        assert!(!rl.schedule_repaint(&region(0)));
        assert!(!rl.schedule_frame());
        assert!(rl.begin_frame().is_none());
        assert!(rl.pending().is_empty());
        assert!(rl.is_disposed());
    }

    #[test]
    fn unknown_presentation_time_means_now() {
        let mut rl = RenderLoop::new(REFRESH, 3);
        for time in [Duration::from_millis(16), Duration::ZERO] {
            rl.schedule_frame();
            rl.begin_frame().unwrap();
            rl.frame_submitted();
            rl.presented(time);
        }
        assert_eq!(rl.clock().frames(), 2);

        let now = get_monotonic_time();
        assert!(rl.clock().now() > Duration::from_millis(16));
        assert!(rl.clock().now() <= now);
        assert!(rl.next_presentation_time(now) > now);
    }

    #[test]
    fn predicts_next_vblank() {
        let refresh = Duration::from_millis(10);
        let mut rl = RenderLoop::new(refresh, 3);
        let now = Duration::from_millis(1000);
        assert_eq!(rl.next_presentation_time(now), Duration::from_millis(1010));

        rl.schedule_frame();
        rl.begin_frame();
        rl.frame_submitted();
        rl.presented(Duration::from_millis(1003));
        assert_eq!(
            rl.next_presentation_time(Duration::from_millis(1005)),
            Duration::from_millis(1013)
        );
        assert_eq!(
            rl.next_presentation_time(Duration::from_millis(1027)),
            Duration::from_millis(1033)
        );
    }
}
