use std::time::Duration;

/// Animation clock of one output.
///
/// The clock only moves when a frame is actually shown, so animations on an output whose commits
/// keep failing do not skip ahead.
#[derive(Debug, Default, Clone)]
pub struct Clock {
    now: Duration,
    frames: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Number of presented frames this clock has seen.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Advances to the presentation time of a shown frame.
    ///
    /// Returns `false` and leaves the clock untouched if `time` lies in the past.
    pub fn advance_to(&mut self, time: Duration) -> bool {
        if time < self.now {
            return false;
        }
        self.now = time;
        self.frames += 1;
        true
    }
}
