//! Detection of a stalled compositor thread.
//!
//! Everything runs on one thread, so a blocking round trip to a hung peer freezes every output.
//! The watchdog is a separate thread that waits on a deadline. The compositor arms it before work
//! that could block and disarms it afterwards; if the deadline passes first, the stall callback
//! runs on the watchdog thread, typically shutting down the socket the compositor is stuck on.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Shared {
    deadline: Option<Instant>,
    stop: bool,
    stalls: u64,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<Shared>,
    cond: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct Watchdog {
    inner: Arc<Inner>,
    timeout: Duration,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Spawns the watchdog thread. It stays idle until [`Watchdog::arm()`].
    pub fn start(
        timeout: Duration,
        on_stall: impl FnMut() + Send + 'static,
    ) -> anyhow::Result<Self> {
        let inner = Arc::new(Inner::default());

        let thread = thread::Builder::new()
            .name("Watchdog".to_owned())
            .spawn({
                let inner = inner.clone();
                move || run(&inner, timeout, on_stall)
            })
            .context("error spawning the watchdog thread")?;

        debug!("started watchdog with {timeout:?} timeout");
        Ok(Self {
            inner,
            timeout,
            thread: Some(thread),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts the countdown.
    pub fn arm(&self) {
        let mut state = self.inner.lock();
        state.deadline = Some(Instant::now() + self.timeout);
        self.inner.cond.notify_one();
    }

    pub fn disarm(&self) {
        let mut state = self.inner.lock();
        state.deadline = None;
        self.inner.cond.notify_one();
    }

    /// Restarts the countdown if armed.
    pub fn ping(&self) {
        let mut state = self.inner.lock();
        if state.deadline.is_some() {
            state.deadline = Some(Instant::now() + self.timeout);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().deadline.is_some()
    }

    /// Number of times the stall callback ran.
    pub fn stalls(&self) -> u64 {
        self.inner.lock().stalls
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.stop = true;
            self.inner.cond.notify_one();
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

fn run(inner: &Inner, timeout: Duration, mut on_stall: impl FnMut()) {
    let mut state = inner.lock();
    loop {
        if state.stop {
            return;
        }

        let Some(deadline) = state.deadline else {
            state = inner.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
            continue;
        };

        let now = Instant::now();
        if now < deadline {
            let (guard, _) = inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            continue;
        }

        // Fire once, then wait to be armed again.
        state.deadline = None;
        state.stalls += 1;
        drop(state);

        warn!("compositor thread unresponsive for {timeout:?}");
        on_stall();

        state = inner.lock();
    }
}
