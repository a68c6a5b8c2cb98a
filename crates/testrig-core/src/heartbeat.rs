//! Liveness notices for long-running phases.
//!
//! A [`HeartbeatMonitor`] runs one background thread that wakes every
//! `interval`, and when at least `threshold` has passed since its last check
//! compares the size of the current target log with the size seen last
//! time. Growth means the subprocess is still producing output and a
//! `    ... still running` line is emitted through the run context. A missing
//! file or an unchanged size emits nothing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::context::RunContext;

/// Default wake-up period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(61);

/// Default minimum time between two size checks.
pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(60);

/// Notice emitted when the target log grew.
pub const STILL_RUNNING: &str = "    ... still running";

#[derive(Debug)]
struct State {
    target: Option<PathBuf>,
    last_size: u64,
    last_check: Instant,
    stop: bool,
}

impl State {
    /// One check at `now`: `true` when the target grew since the previous
    /// check at least `threshold` ago.
    fn tick(&mut self, now: Instant, threshold: Duration) -> bool {
        if now.saturating_duration_since(self.last_check) < threshold {
            return false;
        }
        self.last_check = now;
        let Some(size) = self
            .target
            .as_deref()
            .and_then(|path| fs::metadata(path).ok())
            .map(|meta| meta.len())
        else {
            return false;
        };
        let grew = size > self.last_size;
        self.last_size = size;
        grew
    }

    fn retarget(&mut self, target: Option<PathBuf>, now: Instant) {
        self.target = target;
        self.last_size = 0;
        self.last_check = now;
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background "still running" reporter for one worker.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    shared: Arc<Shared>,
    ctx: Arc<RunContext>,
    interval: Duration,
    threshold: Duration,
    label: Option<String>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Monitor with the default timing, emitting through `ctx`.
    #[must_use]
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    target: None,
                    last_size: 0,
                    last_check: Instant::now(),
                    stop: false,
                }),
                wake: Condvar::new(),
            }),
            ctx,
            interval: DEFAULT_INTERVAL,
            threshold: DEFAULT_THRESHOLD,
            label: None,
            handle: Mutex::new(None),
        }
    }

    /// Override wake-up period and check threshold.
    #[must_use]
    pub fn with_timing(mut self, interval: Duration, threshold: Duration) -> Self {
        self.interval = interval;
        self.threshold = threshold;
        self
    }

    /// Tag notices with `label` (the test name in parallel runs).
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Text emitted on growth.
    #[must_use]
    pub fn notice(&self) -> String {
        match &self.label {
            Some(label) => format!("{STILL_RUNNING} ({label})"),
            None => STILL_RUNNING.to_string(),
        }
    }

    /// Start the background thread. Does nothing if it is already running.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shared.lock().stop = false;

        let shared = Arc::clone(&self.shared);
        let ctx = Arc::clone(&self.ctx);
        let interval = self.interval;
        let threshold = self.threshold;
        let notice = self.notice();
        *handle = Some(thread::spawn(move || {
            let mut state = shared.lock();
            while !state.stop {
                state = shared
                    .wake
                    .wait_timeout(state, interval)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                if state.stop {
                    break;
                }
                if state.tick(Instant::now(), threshold) {
                    drop(state);
                    ctx.emit(&notice);
                    state = shared.lock();
                }
            }
        }));
        tracing::debug!(label = ?self.label, "heartbeat started");
    }

    /// Watch `path` from now on, resetting the size and time counters.
    pub fn set_target(&self, path: &Path) {
        self.shared
            .lock()
            .retarget(Some(path.to_path_buf()), Instant::now());
    }

    /// Stop watching any file.
    pub fn clear_target(&self) {
        self.shared.lock().retarget(None, Instant::now());
    }

    /// Stop the background thread and wait for it. Safe to call when the
    /// monitor was never started, and more than once.
    pub fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        self.shared.lock().stop = true;
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            tracing::warn!("heartbeat thread panicked");
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
