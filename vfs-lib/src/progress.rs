use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Minimum interval between emitted progress reports.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Capability passed by reference through every long-running call chain.
/// Long loops poll `is_cancelled` at each chunk/child boundary and consult
/// `should_throttle` before emitting a report.
pub trait Progress: Send + Sync {
    fn report(&self, percent: u8);

    /// True when the next report should be suppressed (rate limiting).
    fn should_throttle(&self) -> bool {
        false
    }

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Progress sink that reports nothing and never cancels.
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&self, _percent: u8) {}
}

/// Shared cancellation flag; implements `Progress` so it can stand in
/// wherever only cooperative cancellation matters.
#[derive(Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Progress for CancelFlag {
    fn report(&self, _percent: u8) {}

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Rate-limit helper for `should_throttle` implementations: `ready`
/// returns true at most once per interval.
pub struct RefreshGate {
    last: Mutex<Option<Instant>>,
    interval: Duration,
}

impl RefreshGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            interval,
        }
    }

    pub fn ready(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < self.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl Default for RefreshGate {
    fn default() -> Self {
        Self::new(REFRESH_INTERVAL)
    }
}
