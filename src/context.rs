use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::domain::RunStatus;

const PAUSE_STEP: Duration = Duration::from_millis(100);

/// Shared state of one batch run. Clones observe the same flags.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    inner: Arc<Flags>,
}

#[derive(Debug, Default)]
struct Flags {
    running: AtomicBool,
    aborted: AtomicBool,
    error: AtomicBool,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }

    pub fn finish(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub fn record_error(&self) {
        self.inner.error.store(true, Ordering::SeqCst);
    }

    pub fn has_error(&self) -> bool {
        self.inner.error.load(Ordering::SeqCst)
    }

    /// Sleeps for `delay`, waking early on abort. Returns false when the run
    /// was aborted.
    pub fn pause(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_aborted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(PAUSE_STEP));
        }
    }

    /// Aborted wins over error.
    pub fn status(&self) -> RunStatus {
        if self.is_aborted() {
            RunStatus::Aborted
        } else if self.has_error() {
            RunStatus::Error
        } else {
            RunStatus::Ok
        }
    }
}
