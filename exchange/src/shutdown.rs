use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide stop flag, polled inside every loop that can run more than a
/// handful of iterations. Once set it is never cleared.
#[derive(Debug, Default)]
pub struct ShutdownFlag {
    stop: AtomicBool,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        ShutdownFlag::default()
    }

    pub fn is_set(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
