use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("a prior fatal error blocks further writes")]
    Fatal,
    #[error("simulated storage failure")]
    Simulated,
    #[error("row not found: {0}")]
    Missing(&'static str),
    #[error("corrupt row in table {0}")]
    Corrupt(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of an insert that treats an existing row as data, not failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Process-wide latch set on any invariant violation during a write. Once
/// set, `begin_write` refuses and the node must shut down.
#[derive(Debug, Default)]
pub struct FatalFlag {
    fatal: AtomicBool,
}

impl FatalFlag {
    pub fn new() -> Self {
        FatalFlag::default()
    }

    pub fn is_set(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn set(&self, msg: &str) {
        tracing::error!("FATAL: {msg}");
        self.fatal.store(true, Ordering::SeqCst);
    }
}
