//! Pool-wide cooperative cancellation.
//!
//! A [`CancelToken`] is a cloneable handle to one shared flag. The engine
//! hands a clone to every execution unit at construction; external triggers
//! (interrupt handlers, run timeouts, an embedder's stop button) only ever
//! set the flag. Units observe it at loop-iteration granularity, so shutdown
//! latency is bounded by one advance step, never a whole state's lifetime.
//!
//! The transition is one-way: once set, the flag never clears for the rest
//! of the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared one-way kill flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative shutdown. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
