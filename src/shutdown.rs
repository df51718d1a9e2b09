//! Cooperative shutdown signal.
//!
//! Long-running work (indexing, embedding waves, contextualization batches)
//! checks the flag at safe boundaries and stops enqueuing new work once it
//! fires. Nothing is interrupted mid-transaction; partial progress that was
//! committed stays committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent; safe from any thread or signal handler.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
