//! Cooperative cancellation token threaded from the orchestrator into every
//! helper and proxy connection handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clone-cheap cancellation flag. Handlers observing cancellation close
/// their sockets and return promptly; they never exit the process.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
