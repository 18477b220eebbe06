//! Cooperative cancellation for long-running synthesis.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag.
///
/// Cloning yields a handle to the same flag, so a Ctrl-C handler (or any
/// other caller-side deadline mechanism) can cancel a synthesis running on
/// another clone. The synthesizer polls this at chunk and offset-stride
/// granularity and returns [`crate::Error::Cancelled`] rather than a
/// truncated plan.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
