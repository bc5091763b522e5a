use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{PipelineError, Result};

/// Cooperative cancellation flag, checked between per-item work units of long stages.
///
/// Clones share the same flag, so a token handed to a [`crate::Session`] can be
/// cancelled from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` naming `stage` once the token has been triggered.
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled(stage.to_string()))
        } else {
            Ok(())
        }
    }
}
