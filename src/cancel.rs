use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CompileError, Result};

/// A single signalling value polled at every suspension point of a compile
/// (between block groups, between streamed blocks). Cheap to clone; every
/// clone shares the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(CompileError::Cancelled)` if cancellation has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CompileError::Cancelled)
        } else {
            Ok(())
        }
    }
}
