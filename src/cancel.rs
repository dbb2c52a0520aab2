// src/cancel.rs

//! Cooperative cancellation

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
///
/// Cloning yields another handle to the same flag. Cancellation is only
/// observed at safe points: between packages, between payloads, and between
/// payload chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return `Cancelled` if cancellation has been requested
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled(operation.to_string()))
        } else {
            Ok(())
        }
    }

    /// Clear the flag once a phase has observed it
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
