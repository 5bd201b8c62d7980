//! Per-operation context threaded through write and scan paths.
//!
//! The engine never consults process-global state for an operation:
//! deadlines travel with the call, and long-running operations check
//! them between blocks.

use std::time::{Duration, Instant};

use crate::{Result, TesseraError};

/// Carrier for per-call concerns. Cheap to clone; every public engine
/// entry point takes one.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// Checked between blocks by iterators and bulk writers. An
    /// operation that has already entered a block finishes that block
    /// before the check fires.
    pub fn check(&self) -> Result<()> {
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(TesseraError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub fn expired(&self) -> bool {
        self.check().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_deadline_never_expires() {
        let ctx = OpContext::new();
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_deadline_expiry() {
        let ctx = OpContext::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(ctx.check(), Err(TesseraError::DeadlineExceeded)));

        let ctx = OpContext::with_timeout(Duration::from_secs(60));
        assert!(ctx.check().is_ok());
    }
}
