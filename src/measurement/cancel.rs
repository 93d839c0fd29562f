//! Cooperative abort.
//!
//! The worker never cancels instrument I/O. It checks the abort flag at fixed
//! [`CancellationPoint`]s and, once the flag is set, fails the current stage
//! with [`DaqError::AbortRequested`], which unwinds to the ramp-down.

use crate::error::{DaqError, DaqResult};
use crate::limits::ABORT_POLL_INTERVAL;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Places where the worker honours an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationPoint {
    /// Before each ramp-up step
    RampUpStep,
    /// Before each ramp-to-bias step
    RampToBiasStep,
    /// Before each long-term cycle
    LongtermCycle,
    /// While sleeping, at least every [`ABORT_POLL_INTERVAL`]
    Sleep,
}

impl fmt::Display for CancellationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CancellationPoint::RampUpStep => "ramp-up step",
            CancellationPoint::RampToBiasStep => "ramp-to-bias step",
            CancellationPoint::LongtermCycle => "long-term cycle",
            CancellationPoint::Sleep => "sleep",
        };
        f.write_str(name)
    }
}

/// Shared abort flag of one worker.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Handle with the flag cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort. Safe to call from any task or thread.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Fail with `AbortRequested` if an abort was requested.
    pub fn check(&self, point: CancellationPoint) -> DaqResult<()> {
        if self.is_aborted() {
            debug!(%point, "abort requested");
            return Err(DaqError::AbortRequested);
        }
        Ok(())
    }

    /// Sleep for `duration` in slices of at most [`ABORT_POLL_INTERVAL`],
    /// checking for an abort before each slice.
    pub async fn sleep(&self, duration: Duration) -> DaqResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check(CancellationPoint::Sleep)?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep((deadline - now).min(ABORT_POLL_INTERVAL)).await;
        }
    }
}
