//! Shared timing and safety limits.
//!
//! This module centralizes:
//! - Safety constants of the voltage ramps
//! - Cancellation and polling intervals
//! - Fixed sizes of the sensor setup
//!
//! Using centralized constants keeps the worker, the poller and their tests in
//! agreement.

use std::time::Duration;

// =============================================================================
// Sensor Setup
// =============================================================================

/// Number of sensor slots in the setup.
pub const SENSOR_COUNT: usize = 10;

// =============================================================================
// Ramp Safety
// =============================================================================

/// Minimum step size used when ramping down to 0 V (volts).
///
/// The ramp-down step is the larger of the configured step and this value, so
/// returning to a safe state is never slower than this.
pub const RAMP_DOWN_MIN_STEP: f64 = 10.0;

/// Settling time between two ramp-down steps.
pub const RAMP_DOWN_DELAY: Duration = Duration::from_millis(250);

/// Attempts per ramp-down step before the step is skipped.
pub const RAMP_DOWN_ATTEMPTS: u32 = 3;

// =============================================================================
// Cancellation
// =============================================================================

/// Maximum time between two abort checks while the worker sleeps.
pub const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(250);

// =============================================================================
// Environment Poller
// =============================================================================

/// Default interval between two chamber readouts (5 seconds).
pub const ENVIRONMENT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Back-off after a failed chamber readout before the next attempt.
pub const ENVIRONMENT_FAILURE_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Transport
// =============================================================================

/// Default read/write timeout of an instrument resource.
pub const DEFAULT_RESOURCE_TIMEOUT: Duration = Duration::from_secs(4);
