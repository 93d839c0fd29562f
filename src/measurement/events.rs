//! Worker notifications.

use super::reading::Reading;
use crate::error::DaqError;
use crate::sensor::Sensor;
use std::fmt;
use std::sync::Arc;

/// Stages of a measurement run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Instrument reset and configuration
    Setup,
    /// IV sweep to the end voltage
    RampUp,
    /// Move to the bias voltage
    RampToBias,
    /// Timed It acquisition at bias
    Longterm,
    /// Return to 0 V and switch off
    RampDown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::RampUp => "ramp_up",
            Stage::RampToBias => "ramp_to_bias",
            Stage::Longterm => "longterm",
            Stage::RampDown => "ramp_down",
        };
        f.write_str(name)
    }
}

/// Event published by the measurement worker.
///
/// Payloads are snapshots; no event gives access to live worker state.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Ramp-up began, emitted once per run
    Started,
    /// A new stage began
    StageChanged(Stage),
    /// Operator notice
    Message(String),
    /// `maximum` is `None` when progress is indeterminate
    Progress { value: u64, maximum: Option<u64> },
    /// New SMU voltage level
    Voltage(f64),
    /// One scan of all enabled sensors
    Reading(Reading),
    /// Raw SMU current of a ramp step, `None` when not measured
    SmuCurrent { voltage: f64, current: Option<f64> },
    /// Sensor table changed
    SensorsUpdated(Vec<Sensor>),
    /// At most once per run, always before `Finished`
    Failed(Arc<DaqError>),
    /// Exactly once per run
    Finished,
}
