//! Climate chamber controller.
//!
//! ```text
//! AI0?  -> temperature in °C
//! AI1?  -> relative humidity in %
//! RUN?  -> <running 1|0>,<program id>
//! STB?  -> status byte, bit 2 set while the program is paused
//! ```

use super::{parse_bool, parse_f64, Chamber};
use crate::error::{DaqError, DaqResult};
use crate::resource::ResourceGuard;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status byte bit signalling a paused program.
pub const STATUS_PAUSE_BIT: u8 = 1 << 2;

/// Program state of the chamber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunState {
    /// Program is executing
    pub running: bool,
    /// Program number
    pub program: u32,
}

/// Chamber status as written to the log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChamberStatus {
    /// Program running
    On,
    /// Program stopped
    Off,
    /// Pause bit set
    Pause,
}

impl ChamberStatus {
    /// A set pause bit wins over the running flag.
    pub fn derive(run_state: RunState, status_byte: u8) -> Self {
        if status_byte & STATUS_PAUSE_BIT != 0 {
            ChamberStatus::Pause
        } else if run_state.running {
            ChamberStatus::On
        } else {
            ChamberStatus::Off
        }
    }

    /// Inverse of the `Display` form used in log files.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ON" => Some(ChamberStatus::On),
            "OFF" => Some(ChamberStatus::Off),
            "PAUSE" => Some(ChamberStatus::Pause),
            _ => None,
        }
    }
}

impl fmt::Display for ChamberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChamberStatus::On => write!(f, "ON"),
            ChamberStatus::Off => write!(f, "OFF"),
            ChamberStatus::Pause => write!(f, "PAUSE"),
        }
    }
}

/// Chamber controller bound to an acquired resource.
pub struct ClimateChamber {
    resource: ResourceGuard,
}

impl ClimateChamber {
    /// Driver over a claimed chamber resource.
    pub fn new(resource: ResourceGuard) -> Self {
        Self { resource }
    }
}

#[async_trait]
impl Chamber for ClimateChamber {
    async fn temperature(&self) -> DaqResult<f64> {
        let reply = self.resource.query("AI0?").await?;
        parse_f64("AI0?", &reply)
    }

    async fn humidity(&self) -> DaqResult<f64> {
        let reply = self.resource.query("AI1?").await?;
        parse_f64("AI1?", &reply)
    }

    async fn run_state(&self) -> DaqResult<RunState> {
        let reply = self.resource.query("RUN?").await?;
        let parse_error = || DaqError::Parse {
            command: "RUN?".into(),
            reply: reply.clone(),
        };
        let (running, program) = reply.split_once(',').ok_or_else(parse_error)?;
        Ok(RunState {
            running: parse_bool("RUN?", running)?,
            program: program.trim().parse().map_err(|_| parse_error())?,
        })
    }

    async fn status_byte(&self) -> DaqResult<u8> {
        let reply = self.resource.query("STB?").await?;
        reply.trim().parse().map_err(|_| DaqError::Parse {
            command: "STB?".into(),
            reply,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    #[test]
    fn test_status_derivation() {
        let running = RunState {
            running: true,
            program: 3,
        };
        let stopped = RunState {
            running: false,
            program: 0,
        };
        assert_eq!(ChamberStatus::derive(running, 0), ChamberStatus::On);
        assert_eq!(ChamberStatus::derive(stopped, 0), ChamberStatus::Off);
        assert_eq!(
            ChamberStatus::derive(running, STATUS_PAUSE_BIT | 1),
            ChamberStatus::Pause
        );
    }

    #[tokio::test]
    async fn test_run_state_reply() {
        let mock = MockAdapter::new();
        mock.always("RUN?", "1,12").always("AI1?", "45.2");
        let chamber = ClimateChamber::new(ResourceGuard::detached("chamber", Box::new(mock)));
        assert_eq!(
            chamber.run_state().await.unwrap(),
            RunState {
                running: true,
                program: 12
            }
        );
        assert_eq!(chamber.humidity().await.unwrap(), 45.2);
    }
}
