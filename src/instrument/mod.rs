//! Instrument capabilities and drivers.
//!
//! The measurement core talks to four kinds of instruments through capability
//! traits. Drivers translate each capability into the command set of a
//! concrete device and own the [`ResourceGuard`](crate::resource::ResourceGuard)
//! of their connection.
//!
//! | Capability      | Driver             | Protocol                    |
//! |-----------------|--------------------|-----------------------------|
//! | [`SourceMeter`] | [`K2410`]          | SCPI                        |
//! | [`Multimeter`]  | [`K2700`]          | SCPI, 7700 style scan card  |
//! | [`RelayBox`]    | [`SwitchBox`]      | line protocol               |
//! | [`Chamber`]     | [`ClimateChamber`] | line protocol               |
//!
//! [`sim`] provides simulated devices speaking the same command sets.

pub mod chamber;
pub mod k2410;
pub mod k2700;
pub mod sim;
pub mod switch_box;

pub use chamber::{ChamberStatus, ClimateChamber, RunState};
pub use k2410::K2410;
pub use k2700::K2700;
pub use switch_box::SwitchBox;

use crate::config::{FilterConfig, Terminals};
use crate::error::{DaqError, DaqResult};
use async_trait::async_trait;

/// Trigger delay of the multimeter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerDelay {
    /// Chosen by the instrument from function and range
    Auto,
    /// Fixed delay in seconds
    Fixed(f64),
}

/// Voltage source with current measurement.
#[async_trait]
pub trait SourceMeter: Send + Sync {
    async fn identify(&self) -> DaqResult<String>;
    /// Restore power-on defaults.
    async fn reset(&self) -> DaqResult<()>;
    /// Clear status registers and the error queue.
    async fn clear(&self) -> DaqResult<()>;
    async fn set_beeper(&self, enabled: bool) -> DaqResult<()>;
    /// Oldest entry of the error queue, `None` when the queue is empty.
    async fn next_error(&self) -> DaqResult<Option<String>>;
    async fn set_terminals(&self, terminals: Terminals) -> DaqResult<()>;
    async fn terminals(&self) -> DaqResult<Terminals>;
    /// Source voltage, sense current with automatic range.
    async fn configure_source_voltage(&self) -> DaqResult<()>;
    async fn set_filter(&self, filter: &FilterConfig) -> DaqResult<()>;
    async fn filter(&self) -> DaqResult<FilterConfig>;
    /// Current compliance in A.
    async fn set_compliance(&self, limit: f64) -> DaqResult<()>;
    async fn compliance(&self) -> DaqResult<f64>;
    async fn compliance_tripped(&self) -> DaqResult<bool>;
    /// Output voltage level in V.
    async fn set_voltage(&self, voltage: f64) -> DaqResult<()>;
    async fn voltage(&self) -> DaqResult<f64>;
    async fn set_output(&self, enabled: bool) -> DaqResult<()>;
    async fn output(&self) -> DaqResult<bool>;
    /// Measure the present current in A.
    async fn read_current(&self) -> DaqResult<f64>;
}

/// Scanning voltmeter with a buffered channel scan.
#[async_trait]
pub trait Multimeter: Send + Sync {
    async fn identify(&self) -> DaqResult<String>;
    async fn reset(&self) -> DaqResult<()>;
    async fn clear(&self) -> DaqResult<()>;
    async fn set_beeper(&self, enabled: bool) -> DaqResult<()>;
    async fn next_error(&self) -> DaqResult<Option<String>>;
    /// Configure the scan list and one internal trigger per scan.
    ///
    /// An empty list disables scanning.
    async fn configure_scan(&self, channels: &[u32]) -> DaqResult<()>;
    async fn scan_channels(&self) -> DaqResult<Vec<u32>>;
    async fn set_filter(&self, filter: &FilterConfig) -> DaqResult<()>;
    async fn filter(&self) -> DaqResult<FilterConfig>;
    async fn set_trigger_delay(&self, delay: TriggerDelay) -> DaqResult<()>;
    async fn trigger_delay(&self) -> DaqResult<TriggerDelay>;
    /// Start one scan over the configured channels.
    async fn initiate(&self) -> DaqResult<()>;
    /// Buffered readings of the last scan in channel order, in V.
    async fn fetch(&self) -> DaqResult<Vec<f64>>;
}

/// HV relay switching and PT100 readout per sensor.
#[async_trait]
pub trait RelayBox: Send + Sync {
    async fn identify(&self) -> DaqResult<String>;
    /// Seconds since power-up.
    async fn uptime(&self) -> DaqResult<u64>;
    /// Free memory in bytes.
    async fn memory(&self) -> DaqResult<u64>;
    /// PT100 temperatures in °C, channel 1 first.
    async fn temperatures(&self) -> DaqResult<Vec<f64>>;
    async fn set_relay(&self, channel: u8, on: bool) -> DaqResult<()>;
    async fn relay(&self, channel: u8) -> DaqResult<bool>;
    async fn set_all_relays(&self, on: bool) -> DaqResult<()>;
    /// Relay states, channel 1 first.
    async fn relays(&self) -> DaqResult<Vec<bool>>;
}

/// Climate chamber controller.
#[async_trait]
pub trait Chamber: Send + Sync {
    /// Chamber temperature in °C.
    async fn temperature(&self) -> DaqResult<f64>;
    /// Relative humidity in %.
    async fn humidity(&self) -> DaqResult<f64>;
    async fn run_state(&self) -> DaqResult<RunState>;
    /// Raw status byte.
    async fn status_byte(&self) -> DaqResult<u8>;
}

// ============================================================================
// Reply parsing shared by the drivers
// ============================================================================

pub(crate) fn parse_f64(command: &str, reply: &str) -> DaqResult<f64> {
    reply.trim().parse::<f64>().map_err(|_| DaqError::Parse {
        command: command.to_string(),
        reply: reply.to_string(),
    })
}

pub(crate) fn parse_u64(command: &str, reply: &str) -> DaqResult<u64> {
    reply.trim().parse::<u64>().map_err(|_| DaqError::Parse {
        command: command.to_string(),
        reply: reply.to_string(),
    })
}

pub(crate) fn parse_bool(command: &str, reply: &str) -> DaqResult<bool> {
    match reply.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        _ => Err(DaqError::Parse {
            command: command.to_string(),
            reply: reply.to_string(),
        }),
    }
}

/// Comma separated numbers; an empty reply is an empty list.
pub(crate) fn parse_f64_list(command: &str, reply: &str) -> DaqResult<Vec<f64>> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Ok(Vec::new());
    }
    reply
        .split(',')
        .map(|value| parse_f64(command, value))
        .collect()
}

/// SCPI error queue entry, `None` for `0,"No error"`.
pub(crate) fn parse_error_entry(command: &str, reply: &str) -> DaqResult<Option<String>> {
    let (code, _) = reply.split_once(',').unwrap_or((reply, ""));
    let code: i32 = code.trim().parse().map_err(|_| DaqError::Parse {
        command: command.to_string(),
        reply: reply.to_string(),
    })?;
    Ok((code != 0).then(|| reply.trim().to_string()))
}

pub(crate) fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}
