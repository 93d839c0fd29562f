//! Scan results.

use serde::Serialize;
use std::collections::BTreeMap;

/// Values of one sensor channel in a scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelReading {
    /// Sensor current in A (voltage over calibration resistance)
    pub current: f64,
    /// Voltage across the calibration resistor in V
    pub voltage: f64,
    /// Calibration resistance in Ohm
    pub resistance: f64,
    /// PT100 temperature plus offset in °C, if the relay box is in use
    pub temperature: Option<f64>,
}

/// Relay box health values read during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayBoxVitals {
    /// Seconds since power-up
    pub uptime: u64,
    /// Free memory in bytes
    pub memory: u64,
}

/// One consolidated scan cycle.
///
/// `channels` holds exactly the sensors that were enabled during the scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Seconds since the UNIX epoch
    pub timestamp: f64,
    /// Readings by sensor index
    pub channels: BTreeMap<u8, ChannelReading>,
    /// Total SMU current in A
    pub smu_current: f64,
    /// SMU voltage setpoint in V
    pub smu_voltage: f64,
    /// Relay box state, when in use
    pub relay_box: Option<RelayBoxVitals>,
}
