//! Sensor registry.
//!
//! The setup holds a fixed number of sensor slots ([`SENSOR_COUNT`]). Each slot
//! keeps the operator settings (enabled, name, calibration resistance,
//! temperature offset) and the live state written by the measurement worker
//! (status, relay state, last current and temperature).
//!
//! # Shared access
//!
//! The registry is shared between the worker and its collaborators (a GUI, the
//! CLI). Collaborator edits go through the `set_*` methods, which are refused
//! while a run holds the [`RunLock`]. The worker writes live state through
//! crate-internal methods. Readers always receive owned snapshots.

use crate::config::SensorConfig;
use crate::error::{DaqError, DaqResult};
use crate::limits::SENSOR_COUNT;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fault status of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SensorStatus {
    /// No fault
    #[default]
    Ok,
    /// Sensor current exceeded the single compliance during this run.
    ComplianceError,
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorStatus::Ok => write!(f, "OK"),
            SensorStatus::ComplianceError => write!(f, "COMPL_ERR"),
        }
    }
}

/// High-voltage relay state of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HvState {
    /// No relay box in use, or not yet switched.
    #[default]
    Unknown,
    /// Relay closed
    On,
    /// Relay open
    Off,
}

impl HvState {
    /// State of a read-back relay.
    pub fn from_relay(on: bool) -> Self {
        if on {
            HvState::On
        } else {
            HvState::Off
        }
    }

    /// Parse the log file representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ON" => Some(HvState::On),
            "OFF" => Some(HvState::Off),
            "N/A" => Some(HvState::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for HvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HvState::Unknown => write!(f, "N/A"),
            HvState::On => write!(f, "ON"),
            HvState::Off => write!(f, "OFF"),
        }
    }
}

/// One sensor slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Slot index, 1 based
    pub index: u8,
    /// Measured in the next run
    pub enabled: bool,
    /// Display name
    pub name: String,
    /// Display hint
    pub color: Option<String>,
    /// Calibration resistance in Ohm
    pub resistivity: f64,
    /// Fault status of the current run
    pub status: SensorStatus,
    /// Relay state
    pub hv: HvState,
    /// Last measured current in A
    pub current: Option<f64>,
    /// Last PT100 temperature plus offset in °C
    pub temperature: Option<f64>,
    /// Correction added to the PT100 temperature in °C
    pub temperature_offset: f64,
}

impl Sensor {
    /// Sensor slot with default settings.
    pub fn new(index: u8) -> Self {
        Self {
            index,
            enabled: false,
            name: format!("Unnamed{}", index),
            color: None,
            resistivity: 470_000.0,
            status: SensorStatus::Ok,
            hv: HvState::Unknown,
            current: None,
            temperature: None,
            temperature_offset: 0.0,
        }
    }

    /// Clear the live state written during a run.
    pub(crate) fn reset_live_state(&mut self) {
        self.status = SensorStatus::Ok;
        self.hv = HvState::Unknown;
        self.current = None;
        self.temperature = None;
    }
}

struct Inner {
    sensors: RwLock<Vec<Sensor>>,
    editable: AtomicBool,
}

/// Fixed-size, index ordered collection of sensors.
///
/// Cloning is cheap; clones share the same sensors.
#[derive(Clone)]
pub struct SensorRegistry {
    inner: Arc<Inner>,
}

impl Default for SensorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorRegistry {
    /// Registry of [`SENSOR_COUNT`] default sensors.
    pub fn new() -> Self {
        let sensors = (1..=SENSOR_COUNT as u8).map(Sensor::new).collect();
        Self {
            inner: Arc::new(Inner {
                sensors: RwLock::new(sensors),
                editable: AtomicBool::new(true),
            }),
        }
    }

    /// Registry restored from persisted sensor settings. Slots missing from
    /// `configs` keep their defaults.
    pub fn from_config(configs: &[SensorConfig]) -> Self {
        let registry = Self::new();
        {
            let mut sensors = registry.inner.sensors.write();
            for config in configs {
                if let Some(sensor) = sensors.iter_mut().find(|s| s.index == config.index) {
                    sensor.enabled = config.enabled;
                    if let Some(name) = &config.name {
                        sensor.name = name.clone();
                    }
                    sensor.color = config.color.clone();
                    sensor.resistivity = config.resistivity;
                    sensor.temperature_offset = config.temperature_offset;
                }
            }
        }
        registry
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.inner.sensors.read().len()
    }

    /// Whether the registry has no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the sensor with the given index.
    pub fn get(&self, index: u8) -> Option<Sensor> {
        self.inner
            .sensors
            .read()
            .iter()
            .find(|s| s.index == index)
            .cloned()
    }

    /// Snapshot of all sensors in ascending index order.
    pub fn snapshot(&self) -> Vec<Sensor> {
        self.inner.sensors.read().clone()
    }

    /// Snapshot of the enabled sensors in ascending index order.
    pub fn enabled(&self) -> Vec<Sensor> {
        self.inner
            .sensors
            .read()
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect()
    }

    /// False while a measurement run holds the registry.
    pub fn is_editable(&self) -> bool {
        self.inner.editable.load(Ordering::SeqCst)
    }

    /// Take exclusive logical ownership for a run. Editing is refused until the
    /// returned lock is dropped.
    ///
    /// # Errors
    /// `RegistryLocked` if another run already holds the registry. The holder's
    /// lock is left untouched.
    pub(crate) fn lock_for_run(&self) -> DaqResult<RunLock> {
        self.inner
            .editable
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| DaqError::RegistryLocked)?;
        Ok(RunLock {
            registry: self.clone(),
        })
    }

    /// Include or exclude a sensor from the next run.
    pub fn set_enabled(&self, index: u8, enabled: bool) -> DaqResult<()> {
        self.edit(index, |sensor| {
            sensor.enabled = enabled;
            Ok(())
        })
    }

    /// Set the display name.
    pub fn rename(&self, index: u8, name: impl Into<String>) -> DaqResult<()> {
        let name = name.into();
        self.edit(index, move |sensor| {
            sensor.name = name;
            Ok(())
        })
    }

    /// Set the calibration resistance; must be positive.
    pub fn set_resistivity(&self, index: u8, resistivity: f64) -> DaqResult<()> {
        self.edit(index, |sensor| {
            if !(resistivity > 0.0) {
                return Err(DaqError::InvalidResistivity {
                    index: sensor.index,
                    resistivity,
                });
            }
            sensor.resistivity = resistivity;
            Ok(())
        })
    }

    /// Set the PT100 correction.
    pub fn set_temperature_offset(&self, index: u8, offset: f64) -> DaqResult<()> {
        self.edit(index, |sensor| {
            sensor.temperature_offset = offset;
            Ok(())
        })
    }

    /// Set the display hint.
    pub fn set_color(&self, index: u8, color: Option<String>) -> DaqResult<()> {
        self.edit(index, move |sensor| {
            sensor.color = color;
            Ok(())
        })
    }

    fn edit<F>(&self, index: u8, f: F) -> DaqResult<()>
    where
        F: FnOnce(&mut Sensor) -> DaqResult<()>,
    {
        if !self.is_editable() {
            return Err(DaqError::RegistryLocked);
        }
        let mut sensors = self.inner.sensors.write();
        let sensor = sensors
            .iter_mut()
            .find(|s| s.index == index)
            .ok_or_else(|| DaqError::Configuration(format!("No sensor with index {}", index)))?;
        f(sensor)
    }

    /// Worker side mutation of one sensor's live state.
    pub(crate) fn update<F: FnOnce(&mut Sensor)>(&self, index: u8, f: F) {
        if let Some(sensor) = self
            .inner
            .sensors
            .write()
            .iter_mut()
            .find(|s| s.index == index)
        {
            f(sensor);
        }
    }

    /// Worker side mutation of every sensor.
    pub(crate) fn update_all<F: FnMut(&mut Sensor)>(&self, mut f: F) {
        for sensor in self.inner.sensors.write().iter_mut() {
            f(sensor);
        }
    }
}

/// Marks the registry as owned by a running measurement.
pub(crate) struct RunLock {
    registry: SensorRegistry,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.registry.inner.editable.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_fixed_ordered_slots() {
        let registry = SensorRegistry::new();
        assert_eq!(registry.len(), SENSOR_COUNT);
        let indices: Vec<u8> = registry.snapshot().iter().map(|s| s.index).collect();
        assert_eq!(indices, (1..=10).collect::<Vec<u8>>());
        assert!(registry.enabled().is_empty());
    }

    #[test]
    fn test_enabled_view_is_index_ordered() {
        let registry = SensorRegistry::new();
        registry.set_enabled(7, true).unwrap();
        registry.set_enabled(2, true).unwrap();
        let enabled: Vec<u8> = registry.enabled().iter().map(|s| s.index).collect();
        assert_eq!(enabled, vec![2, 7]);
    }

    #[test]
    fn test_edits_refused_while_locked() {
        let registry = SensorRegistry::new();
        {
            let _lock = registry.lock_for_run().unwrap();
            assert!(!registry.is_editable());
            assert!(matches!(
                registry.rename(1, "W01"),
                Err(DaqError::RegistryLocked)
            ));
        }
        assert!(registry.is_editable());
        registry.rename(1, "W01").unwrap();
        assert_eq!(registry.get(1).unwrap().name, "W01");
    }

    #[test]
    fn test_second_run_lock_is_refused() {
        let registry = SensorRegistry::new();
        let first = registry.lock_for_run().unwrap();
        assert!(matches!(
            registry.lock_for_run(),
            Err(DaqError::RegistryLocked)
        ));
        // The refused claim must not hand edit permission back.
        assert!(!registry.is_editable());
        drop(first);
        assert!(registry.is_editable());
        assert!(registry.lock_for_run().is_ok());
    }

    #[test]
    fn test_resistivity_must_be_positive() {
        let registry = SensorRegistry::new();
        assert!(registry.set_resistivity(3, 0.0).is_err());
        assert!(registry.set_resistivity(3, -1.0).is_err());
        registry.set_resistivity(3, 1e6).unwrap();
        assert_eq!(registry.get(3).unwrap().resistivity, 1e6);
    }

    #[test]
    fn test_from_config_restores_slots() {
        let registry = SensorRegistry::from_config(&[SensorConfig {
            index: 4,
            name: Some("HPK-4".into()),
            enabled: true,
            resistivity: 1e6,
            temperature_offset: -0.3,
            color: None,
        }]);
        let sensor = registry.get(4).unwrap();
        assert!(sensor.enabled);
        assert_eq!(sensor.name, "HPK-4");
        assert_eq!(sensor.temperature_offset, -0.3);
        assert_eq!(registry.get(5).unwrap().name, "Unnamed5");
    }

    #[test]
    fn test_hv_state_text() {
        for state in [HvState::On, HvState::Off, HvState::Unknown] {
            assert_eq!(HvState::parse(&state.to_string()), Some(state));
        }
    }
}
