//! Single synchronized read across SMU, relay box and multimeter.
//!
//! The order of the steps is fixed:
//!
//! 1. SMU compliance check (fatal unless continuing in compliance)
//! 2. total compliance pushed to the SMU
//! 3. total SMU current
//! 4. relay box vitals and PT100 temperatures (relay box in use only)
//! 5. multimeter scan over the enabled channels
//! 6. per-sensor current and compliance protection
//! 7. buffer count check against the enabled sensors
//!
//! A sensor above the single compliance is faulted and, with a relay box, its
//! relay is switched off before the next sensor is evaluated.

use super::reading::{ChannelReading, Reading, RelayBoxVitals};
use crate::config::{DmmConfig, MeasurementConfig};
use crate::error::{DaqError, DaqResult};
use crate::instrument::{Multimeter, RelayBox, SourceMeter, SwitchBox};
use crate::resource::ResourceManager;
use crate::sensor::{HvState, SensorRegistry, SensorStatus};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Borrowable access to the relay box resource.
#[derive(Clone)]
pub struct RelayBoxLink {
    resources: ResourceManager,
    name: String,
}

impl RelayBoxLink {
    /// Link to the relay box resource `name`.
    pub fn new(resources: ResourceManager, name: &str) -> Self {
        Self {
            resources,
            name: name.to_string(),
        }
    }

    /// Acquire the relay box until the returned driver is dropped.
    pub async fn open(&self) -> DaqResult<SwitchBox> {
        Ok(SwitchBox::new(self.resources.acquire(&self.name).await?))
    }
}

/// Run-wide inputs of the scan routine.
pub struct ScanContext<'a> {
    /// Sensor table
    pub sensors: &'a SensorRegistry,
    /// Run parameters
    pub measurement: &'a MeasurementConfig,
    /// Scanner settings
    pub dmm: &'a DmmConfig,
    /// `None` when the relay box is not in use
    pub relay_box: Option<&'a RelayBoxLink>,
}

/// Scanner channel addresses of the enabled sensors, in sensor order.
pub fn channel_addresses(ctx: &ScanContext<'_>) -> Vec<u32> {
    ctx.sensors
        .enabled()
        .iter()
        .map(|sensor| ctx.dmm.channel_address(sensor.index))
        .collect()
}

/// Perform one scan cycle at SMU setpoint `voltage`.
///
/// Updates current, temperature, status and relay state of every enabled
/// sensor in the registry.
///
/// # Errors
/// - `Compliance` if the SMU tripped and continuing in compliance is off
/// - `ProtocolDesync` if the multimeter returned more or fewer readings than
///   sensors are enabled
/// - `InvalidResistivity` for a sensor without a positive calibration resistance
/// - any instrument or connection error
pub async fn scan(
    smu: &dyn SourceMeter,
    dmm: &dyn Multimeter,
    ctx: &ScanContext<'_>,
    voltage: f64,
) -> DaqResult<Reading> {
    let total_compliance = ctx.measurement.total_compliance();
    let single_compliance = ctx.measurement.single_compliance();

    if smu.compliance_tripped().await? {
        if !ctx.measurement.continue_in_compliance {
            return Err(DaqError::Compliance {
                limit: total_compliance,
            });
        }
        warn!(limit = total_compliance, "SMU in compliance, continuing");
    }
    smu.set_compliance(total_compliance).await?;
    let smu_current = smu.read_current().await?;

    let enabled = ctx.sensors.enabled();

    let mut relay_box = None;
    let mut vitals = None;
    let mut temperatures = Vec::new();
    if let Some(link) = ctx.relay_box {
        let device = link.open().await?;
        let uptime = device.uptime().await?;
        let memory = device.memory().await?;
        temperatures = device.temperatures().await?;
        vitals = Some(RelayBoxVitals { uptime, memory });
        relay_box = Some(device);
    }

    let mut buffer: VecDeque<f64> = if enabled.is_empty() {
        VecDeque::new()
    } else {
        dmm.initiate().await?;
        dmm.fetch().await?.into()
    };
    let received = buffer.len();
    let desync = || DaqError::ProtocolDesync {
        expected: enabled.len(),
        received,
    };

    let mut channels = BTreeMap::new();
    for sensor in &enabled {
        let voltage = buffer.pop_front().ok_or_else(desync)?;
        if !(sensor.resistivity > 0.0) {
            return Err(DaqError::InvalidResistivity {
                index: sensor.index,
                resistivity: sensor.resistivity,
            });
        }
        let current = voltage / sensor.resistivity;
        let temperature = usize::from(sensor.index)
            .checked_sub(1)
            .and_then(|slot| temperatures.get(slot))
            .map(|celsius| celsius + sensor.temperature_offset);

        let in_compliance = current.abs() > single_compliance;
        if in_compliance {
            let fault = DaqError::SingleCompliance {
                index: sensor.index,
                current,
                limit: single_compliance,
            };
            warn!(sensor = sensor.index, name = %sensor.name, error = %fault, "sensor switched off");
            ctx.sensors
                .update(sensor.index, |s| s.status = SensorStatus::ComplianceError);
            if let Some(device) = &relay_box {
                device.set_relay(sensor.index, false).await?;
                ctx.sensors.update(sensor.index, |s| s.hv = HvState::Off);
            }
        }
        ctx.sensors.update(sensor.index, |s| {
            s.current = Some(current);
            s.temperature = temperature;
        });

        channels.insert(
            sensor.index,
            ChannelReading {
                current,
                voltage,
                resistance: sensor.resistivity,
                temperature,
            },
        );
    }

    if !buffer.is_empty() {
        return Err(desync());
    }

    debug!(voltage, smu_current, channels = channels.len(), "scan complete");
    Ok(Reading {
        timestamp: now_seconds(),
        channels,
        smu_current,
        smu_voltage: voltage,
        relay_box: vitals,
    })
}

/// Wall-clock seconds since the UNIX epoch.
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
