//! Simulated instruments.
//!
//! Simulated devices answer the same command sets as the real drivers expect,
//! so the complete measurement can run without hardware (`it_daq run
//! --simulate`) and tests can exercise the worker end to end.
//!
//! A [`SimulationHandle`] owns the shared device state. It lets a caller set
//! channel voltages, trip the SMU compliance, take resources offline, and
//! inspect what the worker commanded (voltage history, relay switching).

use crate::adapters::Adapter;
use crate::config::{FilterConfig, FilterType, InstrumentRoles, ResourceConfig, Terminals};
use crate::error::{DaqError, DaqResult};
use crate::instrument::k2700::{format_channel_list, parse_channel_list};
use crate::limits::SENSOR_COUNT;
use crate::resource::Connector;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Device kind a simulated resource emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimInstrument {
    /// Keithley 2410
    SourceMeter,
    /// Keithley 2700 with scanner card
    Multimeter,
    /// HEPHY relay box
    RelayBox,
    /// Climate chamber
    Chamber,
}

struct SmuState {
    voltage: f64,
    output: bool,
    compliance: f64,
    tripped: bool,
    filter: FilterConfig,
    terminals: Terminals,
    errors: VecDeque<String>,
    leakage_resistance: f64,
    voltage_history: Vec<f64>,
    output_history: Vec<bool>,
}

impl Default for SmuState {
    fn default() -> Self {
        Self {
            voltage: 0.0,
            output: false,
            compliance: 105e-6,
            tripped: false,
            filter: FilterConfig::default(),
            terminals: Terminals::Front,
            errors: VecDeque::new(),
            leakage_resistance: 1e9,
            voltage_history: Vec::new(),
            output_history: Vec::new(),
        }
    }
}

impl SmuState {
    fn current(&self) -> f64 {
        if self.output {
            self.voltage / self.leakage_resistance
        } else {
            0.0
        }
    }
}

struct DmmState {
    channels: Vec<u32>,
    channel_voltages: BTreeMap<u32, f64>,
    default_voltage: f64,
    filter: FilterConfig,
    filter_count_readback: Option<u32>,
    trigger_auto: bool,
    trigger_delay: f64,
    buffer: Vec<f64>,
    extra_readings: usize,
    missing_readings: usize,
    scans: usize,
    errors: VecDeque<String>,
}

impl Default for DmmState {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            channel_voltages: BTreeMap::new(),
            default_voltage: 0.01,
            filter: FilterConfig::default(),
            filter_count_readback: None,
            trigger_auto: true,
            trigger_delay: 0.0,
            buffer: Vec::new(),
            extra_readings: 0,
            missing_readings: 0,
            scans: 0,
            errors: VecDeque::new(),
        }
    }
}

struct RelayBoxState {
    relays: [bool; SENSOR_COUNT],
    temperatures: [f64; SENSOR_COUNT],
    uptime: u64,
    memory: u64,
    switches: Vec<(u8, bool)>,
}

impl Default for RelayBoxState {
    fn default() -> Self {
        Self {
            relays: [false; SENSOR_COUNT],
            temperatures: [22.0; SENSOR_COUNT],
            uptime: 3600,
            memory: 16384,
            switches: Vec::new(),
        }
    }
}

struct ChamberState {
    temperature: f64,
    humidity: f64,
    running: bool,
    program: u32,
    status_byte: u8,
}

impl Default for ChamberState {
    fn default() -> Self {
        Self {
            temperature: 20.0,
            humidity: 30.0,
            running: true,
            program: 1,
            status_byte: 0,
        }
    }
}

#[derive(Default)]
struct SimState {
    smu: SmuState,
    dmm: DmmState,
    relay_box: RelayBoxState,
    chamber: ChamberState,
    offline: HashSet<String>,
    faults: HashMap<String, Vec<(String, u32)>>,
    connects: HashMap<String, u32>,
}

impl SimState {
    fn take_fault(&mut self, resource: &str, command: &str) -> bool {
        let Some(faults) = self.faults.get_mut(resource) else {
            return false;
        };
        let Some(fault) = faults
            .iter_mut()
            .find(|(prefix, count)| *count > 0 && command.starts_with(prefix.as_str()))
        else {
            return false;
        };
        fault.1 -= 1;
        true
    }
}

/// Shared state of all simulated devices.
///
/// Cloning is cheap; clones control the same devices.
#[derive(Clone, Default)]
pub struct SimulationHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulationHandle {
    /// Fresh devices: output off, relays open, chamber idle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector serving the four instrument roles from this simulation.
    pub fn connector(&self, roles: &InstrumentRoles) -> SimConnector {
        let mut kinds = HashMap::new();
        kinds.insert(roles.smu.clone(), SimInstrument::SourceMeter);
        kinds.insert(roles.dmm.clone(), SimInstrument::Multimeter);
        kinds.insert(roles.relay_box.clone(), SimInstrument::RelayBox);
        kinds.insert(roles.chamber.clone(), SimInstrument::Chamber);
        SimConnector {
            handle: self.clone(),
            kinds,
        }
    }

    /// Offline resources refuse connections and fail every command.
    pub fn set_offline(&self, resource: &str, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline.insert(resource.to_string());
        } else {
            state.offline.remove(resource);
        }
    }

    /// Fail the next `count` commands sent to `resource` that start with
    /// `prefix`. The device keeps working otherwise.
    pub fn fail_commands(&self, resource: &str, prefix: &str, count: u32) {
        self.state
            .lock()
            .faults
            .entry(resource.to_string())
            .or_default()
            .push((prefix.to_string(), count));
    }

    /// Number of successful connections to `resource`.
    pub fn connects(&self, resource: &str) -> u32 {
        self.state.lock().connects.get(resource).copied().unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Source meter
    // ------------------------------------------------------------------------

    /// Report a tripped compliance regardless of the current.
    pub fn set_compliance_tripped(&self, tripped: bool) {
        self.state.lock().smu.tripped = tripped;
    }

    /// Resistance the SMU output is loaded with.
    pub fn set_leakage_resistance(&self, ohm: f64) {
        self.state.lock().smu.leakage_resistance = ohm;
    }

    /// Queue an entry in the SMU error queue.
    pub fn push_smu_error(&self, entry: &str) {
        self.state.lock().smu.errors.push_back(entry.to_string());
    }

    /// Put the SMU into a sourcing state, as left behind by an earlier session.
    pub fn set_source(&self, voltage: f64, output: bool) {
        let mut state = self.state.lock();
        state.smu.voltage = voltage;
        state.smu.output = output;
    }

    /// Current voltage setpoint.
    pub fn smu_voltage(&self) -> f64 {
        self.state.lock().smu.voltage
    }

    /// Current output state.
    pub fn smu_output(&self) -> bool {
        self.state.lock().smu.output
    }

    /// Configured compliance in A.
    pub fn smu_compliance(&self) -> f64 {
        self.state.lock().smu.compliance
    }

    /// Every voltage level commanded so far.
    pub fn voltage_history(&self) -> Vec<f64> {
        self.state.lock().smu.voltage_history.clone()
    }

    /// Every output state commanded so far.
    pub fn output_history(&self) -> Vec<bool> {
        self.state.lock().smu.output_history.clone()
    }

    // ------------------------------------------------------------------------
    // Multimeter
    // ------------------------------------------------------------------------

    /// Voltage the multimeter reads on a scanner channel.
    pub fn set_channel_voltage(&self, channel: u32, volts: f64) {
        self.state.lock().dmm.channel_voltages.insert(channel, volts);
    }

    /// Voltage read on channels without an explicit value.
    pub fn set_default_channel_voltage(&self, volts: f64) {
        self.state.lock().dmm.default_voltage = volts;
    }

    /// Append readings to every scan buffer.
    pub fn set_extra_readings(&self, count: usize) {
        self.state.lock().dmm.extra_readings = count;
    }

    /// Drop readings from the end of every scan buffer.
    pub fn set_missing_readings(&self, count: usize) {
        self.state.lock().dmm.missing_readings = count;
    }

    /// Report this averaging count on read-back regardless of the written one.
    pub fn set_dmm_filter_count_readback(&self, count: Option<u32>) {
        self.state.lock().dmm.filter_count_readback = count;
    }

    /// Number of scans started.
    pub fn dmm_scans(&self) -> usize {
        self.state.lock().dmm.scans
    }

    /// Channels of the configured scan list.
    pub fn dmm_channels(&self) -> Vec<u32> {
        self.state.lock().dmm.channels.clone()
    }

    // ------------------------------------------------------------------------
    // Relay box
    // ------------------------------------------------------------------------

    /// PT100 temperature of a relay box channel.
    pub fn set_pt100(&self, channel: u8, celsius: f64) {
        let Some(index) = usize::from(channel).checked_sub(1) else {
            return;
        };
        if let Some(temperature) = self.state.lock().relay_box.temperatures.get_mut(index) {
            *temperature = celsius;
        }
    }

    /// State of a single relay.
    pub fn relay(&self, channel: u8) -> bool {
        usize::from(channel)
            .checked_sub(1)
            .and_then(|i| self.state.lock().relay_box.relays.get(i).copied())
            .unwrap_or(false)
    }

    /// Every single-channel switch commanded so far, as `(channel, on)`.
    pub fn relay_switches(&self) -> Vec<(u8, bool)> {
        self.state.lock().relay_box.switches.clone()
    }

    // ------------------------------------------------------------------------
    // Chamber
    // ------------------------------------------------------------------------

    /// Chamber temperature and humidity readout.
    pub fn set_chamber_climate(&self, temperature: f64, humidity: f64) {
        let mut state = self.state.lock();
        state.chamber.temperature = temperature;
        state.chamber.humidity = humidity;
    }

    /// Chamber program state.
    pub fn set_chamber_program(&self, running: bool, program: u32) {
        let mut state = self.state.lock();
        state.chamber.running = running;
        state.chamber.program = program;
    }

    /// Raw chamber status byte.
    pub fn set_chamber_status_byte(&self, status: u8) {
        self.state.lock().chamber.status_byte = status;
    }
}

/// [`Connector`] handing out simulated devices by resource name.
pub struct SimConnector {
    handle: SimulationHandle,
    kinds: HashMap<String, SimInstrument>,
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, name: &str, _config: &ResourceConfig) -> DaqResult<Box<dyn Adapter>> {
        let kind = *self.kinds.get(name).ok_or_else(|| {
            DaqError::connection(name, "no simulated instrument for this resource")
        })?;
        let mut state = self.handle.state.lock();
        if state.offline.contains(name) {
            return Err(DaqError::connection(name, "simulated device is offline"));
        }
        *state.connects.entry(name.to_string()).or_default() += 1;
        Ok(Box::new(SimAdapter {
            name: name.to_string(),
            kind,
            state: self.handle.state.clone(),
        }))
    }
}

struct SimAdapter {
    name: String,
    kind: SimInstrument,
    state: Arc<Mutex<SimState>>,
}

impl SimAdapter {
    fn dispatch(&self, command: &str) -> DaqResult<Option<String>> {
        let mut state = self.state.lock();
        if state.offline.contains(&self.name) {
            return Err(DaqError::connection(&self.name, "simulated device is offline"));
        }
        if state.take_fault(&self.name, command) {
            return Err(DaqError::connection(&self.name, "simulated transient fault"));
        }
        let (header, arg) = command
            .split_once(' ')
            .map(|(header, arg)| (header, arg.trim()))
            .unwrap_or((command, ""));
        trace!(resource = %self.name, command, "simulated command");
        let reply = match self.kind {
            SimInstrument::SourceMeter => smu_command(&mut state.smu, header, arg),
            SimInstrument::Multimeter => dmm_command(&mut state.dmm, header, arg),
            SimInstrument::RelayBox => relay_box_command(&mut state.relay_box, header, arg),
            SimInstrument::Chamber => chamber_command(&state.chamber, header),
        };
        reply.map_err(|message| DaqError::instrument(&self.name, format!("{}: {}", message, command)))
    }
}

#[async_trait]
impl Adapter for SimAdapter {
    async fn write(&mut self, command: &str) -> DaqResult<()> {
        self.dispatch(command).map(|_| ())
    }

    async fn query(&mut self, command: &str) -> DaqResult<String> {
        self.dispatch(command)?
            .ok_or_else(|| DaqError::instrument(&self.name, format!("no reply to {}", command)))
    }
}

// ============================================================================
// Command handlers
// ============================================================================

type Reply = Result<Option<String>, &'static str>;

const UNDEFINED_HEADER: &str = "-113,\"Undefined header\"";
const ILLEGAL_PARAMETER: &str = "-224,\"Illegal parameter value\"";

fn arg_bool(arg: &str) -> Result<bool, &'static str> {
    match arg.to_ascii_uppercase().as_str() {
        "ON" | "1" => Ok(true),
        "OFF" | "0" => Ok(false),
        _ => Err(ILLEGAL_PARAMETER),
    }
}

fn arg_f64(arg: &str) -> Result<f64, &'static str> {
    arg.parse().map_err(|_| ILLEGAL_PARAMETER)
}

fn flag(value: bool) -> Option<String> {
    Some(if value { "1" } else { "0" }.to_string())
}

fn filter_type_arg(arg: &str) -> Result<FilterType, &'static str> {
    match arg {
        "REP" | "REPEAT" => Ok(FilterType::Repeat),
        "MOV" | "MOVING" => Ok(FilterType::Moving),
        _ => Err(ILLEGAL_PARAMETER),
    }
}

fn filter_type_reply(filter_type: FilterType) -> Option<String> {
    Some(
        match filter_type {
            FilterType::Repeat => "REP",
            FilterType::Moving => "MOV",
        }
        .to_string(),
    )
}

fn error_entry(errors: &mut VecDeque<String>) -> Option<String> {
    Some(errors.pop_front().unwrap_or_else(|| "0,\"No error\"".to_string()))
}

fn smu_command(smu: &mut SmuState, header: &str, arg: &str) -> Reply {
    match header {
        "*IDN?" => Ok(Some("KEITHLEY INSTRUMENTS INC.,MODEL 2410,SIM,C32".into())),
        "*RST" => {
            let tripped = smu.tripped;
            let leakage = smu.leakage_resistance;
            let voltage_history = std::mem::take(&mut smu.voltage_history);
            let output_history = std::mem::take(&mut smu.output_history);
            *smu = SmuState {
                tripped,
                leakage_resistance: leakage,
                voltage_history,
                output_history,
                errors: std::mem::take(&mut smu.errors),
                ..SmuState::default()
            };
            Ok(None)
        }
        "*CLS" => {
            smu.errors.clear();
            Ok(None)
        }
        ":SYST:BEEP:STAT" => arg_bool(arg).map(|_| None),
        ":SYST:ERR?" => Ok(error_entry(&mut smu.errors)),
        ":ROUT:TERM" => {
            smu.terminals = match arg {
                "FRON" | "FRONT" => Terminals::Front,
                "REAR" => Terminals::Rear,
                _ => return Err(ILLEGAL_PARAMETER),
            };
            Ok(None)
        }
        ":ROUT:TERM?" => Ok(Some(
            match smu.terminals {
                Terminals::Front => "FRON",
                Terminals::Rear => "REAR",
            }
            .into(),
        )),
        ":SOUR:FUNC" | ":SOUR:VOLT:MODE" | ":SENS:FUNC" | ":SENS:CURR:RANG:AUTO" | ":FORM:ELEM" => {
            Ok(None)
        }
        ":SENS:AVER:TCON" => {
            smu.filter.filter_type = filter_type_arg(arg)?;
            Ok(None)
        }
        ":SENS:AVER:TCON?" => Ok(filter_type_reply(smu.filter.filter_type)),
        ":SENS:AVER:COUN" => {
            smu.filter.count = arg.parse().map_err(|_| ILLEGAL_PARAMETER)?;
            Ok(None)
        }
        ":SENS:AVER:COUN?" => Ok(Some(smu.filter.count.to_string())),
        ":SENS:AVER:STAT" => {
            smu.filter.enable = arg_bool(arg)?;
            Ok(None)
        }
        ":SENS:AVER:STAT?" => Ok(flag(smu.filter.enable)),
        ":SENS:CURR:PROT:LEV" => {
            smu.compliance = arg_f64(arg)?;
            Ok(None)
        }
        ":SENS:CURR:PROT:LEV?" => Ok(Some(format!("{:E}", smu.compliance))),
        ":SENS:CURR:PROT:TRIP?" => {
            let tripped = smu.tripped || smu.current().abs() >= smu.compliance;
            Ok(flag(tripped))
        }
        ":SOUR:VOLT:LEV" => {
            smu.voltage = arg_f64(arg)?;
            smu.voltage_history.push(smu.voltage);
            Ok(None)
        }
        ":SOUR:VOLT:LEV?" => Ok(Some(format!("{:E}", smu.voltage))),
        ":OUTP:STAT" => {
            smu.output = arg_bool(arg)?;
            smu.output_history.push(smu.output);
            Ok(None)
        }
        ":OUTP:STAT?" => Ok(flag(smu.output)),
        ":READ?" => Ok(Some(format!("{:E}", smu.current()))),
        _ => Err(UNDEFINED_HEADER),
    }
}

fn dmm_command(dmm: &mut DmmState, header: &str, arg: &str) -> Reply {
    match header {
        "*IDN?" => Ok(Some("KEITHLEY INSTRUMENTS INC.,MODEL 2700,SIM,B09".into())),
        "*RST" => {
            dmm.channels.clear();
            dmm.filter = FilterConfig::default();
            dmm.trigger_auto = true;
            dmm.trigger_delay = 0.0;
            dmm.buffer.clear();
            Ok(None)
        }
        "*CLS" => {
            dmm.errors.clear();
            Ok(None)
        }
        ":SYST:BEEP:STAT" => arg_bool(arg).map(|_| None),
        ":SYST:ERR?" => Ok(error_entry(&mut dmm.errors)),
        ":ROUT:SCAN" => {
            dmm.channels = parse_channel_list(header, arg).map_err(|_| ILLEGAL_PARAMETER)?;
            Ok(None)
        }
        ":ROUT:SCAN?" => Ok(Some(format_channel_list(&dmm.channels))),
        ":ROUT:SCAN:LSEL" => {
            if arg == "NONE" {
                dmm.channels.clear();
            }
            Ok(None)
        }
        ":SAMP:COUN" | ":TRIG:COUN" | ":ROUT:SCAN:TSO" | ":FORM:ELEM" => Ok(None),
        ":SENS:VOLT:AVER:TCON" => {
            dmm.filter.filter_type = filter_type_arg(arg)?;
            Ok(None)
        }
        ":SENS:VOLT:AVER:TCON?" => Ok(filter_type_reply(dmm.filter.filter_type)),
        ":SENS:VOLT:AVER:COUN" => {
            dmm.filter.count = arg.parse().map_err(|_| ILLEGAL_PARAMETER)?;
            Ok(None)
        }
        ":SENS:VOLT:AVER:COUN?" => Ok(Some(
            dmm.filter_count_readback
                .unwrap_or(dmm.filter.count)
                .to_string(),
        )),
        ":SENS:VOLT:AVER:STAT" => {
            dmm.filter.enable = arg_bool(arg)?;
            Ok(None)
        }
        ":SENS:VOLT:AVER:STAT?" => Ok(flag(dmm.filter.enable)),
        ":TRIG:DEL:AUTO" => {
            dmm.trigger_auto = arg_bool(arg)?;
            Ok(None)
        }
        ":TRIG:DEL:AUTO?" => Ok(flag(dmm.trigger_auto)),
        ":TRIG:DEL" => {
            dmm.trigger_delay = arg_f64(arg)?;
            Ok(None)
        }
        ":TRIG:DEL?" => Ok(Some(format!("{:E}", dmm.trigger_delay))),
        ":INIT" => {
            dmm.scans += 1;
            let mut buffer: Vec<f64> = dmm
                .channels
                .iter()
                .map(|channel| {
                    dmm.channel_voltages
                        .get(channel)
                        .copied()
                        .unwrap_or(dmm.default_voltage)
                })
                .collect();
            buffer.extend(std::iter::repeat(dmm.default_voltage).take(dmm.extra_readings));
            let keep = buffer.len().saturating_sub(dmm.missing_readings);
            buffer.truncate(keep);
            dmm.buffer = buffer;
            Ok(None)
        }
        ":FETC?" => {
            let values: Vec<String> = std::mem::take(&mut dmm.buffer)
                .iter()
                .map(|value| format!("{:E}", value))
                .collect();
            Ok(Some(values.join(",")))
        }
        _ => Err(UNDEFINED_HEADER),
    }
}

fn relay_index(value: &str) -> Result<usize, &'static str> {
    let channel: usize = value.parse().map_err(|_| ILLEGAL_PARAMETER)?;
    if channel == 0 || channel > SENSOR_COUNT {
        return Err(ILLEGAL_PARAMETER);
    }
    Ok(channel - 1)
}

fn relay_box_command(relay_box: &mut RelayBoxState, header: &str, arg: &str) -> Reply {
    match header {
        "*IDN?" => Ok(Some("HEPHY,SWITCHBOX,SIM,1.2".into())),
        "SYST:UPT?" => Ok(Some(relay_box.uptime.to_string())),
        "SYST:MEM?" => Ok(Some(relay_box.memory.to_string())),
        "TEMP?" => {
            let values: Vec<String> = relay_box
                .temperatures
                .iter()
                .map(|t| format!("{:.2}", t))
                .collect();
            Ok(Some(values.join(",")))
        }
        "REL:CH" => {
            let (channel, state) = arg.split_once(' ').ok_or(ILLEGAL_PARAMETER)?;
            let index = relay_index(channel.trim())?;
            let on = arg_bool(state.trim())?;
            relay_box.relays[index] = on;
            relay_box.switches.push(((index + 1) as u8, on));
            Ok(None)
        }
        "REL:CH?" => {
            let index = relay_index(arg)?;
            Ok(Some(if relay_box.relays[index] { "ON" } else { "OFF" }.into()))
        }
        "REL:ALL" => {
            let on = arg_bool(arg)?;
            relay_box.relays = [on; SENSOR_COUNT];
            Ok(None)
        }
        "REL:ALL?" => {
            let values: Vec<&str> = relay_box
                .relays
                .iter()
                .map(|on| if *on { "1" } else { "0" })
                .collect();
            Ok(Some(values.join(",")))
        }
        _ => Err(UNDEFINED_HEADER),
    }
}

fn chamber_command(chamber: &ChamberState, header: &str) -> Reply {
    match header {
        "AI0?" => Ok(Some(format!("{:.2}", chamber.temperature))),
        "AI1?" => Ok(Some(format!("{:.2}", chamber.humidity))),
        "RUN?" => Ok(Some(format!(
            "{},{}",
            u8::from(chamber.running),
            chamber.program
        ))),
        "STB?" => Ok(Some(chamber.status_byte.to_string())),
        _ => Err(UNDEFINED_HEADER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;

    async fn open(handle: &SimulationHandle, name: &str) -> Box<dyn Adapter> {
        handle
            .connector(&InstrumentRoles::default())
            .connect(name, &ResourceConfig::new("sim://"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dmm_scan_buffer() {
        let handle = SimulationHandle::new();
        handle.set_channel_voltage(102, 15.0);
        let mut dmm = open(&handle, "dmm").await;
        dmm.write(":ROUT:SCAN (@101,102)").await.unwrap();
        dmm.write(":INIT").await.unwrap();
        assert_eq!(dmm.query(":FETC?").await.unwrap(), "1E-2,1.5E1");
        assert_eq!(dmm.query(":FETC?").await.unwrap(), "");
        assert_eq!(handle.dmm_scans(), 1);
    }

    #[tokio::test]
    async fn test_smu_records_voltages() {
        let handle = SimulationHandle::new();
        let mut smu = open(&handle, "smu").await;
        smu.write(":SOUR:VOLT:LEV -5E0").await.unwrap();
        smu.write(":OUTP:STAT ON").await.unwrap();
        assert_eq!(handle.voltage_history(), vec![-5.0]);
        assert!(handle.smu_output());
        assert!(smu.query(":BOGUS?").await.is_err());
    }

    #[tokio::test]
    async fn test_offline_device() {
        let handle = SimulationHandle::new();
        let mut chamber = open(&handle, "chamber").await;
        handle.set_offline("chamber", true);
        assert!(chamber.query("AI0?").await.unwrap_err().is_connection());
        let result = handle
            .connector(&InstrumentRoles::default())
            .connect("chamber", &ResourceConfig::new("sim://"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let handle = SimulationHandle::new();
        let mut smu = open(&handle, "smu").await;
        handle.fail_commands("smu", ":SOUR:VOLT:LEV", 2);
        assert!(smu.write(":SOUR:VOLT:LEV -5").await.unwrap_err().is_connection());
        smu.write(":OUTP:STAT ON").await.unwrap();
        assert!(smu.write(":SOUR:VOLT:LEV -5").await.unwrap_err().is_connection());
        smu.write(":SOUR:VOLT:LEV -5").await.unwrap();
        assert_eq!(handle.smu_voltage(), -5.0);
        assert!(handle.smu_output());
    }

    #[tokio::test]
    async fn test_relay_switches_recorded() {
        let handle = SimulationHandle::new();
        let mut relay_box = open(&handle, "relay_box").await;
        relay_box.write("REL:CH 4 ON").await.unwrap();
        relay_box.write("REL:CH 4 OFF").await.unwrap();
        assert_eq!(handle.relay_switches(), vec![(4, true), (4, false)]);
        assert!(relay_box.write("REL:CH 11 ON").await.is_err());
    }
}
