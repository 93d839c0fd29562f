//! Measurement worker.
//!
//! A run executes the stages in a fixed order:
//!
//! ```text
//! Setup -> RampUp -> RampToBias -> Longterm -> RampDown -> Finished
//! ```
//!
//! `RampDown` runs on every path. It follows `Longterm` on success and is the
//! cleanup after an abort or a failure in any earlier stage. A user abort is
//! not reported as a failure; any other error produces exactly one
//! [`WorkerEvent::Failed`]. Every run ends with exactly one
//! [`WorkerEvent::Finished`], after edit permission on the sensor registry has
//! been handed back and the abort flag has been reset.

use super::cancel::{AbortHandle, CancellationPoint};
use super::events::{Stage, WorkerEvent};
use super::ramp::LinearRange;
use super::reading::Reading;
use super::scan::{channel_addresses, now_seconds, scan, RelayBoxLink, ScanContext};
use crate::config::{FilterConfig, Settings};
use crate::environment::AmbientSnapshot;
use crate::error::{DaqError, DaqResult};
use crate::error_recovery::{unless_aborted, RetryPolicy};
use crate::instrument::{Multimeter, RelayBox, SourceMeter, TriggerDelay, K2410, K2700};
use crate::limits::{RAMP_DOWN_ATTEMPTS, RAMP_DOWN_DELAY, RAMP_DOWN_MIN_STEP};
use crate::resource::ResourceManager;
use crate::sensor::{HvState, SensorRegistry};
use crate::writer::{LogKind, LogRow, LogWriter, ResultSink};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All stages ran to the end
    Completed,
    /// Stopped by the abort flag
    Aborted,
    /// An error ended the run
    Failed,
}

/// State owned by one run.
struct RunState {
    /// Last voltage level commanded to the SMU
    voltage: f64,
    start: DateTime<Utc>,
}

/// Log files of one stage, one per enabled sensor.
type StageLogs = Vec<(u8, Box<dyn ResultSink>)>;

/// Drives SMU, multimeter and relay box through a measurement run.
pub struct MeasurementWorker {
    settings: Settings,
    resources: ResourceManager,
    sensors: SensorRegistry,
    abort: AbortHandle,
    events: broadcast::Sender<WorkerEvent>,
    ambient: Option<watch::Receiver<AmbientSnapshot>>,
}

impl MeasurementWorker {
    /// Worker over `resources`, measuring the enabled sensors of `sensors`.
    pub fn new(settings: Settings, resources: ResourceManager, sensors: SensorRegistry) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            settings,
            resources,
            sensors,
            abort: AbortHandle::new(),
            events,
            ambient: None,
        }
    }

    /// Annotate log rows with the environment poller's last snapshot.
    pub fn with_ambient(mut self, ambient: watch::Receiver<AmbientSnapshot>) -> Self {
        self.ambient = Some(ambient);
        self
    }

    /// Receive the events of all following runs.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Handle to request an abort of the running measurement.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Sensor table shared with the worker.
    pub fn sensors(&self) -> &SensorRegistry {
        &self.sensors
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn relay_box_link(&self) -> Option<RelayBoxLink> {
        self.settings
            .measurement
            .use_relay_box
            .then(|| RelayBoxLink::new(self.resources.clone(), &self.settings.instruments.relay_box))
    }

    /// Execute one complete run.
    ///
    /// A run started while another run holds the sensor registry fails with
    /// `RegistryLocked` before touching any instrument, the abort flag or the
    /// other run's lock.
    pub async fn run(&self) -> RunOutcome {
        let lock = match self.sensors.lock_for_run() {
            Ok(lock) => lock,
            Err(err) => {
                error!(error = %err, "measurement not started");
                self.emit(WorkerEvent::Failed(Arc::new(err)));
                self.emit(WorkerEvent::Finished);
                return RunOutcome::Failed;
            }
        };
        let mut state = RunState {
            voltage: 0.0,
            start: Utc::now(),
        };
        info!(
            end_voltage = self.settings.measurement.end_voltage,
            bias_voltage = self.settings.measurement.bias_voltage,
            sensors = self.sensors.enabled().len(),
            "measurement started"
        );

        let result = self.run_guarded(&mut state).await;

        let outcome = match result {
            Ok(()) => {
                info!("measurement completed");
                RunOutcome::Completed
            }
            Err(DaqError::AbortRequested) => {
                info!("measurement aborted");
                RunOutcome::Aborted
            }
            Err(err) => {
                error!(error = %err, "measurement failed");
                self.emit(WorkerEvent::Failed(Arc::new(err)));
                RunOutcome::Failed
            }
        };

        self.abort.reset();
        drop(lock);
        self.emit(WorkerEvent::SensorsUpdated(self.sensors.snapshot()));
        self.emit(WorkerEvent::Finished);
        outcome
    }

    /// Stages with ramp-down as structured cleanup. The first error wins; a
    /// ramp-down error after a failed stage is only logged.
    async fn run_guarded(&self, state: &mut RunState) -> DaqResult<()> {
        let smu = K2410::new(self.resources.acquire(&self.settings.instruments.smu).await?);

        let result = match self.resources.acquire(&self.settings.instruments.dmm).await {
            Ok(guard) => {
                let dmm = K2700::new(guard);
                self.measure(state, &smu, &dmm).await
            }
            Err(err) => Err(err),
        };

        let cleanup = self.ramp_down(state, &smu).await;
        match (result, cleanup) {
            (Err(err), Err(cleanup_err)) => {
                error!(error = %cleanup_err, "ramp-down incomplete");
                Err(err)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn measure(
        &self,
        state: &mut RunState,
        smu: &dyn SourceMeter,
        dmm: &dyn Multimeter,
    ) -> DaqResult<()> {
        let relay_box = self.relay_box_link();
        let ctx = ScanContext {
            sensors: &self.sensors,
            measurement: &self.settings.measurement,
            dmm: &self.settings.dmm,
            relay_box: relay_box.as_ref(),
        };
        self.setup(state, smu, dmm, &ctx).await?;
        self.ramp_up(state, smu, dmm, &ctx).await?;
        self.ramp_to_bias(state, smu).await?;
        self.longterm(state, smu, dmm, &ctx).await
    }

    fn enter(&self, stage: Stage) {
        info!(%stage, "entering stage");
        self.emit(WorkerEvent::StageChanged(stage));
    }

    // ========================================================================
    // Setup
    // ========================================================================

    #[instrument(skip_all, fields(stage = %Stage::Setup))]
    async fn setup(
        &self,
        state: &mut RunState,
        smu: &dyn SourceMeter,
        dmm: &dyn Multimeter,
        ctx: &ScanContext<'_>,
    ) -> DaqResult<()> {
        self.enter(Stage::Setup);
        self.sensors.update_all(|sensor| sensor.reset_live_state());

        if smu.output().await? {
            state.voltage = smu.voltage().await?;
            if state.voltage != 0.0 {
                self.emit(WorkerEvent::Message(format!(
                    "Output still at {} V, ramping to zero",
                    state.voltage
                )));
                self.ramp_voltage_to_zero(state, smu).await?;
            }
        }

        smu.reset().await?;
        dmm.reset().await?;
        smu.clear().await?;
        dmm.clear().await?;
        smu.set_beeper(false).await?;
        dmm.set_beeper(false).await?;
        self.expect_no_error(&self.settings.instruments.smu, smu.next_error().await?)?;
        self.expect_no_error(&self.settings.instruments.dmm, dmm.next_error().await?)?;

        let channels = channel_addresses(ctx);
        dmm.configure_scan(&channels).await?;
        if !channels.is_empty() {
            verify("dmm.channels", &channels, &dmm.scan_channels().await?)?;
        }
        let trigger_delay = if self.settings.dmm.trigger_delay_auto {
            TriggerDelay::Auto
        } else {
            TriggerDelay::Fixed(self.settings.dmm.trigger_delay)
        };
        dmm.set_trigger_delay(trigger_delay).await?;
        verify("dmm.trigger_delay", &trigger_delay, &dmm.trigger_delay().await?)?;
        let dmm_filter = self.settings.dmm.filter;
        dmm.set_filter(&dmm_filter).await?;
        verify_filter("dmm.filter", &dmm_filter, &dmm.filter().await?)?;

        let terminals = self.settings.smu.terminals;
        smu.set_terminals(terminals).await?;
        verify("smu.terminals", &terminals, &smu.terminals().await?)?;
        smu.configure_source_voltage().await?;
        let smu_filter = self.settings.smu.filter;
        smu.set_filter(&smu_filter).await?;
        verify_filter("smu.filter", &smu_filter, &smu.filter().await?)?;
        let compliance = self.settings.measurement.total_compliance();
        smu.set_compliance(compliance).await?;
        let actual = smu.compliance().await?;
        if (actual - compliance).abs() > compliance * 1e-6 {
            return Err(DaqError::ConfigurationVerification {
                setting: "smu.compliance".into(),
                expected: format!("{:E}", compliance),
                actual: format!("{:E}", actual),
            });
        }

        smu.set_voltage(0.0).await?;
        state.voltage = 0.0;
        self.emit(WorkerEvent::Voltage(0.0));
        smu.set_output(true).await?;
        self.expect_no_error(&self.settings.instruments.smu, smu.next_error().await?)?;
        self.expect_no_error(&self.settings.instruments.dmm, dmm.next_error().await?)?;

        match ctx.relay_box {
            Some(link) => {
                let relay_box = link.open().await?;
                for sensor in self.sensors.snapshot() {
                    relay_box.set_relay(sensor.index, sensor.enabled).await?;
                    self.sensors
                        .update(sensor.index, |s| s.hv = HvState::from_relay(sensor.enabled));
                }
            }
            None => self.sensors.update_all(|s| s.hv = HvState::Unknown),
        }
        self.emit(WorkerEvent::SensorsUpdated(self.sensors.snapshot()));
        Ok(())
    }

    fn expect_no_error(&self, resource: &str, entry: Option<String>) -> DaqResult<()> {
        match entry {
            Some(message) => Err(DaqError::instrument(resource, message)),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Ramp-up
    // ========================================================================

    #[instrument(skip_all, fields(stage = %Stage::RampUp))]
    async fn ramp_up(
        &self,
        state: &mut RunState,
        smu: &dyn SourceMeter,
        dmm: &dyn Multimeter,
        ctx: &ScanContext<'_>,
    ) -> DaqResult<()> {
        self.enter(Stage::RampUp);
        self.emit(WorkerEvent::Started);
        let config = &self.settings.measurement;
        let mut logs = self.open_logs(LogKind::Iv, state.start, config.end_voltage).await?;
        let stage_start = now_seconds();

        let ramp = LinearRange::new(state.voltage, config.end_voltage, config.voltage_step);
        let steps = ramp.len() as u64;
        for (step, voltage) in ramp.enumerate() {
            self.abort.check(CancellationPoint::RampUpStep)?;
            self.set_voltage(state, smu, voltage).await?;
            self.abort.sleep(config.waiting_time()).await?;

            let reading = scan(smu, dmm, ctx, voltage).await?;
            self.write_rows(&mut logs, &reading, stage_start).await?;
            self.publish(reading);
            self.emit(WorkerEvent::Progress {
                value: step as u64 + 1,
                maximum: Some(steps),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Ramp to bias
    // ========================================================================

    #[instrument(skip_all, fields(stage = %Stage::RampToBias))]
    async fn ramp_to_bias(&self, state: &mut RunState, smu: &dyn SourceMeter) -> DaqResult<()> {
        self.enter(Stage::RampToBias);
        let config = &self.settings.measurement;
        let ramp = LinearRange::new(state.voltage, config.bias_voltage, config.voltage_step);
        let steps = ramp.len() as u64;
        for (step, voltage) in ramp.enumerate() {
            self.abort.check(CancellationPoint::RampToBiasStep)?;
            self.set_voltage(state, smu, voltage).await?;
            self.abort.sleep(config.waiting_time()).await?;

            let current = smu.read_current().await?;
            self.emit(WorkerEvent::SmuCurrent {
                voltage,
                current: Some(current),
            });
            self.emit(WorkerEvent::Progress {
                value: step as u64 + 1,
                maximum: Some(steps),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Long-term
    // ========================================================================

    #[instrument(skip_all, fields(stage = %Stage::Longterm))]
    async fn longterm(
        &self,
        state: &mut RunState,
        smu: &dyn SourceMeter,
        dmm: &dyn Multimeter,
        ctx: &ScanContext<'_>,
    ) -> DaqResult<()> {
        self.enter(Stage::Longterm);
        let config = &self.settings.measurement;
        let mut logs = self.open_logs(LogKind::It, state.start, state.voltage).await?;
        let stage_start = now_seconds();
        let started = Instant::now();
        let duration = config.duration();
        let interval = config.interval();

        let mut cycles: u64 = 0;
        loop {
            self.abort.check(CancellationPoint::LongtermCycle)?;
            let elapsed = started.elapsed();
            if duration.is_some_and(|limit| elapsed >= limit) {
                break;
            }

            let reading = scan(smu, dmm, ctx, state.voltage).await?;
            self.write_rows(&mut logs, &reading, stage_start).await?;
            self.publish(reading);
            cycles += 1;

            let elapsed = started.elapsed();
            let pause = match duration {
                Some(limit) => {
                    self.emit(WorkerEvent::Progress {
                        value: elapsed.as_secs().min(limit.as_secs()),
                        maximum: Some(limit.as_secs()),
                    });
                    interval.min(limit.saturating_sub(elapsed))
                }
                None => {
                    self.emit(WorkerEvent::Progress {
                        value: cycles,
                        maximum: None,
                    });
                    interval
                }
            };
            self.abort.sleep(pause).await?;
        }
        debug!(cycles, "long-term stage complete");
        Ok(())
    }

    // ========================================================================
    // Ramp-down
    // ========================================================================

    /// Bring the SMU back to 0 V with output off and all relays open.
    ///
    /// Never stops early: failed steps are retried, then skipped, so the ramp
    /// always reaches its final 0 V step. The first error is returned after
    /// all cleanup actions were attempted.
    #[instrument(skip_all, fields(stage = %Stage::RampDown))]
    async fn ramp_down(&self, state: &mut RunState, smu: &dyn SourceMeter) -> DaqResult<()> {
        self.enter(Stage::RampDown);
        let policy = RetryPolicy::fixed(RAMP_DOWN_ATTEMPTS, RAMP_DOWN_DELAY);
        let mut failure = self.ramp_voltage_to_zero(state, smu).await.err();

        if let Some(link) = self.relay_box_link() {
            let link = &link;
            let opened = policy
                .run(unless_aborted, move || async move {
                    let relay_box = link.open().await?;
                    relay_box.set_all_relays(false).await
                })
                .await;
            match opened {
                Ok(()) => self.sensors.update_all(|s| s.hv = HvState::Off),
                Err(err) => {
                    error!(error = %err, "failed to open relays");
                    failure.get_or_insert(err);
                }
            }
        }

        if let Err(err) = policy
            .run(unless_aborted, move || smu.set_output(false))
            .await
        {
            error!(error = %err, "failed to disable SMU output");
            failure.get_or_insert(err);
        }
        self.emit(WorkerEvent::SensorsUpdated(self.sensors.snapshot()));

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Step from the current voltage to 0 V with the ramp-down step size,
    /// not interruptible by abort.
    async fn ramp_voltage_to_zero(&self, state: &mut RunState, smu: &dyn SourceMeter) -> DaqResult<()> {
        let step = self
            .settings
            .measurement
            .voltage_step
            .abs()
            .max(RAMP_DOWN_MIN_STEP);
        let policy = RetryPolicy::fixed(RAMP_DOWN_ATTEMPTS, RAMP_DOWN_DELAY);
        let mut failure = None;

        for voltage in LinearRange::new(state.voltage, 0.0, step) {
            match policy
                .run(unless_aborted, move || smu.set_voltage(voltage))
                .await
            {
                Ok(()) => {
                    state.voltage = voltage;
                    self.emit(WorkerEvent::Voltage(voltage));
                    self.emit(WorkerEvent::SmuCurrent {
                        voltage,
                        current: None,
                    });
                }
                Err(err) => {
                    warn!(voltage, error = %err, "ramp-down step failed, skipping");
                    failure.get_or_insert(err);
                }
            }
            tokio::time::sleep(RAMP_DOWN_DELAY).await;
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn set_voltage(&self, state: &mut RunState, smu: &dyn SourceMeter, voltage: f64) -> DaqResult<()> {
        smu.set_voltage(voltage).await?;
        state.voltage = voltage;
        debug!(voltage, "voltage set");
        self.emit(WorkerEvent::Voltage(voltage));
        Ok(())
    }

    fn publish(&self, reading: Reading) {
        self.emit(WorkerEvent::Reading(reading));
        self.emit(WorkerEvent::SensorsUpdated(self.sensors.snapshot()));
    }

    async fn open_logs(&self, kind: LogKind, start: DateTime<Utc>, voltage: f64) -> DaqResult<StageLogs> {
        let config = &self.settings.measurement;
        let mut logs: StageLogs = Vec::new();
        for sensor in self.sensors.enabled() {
            let mut log = LogWriter::create(&config.output_path, kind, &sensor, start)?;
            log.write_meta(&sensor, &config.operator, start, voltage).await?;
            log.write_header().await?;
            let sink: Box<dyn ResultSink> = Box::new(log);
            logs.push((sensor.index, sink));
        }
        Ok(logs)
    }

    async fn write_rows(&self, logs: &mut StageLogs, reading: &Reading, stage_start: f64) -> DaqResult<()> {
        let ambient = self
            .ambient
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or_default();
        for (index, log) in logs.iter_mut() {
            let index = *index;
            let Some(channel) = reading.channels.get(&index) else {
                continue;
            };
            let hv = self
                .sensors
                .get(index)
                .map_or(HvState::Unknown, |sensor| sensor.hv);
            log.write_row(&LogRow {
                timestamp: reading.timestamp - stage_start,
                voltage: reading.smu_voltage,
                current: Some(channel.current),
                smu_current: reading.smu_current,
                pt100: channel.temperature,
                temperature: ambient.temperature,
                humidity: ambient.humidity,
                status: ambient.status,
                program: ambient.program,
                hv,
            })
            .await?;
        }
        Ok(())
    }
}

fn verify<T: PartialEq + Debug>(setting: &str, expected: &T, actual: &T) -> DaqResult<()> {
    if expected != actual {
        return Err(DaqError::ConfigurationVerification {
            setting: setting.to_string(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        });
    }
    Ok(())
}

/// Filter read-back; type and count only matter while the filter is enabled.
fn verify_filter(setting: &str, expected: &FilterConfig, actual: &FilterConfig) -> DaqResult<()> {
    let differs = expected.enable != actual.enable
        || (expected.enable
            && (expected.filter_type != actual.filter_type || expected.count != actual.count));
    if differs {
        return Err(DaqError::ConfigurationVerification {
            setting: setting.to_string(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        });
    }
    Ok(())
}
