//! End-to-end runs of the measurement worker against simulated instruments.

use figment::providers::{Format, Toml};
use figment::Figment;
use it_daq::config::Settings;
use it_daq::error::DaqError;
use it_daq::instrument::sim::SimulationHandle;
use it_daq::measurement::{MeasurementWorker, RunOutcome, Stage, WorkerEvent};
use it_daq::resource::ResourceManager;
use it_daq::sensor::{HvState, SensorRegistry, SensorStatus};
use it_daq::writer::read_log;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::Instant;

const RESOURCES: &str = r#"
[resources.smu]
address = "sim://smu"

[resources.dmm]
address = "sim://dmm"

[resources.relay_box]
address = "sim://relay_box"

[resources.chamber]
address = "sim://chamber"
"#;

fn settings(output: &Path) -> Settings {
    let mut settings = Settings::from_figment(Figment::new().merge(Toml::string(RESOURCES)))
        .expect("base settings");
    let measurement = &mut settings.measurement;
    measurement.end_voltage = -800.0;
    measurement.voltage_step = 5.0;
    measurement.waiting_time = 0.1;
    measurement.bias_voltage = -600.0;
    measurement.duration = 25.0;
    measurement.interval = 10.0;
    measurement.operator = "tester".into();
    measurement.output_path = output.to_path_buf();
    settings
}

fn worker(settings: Settings, handle: &SimulationHandle, sensors: &SensorRegistry) -> MeasurementWorker {
    let resources = ResourceManager::new(
        settings.resources.clone(),
        Arc::new(handle.connector(&settings.instruments)),
    );
    MeasurementWorker::new(settings, resources, sensors.clone())
}

/// Drain all events of one run in the background.
fn collect(mut events: broadcast::Receiver<WorkerEvent>) -> tokio::task::JoinHandle<Vec<WorkerEvent>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(WorkerEvent::Finished) => {
                    seen.push(WorkerEvent::Finished);
                    break;
                }
                Ok(event) => seen.push(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        seen
    })
}

fn stages(events: &[WorkerEvent]) -> Vec<Stage> {
    events
        .iter()
        .filter_map(|event| match event {
            WorkerEvent::StageChanged(stage) => Some(*stage),
            _ => None,
        })
        .collect()
}

fn failures(events: &[WorkerEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, WorkerEvent::Failed(_)))
        .count()
}

fn log_files(dir: &Path, prefix: &str) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix))
        })
        .collect();
    files.sort();
    files
}

#[tokio::test(start_paused = true)]
async fn test_complete_run_ramps_up_biases_and_returns_to_zero() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();
    sensors.rename(1, "W12-A").unwrap();
    sensors.set_enabled(4, true).unwrap();
    handle.set_channel_voltage(104, 0.47);

    let worker = worker(settings(dir.path()), &handle, &sensors);
    let events = collect(worker.subscribe());
    assert_eq!(worker.run().await, RunOutcome::Completed);
    let events = events.await.unwrap();

    assert_eq!(
        stages(&events),
        vec![
            Stage::Setup,
            Stage::RampUp,
            Stage::RampToBias,
            Stage::Longterm,
            Stage::RampDown
        ]
    );
    assert_eq!(failures(&events), 0);
    assert!(matches!(events.last(), Some(WorkerEvent::Finished)));

    // Ramp-up: 0 V to -800 V in 5 V steps, strictly decreasing.
    let history = handle.voltage_history();
    let peak = history.iter().position(|v| *v == -800.0).unwrap();
    let ramp_up = &history[1..=peak];
    assert_eq!(ramp_up.len(), 161);
    assert_eq!(ramp_up[0], 0.0);
    assert!(ramp_up.windows(2).all(|w| w[1] < w[0]));
    assert!(history.contains(&-600.0));

    // Ramp-down ends at 0 V with the output disabled.
    assert_eq!(history.last(), Some(&0.0));
    assert_eq!(handle.smu_voltage(), 0.0);
    assert!(!handle.smu_output());
    assert!(sensors.is_editable());

    // 161 ramp-up scans, long-term scans at 0 s, 10 s and 20 s.
    assert_eq!(handle.dmm_scans(), 164);
    assert_eq!(handle.dmm_channels(), vec![101, 104]);

    let iv = log_files(dir.path(), "IV-");
    assert_eq!(iv.len(), 2);
    let log = read_log(&iv[0]).unwrap();
    assert_eq!(log.metadata.sensor_name, "W12-A");
    assert_eq!(log.metadata.sensor_channel, 1);
    assert_eq!(log.metadata.operator, "tester");
    assert_eq!(log.metadata.voltage, -800.0);
    assert_eq!(log.rows.len(), 161);
    assert_eq!(log.rows[160].voltage, -800.0);
    assert!(log.rows.iter().all(|row| row.hv == HvState::Unknown));
    assert!(log.rows.iter().all(|row| row.temperature.is_none()));

    let it = log_files(dir.path(), "It-");
    assert_eq!(it.len(), 2);
    let log = read_log(&it[1]).unwrap();
    assert_eq!(log.metadata.sensor_channel, 4);
    assert_eq!(log.metadata.voltage, -600.0);
    assert_eq!(log.rows.len(), 3);
    let current = log.rows[0].current.unwrap();
    assert!((current - 1e-6).abs() < 1e-12);
}

#[tokio::test(start_paused = true)]
async fn test_sensors_sharing_a_name_keep_separate_logs() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();
    sensors.rename(1, "W05/A").unwrap();
    sensors.set_enabled(2, true).unwrap();
    sensors.rename(2, "W05 A").unwrap();

    let mut config = settings(dir.path());
    config.measurement.end_voltage = -20.0;
    config.measurement.bias_voltage = -20.0;
    config.measurement.duration = 15.0;
    let worker = worker(config, &handle, &sensors);
    assert_eq!(worker.run().await, RunOutcome::Completed);

    for (prefix, rows) in [("IV-", 5), ("It-", 2)] {
        let files = log_files(dir.path(), prefix);
        assert_eq!(files.len(), 2, "{} files", prefix);
        for (channel, file) in (1u8..).zip(&files) {
            let log = read_log(file).unwrap();
            assert_eq!(log.metadata.sensor_channel, channel);
            assert_eq!(log.rows.len(), rows);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_longterm_ramps_down_promptly() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    sensors.set_enabled(2, true).unwrap();

    let mut config = settings(dir.path());
    config.measurement.end_voltage = -20.0;
    config.measurement.bias_voltage = -20.0;
    config.measurement.duration = 0.0;
    config.measurement.interval = 60.0;
    let worker = Arc::new(worker(config, &handle, &sensors));
    let abort = worker.abort_handle();
    let mut events = worker.subscribe();

    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    // Wait for the first long-term reading.
    let mut in_longterm = false;
    loop {
        match events.recv().await.unwrap() {
            WorkerEvent::StageChanged(Stage::Longterm) => in_longterm = true,
            WorkerEvent::Reading(_) if in_longterm => break,
            _ => {}
        }
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    let scans = handle.dmm_scans();
    let requested = Instant::now();
    abort.abort();

    loop {
        if let WorkerEvent::StageChanged(Stage::RampDown) = events.recv().await.unwrap() {
            break;
        }
    }
    assert!(requested.elapsed() <= Duration::from_millis(250));

    assert_eq!(runner.await.unwrap(), RunOutcome::Aborted);
    assert_eq!(handle.dmm_scans(), scans);
    assert_eq!(handle.smu_voltage(), 0.0);
    assert!(!handle.smu_output());
    assert!(!abort.is_aborted());
    assert!(sensors.is_editable());
}

#[tokio::test(start_paused = true)]
async fn test_abort_is_not_reported_as_failure() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    let worker = worker(settings(dir.path()), &handle, &sensors);
    let events = collect(worker.subscribe());

    worker.abort_handle().abort();
    assert_eq!(worker.run().await, RunOutcome::Aborted);
    let events = events.await.unwrap();
    assert_eq!(failures(&events), 0);
    assert_eq!(stages(&events).last(), Some(&Stage::RampDown));
    assert_eq!(handle.voltage_history().last(), Some(&0.0));
}

#[tokio::test(start_paused = true)]
async fn test_sensor_over_single_compliance_is_switched_off() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();
    sensors.set_enabled(2, true).unwrap();
    handle.set_channel_voltage(101, 15.0);
    handle.set_channel_voltage(102, 0.01);

    let mut config = settings(dir.path());
    config.measurement.use_relay_box = true;
    config.measurement.end_voltage = -10.0;
    config.measurement.bias_voltage = -10.0;
    config.measurement.duration = 5.0;
    let worker = worker(config, &handle, &sensors);
    assert_eq!(worker.run().await, RunOutcome::Completed);

    let faulted = sensors.get(1).unwrap();
    assert_eq!(faulted.status, SensorStatus::ComplianceError);
    assert_eq!(faulted.hv, HvState::Off);
    assert_eq!(sensors.get(2).unwrap().status, SensorStatus::Ok);

    let switches = handle.relay_switches();
    assert_eq!(&switches[..2], &[(1, true), (2, true)]);
    assert!(switches.contains(&(1, false)));
    assert!(!switches.contains(&(2, false)));
    assert!((1..=10).all(|channel| !handle.relay(channel)));

    let iv = log_files(dir.path(), "IV-");
    let log = read_log(&iv[0]).unwrap();
    assert_eq!(log.metadata.sensor_channel, 1);
    assert_eq!(log.rows[0].hv, HvState::Off);
    assert_eq!(log.rows[0].pt100, Some(22.0));
}

#[tokio::test(start_paused = true)]
async fn test_tripped_compliance_fails_run_once() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    handle.set_compliance_tripped(true);
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();

    let worker = worker(settings(dir.path()), &handle, &sensors);
    let events = collect(worker.subscribe());
    assert_eq!(worker.run().await, RunOutcome::Failed);
    let events = events.await.unwrap();

    assert_eq!(failures(&events), 1);
    let failed = events
        .iter()
        .position(|event| matches!(event, WorkerEvent::Failed(err) if matches!(**err, DaqError::Compliance { .. })))
        .unwrap();
    assert_eq!(failed + 1, events.len() - 2);
    assert!(matches!(events.last(), Some(WorkerEvent::Finished)));
    assert_eq!(handle.smu_voltage(), 0.0);
    assert!(!handle.smu_output());
    assert!(sensors.is_editable());
}

#[tokio::test(start_paused = true)]
async fn test_continue_in_compliance_keeps_measuring() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    handle.set_compliance_tripped(true);
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();

    let mut config = settings(dir.path());
    config.measurement.continue_in_compliance = true;
    config.measurement.end_voltage = -10.0;
    config.measurement.bias_voltage = -5.0;
    config.measurement.duration = 1.0;
    let worker = worker(config, &handle, &sensors);
    assert_eq!(worker.run().await, RunOutcome::Completed);
    assert_eq!(handle.dmm_scans(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_filter_readback_mismatch_aborts_setup() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    handle.set_dmm_filter_count_readback(Some(3));
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();

    let mut config = settings(dir.path());
    config.dmm.filter.enable = true;
    config.dmm.filter.count = 10;
    let worker = worker(config, &handle, &sensors);
    let events = collect(worker.subscribe());
    assert_eq!(worker.run().await, RunOutcome::Failed);
    let events = events.await.unwrap();

    assert_eq!(stages(&events), vec![Stage::Setup, Stage::RampDown]);
    let verification = events.iter().any(|event| {
        matches!(event, WorkerEvent::Failed(err)
            if matches!(&**err, DaqError::ConfigurationVerification { setting, .. } if setting == "dmm.filter"))
    });
    assert!(verification);
    assert_eq!(handle.dmm_scans(), 0);
    assert!(!handle.smu_output());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_instrument_fails_without_ramp() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    handle.set_offline("smu", true);
    let sensors = SensorRegistry::new();

    let worker = worker(settings(dir.path()), &handle, &sensors);
    let events = collect(worker.subscribe());
    assert_eq!(worker.run().await, RunOutcome::Failed);
    let events = events.await.unwrap();
    assert_eq!(failures(&events), 1);
    assert!(stages(&events).is_empty());
    assert!(handle.voltage_history().is_empty());
    assert!(sensors.is_editable());
}

#[tokio::test(start_paused = true)]
async fn test_worker_can_run_again() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    sensors.set_enabled(3, true).unwrap();

    let mut config = settings(dir.path());
    config.measurement.end_voltage = -10.0;
    config.measurement.bias_voltage = -10.0;
    config.measurement.duration = 1.0;
    let worker = worker(config, &handle, &sensors);

    assert_eq!(worker.run().await, RunOutcome::Completed);
    sensors.set_resistivity(3, 1e6).unwrap();
    assert_eq!(worker.run().await, RunOutcome::Completed);
    assert_eq!(handle.connects("smu"), 2);
    assert_eq!(sensors.get(3).unwrap().resistivity, 1e6);
}

#[tokio::test(start_paused = true)]
async fn test_registry_locked_while_running() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();

    let worker = Arc::new(worker(settings(dir.path()), &handle, &sensors));
    let mut events = worker.subscribe();
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };
    loop {
        if let WorkerEvent::Started = events.recv().await.unwrap() {
            break;
        }
    }
    assert!(!sensors.is_editable());
    assert!(matches!(sensors.set_enabled(2, true), Err(DaqError::RegistryLocked)));

    // A second run is refused without releasing the first run's lock.
    let mut second = worker.subscribe();
    let smu_connects = handle.connects("smu");
    worker.abort_handle().abort();
    let outcome = worker.run().await;
    assert_eq!(outcome, RunOutcome::Failed);
    assert!(matches!(
        second.recv().await.unwrap(),
        WorkerEvent::Failed(err) if matches!(*err, DaqError::RegistryLocked)
    ));
    assert!(matches!(second.recv().await.unwrap(), WorkerEvent::Finished));
    assert_eq!(handle.connects("smu"), smu_connects);
    assert!(!sensors.is_editable());
    assert!(matches!(sensors.set_enabled(2, true), Err(DaqError::RegistryLocked)));
    // The pending abort still reaches the first run.
    assert!(worker.abort_handle().is_aborted());

    assert_eq!(runner.await.unwrap(), RunOutcome::Aborted);
    assert!(sensors.set_enabled(2, true).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_live_output_is_ramped_to_zero_before_setup() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    handle.set_source(-300.0, true);
    let sensors = SensorRegistry::new();

    let mut config = settings(dir.path());
    config.measurement.end_voltage = -10.0;
    config.measurement.bias_voltage = -10.0;
    config.measurement.duration = 1.0;
    let worker = worker(config, &handle, &sensors);
    let events = collect(worker.subscribe());
    assert_eq!(worker.run().await, RunOutcome::Completed);
    let events = events.await.unwrap();

    assert!(events
        .iter()
        .any(|event| matches!(event, WorkerEvent::Message(text) if text.contains("-300"))));
    // Ramp-down step is at least 10 V: -300, -290, ..., 0.
    let history = handle.voltage_history();
    let expected: Vec<f64> = (0..=30).map(|i| -300.0 + 10.0 * i as f64).collect();
    assert_eq!(&history[..31], expected.as_slice());
    assert_eq!(history.last(), Some(&0.0));
    assert!(!handle.smu_output());
}

#[tokio::test(start_paused = true)]
async fn test_failure_in_longterm_ramps_down_from_positive_bias() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();

    let mut config = settings(dir.path());
    config.measurement.end_voltage = 100.0;
    config.measurement.bias_voltage = 50.0;
    config.measurement.duration = 0.0;
    let worker = Arc::new(worker(config, &handle, &sensors));
    let mut events = worker.subscribe();
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    loop {
        if let WorkerEvent::StageChanged(Stage::Longterm) = events.recv().await.unwrap() {
            break;
        }
    }
    handle.set_offline("dmm", true);

    let mut failed = Vec::new();
    loop {
        match events.recv().await {
            Ok(WorkerEvent::Failed(err)) => failed.push(err),
            Ok(WorkerEvent::Finished) => break,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    assert_eq!(runner.await.unwrap(), RunOutcome::Failed);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].is_connection());

    let history = handle.voltage_history();
    let bias = history.iter().rposition(|v| *v == 50.0).unwrap();
    let ramp_down = &history[bias..];
    assert!(ramp_down.windows(2).all(|w| w[1] < w[0]));
    assert_eq!(ramp_down.last(), Some(&0.0));
    assert_eq!(handle.output_history(), vec![true, false]);
    assert!(sensors.is_editable());
}

/// Start a run and wait until it enters the long-term stage.
async fn start_until_longterm(
    worker: &Arc<MeasurementWorker>,
) -> (tokio::task::JoinHandle<RunOutcome>, broadcast::Receiver<WorkerEvent>) {
    let mut events = worker.subscribe();
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };
    loop {
        if let WorkerEvent::StageChanged(Stage::Longterm) = events.recv().await.unwrap() {
            break;
        }
    }
    (runner, events)
}

async fn failed_until_finished(events: &mut broadcast::Receiver<WorkerEvent>) -> Vec<Arc<DaqError>> {
    let mut failed = Vec::new();
    loop {
        match events.recv().await {
            Ok(WorkerEvent::Failed(err)) => failed.push(err),
            Ok(WorkerEvent::Finished) => break,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    failed
}

#[tokio::test(start_paused = true)]
async fn test_ramp_down_skips_failing_step_and_still_reaches_zero() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();

    let mut config = settings(dir.path());
    config.measurement.end_voltage = -100.0;
    config.measurement.bias_voltage = -50.0;
    config.measurement.duration = 0.0;
    let worker = Arc::new(worker(config, &handle, &sensors));
    let (runner, mut events) = start_until_longterm(&worker).await;

    // Every attempt at -40 V fails, the first attempt at -30 V too.
    handle.fail_commands("smu", ":SOUR:VOLT:LEV ", 4);
    handle.set_offline("dmm", true);

    let failed = failed_until_finished(&mut events).await;
    assert_eq!(runner.await.unwrap(), RunOutcome::Failed);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].is_connection());

    let history = handle.voltage_history();
    let bias = history.iter().rposition(|v| *v == -50.0).unwrap();
    assert_eq!(&history[bias..], &[-50.0, -30.0, -20.0, -10.0, 0.0]);
    assert_eq!(handle.smu_voltage(), 0.0);
    assert!(!handle.smu_output());
    assert_eq!(handle.output_history(), vec![true, false]);
    assert!(sensors.is_editable());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_relay_box_still_switches_output_off() {
    let dir = TempDir::new().unwrap();
    let handle = SimulationHandle::new();
    let sensors = SensorRegistry::new();
    sensors.set_enabled(1, true).unwrap();

    let mut config = settings(dir.path());
    config.measurement.end_voltage = -100.0;
    config.measurement.bias_voltage = -50.0;
    config.measurement.duration = 0.0;
    config.measurement.use_relay_box = true;
    let worker = Arc::new(worker(config, &handle, &sensors));
    let (runner, mut events) = start_until_longterm(&worker).await;

    handle.set_offline("relay_box", true);

    let failed = failed_until_finished(&mut events).await;
    assert_eq!(runner.await.unwrap(), RunOutcome::Failed);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].is_connection());

    let history = handle.voltage_history();
    let bias = history.iter().rposition(|v| *v == -50.0).unwrap();
    assert_eq!(&history[bias..], &[-50.0, -40.0, -30.0, -20.0, -10.0, 0.0]);
    assert!(!handle.smu_output());
    assert_eq!(handle.output_history(), vec![true, false]);
    assert!(sensors.is_editable());
}
