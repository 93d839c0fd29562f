//! Climate chamber poller.
//!
//! Runs as its own task, independent of any measurement. Every interval it
//! acquires the chamber resource, reads temperature, humidity and program
//! state, and publishes an [`AmbientSnapshot`]. The latest snapshot is kept in
//! a `watch` channel (last value wins, readers may see stale data); events go
//! out on a `broadcast` channel.
//!
//! A failed readout is reported once per outage: only the first of several
//! consecutive failures produces [`EnvironmentEvent::Failed`]. After a failure
//! the poller backs off for the failure timeout before the next attempt.

use crate::config::EnvironmentConfig;
use crate::error::{DaqError, DaqResult};
use crate::error_recovery::Backoff;
use crate::instrument::{Chamber, ChamberStatus, ClimateChamber};
use crate::measurement::AbortHandle;
use crate::resource::ResourceManager;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Last known chamber state. Fields are `None` until the first successful
/// readout and after a failed one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AmbientSnapshot {
    /// °C
    pub temperature: Option<f64>,
    /// %
    pub humidity: Option<f64>,
    /// Chamber status derived from program state and status byte
    pub status: Option<ChamberStatus>,
    /// Running program number
    pub program: Option<u32>,
}

/// Notifications of the poller.
#[derive(Debug, Clone)]
pub enum EnvironmentEvent {
    /// Successful readout
    Reading(AmbientSnapshot),
    /// First failed readout of an outage
    Failed(Arc<DaqError>),
    /// First successful readout after an outage
    Recovered,
}

/// Periodic chamber readout.
pub struct EnvironmentPoller {
    resources: ResourceManager,
    resource: String,
    interval: Duration,
    backoff: Backoff,
    ambient: watch::Sender<AmbientSnapshot>,
    events: broadcast::Sender<EnvironmentEvent>,
    stop: AbortHandle,
}

impl EnvironmentPoller {
    /// Poller reading from the chamber `resource`.
    pub fn new(resources: ResourceManager, resource: &str, config: &EnvironmentConfig) -> Self {
        let (ambient, _) = watch::channel(AmbientSnapshot::default());
        let (events, _) = broadcast::channel(64);
        Self {
            resources,
            resource: resource.to_string(),
            interval: config.interval(),
            backoff: Backoff::Fixed(config.failure_timeout()),
            ambient,
            events,
            stop: AbortHandle::new(),
        }
    }

    /// Replace the back-off between attempts after a failure.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Receiver of the latest snapshot.
    pub fn ambient(&self) -> watch::Receiver<AmbientSnapshot> {
        self.ambient.subscribe()
    }

    /// Receive events of all following readouts.
    pub fn subscribe(&self) -> broadcast::Receiver<EnvironmentEvent> {
        self.events.subscribe()
    }

    /// Handle that stops the poller at its next sleep.
    pub fn stop_handle(&self) -> AbortHandle {
        self.stop.clone()
    }

    /// Acquire the chamber and read one snapshot.
    pub async fn read_once(&self) -> DaqResult<AmbientSnapshot> {
        let chamber = ClimateChamber::new(self.resources.acquire(&self.resource).await?);
        let temperature = chamber.temperature().await?;
        let humidity = chamber.humidity().await?;
        let run_state = chamber.run_state().await?;
        let status_byte = chamber.status_byte().await?;
        Ok(AmbientSnapshot {
            temperature: Some(temperature),
            humidity: Some(humidity),
            status: Some(ChamberStatus::derive(run_state, status_byte)),
            program: Some(run_state.program),
        })
    }

    /// Start polling on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Poll until stopped.
    pub async fn run(self) {
        info!(resource = %self.resource, interval = ?self.interval, "environment poller started");
        let mut failures: u32 = 0;
        loop {
            let pause = match self.read_once().await {
                Ok(snapshot) => {
                    if failures > 0 {
                        info!(resource = %self.resource, failures, "chamber readout recovered");
                        let _ = self.events.send(EnvironmentEvent::Recovered);
                    }
                    failures = 0;
                    debug!(?snapshot, "ambient snapshot");
                    self.ambient.send_replace(snapshot);
                    let _ = self.events.send(EnvironmentEvent::Reading(snapshot));
                    self.interval
                }
                Err(err) => {
                    self.ambient.send_replace(AmbientSnapshot::default());
                    if failures == 0 {
                        warn!(resource = %self.resource, error = %err, "chamber readout failed");
                        let _ = self.events.send(EnvironmentEvent::Failed(Arc::new(err)));
                    } else {
                        debug!(resource = %self.resource, error = %err, failures, "chamber still unreachable");
                    }
                    let pause = self.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    pause
                }
            };
            if self.stop.sleep(pause).await.is_err() {
                break;
            }
        }
        info!(resource = %self.resource, "environment poller stopped");
    }
}
