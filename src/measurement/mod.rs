//! Measurement run: voltage ramps, scan cycles and the worker state machine.

pub mod cancel;
pub mod events;
pub mod ramp;
pub mod reading;
pub mod scan;
pub mod worker;

pub use cancel::{AbortHandle, CancellationPoint};
pub use events::{Stage, WorkerEvent};
pub use ramp::LinearRange;
pub use reading::{ChannelReading, Reading, RelayBoxVitals};
pub use scan::{channel_addresses, scan, RelayBoxLink, ScanContext};
pub use worker::{MeasurementWorker, RunOutcome};
