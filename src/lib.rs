//! Core library for the it_daq application.
//!
//! It-test measurement of up to ten silicon sensors biased by a Keithley 2410
//! source-measure unit. Sensor currents are read through a Keithley 2700
//! multimeter scanning the voltage drop over per-sensor calibration
//! resistors; an optional relay box switches the high voltage per sensor and
//! reports PT100 temperatures; a climate chamber is polled for ambient
//! conditions.
//!
//! The measurement itself is run by [`measurement::MeasurementWorker`], which
//! is used by the command line front end in `main.rs` and by the integration
//! tests against the [`instrument::sim`] simulator.

pub mod adapters;
pub mod config;
pub mod environment;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod limits;
pub mod measurement;
pub mod resource;
pub mod sensor;
pub mod writer;
