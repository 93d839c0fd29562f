//! Per-sensor log files.
//!
//! Every enabled sensor gets one file per stage type: an `IV` file filled
//! during ramp-up and an `It` file filled during the long-term stage. A file
//! starts with `# key: value` metadata lines, followed by a tab separated
//! header and one row per scan cycle.
//!
//! ```text
//! # sensor_name: W05-S3
//! # sensor_channel: 1
//! # operator: Jane
//! # timestamp: 2024-03-01T09:30:00+00:00
//! # resistivity: 4.700000E5
//! # voltage: -6.000000E2
//! timestamp[s]	voltage[V]	current[A]	smu_current[A]	pt100[C]	temperature[C]	humidity[%]	status	program	hv
//! 10.002	-6.000000E2	2.127660E-8	8.400000E-7	22.10	20.00	30.00	ON	1	ON
//! ```
//!
//! Missing values are written as `nan` (numbers) or `N/A` (status, program).
//! Each row is flushed and synced before `write_row` returns.

use crate::error::{DaqError, DaqResult};
use crate::instrument::ChamberStatus;
use crate::sensor::{HvState, Sensor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Column names of the data section.
pub const COLUMNS: [&str; 10] = [
    "timestamp[s]",
    "voltage[V]",
    "current[A]",
    "smu_current[A]",
    "pt100[C]",
    "temperature[C]",
    "humidity[%]",
    "status",
    "program",
    "hv",
];

/// Numbered alternatives tried before giving up on a taken file name.
const MAX_NAME_SUFFIX: u32 = 1000;

/// Stage type a log file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Ramp-up, one row per voltage step
    Iv,
    /// Long-term stage, one row per interval
    It,
}

impl LogKind {
    /// File name prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            LogKind::Iv => "IV",
            LogKind::It => "It",
        }
    }
}

/// Metadata block at the top of a log file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMetadata {
    /// Display name
    pub sensor_name: String,
    /// Slot index
    pub sensor_channel: u8,
    /// Operator of the run
    pub operator: String,
    /// Start of the stage
    pub timestamp: DateTime<Utc>,
    /// Calibration resistance in Ohm
    pub resistivity: f64,
    /// Target voltage of the stage
    pub voltage: f64,
}

/// One data row.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    /// Seconds since the stage started
    pub timestamp: f64,
    /// SMU voltage in V
    pub voltage: f64,
    /// Sensor current in A, `None` when not measured
    pub current: Option<f64>,
    /// Total SMU current in A
    pub smu_current: f64,
    pub pt100: Option<f64>,
    /// Chamber temperature in °C
    pub temperature: Option<f64>,
    /// Chamber humidity in %
    pub humidity: Option<f64>,
    /// Chamber status
    pub status: Option<ChamberStatus>,
    /// Chamber program
    pub program: Option<u32>,
    /// Relay state
    pub hv: HvState,
}

/// Destination of the rows of one sensor and stage.
#[async_trait]
pub trait ResultSink: Send {
    async fn write_meta(
        &mut self,
        sensor: &Sensor,
        operator: &str,
        timestamp: DateTime<Utc>,
        voltage: f64,
    ) -> DaqResult<()>;

    async fn write_header(&mut self) -> DaqResult<()>;

    async fn write_row(&mut self, row: &LogRow) -> DaqResult<()>;
}

/// Deterministic file name: `<IV|It>-<index>-<sensor name>-<run start>.txt`.
///
/// The two digit sensor index keeps names of sensors that share a (sanitized)
/// name apart.
pub fn log_file_name(kind: LogKind, index: u8, sensor_name: &str, start: DateTime<Utc>) -> String {
    let name: String = sensor_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{}-{:02}-{}-{}.txt",
        kind.prefix(),
        index,
        name,
        start.format("%Y-%m-%dT%H-%M-%S")
    )
}

/// Create `path`, or the first free `<stem>-<n>.txt` next to it. An existing
/// log is never truncated.
fn create_unique(path: PathBuf) -> DaqResult<(PathBuf, File)> {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut candidate = path.clone();
    for attempt in 1..=MAX_NAME_SUFFIX {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                candidate = path.with_file_name(format!("{}-{}.txt", stem, attempt));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free log file name for {}", path.display()),
    )
    .into())
}

/// Tab separated log file writer.
pub struct LogWriter {
    path: PathBuf,
    file: Option<File>,
    writer: Option<csv::Writer<File>>,
}

impl LogWriter {
    /// Create a new log file of `sensor` in `directory`.
    ///
    /// If the file already exists (a second run started within the same
    /// second), a numbered suffix is added instead of overwriting it.
    pub fn create(
        directory: &Path,
        kind: LogKind,
        sensor: &Sensor,
        start: DateTime<Utc>,
    ) -> DaqResult<Self> {
        fs::create_dir_all(directory)?;
        let (path, file) = create_unique(directory.join(log_file_name(
            kind,
            sensor.index,
            &sensor.name,
            start,
        )))?;
        info!(path = %path.display(), sensor = sensor.index, "log file created");
        Ok(Self {
            path,
            file: Some(file),
            writer: None,
        })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> DaqResult<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            DaqError::Configuration(format!(
                "Metadata of {} must be written before the header",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl ResultSink for LogWriter {
    async fn write_meta(
        &mut self,
        sensor: &Sensor,
        operator: &str,
        timestamp: DateTime<Utc>,
        voltage: f64,
    ) -> DaqResult<()> {
        let lines = [
            ("sensor_name", sensor.name.clone()),
            ("sensor_channel", sensor.index.to_string()),
            ("operator", operator.to_string()),
            ("timestamp", timestamp.to_rfc3339()),
            ("resistivity", format!("{:.6E}", sensor.resistivity)),
            ("voltage", format!("{:.6E}", voltage)),
        ];
        let file = self.file()?;
        for (key, value) in lines {
            writeln!(file, "# {}: {}", key, value)?;
        }
        file.flush()?;
        Ok(())
    }

    async fn write_header(&mut self) -> DaqResult<()> {
        let file = self.file.take().ok_or_else(|| {
            DaqError::Configuration(format!("Header of {} already written", self.path.display()))
        })?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(file);
        writer.write_record(COLUMNS)?;
        writer.flush()?;
        self.writer = Some(writer);
        Ok(())
    }

    async fn write_row(&mut self, row: &LogRow) -> DaqResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            DaqError::Configuration(format!("Header of {} not written", self.path.display()))
        })?;
        writer.write_record(format_row(row))?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        debug!(path = %self.path.display(), timestamp = row.timestamp, "row written");
        Ok(())
    }
}

fn scientific(value: Option<f64>) -> String {
    value.map_or_else(|| "nan".to_string(), |v| format!("{:.6E}", v))
}

fn fixed2(value: Option<f64>) -> String {
    value.map_or_else(|| "nan".to_string(), |v| format!("{:.2}", v))
}

fn format_row(row: &LogRow) -> [String; 10] {
    [
        format!("{:.3}", row.timestamp),
        scientific(Some(row.voltage)),
        scientific(row.current),
        scientific(Some(row.smu_current)),
        fixed2(row.pt100),
        fixed2(row.temperature),
        fixed2(row.humidity),
        row.status.map_or_else(|| "N/A".to_string(), |s| s.to_string()),
        row.program.map_or_else(|| "N/A".to_string(), |p| p.to_string()),
        row.hv.to_string(),
    ]
}

// ============================================================================
// Reading logs back
// ============================================================================

/// Parsed content of a log file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFile {
    /// Header values
    pub metadata: LogMetadata,
    /// Data rows
    pub rows: Vec<LogRow>,
}

/// Parse a log file written by [`LogWriter`].
pub fn read_log(path: &Path) -> DaqResult<LogFile> {
    let content = fs::read_to_string(path)?;
    let source = path.display().to_string();

    let mut meta = std::collections::HashMap::new();
    let mut data_start = 0;
    for line in content.lines() {
        let Some(entry) = line.strip_prefix("# ") else {
            break;
        };
        if let Some((key, value)) = entry.split_once(": ") {
            meta.insert(key.to_string(), value.to_string());
        }
        data_start += line.len() + 1;
    }

    let field = |key: &str| -> DaqResult<String> {
        meta.get(key).cloned().ok_or_else(|| DaqError::Parse {
            command: format!("{} metadata", source),
            reply: format!("missing '{}'", key),
        })
    };
    let number = |key: &str| -> DaqResult<f64> { parse_number(&source, &field(key)?) };

    let timestamp = field("timestamp")?;
    let metadata = LogMetadata {
        sensor_name: field("sensor_name")?,
        sensor_channel: field("sensor_channel")?.parse().map_err(|_| DaqError::Parse {
            command: format!("{} sensor_channel", source),
            reply: meta.get("sensor_channel").cloned().unwrap_or_default(),
        })?,
        operator: field("operator")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|_| DaqError::Parse {
                command: format!("{} timestamp", source),
                reply: timestamp.clone(),
            })?
            .with_timezone(&Utc),
        resistivity: number("resistivity")?,
        voltage: number("voltage")?,
    };

    let data = content.get(data_start..).unwrap_or("");
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(data.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let column = |index: usize| record.get(index).unwrap_or("");
        rows.push(LogRow {
            timestamp: parse_number(&source, column(0))?,
            voltage: parse_number(&source, column(1))?,
            current: parse_optional(&source, column(2))?,
            smu_current: parse_number(&source, column(3))?,
            pt100: parse_optional(&source, column(4))?,
            temperature: parse_optional(&source, column(5))?,
            humidity: parse_optional(&source, column(6))?,
            status: ChamberStatus::parse(column(7)),
            program: column(8).parse().ok(),
            hv: HvState::parse(column(9)).ok_or_else(|| DaqError::Parse {
                command: format!("{} hv", source),
                reply: column(9).to_string(),
            })?,
        });
    }
    Ok(LogFile { metadata, rows })
}

fn parse_number(source: &str, value: &str) -> DaqResult<f64> {
    value.trim().parse().map_err(|_| DaqError::Parse {
        command: source.to_string(),
        reply: value.to_string(),
    })
}

fn parse_optional(source: &str, value: &str) -> DaqResult<Option<f64>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    parse_number(source, value).map(Some)
}
