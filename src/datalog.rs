//! Persistence of forwarded telemetry.
//!
//! The daemon itself never writes records; the `hvac-logger` binary
//! subscribes to telemetry and appends it to a [`RecordSink`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::payload::TelemetryPayload;

pub const CSV_HEADER: &str = "timestamp_ms,point_id,value,version";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp_ms: u64,
    pub point_id: String,
    pub value: f64,
    pub version: u64,
}

impl Record {
    pub fn from_telemetry(payload: &TelemetryPayload) -> Vec<Record> {
        payload
            .readings
            .iter()
            .map(|reading| Record {
                timestamp_ms: payload.timestamp_ms,
                point_id: reading.point_id.clone(),
                value: reading.value,
                version: reading.version.unwrap_or_default(),
            })
            .collect()
    }

    fn csv_line(&self) -> String {
        format!(
            "{},{},{},{}\n",
            self.timestamp_ms, self.point_id, self.value, self.version
        )
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("record sink I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("record rejected: {0}")]
    Rejected(String),
}

pub trait RecordSink: Send {
    fn append(&mut self, record: &Record) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// CSV files named `<prefix>.<index>.csv` in one directory. A new file is
/// started once the current one reaches `rotate_size` bytes; each file
/// starts with a header row.
pub struct FileSink {
    dir: PathBuf,
    prefix: String,
    rotate_size: u64,
    index: u32,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, rotate_size: u64) -> Result<Self, SinkError> {
        let dir = dir.into();
        let prefix = prefix.into();
        fs::create_dir_all(&dir)?;
        let index = next_index(&dir, &prefix)?;
        Ok(Self {
            dir,
            prefix,
            rotate_size: rotate_size.max(1),
            index,
            written: 0,
            writer: None,
        })
    }

    pub fn current_path(&self) -> PathBuf {
        file_path(&self.dir, &self.prefix, self.index)
    }

    fn open(&mut self) -> Result<&mut BufWriter<File>, SinkError> {
        if self.writer.is_none() {
            let path = self.current_path();
            let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(CSV_HEADER.as_bytes())?;
            writer.write_all(b"\n")?;
            self.written = CSV_HEADER.len() as u64 + 1;
            info!(path = %path.display(), "opened data log file");
            self.writer = Some(writer);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| SinkError::Rejected("data log file unavailable".to_string()))
    }

    fn rotate(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.index += 1;
        self.written = 0;
        Ok(())
    }
}

impl RecordSink for FileSink {
    fn append(&mut self, record: &Record) -> Result<(), SinkError> {
        if record.point_id.contains(',') || record.point_id.contains('\n') {
            return Err(SinkError::Rejected(format!(
                "point id '{}' cannot be written as CSV",
                record.point_id
            )));
        }

        let line = record.csv_line();
        self.open()?.write_all(line.as_bytes())?;
        self.written += line.len() as u64;
        if self.written >= self.rotate_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = RecordSink::flush(self);
    }
}

fn file_path(dir: &Path, prefix: &str, index: u32) -> PathBuf {
    dir.join(format!("{prefix}.{index:05}.csv"))
}

/// First index after every existing `<prefix>.<n>.csv` in `dir`.
fn next_index(dir: &Path, prefix: &str) -> io::Result<u32> {
    let mut next = 0;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let index = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.strip_suffix(".csv"))
            .and_then(|digits| digits.parse::<u32>().ok());
        if let Some(index) = index {
            next = next.max(index + 1);
        }
    }
    Ok(next)
}
