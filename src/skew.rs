//! Clock skew between the collecting host and the hypervisors.

use chrono::{DateTime, Duration, FixedOffset, ParseResult, Timelike};
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the skew report written into the scratch directory.
pub const TIME_DIFF_FILE: &str = "time_diff.txt";

/// Direction of a host's clock relative to the local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkewSign {
    /// Host clock is ahead of the local clock.
    Ahead,
    /// Host clock is behind or equal to the local clock.
    Behind,
}

impl fmt::Display for SkewSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkewSign::Ahead => write!(f, "+"),
            SkewSign::Behind => write!(f, "-"),
        }
    }
}

/// Measured clock difference for one host.
#[derive(Debug, Clone, PartialEq)]
pub struct SkewRecord {
    pub host_label: String,
    pub host_time: DateTime<FixedOffset>,
    pub local_time: DateTime<FixedOffset>,
    /// Magnitude of the difference.
    pub delta: Duration,
    pub sign: SkewSign,
}

impl SkewRecord {
    /// Compare a host timestamp with the local timestamp.
    pub fn measure(
        host_label: impl Into<String>,
        host_time: DateTime<FixedOffset>,
        local_time: DateTime<FixedOffset>,
    ) -> Self {
        let (delta, sign) = if host_time > local_time {
            (host_time - local_time, SkewSign::Ahead)
        } else {
            (local_time - host_time, SkewSign::Behind)
        };
        Self {
            host_label: host_label.into(),
            host_time,
            local_time,
            delta,
            sign,
        }
    }

    /// Signed difference in `[+-][D day[s], ]H:MM:SS[.ffffff]` form.
    pub fn delta_string(&self) -> String {
        format!("{}{}", self.sign, format_duration(self.delta))
    }

    /// Report line for this record.
    pub fn to_line(&self) -> String {
        format_row(
            &self.host_label,
            &format_timestamp(&self.host_time),
            &format_timestamp(&self.local_time),
            &self.delta_string(),
        )
    }
}

/// Parse the output of `date --iso-8601=seconds`.
pub fn parse_host_time(output: &str) -> ParseResult<DateTime<FixedOffset>> {
    let trimmed = output.trim();
    DateTime::parse_from_rfc3339(trimmed)
        .or_else(|_| DateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%z"))
}

fn format_row(node: &str, node_time: &str, engine_time: &str, drift: &str) -> String {
    format!("{:<17} : {:<33} : {:<33} : {:<35}", node, node_time, engine_time, drift)
}

/// Header line of the skew report.
pub fn header() -> String {
    format_row(
        "Node",
        "Node Time",
        "Engine Time",
        "Clock Drift Between Engine and Node",
    )
}

fn format_timestamp(time: &DateTime<FixedOffset>) -> String {
    if time.nanosecond() / 1_000 == 0 {
        time.format("%Y-%m-%d %H:%M:%S%:z").to_string()
    } else {
        time.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string()
    }
}

/// Render a non-negative duration as `[D day[s], ]H:MM:SS[.ffffff]`.
pub fn format_duration(delta: Duration) -> String {
    let micros = delta.num_microseconds().unwrap_or(i64::MAX).max(0);
    let total_secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    let days = total_secs / 86_400;
    let rem = total_secs % 86_400;

    let mut out = String::new();
    if days > 0 {
        let unit = if days == 1 { "day" } else { "days" };
        out.push_str(&format!("{} {}, ", days, unit));
    }
    out.push_str(&format!("{}:{:02}:{:02}", rem / 3_600, (rem % 3_600) / 60, rem % 60));
    if frac > 0 {
        out.push_str(&format!(".{:06}", frac));
    }
    out
}

/// Append-only log shared by all collection jobs.
#[derive(Debug, Default)]
pub struct SkewLog {
    records: Mutex<Vec<SkewRecord>>,
}

impl SkewLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: SkewRecord) {
        self.records.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Snapshot of the records appended so far.
    pub fn records(&self) -> Vec<SkewRecord> {
        self.records.lock().clone()
    }

    /// Write the report into `dir`, returning the file path.
    pub fn write_report(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(TIME_DIFF_FILE);
        let mut file = std::fs::File::create(&path).map_err(|e| Error::io(&path, e))?;
        let mut content = header();
        content.push('\n');
        for record in self.records.lock().iter() {
            content.push_str(&record.to_line());
            content.push('\n');
        }
        file.write_all(content.as_bytes())
            .map_err(|e| Error::io(&path, e))?;
        Ok(path)
    }
}
