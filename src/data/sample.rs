//! Samples and the append-only sample log.
//!
//! A [`SampleLog`] is the hand-off between acquisition and reduction. Its
//! order is acquisition order and carries meaning (time and the sweep
//! trajectory), so the log only ever grows at the end.
//!
//! ## Raw table format
//!
//! The log is persisted as a whitespace-delimited numeric table, one row
//! per sample:
//!
//! ```text
//! # elapsed_s voltage_V current_A
//! 0 0 1.2e-10
//! 30.01 5 3.4e-9
//! ```
//!
//! Lines starting with `#` and blank lines are skipped. Columns beyond the
//! third (e.g. a measured-voltage column) are ignored on load.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// One completed measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the start of the ramp that produced this sample
    pub elapsed_seconds: f64,
    /// Target source voltage at the time of the reading
    pub voltage: f64,
    /// Measured current
    pub current: f64,
}

impl Sample {
    /// Sample from its three columns.
    pub fn new(elapsed_seconds: f64, voltage: f64, current: f64) -> Self {
        Self {
            elapsed_seconds,
            voltage,
            current,
        }
    }

    /// Voltage rounded to the nearest integer, as used for bin keys.
    pub fn rounded_voltage(&self) -> i64 {
        self.voltage.round() as i64
    }
}

/// Ordered sequence of samples from one or more ramps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleLog {
    samples: Vec<Sample>,
}

impl SampleLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample.
    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Samples in acquisition order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the log holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Iterate in acquisition order.
    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    /// Most recent sample.
    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Read a raw table, multiplying the current column by `current_scale`.
    pub fn load_table<P: AsRef<Path>>(path: P, current_scale: Option<f64>) -> AppResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let log = Self::parse_table(&contents, current_scale)?;
        debug!("Loaded {} samples from {}", log.len(), path.display());
        Ok(log)
    }

    /// Parse the raw table format from a string.
    pub fn parse_table(contents: &str, current_scale: Option<f64>) -> AppResult<Self> {
        let scale = current_scale.unwrap_or(1.0);
        let mut log = Self::new();

        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields = line
                .split_whitespace()
                .map(|field| {
                    field.parse::<f64>().map_err(|_| {
                        DaqError::invalid(format!(
                            "Line {}: '{}' is not a number",
                            index + 1,
                            field
                        ))
                    })
                })
                .collect::<AppResult<Vec<f64>>>()?;

            if fields.len() < 3 {
                return Err(DaqError::invalid(format!(
                    "Line {}: expected at least 3 columns, found {}",
                    index + 1,
                    fields.len()
                )));
            }
            log.push(Sample::new(fields[0], fields[1], fields[2] * scale));
        }
        Ok(log)
    }

    /// Write the raw table format.
    pub fn write_table<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "# elapsed_s voltage_V current_A")?;
        for s in &self.samples {
            writeln!(out, "{} {} {:e}", s.elapsed_seconds, s.voltage, s.current)?;
        }
        out.flush()?;
        debug!("Wrote {} samples to {}", self.len(), path.display());
        Ok(())
    }
}

impl From<Vec<Sample>> for SampleLog {
    fn from(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl FromIterator<Sample> for SampleLog {
    fn from_iter<I: IntoIterator<Item = Sample>>(iter: I) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a SampleLog {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}
