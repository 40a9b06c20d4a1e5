//! Bin segmentation.
//!
//! A bin is a maximal contiguous run of samples sharing one rounded
//! voltage. Each run is tagged with its direction relative to the run
//! before it; the first and last runs of the log are `Boundary` because they
//! may be cut short by the start or end of the log.
//!
//! Runs left with fewer than two samples (after the optional settling
//! discard) cannot support a fit and are dropped with a [`BinWarning`].
//! Warnings never abort segmentation.

use super::sample::{Sample, SampleLog};
use std::fmt;
use tracing::warn;

/// Direction of a run relative to the run before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Voltage rose into this run
    Ascending,
    /// Voltage fell into this run
    Descending,
    /// First or last run of a log; direction unknown
    Boundary,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ascending => "ascending",
            Self::Descending => "descending",
            Self::Boundary => "boundary",
        };
        f.write_str(name)
    }
}

/// A run of same-voltage samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    /// Rounded voltage shared by every sample
    pub voltage: i64,
    /// Direction of the run within its log
    pub direction: Direction,
    /// Samples in acquisition order
    pub samples: Vec<Sample>,
}

impl Bin {
    /// Bin from an already-collected run.
    pub fn new(voltage: i64, direction: Direction, samples: Vec<Sample>) -> Self {
        Self {
            voltage,
            direction,
            samples,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the bin holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Elapsed-time column.
    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.elapsed_seconds).collect()
    }

    /// Current column.
    pub fn currents(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.current).collect()
    }

    /// Shift time so the first sample sits at t = 0.
    pub fn normalize_time(&mut self) {
        if let Some(t0) = self.samples.first().map(|s| s.elapsed_seconds) {
            for s in &mut self.samples {
                s.elapsed_seconds -= t0;
            }
        }
    }

    /// Multiply every current by `factor`.
    pub fn scale_current(&mut self, factor: f64) {
        for s in &mut self.samples {
            s.current *= factor;
        }
    }

    /// Mean current, or `None` for an empty bin.
    pub fn mean_current(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().map(|s| s.current).sum::<f64>() / self.samples.len() as f64)
        }
    }
}

/// Non-fatal condition met while segmenting or storing bins.
#[derive(Debug, Clone, PartialEq)]
pub enum BinWarning {
    /// A run too short to keep
    ShortRun {
        /// Rounded voltage of the run
        voltage: i64,
        /// Direction the run would have had
        direction: Direction,
        /// Samples left after any settling discard
        len: usize,
    },
    /// A second bin with an already-stored (direction, voltage) key
    DuplicateVoltage {
        /// Rounded voltage of the rejected bin
        voltage: i64,
        /// Direction of the rejected bin
        direction: Direction,
    },
}

impl fmt::Display for BinWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortRun {
                voltage,
                direction,
                len,
            } => write!(
                f,
                "{} run at {} V has {} sample(s); runs shorter than 2 are ignored",
                direction, voltage, len
            ),
            Self::DuplicateVoltage { voltage, direction } => write!(
                f,
                "more than one {} bin at {} V; all but the first are ignored",
                direction, voltage
            ),
        }
    }
}

/// Segmenter options.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegmentOptions {
    /// Drop the first (settling) sample of every run
    pub discard_first_sample: bool,
}

/// Result of segmenting one log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segmentation {
    /// First run of the log, if it survived
    pub first: Option<Bin>,
    /// Interior runs in log order
    pub interior: Vec<Bin>,
    /// Last run of the log, if it survived and differs from the first
    pub last: Option<Bin>,
    /// Runs dropped while segmenting
    pub warnings: Vec<BinWarning>,
}

impl Segmentation {
    /// Interior runs reached by a rising voltage.
    pub fn ascending(&self) -> impl Iterator<Item = &Bin> {
        self.interior
            .iter()
            .filter(|b| b.direction == Direction::Ascending)
    }

    /// Interior runs reached by a falling voltage.
    pub fn descending(&self) -> impl Iterator<Item = &Bin> {
        self.interior
            .iter()
            .filter(|b| b.direction == Direction::Descending)
    }

    /// Every retained bin in log order.
    pub fn bins(&self) -> impl Iterator<Item = &Bin> {
        self.first
            .iter()
            .chain(self.interior.iter())
            .chain(self.last.iter())
    }
}

/// Split `log` into maximal same-voltage runs.
pub fn segment(log: &SampleLog, options: &SegmentOptions) -> Segmentation {
    let mut runs: Vec<(i64, Vec<Sample>)> = Vec::new();
    for sample in log {
        let voltage = sample.rounded_voltage();
        match runs.last_mut() {
            Some((v, samples)) if *v == voltage => samples.push(*sample),
            _ => runs.push((voltage, vec![*sample])),
        }
    }

    let mut result = Segmentation::default();
    let last_index = runs.len().saturating_sub(1);
    let mut previous_voltage = None;

    for (index, (voltage, mut samples)) in runs.into_iter().enumerate() {
        let direction = match previous_voltage {
            _ if index == 0 || index == last_index => Direction::Boundary,
            Some(prev) if voltage > prev => Direction::Ascending,
            _ => Direction::Descending,
        };
        previous_voltage = Some(voltage);

        if options.discard_first_sample && !samples.is_empty() {
            samples.remove(0);
        }
        if samples.len() < 2 {
            let warning = BinWarning::ShortRun {
                voltage,
                direction,
                len: samples.len(),
            };
            warn!("{}", warning);
            result.warnings.push(warning);
            continue;
        }

        let bin = Bin::new(voltage, direction, samples);
        if index == 0 {
            result.first = Some(bin);
        } else if index == last_index {
            result.last = Some(bin);
        } else {
            result.interior.push(bin);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_from_voltages(voltages: &[f64]) -> SampleLog {
        voltages
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(i as f64, *v, 1e-9 * i as f64))
            .collect()
    }

    fn lengths(seg: &Segmentation) -> Vec<usize> {
        seg.bins().map(|b| b.len()).collect()
    }

    #[test]
    fn test_up_down_runs() {
        let log = log_from_voltages(&[5., 5., 5., 10., 10., 10., 10., 5., 5., 5.]);
        let seg = segment(&log, &SegmentOptions::default());

        assert_eq!(lengths(&seg), vec![3, 4, 3]);
        let directions: Vec<_> = seg.bins().map(|b| b.direction).collect();
        assert_eq!(
            directions,
            vec![Direction::Boundary, Direction::Ascending, Direction::Boundary]
        );
        assert!(seg.warnings.is_empty());
    }

    #[test]
    fn test_descending_interior() {
        let log = log_from_voltages(&[0., 0., 10., 10., 5., 5., 0., 0.]);
        let seg = segment(&log, &SegmentOptions::default());

        assert_eq!(seg.ascending().map(|b| b.voltage).collect::<Vec<_>>(), vec![10]);
        assert_eq!(seg.descending().map(|b| b.voltage).collect::<Vec<_>>(), vec![5]);
        assert_eq!(seg.first.as_ref().map(|b| b.voltage), Some(0));
        assert_eq!(seg.last.as_ref().map(|b| b.voltage), Some(0));
    }

    #[test]
    fn test_rounding_merges_jitter() {
        let log = log_from_voltages(&[4.9, 5.2, 5.0, 9.8, 10.1]);
        let seg = segment(&log, &SegmentOptions::default());
        assert_eq!(lengths(&seg), vec![3, 2]);
        assert_eq!(seg.first.as_ref().map(|b| b.voltage), Some(5));
    }

    #[test]
    fn test_short_runs_warn_and_continue() {
        let log = log_from_voltages(&[0., 0., 5., 10., 10., 15., 15.]);
        let seg = segment(&log, &SegmentOptions::default());

        assert_eq!(lengths(&seg), vec![2, 2, 2]);
        assert_eq!(
            seg.warnings,
            vec![BinWarning::ShortRun {
                voltage: 5,
                direction: Direction::Ascending,
                len: 1
            }]
        );
    }

    #[test]
    fn test_discard_first_sample_applies_before_length_rule() {
        let log = log_from_voltages(&[5., 5., 5., 10., 10., 10., 10., 5., 5.]);
        let seg = segment(
            &log,
            &SegmentOptions {
                discard_first_sample: true,
            },
        );

        assert_eq!(lengths(&seg), vec![2, 3]);
        assert!(seg.last.is_none());
        assert_eq!(seg.warnings.len(), 1);
        let interior = &seg.interior[0];
        assert_eq!(interior.samples[0].elapsed_seconds, 4.0);
    }

    #[test]
    fn test_single_run_and_empty_log() {
        let seg = segment(&log_from_voltages(&[3., 3., 3.]), &SegmentOptions::default());
        assert_eq!(seg.first.as_ref().map(|b| b.len()), Some(3));
        assert!(seg.last.is_none() && seg.interior.is_empty());

        let seg = segment(&SampleLog::new(), &SegmentOptions::default());
        assert_eq!(seg, Segmentation::default());
    }

    #[test]
    fn test_bin_helpers() {
        let mut bin = Bin::new(
            5,
            Direction::Ascending,
            vec![Sample::new(10.0, 5.0, 1.0), Sample::new(12.0, 5.0, 3.0)],
        );
        bin.normalize_time();
        bin.scale_current(2.0);
        assert_eq!(bin.times(), vec![0.0, 2.0]);
        assert_eq!(bin.currents(), vec![2.0, 6.0]);
        assert_eq!(bin.mean_current(), Some(4.0));
    }
}
