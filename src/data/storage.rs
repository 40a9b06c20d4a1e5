//! Bin persistence.
//!
//! Bins of one run live under `<bin_dir>/<run_name>/`, one CSV file per
//! (category, rounded voltage) key:
//!
//! | category   | file name     |
//! |------------|---------------|
//! | ascending  | `a_<v>v.csv`  |
//! | descending | `d_<v>v.csv`  |
//! | first run  | `f_<v>v.csv`  |
//! | last run   | `l_<v>v.csv`  |
//!
//! When two bins share a key, the first one encountered is written and the
//! rest are reported as [`BinWarning::DuplicateVoltage`].

use super::bins::{Bin, BinWarning, Direction, Segmentation};
use super::sample::Sample;
use crate::error::{AppResult, DaqError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Storage key category of a bin file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinCategory {
    /// Interior ascending run (`a_`)
    Ascending,
    /// Interior descending run (`d_`)
    Descending,
    /// First run of the log (`f_`)
    First,
    /// Last run of the log (`l_`)
    Last,
}

impl BinCategory {
    /// File-name prefix letter.
    pub fn letter(self) -> char {
        match self {
            Self::Ascending => 'a',
            Self::Descending => 'd',
            Self::First => 'f',
            Self::Last => 'l',
        }
    }

    /// Inverse of [`BinCategory::letter`].
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'a' => Some(Self::Ascending),
            'd' => Some(Self::Descending),
            'f' => Some(Self::First),
            'l' => Some(Self::Last),
            _ => None,
        }
    }

    /// Direction a bin of this category carries once loaded.
    pub fn direction(self) -> Direction {
        match self {
            Self::Ascending => Direction::Ascending,
            Self::Descending => Direction::Descending,
            Self::First | Self::Last => Direction::Boundary,
        }
    }

    /// File name for a bin at `voltage`, e.g. `a_215v.csv`.
    pub fn file_name(self, voltage: i64) -> String {
        format!("{}_{}v.csv", self.letter(), voltage)
    }
}

/// Parse a bin file name such as `d_-5v.csv` back into its key.
pub fn parse_file_name(name: &str) -> Option<(BinCategory, i64)> {
    let stem = name.strip_suffix(".csv").unwrap_or(name);
    let (letter, rest) = stem.split_once('_')?;
    let mut chars = letter.chars();
    let category = BinCategory::from_letter(chars.next()?)?;
    if chars.next().is_some() {
        return None;
    }
    let voltage = rest.strip_suffix('v')?.parse().ok()?;
    Some((category, voltage))
}

/// How a stored bin is transformed on load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadOptions {
    /// Multiply current by this factor
    pub current_scale: Option<f64>,
    /// Shift time so the bin starts at t = 0
    pub normalize_time: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            current_scale: None,
            normalize_time: true,
        }
    }
}

/// Outcome of [`BinStore::save`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreReport {
    /// Files written, in save order
    pub written: Vec<PathBuf>,
    /// Bins skipped because their key was already taken
    pub warnings: Vec<BinWarning>,
}

/// Directory of bins for one run.
#[derive(Debug, Clone)]
pub struct BinStore {
    dir: PathBuf,
}

impl BinStore {
    /// Store rooted at `<bin_dir>/<run_name>/`.
    pub fn new<P: AsRef<Path>>(bin_dir: P, run_name: &str) -> Self {
        Self {
            dir: bin_dir.as_ref().join(run_name),
        }
    }

    /// Directory holding this run's bin files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for one key; the file need not exist.
    pub fn path_for(&self, category: BinCategory, voltage: i64) -> PathBuf {
        self.dir.join(category.file_name(voltage))
    }

    /// Persist the interior bins of `segmentation`, and the boundary bins if
    /// `include_boundary` is set. Duplicate keys are first-wins.
    pub fn save(&self, segmentation: &Segmentation, include_boundary: bool) -> AppResult<StoreReport> {
        std::fs::create_dir_all(&self.dir)?;

        let mut report = StoreReport::default();
        let mut seen: HashSet<(BinCategory, i64)> = HashSet::new();

        for bin in &segmentation.interior {
            let category = match bin.direction {
                Direction::Ascending => BinCategory::Ascending,
                Direction::Descending => BinCategory::Descending,
                Direction::Boundary => continue,
            };
            if !seen.insert((category, bin.voltage)) {
                let warning = BinWarning::DuplicateVoltage {
                    voltage: bin.voltage,
                    direction: bin.direction,
                };
                warn!("{}", warning);
                report.warnings.push(warning);
                continue;
            }
            report.written.push(self.write_bin(category, bin)?);
        }

        if include_boundary {
            if let Some(bin) = &segmentation.first {
                report.written.push(self.write_bin(BinCategory::First, bin)?);
            }
            if let Some(bin) = &segmentation.last {
                report.written.push(self.write_bin(BinCategory::Last, bin)?);
            }
        }

        info!(
            "Stored {} bins in {} ({} warnings)",
            report.written.len(),
            self.dir.display(),
            report.warnings.len()
        );
        Ok(report)
    }

    fn write_bin(&self, category: BinCategory, bin: &Bin) -> AppResult<PathBuf> {
        let path = self.path_for(category, bin.voltage);
        let mut writer = csv::Writer::from_path(&path)?;
        for sample in &bin.samples {
            writer.serialize(sample)?;
        }
        writer.flush()?;
        debug!("Wrote {} samples to {}", bin.len(), path.display());
        Ok(path)
    }

    /// Load one bin. A missing file is `Ok(None)`, not an error.
    pub fn load(
        &self,
        category: BinCategory,
        voltage: i64,
        options: &LoadOptions,
    ) -> AppResult<Option<Bin>> {
        let path = self.path_for(category, voltage);
        if !path.exists() {
            return Ok(None);
        }
        let samples = read_samples(&path)?;
        Ok(Some(finish(
            Bin::new(voltage, category.direction(), samples),
            options,
        )))
    }

    /// Voltages stored for `category`, ascending.
    pub fn voltages(&self, category: BinCategory) -> AppResult<Vec<i64>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut voltages = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some((found, voltage)) = name.to_str().and_then(parse_file_name) {
                if found == category {
                    voltages.push(voltage);
                }
            }
        }
        voltages.sort_unstable();
        Ok(voltages)
    }
}

/// Load a bin file by path; the key is taken from its file name.
pub fn read_bin_file<P: AsRef<Path>>(path: P, options: &LoadOptions) -> AppResult<Bin> {
    let path = path.as_ref();
    let (category, voltage) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_file_name)
        .ok_or_else(|| {
            DaqError::invalid(format!(
                "'{}' is not a bin file name (expected e.g. a_215v.csv)",
                path.display()
            ))
        })?;
    let samples = read_samples(path)?;
    Ok(finish(
        Bin::new(voltage, category.direction(), samples),
        options,
    ))
}

fn read_samples(path: &Path) -> AppResult<Vec<Sample>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut samples = Vec::new();
    for record in reader.deserialize() {
        samples.push(record?);
    }
    Ok(samples)
}

fn finish(mut bin: Bin, options: &LoadOptions) -> Bin {
    if let Some(scale) = options.current_scale {
        bin.scale_current(scale);
    }
    if options.normalize_time {
        bin.normalize_time();
    }
    bin
}
