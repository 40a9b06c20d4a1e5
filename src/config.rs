//! Configuration system using Figment
//!
//! Strongly-typed settings for the instrument link, the IV ramp, result
//! storage and offline analysis. Configuration is loaded from (in order of
//! precedence, highest first):
//!
//! 1. Environment variables prefixed with `IVDAQ_`
//! 2. A TOML configuration file (default: `config/iv_daq.toml`)
//!
//! Every field has a default, so a missing file still yields a usable
//! configuration.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! IVDAQ_APPLICATION__LOG_LEVEL=debug
//! IVDAQ_INSTRUMENT__PORT=/dev/ttyUSB0
//! IVDAQ_RAMP__STOP_VOLTAGE=200
//! ```
//!
//! # Example
//!
//! ```no_run
//! use iv_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Sweeping to {} V", settings.ramp.stop_voltage);
//! # Ok::<(), iv_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::analysis::ExponentialOptions;
use crate::data::{LoadOptions, SegmentOptions};
use crate::ramp::RampConfig;
use chrono::{DateTime, Local};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/iv_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link to the source-measure unit
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// IV ramp parameters
    #[serde(default)]
    pub ramp: RampSettings,
    /// Where raw logs and bins are written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Bin segmentation and fitting options
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Serial instrument configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM13")
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Terminator appended to every command
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
    /// Character that ends every response
    #[serde(default = "default_response_delimiter")]
    pub response_delimiter: char,
    /// Keep sense facets when an unmodeled command is written
    #[serde(default)]
    pub preserve_sense_on_raw_write: bool,
}

/// IV ramp parameters, in volts, seconds and amps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampSettings {
    /// First target voltage
    #[serde(default)]
    pub start_voltage: f64,
    /// Last target voltage of the up-ramp
    #[serde(default = "default_stop_voltage")]
    pub stop_voltage: f64,
    /// Voltage increment; its sign must point from start to stop
    #[serde(default = "default_step_voltage")]
    pub step_voltage: f64,
    /// Settling wait before each measurement
    #[serde(default = "default_dwell_secs")]
    pub dwell_secs: f64,
    /// Current compliance limit; the ramp stops at 95% of it
    #[serde(default = "default_max_current")]
    pub max_current: f64,
    /// Fixed current range for the first point; `None` leaves it untouched
    #[serde(default)]
    pub initial_current_range: Option<f64>,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for raw sample logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Root directory for persisted bins
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,
    /// Explicit run name; derived from the start time when absent
    #[serde(default)]
    pub run_name: Option<String>,
}

/// Offline analysis configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Multiplier applied to the current column on load (e.g. 1e6 for µA)
    #[serde(default)]
    pub current_scale: Option<f64>,
    /// Drop the first (settling) sample of every run
    #[serde(default)]
    pub discard_first_sample: bool,
    /// Shift bin time so each bin starts at t = 0 when loaded
    #[serde(default = "default_true")]
    pub normalize_time: bool,
    /// Skip the equal-spacing check in the three-point exponential estimate
    #[serde(default = "default_true")]
    pub spacing_override: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_line_terminator() -> String {
    "\r\n".to_string()
}

fn default_response_delimiter() -> char {
    '\n'
}

fn default_stop_voltage() -> f64 {
    50.0
}

fn default_step_voltage() -> f64 {
    5.0
}

fn default_dwell_secs() -> f64 {
    30.0
}

fn default_max_current() -> f64 {
    1.0e-6
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("bins")
}

fn default_true() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            line_terminator: default_line_terminator(),
            response_delimiter: default_response_delimiter(),
            preserve_sense_on_raw_write: false,
        }
    }
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            start_voltage: 0.0,
            stop_voltage: default_stop_voltage(),
            step_voltage: default_step_voltage(),
            dwell_secs: default_dwell_secs(),
            max_current: default_max_current(),
            initial_current_range: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bin_dir: default_bin_dir(),
            run_name: None,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            current_scale: None,
            discard_first_sample: false,
            normalize_time: true,
            spacing_override: true,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: defaults are used and environment
    /// variables still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IVDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(contents: &str) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(contents))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("Failed to serialize settings: {}", e)))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Baud rate and timeout are non-zero
    /// - Ramp step is non-zero and points toward the stop voltage
    /// - Dwell is finite and non-negative, max current is positive
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.instrument.baud_rate == 0 {
            return Err(DaqError::Configuration(
                "instrument.baud_rate must be > 0".to_string(),
            ));
        }
        if self.instrument.timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "instrument.timeout_ms must be > 0".to_string(),
            ));
        }

        let ramp = &self.ramp;
        let span = ramp.stop_voltage - ramp.start_voltage;
        if ramp.step_voltage == 0.0 || (span != 0.0 && span.signum() != ramp.step_voltage.signum())
        {
            return Err(DaqError::Configuration(format!(
                "ramp.step_voltage {} does not advance from {} V to {} V",
                ramp.step_voltage, ramp.start_voltage, ramp.stop_voltage
            )));
        }
        if !ramp.dwell_secs.is_finite() || ramp.dwell_secs < 0.0 {
            return Err(DaqError::Configuration(format!(
                "ramp.dwell_secs must be a non-negative number, got {}",
                ramp.dwell_secs
            )));
        }
        if !(ramp.max_current > 0.0) {
            return Err(DaqError::Configuration(format!(
                "ramp.max_current must be > 0, got {}",
                ramp.max_current
            )));
        }

        Ok(())
    }

    /// Build the ramp parameters for the controller.
    pub fn ramp_config(&self) -> RampConfig {
        RampConfig {
            start_voltage: self.ramp.start_voltage,
            stop_voltage: self.ramp.stop_voltage,
            step_voltage: self.ramp.step_voltage,
            dwell: Duration::from_secs_f64(self.ramp.dwell_secs),
            max_current: self.ramp.max_current,
            initial_current_range: self.ramp.initial_current_range,
            stop_on_compliance: true,
        }
    }

    /// Segmenter options from `[analysis]`.
    pub fn segment_options(&self) -> SegmentOptions {
        SegmentOptions {
            discard_first_sample: self.analysis.discard_first_sample,
        }
    }

    /// Bin load options from `[analysis]`.
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            current_scale: self.analysis.current_scale,
            normalize_time: self.analysis.normalize_time,
        }
    }

    /// Exponential fit options from `[analysis]`.
    pub fn exponential_options(&self) -> ExponentialOptions {
        ExponentialOptions {
            spacing_override: self.analysis.spacing_override,
            ..ExponentialOptions::default()
        }
    }

    /// Resolve the run name, deriving one from `started` when none is set.
    ///
    /// The timestamp is taken once by the caller and threaded through, so
    /// every file of one run shares the same name.
    pub fn run_name(&self, started: DateTime<Local>) -> String {
        self.storage
            .run_name
            .clone()
            .unwrap_or_else(|| started.format("IVdata_%Y-%m-%d_%H-%M-%S").to_string())
    }
}
