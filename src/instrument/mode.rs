//! Instrument mode state and its transitions.
//!
//! [`InstrumentMode`] is a plain `Copy` value. Every session operation
//! computes the next mode through one of the transition functions below
//! instead of flipping flags in place, so the invalidation rule for opaque
//! commands lives in exactly one function ([`InstrumentMode::invalidated`]).
//!
//! Function names arrive from users and from the instrument in several
//! spellings (`VOLT`, `volt`, `v`, `"VOLT:DC"`). They are normalized once at
//! the boundary into [`SourceFunction`] / [`SenseFunction`]; anything
//! unrecognized is rejected with `InvalidArgument`.

use crate::error::{AppResult, DaqError};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Quantity the instrument can source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFunction {
    /// Drive a voltage (`VOLT`)
    Voltage,
    /// Drive a current (`CURR`)
    Current,
}

/// Quantity the instrument can sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SenseFunction {
    /// `VOLT`
    Voltage,
    /// `CURR`
    Current,
    /// `RES`
    Resistance,
}

impl SourceFunction {
    /// SCPI mnemonic used in `:SOUR:` commands.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Voltage => "VOLT",
            Self::Current => "CURR",
        }
    }
}

impl SenseFunction {
    /// SCPI mnemonic used in `:SENS:` commands.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Voltage => "VOLT",
            Self::Current => "CURR",
            Self::Resistance => "RES",
        }
    }

    /// All sense functions, in mnemonic order.
    pub const ALL: [SenseFunction; 3] = [Self::Voltage, Self::Current, Self::Resistance];
}

impl fmt::Display for SourceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl fmt::Display for SenseFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Strip quotes, whitespace and a `:DC`/`:AC` suffix, then upper-case.
fn normalize_alias(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    let head = trimmed.split(':').next().unwrap_or(trimmed);
    head.to_ascii_uppercase()
}

impl FromStr for SourceFunction {
    type Err = DaqError;

    fn from_str(s: &str) -> AppResult<Self> {
        match normalize_alias(s).as_str() {
            "V" | "VOLT" | "VOLTAGE" => Ok(Self::Voltage),
            "C" | "I" | "CURR" | "CURRENT" => Ok(Self::Current),
            _ => Err(DaqError::invalid(format!("Invalid source mode '{}'", s))),
        }
    }
}

impl FromStr for SenseFunction {
    type Err = DaqError;

    fn from_str(s: &str) -> AppResult<Self> {
        match normalize_alias(s).as_str() {
            "V" | "VOLT" | "VOLTAGE" => Ok(Self::Voltage),
            "C" | "I" | "CURR" | "CURRENT" => Ok(Self::Current),
            "R" | "RES" | "RESISTANCE" => Ok(Self::Resistance),
            _ => Err(DaqError::invalid(format!("Invalid sense setting '{}'", s))),
        }
    }
}

/// Parse a quoted, comma-delimited function list such as
/// `"VOLT:DC","CURR:DC"` into a set. `""` yields the empty set.
pub fn parse_sense_list(response: &str) -> AppResult<BTreeSet<SenseFunction>> {
    let trimmed = response.trim();
    let unquoted = trimmed.trim_matches('"').trim();
    if unquoted.is_empty() {
        return Ok(BTreeSet::new());
    }

    trimmed
        .split(',')
        .map(|item| {
            item.parse::<SenseFunction>().map_err(|_| {
                DaqError::protocol(format!(
                    "Unrecognized sense function '{}' in '{}'",
                    item.trim(),
                    trimmed
                ))
            })
        })
        .collect()
}

/// What the session assumes about the instrument's configuration.
///
/// At most one of `sourcing_voltage` / `sourcing_current` is ever true; the
/// transitions below are the only way to build a mode with either set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstrumentMode {
    /// Source function is `VOLT`
    pub sourcing_voltage: bool,
    /// Source function is `CURR`
    pub sourcing_current: bool,
    /// Voltage sensing enabled
    pub sensing_voltage: bool,
    /// Current sensing enabled
    pub sensing_current: bool,
    /// Resistance sensing enabled
    pub sensing_resistance: bool,
    /// Remote (4-wire) sensing engaged
    pub remote_control_engaged: bool,
    /// Output relay closed
    pub output_energized: bool,
}

impl InstrumentMode {
    /// Mode after a successful `*RST`: all sensing on, everything else off.
    pub fn after_reset() -> Self {
        Self {
            sensing_voltage: true,
            sensing_current: true,
            sensing_resistance: true,
            ..Self::default()
        }
    }

    /// Mode after an opaque command.
    ///
    /// Source, output and remote facets always drop to false. Sense facets
    /// survive only when `preserve_sense` is set.
    pub fn invalidated(self, preserve_sense: bool) -> Self {
        if preserve_sense {
            Self {
                sensing_voltage: self.sensing_voltage,
                sensing_current: self.sensing_current,
                sensing_resistance: self.sensing_resistance,
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }

    /// Switch the sourcing function; the other one is forced off.
    pub fn with_source(self, function: SourceFunction) -> Self {
        Self {
            sourcing_voltage: function == SourceFunction::Voltage,
            sourcing_current: function == SourceFunction::Current,
            ..self
        }
    }

    /// Set the remote-sense facet.
    pub fn with_remote(self, engaged: bool) -> Self {
        Self {
            remote_control_engaged: engaged,
            ..self
        }
    }

    /// Set the output facet.
    pub fn with_output(self, energized: bool) -> Self {
        Self {
            output_energized: energized,
            ..self
        }
    }

    /// Enable or disable one sense function.
    pub fn with_sense(self, function: SenseFunction, enabled: bool) -> Self {
        let mut next = self;
        match function {
            SenseFunction::Voltage => next.sensing_voltage = enabled,
            SenseFunction::Current => next.sensing_current = enabled,
            SenseFunction::Resistance => next.sensing_resistance = enabled,
        }
        next
    }

    /// Enable or disable every sense function.
    pub fn with_all_sense(self, enabled: bool) -> Self {
        Self {
            sensing_voltage: enabled,
            sensing_current: enabled,
            sensing_resistance: enabled,
            ..self
        }
    }

    /// Whether the instrument is assumed to be sourcing `function`.
    pub fn is_sourcing(&self, function: SourceFunction) -> bool {
        match function {
            SourceFunction::Voltage => self.sourcing_voltage,
            SourceFunction::Current => self.sourcing_current,
        }
    }

    /// Whether `function` is assumed to be sensed.
    pub fn is_sensing(&self, function: SenseFunction) -> bool {
        match function {
            SenseFunction::Voltage => self.sensing_voltage,
            SenseFunction::Current => self.sensing_current,
            SenseFunction::Resistance => self.sensing_resistance,
        }
    }
}
