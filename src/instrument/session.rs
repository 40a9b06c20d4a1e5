//! SCPI session for a source-measure unit.
//!
//! [`InstrumentSession`] owns the transport and the assumed
//! [`InstrumentMode`]. It is the only path through which commands reach the
//! instrument, and it refuses to send commands the assumed mode cannot
//! support (e.g. a voltage level while sourcing current).
//!
//! ## Mode tracking
//!
//! - Typed operations (`reset`, `set_source_mode`, `set_output`, the sense
//!   toggles, ...) move the mode through the transitions in
//!   [`super::mode`], and only after the write succeeded.
//! - Protection, range, level, format and measurement calls leave the mode
//!   untouched.
//! - [`InstrumentSession::write_raw`] is opaque: afterwards source, output
//!   and remote facets are false, and sense facets are cleared too unless
//!   the session was built with `preserve_sense_on_raw_write`.
//!
//! ## SCPI surface
//!
//! ```text
//! *RST
//! :SYST:RSEN ON|OFF
//! :SOUR:FUNC VOLT|CURR            :SOUR:FUNC:MODE?
//! :SOUR:VOLT|CURR:RANG[?] <v>     :SOUR:VOLT|CURR:LEV[?] <v>
//! :OUTP ON|OFF
//! :SENS:FUNC:ON|OFF:ALL           :SENS:FUNC:ON|OFF '<NAME>'
//! :SENS:FUNC:ON?                  :SENS:FUNC:OFF?
//! :SENS:CURR|VOLT:RANG[?] <v>     :SENS:CURR|VOLT:RANG:AUTO ON
//! :SENS:CURR|VOLT:PROT[?] <v>
//! :FORM:ELEM[?] <list>
//! :READ?
//! ```

use super::mode::{parse_sense_list, InstrumentMode, SenseFunction, SourceFunction};
use crate::adapters::Transport;
use crate::error::{AppResult, DaqError};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Sense-side range selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SenseRange {
    /// Let the instrument autorange
    Auto,
    /// Fixed range holding at least this magnitude
    Fixed(f64),
}

/// One quantity of a measurement reading, as selected by `:FORM:ELEM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputElement {
    /// Measured or sourced voltage
    Voltage,
    /// Measured or sourced current
    Current,
    /// Computed resistance
    Resistance,
    /// Instrument timestamp
    Time,
    /// Status word
    Status,
}

impl OutputElement {
    /// SCPI mnemonic used in `:FORM:ELEM`.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Voltage => "VOLT",
            Self::Current => "CURR",
            Self::Resistance => "RES",
            Self::Time => "TIME",
            Self::Status => "STAT",
        }
    }
}

impl fmt::Display for OutputElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl FromStr for OutputElement {
    type Err = DaqError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VOLT" | "VOLTAGE" => Ok(Self::Voltage),
            "CURR" | "CURRENT" => Ok(Self::Current),
            "RES" | "RESISTANCE" => Ok(Self::Resistance),
            "TIME" => Ok(Self::Time),
            "STAT" | "STATUS" => Ok(Self::Status),
            other => Err(DaqError::invalid(format!("Invalid output element '{}'", other))),
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

/// Parse one numeric field of an instrument response.
pub fn parse_number(response: &str) -> AppResult<f64> {
    let trimmed = response.trim();
    trimmed
        .parse::<f64>()
        .map_err(|_| DaqError::protocol(format!("Expected a number, got '{}'", trimmed)))
}

/// Parse a comma-delimited reading such as `+1.0E+00,-2.3E-09`.
pub fn parse_reading(response: &str) -> AppResult<Vec<f64>> {
    response.split(',').map(parse_number).collect()
}

/// SCPI session over one transport.
pub struct InstrumentSession<T: Transport> {
    transport: T,
    mode: InstrumentMode,
    preserve_sense_on_raw_write: bool,
}

impl<T: Transport> InstrumentSession<T> {
    /// Wrap a transport. Nothing is assumed about the instrument yet.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            mode: InstrumentMode::default(),
            preserve_sense_on_raw_write: false,
        }
    }

    /// Open the transport and wrap it.
    pub async fn connect(mut transport: T) -> AppResult<Self> {
        transport.open().await?;
        debug!("Session opened over {} transport", transport.name());
        Ok(Self::new(transport))
    }

    /// Keep sense facets across [`write_raw`](Self::write_raw).
    pub fn with_preserved_sense(mut self, preserve: bool) -> Self {
        self.preserve_sense_on_raw_write = preserve;
        self
    }

    /// Snapshot of the assumed instrument mode.
    pub fn mode(&self) -> InstrumentMode {
        self.mode
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Borrow the transport (e.g. to inspect a mock).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Close the transport. The mode is forgotten.
    pub async fn close(&mut self) -> AppResult<()> {
        self.transport.close().await?;
        self.mode = InstrumentMode::default();
        Ok(())
    }

    // ========================================================================
    // Low-level read/write
    // ========================================================================

    async fn send(&mut self, command: &str) -> AppResult<()> {
        debug!("SCPI write: {}", command);
        self.transport.write(command).await
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.send(command).await?;
        let response = self.transport.read().await?;
        debug!("SCPI response to {}: {}", command, response);
        Ok(response)
    }

    async fn query_number(&mut self, command: &str) -> AppResult<f64> {
        let response = self.query(command).await?;
        parse_number(&response)
    }

    /// Send an unmodeled command.
    ///
    /// The session cannot know what the command changed, so the mode is
    /// invalidated (see the module docs).
    pub async fn write_raw(&mut self, command: &str) -> AppResult<()> {
        self.send(command).await?;
        self.mode = self.mode.invalidated(self.preserve_sense_on_raw_write);
        Ok(())
    }

    /// Read one response after a [`write_raw`](Self::write_raw) query.
    pub async fn read_raw(&mut self) -> AppResult<String> {
        self.transport.read().await
    }

    // ========================================================================
    // System
    // ========================================================================

    /// Hard reset (`*RST`); afterwards all sensing is on, the rest off.
    pub async fn reset(&mut self) -> AppResult<()> {
        self.send("*RST").await?;
        self.mode = InstrumentMode::after_reset();
        Ok(())
    }

    /// Toggle remote (four-wire) sense.
    pub async fn set_remote_control(&mut self, enabled: bool) -> AppResult<()> {
        self.send(&format!(":SYST:RSEN {}", on_off(enabled))).await?;
        self.mode = self.mode.with_remote(enabled);
        Ok(())
    }

    // ========================================================================
    // Source
    // ========================================================================

    /// Switch the sourcing function.
    pub async fn set_source_mode(&mut self, function: SourceFunction) -> AppResult<()> {
        self.send(&format!(":SOUR:FUNC {}", function.mnemonic()))
            .await?;
        self.mode = self.mode.with_source(function);
        Ok(())
    }

    /// Switch the sourcing function by name (`"VOLT"`, `"v"`, `"curr"`, ...).
    pub async fn set_source_mode_by_name(&mut self, name: &str) -> AppResult<()> {
        let function: SourceFunction = name.parse()?;
        self.set_source_mode(function).await
    }

    /// Query the sourcing function the instrument reports.
    pub async fn source_mode(&mut self) -> AppResult<SourceFunction> {
        let response = self.query(":SOUR:FUNC:MODE?").await?;
        response.parse().map_err(|_| {
            DaqError::protocol(format!("Unrecognized source mode '{}'", response.trim()))
        })
    }

    fn require_sourcing(&self, function: SourceFunction) -> AppResult<()> {
        if self.mode.is_sourcing(function) {
            Ok(())
        } else {
            let what = match function {
                SourceFunction::Voltage => "voltage",
                SourceFunction::Current => "current",
            };
            Err(DaqError::IllegalState(format!(
                "Not in {} source mode",
                what
            )))
        }
    }

    /// Set the source range; requires sourcing `function`.
    pub async fn set_source_range(&mut self, function: SourceFunction, value: f64) -> AppResult<()> {
        self.require_sourcing(function)?;
        self.send(&format!(":SOUR:{}:RANG {}", function.mnemonic(), value))
            .await
    }

    /// Set the source level; requires sourcing `function`.
    pub async fn set_source_level(&mut self, function: SourceFunction, value: f64) -> AppResult<()> {
        self.require_sourcing(function)?;
        self.send(&format!(":SOUR:{}:LEV {}", function.mnemonic(), value))
            .await
    }

    /// Query the source range.
    pub async fn source_range(&mut self, function: SourceFunction) -> AppResult<f64> {
        self.query_number(&format!(":SOUR:{}:RANG?", function.mnemonic()))
            .await
    }

    /// Query the source level.
    pub async fn source_level(&mut self, function: SourceFunction) -> AppResult<f64> {
        self.query_number(&format!(":SOUR:{}:LEV?", function.mnemonic()))
            .await
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Energize or de-energize the output.
    pub async fn set_output(&mut self, enabled: bool) -> AppResult<()> {
        self.send(&format!(":OUTP {}", on_off(enabled))).await?;
        self.mode = self.mode.with_output(enabled);
        Ok(())
    }

    // ========================================================================
    // Sense
    // ========================================================================

    /// Toggle one sense function.
    pub async fn set_sense_enabled(&mut self, which: SenseFunction, enabled: bool) -> AppResult<()> {
        self.send(&format!(
            ":SENS:FUNC:{} '{}'",
            on_off(enabled),
            which.mnemonic()
        ))
        .await?;
        self.mode = self.mode.with_sense(which, enabled);
        Ok(())
    }

    /// Turn every sense function on.
    pub async fn enable_all_sensing(&mut self) -> AppResult<()> {
        self.send(":SENS:FUNC:ON:ALL").await?;
        self.mode = self.mode.with_all_sense(true);
        Ok(())
    }

    /// Turn every sense function off.
    pub async fn disable_all_sensing(&mut self) -> AppResult<()> {
        self.send(":SENS:FUNC:OFF:ALL").await?;
        self.mode = self.mode.with_all_sense(false);
        Ok(())
    }

    /// Sense functions the instrument reports as on.
    pub async fn active_sense_functions(&mut self) -> AppResult<BTreeSet<SenseFunction>> {
        let response = self.query(":SENS:FUNC:ON?").await?;
        parse_sense_list(&response)
    }

    /// Sense functions the instrument reports as off.
    pub async fn inactive_sense_functions(&mut self) -> AppResult<BTreeSet<SenseFunction>> {
        let response = self.query(":SENS:FUNC:OFF?").await?;
        parse_sense_list(&response)
    }

    async fn set_sense_range(&mut self, quantity: &str, range: SenseRange) -> AppResult<()> {
        match range {
            SenseRange::Auto => self.send(&format!(":SENS:{}:RANG:AUTO ON", quantity)).await,
            SenseRange::Fixed(value) => {
                self.send(&format!(":SENS:{}:RANG {}", quantity, value))
                    .await
            }
        }
    }

    /// Current compliance (protection) limit in amps.
    pub async fn set_current_compliance_limit(&mut self, value: f64) -> AppResult<()> {
        self.send(&format!(":SENS:CURR:PROT {}", value)).await
    }

    /// Voltage compliance (protection) limit in volts.
    pub async fn set_voltage_compliance_limit(&mut self, value: f64) -> AppResult<()> {
        self.send(&format!(":SENS:VOLT:PROT {}", value)).await
    }

    /// Current measurement range; [`SenseRange::Auto`] enables autorange.
    pub async fn set_current_range(&mut self, range: SenseRange) -> AppResult<()> {
        self.set_sense_range("CURR", range).await
    }

    /// Voltage measurement range; [`SenseRange::Auto`] enables autorange.
    pub async fn set_voltage_range(&mut self, range: SenseRange) -> AppResult<()> {
        self.set_sense_range("VOLT", range).await
    }

    /// Current compliance limit (`:SENS:CURR:PROT?`).
    pub async fn current_compliance_limit(&mut self) -> AppResult<f64> {
        self.query_number(":SENS:CURR:PROT?").await
    }

    /// Voltage compliance limit (`:SENS:VOLT:PROT?`).
    pub async fn voltage_compliance_limit(&mut self) -> AppResult<f64> {
        self.query_number(":SENS:VOLT:PROT?").await
    }

    /// Current measurement range in effect.
    pub async fn current_range(&mut self) -> AppResult<f64> {
        self.query_number(":SENS:CURR:RANG?").await
    }

    /// Voltage measurement range in effect.
    pub async fn voltage_range(&mut self) -> AppResult<f64> {
        self.query_number(":SENS:VOLT:RANG?").await
    }

    // ========================================================================
    // Format and measurement
    // ========================================================================

    /// Select which quantities a reading returns, in order.
    pub async fn set_output_format(&mut self, elements: &[OutputElement]) -> AppResult<()> {
        if elements.is_empty() {
            return Err(DaqError::invalid("Output format needs at least one element"));
        }
        let list = elements
            .iter()
            .map(|e| e.mnemonic())
            .collect::<Vec<_>>()
            .join(",");
        self.send(&format!(":FORM:ELEM {}", list)).await
    }

    /// Query the configured reading elements.
    pub async fn output_format(&mut self) -> AppResult<Vec<OutputElement>> {
        let response = self.query(":FORM:ELEM?").await?;
        response
            .split(',')
            .map(|item| {
                item.parse().map_err(|_| {
                    DaqError::protocol(format!("Unrecognized format element '{}'", item.trim()))
                })
            })
            .collect()
    }

    /// Trigger one reading and return the raw response.
    ///
    /// Parsing is left to the caller, who chose the output format.
    pub async fn measure(&mut self) -> AppResult<String> {
        self.query(":READ?").await
    }

    /// Trigger one reading and split it into numbers.
    pub async fn measure_values(&mut self) -> AppResult<Vec<f64>> {
        let response = self.measure().await?;
        parse_reading(&response)
    }
}
