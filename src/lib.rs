//! Core library for the iv_daq application.
//!
//! Controls a SCPI source-measure unit over a serial link, drives it through
//! voltage ramps to record IV curves, and reduces the recorded samples into
//! per-voltage bins that can be fit to linear or exponential-decay models.
//!
//! Data flow:
//!
//! ```text
//! Transport -> InstrumentSession -> RampController -> SampleLog
//!           -> segment() -> Bin -> BinStore / analysis::fit
//! ```

pub mod adapters;
pub mod analysis;
pub mod config;
pub mod data;
pub mod error;
pub mod instrument;
pub mod ramp;
