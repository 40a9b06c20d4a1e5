//! Source-measure unit control over SCPI.
//!
//! [`InstrumentSession`] is the single path to the instrument and tracks an
//! [`InstrumentMode`] so it can refuse commands the instrument is not
//! configured for.

pub mod mode;
pub mod session;

pub use mode::{parse_sense_list, InstrumentMode, SenseFunction, SourceFunction};
pub use session::{parse_number, parse_reading, InstrumentSession, OutputElement, SenseRange};
