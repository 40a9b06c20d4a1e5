//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the
//! instrument session, the ramp controller and the data-reduction pipeline.
//! Using the `thiserror` crate, it provides a centralized and consistent way
//! to report failures at the point of the offending call.
//!
//! ## Error Hierarchy
//!
//! - **`ConnectionClosed`**: the transport was used after `close()` or before
//!   `open()`.
//! - **`ConnectionAlreadyOpen`** / **`AlreadyClosed`**: transport lifecycle
//!   misuse.
//! - **`InvalidArgument`**: unrecognized mode alias, malformed sweep bounds,
//!   degenerate fit input, non-monotonic triad, diverging exponential.
//! - **`IllegalState`**: a source range or level was set while the session
//!   was not sourcing the matching function.
//! - **`Protocol`**: an instrument response could not be parsed as the
//!   expected type.
//! - **`Io`**, **`Csv`**, **`Config`**, **`Serial`**: wrapped failures from
//!   the filesystem, the bin store, configuration loading and the serial port.
//!
//! None of these are retried automatically. Retrying a stateful instrument
//! command without knowing whether it partially took effect is unsafe, so
//! every error surfaces to the caller.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the session, ramp, storage and analysis layers.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Transport used before open or after close
    #[error("Connection is closed")]
    ConnectionClosed,

    /// `open` on an open transport
    #[error("Connection already open")]
    ConnectionAlreadyOpen,

    /// `close` on a closed transport
    #[error("Connection already closed")]
    AlreadyClosed,

    /// Bad alias, sweep bounds or fit input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the assumed instrument mode
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Instrument response could not be parsed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serial link failure
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bin file encode/decode failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Config file or environment could not be extracted
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Config values out of range
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Shorthand for an [`DaqError::InvalidArgument`] with a formatted message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        DaqError::InvalidArgument(msg.into())
    }

    /// Shorthand for a [`DaqError::Protocol`] with a formatted message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        DaqError::Protocol(msg.into())
    }
}
