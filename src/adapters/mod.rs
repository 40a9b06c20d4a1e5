//! Transport adapters
//!
//! This module contains implementations of the [`Transport`] trait, the
//! byte-level request/response link the instrument session talks through.
//! The session only needs `write`, `read` and the open/close lifecycle; line
//! termination and framing are the adapter's business.
//!
//! Adapters:
//! - [`SerialTransport`]: RS-232 / USB-serial via the `serialport` crate
//!   (feature `instrument_serial`)
//! - [`MockTransport`]: scripted responder for tests and dry runs

pub mod mock_adapter;
#[cfg(feature = "instrument_serial")]
pub mod serial_adapter;

pub use mock_adapter::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use serial_adapter::SerialTransport;

use crate::error::AppResult;
use async_trait::async_trait;

/// Request/response link to one instrument.
///
/// Commands and responses are newline-terminated text; adapters add and
/// strip terminators so callers deal in bare strings. Exactly one command
/// may be in flight at a time, which the `&mut self` receivers enforce.
///
/// ## Lifecycle
/// - `open` on an open link fails with `ConnectionAlreadyOpen`
/// - `close` on a closed link fails with `AlreadyClosed`
/// - `write`/`read` on a closed link fail with `ConnectionClosed`
#[async_trait]
pub trait Transport: Send {
    /// Short adapter name for logging
    fn name(&self) -> &str;

    /// Open the underlying connection
    async fn open(&mut self) -> AppResult<()>;

    /// Close the underlying connection
    async fn close(&mut self) -> AppResult<()>;

    /// Whether the link is currently open
    fn is_open(&self) -> bool;

    /// Send one command (terminator appended by the adapter)
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Read one response (terminator stripped by the adapter)
    async fn read(&mut self) -> AppResult<String>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn open(&mut self) -> AppResult<()> {
        (**self).open().await
    }

    async fn close(&mut self) -> AppResult<()> {
        (**self).close().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        (**self).write(command).await
    }

    async fn read(&mut self) -> AppResult<String> {
        (**self).read().await
    }
}
