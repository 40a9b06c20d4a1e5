//! Mock transport for testing
//!
//! This adapter stands in for a source-measure unit without any hardware.
//! It provides:
//! - A scripted responder: every written command is handed to a closure
//!   whose optional return value is queued as the instrument's reply
//! - Controllable failure injection
//! - Call logging for test verification
//!
//! Clones share state, so a test can keep one handle for inspection while
//! the session owns another.

use super::Transport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Responder = dyn FnMut(&str) -> Option<String> + Send;

/// Mock transport for testing
///
/// # Example
///
/// ```
/// use iv_daq::adapters::{MockTransport, Transport};
///
/// # tokio_test_block(async {
/// let mut link = MockTransport::new().with_responder(|cmd| {
///     (cmd == "*IDN?").then(|| "KEITHLEY,MODEL 2410".to_string())
/// });
/// link.open().await.unwrap();
/// link.write("*IDN?").await.unwrap();
/// assert_eq!(link.read().await.unwrap(), "KEITHLEY,MODEL 2410");
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f);
/// # }
/// ```
#[derive(Clone)]
pub struct MockTransport {
    open: Arc<AtomicBool>,
    should_fail_next: Arc<AtomicBool>,
    call_log: Arc<Mutex<Vec<String>>>,
    pending: Arc<Mutex<VecDeque<String>>>,
    responder: Arc<Mutex<Box<Responder>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    /// Create a closed mock whose instrument never answers.
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(false)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            call_log: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            responder: Arc::new(Mutex::new(Box::new(|_: &str| None))),
        }
    }

    /// Install the closure that answers written commands.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        *lock(&self.responder) = Box::new(responder);
        self
    }

    /// Queue a reply directly, independent of the responder.
    pub fn push_response(&self, response: impl Into<String>) {
        lock(&self.pending).push_back(response.into());
    }

    /// Inject a failure for the next write or read
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    /// Every command written so far, in order
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    /// Number of logged commands starting with `prefix`
    pub fn count_prefix(&self, prefix: &str) -> usize {
        lock(&self.call_log)
            .iter()
            .filter(|cmd| cmd.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&mut self) -> AppResult<()> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(DaqError::ConnectionAlreadyOpen);
        }
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(DaqError::AlreadyClosed);
        }
        lock(&self.pending).clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        if !self.is_open() {
            return Err(DaqError::ConnectionClosed);
        }
        if self.check_failure() {
            return Err(DaqError::Serial("Injected failure".to_string()));
        }

        lock(&self.call_log).push(command.to_string());
        let reply = {
            let mut responder = lock(&self.responder);
            (&mut **responder)(command)
        };
        if let Some(reply) = reply {
            lock(&self.pending).push_back(reply);
        }
        Ok(())
    }

    async fn read(&mut self) -> AppResult<String> {
        if !self.is_open() {
            return Err(DaqError::ConnectionClosed);
        }
        if self.check_failure() {
            return Err(DaqError::Serial("Injected failure".to_string()));
        }

        lock(&self.pending)
            .pop_front()
            .ok_or_else(|| DaqError::Serial("Read timed out: no response pending".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let mut link = MockTransport::new();
        assert!(matches!(
            link.write("*RST").await,
            Err(DaqError::ConnectionClosed)
        ));
        assert!(matches!(link.close().await, Err(DaqError::AlreadyClosed)));

        link.open().await.unwrap();
        assert!(matches!(
            link.open().await,
            Err(DaqError::ConnectionAlreadyOpen)
        ));

        link.close().await.unwrap();
        assert!(matches!(link.read().await, Err(DaqError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_responder_and_call_log() {
        let mut link = MockTransport::new()
            .with_responder(|cmd| cmd.ends_with('?').then(|| format!("echo {}", cmd)));
        let sent = link.clone();
        link.open().await.unwrap();

        link.write(":OUTP ON").await.unwrap();
        link.write(":SOUR:VOLT:LEV?").await.unwrap();
        assert_eq!(link.read().await.unwrap(), "echo :SOUR:VOLT:LEV?");

        assert_eq!(sent.call_log(), vec![":OUTP ON", ":SOUR:VOLT:LEV?"]);
        assert_eq!(sent.count_prefix(":SOUR"), 1);
    }

    #[tokio::test]
    async fn test_read_without_reply_fails() {
        let mut link = MockTransport::new();
        link.open().await.unwrap();
        link.write(":OUTP ON").await.unwrap();
        assert!(matches!(link.read().await, Err(DaqError::Serial(_))));
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let mut link = MockTransport::new();
        link.open().await.unwrap();
        link.inject_next_failure();
        assert!(link.write("*RST").await.is_err());
        assert!(link.write("*RST").await.is_ok());
        assert_eq!(link.call_log(), vec!["*RST"]);
    }
}
