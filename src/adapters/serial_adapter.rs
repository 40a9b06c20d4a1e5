//! Serial transport for RS-232/USB-serial instruments
//!
//! Wraps the `serialport` crate and provides async I/O using Tokio's
//! blocking task executor for the synchronous port operations.

use super::Transport;
use crate::config::InstrumentConfig;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Internal poll interval of the port; the overall read deadline is `timeout`.
const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

struct PortState {
    port: Box<dyn SerialPort>,
    /// Bytes received after the last delimiter, kept for the next read
    pending: Vec<u8>,
}

/// Serial transport for RS-232 communication
#[derive(Clone)]
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Read timeout
    timeout: Duration,

    /// Line terminator for commands (e.g., "\r\n")
    line_terminator: String,

    /// Response line ending character (e.g., '\n')
    response_delimiter: char,

    /// The open port (behind Arc<Mutex> for blocking-task access)
    state: Option<Arc<Mutex<PortState>>>,
}

impl SerialTransport {
    /// Create a new serial transport with default framing
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_secs(2),
            line_terminator: "\r\n".to_string(),
            response_delimiter: '\n',
            state: None,
        }
    }

    /// Build a transport from the `[instrument]` configuration block
    pub fn from_config(config: &InstrumentConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate)
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_line_terminator(config.line_terminator.clone())
            .with_response_delimiter(config.response_delimiter)
    }

    /// Set read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    /// Set response delimiter character
    pub fn with_response_delimiter(mut self, delimiter: char) -> Self {
        self.response_delimiter = delimiter;
        self
    }

    fn state(&self) -> AppResult<Arc<Mutex<PortState>>> {
        self.state.clone().ok_or(DaqError::ConnectionClosed)
    }
}

fn serial_err(err: impl std::fmt::Display) -> DaqError {
    DaqError::Serial(err.to_string())
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    async fn open(&mut self) -> AppResult<()> {
        if self.state.is_some() {
            return Err(DaqError::ConnectionAlreadyOpen);
        }

        let port_name = self.port_name.clone();
        let baud_rate = self.baud_rate;

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&port_name, baud_rate)
                .timeout(PORT_POLL_TIMEOUT)
                .open()
                .map_err(|e| {
                    DaqError::Serial(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        port_name, baud_rate, e
                    ))
                })
        })
        .await
        .map_err(serial_err)??;

        self.state = Some(Arc::new(Mutex::new(PortState {
            port,
            pending: Vec::new(),
        })));
        debug!("Connected to serial port: {}", self.port_name);
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.state.take().is_none() {
            return Err(DaqError::AlreadyClosed);
        }
        debug!("Disconnected from serial port: {}", self.port_name);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        let state = self.state()?;
        let framed = format!("{}{}", command, self.line_terminator);

        tokio::task::spawn_blocking(move || {
            let mut state = state.blocking_lock();
            state.port.write_all(framed.as_bytes())?;
            state.port.flush()?;
            Ok::<(), DaqError>(())
        })
        .await
        .map_err(serial_err)?
    }

    async fn read(&mut self) -> AppResult<String> {
        let state = self.state()?;
        let timeout = self.timeout;
        let delimiter = self.response_delimiter as u8;

        let line = tokio::task::spawn_blocking(move || {
            let mut state = state.blocking_lock();
            let start = Instant::now();
            let mut buf = [0u8; 256];

            loop {
                if let Some(pos) = state.pending.iter().position(|b| *b == delimiter) {
                    let line: Vec<u8> = state.pending.drain(..=pos).collect();
                    return Ok(line);
                }
                if start.elapsed() > timeout {
                    return Err(DaqError::Serial(format!(
                        "Serial read timeout after {:?}",
                        timeout
                    )));
                }
                match state.port.read(&mut buf) {
                    Ok(n) => state.pending.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        })
        .await
        .map_err(serial_err)??;

        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }
}
