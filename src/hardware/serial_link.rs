//! Serial transport for RS-232 device links.
//!
//! Wraps the `serialport` crate and provides async I/O by running the
//! synchronous serial operations on Tokio's blocking task executor. The
//! port itself uses a short internal read timeout; the overall per-read
//! deadline is enforced here.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serialport::SerialPort;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, RigError};
use crate::hardware::Transport;

/// A serial link to one device, exclusively owned by its instrument.
pub struct SerialLink {
    port_name: String,
    timeout: Duration,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialLink {
    /// Open a serial port with 8N1 framing and the given read deadline.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(100)) // internal read timeout
            .open()
            .map_err(|e| {
                RigError::Transport(format!(
                    "failed to open serial port '{port_name}' at {baud_rate} baud: {e}"
                ))
            })?;

        debug!("serial port '{}' opened at {} baud", port_name, baud_rate);

        Ok(Self {
            port_name: port_name.to_string(),
            timeout,
            port: Arc::new(Mutex::new(port)),
        })
    }
}

#[async_trait]
impl Transport for SerialLink {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.clone();
        let data = bytes.to_vec();
        let port_name = self.port_name.clone();

        // Blocking serial I/O runs on a dedicated thread.
        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            guard
                .write_all(&data)
                .and_then(|()| guard.flush())
                .map_err(|e| RigError::Transport(format!("write to '{port_name}' failed: {e}")))?;
            trace!("sent {} bytes to '{}'", data.len(), port_name);
            Ok(())
        })
        .await
        .map_err(|e| RigError::Transport(format!("serial I/O task panicked: {e}")))?
    }

    async fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        let port = self.port.clone();
        let timeout = self.timeout;
        let port_name = self.port_name.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            let mut response = Vec::new();
            let mut buffer = [0u8; 1];
            let start = Instant::now();

            loop {
                if start.elapsed() > timeout {
                    // Whatever arrived so far; the caller decides whether an
                    // unterminated read is an error.
                    return Ok(response);
                }

                match guard.read(&mut buffer) {
                    Ok(1) => {
                        response.push(buffer[0]);
                        if buffer[0] == terminator {
                            return Ok(response);
                        }
                    }
                    Ok(_) => {
                        return Err(RigError::Transport(format!(
                            "unexpected EOF from '{port_name}'"
                        )));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Port timeout is shorter than the overall deadline.
                        continue;
                    }
                    Err(e) => {
                        return Err(RigError::Transport(format!(
                            "read from '{port_name}' failed: {e}"
                        )));
                    }
                }
            }
        })
        .await
        .map_err(|e| RigError::Transport(format!("serial I/O task panicked: {e}")))?
    }

    async fn clear(&mut self) -> Result<()> {
        let port = self.port.clone();
        let port_name = self.port_name.clone();

        tokio::task::spawn_blocking(move || {
            let guard = port.blocking_lock();
            guard
                .clear(serialport::ClearBuffer::All)
                .map_err(|e| RigError::Transport(format!("clear on '{port_name}' failed: {e}")))
        })
        .await
        .map_err(|e| RigError::Transport(format!("serial I/O task panicked: {e}")))?
    }
}
