//! Hardware link layer.
//!
//! Every device speaks through a [`Transport`]: a byte-oriented,
//! terminator-delimited serial link. The real implementation wraps the
//! `serialport` crate behind Tokio's blocking executor; a simulated
//! implementation emulates the device on the other end of the wire so the
//! whole stack above the link can run without hardware.
//!
//! Which variant a device gets is decided exactly once at bring-up via
//! [`LinkConfig`], never by catching connection errors at runtime.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial_link;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Byte-level transport to one serial device.
///
/// `read_until` returns whatever arrived before the timeout; deciding
/// whether an empty or unterminated read is an error is left to the caller
/// (the telegram engine treats empty as "no response", which is retryable,
/// while an I/O failure from the link is fatal).
#[async_trait]
pub trait Transport: Send {
    /// Write all bytes to the device.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read until `terminator` is seen or the link timeout elapses.
    /// The terminator, when seen, is included in the returned bytes.
    async fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>>;

    /// Discard any pending input.
    async fn clear(&mut self) -> Result<()> {
        Ok(())
    }
}

/// How one device link is established.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkConfig {
    /// Real serial hardware.
    Real { port: String, baud_rate: u32 },
    /// In-process simulation of the device.
    Simulated,
}

impl LinkConfig {
    /// Convenience for tests and the simulated rig.
    pub fn simulated() -> Self {
        Self::Simulated
    }
}
