//! Test and simulation transports.
//!
//! [`MockLink`] replays a scripted list of raw replies and records every
//! write, for exercising the protocol layer byte-for-byte. The stateful
//! device emulations in [`crate::instruments::sim`] build on the same
//! [`Transport`] trait, so everything above the link layer runs unchanged
//! against them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Result, RigError};
use crate::hardware::Transport;

/// Scripted transport: each `read_until` pops the next canned reply, each
/// write is appended to a shared log.
pub struct MockLink {
    replies: Mutex<VecDeque<Vec<u8>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_after_writes: Option<usize>,
}

impl MockLink {
    /// A link that answers with `replies` in order, then falls silent.
    pub fn with_replies(replies: Vec<Vec<u8>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_after_writes: None,
        }
    }

    /// A link whose writes fail after `n` successful ones, simulating a
    /// dead or unplugged device.
    pub fn failing_after(n: usize) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_after_writes: Some(n),
        }
    }

    /// Shared handle to the write log.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.sent.clone()
    }
}

#[async_trait]
impl Transport for MockLink {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        #[allow(clippy::unwrap_used)]
        let mut sent = self.sent.lock().unwrap();
        if let Some(limit) = self.fail_after_writes {
            if sent.len() >= limit {
                return Err(RigError::Transport("link is down".to_string()));
            }
        }
        sent.push(bytes.to_vec());
        Ok(())
    }

    async fn read_until(&mut self, _terminator: u8) -> Result<Vec<u8>> {
        #[allow(clippy::unwrap_used)]
        let next = self.replies.lock().unwrap().pop_front();
        // No scripted reply means the device stays silent; the caller sees
        // an empty read, exactly like a timed-out serial port.
        Ok(next.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_goes_silent() {
        let mut link = MockLink::with_replies(vec![b"a\r".to_vec(), b"b\r".to_vec()]);
        assert_eq!(link.read_until(b'\r').await.unwrap(), b"a\r");
        assert_eq!(link.read_until(b'\r').await.unwrap(), b"b\r");
        assert!(link.read_until(b'\r').await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fails_after_write_budget() {
        let mut link = MockLink::failing_after(1);
        link.write_all(b"first").await.unwrap();
        assert!(link.write_all(b"second").await.is_err());
    }
}
