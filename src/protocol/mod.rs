//! Request/reply telegram engine for the pulsed-laser serial link.
//!
//! The engine owns the transport, frames every request, decodes the
//! response, and applies the retry policy: protocol-level failures (bad
//! checksum, malformed reply, device-reported error, no response) are
//! retried up to a bounded count, with a fixed back-off when the laser
//! rejected the command as forbidden mid-transition. Transport failures are
//! fatal and propagate immediately.

pub mod status;
pub mod telegram;

use std::time::Duration;

use tracing::warn;

use crate::error::{Result, RigError};
use crate::hardware::Transport;
use status::LaserStatus;
pub use telegram::Reply;

/// Default retry count for ordinary commands.
pub const DEFAULT_RETRIES: u32 = 3;
/// Back-off before retrying a command the laser rejected as forbidden.
const FORBIDDEN_BACKOFF: Duration = Duration::from_secs(2);

/// Protocol engine over one exclusive laser link.
pub struct TelegramEngine {
    link: Box<dyn Transport>,
}

impl TelegramEngine {
    pub fn new(link: Box<dyn Transport>) -> Self {
        Self { link }
    }

    /// Send one request data unit and decode the response.
    ///
    /// Retries protocol errors up to `max_retries` attempts in total;
    /// exhausting them re-raises the last protocol error. Transport
    /// failures are never retried.
    pub async fn send_command(
        &mut self,
        data_unit: &str,
        expect_reply: bool,
        max_retries: u32,
    ) -> Result<Reply> {
        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            match self.exchange(data_unit, expect_reply).await {
                Ok(reply) => return Ok(reply),
                Err(RigError::Protocol(kind)) => {
                    if attempt == attempts {
                        return Err(RigError::Protocol(kind));
                    }
                    if kind.is_forbidden() {
                        tokio::time::sleep(FORBIDDEN_BACKOFF).await;
                    }
                    warn!(
                        command = data_unit,
                        attempt,
                        error = %kind,
                        "retrying laser command"
                    );
                }
                // Link-level failures are fatal.
                Err(other) => return Err(other),
            }
        }
        unreachable!("retry loop always returns")
    }

    /// One framed write + read-until-CR exchange, no retries.
    async fn exchange(&mut self, data_unit: &str, expect_reply: bool) -> Result<Reply> {
        let request = telegram::construct_request(data_unit);
        self.link.write_all(request.as_bytes()).await?;

        let raw = self.link.read_until(telegram::END_CHAR as u8).await?;
        if raw.is_empty() {
            return Err(crate::error::ProtocolErrorKind::NoResponse.into());
        }
        let text = String::from_utf8(raw).map_err(|e| {
            crate::error::ProtocolErrorKind::MalformedReply(format!("non-ASCII reply: {e}"))
        })?;

        telegram::parse_response(&text, expect_reply)
    }

    /// Issue one status query and strip the opcode echo from the reply.
    pub async fn query(&mut self, opcode: &str) -> Result<String> {
        let reply = self.send_command(opcode, true, DEFAULT_RETRIES).await?;
        let data = reply.into_data()?;
        data.strip_prefix(opcode)
            .map(str::to_string)
            .ok_or_else(|| {
                crate::error::ProtocolErrorKind::MalformedReply(format!(
                    "reply does not echo {opcode:?}: {data:?}"
                ))
                .into()
            })
    }

    /// Query the full extended status (Stat7 + Stat8) and decode it.
    pub async fn extended_status(&mut self) -> Result<LaserStatus> {
        let stat7 = self.query("UT").await?;
        let stat8 = self.query("UU").await?;
        LaserStatus::from_payloads(&stat7, &stat8)
    }
}
