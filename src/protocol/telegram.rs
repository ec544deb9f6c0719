//! Telegram framing for the pulsed-laser serial protocol.
//!
//! One telegram is `start char + destination + source + payload + FCS +
//! CR`. The FCS is the sum of the ASCII codes of everything before it,
//! modulo 256, rendered as two uppercase hex digits. A telegram whose
//! reconstructed FCS does not match the received one is a protocol error,
//! never silently corrected.

use crate::error::{DeviceErrorCode, ProtocolErrorKind, Result, RigError};

/// Start character for request telegrams.
pub const START_REQUEST: char = '#';
/// Start character for reply telegrams.
pub const START_REPLY: char = '<';
/// Destination address of the laser controller.
pub const DEST_ADDR: char = '!';
/// Our source address.
pub const SRC_ADDR: char = '@';
/// End character terminating every telegram (CR).
pub const END_CHAR: char = '\r';
/// Two-byte escape prefix of a device error reply.
pub const ERROR_PREFIX: &str = "\x1b\x1b";

/// A decoded response telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bare end-char acknowledge for commands without a data reply.
    Ack,
    /// Data unit of a framed reply, with addresses and FCS stripped.
    Data(String),
}

impl Reply {
    /// The data unit, or an error if this was a bare acknowledge.
    pub fn into_data(self) -> Result<String> {
        match self {
            Self::Data(data) => Ok(data),
            Self::Ack => Err(ProtocolErrorKind::MalformedReply(
                "expected a data reply, got bare acknowledge".to_string(),
            )
            .into()),
        }
    }
}

/// Frame checksum: sum of ASCII codes modulo 256, as 2 uppercase hex digits.
pub fn calculate_fcs(message: &str) -> String {
    let sum: u32 = message.bytes().map(u32::from).sum();
    format!("{:02X}", sum % 256)
}

/// Verify the FCS of a complete telegram (including the trailing end char).
pub fn verify_fcs(telegram: &str) -> bool {
    if telegram.len() < 4 || !telegram.is_ascii() {
        return false;
    }
    let received = &telegram[telegram.len() - 3..telegram.len() - 1];
    let message = &telegram[..telegram.len() - 3];
    received == calculate_fcs(message)
}

/// Build a complete request telegram around a request data unit.
pub fn construct_request(data_unit: &str) -> String {
    let telegram = format!("{START_REQUEST}{DEST_ADDR}{SRC_ADDR}{data_unit}");
    let fcs = calculate_fcs(&telegram);
    format!("{telegram}{fcs}{END_CHAR}")
}

/// Decode a raw response into a [`Reply`].
///
/// `expect_reply` distinguishes a legitimate bare-CR acknowledge from a
/// truncated data reply. Device error replies are decoded before the FCS
/// check; everything else must carry a valid checksum.
pub fn parse_response(response: &str, expect_reply: bool) -> Result<Reply> {
    // The protocol is pure ASCII; anything else is line noise. Rejecting it
    // here also keeps the fixed-offset slicing below on char boundaries.
    if !response.is_ascii() {
        return Err(ProtocolErrorKind::MalformedReply(format!(
            "non-ASCII bytes in reply: {response:?}"
        ))
        .into());
    }

    if response == END_CHAR.to_string() {
        if expect_reply {
            return Err(ProtocolErrorKind::MalformedReply(
                "expected a data reply, got bare acknowledge".to_string(),
            )
            .into());
        }
        return Ok(Reply::Ack);
    }

    if let Some(rest) = response.strip_prefix(ERROR_PREFIX) {
        let code = rest
            .chars()
            .next()
            .map_or(DeviceErrorCode::Unknown, DeviceErrorCode::from_digit);
        return Err(ProtocolErrorKind::DeviceReported(code).into());
    }

    if response.starts_with(START_REPLY) {
        if !verify_fcs(response) {
            return Err(ProtocolErrorKind::ChecksumMismatch.into());
        }
        if response.len() < 7 {
            return Err(
                ProtocolErrorKind::MalformedReply("reply telegram too short".to_string()).into(),
            );
        }
        let bytes: Vec<char> = response.chars().collect();
        // Addresses are mirrored in a reply: it is addressed to us, from
        // the laser.
        if bytes[1] != SRC_ADDR || bytes[2] != DEST_ADDR {
            return Err(
                ProtocolErrorKind::MalformedReply("invalid address in reply".to_string()).into(),
            );
        }
        let data = &response[3..response.len() - 3];
        return Ok(Reply::Data(data.to_string()));
    }

    Err(ProtocolErrorKind::MalformedReply(format!("unknown response format: {response:?}")).into())
}

/// Frame a reply telegram. Only the simulated laser link needs this, but it
/// keeps construction and parsing symmetric.
pub fn construct_reply(data_unit: &str) -> String {
    let telegram = format!("{START_REPLY}{SRC_ADDR}{DEST_ADDR}{data_unit}");
    let fcs = calculate_fcs(&telegram);
    format!("{telegram}{fcs}{END_CHAR}")
}
