//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes the rig knows
//! about:
//!
//! - **`Transport`** / **`Io`**: link-level I/O failures. Fatal, never
//!   retried; any open run aborts into shutdown.
//! - **`Protocol`**: a malformed, corrupted or device-rejected telegram.
//!   Retried locally by the protocol engine up to a bounded count;
//!   exhaustion escalates to a run-level error.
//! - **`Precondition`** / **`Range`**: raised before any telegram is sent,
//!   never retried.
//! - **`LaserNotReady`** / **`ModeActivation`**: fatal laser state-machine
//!   failures.
//! - **`Config`** / **`Configuration`**: file-level and semantic
//!   configuration problems, caught at load time.
//! - **`Run`**: wraps any of the above with the run phase that failed, so
//!   the operator sees both where and why a measurement died.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type Result<T> = std::result::Result<T, RigError>;

/// Error codes the pulsed-laser controller reports in an escape-prefixed
/// reply, one ASCII digit `'1'`..`'6'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    /// `'1'`: the request telegram failed the controller's checksum test.
    Checksum,
    /// `'2'`: the request was framed incorrectly.
    IncorrectFormat,
    /// `'3'`: a parameter was outside the controller's accepted range.
    IncorrectParameter,
    /// `'4'`: the command is not allowed in the current laser state,
    /// typically because a mode transition is still in progress.
    Forbidden,
    /// `'5'`: the previous command is still being processed.
    Busy,
    /// `'6'`: the controller's transmit queue is full.
    QueueFull,
    /// Any other digit.
    Unknown,
}

impl DeviceErrorCode {
    /// Map the single-digit code of an error reply to its meaning.
    pub fn from_digit(digit: char) -> Self {
        match digit {
            '1' => Self::Checksum,
            '2' => Self::IncorrectFormat,
            '3' => Self::IncorrectParameter,
            '4' => Self::Forbidden,
            '5' => Self::Busy,
            '6' => Self::QueueFull,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Checksum => "checksum error",
            Self::IncorrectFormat => "incorrect format",
            Self::IncorrectParameter => "incorrect parameter",
            Self::Forbidden => "forbidden (command rejected in current state)",
            Self::Busy => "busy (previous command still processing)",
            Self::QueueFull => "TX queue full",
            Self::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}

/// The ways a single telegram exchange can fail below the transport level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolErrorKind {
    #[error("invalid checksum in reply")]
    ChecksumMismatch,

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("laser reported: {0}")]
    DeviceReported(DeviceErrorCode),

    #[error("no response received from laser")]
    NoResponse,
}

impl ProtocolErrorKind {
    /// Whether the laser rejected the command as forbidden. The engine
    /// inserts a back-off delay before retrying these.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::DeviceReported(DeviceErrorCode::Forbidden))
    }
}

/// Phase of a measurement run, carried in [`RigError::Run`] so failures
/// report where they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Bringup,
    GradientSetup,
    Capture,
    Shutdown,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Bringup => "bring-up",
            Self::GradientSetup => "gradient setup",
            Self::Capture => "capture",
            Self::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum RigError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolErrorKind),

    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error("{name} out of range: {value} (allowed {min}..={max})")]
    Range {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("laser not ready after {0:?}")]
    LaserNotReady(Duration),

    #[error("failed to activate {0} mode")]
    ModeActivation(&'static str),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("instrument error: {0}")]
    Instrument(String),

    #[error("{phase} failed: {source}")]
    Run {
        phase: RunPhase,
        #[source]
        source: Box<RigError>,
    },
}

impl RigError {
    /// Wrap an error with the run phase it occurred in.
    pub fn in_phase(self, phase: RunPhase) -> Self {
        Self::Run {
            phase,
            source: Box::new(self),
        }
    }

    /// True for link-level failures that must never be retried.
    pub fn is_fatal_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_code_table() {
        assert_eq!(DeviceErrorCode::from_digit('1'), DeviceErrorCode::Checksum);
        assert_eq!(
            DeviceErrorCode::from_digit('2'),
            DeviceErrorCode::IncorrectFormat
        );
        assert_eq!(
            DeviceErrorCode::from_digit('3'),
            DeviceErrorCode::IncorrectParameter
        );
        assert_eq!(DeviceErrorCode::from_digit('4'), DeviceErrorCode::Forbidden);
        assert_eq!(DeviceErrorCode::from_digit('5'), DeviceErrorCode::Busy);
        assert_eq!(DeviceErrorCode::from_digit('6'), DeviceErrorCode::QueueFull);
        assert_eq!(DeviceErrorCode::from_digit('7'), DeviceErrorCode::Unknown);
        assert_eq!(DeviceErrorCode::from_digit('x'), DeviceErrorCode::Unknown);
    }

    #[test]
    fn forbidden_detection() {
        let kind = ProtocolErrorKind::DeviceReported(DeviceErrorCode::Forbidden);
        assert!(kind.is_forbidden());
        assert!(!ProtocolErrorKind::ChecksumMismatch.is_forbidden());
    }

    #[test]
    fn run_phase_wrapping() {
        let err = RigError::Instrument("laser failed".to_string()).in_phase(RunPhase::Bringup);
        assert!(err.to_string().contains("bring-up failed"));
    }
}
