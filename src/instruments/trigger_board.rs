//! Driver for the firmware trigger/LED board.
//!
//! The board runs the diode PWM channels, gates the external laser trigger,
//! drives the status LED and carries a hardware dead-man's switch: absent a
//! keep-alive signal for longer than its programmed grace period it cuts
//! the outputs on its own. The wire protocol is ASCII: `2<name>=<value>\n`
//! sets a named firmware variable, single bytes `'1'`/`'0'`/`'3'` switch
//! the outputs on/off and feed the watchdog. The firmware needs a short
//! settle delay after every write before it accepts the next command.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::hardware::Transport;

/// Firmware variable names. The parser on the board caps names at 6 chars.
pub const VAR_DUTY_405: &str = "Dut405";
pub const VAR_DUTY_445: &str = "Dut445";
pub const VAR_FREQ_405: &str = "Frq405";
pub const VAR_FREQ_445: &str = "Frq445";
pub const VAR_RES_405: &str = "Res405";
pub const VAR_RES_445: &str = "Res445";
pub const VAR_PULSE_RATE: &str = "FrqLTB";
pub const VAR_CONTINUOUS: &str = "ConMea";
pub const VAR_WATCHDOG_DELAY: &str = "ExpDel";
pub const VAR_LED: &str = "SetLED";

/// LED patterns: red while the beam path is live, green when idle.
pub const LED_RED: i64 = 511;
pub const LED_GREEN: i64 = 151;

const MAX_NAME_LEN: usize = 6;
/// Values are parsed into a firmware int, except the watchdog delay which
/// is a long.
const MAX_VALUE_DIGITS: usize = 5;
const MAX_WATCHDOG_DIGITS: usize = 10;

/// One firmware trigger board on one exclusive link.
pub struct TriggerBoard {
    link: Box<dyn Transport>,
    settle: Duration,
}

impl TriggerBoard {
    pub fn new(link: Box<dyn Transport>, settle: Duration) -> Self {
        Self { link, settle }
    }

    /// Set a named firmware variable.
    ///
    /// Oversized names or values are a logged warning, not a failure: the
    /// firmware will roll the value over rather than reject the line, and
    /// the operator should know why the outputs look wrong.
    pub async fn set_variable(&mut self, name: &str, value: i64) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            warn!(
                name,
                "firmware variable name exceeds {MAX_NAME_LEN} chars and will be truncated"
            );
        }
        let digits = value.to_string().len();
        let limit = if name == VAR_WATCHDOG_DELAY {
            MAX_WATCHDOG_DIGITS
        } else {
            MAX_VALUE_DIGITS
        };
        if digits > limit {
            warn!(
                name,
                value, "firmware value exceeds {limit} digits and may roll over"
            );
        }

        debug!(name, value, "setting firmware variable");
        self.link
            .write_all(format!("2{name}={value}\n").as_bytes())
            .await?;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    async fn signal(&mut self, byte: u8) -> Result<()> {
        self.link.write_all(&[byte]).await?;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// Open the trigger gate: the board starts driving the diode channels
    /// and the external laser trigger.
    pub async fn enable_outputs(&mut self) -> Result<()> {
        self.signal(b'1').await
    }

    /// Close the trigger gate.
    pub async fn disable_outputs(&mut self) -> Result<()> {
        self.signal(b'0').await
    }

    /// Feed the hardware watchdog. Must arrive more often than the
    /// programmed grace period while the outputs are live.
    pub async fn keep_alive(&mut self) -> Result<()> {
        self.signal(b'3').await
    }

    pub async fn led_red(&mut self) -> Result<()> {
        self.set_variable(VAR_LED, LED_RED).await
    }

    pub async fn led_green(&mut self) -> Result<()> {
        self.set_variable(VAR_LED, LED_GREEN).await
    }
}

/// Duty cycle counts for a fractional duty at a given PWM resolution.
pub fn duty_counts(duty_fraction: f64, resolution_bits: u32) -> i64 {
    let max_counts = (1i64 << resolution_bits) - 1;
    (duty_fraction * max_counts as f64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockLink;

    fn board() -> (TriggerBoard, std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>) {
        let link = MockLink::with_replies(vec![]);
        let log = link.sent_log();
        (TriggerBoard::new(Box::new(link), Duration::ZERO), log)
    }

    #[tokio::test]
    async fn variable_line_format() {
        let (mut board, log) = board();
        board.set_variable(VAR_FREQ_405, 1000).await.unwrap();
        assert_eq!(log.lock().unwrap()[0], b"2Frq405=1000\n");
    }

    #[tokio::test]
    async fn signals_are_single_bytes() {
        let (mut board, log) = board();
        board.enable_outputs().await.unwrap();
        board.keep_alive().await.unwrap();
        board.disable_outputs().await.unwrap();
        let sent = log.lock().unwrap();
        assert_eq!(*sent, vec![b"1".to_vec(), b"3".to_vec(), b"0".to_vec()]);
    }

    #[tokio::test]
    async fn oversized_value_is_not_an_error() {
        let (mut board, log) = board();
        board.set_variable(VAR_DUTY_405, 123_456).await.unwrap();
        assert_eq!(log.lock().unwrap()[0], b"2Dut405=123456\n");
    }

    #[test]
    fn duty_counts_scale_with_resolution() {
        assert_eq!(duty_counts(1.0, 8), 255);
        assert_eq!(duty_counts(0.5, 10), 511);
        assert_eq!(duty_counts(0.0, 12), 0);
    }
}
