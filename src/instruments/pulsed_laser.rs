//! Safety state machine for the pulsed high-voltage laser.
//!
//! All transitions go through the telegram engine; the driver adds the
//! precondition checks, the turn-on poll and the post-condition
//! verification around mode changes. Mode transitions are the primary
//! source of transient Busy/Forbidden rejections, so they run with
//! elevated retries.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ProtocolErrorKind, Result, RigError};
use crate::protocol::status::{
    LaserMode, LaserStatus, ENERGY_FULL_SCALE_COUNTS, ENERGY_FULL_SCALE_UJ,
};
use crate::protocol::{TelegramEngine, DEFAULT_RETRIES};

/// Timeout for the blocking turn-on poll.
const TURN_ON_TIMEOUT: Duration = Duration::from_secs(20);
/// Cadence of the turn-on status poll.
const TURN_ON_POLL: Duration = Duration::from_secs(1);
/// Settle delay after a stop before, and after, a mode-enable command.
const MODE_SETTLE: Duration = Duration::from_secs(1);
/// Mode-enable commands get elevated retries.
const MODE_RETRIES: u32 = 5;
/// Extra shutter attempts on Forbidden, with this delay between them.
const SHUTTER_EXTRA_RETRIES: u32 = 2;
const SHUTTER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The pulsed laser behind its protocol engine.
pub struct PulsedLaser {
    engine: TelegramEngine,
    hv_percent_max: u8,
}

impl PulsedLaser {
    /// `hv_percent_max` is the configured upper bound for the HV setter,
    /// validated at settings load time.
    pub fn new(engine: TelegramEngine, hv_percent_max: u8) -> Self {
        Self {
            engine,
            hv_percent_max,
        }
    }

    /// Fresh extended status snapshot.
    pub async fn status(&mut self) -> Result<LaserStatus> {
        self.engine.extended_status().await
    }

    /// Enable the laser and poll until it reports both ready and on.
    ///
    /// The warm-up takes several seconds; not reaching ready+on within the
    /// timeout is fatal.
    pub async fn turn_on(&mut self) -> Result<()> {
        info!("enabling pulsed laser, waiting for warm-up");
        self.engine.send_command("g", false, DEFAULT_RETRIES).await?;

        let deadline = tokio::time::Instant::now() + TURN_ON_TIMEOUT;
        loop {
            tokio::time::sleep(TURN_ON_POLL).await;
            match self.status().await {
                Ok(status) if status.ready && status.on => {
                    info!("pulsed laser ready");
                    return Ok(());
                }
                Ok(status) => {
                    debug!(ready = status.ready, on = status.on, "still warming up");
                }
                // Garbled status replies are common during the warm-up;
                // keep polling until the deadline.
                Err(e @ RigError::Protocol(_)) => {
                    warn!("status poll failed during warm-up: {e}");
                }
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RigError::LaserNotReady(TURN_ON_TIMEOUT));
            }
        }
    }

    /// Disable the laser entirely.
    pub async fn turn_off(&mut self) -> Result<()> {
        self.engine.send_command("X", false, DEFAULT_RETRIES).await?;
        Ok(())
    }

    /// Stop the current operation and return to mode OFF. Always legal and
    /// idempotent; the beam path physically closes regardless of prior
    /// mode, which makes this the universal abort transition.
    pub async fn stop_operation(&mut self) -> Result<()> {
        self.engine.send_command("i", false, DEFAULT_RETRIES).await?;
        Ok(())
    }

    /// Enter repetition mode.
    ///
    /// Requires the laser to be on. A non-OFF current mode is stopped
    /// first with a settle delay. The mode is verified after the enable;
    /// a mismatch is a fatal activation failure.
    pub async fn start_repetition_mode(&mut self) -> Result<()> {
        let status = self.status().await?;
        if !status.on {
            return Err(RigError::Precondition(
                "repetition mode requested while laser is off".to_string(),
            ));
        }
        if status.mode != LaserMode::Off {
            debug!(mode = status.mode.name(), "stopping current mode first");
            self.stop_operation().await?;
            tokio::time::sleep(MODE_SETTLE).await;
        }

        self.engine.send_command("h", false, MODE_RETRIES).await?;
        tokio::time::sleep(MODE_SETTLE).await;

        let status = self.status().await?;
        if status.mode != LaserMode::Repetition {
            return Err(RigError::ModeActivation("repetition"));
        }
        info!("repetition mode active");
        Ok(())
    }

    /// Enter burst mode. Single command, no polling.
    pub async fn start_burst_mode(&mut self) -> Result<()> {
        self.engine.send_command("j", false, MODE_RETRIES).await?;
        Ok(())
    }

    /// Hand triggering over to the external trigger input. Single command,
    /// no polling.
    pub async fn activate_external_trigger(&mut self) -> Result<()> {
        self.engine.send_command("u", false, MODE_RETRIES).await?;
        Ok(())
    }

    /// Open or close the shutter.
    ///
    /// Requires the laser to be ready. In the brief window after a mode
    /// change the controller rejects the command as Forbidden; those get a
    /// couple of extra delayed attempts on top of the engine's own retries.
    pub async fn set_shutter(&mut self, open: bool) -> Result<()> {
        let status = self.status().await?;
        if !status.ready {
            return Err(RigError::Precondition(
                "shutter requested while laser is not ready".to_string(),
            ));
        }

        let opcode = if open { "z1" } else { "z0" };
        for attempt in 0..=SHUTTER_EXTRA_RETRIES {
            match self.engine.send_command(opcode, false, 1).await {
                Ok(_) => return Ok(()),
                Err(RigError::Protocol(kind))
                    if kind.is_forbidden() && attempt < SHUTTER_EXTRA_RETRIES =>
                {
                    warn!(attempt, "shutter command rejected, retrying");
                    tokio::time::sleep(SHUTTER_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("shutter retry loop always returns")
    }

    /// Number of pulses per burst/quantity run.
    pub async fn set_quantity(&mut self, quantity: u16) -> Result<()> {
        self.engine
            .send_command(&format!("l{quantity:04X}"), false, DEFAULT_RETRIES)
            .await?;
        Ok(())
    }

    /// Internal repetition rate in hertz.
    pub async fn set_repetition_rate(&mut self, rate_hz: u8) -> Result<()> {
        self.engine
            .send_command(&format!("m{rate_hz:02X}"), false, DEFAULT_RETRIES)
            .await?;
        Ok(())
    }

    /// HV supply level as a percentage, bounded by the configured maximum.
    pub async fn set_hv_percent(&mut self, percent: u8) -> Result<()> {
        if percent > self.hv_percent_max {
            return Err(RigError::Range {
                name: "HV percent",
                value: i64::from(percent),
                min: 0,
                max: i64::from(self.hv_percent_max),
            });
        }
        self.engine
            .send_command(&format!("n{percent:02X}"), false, DEFAULT_RETRIES)
            .await?;
        Ok(())
    }

    /// Attenuator stepper position, 0..=399 full steps.
    pub async fn set_stepper_position(&mut self, position: u16) -> Result<()> {
        if position > 399 {
            return Err(RigError::Range {
                name: "stepper position",
                value: i64::from(position),
                min: 0,
                max: 399,
            });
        }
        self.engine
            .send_command(&format!("O3{position:04X}"), false, DEFAULT_RETRIES)
            .await?;
        Ok(())
    }

    /// Attenuator transmission in half-percent steps, 0..=200.
    pub async fn set_transmission(&mut self, transmission: u8) -> Result<()> {
        if transmission > 200 {
            return Err(RigError::Range {
                name: "transmission",
                value: i64::from(transmission),
                min: 0,
                max: 200,
            });
        }
        self.engine
            .send_command(&format!("O4{transmission:02X}"), false, DEFAULT_RETRIES)
            .await?;
        Ok(())
    }

    /// Target pulse energy for the attenuator regulation, raw counts.
    pub async fn set_attenuation_energy(&mut self, energy: u16) -> Result<()> {
        self.engine
            .send_command(&format!("O5{energy:04X}"), false, DEFAULT_RETRIES)
            .await?;
        Ok(())
    }

    /// Re-reference the attenuator stepper against its home switch.
    pub async fn init_attenuator(&mut self) -> Result<()> {
        self.engine
            .send_command("O60000", false, DEFAULT_RETRIES)
            .await?;
        Ok(())
    }

    /// Clear a latched permanent-error condition on the controller.
    pub async fn reset_error(&mut self) -> Result<()> {
        self.engine.send_command("s", false, DEFAULT_RETRIES).await?;
        Ok(())
    }

    /// Short status word, cheaper than the extended status pair.
    pub async fn short_status(&mut self) -> Result<String> {
        self.engine.query("W").await
    }

    /// Controller firmware version string.
    pub async fn version_info(&mut self) -> Result<String> {
        self.engine.query("V3").await
    }

    /// Serial numbers of controller and laser head.
    pub async fn serial_numbers(&mut self) -> Result<String> {
        self.engine.query("US").await
    }

    /// Raw attenuator status words.
    pub async fn attenuator_status(&mut self) -> Result<String> {
        self.engine.query("UV").await
    }

    /// Energy-monitor readings, decoded from 4-hex-digit raw counts to
    /// microjoule.
    pub async fn energy_values(&mut self) -> Result<Vec<f64>> {
        let data = self.engine.query("P").await?;
        if data.len() % 4 != 0 {
            return Err(ProtocolErrorKind::MalformedReply(format!(
                "energy list length {} is not a multiple of 4",
                data.len()
            ))
            .into());
        }
        let mut values = Vec::with_capacity(data.len() / 4);
        for chunk in 0..data.len() / 4 {
            let field = &data[chunk * 4..chunk * 4 + 4];
            let raw = u16::from_str_radix(field, 16).map_err(|_| {
                ProtocolErrorKind::MalformedReply(format!("energy field not hex: {field:?}"))
            })?;
            values.push(f64::from(raw) / ENERGY_FULL_SCALE_COUNTS * ENERGY_FULL_SCALE_UJ);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::sim::SimulatedLaser;

    fn laser(sim: SimulatedLaser) -> PulsedLaser {
        PulsedLaser::new(TelegramEngine::new(Box::new(sim)), 100)
    }

    #[tokio::test(start_paused = true)]
    async fn turn_on_waits_for_ready() {
        let sim = SimulatedLaser::new().ready_after_polls(3);
        let mut laser = laser(sim);
        laser.turn_on().await.unwrap();
        let status = laser.status().await.unwrap();
        assert!(status.ready && status.on);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_on_survives_garbled_status_replies() {
        // More corrupted replies than one status query retries through, so
        // the poll loop itself has to absorb the failure and try again.
        let sim = SimulatedLaser::new()
            .ready_after_polls(0)
            .garbled_status_polls(4);
        let mut laser = laser(sim);
        laser.turn_on().await.unwrap();
        assert!(laser.status().await.unwrap().ready);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_on_times_out_when_never_ready() {
        let sim = SimulatedLaser::new().never_ready();
        let mut laser = laser(sim);
        let started = tokio::time::Instant::now();
        let err = laser.turn_on().await.unwrap_err();
        assert!(matches!(err, RigError::LaserNotReady(_)));
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn repetition_mode_requires_laser_on() {
        let mut laser = laser(SimulatedLaser::new());
        let err = laser.start_repetition_mode().await.unwrap_err();
        assert!(matches!(err, RigError::Precondition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn repetition_from_burst_stops_first() {
        let sim = SimulatedLaser::new().ready_after_polls(0);
        let commands = sim.command_log();
        let mut laser = laser(sim);
        laser.turn_on().await.unwrap();
        laser.start_burst_mode().await.unwrap();

        laser.start_repetition_mode().await.unwrap();

        let log = commands.lock().unwrap();
        let stop_idx = log.iter().rposition(|c| c == "i").unwrap();
        let rep_idx = log.iter().rposition(|c| c == "h").unwrap();
        assert!(stop_idx < rep_idx, "stop must precede mode enable: {log:?}");

        drop(log);
        let status = laser.status().await.unwrap();
        assert_eq!(status.mode, LaserMode::Repetition);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_mode_activation_is_named() {
        let sim = SimulatedLaser::new().ready_after_polls(0).ignore_mode_changes();
        let mut laser = laser(sim);
        laser.turn_on().await.unwrap();
        let err = laser.start_repetition_mode().await.unwrap_err();
        assert!(matches!(err, RigError::ModeActivation("repetition")));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_operation_is_idempotent() {
        let sim = SimulatedLaser::new().ready_after_polls(0);
        let mut laser = laser(sim);
        laser.turn_on().await.unwrap();
        laser.start_repetition_mode().await.unwrap();

        laser.stop_operation().await.unwrap();
        assert_eq!(laser.status().await.unwrap().mode, LaserMode::Off);
        laser.stop_operation().await.unwrap();
        assert_eq!(laser.status().await.unwrap().mode, LaserMode::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn shutter_requires_ready() {
        let mut laser = laser(SimulatedLaser::new());
        let err = laser.set_shutter(true).await.unwrap_err();
        assert!(matches!(err, RigError::Precondition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutter_retries_through_forbidden_window() {
        let sim = SimulatedLaser::new()
            .ready_after_polls(0)
            .forbidden_budget(2);
        let mut laser = laser(sim);
        laser.turn_on().await.unwrap();
        laser.set_shutter(true).await.unwrap();
        assert!(laser.status().await.unwrap().shutter_open);
    }

    #[tokio::test]
    async fn setters_validate_ranges() {
        let mut laser = laser(SimulatedLaser::new());
        assert!(matches!(
            laser.set_hv_percent(101).await,
            Err(RigError::Range { .. })
        ));
        assert!(matches!(
            laser.set_stepper_position(400).await,
            Err(RigError::Range { .. })
        ));
        assert!(matches!(
            laser.set_transmission(201).await,
            Err(RigError::Range { .. })
        ));
    }

    #[tokio::test]
    async fn info_queries_use_their_own_opcodes() {
        let sim = SimulatedLaser::new();
        let commands = sim.command_log();
        let mut laser = laser(sim);

        assert_eq!(laser.short_status().await.unwrap(), "00");
        assert_eq!(laser.version_info().await.unwrap(), "MSG 2.16");
        assert_eq!(laser.serial_numbers().await.unwrap(), "0001703 0001704");
        assert_eq!(*commands.lock().unwrap(), vec!["W", "V3", "US"]);
    }

    #[tokio::test]
    async fn energy_values_scale_to_microjoule() {
        let mut laser = laser(SimulatedLaser::new());
        let values = laser.energy_values().await.unwrap();
        assert_eq!(values, vec![125.0, 125.0]);
    }

    #[tokio::test]
    async fn hv_bound_is_configurable() {
        let sim = SimulatedLaser::new();
        let mut laser = PulsedLaser::new(TelegramEngine::new(Box::new(sim)), 80);
        assert!(matches!(
            laser.set_hv_percent(81).await,
            Err(RigError::Range { .. })
        ));
        laser.set_hv_percent(80).await.unwrap();
    }
}
