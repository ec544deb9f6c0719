//! In-process device simulations.
//!
//! The simulated pulsed laser sits behind the [`Transport`] trait and
//! emulates the controller at the wire level, so the telegram engine and
//! the safety state machine run byte-for-byte the same code against it as
//! against hardware. The CW-laser bus and the spectrometer are simulated
//! at their respective trait seams.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{Result, RigError};
use crate::hardware::Transport;
use crate::instruments::cw_laser::{RegWidth, RegisterBus};
use crate::instruments::spectrometer::Spectrometer;
use crate::protocol::telegram;

const MODE_OFF: u8 = 0x00;
const MODE_REPETITION: u8 = 0x10;
const MODE_BURST: u8 = 0x20;
const MODE_EXTERNAL: u8 = 0x40;

#[derive(Default)]
struct LaserState {
    on: bool,
    ready: bool,
    shutter_open: bool,
    mode: u8,
    hv_percent: u8,
    quantity: u16,
    rate_hz: u8,
    shot_counter: u32,
    polls_until_ready: u32,
    never_ready: bool,
    ignore_mode_changes: bool,
    forbidden_budget: u32,
    garbled_polls: u32,
}

/// Wire-level emulation of the pulsed-laser controller.
pub struct SimulatedLaser {
    state: Mutex<LaserState>,
    pending: Mutex<VecDeque<Vec<u8>>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl SimulatedLaser {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LaserState {
                polls_until_ready: 1,
                ..LaserState::default()
            }),
            pending: Mutex::new(VecDeque::new()),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The laser reports ready after this many extended-status polls
    /// following the enable command.
    #[must_use]
    pub fn ready_after_polls(self, polls: u32) -> Self {
        #[allow(clippy::unwrap_used)]
        {
            self.state.lock().unwrap().polls_until_ready = polls;
        }
        self
    }

    /// The laser never reaches the ready state.
    #[must_use]
    pub fn never_ready(self) -> Self {
        #[allow(clippy::unwrap_used)]
        {
            self.state.lock().unwrap().never_ready = true;
        }
        self
    }

    /// Mode-enable commands are acknowledged but have no effect, as a
    /// stuck controller would behave.
    #[must_use]
    pub fn ignore_mode_changes(self) -> Self {
        #[allow(clippy::unwrap_used)]
        {
            self.state.lock().unwrap().ignore_mode_changes = true;
        }
        self
    }

    /// Reject the next `n` mode/shutter commands as Forbidden.
    #[must_use]
    pub fn forbidden_budget(self, n: u32) -> Self {
        #[allow(clippy::unwrap_used)]
        {
            self.state.lock().unwrap().forbidden_budget = n;
        }
        self
    }

    /// Corrupt the next `n` extended-status replies, as line noise during
    /// the warm-up would.
    #[must_use]
    pub fn garbled_status_polls(self, n: u32) -> Self {
        #[allow(clippy::unwrap_used)]
        {
            self.state.lock().unwrap().garbled_polls = n;
        }
        self
    }

    /// Shared log of every accepted request data unit, in order.
    pub fn command_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.commands.clone()
    }

    fn stat7(state: &LaserState) -> String {
        let flags1 = state.mode
            | u8::from(state.shutter_open)
            | (u8::from(state.ready) << 2)
            | (u8::from(state.on) << 3);
        format!(
            "{flags1:02X}0000{:04X}{:02X}{:02X}00000000",
            state.quantity, state.rate_hz, state.hv_percent
        )
    }

    fn stat8(state: &LaserState) -> String {
        // No warnings, 8.25 V supply, 28/31 degrees, no energy monitor.
        format!("00004B1F1C00000000{:08X}", state.shot_counter)
    }

    fn handle(&self, data_unit: &str) -> Vec<u8> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();

        if matches!(data_unit, "h" | "j" | "u" | "z1" | "z0") && state.forbidden_budget > 0 {
            state.forbidden_budget -= 1;
            return b"\x1b\x1b4\r".to_vec();
        }

        let ack = b"\r".to_vec();
        match data_unit {
            "g" => {
                state.on = true;
                ack
            }
            "X" => {
                state.on = false;
                state.ready = false;
                state.mode = MODE_OFF;
                ack
            }
            "i" => {
                state.mode = MODE_OFF;
                ack
            }
            "h" => {
                if !state.ignore_mode_changes {
                    state.mode = MODE_REPETITION;
                }
                ack
            }
            "j" => {
                if !state.ignore_mode_changes {
                    state.mode = MODE_BURST;
                }
                ack
            }
            "u" => {
                if !state.ignore_mode_changes {
                    state.mode = MODE_EXTERNAL;
                }
                ack
            }
            "z1" => {
                state.shutter_open = true;
                ack
            }
            "z0" => {
                state.shutter_open = false;
                ack
            }
            "s" | "O60000" => ack,
            "UT" => {
                if state.garbled_polls > 0 {
                    state.garbled_polls -= 1;
                    // Framed like a reply but with a wrong checksum.
                    return b"<@!UT00\r".to_vec();
                }
                if state.on && !state.never_ready {
                    if state.polls_until_ready == 0 {
                        state.ready = true;
                    } else {
                        state.polls_until_ready -= 1;
                    }
                }
                let payload = format!("UT{}", Self::stat7(&state));
                telegram::construct_reply(&payload).into_bytes()
            }
            "UU" => {
                let payload = format!("UU{}", Self::stat8(&state));
                telegram::construct_reply(&payload).into_bytes()
            }
            "W" => telegram::construct_reply("W00").into_bytes(),
            "V3" => telegram::construct_reply("V3MSG 2.16").into_bytes(),
            "US" => telegram::construct_reply("US0001703 0001704").into_bytes(),
            "UV" => telegram::construct_reply("UV000000000000").into_bytes(),
            // Two energy readings at half scale.
            "P" => telegram::construct_reply("P7D007D00").into_bytes(),
            other => {
                if let Some(quantity) = other.strip_prefix('l') {
                    state.quantity = u16::from_str_radix(quantity, 16).unwrap_or(0);
                    ack
                } else if let Some(rate) = other.strip_prefix('m') {
                    state.rate_hz = u8::from_str_radix(rate, 16).unwrap_or(0);
                    ack
                } else if let Some(hv) = other.strip_prefix('n') {
                    state.hv_percent = u8::from_str_radix(hv, 16).unwrap_or(0);
                    ack
                } else if other.starts_with("O3") || other.starts_with("O4") || other.starts_with("O5")
                {
                    ack
                } else {
                    // Unknown opcode: incorrect format.
                    b"\x1b\x1b2\r".to_vec()
                }
            }
        }
    }
}

impl Default for SimulatedLaser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimulatedLaser {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let request = String::from_utf8_lossy(bytes).into_owned();
        let response = if request.starts_with(telegram::START_REQUEST)
            && telegram::verify_fcs(&request)
            && request.len() >= 7
        {
            let data_unit = request[3..request.len() - 3].to_string();
            let response = self.handle(&data_unit);
            #[allow(clippy::unwrap_used)]
            self.commands.lock().unwrap().push(data_unit);
            response
        } else {
            // Checksum error from the controller's point of view.
            b"\x1b\x1b1\r".to_vec()
        };
        #[allow(clippy::unwrap_used)]
        self.pending.lock().unwrap().push_back(response);
        Ok(())
    }

    async fn read_until(&mut self, _terminator: u8) -> Result<Vec<u8>> {
        #[allow(clippy::unwrap_used)]
        let next = self.pending.lock().unwrap().pop_front();
        Ok(next.unwrap_or_default())
    }
}

/// Register-bus simulation for the CW laser: a plain address→value map
/// with the hardware maximum frequency preset.
pub struct SimulatedBus {
    registers: Arc<Mutex<HashMap<u8, i64>>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        let bus = Self {
            registers: Arc::new(Mutex::new(HashMap::new())),
        };
        bus.preset(0x36, 21502); // max_frequency of the bench unit
        bus
    }

    pub fn preset(&self, address: u8, value: i64) {
        #[allow(clippy::unwrap_used)]
        self.registers.lock().unwrap().insert(address, value);
    }

    /// Shared view of the register map for assertions.
    pub fn state(&self) -> Arc<Mutex<HashMap<u8, i64>>> {
        self.registers.clone()
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegisterBus for SimulatedBus {
    async fn read_raw(&mut self, address: u8, _width: RegWidth) -> Result<i64> {
        #[allow(clippy::unwrap_used)]
        let value = self.registers.lock().unwrap().get(&address).copied();
        Ok(value.unwrap_or(0))
    }

    async fn write_raw(&mut self, address: u8, _width: RegWidth, value: i64) -> Result<()> {
        self.preset(address, value);
        Ok(())
    }
}

/// Number of wavelength bins the bench spectrometer delivers.
pub const SIM_BINS: usize = 2048;

/// Spectrometer simulation: a broad fluorescence-like peak plus noise,
/// delivered after the configured integration time.
pub struct SimulatedSpectrometer {
    wavelengths: Vec<f64>,
    integration_time: Duration,
    configured: bool,
}

impl SimulatedSpectrometer {
    pub fn new() -> Self {
        // Bench unit covers roughly 285..1149 nm over 2048 bins.
        let wavelengths = (0..SIM_BINS)
            .map(|i| 285.24 + i as f64 * (1149.48 - 285.24) / (SIM_BINS - 1) as f64)
            .collect();
        Self {
            wavelengths,
            integration_time: Duration::from_millis(100),
            configured: false,
        }
    }
}

impl Default for SimulatedSpectrometer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Spectrometer for SimulatedSpectrometer {
    async fn configure(
        &mut self,
        integration_time: Duration,
        _averaging: u32,
        _smoothing: u32,
        _timing_mode: u32,
    ) -> Result<()> {
        self.integration_time = integration_time;
        self.configured = true;
        // The real driver performs a throwaway acquisition on setup.
        tokio::time::sleep(integration_time).await;
        Ok(())
    }

    fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    async fn read_spectrum(&mut self) -> Result<Vec<f64>> {
        if !self.configured {
            return Err(RigError::Instrument(
                "spectrometer read before configure".to_string(),
            ));
        }
        tokio::time::sleep(self.integration_time).await;
        let mut rng = rand::thread_rng();
        let spectrum = self
            .wavelengths
            .iter()
            .map(|wl| {
                let peak = 4000.0 * (-((wl - 520.0) / 40.0).powi(2)).exp();
                peak + rng.gen_range(0.0..50.0)
            })
            .collect();
        Ok(spectrum)
    }

    async fn reset(&mut self) -> Result<()> {
        self.configured = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_corrupted_requests() {
        let mut sim = SimulatedLaser::new();
        sim.write_all(b"#!@g00\r").await.unwrap();
        assert_eq!(sim.read_until(b'\r').await.unwrap(), b"\x1b\x1b1\r");
    }

    #[tokio::test]
    async fn unknown_opcode_is_incorrect_format() {
        let mut sim = SimulatedLaser::new();
        let request = telegram::construct_request("qq");
        sim.write_all(request.as_bytes()).await.unwrap();
        assert_eq!(sim.read_until(b'\r').await.unwrap(), b"\x1b\x1b2\r");
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_spectrum_has_expected_shape() {
        let mut spec = SimulatedSpectrometer::new();
        spec.configure(Duration::from_millis(10), 1, 0, 1)
            .await
            .unwrap();
        let spectrum = spec.read_spectrum().await.unwrap();
        assert_eq!(spectrum.len(), SIM_BINS);
        assert_eq!(spec.wavelengths().len(), SIM_BINS);
        // Peak near 520 nm clearly above the noise floor.
        let (peak_idx, _) = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        let peak_wl = spec.wavelengths()[peak_idx];
        assert!((peak_wl - 520.0).abs() < 20.0, "peak at {peak_wl}");
    }
}
