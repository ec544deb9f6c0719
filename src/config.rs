//! Run configuration.
//!
//! Settings are loaded once from a TOML file (plus `SPECTRIG_*` environment
//! overrides), validated, and passed by reference into each component. No
//! component mutates configuration at runtime; everything that varies over
//! a run does so through the gradient plan.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, RigError};
use crate::gradient::{GradientPlan, ParamSpec};
use crate::hardware::LinkConfig;

/// Spectrometer acquisition parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectoSettings {
    pub integration_time_ms: u64,
    pub scan_avg: u32,
    pub smooth: u32,
    pub x_timing: u32,
    #[serde(default)]
    pub amplification: bool,
}

/// Excitation and capture-loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserSettings {
    /// Spectrometer reads per gradient.
    pub repetitions: u32,
    /// Pause after each read, in milliseconds.
    pub measurement_delay_ms: u64,
    /// Pulsed capture only: how long the sample is irradiated before the
    /// read. The firmware cannot keep up below 3 ms.
    pub irradiation_time_ms: u64,
    /// Settle delay after each firmware write. Also minimum 3 ms.
    pub serial_delay_ms: u64,
    /// Continuous capture (excitation stays on for the whole gradient)
    /// versus pulsed capture (toggled per repetition).
    pub continuous: bool,

    pub pwm_freq_405: ParamSpec,
    pub pwm_res_bits_405: ParamSpec,
    /// Duty cycle as a fraction 0..=1, converted to counts at the
    /// programmed resolution.
    pub pwm_duty_405: ParamSpec,
    pub pwm_freq_445: ParamSpec,
    pub pwm_res_bits_445: ParamSpec,
    pub pwm_duty_445: ParamSpec,
    pub cw_intensity_percent: ParamSpec,
    pub hv_percent: ParamSpec,
    pub pulse_rate_hz: ParamSpec,
}

/// Camera sidecar endpoint, optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    pub program: String,
    pub device: String,
}

/// Device link endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    pub firmware: LinkConfig,
    pub pulsed_laser: LinkConfig,
    pub cw_laser: LinkConfig,
    #[serde(default)]
    pub camera: Option<CameraSettings>,
}

fn default_hv_percent_max() -> u8 {
    100
}

/// The full, immutable run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Name of the measurement series; becomes part of the output path.
    pub run_name: String,
    /// Unique output names per run; otherwise a fixed name is overwritten.
    #[serde(default)]
    pub unique: bool,
    /// Wall-clock budget per gradient, in seconds. Exceeding it truncates
    /// the remaining repetitions of that gradient only.
    pub timeout_secs: u64,
    /// Extra slack added to the firmware watchdog delay, in milliseconds.
    pub watchdog_grace_ms: u64,
    /// Upper bound accepted by the HV setter. The controller takes 0..=100;
    /// a site may restrict this further.
    #[serde(default = "default_hv_percent_max")]
    pub hv_percent_max: u8,
    pub specto: SpectoSettings,
    pub laser: LaserSettings,
    pub links: LinkSettings,
}

impl Settings {
    /// Load from a TOML file with `SPECTRIG_*` environment overrides
    /// (e.g. `SPECTRIG_LASER__REPETITIONS=5`), then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let settings: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("SPECTRIG").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Semantic checks beyond what deserialization enforces. Also resolves
    /// the gradient plan once, so broadcast errors surface at load time.
    pub fn validate(&self) -> Result<()> {
        if self.hv_percent_max > 100 {
            return Err(RigError::Configuration(format!(
                "hv_percent_max is {}, the controller accepts at most 100",
                self.hv_percent_max
            )));
        }
        if self.laser.repetitions == 0 {
            return Err(RigError::Configuration(
                "repetitions must be at least 1".to_string(),
            ));
        }
        if self.laser.serial_delay_ms < 3 {
            return Err(RigError::Configuration(
                "serial_delay_ms below 3 ms outruns the firmware".to_string(),
            ));
        }
        if !self.laser.continuous && self.laser.irradiation_time_ms < 3 {
            return Err(RigError::Configuration(
                "irradiation_time_ms below 3 ms outruns the firmware".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(RigError::Configuration(
                "timeout_secs must be positive".to_string(),
            ));
        }

        let plan = GradientPlan::from_settings(&self.laser)?;
        for (index, params) in plan.iter().enumerate() {
            if !(0.0..=1.0).contains(&params.pwm_duty_405)
                || !(0.0..=1.0).contains(&params.pwm_duty_445)
            {
                return Err(RigError::Configuration(format!(
                    "gradient {index}: PWM duty cycles must be fractions in 0..=1"
                )));
            }
            // The board's PWM peripheral supports at most 20-bit resolution.
            for (name, bits) in [
                ("pwm_res_bits_405", params.pwm_res_bits_405),
                ("pwm_res_bits_445", params.pwm_res_bits_445),
            ] {
                if !(1.0..=20.0).contains(&bits) || bits.fract() != 0.0 {
                    return Err(RigError::Configuration(format!(
                        "gradient {index}: {name} must be a whole number of bits in 1..=20"
                    )));
                }
            }
            if !(0.0..=100.0).contains(&params.cw_intensity_percent) {
                return Err(RigError::Configuration(format!(
                    "gradient {index}: cw_intensity_percent outside 0..=100"
                )));
            }
            if params.hv_percent < 0.0 || params.hv_percent > f64::from(self.hv_percent_max) {
                return Err(RigError::Configuration(format!(
                    "gradient {index}: hv_percent outside 0..={}",
                    self.hv_percent_max
                )));
            }
        }
        Ok(())
    }

    /// Firmware watchdog delay: the longest legitimate gap between
    /// keep-alives, plus the configured grace.
    pub fn watchdog_delay_ms(&self) -> i64 {
        let pulsed_extra = if self.laser.continuous {
            0
        } else {
            self.laser.irradiation_time_ms + 2 * self.laser.serial_delay_ms
        };
        (self.laser.measurement_delay_ms
            + pulsed_extra
            + self.specto.integration_time_ms
            + self.watchdog_grace_ms) as i64
    }

    /// Cadence at which the keep-alive task feeds the firmware watchdog.
    pub fn keep_alive_cadence(&self) -> Duration {
        Duration::from_millis(self.specto.integration_time_ms + self.laser.measurement_delay_ms)
    }

    /// Rough wall-clock estimate of the whole run, used to pick the backup
    /// cadence.
    pub fn estimated_run_duration(&self, num_gradients: usize) -> Duration {
        let pulsed_extra = if self.laser.continuous {
            0
        } else {
            self.laser.irradiation_time_ms + 2 * self.laser.serial_delay_ms
        };
        let per_repetition_ms =
            self.laser.measurement_delay_ms + pulsed_extra + self.specto.integration_time_ms;
        Duration::from_millis(
            per_repetition_ms * u64::from(self.laser.repetitions) * num_gradients as u64,
        )
    }

    pub fn integration_time(&self) -> Duration {
        Duration::from_millis(self.specto.integration_time_ms)
    }

    pub fn measurement_delay(&self) -> Duration {
        Duration::from_millis(self.laser.measurement_delay_ms)
    }

    pub fn irradiation_time(&self) -> Duration {
        Duration::from_millis(self.laser.irradiation_time_ms)
    }

    pub fn serial_delay(&self) -> Duration {
        Duration::from_millis(self.laser.serial_delay_ms)
    }

    pub fn gradient_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Write the exact settings of this run next to its data.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| RigError::Configuration(format!("failed to serialize settings: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        run_name: "bench-test".to_string(),
        unique: true,
        timeout_secs: 600,
        watchdog_grace_ms: 2000,
        hv_percent_max: 100,
        specto: SpectoSettings {
            integration_time_ms: 100,
            scan_avg: 1,
            smooth: 0,
            x_timing: 1,
            amplification: false,
        },
        laser: LaserSettings {
            repetitions: 10,
            measurement_delay_ms: 100,
            irradiation_time_ms: 5,
            serial_delay_ms: 3,
            continuous: false,
            pwm_freq_405: 1000.0.into(),
            pwm_res_bits_405: 10.0.into(),
            pwm_duty_405: 0.5.into(),
            pwm_freq_445: 1000.0.into(),
            pwm_res_bits_445: 10.0.into(),
            pwm_duty_445: 0.5.into(),
            cw_intensity_percent: 50.0.into(),
            hv_percent: 60.0.into(),
            pulse_rate_hz: 15.0.into(),
        },
        links: LinkSettings {
            firmware: LinkConfig::simulated(),
            pulsed_laser: LinkConfig::simulated(),
            cw_laser: LinkConfig::simulated(),
            camera: None,
        },
    }
}
