//! Driver for the continuous-wave fiber laser.
//!
//! The laser is controlled through numbered registers on an interbus-style
//! link. The name→address/width/access/scale table is static data owned by
//! this driver; callers only ever use register names. The bus itself is
//! behind [`RegisterBus`] so the same driver runs against real hardware or
//! the in-process simulation.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::error::{Result, RigError};

/// Raw register width on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegWidth {
    U8,
    U16,
    I16,
    U32,
}

/// Access mode of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAccess {
    Read,
    Write,
    ReadWrite,
}

impl RegAccess {
    fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// One entry of the register table. `scale` is the divisor from raw counts
/// to the base unit (e.g. raw tenths of a degree → degrees).
#[derive(Debug, Clone, Copy)]
pub struct RegisterSpec {
    pub address: u8,
    pub width: RegWidth,
    pub access: RegAccess,
    pub scale: f64,
}

const fn reg(address: u8, width: RegWidth, access: RegAccess, scale: f64) -> RegisterSpec {
    RegisterSpec {
        address,
        width,
        access,
        scale,
    }
}

static REGISTERS: Lazy<HashMap<&'static str, RegisterSpec>> = Lazy::new(|| {
    use RegAccess::{Read, ReadWrite, Write};
    use RegWidth::{I16, U16, U32, U8};
    HashMap::from([
        ("emission", reg(0x30, U8, Write, 1.0)),
        ("power", reg(0x3E, U8, Write, 1.0)),
        ("temperature", reg(0x1B, I16, Read, 10.0)),
        ("trig_level", reg(0x24, U16, Read, 1000.0)),
        ("display_backlight", reg(0x26, U16, Write, 1.0)),
        ("operating_mode", reg(0x31, U8, Write, 1.0)),
        ("interlock_status", reg(0x32, U16, ReadWrite, 1.0)),
        ("pulse_frequency", reg(0x33, U32, Write, 1.0)),
        ("pulses_per_burst", reg(0x34, U16, Write, 1.0)),
        ("watchdog_interval", reg(0x35, U8, Write, 1.0)),
        ("max_frequency", reg(0x36, U32, Read, 1.0)),
        ("status_bits", reg(0x66, U16, Read, 1.0)),
        ("optical_frequency", reg(0x71, U32, Read, 1.0)),
        ("actual_frequency", reg(0x75, U32, Read, 100.0)),
        ("calculated_power", reg(0x7A, U8, Read, 1.0)),
        ("voltage", reg(0x1A, U16, Read, 1000.0)),
    ])
});

/// Operating mode values of the `operating_mode` register.
pub const MODE_INTERNAL_TRIGGER: f64 = 0.0;
pub const MODE_EXTERNAL_TRIGGER: f64 = 4.0;

/// Raw register access to the laser, by address and width.
#[async_trait]
pub trait RegisterBus: Send {
    async fn read_raw(&mut self, address: u8, width: RegWidth) -> Result<i64>;
    async fn write_raw(&mut self, address: u8, width: RegWidth, value: i64) -> Result<()>;
}

/// One CW laser on one exclusive register bus.
pub struct CwLaser {
    bus: Box<dyn RegisterBus>,
}

impl CwLaser {
    pub fn new(bus: Box<dyn RegisterBus>) -> Self {
        Self { bus }
    }

    fn spec(name: &str) -> Result<RegisterSpec> {
        REGISTERS
            .get(name)
            .copied()
            .ok_or_else(|| RigError::Instrument(format!("unknown CW-laser register: {name}")))
    }

    /// Read a named register, scaled to its base unit.
    pub async fn read_register(&mut self, name: &str) -> Result<f64> {
        let spec = Self::spec(name)?;
        if !spec.access.readable() {
            return Err(RigError::Instrument(format!(
                "CW-laser register {name} is write-only"
            )));
        }
        let raw = self.bus.read_raw(spec.address, spec.width).await?;
        Ok(raw as f64 / spec.scale)
    }

    /// Write a named register, descaling from its base unit.
    pub async fn write_register(&mut self, name: &str, value: f64) -> Result<()> {
        let spec = Self::spec(name)?;
        if !spec.access.writable() {
            return Err(RigError::Instrument(format!(
                "CW-laser register {name} is read-only"
            )));
        }
        let raw = (value * spec.scale).round() as i64;
        debug!(register = name, value, raw, "writing CW-laser register");
        self.bus.write_raw(spec.address, spec.width, raw).await
    }

    pub async fn set_emission(&mut self, on: bool) -> Result<()> {
        self.write_register("emission", f64::from(u8::from(on)))
            .await
    }

    pub async fn set_external_trigger(&mut self) -> Result<()> {
        self.write_register("operating_mode", MODE_EXTERNAL_TRIGGER)
            .await
    }

    pub async fn set_internal_trigger(&mut self) -> Result<()> {
        self.write_register("operating_mode", MODE_INTERNAL_TRIGGER)
            .await
    }

    /// Program the pulse frequency as a percentage of the hardware maximum.
    /// Fractional percentages are allowed; the result rounds down to whole
    /// hertz.
    pub async fn set_pulse_frequency_percent(&mut self, percent: f64) -> Result<f64> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(RigError::Range {
                name: "cw intensity percent",
                value: percent as i64,
                min: 0,
                max: 100,
            });
        }
        let max = self.read_register("max_frequency").await?;
        let freq = (max / 100.0 * percent).floor();
        self.write_register("pulse_frequency", freq).await?;
        info!(percent, freq, max, "CW pulse frequency programmed");
        Ok(freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::sim::SimulatedBus;

    #[tokio::test]
    async fn scaled_read() {
        let mut bus = SimulatedBus::new();
        bus.preset(0x1B, 253); // 25.3 degrees in raw tenths
        let mut laser = CwLaser::new(Box::new(bus));
        let temp = laser.read_register("temperature").await.unwrap();
        assert!((temp - 25.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn write_only_register_rejects_reads() {
        let mut laser = CwLaser::new(Box::new(SimulatedBus::new()));
        assert!(laser.read_register("emission").await.is_err());
        assert!(laser.write_register("max_frequency", 1.0).await.is_err());
        assert!(laser.read_register("no_such_register").await.is_err());
    }

    #[tokio::test]
    async fn pulse_frequency_is_percent_of_maximum() {
        let mut bus = SimulatedBus::new();
        bus.preset(0x36, 21502);
        let state = bus.state();
        let mut laser = CwLaser::new(Box::new(bus));

        let freq = laser.set_pulse_frequency_percent(50.0).await.unwrap();
        assert!((freq - 10751.0).abs() < 1e-9);
        assert_eq!(state.lock().unwrap().get(&0x33), Some(&10751));
    }

    #[tokio::test]
    async fn percent_out_of_range() {
        let mut laser = CwLaser::new(Box::new(SimulatedBus::new()));
        assert!(matches!(
            laser.set_pulse_frequency_percent(101.0).await,
            Err(RigError::Range { .. })
        ));
    }
}
