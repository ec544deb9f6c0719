//! Pure decoding of the pulsed-laser status payloads.
//!
//! The controller reports its state over two fixed queries: `UT` (Stat7,
//! flags and presets) and `UU` (Stat8, health and counters). Both payloads
//! are strings of fixed-width uppercase hex fields at documented byte
//! offsets. Decoding performs no I/O; a fresh [`LaserStatus`] snapshot is
//! produced on every query.

use crate::error::{ProtocolErrorKind, Result};

/// Mask selecting the mode bits (4..=7) of flags byte 1.
const MODE_MASK: u8 = 0xF0;

const FLAG1_SHUTTER_OPEN: u8 = 1;
const FLAG1_LASER_READY: u8 = 1 << 2;
const FLAG1_LASER_ON: u8 = 1 << 3;

/// Raw energy counts scale to microjoule: 64000 counts = 250 uJ.
pub(crate) const ENERGY_FULL_SCALE_COUNTS: f64 = 64_000.0;
pub(crate) const ENERGY_FULL_SCALE_UJ: f64 = 250.0;

/// Operating mode of the pulsed laser, held in bits 4..=7 of flags1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaserMode {
    Off,
    Repetition,
    Burst,
    ExternalTrigger,
}

impl LaserMode {
    /// Extract the mode from flags byte 1. Undocumented bit patterns are
    /// reported as OFF; the state machine re-checks after every transition
    /// so a misdecoded mode surfaces as a failed post-condition.
    pub fn from_flags(flags1: u8) -> Self {
        match flags1 & MODE_MASK {
            0x10 => Self::Repetition,
            0x20 => Self::Burst,
            0x40 => Self::ExternalTrigger,
            _ => Self::Off,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Repetition => "REPETITION",
            Self::Burst => "BURST",
            Self::ExternalTrigger => "EXTERNAL_TRIGGER",
        }
    }
}

/// Warning and error bits of Stat8 flags bytes 4 and 5.
const FLAGS4_BITS: [(u8, &str); 7] = [
    (1, "static error"),
    (1 << 1, "enclosure open"),
    (1 << 2, "remote interlock open"),
    (1 << 3, "temperature limit"),
    (1 << 4, "temperature warning 1"),
    (1 << 5, "temperature warning 2"),
    (1 << 6, "PEM error"),
];

const FLAGS5_BITS: [(u8, &str); 6] = [
    (1, "operation error"),
    (1 << 3, "HV supply error"),
    (1 << 4, "temperature error 1"),
    (1 << 5, "temperature error 2"),
    (1 << 6, "power switch error"),
    (1 << 7, "power supply weak"),
];

/// Immutable snapshot of the pulsed-laser state, assembled from one Stat7
/// and one Stat8 reply.
#[derive(Debug, Clone, PartialEq)]
pub struct LaserStatus {
    pub mode: LaserMode,
    pub shutter_open: bool,
    pub ready: bool,
    pub on: bool,
    /// Supply voltage in volt.
    pub supply_voltage: f64,
    pub temp1: f64,
    pub temp2: f64,
    /// Average pulse energy in microjoule. Zero when the laser has no
    /// energy monitor fitted.
    pub energy_uj: f64,
    pub quantity_counter: u32,
    pub shot_counter: u32,
    pub quantity_preset: Option<u16>,
    pub frequency_preset: Option<u8>,
    pub hv_percent: Option<u8>,
    /// Active warning/error conditions decoded from flags4/flags5.
    pub warnings: Vec<&'static str>,
}

impl LaserStatus {
    /// Decode the two status payloads (data units with the `UT`/`UU` echo
    /// already stripped) into one snapshot.
    pub fn from_payloads(stat7: &str, stat8: &str) -> Result<Self> {
        if stat7.len() < 22 {
            return Err(
                ProtocolErrorKind::MalformedReply("Stat7 data length insufficient".into()).into(),
            );
        }
        if stat8.len() < 26 {
            return Err(
                ProtocolErrorKind::MalformedReply("Stat8 data length insufficient".into()).into(),
            );
        }

        let flags1 = hex_field(stat7, 0, 2)? as u8;
        let quantity_preset = hex_field(stat7, 6, 10)? as u16;
        let frequency_preset = hex_field(stat7, 10, 12)? as u8;
        let hv_percent = hex_field(stat7, 12, 14)? as u8;

        let flags4 = hex_field(stat8, 0, 2)? as u8;
        let flags5 = hex_field(stat8, 2, 4)? as u8;
        let supply_voltage = hex_field(stat8, 4, 6)? as f64 * 0.11;
        // Per protocol, [6..8] is temperature 2 and [8..10] temperature 1.
        let temp2 = hex_field(stat8, 6, 8)? as f64;
        let temp1 = hex_field(stat8, 8, 10)? as f64;
        let energy_raw = hex_field(stat8, 10, 14)? as f64;
        let energy_uj = energy_raw / ENERGY_FULL_SCALE_COUNTS * ENERGY_FULL_SCALE_UJ;
        let quantity_counter = hex_field(stat8, 14, 18)? as u32;
        let shot_counter = hex_field(stat8, 18, 26)? as u32;

        let mut warnings = Vec::new();
        for (bit, name) in FLAGS4_BITS {
            if flags4 & bit != 0 {
                warnings.push(name);
            }
        }
        for (bit, name) in FLAGS5_BITS {
            if flags5 & bit != 0 {
                warnings.push(name);
            }
        }

        Ok(Self {
            mode: LaserMode::from_flags(flags1),
            shutter_open: flags1 & FLAG1_SHUTTER_OPEN != 0,
            ready: flags1 & FLAG1_LASER_READY != 0,
            on: flags1 & FLAG1_LASER_ON != 0,
            supply_voltage,
            temp1,
            temp2,
            energy_uj,
            quantity_counter,
            shot_counter,
            quantity_preset: Some(quantity_preset),
            frequency_preset: Some(frequency_preset),
            hv_percent: Some(hv_percent),
            warnings,
        })
    }
}

impl std::fmt::Display for LaserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Laser Mode: {}", self.mode.name())?;
        writeln!(
            f,
            "Shutter: {}",
            if self.shutter_open { "OPEN" } else { "CLOSED" }
        )?;
        writeln!(f, "Ready: {}", if self.ready { "YES" } else { "NO" })?;
        writeln!(f, "On: {}", if self.on { "YES" } else { "NO" })?;
        writeln!(f, "Supply Voltage: {:.1}V", self.supply_voltage)?;
        writeln!(f, "Temperature 1: {:.1}C", self.temp1)?;
        writeln!(f, "Temperature 2: {:.1}C", self.temp2)?;
        writeln!(f, "Energy: {:.2}uJ", self.energy_uj)?;
        write!(
            f,
            "Counters: quantity {}, shots {}",
            self.quantity_counter, self.shot_counter
        )?;
        if !self.warnings.is_empty() {
            write!(f, "\nWarnings/Errors: {}", self.warnings.join(", "))?;
        }
        Ok(())
    }
}

/// Parse a fixed-width hex sub-field; a non-hex field is a malformed reply.
fn hex_field(data: &str, start: usize, end: usize) -> Result<u64> {
    let field = data.get(start..end).ok_or_else(|| {
        ProtocolErrorKind::MalformedReply(format!("status field {start}..{end} missing"))
    })?;
    u64::from_str_radix(field, 16).map_err(|_| {
        ProtocolErrorKind::MalformedReply(format!("status field {start}..{end} not hex: {field:?}"))
            .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a Stat7 payload with given flags1/presets.
    fn stat7(flags1: u8, quantity: u16, frequency: u8, hv: u8) -> String {
        format!("{flags1:02X}0000{quantity:04X}{frequency:02X}{hv:02X}00000000")
    }

    /// Build a Stat8 payload.
    fn stat8(flags4: u8, flags5: u8, volt: u8, t2: u8, t1: u8, energy: u16) -> String {
        format!("{flags4:02X}{flags5:02X}{volt:02X}{t2:02X}{t1:02X}{energy:04X}00050000002A")
    }

    #[test]
    fn mode_extraction_uses_mask() {
        assert_eq!(LaserMode::from_flags(0x00), LaserMode::Off);
        assert_eq!(LaserMode::from_flags(0x1D), LaserMode::Repetition);
        assert_eq!(LaserMode::from_flags(0x2C), LaserMode::Burst);
        assert_eq!(LaserMode::from_flags(0x4D), LaserMode::ExternalTrigger);
        // Low bits never leak into the mode.
        assert_eq!(LaserMode::from_flags(0x0F), LaserMode::Off);
    }

    #[test]
    fn full_decode() {
        // Ready + on, repetition mode, shutter open.
        let s7 = stat7(0x1D, 1234, 10, 80);
        let s8 = stat8(0, 0, 100, 31, 28, 32000);
        let status = LaserStatus::from_payloads(&s7, &s8).unwrap();

        assert_eq!(status.mode, LaserMode::Repetition);
        assert!(status.shutter_open);
        assert!(status.ready);
        assert!(status.on);
        assert_eq!(status.quantity_preset, Some(1234));
        assert_eq!(status.frequency_preset, Some(10));
        assert_eq!(status.hv_percent, Some(80));
        assert!((status.supply_voltage - 100.0 * 0.11).abs() < 1e-9);
        assert_eq!(status.temp1, 28.0);
        assert_eq!(status.temp2, 31.0);
        // 32000/64000 * 250
        assert!((status.energy_uj - 125.0).abs() < 1e-9);
        assert_eq!(status.quantity_counter, 5);
        assert_eq!(status.shot_counter, 42);
        assert!(status.warnings.is_empty());
    }

    #[test]
    fn warnings_decode() {
        let s7 = stat7(0x0C, 0, 0, 0);
        let s8 = stat8(0b0000_0110, 0b1000_0001, 0, 0, 0, 0);
        let status = LaserStatus::from_payloads(&s7, &s8).unwrap();
        assert_eq!(
            status.warnings,
            vec![
                "enclosure open",
                "remote interlock open",
                "operation error",
                "power supply weak"
            ]
        );
    }

    #[test]
    fn short_payloads_are_malformed() {
        assert!(LaserStatus::from_payloads("0C", "0".repeat(26).as_str()).is_err());
        assert!(LaserStatus::from_payloads("0".repeat(22).as_str(), "00").is_err());
    }

    #[test]
    fn non_hex_field_is_malformed() {
        let s7 = "ZZ00000000000000000000".to_string();
        let s8 = "0".repeat(26);
        assert!(LaserStatus::from_payloads(&s7, &s8).is_err());
    }
}
