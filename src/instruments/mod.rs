//! Instrument drivers.
//!
//! Each driver owns exactly one device link and exposes the operations the
//! orchestrator needs, nothing more. Shared access (the status watchdog and
//! the capture loop both talk to the pulsed laser) happens above this layer
//! through `Arc<tokio::sync::Mutex<_>>` handles owned by the orchestrator.

pub mod camera;
pub mod cw_laser;
pub mod pulsed_laser;
pub mod sim;
pub mod spectrometer;
pub mod trigger_board;

pub use cw_laser::{CwLaser, RegisterBus};
pub use pulsed_laser::PulsedLaser;
pub use spectrometer::Spectrometer;
pub use trigger_board::TriggerBoard;
