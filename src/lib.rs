//! Core library for the spectrig acquisition system.
//!
//! This crate drives a pulsed-laser fluorescence spectroscopy rig: a
//! checksummed request/reply telegram protocol for the pulsed laser, a
//! register interface for the continuous-wave laser, a firmware trigger/LED
//! board, a spectrometer and an out-of-process camera, all coordinated by a
//! measurement orchestrator with watchdog keep-alives and guaranteed safe
//! shutdown.

pub mod config;
pub mod data;
pub mod error;
pub mod gradient;
pub mod hardware;
pub mod instruments;
pub mod measurement;
pub mod protocol;

pub use error::{Result, RigError};
