//! Spectrometer session interface.
//!
//! The vendor driver lives outside this crate; the orchestrator only needs
//! the narrow session contract below. `configure` is expected to perform a
//! throwaway acquisition (the first read after changing the integration
//! time is unreliable), so bring-up can take a while.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// One spectrometer session.
#[async_trait]
pub trait Spectrometer: Send {
    /// Program acquisition parameters and prime the device.
    async fn configure(
        &mut self,
        integration_time: Duration,
        averaging: u32,
        smoothing: u32,
        timing_mode: u32,
    ) -> Result<()>;

    /// The fixed wavelength axis, one entry per bin.
    fn wavelengths(&self) -> &[f64];

    /// Acquire one spectrum, blocking for the integration time.
    async fn read_spectrum(&mut self) -> Result<Vec<f64>>;

    /// Release the device session.
    async fn reset(&mut self) -> Result<()>;
}
