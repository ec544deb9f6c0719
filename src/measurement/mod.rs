//! Acquisition orchestrator.
//!
//! Owns the end-to-end measurement lifecycle: BRINGUP → per-gradient
//! programming and capture → SHUTDOWN, with an abort edge from anywhere
//! into shutdown. All device handles are owned here; the background tasks
//! (firmware keep-alive, pulsed-laser status watchdog, periodic backup)
//! get shared handles behind async mutexes and are forcibly aborted before
//! shutdown runs, so a racing keep-alive can never re-arm a device the
//! shutdown just disabled.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::try_join;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::data::{backup, SpectrumBuffer};
use crate::error::{Result, RigError, RunPhase};
use crate::gradient::{GradientParams, GradientPlan};
use crate::hardware::LinkConfig;
use crate::instruments::camera::CameraSidecar;
use crate::instruments::sim::{SimulatedBus, SimulatedLaser, SimulatedSpectrometer};
use crate::instruments::trigger_board::{self, duty_counts};
use crate::instruments::{CwLaser, PulsedLaser, Spectrometer, TriggerBoard};
use crate::protocol::TelegramEngine;

/// Cadence of the pulsed-laser status watchdog.
const STATUS_WATCHDOG_CADENCE: Duration = Duration::from_secs(5);
/// Bounded join after aborting a background task.
const TASK_JOIN_GRACE: Duration = Duration::from_secs(1);

/// All device handles of one run. Each device is owned exactly once; the
/// async mutexes exist for the background tasks, not for contention.
pub struct Devices {
    pub spectrometer: Box<dyn Spectrometer>,
    pub trigger: Arc<Mutex<TriggerBoard>>,
    pub cw_laser: Arc<Mutex<CwLaser>>,
    pub pulsed_laser: Arc<Mutex<PulsedLaser>>,
    pub camera: Option<CameraSidecar>,
}

impl Devices {
    /// Open every device link named in the settings. The spectrometer and
    /// the CW-laser bus have vendor drivers outside this crate; their real
    /// variants are wired up by the binary that embeds them.
    pub fn connect(settings: &Settings) -> Result<Self> {
        let trigger_link = Self::open_transport(&settings.links.firmware, "firmware")?;
        let trigger = TriggerBoard::new(trigger_link, settings.serial_delay());

        let pulsed_link: Box<dyn crate::hardware::Transport> =
            match &settings.links.pulsed_laser {
                LinkConfig::Simulated => Box::new(SimulatedLaser::new().ready_after_polls(2)),
                #[cfg(feature = "instrument_serial")]
                LinkConfig::Real { port, baud_rate } => Box::new(
                    crate::hardware::serial_link::SerialLink::open(
                        port,
                        *baud_rate,
                        Duration::from_secs(5),
                    )?,
                ),
                #[cfg(not(feature = "instrument_serial"))]
                LinkConfig::Real { .. } => {
                    return Err(RigError::Configuration(
                        "built without serial support".to_string(),
                    ))
                }
            };
        let pulsed_laser = PulsedLaser::new(
            TelegramEngine::new(pulsed_link),
            settings.hv_percent_max,
        );

        let cw_laser = match &settings.links.cw_laser {
            LinkConfig::Simulated => CwLaser::new(Box::new(SimulatedBus::new())),
            LinkConfig::Real { port, .. } => {
                return Err(RigError::Configuration(format!(
                    "CW-laser bus on {port} needs the vendor interbus driver; \
                     use a simulated link in this build"
                )))
            }
        };

        let camera = settings
            .links
            .camera
            .as_ref()
            .map(|cam| CameraSidecar::new(&cam.program, &cam.device));

        Ok(Self {
            spectrometer: Box::new(SimulatedSpectrometer::new()),
            trigger: Arc::new(Mutex::new(trigger)),
            cw_laser: Arc::new(Mutex::new(cw_laser)),
            pulsed_laser: Arc::new(Mutex::new(pulsed_laser)),
            camera,
        })
    }

    fn open_transport(
        link: &LinkConfig,
        name: &str,
    ) -> Result<Box<dyn crate::hardware::Transport>> {
        match link {
            // The simulated firmware accepts everything and stays silent.
            LinkConfig::Simulated => {
                tracing::debug!(name, "using simulated link");
                Ok(Box::new(crate::hardware::mock::MockLink::with_replies(
                    vec![],
                )))
            }
            #[cfg(feature = "instrument_serial")]
            LinkConfig::Real { port, baud_rate } => {
                Ok(Box::new(crate::hardware::serial_link::SerialLink::open(
                    port,
                    *baud_rate,
                    Duration::from_secs(5),
                )?))
            }
            #[cfg(not(feature = "instrument_serial"))]
            LinkConfig::Real { .. } => Err(RigError::Configuration(format!(
                "{name} link: built without serial support"
            ))),
        }
    }
}

/// One measurement run.
pub struct MeasurementRun {
    settings: Settings,
    plan: GradientPlan,
    devices: Devices,
    run_dir: PathBuf,
    buffer: Option<Arc<SpectrumBuffer>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: Arc<Notify>,
    shutdown_done: bool,
}

impl MeasurementRun {
    pub fn new(settings: Settings, devices: Devices, run_dir: PathBuf) -> Result<Self> {
        let plan = GradientPlan::from_settings(&settings.laser)?;
        Ok(Self {
            settings,
            plan,
            devices,
            run_dir,
            buffer: None,
            tasks: Vec::new(),
            cancel: Arc::new(Notify::new()),
            shutdown_done: false,
        })
    }

    /// Handle for requesting cancellation from outside (signal handler,
    /// operator UI). The run aborts into shutdown at the next await point.
    pub fn cancel_handle(&self) -> Arc<Notify> {
        self.cancel.clone()
    }

    /// The acquired data, available once bring-up has completed. Remains
    /// valid after a failed run; everything committed before the failure
    /// is retrievable.
    pub fn data(&self) -> Option<Arc<SpectrumBuffer>> {
        self.buffer.clone()
    }

    /// Execute the whole run. Shutdown executes exactly once on every
    /// path: completion, failure and cancellation.
    pub async fn run(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            result = self.execute_phases() => result,
            () = cancel.notified() => {
                warn!("cancellation requested, aborting into shutdown");
                Err(RigError::Instrument("run cancelled".to_string())
                    .in_phase(RunPhase::Capture))
            }
        };

        if let Err(e) = &outcome {
            error!("run failed: {e}");
        }

        self.abort_background_tasks().await;
        self.shutdown().await;

        if let Some(buffer) = &self.buffer {
            buffer.signal_done();
        }
        outcome
    }

    async fn execute_phases(&mut self) -> Result<()> {
        self.bringup()
            .await
            .map_err(|e| e.in_phase(RunPhase::Bringup))?;
        self.spawn_watchdogs();

        for index in 0..self.plan.num_gradients() {
            self.program_gradient(index)
                .await
                .map_err(|e| e.in_phase(RunPhase::GradientSetup))?;
            self.capture_gradient(index)
                .await
                .map_err(|e| e.in_phase(RunPhase::Capture))?;
        }
        info!("all gradients captured");
        Ok(())
    }

    /// BRINGUP: spectrometer, firmware board and CW laser have no ordering
    /// constraints and come up concurrently; the pulsed laser follows
    /// sequentially because its turn-on poll blocks for the warm-up.
    async fn bringup(&mut self) -> Result<()> {
        info!("bring-up started");

        if let Some(camera) = &mut self.devices.camera {
            camera.start_recording(&self.run_dir.join("video")).await?;
        }

        let spectrometer = &mut self.devices.spectrometer;
        let trigger = self.devices.trigger.clone();
        let cw = self.devices.cw_laser.clone();
        let integration = self.settings.integration_time();
        let specto = self.settings.specto.clone();

        try_join!(
            async move {
                spectrometer
                    .configure(integration, specto.scan_avg, specto.smooth, specto.x_timing)
                    .await
            },
            async {
                let mut trigger = trigger.lock().await;
                trigger.disable_outputs().await?;
                trigger.led_green().await
            },
            async {
                // Emission stays off until capture starts.
                cw.lock().await.set_emission(false).await
            },
        )?;

        {
            let mut laser = self.devices.pulsed_laser.lock().await;
            laser.turn_off().await?;
            laser.turn_on().await?;
            laser.activate_external_trigger().await?;
        }

        let wavelengths = self.devices.spectrometer.wavelengths().to_vec();
        self.buffer = Some(Arc::new(SpectrumBuffer::new(
            self.plan.num_gradients(),
            self.settings.laser.repetitions as usize,
            wavelengths,
        )));

        info!("bring-up complete");
        Ok(())
    }

    /// Background tasks for the lifetime of the gradient loop. Advisory
    /// only: they never write to the buffer and are aborted, not joined,
    /// when the run leaves the capture phase.
    fn spawn_watchdogs(&mut self) {
        let laser = self.devices.pulsed_laser.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(STATUS_WATCHDOG_CADENCE).await;
                match laser.lock().await.status().await {
                    Ok(status) if status.warnings.is_empty() => {
                        tracing::debug!(mode = status.mode.name(), "laser status ok");
                    }
                    Ok(status) => {
                        warn!(warnings = ?status.warnings, "laser reports warnings");
                    }
                    Err(e) => warn!("laser status watchdog query failed: {e}"),
                }
            }
        }));

        if let Some(buffer) = &self.buffer {
            let estimate = self
                .settings
                .estimated_run_duration(self.plan.num_gradients());
            self.tasks.push(tokio::spawn(backup::run(
                buffer.clone(),
                self.run_dir.join("backup.csv"),
                backup::cadence(estimate),
            )));
        }
    }

    /// GRADIENT_SETUP: program firmware, CW laser and pulsed laser for one
    /// parameter set.
    async fn program_gradient(&mut self, index: usize) -> Result<()> {
        let params = self
            .plan
            .get(index)
            .ok_or_else(|| RigError::Instrument(format!("no gradient {index} in plan")))?
            .clone();
        info!(gradient = index, "programming devices");

        self.program_firmware(&params).await?;

        {
            let mut cw = self.devices.cw_laser.lock().await;
            cw.set_pulse_frequency_percent(params.cw_intensity_percent)
                .await?;
            cw.set_external_trigger().await?;
        }

        self.devices
            .pulsed_laser
            .lock()
            .await
            .set_hv_percent(params.hv_percent as u8)
            .await?;
        Ok(())
    }

    async fn program_firmware(&mut self, params: &GradientParams) -> Result<()> {
        use trigger_board::{
            VAR_CONTINUOUS, VAR_DUTY_405, VAR_DUTY_445, VAR_FREQ_405, VAR_FREQ_445,
            VAR_PULSE_RATE, VAR_RES_405, VAR_RES_445, VAR_WATCHDOG_DELAY,
        };

        let mut trigger = self.devices.trigger.lock().await;
        trigger
            .set_variable(
                VAR_DUTY_405,
                duty_counts(params.pwm_duty_405, params.pwm_res_bits_405 as u32),
            )
            .await?;
        trigger
            .set_variable(
                VAR_DUTY_445,
                duty_counts(params.pwm_duty_445, params.pwm_res_bits_445 as u32),
            )
            .await?;
        trigger
            .set_variable(VAR_FREQ_405, params.pwm_freq_405 as i64)
            .await?;
        trigger
            .set_variable(VAR_FREQ_445, params.pwm_freq_445 as i64)
            .await?;
        trigger
            .set_variable(VAR_RES_405, params.pwm_res_bits_405 as i64)
            .await?;
        trigger
            .set_variable(VAR_RES_445, params.pwm_res_bits_445 as i64)
            .await?;
        trigger
            .set_variable(VAR_PULSE_RATE, params.pulse_rate_hz as i64)
            .await?;
        trigger
            .set_variable(VAR_CONTINUOUS, i64::from(self.settings.laser.continuous))
            .await?;
        trigger
            .set_variable(VAR_WATCHDOG_DELAY, self.settings.watchdog_delay_ms())
            .await?;
        Ok(())
    }

    /// CAPTURE: one gradient's repetition loop, bounded by the wall-clock
    /// timeout. Exceeding the timeout truncates the remaining repetitions
    /// of this gradient only.
    async fn capture_gradient(&mut self, index: usize) -> Result<()> {
        let buffer = self
            .buffer
            .clone()
            .ok_or_else(|| RigError::Instrument("capture before bring-up".to_string()))?;
        buffer.begin_gradient(index)?;

        self.devices.trigger.lock().await.led_red().await?;
        // Emission must be on before the board may trigger the CW laser.
        self.devices.cw_laser.lock().await.set_emission(true).await?;

        let committed = if self.settings.laser.continuous {
            self.capture_continuous(&buffer).await?
        } else {
            self.capture_pulsed(&buffer).await?
        };
        info!(gradient = index, committed, "gradient finished");
        Ok(())
    }

    /// Continuous capture: excitation stays on for the whole repetition
    /// count while a keep-alive task feeds the firmware dead-man's switch.
    async fn capture_continuous(&mut self, buffer: &SpectrumBuffer) -> Result<usize> {
        let keep_alive = {
            let trigger = self.devices.trigger.clone();
            let cadence = self.settings.keep_alive_cadence();
            // Abort-on-drop: if cancellation drops this capture future, the
            // keep-alive must die with it and never race the shutdown.
            AbortOnDrop::new(tokio::spawn(async move {
                loop {
                    if let Err(e) = trigger.lock().await.keep_alive().await {
                        warn!("keep-alive send failed: {e}");
                    }
                    tokio::time::sleep(cadence).await;
                }
            }))
        };

        let result = async {
            self.devices.trigger.lock().await.enable_outputs().await?;
            info!("excitation on, capturing");

            let timeout = self.settings.gradient_timeout();
            let delay = self.settings.measurement_delay();
            let started = tokio::time::Instant::now();
            let mut committed = 0;
            for repetition in 0..self.settings.laser.repetitions as usize {
                let spectrum = self.devices.spectrometer.read_spectrum().await?;
                let timestamp = unix_seconds();
                tokio::time::sleep(delay).await;
                buffer.commit(repetition, &spectrum, timestamp)?;
                committed += 1;
                if started.elapsed() >= timeout {
                    info!(repetition, "gradient timeout reached, truncating");
                    break;
                }
            }

            self.devices.trigger.lock().await.disable_outputs().await?;
            Ok(committed)
        }
        .await;

        keep_alive.stop().await;
        result
    }

    /// Pulsed capture: excitation is toggled around every single read.
    async fn capture_pulsed(&mut self, buffer: &SpectrumBuffer) -> Result<usize> {
        let timeout = self.settings.gradient_timeout();
        let delay = self.settings.measurement_delay();
        let irradiation = self.settings.irradiation_time();
        let started = tokio::time::Instant::now();
        let mut committed = 0;

        for repetition in 0..self.settings.laser.repetitions as usize {
            self.devices.trigger.lock().await.enable_outputs().await?;
            tokio::time::sleep(irradiation).await;
            let spectrum = self.devices.spectrometer.read_spectrum().await?;
            let timestamp = unix_seconds();
            self.devices.trigger.lock().await.disable_outputs().await?;
            tokio::time::sleep(delay).await;
            buffer.commit(repetition, &spectrum, timestamp)?;
            committed += 1;
            if started.elapsed() >= timeout {
                info!(repetition, "gradient timeout reached, truncating");
                break;
            }
        }
        Ok(committed)
    }

    /// Forcibly terminate every background task, with a bounded join. Must
    /// complete before shutdown so no keep-alive races the disable
    /// commands.
    async fn abort_background_tasks(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(TASK_JOIN_GRACE, task).await;
        }
    }

    /// SHUTDOWN: safe every device, exactly once, best effort. Each step
    /// runs regardless of earlier step failures; one broken device must
    /// not keep the others armed.
    async fn shutdown(&mut self) {
        if self.shutdown_done {
            return;
        }
        self.shutdown_done = true;
        info!("shutting down all devices");

        if let Err(e) = self.devices.trigger.lock().await.disable_outputs().await {
            warn!("shutdown: disabling trigger outputs failed: {e}");
        }
        if let Err(e) = self.devices.pulsed_laser.lock().await.stop_operation().await {
            warn!("shutdown: stopping pulsed laser failed: {e}");
        }
        {
            let mut cw = self.devices.cw_laser.lock().await;
            if let Err(e) = cw.set_emission(false).await {
                warn!("shutdown: disabling CW emission failed: {e}");
            }
            // Allow manual triggering again and drop the power to the
            // minimum before handing the laser back.
            if let Err(e) = cw.write_register("power", 1.0).await {
                warn!("shutdown: lowering CW power failed: {e}");
            }
            if let Err(e) = cw.set_internal_trigger().await {
                warn!("shutdown: restoring CW internal trigger failed: {e}");
            }
        }
        if let Err(e) = self.devices.spectrometer.reset().await {
            warn!("shutdown: releasing spectrometer failed: {e}");
        }
        if let Err(e) = self.devices.trigger.lock().await.led_green().await {
            warn!("shutdown: restoring idle LED failed: {e}");
        }
        if let Some(camera) = &mut self.devices.camera {
            camera.stop_recording().await;
        }
        info!("shutdown complete");
    }
}

/// Background-task guard: the task is aborted when the guard drops, so a
/// cancelled capture future cannot leak its task past its own lifetime.
struct AbortOnDrop(Option<JoinHandle<()>>);

impl AbortOnDrop {
    fn new(handle: JoinHandle<()>) -> Self {
        Self(Some(handle))
    }

    /// Abort and join with a bounded wait.
    async fn stop(mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
            let _ = tokio::time::timeout(TASK_JOIN_GRACE, handle).await;
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
