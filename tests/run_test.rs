//! End-to-end runs against the simulated rig.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use spectrig::config::{LaserSettings, LinkSettings, Settings, SpectoSettings};
use spectrig::data::spectrum_buffer::NOT_STARTED;
use spectrig::error::{RigError, RunPhase};
use spectrig::gradient::ParamSpec;
use spectrig::hardware::mock::MockLink;
use spectrig::hardware::LinkConfig;
use spectrig::instruments::sim::{SimulatedBus, SimulatedLaser, SimulatedSpectrometer};
use spectrig::instruments::{CwLaser, PulsedLaser, TriggerBoard};
use spectrig::measurement::{Devices, MeasurementRun};
use spectrig::protocol::TelegramEngine;

fn settings() -> Settings {
    Settings {
        run_name: "integration".to_string(),
        unique: true,
        timeout_secs: 600,
        watchdog_grace_ms: 2000,
        hv_percent_max: 100,
        specto: SpectoSettings {
            integration_time_ms: 10,
            scan_avg: 1,
            smooth: 0,
            x_timing: 1,
            amplification: false,
        },
        laser: LaserSettings {
            repetitions: 3,
            measurement_delay_ms: 10,
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

fn run_dir() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    (dir, path)
}

#[tokio::test(start_paused = true)]
async fn pulsed_run_commits_every_repetition() {
    let settings = settings();
    let devices = Devices::connect(&settings).unwrap();
    let (_tmp, dir) = run_dir();
    let mut run = MeasurementRun::new(settings, devices, dir).unwrap();

    run.run().await.unwrap();

    let buffer = run.data().unwrap();
    assert!(buffer.is_done());
    assert_eq!(buffer.cursors(), (0, 2));
    let rows = buffer.committed_rows();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.spectrum.len() == buffer.wavelengths().len()));
    assert!(rows.iter().all(|r| r.timestamp > 0.0));
}

#[tokio::test(start_paused = true)]
async fn timeout_truncates_gradient_but_sweep_continues() {
    let mut settings = settings();
    settings.timeout_secs = 1;
    settings.specto.integration_time_ms = 0;
    settings.laser.continuous = true;
    settings.laser.measurement_delay_ms = 500;
    settings.laser.repetitions = 10;
    settings.laser.hv_percent = ParamSpec::List(vec![40.0, 80.0]);

    let devices = Devices::connect(&settings).unwrap();
    let (_tmp, dir) = run_dir();
    let mut run = MeasurementRun::new(settings, devices, dir).unwrap();

    run.run().await.unwrap();

    let buffer = run.data().unwrap();
    // Both gradients ran; each committed exactly 2 of its 10 repetitions
    // before the wall clock cut it off.
    assert_eq!(buffer.cursors(), (1, 1));
    let rows = buffer.committed_rows();
    assert_eq!(rows.len(), 4);
    for gradient in 0..2 {
        let reps: Vec<usize> = rows
            .iter()
            .filter(|r| r.gradient == gradient)
            .map(|r| r.repetition)
            .collect();
        assert_eq!(reps, vec![0, 1], "gradient {gradient}");
    }
}

#[tokio::test(start_paused = true)]
async fn failed_turn_on_still_reaches_shutdown() {
    let settings = settings();

    let firmware = MockLink::with_replies(vec![]);
    let firmware_log = firmware.sent_log();
    let cw_bus = SimulatedBus::new();
    let cw_state = cw_bus.state();
    let laser_sim = SimulatedLaser::new().never_ready();
    let laser_commands = laser_sim.command_log();

    let devices = Devices {
        spectrometer: Box::new(SimulatedSpectrometer::new()),
        trigger: Arc::new(Mutex::new(TriggerBoard::new(
            Box::new(firmware),
            Duration::from_millis(3),
        ))),
        cw_laser: Arc::new(Mutex::new(CwLaser::new(Box::new(cw_bus)))),
        pulsed_laser: Arc::new(Mutex::new(PulsedLaser::new(
            TelegramEngine::new(Box::new(laser_sim)),
            100,
        ))),
        camera: None,
    };

    let (_tmp, dir) = run_dir();
    let mut run = MeasurementRun::new(settings, devices, dir).unwrap();
    let err = run.run().await.unwrap_err();

    match err {
        RigError::Run { phase, source } => {
            assert_eq!(phase, RunPhase::Bringup);
            assert!(matches!(*source, RigError::LaserNotReady(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(run.data().is_none());

    // Shutdown ran: the laser was stopped and the rig returned to idle.
    assert!(laser_commands.lock().unwrap().iter().any(|c| c == "i"));
    let sent = firmware_log.lock().unwrap();
    assert_eq!(sent.last().unwrap(), b"2SetLED=151\n");
    let led_greens = sent.iter().filter(|l| *l == b"2SetLED=151\n").count();
    assert_eq!(led_greens, 2, "bring-up and shutdown each set the idle LED");

    let cw = cw_state.lock().unwrap();
    assert_eq!(cw.get(&0x30), Some(&0)); // emission off
    assert_eq!(cw.get(&0x31), Some(&0)); // internal trigger restored
    assert_eq!(cw.get(&0x3E), Some(&1)); // power at minimum
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_into_shutdown_with_partial_data() {
    let mut settings = settings();
    settings.laser.continuous = true;
    settings.laser.repetitions = 1000;
    settings.laser.measurement_delay_ms = 100;

    let devices = Devices::connect(&settings).unwrap();
    let (_tmp, dir) = run_dir();
    let mut run = MeasurementRun::new(settings, devices, dir).unwrap();

    let cancel = run.cancel_handle();
    tokio::spawn(async move {
        // Well into the first gradient's capture.
        tokio::time::sleep(Duration::from_secs(8)).await;
        cancel.notify_one();
    });

    let err = run.run().await.unwrap_err();
    assert!(matches!(err, RigError::Run { phase: RunPhase::Capture, .. }));

    let buffer = run.data().unwrap();
    assert!(buffer.is_done());
    let (gradient, repetition) = buffer.cursors();
    assert_eq!(gradient, 0);
    assert!(repetition > NOT_STARTED, "some repetitions committed");
    let rows = buffer.committed_rows();
    assert_eq!(rows.len(), (repetition + 1) as usize);
}
