//! Out-of-process video capture sidecar.
//!
//! The camera records the sample chamber for the duration of a run. It is
//! a separate executable with its own frame clock; this crate only starts
//! it, tells it where to write, and stops it with a bounded join so a hung
//! recorder can never block shutdown.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{Result, RigError};

/// How long to wait for the recorder to flush and exit after the stop
/// signal before killing it.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Handle to the recorder process, if one is running.
pub struct CameraSidecar {
    program: PathBuf,
    device: String,
    child: Option<Child>,
}

impl CameraSidecar {
    pub fn new(program: impl Into<PathBuf>, device: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            device: device.into(),
            child: None,
        }
    }

    /// Launch the recorder writing frames and timestamps under `output`.
    pub async fn start_recording(&mut self, output: &Path) -> Result<()> {
        if self.child.is_some() {
            return Err(RigError::Precondition(
                "camera recording already running".to_string(),
            ));
        }
        let child = Command::new(&self.program)
            .arg("--device")
            .arg(&self.device)
            .arg("--output")
            .arg(output)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RigError::Instrument(format!(
                    "failed to launch camera sidecar {:?}: {e}",
                    self.program
                ))
            })?;
        info!(output = %output.display(), "camera recording started");
        self.child = Some(child);
        Ok(())
    }

    /// Signal the recorder to stop, wait a bounded grace period, then kill.
    ///
    /// Never errors on an unclean exit; the video is advisory data and must
    /// not block safing the rig.
    pub async fn stop_recording(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(b"stop\n").await {
                warn!("failed to signal camera sidecar: {e}");
            }
            // Dropping stdin closes the pipe, a second stop signal.
        }

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "camera recording stopped"),
            Ok(Err(e)) => warn!("camera sidecar wait failed: {e}"),
            Err(_) => {
                warn!("camera sidecar did not exit in time, killing it");
                if let Err(e) = child.kill().await {
                    warn!("failed to kill camera sidecar: {e}");
                }
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.child.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let mut camera = CameraSidecar::new("/nonexistent/recorder", "/dev/video0");
        assert!(!camera.is_recording());
        camera.stop_recording().await;
    }

    #[tokio::test]
    async fn missing_program_is_an_instrument_error() {
        let mut camera = CameraSidecar::new("/nonexistent/recorder", "/dev/video0");
        let err = camera
            .start_recording(Path::new("/tmp/out"))
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::Instrument(_)));
    }

    #[tokio::test]
    async fn stop_joins_a_real_process() {
        // `cat` stands in for the recorder: it reads stdin until the stop
        // line closes the pipe, then exits.
        let mut camera = CameraSidecar::new("/bin/cat", "/dev/video0");
        camera.child = Some(
            Command::new("/bin/cat")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .spawn()
                .unwrap(),
        );
        assert!(camera.is_recording());
        camera.stop_recording().await;
        assert!(!camera.is_recording());
    }
}
