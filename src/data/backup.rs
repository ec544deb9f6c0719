//! Periodic on-disk backup of partially acquired data.
//!
//! Runs as an advisory background task: on its cadence it copies the
//! committed rows out of the buffer and rewrites one CSV next to the run's
//! settings snapshot. A failed write is logged and retried on the next
//! tick; the task never touches the capture path and is killed, not
//! joined, at run end.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::data::SpectrumBuffer;
use crate::error::Result;

/// Floor for the backup cadence. Short runs back up once near the end at
/// the latest.
pub const MIN_CADENCE: Duration = Duration::from_secs(30);

/// Pick the cadence from the estimated run length: no more often than
/// every 30 s, no less often than roughly once per run.
pub fn cadence(estimated_run: Duration) -> Duration {
    estimated_run.max(MIN_CADENCE)
}

/// Rewrite the backup CSV from every committed row.
///
/// Layout: one header row `gradient,repetition,timestamp,<wavelengths...>`,
/// then one row per committed repetition.
pub fn write_csv(buffer: &SpectrumBuffer, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = vec![
        "gradient".to_string(),
        "repetition".to_string(),
        "timestamp".to_string(),
    ];
    header.extend(buffer.wavelengths().iter().map(|wl| format!("{wl:.2}")));
    writer.write_record(&header)?;

    for row in buffer.committed_rows() {
        let mut record = vec![
            row.gradient.to_string(),
            row.repetition.to_string(),
            format!("{:.6}", row.timestamp),
        ];
        record.extend(row.spectrum.iter().map(|v| format!("{v}")));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// The backup loop. Never returns; the orchestrator aborts it at run end.
pub async fn run(buffer: Arc<SpectrumBuffer>, path: PathBuf, cadence: Duration) {
    let mut last_cursors = (i64::MIN, i64::MIN);
    loop {
        tokio::time::sleep(cadence).await;

        let cursors = buffer.cursors();
        if cursors == last_cursors {
            debug!("no new data since last backup, skipping");
            continue;
        }
        match write_csv(&buffer, &path) {
            Ok(()) => {
                info!(path = %path.display(), ?cursors, "backup written");
                last_cursors = cursors;
            }
            Err(e) => warn!("backup write failed, will retry next tick: {e}"),
        }
    }
}

impl From<csv::Error> for crate::error::RigError {
    fn from(e: csv::Error) -> Self {
        match e.into_kind() {
            csv::ErrorKind::Io(io) => Self::Io(io),
            other => Self::Instrument(format!("csv error: {other:?}")),
        }
    }
}
