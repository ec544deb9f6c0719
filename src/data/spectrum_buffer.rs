//! Shared spectrum buffer.
//!
//! Pre-sized 3D storage `[gradient][repetition][wavelength bin]` plus
//! parallel timestamps, written by exactly one capture loop and read by any
//! number of observers (live display, periodic backup). Publication is
//! commit-then-advance: a cell is written under its own lock first, the
//! repetition cursor is advanced with release ordering afterwards, so a
//! reader that acquires the cursor never sees an index whose cell is not
//! fully committed.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::{Result, RigError};

/// Cursor value before the first gradient/repetition.
pub const NOT_STARTED: i64 = -1;

struct Cell {
    spectrum: Vec<f64>,
    /// Seconds since the Unix epoch; 0.0 marks a never-committed cell.
    timestamp: f64,
}

/// One committed repetition, copied out for a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedRow {
    pub gradient: usize,
    pub repetition: usize,
    pub timestamp: f64,
    pub spectrum: Vec<f64>,
}

pub struct SpectrumBuffer {
    num_gradients: usize,
    repetitions: usize,
    wavelengths: Vec<f64>,
    cells: Vec<Vec<Mutex<Cell>>>,
    current_gradient: AtomicI64,
    current_repetition: AtomicI64,
    stop: AtomicBool,
}

impl SpectrumBuffer {
    pub fn new(num_gradients: usize, repetitions: usize, wavelengths: Vec<f64>) -> Self {
        let bins = wavelengths.len();
        let cells = (0..num_gradients)
            .map(|_| {
                (0..repetitions)
                    .map(|_| {
                        Mutex::new(Cell {
                            spectrum: vec![0.0; bins],
                            timestamp: 0.0,
                        })
                    })
                    .collect()
            })
            .collect();
        Self {
            num_gradients,
            repetitions,
            wavelengths,
            cells,
            current_gradient: AtomicI64::new(NOT_STARTED),
            current_repetition: AtomicI64::new(NOT_STARTED),
            stop: AtomicBool::new(false),
        }
    }

    pub fn num_gradients(&self) -> usize {
        self.num_gradients
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    /// Writer: enter the next gradient. Gradients advance strictly in
    /// order; the repetition cursor resets before the gradient cursor
    /// moves, so readers never pair the new gradient with a stale
    /// repetition index.
    pub fn begin_gradient(&self, index: usize) -> Result<()> {
        let expected = self.current_gradient.load(Ordering::Acquire) + 1;
        if index as i64 != expected || index >= self.num_gradients {
            return Err(RigError::Instrument(format!(
                "gradient {index} out of order (expected {expected})"
            )));
        }
        self.current_repetition.store(NOT_STARTED, Ordering::Release);
        self.current_gradient.store(index as i64, Ordering::Release);
        Ok(())
    }

    /// Writer: store one spectrum and publish it by advancing the
    /// repetition cursor.
    pub fn commit(&self, repetition: usize, spectrum: &[f64], timestamp: f64) -> Result<()> {
        let gradient = self.current_gradient.load(Ordering::Acquire);
        if gradient < 0 {
            return Err(RigError::Instrument(
                "commit before begin_gradient".to_string(),
            ));
        }
        let expected = self.current_repetition.load(Ordering::Acquire) + 1;
        if repetition as i64 != expected || repetition >= self.repetitions {
            return Err(RigError::Instrument(format!(
                "repetition {repetition} out of order (expected {expected})"
            )));
        }
        if spectrum.len() != self.wavelengths.len() {
            return Err(RigError::Instrument(format!(
                "spectrum has {} bins, buffer expects {}",
                spectrum.len(),
                self.wavelengths.len()
            )));
        }

        {
            #[allow(clippy::unwrap_used)]
            let mut cell = self.cells[gradient as usize][repetition].lock().unwrap();
            cell.spectrum.copy_from_slice(spectrum);
            cell.timestamp = timestamp;
        }
        // Publication point: the data write above is ordered before this.
        self.current_repetition
            .store(repetition as i64, Ordering::Release);
        Ok(())
    }

    /// Terminal stop flag; once set it is never cleared.
    pub fn signal_done(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Reader: the current cursors `(gradient, repetition)`, both
    /// [`NOT_STARTED`] before the first commit of their scope.
    pub fn cursors(&self) -> (i64, i64) {
        // Repetition first: pairing a stale repetition with a fresh
        // gradient could point past the committed region.
        let repetition = self.current_repetition.load(Ordering::Acquire);
        let gradient = self.current_gradient.load(Ordering::Acquire);
        (gradient, repetition)
    }

    /// Reader: copy out every committed row. Gradients before the current
    /// one may have been truncated by a timeout; their uncommitted tail is
    /// recognizable by the zero timestamp and skipped.
    pub fn committed_rows(&self) -> Vec<CommittedRow> {
        let (gradient, repetition) = self.cursors();
        if gradient < 0 {
            return Vec::new();
        }

        let mut rows = Vec::new();
        for g in 0..=gradient as usize {
            let limit = if g == gradient as usize {
                if repetition < 0 {
                    continue;
                }
                repetition as usize
            } else {
                self.repetitions - 1
            };
            for r in 0..=limit {
                #[allow(clippy::unwrap_used)]
                let cell = self.cells[g][r].lock().unwrap();
                if cell.timestamp == 0.0 {
                    continue;
                }
                rows.push(CommittedRow {
                    gradient: g,
                    repetition: r,
                    timestamp: cell.timestamp,
                    spectrum: cell.spectrum.clone(),
                });
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn buffer() -> SpectrumBuffer {
        SpectrumBuffer::new(2, 3, vec![500.0, 510.0, 520.0])
    }

    #[test]
    fn cursors_start_unset() {
        let buf = buffer();
        assert_eq!(buf.cursors(), (NOT_STARTED, NOT_STARTED));
        assert!(buf.committed_rows().is_empty());
    }

    #[test]
    fn commit_publishes_in_order() {
        let buf = buffer();
        buf.begin_gradient(0).unwrap();
        buf.commit(0, &[1.0, 2.0, 3.0], 100.0).unwrap();
        assert_eq!(buf.cursors(), (0, 0));
        buf.commit(1, &[4.0, 5.0, 6.0], 101.0).unwrap();
        assert_eq!(buf.cursors(), (0, 1));

        let rows = buf.committed_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].spectrum, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn out_of_order_writes_are_rejected() {
        let buf = buffer();
        assert!(buf.commit(0, &[0.0; 3], 1.0).is_err());
        buf.begin_gradient(0).unwrap();
        assert!(buf.commit(1, &[0.0; 3], 1.0).is_err());
        assert!(buf.begin_gradient(0).is_err());
        assert!(buf.commit(0, &[0.0; 2], 1.0).is_err());
    }

    #[test]
    fn next_gradient_resets_repetition_cursor() {
        let buf = buffer();
        buf.begin_gradient(0).unwrap();
        buf.commit(0, &[0.0; 3], 1.0).unwrap();
        buf.begin_gradient(1).unwrap();
        assert_eq!(buf.cursors(), (1, NOT_STARTED));
    }

    #[test]
    fn truncated_gradient_rows_are_skipped() {
        let buf = buffer();
        buf.begin_gradient(0).unwrap();
        buf.commit(0, &[0.5; 3], 1.0).unwrap();
        // Timeout truncated repetitions 1 and 2; move on.
        buf.begin_gradient(1).unwrap();
        buf.commit(0, &[0.7; 3], 2.0).unwrap();

        let rows = buf.committed_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].gradient, rows[0].repetition), (0, 0));
        assert_eq!((rows[1].gradient, rows[1].repetition), (1, 0));
    }

    #[test]
    fn stop_flag_is_terminal() {
        let buf = buffer();
        assert!(!buf.is_done());
        buf.signal_done();
        assert!(buf.is_done());
        buf.signal_done();
        assert!(buf.is_done());
    }

    #[test]
    fn readers_only_observe_committed_cells() {
        let buf = Arc::new(SpectrumBuffer::new(1, 64, vec![500.0, 510.0]));
        let reader = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                let mut last = NOT_STARTED;
                while !buf.is_done() {
                    let (_, repetition) = buf.cursors();
                    assert!(repetition >= last, "cursor went backwards");
                    last = repetition;
                    for row in buf.committed_rows() {
                        assert_eq!(row.spectrum, vec![row.repetition as f64; 2]);
                        assert!(row.timestamp > 0.0);
                    }
                }
                last
            })
        };

        buf.begin_gradient(0).unwrap();
        for r in 0..64 {
            buf.commit(r, &[r as f64, r as f64], 1.0 + r as f64).unwrap();
        }
        buf.signal_done();
        let last_seen = reader.join().unwrap();
        assert!(last_seen <= 63);
    }
}
