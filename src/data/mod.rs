//! Acquired-data model: the shared spectrum buffer and its persistence.

pub mod backup;
pub mod spectrum_buffer;

pub use spectrum_buffer::SpectrumBuffer;
