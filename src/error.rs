//! Error types for tempolink.

use thiserror::Error;

/// Error type for tempolink operations.
///
/// Only the non-real-time API surface produces errors; the processing
/// path recovers locally and never surfaces one.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid tempo: {0}. Must be between 20.0 and 999.0 BPM")]
    InvalidTempo(f64),

    #[error("Invalid quantum: {0}. Must be positive")]
    InvalidQuantum(f64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;
