//! Engine error types

use thiserror::Error;

/// Errors surfaced by the DRUM engine
///
/// Worker-thread failures (writer I/O, merge passes) never reach producer
/// threads as errors; they are reported through the event listener. The
/// variants here are the ones a caller can observe synchronously, plus the
/// kinds carried inside failure events.
#[derive(Error, Debug)]
pub enum DrumError {
    /// Invalid construction-time configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Underlying file or directory operation failed
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Value or auxiliary codec failed to encode, decode or merge
    #[error("codec failure: {0}")]
    Codec(String),

    /// The backing sorted store reported a failure during a merge
    #[error("store failure: {0}")]
    Store(String),

    /// Operation submitted after `dispose()` was called
    #[error("engine is shutting down")]
    ShuttingDown,

    /// A bucket writer terminated before servicing a request
    #[error("bucket writer {bucket} has terminated")]
    WriterTerminated { bucket: usize },
}

/// Result type for engine operations
pub type DrumResult<T> = Result<T, DrumError>;
