//! The two error surfaces of the scanning core: the small vocabulary of
//! outcome codes the frontend is allowed to see, and the richer internal
//! error type everything else is reported through.

use thiserror::Error;

/// Outcome code visible to the frontend API (open/start/read/cancel/...).
///
/// This is deliberately not an [`std::error::Error`] impl: it is a result
/// code, not a propagating error, and `Good` is a perfectly normal value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Good,
    Inval,
    DeviceBusy,
    IoError,
    NoMem,
    Cancelled,
    Eof,
}

impl Status {
    /// `true` once this status represents a job that has stopped producing
    /// images for reasons other than simply running out (`Good` covers both
    /// "no error yet" and "finished cleanly").
    pub fn is_sticky_error(self) -> bool {
        !matches!(self, Status::Good)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Good => "good",
            Status::Inval => "invalid argument",
            Status::DeviceBusy => "device busy",
            Status::IoError => "I/O error",
            Status::NoMem => "out of memory",
            Status::Cancelled => "cancelled",
            Status::Eof => "end of file",
        };
        f.write_str(s)
    }
}

/// Internal error type. Logged at the device's logging context; never
/// crosses the frontend boundary directly (see [`CoreError::as_status`]).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("protocol error: {0}")]
    Protocol(#[source] anyhow::Error),

    #[error("capability error: {0}")]
    Capability(#[source] anyhow::Error),

    #[error("image format error: {0}")]
    Format(#[source] anyhow::Error),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("device is busy")]
    Busy,

    #[error("device is closed")]
    Closed,
}

impl CoreError {
    /// Map to the status code the frontend is allowed to observe.
    pub fn as_status(&self) -> Status {
        match self {
            CoreError::Transport(_) => Status::IoError,
            CoreError::Protocol(_) => Status::IoError,
            CoreError::Capability(_) => Status::IoError,
            CoreError::Format(_) => Status::IoError,
            CoreError::Invalid(_) => Status::Inval,
            CoreError::Busy => Status::DeviceBusy,
            CoreError::Closed => Status::Inval,
        }
    }
}
