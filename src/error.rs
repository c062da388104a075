//! Error type shared by the device, driver and acquisition layers

use std::io;

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The device could not be opened (missing dongle, busy, bad index)
    #[error("failed to open device {index}: {reason}")]
    Open { index: u32, reason: String },

    /// A parameter was rejected before reaching the device
    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The driver refused an operation
    #[error("{op} failed: {reason}")]
    Driver { op: &'static str, reason: String },

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    /// A single blocking read failed
    #[error("read failed: {0}")]
    Read(String),

    /// The sample stream ended without a cancellation request
    #[error("sample stream closed")]
    StreamClosed,

    /// The read was aborted by `cancel_async`
    #[error("read cancelled")]
    Cancelled,

    #[error("device handle already released")]
    Released,

    #[error("acquisition already started")]
    AlreadyStarted,

    #[error("could not allocate {0} byte sample buffer")]
    Allocation(usize),

    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn driver(op: &'static str, reason: impl Into<String>) -> Self {
        Error::Driver {
            op,
            reason: reason.into(),
        }
    }
}
