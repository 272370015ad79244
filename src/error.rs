//! Error types for polling BLE battery peripherals.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for protocol and session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can end a poll cycle or a connection attempt.
#[derive(Error, Debug)]
pub enum Error {
    /// The device could not be found or the link could not be established
    #[error("connect failed: {0}")]
    Connect(String),

    /// A read was attempted on a session that never connected
    #[error("device {0} is not connected")]
    NotConnected(String),

    /// No response arrived within the per-request deadline
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Length, operation or checksum of a received frame did not match
    #[error("malformed response: {reason}: {frame}")]
    MalformedResponse {
        /// What was wrong with the frame
        reason: &'static str,
        /// The frame as received, hex encoded
        frame: String,
    },

    /// The device answered with an error status
    #[error("device reported error code {0:#04x}")]
    DeviceError(u8),

    /// A vendor frame carried an operation code nothing was waiting for
    #[error("unexpected operation code {0:#04x}")]
    UnexpectedOperation(u8),

    /// A request could not be built from its parameters
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// A cycle was started for a device that has nothing to read
    #[error("device has no sections to read")]
    EmptyCycle,

    /// The notification stream ended while a response was outstanding
    #[error("notification stream closed")]
    NotificationsClosed,

    /// Failure inside the wireless transport
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    pub(crate) fn malformed(reason: &'static str, frame: &[u8]) -> Self {
        Error::MalformedResponse {
            reason,
            frame: hex::encode(frame),
        }
    }
}

impl From<bluest::Error> for Error {
    fn from(err: bluest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// A field decoder could not read what it needed from a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field {field} needs {needed} bytes at offset {offset}, payload has {available}")]
pub struct DecodeError {
    /// Name of the field being decoded
    pub field: String,
    /// Byte offset into the payload
    pub offset: usize,
    /// Bytes the field occupies
    pub needed: usize,
    /// Length of the payload
    pub available: usize,
}
