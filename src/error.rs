use crate::satellite::SatelliteId;
use crate::transport::AdapterState;
use thiserror::Error;

/// Error type shared by every fallible operation in the crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SatelliteError {
    #[error("bluetooth adapter not ready (state: {0})")]
    AdapterNotReady(AdapterState),

    #[error("already scanning")]
    AlreadyScanning,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("transfer of collection {index} failed: {reason}")]
    TransferFailed { index: u16, reason: String },

    #[error("rejected by permissions policy")]
    PolicyRejected,

    #[error("satellite disconnected")]
    Disconnected,

    #[error("transport operation timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown satellite: {0}")]
    UnknownSatellite(SatelliteId),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("satellite manager has been shut down")]
    ShutDown,
}

pub type Result<T> = core::result::Result<T, SatelliteError>;

/// Outcome of an operation that produces no value.
pub type Status = Result<()>;
