//! Error types for the load generators and their controller.

use thiserror::Error;

/// Result type for controller and pool operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Failures surfaced to the caller of the controller.
///
/// Generator-internal problems never show up here; they are logged inside
/// the unit that hit them.
#[derive(Debug, Error)]
pub enum LoadError {
    /// A run is already active on this controller
    #[error("a load run is already active; stop it before starting another")]
    RunActive,

    /// A GPU load kind was requested but no accelerator is registered
    #[error("no accelerator devices available for {kind} load")]
    NoDevices {
        /// Requested load kind
        kind: String,
    },

    /// Requested device id is not registered
    #[error("unknown accelerator device id {id}")]
    UnknownDevice {
        /// Device id from the request
        id: u32,
    },

    /// The plan contained no requests
    #[error("load plan is empty")]
    EmptyPlan,

    /// An OS thread could not be spawned
    #[error("failed to spawn worker `{name}`: {source}")]
    Spawn {
        /// Worker name
        name: String,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// Configuration file could not be read or parsed
    #[error("invalid configuration: {message}")]
    Config {
        /// Error message
        message: String,
    },
}

/// Failures reported by an accelerator backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccelError {
    /// The device could not satisfy an allocation
    #[error("out of device memory allocating {requested} bytes")]
    OutOfMemory {
        /// Bytes requested
        requested: u64,
    },

    /// Any other driver or device failure
    #[error("device {id} error: {message}")]
    Device {
        /// Device id
        id: u32,
        /// Error message
        message: String,
    },
}

impl AccelError {
    /// Whether this is an allocation failure that should be retried after a backoff.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, AccelError::OutOfMemory { .. })
    }
}
