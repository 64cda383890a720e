//! ddp-step error types

use crate::distributed::dispatch::StepKind;
use crate::distributed::placement::DeviceId;

/// ddp-step result type
pub type Result<T> = std::result::Result<T, Error>;

/// ddp-step errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from numr operations
    #[error("numr error: {0}")]
    Numr(#[from] numr::error::Error),

    /// Payload shape is incompatible with the replica group
    #[error("sharding error: {reason}")]
    Sharding {
        /// Description of what went wrong
        reason: String,
    },

    /// The wrapped module has no entry point for the requested step
    #[error("step not supported: module does not implement {kind}")]
    StepNotSupported {
        /// The requested step kind
        kind: StepKind,
    },

    /// A per-device step task failed or panicked
    #[error("replica on {device} failed: {reason}")]
    ReplicaFailure {
        /// Device the failing replica runs on
        device: DeviceId,
        /// Description of what went wrong
        reason: String,
    },

    /// Pushing buffers from the authority replica failed
    #[error("buffer sync error: {reason}")]
    BufferSync {
        /// Description of what went wrong
        reason: String,
    },

    /// Gradient reducer error
    #[error("reducer error: {reason}")]
    Reducer {
        /// Description of what went wrong
        reason: String,
    },

    /// Invalid configuration value
    #[error("invalid config '{arg}': {reason}")]
    InvalidConfig {
        /// Config field name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },
}
