//! Error types for core validation and configuration.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised before any cloud call is made.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid cluster name {name:?}: {reason}")]
    InvalidClusterName { name: String, reason: &'static str },

    #[error("unknown machine type: {0}")]
    UnknownMachineType(String),

    #[error("machine type {machine_type} has {disks} ephemeral disks, at most {max} are supported")]
    UnsupportedStorage {
        machine_type: String,
        disks: u32,
        max: usize,
    },

    #[error("invalid preemptable node type {0:?}, expected <machine-type>:<price>")]
    InvalidBid(String),

    #[error("missing setting: {0}")]
    Missing(&'static str),

    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),
}
