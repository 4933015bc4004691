//! Error taxonomy of the provisioner.

use std::time::Duration;

use thiserror::Error;

use flotilla_cloud::{CloudError, RemoteError};
use flotilla_core::CoreError;

use crate::readiness::ReadinessStage;

/// Result type alias for provisioner operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Bad input or environment; raised before the cloud is touched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cloud-side state broke an assumption the provisioner relies on.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// A resource stayed referenced for the whole retry window.
    #[error("{resource} still in use after {waited:?}: {source}")]
    DependencyInUse {
        resource: String,
        waited: Duration,
        source: CloudError,
    },

    #[error("cluster {0} has no instances")]
    ClusterNotFound(String),

    #[error("no instances were launched ({requested} requested)")]
    NothingLaunched { requested: u32 },

    #[error("instance {instance_id} not ready after {waited:?}, stuck at {stage}")]
    ReadinessDeadline {
        instance_id: String,
        stage: ReadinessStage,
        waited: Duration,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Unclassified provider error, passed through verbatim.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl From<CoreError> for ProvisionError {
    fn from(err: CoreError) -> Self {
        ProvisionError::Configuration(err.to_string())
    }
}
