//! Provider error classification.
//!
//! A provider reports failures as an HTTP status, a machine-readable code,
//! and a free-text message. The provisioner cares about very few of them:
//! "not found" is tolerated during teardown, "already exists" is success
//! during idempotent creation, and two transient conditions are retried.
//! Everything else is passed to the caller untouched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for provider calls.
pub type CloudResult<T> = Result<T, CloudError>;

/// An error returned by the compute or identity API.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("cloud API error {status} {code}: {message}")]
pub struct CloudError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

/// Coarse class of a [`CloudError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The resource does not exist (404-class).
    NotFound,
    /// The resource was already created.
    AlreadyExists,
    /// Another resource still references the one being deleted.
    DependencyInUse,
    /// Anything the provisioner does not branch on.
    Other,
}

impl CloudError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_not_found() {
            ErrorClass::NotFound
        } else if self.is_already_exists() {
            ErrorClass::AlreadyExists
        } else if self.is_dependency_in_use() {
            ErrorClass::DependencyInUse
        } else {
            ErrorClass::Other
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404 || self.code.ends_with(".NotFound") || self.code == "NoSuchEntity"
    }

    pub fn is_already_exists(&self) -> bool {
        self.code.ends_with(".Duplicate")
            || self.code == "EntityAlreadyExists"
            || self.message.contains("already exists")
    }

    pub fn is_dependency_in_use(&self) -> bool {
        self.code == "DependencyViolation"
            || self.code == "DeleteConflict"
            || self.message.contains("dependent object")
    }

    /// A freshly created security group that the API does not see yet.
    ///
    /// This is a refinement of "not found": the same code, but reported
    /// while the group's creation is still propagating.
    pub fn is_not_yet_visible(&self) -> bool {
        self.status == 400 && self.message.contains("does not exist in default VPC")
    }
}

/// Outcome of a provider call where "not found" is an expected answer.
///
/// Teardown paths match on the tag instead of inspecting errors, so each
/// call site states explicitly that a missing resource is acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Failed(CloudError),
}

impl<T> Lookup<T> {
    /// Collapse into a result, mapping `NotFound` to `None`.
    pub fn found(self) -> CloudResult<Option<T>> {
        match self {
            Lookup::Found(v) => Ok(Some(v)),
            Lookup::NotFound => Ok(None),
            Lookup::Failed(e) => Err(e),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound)
    }
}

impl<T> From<CloudResult<T>> for Lookup<T> {
    fn from(result: CloudResult<T>) -> Self {
        match result {
            Ok(v) => Lookup::Found(v),
            Err(e) if e.class() == ErrorClass::NotFound => Lookup::NotFound,
            Err(e) => Lookup::Failed(e),
        }
    }
}

/// Errors from the remote-exec transport.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to start remote command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("remote command on {host} exited with {status}: {stderr}")]
    Failed {
        host: String,
        status: i32,
        stderr: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found() {
        assert_eq!(CloudError::new(404, "NoSuchEntity", "gone").class(), ErrorClass::NotFound);
        assert_eq!(
            CloudError::new(400, "InvalidGroup.NotFound", "no such group").class(),
            ErrorClass::NotFound
        );
    }

    #[test]
    fn classifies_already_exists() {
        let e = CloudError::new(400, "InvalidGroup.Duplicate", "The security group 'c1' already exists");
        assert_eq!(e.class(), ErrorClass::AlreadyExists);
        assert_eq!(
            CloudError::new(409, "EntityAlreadyExists", "role exists").class(),
            ErrorClass::AlreadyExists
        );
    }

    #[test]
    fn classifies_dependency_in_use() {
        let e = CloudError::new(400, "DependencyViolation", "resource has a dependent object");
        assert_eq!(e.class(), ErrorClass::DependencyInUse);
    }

    #[test]
    fn not_yet_visible_is_a_not_found_refinement() {
        let e = CloudError::new(
            400,
            "InvalidGroup.NotFound",
            "The security group 'c1' does not exist in default VPC",
        );
        assert!(e.is_not_yet_visible());
        assert_eq!(e.class(), ErrorClass::NotFound);
        assert!(!CloudError::new(400, "InvalidGroup.NotFound", "gone").is_not_yet_visible());
    }

    #[test]
    fn unknown_codes_are_other() {
        assert_eq!(CloudError::new(500, "InternalError", "boom").class(), ErrorClass::Other);
    }

    #[test]
    fn lookup_from_result() {
        let ok: Lookup<u32> = Ok(7).into();
        assert_eq!(ok, Lookup::Found(7));

        let missing: Lookup<u32> = Err(CloudError::new(404, "NoSuchEntity", "x")).into();
        assert!(missing.is_not_found());
        assert_eq!(missing.found().unwrap(), None);

        let failed: Lookup<u32> = Err(CloudError::new(500, "InternalError", "x")).into();
        assert!(failed.found().is_err());
    }
}
