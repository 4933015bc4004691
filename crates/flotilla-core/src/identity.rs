//! Cluster identities and namespaces.
//!
//! A cluster is named by the operator (`my-cluster`). Every cloud resource
//! the provisioner creates is scoped by the cluster's namespace, a path
//! encoding of the name where hyphens become separators (`/my/cluster/`).
//! The encoding is reversible because valid names never contain `/` or `_`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Canonical, path-shaped namespace derived from a cluster name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    /// Encode a cluster name as a namespace.
    ///
    /// Pure and deterministic. Fails for names that are empty or contain
    /// uppercase letters, `_`, `/`, or whitespace.
    pub fn from_cluster_name(name: &str) -> CoreResult<Self> {
        validate_cluster_name(name)?;
        Ok(Self(format!("/{}/", name.replace('-', "/"))))
    }

    /// Decode the namespace back into the cluster name it was built from.
    pub fn cluster_name(&self) -> String {
        self.0.trim_matches('/').replace('/', "-")
    }

    /// Flatten the namespace into a single cloud resource name.
    ///
    /// `/my/cluster/` with suffix `flotilla` becomes `my_cluster_flotilla`.
    pub fn resource_name(&self, suffix: &str) -> String {
        let flat = self.0.trim_matches('/').replace('/', "_");
        format!("{flat}_{suffix}")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Namespace {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        let name = value.trim_matches('/').replace('/', "-");
        let ns = Self::from_cluster_name(&name)?;
        if ns.0 != value {
            return Err(CoreError::InvalidClusterName {
                name: value,
                reason: "not a canonical namespace",
            });
        }
        Ok(ns)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}

/// Name, namespace, and zone of one cluster.
///
/// Built fresh for every operation; the namespace is always derived from
/// the name, never supplied independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub name: String,
    pub namespace: Namespace,
    pub zone: String,
}

impl ClusterIdentity {
    /// Validate `name` and bind it to a zone.
    pub fn new(name: impl Into<String>, zone: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        let namespace = Namespace::from_cluster_name(&name)?;
        Ok(Self {
            name,
            namespace,
            zone: zone.into(),
        })
    }

    /// The region a zone belongs to (`us-west-2a` → `us-west-2`).
    pub fn region(&self) -> &str {
        self.zone
            .trim_end_matches(|c: char| c.is_ascii_alphabetic())
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.zone)
    }
}

fn validate_cluster_name(name: &str) -> CoreResult<()> {
    let reject = |reason| {
        Err(CoreError::InvalidClusterName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return reject("name is empty");
    }
    if name.chars().any(|c| c.is_uppercase()) {
        return reject("name must be lowercase");
    }
    if name.contains('_') {
        return reject("name cannot contain '_'");
    }
    if name.contains('/') || name.chars().any(char::is_whitespace) {
        return reject("name cannot contain '/' or whitespace");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return reject("name cannot start or end with '-'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_replaces_hyphens() {
        let ns = Namespace::from_cluster_name("my-cluster").unwrap();
        assert_eq!(ns.as_str(), "/my/cluster/");
    }

    #[test]
    fn namespace_without_hyphens() {
        let ns = Namespace::from_cluster_name("genomics").unwrap();
        assert_eq!(ns.as_str(), "/genomics/");
    }

    #[test]
    fn namespace_is_deterministic() {
        let a = Namespace::from_cluster_name("a-b-c").unwrap();
        let b = Namespace::from_cluster_name("a-b-c").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn namespace_round_trips_to_name() {
        for name in ["my-cluster", "x", "run-2024-01", "a-b-c-d"] {
            let ns = Namespace::from_cluster_name(name).unwrap();
            assert_eq!(ns.cluster_name(), name);
        }
    }

    #[test]
    fn uppercase_is_rejected() {
        let err = Namespace::from_cluster_name("My-Cluster").unwrap_err();
        assert!(matches!(err, CoreError::InvalidClusterName { .. }));
    }

    #[test]
    fn underscore_is_rejected() {
        let err = Namespace::from_cluster_name("my_cluster").unwrap_err();
        assert!(matches!(err, CoreError::InvalidClusterName { .. }));
    }

    #[test]
    fn empty_and_slash_are_rejected() {
        assert!(Namespace::from_cluster_name("").is_err());
        assert!(Namespace::from_cluster_name("a/b").is_err());
        assert!(Namespace::from_cluster_name("a b").is_err());
        assert!(Namespace::from_cluster_name("-edge").is_err());
    }

    #[test]
    fn resource_name_flattens_namespace() {
        let ns = Namespace::from_cluster_name("my-cluster").unwrap();
        assert_eq!(ns.resource_name("flotilla"), "my_cluster_flotilla");
    }

    #[test]
    fn identity_validates_name() {
        assert!(ClusterIdentity::new("Bad_Name", "us-west-2a").is_err());
        let id = ClusterIdentity::new("good-name", "us-west-2a").unwrap();
        assert_eq!(id.namespace.as_str(), "/good/name/");
        assert_eq!(id.region(), "us-west-2");
    }

    #[test]
    fn namespace_deserialize_rejects_non_canonical() {
        let ok: Namespace = serde_json::from_str("\"/my/cluster/\"").unwrap();
        assert_eq!(ok.cluster_name(), "my-cluster");
        assert!(serde_json::from_str::<Namespace>("\"my-cluster\"").is_err());
        assert!(serde_json::from_str::<Namespace>("\"/My/\"").is_err());
    }
}
