//! Cloud Identity API — roles, inline policies, and instance profiles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CloudResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProfileInfo {
    pub name: String,
    pub arn: String,
    /// Names of the roles attached to the profile.
    pub roles: Vec<String>,
}

#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn get_role(&self, name: &str) -> CloudResult<RoleInfo>;

    /// Create a role that instances of the compute service may assume.
    async fn create_role(&self, name: &str, assume_role_policy: &str) -> CloudResult<RoleInfo>;

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str) -> CloudResult<()>;

    async fn list_role_policies(&self, role: &str) -> CloudResult<Vec<String>>;

    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> CloudResult<()>;

    async fn delete_role(&self, role: &str) -> CloudResult<()>;

    async fn get_instance_profile(&self, name: &str) -> CloudResult<InstanceProfileInfo>;

    async fn create_instance_profile(&self, name: &str) -> CloudResult<InstanceProfileInfo>;

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()>;

    async fn remove_role_from_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()>;

    async fn delete_instance_profile(&self, name: &str) -> CloudResult<()>;
}
