//! Cluster security group and identity (role + instance profile).
//!
//! Both are cluster-scoped singletons: created on first launch, shared by
//! every node, and deleted on destroy only once no surviving instance still
//! depends on them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use flotilla_cloud::{CloudError, ComputeApi, IdentityApi, Lookup};
use flotilla_core::{IdentityProfile, IngressRule, InstanceRecord, SecurityGroupPolicy};

use crate::context::CloudContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::retry::{RetryError, RetryPolicy, retry_when};

/// Services the node role may call, one inline policy each.
const POLICY_SERVICES: [(&str, &str); 4] = [
    ("iam_full", "iam"),
    ("ec2_full", "ec2"),
    ("s3_full", "s3"),
    ("sdb_full", "sdb"),
];

/// Inline policies attached to every cluster role: name → JSON document.
pub fn policy_bundle() -> BTreeMap<String, String> {
    POLICY_SERVICES
        .iter()
        .map(|(name, service)| {
            let doc = json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Action": format!("{service}:*"),
                    "Resource": "*",
                }],
            });
            (name.to_string(), doc.to_string())
        })
        .collect()
}

fn assume_role_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": ["ec2.amazonaws.com"] },
            "Action": ["sts:AssumeRole"],
        }],
    })
    .to_string()
}

/// Instance profile name from its ARN: the last path segment.
pub fn profile_name_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

/// Treat a not-found answer as already done.
fn tolerate_not_found(result: Result<(), CloudError>) -> Result<bool, CloudError> {
    match Lookup::from(result) {
        Lookup::Found(()) => Ok(true),
        Lookup::NotFound => Ok(false),
        Lookup::Failed(e) => Err(e),
    }
}

pub struct SecurityPolicyManager {
    compute: Arc<dyn ComputeApi>,
    identity: Arc<dyn IdentityApi>,
    retry: RetryPolicy,
}

impl SecurityPolicyManager {
    pub fn new(compute: Arc<dyn ComputeApi>, identity: Arc<dyn IdentityApi>, retry: RetryPolicy) -> Self {
        Self {
            compute,
            identity,
            retry,
        }
    }

    // ── Security group ────────────────────────────────────────────

    /// Make sure the cluster's security group exists and carries exactly the
    /// three default rules.
    ///
    /// Idempotent. When the group already exists it is reconciled: rules it
    /// lacks are authorized and rules outside the default policy are
    /// revoked, so a second call changes nothing.
    pub async fn ensure(&self, ctx: &CloudContext) -> ProvisionResult<SecurityGroupPolicy> {
        let name = ctx.name();
        let desired = SecurityGroupPolicy::cluster_default(name);
        let description = format!("flotilla cluster {}", ctx.cluster.namespace);

        let (missing, extra): (Vec<IngressRule>, Vec<IngressRule>) =
            match self.compute.create_security_group(name, &description).await {
                Ok(id) => {
                    info!(group = %name, %id, "security group created");
                    (desired.ingress.clone(), Vec::new())
                }
                Err(e) if e.is_already_exists() => {
                    debug!(group = %name, "security group already exists");
                    let current =
                        retry_when(&self.retry, "describe security group", CloudError::is_not_found, || {
                            self.compute.describe_security_group(name)
                        })
                        .await
                        .map_err(RetryError::into_inner)?;
                    let missing = desired
                        .ingress
                        .iter()
                        .filter(|rule| !current.ingress.contains(rule))
                        .cloned()
                        .collect();
                    let extra = current
                        .ingress
                        .into_iter()
                        .filter(|rule| !desired.ingress.contains(rule))
                        .collect();
                    (missing, extra)
                }
                Err(e) => return Err(e.into()),
            };

        for rule in &extra {
            self.revoke(name, rule).await?;
        }
        for rule in &missing {
            self.authorize(name, rule).await?;
        }
        Ok(desired)
    }

    async fn revoke(&self, group: &str, rule: &IngressRule) -> ProvisionResult<()> {
        if tolerate_not_found(self.compute.revoke_ingress(group, rule).await)? {
            warn!(group, from = rule.from_port, to = rule.to_port, "foreign ingress rule revoked");
        }
        Ok(())
    }

    async fn authorize(&self, group: &str, rule: &IngressRule) -> ProvisionResult<()> {
        let result = retry_when(&self.retry, "authorize ingress", CloudError::is_not_yet_visible, || {
            self.compute.authorize_ingress(group, rule)
        })
        .await
        .map_err(RetryError::into_inner);

        match result {
            Ok(()) => {
                debug!(group, from = rule.from_port, to = rule.to_port, "ingress authorized");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current policy of the cluster's group, if it exists.
    pub async fn describe_group(&self, ctx: &CloudContext) -> ProvisionResult<Option<SecurityGroupPolicy>> {
        Ok(Lookup::from(self.compute.describe_security_group(ctx.name()).await).found()?)
    }

    /// Delete the cluster's security group, waiting out dependency errors
    /// for as long as the retry policy allows. A group that is already
    /// gone counts as deleted.
    pub async fn delete_group(&self, ctx: &CloudContext) -> ProvisionResult<()> {
        let name = ctx.name();
        let result = retry_when(&self.retry, "delete security group", CloudError::is_dependency_in_use, || {
            self.compute.delete_security_group(name)
        })
        .await;

        match result {
            Ok(()) => {
                info!(group = %name, "security group deleted");
                Ok(())
            }
            Err(RetryError::Fatal(e)) if e.is_not_found() => {
                debug!(group = %name, "security group already gone");
                Ok(())
            }
            Err(RetryError::Fatal(e)) => Err(e.into()),
            Err(RetryError::Exhausted { last, waited, .. }) => Err(ProvisionError::DependencyInUse {
                resource: format!("security group {name}"),
                waited,
                source: last,
            }),
        }
    }

    // ── Identity ──────────────────────────────────────────────────

    /// Make sure the cluster role exists with the policy bundle, and that
    /// the cluster instance profile exists with exactly that role bound.
    ///
    /// A profile bound to some other role is rebound. A profile with more
    /// than one role is a consistency violation.
    pub async fn ensure_identity(&self, ctx: &CloudContext) -> ProvisionResult<IdentityProfile> {
        let name = ctx.identity_name();

        match Lookup::from(self.identity.get_role(&name).await) {
            Lookup::Found(role) => debug!(role = %role.name, "role exists"),
            Lookup::NotFound => match self.identity.create_role(&name, &assume_role_policy()).await {
                Ok(role) => info!(role = %role.name, arn = %role.arn, "role created"),
                Err(e) if e.is_already_exists() => debug!(role = %name, "role created concurrently"),
                Err(e) => return Err(e.into()),
            },
            Lookup::Failed(e) => return Err(e.into()),
        }

        let policies = policy_bundle();
        for (policy, document) in &policies {
            self.identity.put_role_policy(&name, policy, document).await?;
        }

        let profile = match Lookup::from(self.identity.get_instance_profile(&name).await) {
            Lookup::Found(profile) => profile,
            Lookup::NotFound => match self.identity.create_instance_profile(&name).await {
                Ok(profile) => {
                    info!(profile = %profile.name, "instance profile created");
                    profile
                }
                Err(e) if e.is_already_exists() => self.identity.get_instance_profile(&name).await?,
                Err(e) => return Err(e.into()),
            },
            Lookup::Failed(e) => return Err(e.into()),
        };

        match profile.roles.as_slice() {
            [bound] if *bound == name => {
                debug!(profile = %profile.name, "role already bound");
            }
            [] => self.bind_role(&profile.name, &name).await?,
            [other] => {
                warn!(profile = %profile.name, role = %other, "profile bound to a foreign role, rebinding");
                tolerate_not_found(
                    self.identity
                        .remove_role_from_instance_profile(&profile.name, other)
                        .await,
                )?;
                self.bind_role(&profile.name, &name).await?;
            }
            roles => {
                return Err(ProvisionError::ConsistencyViolation(format!(
                    "instance profile {} has {} roles bound, expected at most one",
                    profile.name,
                    roles.len()
                )));
            }
        }

        Ok(IdentityProfile {
            role_name: name,
            policies,
            profile_arn: profile.arn,
        })
    }

    /// A new role can take a while to become visible to the profile API.
    async fn bind_role(&self, profile: &str, role: &str) -> ProvisionResult<()> {
        retry_when(&self.retry, "add role to instance profile", CloudError::is_not_found, || {
            self.identity.add_role_to_instance_profile(profile, role)
        })
        .await
        .map_err(RetryError::into_inner)?;
        info!(profile, role, "role bound to instance profile");
        Ok(())
    }

    /// Delete the identity bound to `instance`, if any.
    ///
    /// Returns the profile name that was torn down.
    pub async fn teardown_identity(&self, instance: &InstanceRecord) -> ProvisionResult<Option<String>> {
        let Some(arn) = instance.profile_arn.as_deref() else {
            debug!(instance = %instance.id, "no instance profile bound");
            return Ok(None);
        };
        let profile = profile_name_from_arn(arn);
        self.teardown_profile(profile).await?;
        Ok(Some(profile.to_string()))
    }

    /// Tear down a profile and its same-named role in dependency order:
    /// unbind the role, drop its inline policies, delete the role, delete
    /// the profile.
    ///
    /// Not-found at any step means that step is already done. Every step is
    /// attempted even if an earlier one failed; the first failure is
    /// returned.
    pub async fn teardown_profile(&self, profile: &str) -> ProvisionResult<()> {
        let role = profile;
        let mut first_error: Option<CloudError> = None;
        let mut note = |step: &str, result: Result<bool, CloudError>| match result {
            Ok(true) => debug!(profile, step, "done"),
            Ok(false) => debug!(profile, step, "already gone"),
            Err(e) => {
                warn!(profile, step, error = %e, "identity teardown step failed");
                first_error.get_or_insert(e);
            }
        };

        note(
            "unbind role",
            tolerate_not_found(self.identity.remove_role_from_instance_profile(profile, role).await),
        );

        match Lookup::from(self.identity.list_role_policies(role).await) {
            Lookup::Found(policies) => {
                for policy in policies {
                    note(
                        "delete role policy",
                        tolerate_not_found(self.identity.delete_role_policy(role, &policy).await),
                    );
                }
            }
            Lookup::NotFound => note("delete role policies", Ok(false)),
            Lookup::Failed(e) => note("list role policies", Err(e)),
        }

        note("delete role", tolerate_not_found(self.identity.delete_role(role).await));
        note(
            "delete instance profile",
            tolerate_not_found(self.identity.delete_instance_profile(profile).await),
        );

        match first_error {
            Some(e) => Err(e.into()),
            None => {
                info!(profile, "identity torn down");
                Ok(())
            }
        }
    }
}
