//! In-memory sandbox cloud.
//!
//! `SandboxCloud` implements every collaborator trait against a single
//! in-memory model. It reproduces the provider behaviours the provisioner
//! has to cope with: instances that boot in stages, spot requests that are
//! only partly fulfilled, security groups that are not visible right after
//! creation or still held by terminating instances, and roles that cannot
//! be attached to a profile immediately after they are created.
//!
//! Every call is appended to a journal so tests can assert on exactly
//! which requests were made. The whole model serializes to JSON, which is
//! how the CLI keeps a sandbox alive between invocations.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use flotilla_core::boot::{NODE_OS_IMAGE_OWNER, NODE_OS_RELEASE};
use flotilla_core::{
    ImageInfo, IngressRule, InstanceHealth, InstanceId, InstanceRecord, LifecycleState, NodeSpec,
    SecurityGroupPolicy, SpotRequest, SpotRequestState,
};

use crate::compute::{ComputeApi, InstanceFilter};
use crate::error::{CloudError, CloudResult, RemoteError};
use crate::identity::{IdentityApi, InstanceProfileInfo, RoleInfo};
use crate::remote::{PortProbe, RemoteExec};

/// Behaviour knobs of the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxKnobs {
    pub account_id: String,
    /// Zone reported by `discover_zone`.
    pub zone: Option<String>,
    pub images: Vec<ImageInfo>,
    /// Most instances a single spot request batch is granted.
    pub spot_capacity: Option<u32>,
    /// `authorize_ingress` calls that fail as "not yet visible" after a
    /// group is created.
    pub group_visibility_lag: u32,
    /// `delete_security_group` calls that fail as "dependent object" after
    /// the last instance in the group is gone.
    pub group_delete_lag: u32,
    /// `add_role_to_instance_profile` calls that fail as "no such entity"
    /// after a role is created.
    pub role_attach_lag: u32,
    /// Observations before a pending instance reports running.
    pub pending_polls: u32,
    /// Further observations before a running instance gets addresses.
    pub ip_polls: u32,
    /// Port probes per host that fail before SSH accepts connections.
    pub ssh_closed_probes: u32,
    /// Process listings per host before the container daemon shows up.
    pub docker_polls: u32,
    /// Container listings per host before the appliance shows up.
    pub appliance_polls: u32,
}

impl Default for SandboxKnobs {
    fn default() -> Self {
        Self {
            account_id: "123456789012".to_string(),
            zone: Some("us-west-2a".to_string()),
            images: vec![ImageInfo {
                id: "ami-0sandbox".to_string(),
                owner: NODE_OS_IMAGE_OWNER.to_string(),
                description: Some(format!("CoreOS {NODE_OS_RELEASE} (HVM)")),
            }],
            spot_capacity: None,
            group_visibility_lag: 0,
            group_delete_lag: 0,
            role_attach_lag: 0,
            pending_polls: 1,
            ip_polls: 0,
            ssh_closed_probes: 0,
            docker_polls: 0,
            appliance_polls: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstance {
    pub record: InstanceRecord,
    /// Times the instance has been described.
    pub observations: u32,
    /// Role container the boot script starts (`leader` / `worker`).
    pub container: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxGroup {
    pub id: String,
    pub policy: SecurityGroupPolicy,
    pub invisible_for: u32,
    pub delete_lag: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxRole {
    pub arn: String,
    pub policies: BTreeMap<String, String>,
}

/// The complete sandbox model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxState {
    pub knobs: SandboxKnobs,
    /// Logical launch clock, seconds since the epoch.
    pub clock: i64,
    pub next_id: u64,
    pub instances: BTreeMap<InstanceId, SandboxInstance>,
    pub spot_requests: BTreeMap<String, SpotRequest>,
    pub groups: BTreeMap<String, SandboxGroup>,
    pub roles: BTreeMap<String, SandboxRole>,
    pub profiles: BTreeMap<String, InstanceProfileInfo>,
    pub impaired: BTreeSet<InstanceId>,
    /// Roles still invisible to profile attachment, with remaining lag.
    pub attach_lag: BTreeMap<String, u32>,
    pub port_probes: BTreeMap<String, u32>,
    pub docker_checks: BTreeMap<String, u32>,
    pub appliance_checks: BTreeMap<String, u32>,
    /// One-shot failures, keyed by operation, returned by its next call.
    pub faults: BTreeMap<String, CloudError>,
    pub journal: Vec<String>,
}

impl SandboxState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }

    fn record(&mut self, op: &str, arg: &str) {
        self.journal.push(format!("{op}:{arg}"));
    }

    /// Journal a provider call and fail it if a fault is queued for `op`.
    fn call(&mut self, op: &str, arg: &str) -> CloudResult<()> {
        self.record(op, arg);
        match self.faults.remove(op) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        DateTime::from_timestamp(self.clock, 0).unwrap_or_else(Utc::now)
    }

    fn launch(&mut self, spec: &NodeSpec, spot_request_id: Option<String>) -> CloudResult<InstanceRecord> {
        if !self.groups.contains_key(&spec.security_group) {
            return Err(group_not_found(&spec.security_group));
        }
        if !self.profiles.values().any(|p| p.arn == spec.profile_arn) {
            return Err(CloudError::new(
                400,
                "InvalidParameterValue",
                format!("Value ({}) for parameter iamInstanceProfile.arn is invalid", spec.profile_arn),
            ));
        }

        let id = self.next("i");
        let launch_time = self.tick();
        let record = InstanceRecord {
            id: id.clone(),
            machine_type: spec.machine_type.clone(),
            launch_time,
            state: LifecycleState::Pending,
            private_ip: None,
            public_ip: None,
            spot_request_id,
            profile_arn: Some(spec.profile_arn.clone()),
            security_groups: vec![spec.security_group.clone()],
            tags: spec.tags.clone(),
        };
        let container = container_from_boot_script(&spec.boot_script);
        self.instances.insert(
            id,
            SandboxInstance {
                record: record.clone(),
                observations: 0,
                container,
            },
        );
        Ok(record)
    }

    /// Advance an instance one observation and return its new snapshot.
    fn observe(&mut self, id: &str) -> Option<InstanceRecord> {
        let knobs = self.knobs.clone();
        let seq = self.instances.keys().position(|k| k == id)? as u32 + 1;
        let inst = self.instances.get_mut(id)?;
        inst.observations += 1;

        let rec = &mut inst.record;
        if rec.state == LifecycleState::Pending && inst.observations >= knobs.pending_polls {
            rec.state = LifecycleState::Running;
        }
        if rec.state == LifecycleState::Running
            && rec.private_ip.is_none()
            && inst.observations >= knobs.pending_polls + knobs.ip_polls
        {
            rec.private_ip = Some(format!("10.0.{}.{}", seq / 250, seq % 250 + 4));
            rec.public_ip = Some(format!("54.10.{}.{}", seq / 250, seq % 250 + 4));
        }
        Some(rec.clone())
    }

    fn instance_by_host(&self, host: &str) -> Option<&SandboxInstance> {
        self.instances.values().find(|i| {
            i.record.state == LifecycleState::Running
                && (i.record.public_ip.as_deref() == Some(host)
                    || i.record.private_ip.as_deref() == Some(host))
        })
    }
}

fn container_from_boot_script(script: &str) -> Option<String> {
    script
        .lines()
        .find_map(|l| l.trim().strip_prefix("--name="))
        .map(|s| s.trim_end_matches(['\\', ' ']).to_string())
}

fn group_not_found(name: &str) -> CloudError {
    CloudError::new(
        400,
        "InvalidGroup.NotFound",
        format!("The security group '{name}' does not exist"),
    )
}

fn no_such_entity(kind: &str, name: &str) -> CloudError {
    CloudError::new(404, "NoSuchEntity", format!("The {kind} with name {name} cannot be found."))
}

fn delete_conflict(message: &str) -> CloudError {
    CloudError::new(409, "DeleteConflict", message)
}

/// In-memory implementation of the compute, identity, remote-exec, and
/// port-probe collaborators.
#[derive(Debug, Default)]
pub struct SandboxCloud {
    state: Mutex<SandboxState>,
}

impl SandboxCloud {
    pub fn new(knobs: SandboxKnobs) -> Self {
        let state = SandboxState {
            knobs,
            clock: Utc::now().timestamp(),
            ..SandboxState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Restore a sandbox saved with [`SandboxCloud::save`].
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: SandboxState = serde_json::from_str(&content).map_err(std::io::Error::other)?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&*self.lock()).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Read the model.
    pub fn inspect<R>(&self, f: impl FnOnce(&SandboxState) -> R) -> R {
        f(&self.lock())
    }

    /// Change the model directly, bypassing the API.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut SandboxState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Make the provider's status checks fail for an instance.
    pub fn mark_impaired(&self, id: &str) {
        self.lock().impaired.insert(id.to_string());
    }

    /// Make the next call of operation `op` fail with `error`.
    pub fn fail_next(&self, op: &str, error: CloudError) {
        self.lock().faults.insert(op.to_string(), error);
    }

    /// Number of journaled calls of operation `op`.
    pub fn calls(&self, op: &str) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|entry| entry.split(':').next() == Some(op))
            .count()
    }

    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── Compute ───────────────────────────────────────────────────────

#[async_trait]
impl ComputeApi for SandboxCloud {
    async fn account_id(&self) -> CloudResult<String> {
        let mut s = self.lock();
        s.call("account_id", "")?;
        Ok(s.knobs.account_id.clone())
    }

    async fn discover_zone(&self) -> CloudResult<Option<String>> {
        let mut s = self.lock();
        s.call("discover_zone", "")?;
        Ok(s.knobs.zone.clone())
    }

    async fn describe_images(&self, owner: &str) -> CloudResult<Vec<ImageInfo>> {
        let mut s = self.lock();
        s.call("describe_images", owner)?;
        Ok(s.knobs.images.iter().filter(|i| i.owner == owner).cloned().collect())
    }

    async fn run_instances(&self, spec: &NodeSpec, count: u32) -> CloudResult<Vec<InstanceRecord>> {
        let mut s = self.lock();
        s.call("run_instances", &count.to_string())?;
        (0..count).map(|_| s.launch(spec, None)).collect()
    }

    async fn request_spot_instances(
        &self,
        spec: &NodeSpec,
        count: u32,
        price: f64,
    ) -> CloudResult<Vec<InstanceRecord>> {
        let mut s = self.lock();
        s.call("request_spot_instances", &count.to_string())?;
        let granted = s.knobs.spot_capacity.map_or(count, |cap| cap.min(count));

        let mut launched = Vec::new();
        for i in 0..count {
            let request_id = s.next("sir");
            let instance_id = if i < granted {
                let record = s.launch(spec, Some(request_id.clone()))?;
                let id = record.id.clone();
                launched.push(record);
                Some(id)
            } else {
                None
            };
            let request = SpotRequest {
                id: request_id.clone(),
                price,
                state: if instance_id.is_some() {
                    SpotRequestState::Active
                } else {
                    SpotRequestState::Open
                },
                instance_id,
                tags: spec.tags.clone(),
            };
            s.spot_requests.insert(request_id, request);
        }
        debug!(requested = count, granted, "sandbox spot request");
        Ok(launched)
    }

    async fn describe_instances(&self, filter: &InstanceFilter) -> CloudResult<Vec<InstanceRecord>> {
        let mut s = self.lock();
        s.call("describe_instances", filter.state.as_str())?;
        let ids: Vec<_> = s.instances.keys().cloned().collect();
        let mut out = Vec::new();
        for id in ids {
            if let Some(record) = s.observe(&id) {
                if filter.matches(&record) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    async fn describe_instance(&self, id: &str) -> CloudResult<InstanceRecord> {
        let mut s = self.lock();
        s.call("describe_instance", id)?;
        s.observe(id).ok_or_else(|| {
            CloudError::new(
                400,
                "InvalidInstanceID.NotFound",
                format!("The instance ID '{id}' does not exist"),
            )
        })
    }

    async fn describe_instance_status(&self, ids: &[InstanceId]) -> CloudResult<Vec<InstanceHealth>> {
        let mut s = self.lock();
        s.call("describe_instance_status", &ids.join(","))?;
        Ok(ids
            .iter()
            .map(|id| InstanceHealth {
                instance_id: id.clone(),
                impaired: s.impaired.contains(id),
            })
            .collect())
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("terminate_instances", &ids.join(","))?;
        if let Some(missing) = ids.iter().find(|id| !s.instances.contains_key(*id)) {
            return Err(CloudError::new(
                400,
                "InvalidInstanceID.NotFound",
                format!("The instance ID '{missing}' does not exist"),
            ));
        }
        for id in ids {
            if let Some(inst) = s.instances.get_mut(id) {
                inst.record.state = LifecycleState::Terminated;
            }
        }
        Ok(())
    }

    async fn describe_spot_requests(
        &self,
        tag_key: &str,
        tag_value: &str,
    ) -> CloudResult<Vec<SpotRequest>> {
        let mut s = self.lock();
        s.call("describe_spot_requests", tag_value)?;
        Ok(s.spot_requests
            .values()
            .filter(|r| r.tags.get(tag_key).map(String::as_str) == Some(tag_value))
            .cloned()
            .collect())
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("cancel_spot_requests", &ids.join(","))?;
        for id in ids {
            match s.spot_requests.get_mut(id) {
                Some(r) => r.state = SpotRequestState::Cancelled,
                None => {
                    return Err(CloudError::new(
                        400,
                        "InvalidSpotInstanceRequestID.NotFound",
                        format!("The spot instance request ID '{id}' does not exist"),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn create_security_group(&self, name: &str, _description: &str) -> CloudResult<String> {
        let mut s = self.lock();
        s.call("create_security_group", name)?;
        if s.groups.contains_key(name) {
            return Err(CloudError::new(
                400,
                "InvalidGroup.Duplicate",
                format!("The security group '{name}' already exists"),
            ));
        }
        let id = s.next("sg");
        let group = SandboxGroup {
            id: id.clone(),
            policy: SecurityGroupPolicy {
                group_name: name.to_string(),
                ingress: Vec::new(),
            },
            invisible_for: s.knobs.group_visibility_lag,
            delete_lag: s.knobs.group_delete_lag,
        };
        s.groups.insert(name.to_string(), group);
        Ok(id)
    }

    async fn authorize_ingress(&self, group: &str, rule: &IngressRule) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("authorize_ingress", group)?;
        let g = s.groups.get_mut(group).ok_or_else(|| group_not_found(group))?;
        if g.invisible_for > 0 {
            g.invisible_for -= 1;
            return Err(CloudError::new(
                400,
                "InvalidGroup.NotFound",
                format!("The security group '{group}' does not exist in default VPC"),
            ));
        }
        if g.policy.ingress.contains(rule) {
            return Err(CloudError::new(
                400,
                "InvalidPermission.Duplicate",
                "the specified rule already exists",
            ));
        }
        g.policy.ingress.push(rule.clone());
        Ok(())
    }

    async fn revoke_ingress(&self, group: &str, rule: &IngressRule) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("revoke_ingress", group)?;
        let g = s.groups.get_mut(group).ok_or_else(|| group_not_found(group))?;
        let before = g.policy.ingress.len();
        g.policy.ingress.retain(|r| r != rule);
        if g.policy.ingress.len() == before {
            return Err(CloudError::new(
                400,
                "InvalidPermission.NotFound",
                "The specified rule does not exist in this security group.",
            ));
        }
        Ok(())
    }

    async fn describe_security_group(&self, name: &str) -> CloudResult<SecurityGroupPolicy> {
        let mut s = self.lock();
        s.call("describe_security_group", name)?;
        s.groups
            .get(name)
            .map(|g| g.policy.clone())
            .ok_or_else(|| group_not_found(name))
    }

    async fn delete_security_group(&self, name: &str) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("delete_security_group", name)?;
        let in_use = s.instances.values().any(|i| {
            i.record.state != LifecycleState::Terminated
                && i.record.security_groups.iter().any(|g| g == name)
        });
        let g = s.groups.get_mut(name).ok_or_else(|| group_not_found(name))?;
        let dependency = || {
            CloudError::new(
                400,
                "DependencyViolation",
                format!("resource {} has a dependent object", name),
            )
        };
        if in_use {
            return Err(dependency());
        }
        if g.delete_lag > 0 {
            g.delete_lag -= 1;
            return Err(dependency());
        }
        s.groups.remove(name);
        Ok(())
    }
}

// ── Identity ──────────────────────────────────────────────────────

#[async_trait]
impl IdentityApi for SandboxCloud {
    async fn get_role(&self, name: &str) -> CloudResult<RoleInfo> {
        let mut s = self.lock();
        s.call("get_role", name)?;
        s.roles
            .get(name)
            .map(|r| RoleInfo {
                name: name.to_string(),
                arn: r.arn.clone(),
            })
            .ok_or_else(|| no_such_entity("role", name))
    }

    async fn create_role(&self, name: &str, _assume_role_policy: &str) -> CloudResult<RoleInfo> {
        let mut s = self.lock();
        s.call("create_role", name)?;
        if s.roles.contains_key(name) {
            return Err(CloudError::new(
                409,
                "EntityAlreadyExists",
                format!("Role with name {name} already exists."),
            ));
        }
        let arn = format!("arn:aws:iam::{}:role/{name}", s.knobs.account_id);
        s.roles.insert(
            name.to_string(),
            SandboxRole {
                arn: arn.clone(),
                policies: BTreeMap::new(),
            },
        );
        let lag = s.knobs.role_attach_lag;
        if lag > 0 {
            s.attach_lag.insert(name.to_string(), lag);
        }
        Ok(RoleInfo {
            name: name.to_string(),
            arn,
        })
    }

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("put_role_policy", &format!("{role}/{policy_name}"))?;
        let r = s.roles.get_mut(role).ok_or_else(|| no_such_entity("role", role))?;
        r.policies.insert(policy_name.to_string(), document.to_string());
        Ok(())
    }

    async fn list_role_policies(&self, role: &str) -> CloudResult<Vec<String>> {
        let mut s = self.lock();
        s.call("list_role_policies", role)?;
        s.roles
            .get(role)
            .map(|r| r.policies.keys().cloned().collect())
            .ok_or_else(|| no_such_entity("role", role))
    }

    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("delete_role_policy", &format!("{role}/{policy_name}"))?;
        let r = s.roles.get_mut(role).ok_or_else(|| no_such_entity("role", role))?;
        r.policies
            .remove(policy_name)
            .map(|_| ())
            .ok_or_else(|| no_such_entity("role policy", policy_name))
    }

    async fn delete_role(&self, role: &str) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("delete_role", role)?;
        let r = s.roles.get(role).ok_or_else(|| no_such_entity("role", role))?;
        if !r.policies.is_empty() {
            return Err(delete_conflict("Cannot delete entity, must delete policies first."));
        }
        if s.profiles.values().any(|p| p.roles.iter().any(|n| n == role)) {
            return Err(delete_conflict(
                "Cannot delete entity, must remove roles from instance profile first.",
            ));
        }
        s.roles.remove(role);
        Ok(())
    }

    async fn get_instance_profile(&self, name: &str) -> CloudResult<InstanceProfileInfo> {
        let mut s = self.lock();
        s.call("get_instance_profile", name)?;
        s.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| no_such_entity("instance profile", name))
    }

    async fn create_instance_profile(&self, name: &str) -> CloudResult<InstanceProfileInfo> {
        let mut s = self.lock();
        s.call("create_instance_profile", name)?;
        if s.profiles.contains_key(name) {
            return Err(CloudError::new(
                409,
                "EntityAlreadyExists",
                format!("Instance Profile {name} already exists."),
            ));
        }
        let profile = InstanceProfileInfo {
            name: name.to_string(),
            arn: format!("arn:aws:iam::{}:instance-profile/{name}", s.knobs.account_id),
            roles: Vec::new(),
        };
        s.profiles.insert(name.to_string(), profile.clone());
        Ok(profile)
    }

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("add_role_to_instance_profile", &format!("{profile}/{role}"))?;
        if !s.profiles.contains_key(profile) {
            return Err(no_such_entity("instance profile", profile));
        }
        if !s.roles.contains_key(role) {
            return Err(no_such_entity("role", role));
        }
        if let Some(lag) = s.attach_lag.get_mut(role) {
            *lag -= 1;
            if *lag == 0 {
                s.attach_lag.remove(role);
            }
            return Err(no_such_entity("role", role));
        }
        let p = s
            .profiles
            .get_mut(profile)
            .ok_or_else(|| no_such_entity("instance profile", profile))?;
        if !p.roles.is_empty() {
            return Err(CloudError::new(
                409,
                "LimitExceeded",
                "Cannot exceed quota for InstanceSessionsPerInstanceProfile: 1",
            ));
        }
        p.roles.push(role.to_string());
        Ok(())
    }

    async fn remove_role_from_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("remove_role_from_instance_profile", &format!("{profile}/{role}"))?;
        let p = s
            .profiles
            .get_mut(profile)
            .ok_or_else(|| no_such_entity("instance profile", profile))?;
        let before = p.roles.len();
        p.roles.retain(|r| r != role);
        if p.roles.len() == before {
            return Err(no_such_entity("role", role));
        }
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> CloudResult<()> {
        let mut s = self.lock();
        s.call("delete_instance_profile", name)?;
        let p = s
            .profiles
            .get(name)
            .ok_or_else(|| no_such_entity("instance profile", name))?;
        if !p.roles.is_empty() {
            return Err(delete_conflict(
                "Cannot delete entity, must remove roles from instance profile first.",
            ));
        }
        s.profiles.remove(name);
        Ok(())
    }
}

// ── Nodes ─────────────────────────────────────────────────────────

#[async_trait]
impl PortProbe for SandboxCloud {
    async fn is_open(&self, host: &str, port: u16, _timeout: Duration) -> bool {
        let mut s = self.lock();
        s.record("probe", &format!("{host}:{port}"));
        if s.instance_by_host(host).is_none() {
            return false;
        }
        let closed_for = s.knobs.ssh_closed_probes;
        let seen = s.port_probes.entry(host.to_string()).or_insert(0);
        *seen += 1;
        *seen > closed_for
    }
}

#[async_trait]
impl RemoteExec for SandboxCloud {
    async fn exec(&self, host: &str, command: &str) -> Result<String, RemoteError> {
        let mut s = self.lock();
        s.record("exec", &format!("{host} {command}"));
        let container = match s.instance_by_host(host) {
            Some(inst) => inst.container.clone(),
            None => {
                return Err(RemoteError::Failed {
                    host: host.to_string(),
                    status: 255,
                    stderr: format!("ssh: connect to host {host} port 22: Connection refused"),
                });
            }
        };

        let grep_line = format!("core      2201  0.0  0.0   6740   900 pts/0    S+   10:00   0:00 grep {command}");
        if command.contains("dockerd") {
            let needed = s.knobs.docker_polls;
            let seen = s.docker_checks.entry(host.to_string()).or_insert(0);
            *seen += 1;
            let mut out = String::new();
            if *seen > needed {
                out.push_str("root       811  0.4  1.9 731232 39012 ?        Ssl  09:58   0:02 /usr/bin/dockerd --host=fd://\n");
            }
            out.push_str(&grep_line);
            out.push('\n');
            return Ok(out);
        }

        if command.starts_with("docker ps") {
            let needed = s.knobs.appliance_polls;
            let seen = s.appliance_checks.entry(host.to_string()).or_insert(0);
            *seen += 1;
            if *seen > needed {
                if let Some(name) = container {
                    return Ok(format!("{name}\n"));
                }
            }
            return Ok(String::new());
        }

        Ok(String::new())
    }

    async fn attach(&self, host: &str, command: &str, tty: bool) -> Result<(), RemoteError> {
        let mut s = self.lock();
        s.record("attach", &format!("{host} tty={tty} {command}"));
        if s.instance_by_host(host).is_none() {
            return Err(RemoteError::Failed {
                host: host.to_string(),
                status: 255,
                stderr: format!("ssh: connect to host {host} port 22: Connection refused"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{BootScript, CLUSTER_TAG, StorageMapping};

    fn spec(cloud: &SandboxCloud) -> NodeSpec {
        let arn = cloud.mutate(|s| {
            let arn = "arn:aws:iam::123456789012:instance-profile/p".to_string();
            s.profiles.insert(
                "p".to_string(),
                InstanceProfileInfo {
                    name: "p".to_string(),
                    arn: arn.clone(),
                    roles: vec![],
                },
            );
            arn
        });
        NodeSpec {
            machine_type: "m3.large".to_string(),
            image_id: "ami-0sandbox".to_string(),
            boot_script: BootScript::leader("img", "c1").render(),
            storage: StorageMapping::default(),
            security_group: "c1".to_string(),
            profile_arn: arn,
            key_name: None,
            spot_bid: None,
            tags: BTreeMap::from([(CLUSTER_TAG.to_string(), "c1".to_string())]),
        }
    }

    #[test]
    fn container_name_is_read_from_boot_script() {
        let script = BootScript::worker("img", "10.0.0.1", false).render();
        assert_eq!(container_from_boot_script(&script).as_deref(), Some("worker"));
    }

    #[tokio::test]
    async fn launch_requires_group() {
        let cloud = SandboxCloud::default();
        let spec = spec(&cloud);
        let err = cloud.run_instances(&spec, 1).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn instances_boot_in_stages() {
        let cloud = SandboxCloud::new(SandboxKnobs {
            pending_polls: 2,
            ip_polls: 1,
            ..SandboxKnobs::default()
        });
        cloud.create_security_group("c1", "test").await.unwrap();
        let spec = spec(&cloud);
        let launched = cloud.run_instances(&spec, 1).await.unwrap();
        let id = &launched[0].id;
        assert_eq!(launched[0].state, LifecycleState::Pending);

        let first = cloud.describe_instance(id).await.unwrap();
        assert_eq!(first.state, LifecycleState::Pending);
        let second = cloud.describe_instance(id).await.unwrap();
        assert_eq!(second.state, LifecycleState::Running);
        assert!(second.private_ip.is_none());
        let third = cloud.describe_instance(id).await.unwrap();
        assert!(third.private_ip.is_some());
        assert!(third.public_ip.is_some());
    }

    #[tokio::test]
    async fn spot_capacity_limits_fulfillment() {
        let cloud = SandboxCloud::new(SandboxKnobs {
            spot_capacity: Some(1),
            ..SandboxKnobs::default()
        });
        cloud.create_security_group("c1", "test").await.unwrap();
        let spec = spec(&cloud);
        let granted = cloud.request_spot_instances(&spec, 3, 0.2).await.unwrap();
        assert_eq!(granted.len(), 1);
        assert!(granted[0].is_preemptable());

        let requests = cloud.describe_spot_requests(CLUSTER_TAG, "c1").await.unwrap();
        assert_eq!(requests.len(), 3);
        let open = requests.iter().filter(|r| r.state == SpotRequestState::Open).count();
        assert_eq!(open, 2);
    }

    #[tokio::test]
    async fn group_delete_blocked_by_live_instance() {
        let cloud = SandboxCloud::default();
        cloud.create_security_group("c1", "test").await.unwrap();
        let spec = spec(&cloud);
        let launched = cloud.run_instances(&spec, 1).await.unwrap();

        let err = cloud.delete_security_group("c1").await.unwrap_err();
        assert!(err.is_dependency_in_use());

        cloud.terminate_instances(&[launched[0].id.clone()]).await.unwrap();
        cloud.delete_security_group("c1").await.unwrap();
        assert!(cloud.delete_security_group("c1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn visibility_lag_on_fresh_group() {
        let cloud = SandboxCloud::new(SandboxKnobs {
            group_visibility_lag: 1,
            ..SandboxKnobs::default()
        });
        cloud.create_security_group("c1", "test").await.unwrap();
        let rule = SecurityGroupPolicy::cluster_default("c1").ingress[0].clone();
        let err = cloud.authorize_ingress("c1", &rule).await.unwrap_err();
        assert!(err.is_not_yet_visible());
        cloud.authorize_ingress("c1", &rule).await.unwrap();
    }

    #[tokio::test]
    async fn queued_fault_fails_one_call() {
        let cloud = SandboxCloud::default();
        cloud.fail_next("create_security_group", CloudError::new(500, "InternalError", "boom"));

        let err = cloud.create_security_group("c1", "test").await.unwrap_err();
        assert_eq!(err.status, 500);
        cloud.create_security_group("c1", "test").await.unwrap();
        assert_eq!(cloud.calls("create_security_group"), 2);
    }

    #[tokio::test]
    async fn ssh_and_docker_come_up_after_polls() {
        let cloud = SandboxCloud::new(SandboxKnobs {
            pending_polls: 0,
            ssh_closed_probes: 1,
            docker_polls: 1,
            ..SandboxKnobs::default()
        });
        cloud.create_security_group("c1", "test").await.unwrap();
        let spec = spec(&cloud);
        let launched = cloud.run_instances(&spec, 1).await.unwrap();
        let rec = cloud.describe_instance(&launched[0].id).await.unwrap();
        let host = rec.public_ip.unwrap();

        assert!(!cloud.is_open(&host, 22, Duration::from_secs(1)).await);
        assert!(cloud.is_open(&host, 22, Duration::from_secs(1)).await);

        let first = cloud.exec(&host, "ps aux | grep dockerd").await.unwrap();
        assert!(!first.contains("/usr/bin/dockerd"));
        let second = cloud.exec(&host, "ps aux | grep dockerd").await.unwrap();
        assert!(second.contains("/usr/bin/dockerd"));
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let cloud = SandboxCloud::default();
        cloud.create_security_group("c1", "test").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.json");
        cloud.save(&path).unwrap();

        let restored = SandboxCloud::load(&path).unwrap();
        assert!(restored.inspect(|s| s.groups.contains_key("c1")));
        assert_eq!(restored.calls("create_security_group"), 1);
    }
}
