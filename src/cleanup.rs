// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orphan cleanup and drift detection
//!
//! Resources are discovered by naming convention and checked against a
//! Terraform state snapshot. Anything the state tracks is left to
//! `terraform destroy`; only untracked matches are ever deleted here.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cloud::{CloudApi, ObjectVersion, Page};
use crate::config::Config;
use crate::confirm::{announce, require, Confirm};
use crate::error::{absent_ok, CloudResultExt, PaveError, Result};

/// Objects per `DeleteObjects` request
const DELETE_BATCH: usize = 1000;

/// Local Terraform artefacts removed by [`purge_local`]
pub const LOCAL_ARTEFACTS: [&str; 4] = [
    "terraform.tfstate",
    "terraform.tfstate.backup",
    ".terraform.lock.hcl",
    ".terraform",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceType {
    User,
    Role,
    Policy,
    Bucket,
}

impl ResourceType {
    /// Deletion order across types
    pub const ALL: [ResourceType; 4] = [
        ResourceType::User,
        ResourceType::Role,
        ResourceType::Policy,
        ResourceType::Bucket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::User => "user",
            ResourceType::Role => "role",
            ResourceType::Policy => "policy",
            ResourceType::Bucket => "bucket",
        }
    }

    /// The Terraform resource type declaring this kind of resource
    pub fn terraform_type(&self) -> &'static str {
        match self {
            ResourceType::User => "aws_iam_user",
            ResourceType::Role => "aws_iam_role",
            ResourceType::Policy => "aws_iam_policy",
            ResourceType::Bucket => "aws_s3_bucket",
        }
    }

    fn from_terraform_type(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.terraform_type() == name)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account resource that matched the naming convention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedResourceRecord {
    pub resource_type: ResourceType,
    pub identifier: String,
    /// The pattern the identifier matched
    pub naming_prefix: String,
    pub tracked_by_state: bool,
    /// Set for policies, which are deleted by ARN
    pub arn: Option<String>,
}

impl fmt::Display for ManagedResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.resource_type, self.identifier)
    }
}

/// Name filter for one resource type.
///
/// A name matches a pattern when it equals it or starts with `<pattern>-`.
/// Protected names never match.
#[derive(Debug, Clone, Default)]
pub struct NamingPredicate {
    patterns: Vec<String>,
    protected: BTreeSet<String>,
}

impl NamingPredicate {
    pub fn new<I, P>(patterns: I, protected: P) -> Self
    where
        I: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        Self {
            patterns: patterns.into_iter().collect(),
            protected: protected.into_iter().collect(),
        }
    }

    /// Predicate for `resource_type` from the naming section of `config`
    pub fn from_config(config: &Config, resource_type: ResourceType) -> Self {
        let bootstrap = &config.bootstrap;
        let protected = vec![
            bootstrap.user_name.clone(),
            bootstrap.role_name.clone(),
            bootstrap.policy_name.clone(),
            bootstrap.state_bucket.clone(),
        ];
        let patterns = match resource_type {
            ResourceType::User => &config.naming.users,
            ResourceType::Role => &config.naming.roles,
            ResourceType::Policy => &config.naming.policies,
            ResourceType::Bucket => &config.naming.buckets,
        };
        Self::new(patterns.iter().cloned(), protected)
    }

    /// The pattern `name` matches, if any
    pub fn matches(&self, name: &str) -> Option<&str> {
        if self.protected.contains(name) {
            return None;
        }
        self.patterns
            .iter()
            .find(|pattern| {
                name == pattern.as_str()
                    || name
                        .strip_prefix(pattern.as_str())
                        .is_some_and(|rest| rest.starts_with('-'))
            })
            .map(String::as_str)
    }
}

#[derive(Deserialize)]
struct StateFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    resources: Vec<StateResource>,
}

#[derive(Deserialize)]
struct StateResource {
    #[serde(default)]
    mode: String,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    instances: Vec<StateInstance>,
}

#[derive(Deserialize)]
struct StateInstance {
    #[serde(default)]
    attributes: serde_json::Value,
}

/// A resource declared in Terraform state
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackedResource {
    pub resource_type: ResourceType,
    pub identifier: String,
    pub arn: Option<String>,
}

/// Treatment of a snapshot that declares no managed resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmptyState {
    /// An empty snapshot is an error
    #[default]
    Refuse,
    /// An empty snapshot means nothing is tracked
    Allow,
}

/// The resources a Terraform state snapshot manages
#[derive(Debug, Clone, Default)]
pub struct TrackedState {
    resources: BTreeSet<TrackedResource>,
}

impl TrackedState {
    pub fn new<I: IntoIterator<Item = TrackedResource>>(resources: I) -> Self {
        Self {
            resources: resources.into_iter().collect(),
        }
    }

    /// Parse `terraform state pull` output.
    ///
    /// Blank output or a snapshot without managed resources is refused
    /// unless `empty` allows it: against such a snapshot every
    /// convention-named resource counts as orphaned.
    pub fn from_json(raw: &str, empty: EmptyState) -> Result<Self> {
        if raw.trim().is_empty() {
            return Self::empty_snapshot(empty, "Terraform state output is empty");
        }
        let state: StateFile = serde_json::from_str(raw)?;
        if state.version != 4 {
            return Err(PaveError::InvalidArgument {
                message: format!("unsupported Terraform state version {}", state.version),
            });
        }

        let managed: Vec<StateResource> = state
            .resources
            .into_iter()
            .filter(|r| r.mode == "managed")
            .collect();
        if managed.is_empty() {
            return Self::empty_snapshot(empty, "Terraform state declares no managed resources");
        }

        let mut resources = BTreeSet::new();
        for resource in managed {
            let Some(resource_type) = ResourceType::from_terraform_type(&resource.resource_type)
            else {
                continue;
            };
            for instance in resource.instances {
                let attribute = |key: &str| -> Option<String> {
                    instance
                        .attributes
                        .get(key)
                        .and_then(|v| v.as_str())
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                };
                let identifier = match resource_type {
                    ResourceType::Bucket => attribute("bucket").or_else(|| attribute("id")),
                    _ => attribute("name").or_else(|| attribute("id")),
                };
                if let Some(identifier) = identifier {
                    resources.insert(TrackedResource {
                        resource_type,
                        identifier,
                        arn: attribute("arn"),
                    });
                }
            }
        }
        Ok(Self { resources })
    }

    fn empty_snapshot(empty: EmptyState, reason: &str) -> Result<Self> {
        match empty {
            EmptyState::Allow => Ok(Self::default()),
            EmptyState::Refuse => Err(PaveError::Refused {
                message: format!(
                    "{reason}; every convention-named resource would count as orphaned \
                     (pass --allow-empty-state if the account really has no Terraform state)"
                ),
            }),
        }
    }

    pub fn contains(&self, resource_type: ResourceType, identifier: &str) -> bool {
        self.resources
            .iter()
            .any(|r| r.resource_type == resource_type && r.identifier == identifier)
    }

    pub fn of_type(
        &self,
        resource_type: ResourceType,
    ) -> impl Iterator<Item = &TrackedResource> {
        self.resources
            .iter()
            .filter(move |r| r.resource_type == resource_type)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// A resource as listed by the account
#[derive(Debug, Clone)]
struct Listed {
    name: String,
    arn: Option<String>,
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

impl Listed {
    fn new(name: String, arn: Option<String>) -> Self {
        Self { name, arn }
    }
}

async fn fetch_page(
    client: &dyn CloudApi,
    resource_type: ResourceType,
    token: Option<&str>,
) -> Result<Page<Listed>> {
    let page = match resource_type {
        ResourceType::User => {
            let page = client.list_users(token).await.op("ListUsers")?;
            Page {
                items: page
                    .items
                    .into_iter()
                    .map(|u| Listed::new(u.name, Some(u.arn)))
                    .collect(),
                next_token: page.next_token,
            }
        }
        ResourceType::Role => {
            let page = client.list_roles(token).await.op("ListRoles")?;
            Page {
                items: page
                    .items
                    .into_iter()
                    .map(|r| Listed::new(r.name, Some(r.arn)))
                    .collect(),
                next_token: page.next_token,
            }
        }
        ResourceType::Policy => {
            let page = client.list_policies(token).await.op("ListPolicies")?;
            Page {
                items: page
                    .items
                    .into_iter()
                    .map(|p| Listed::new(p.name, Some(p.arn)))
                    .collect(),
                next_token: page.next_token,
            }
        }
        ResourceType::Bucket => {
            let buckets = client.list_buckets().await.op("ListBuckets")?;
            Page::last(buckets.into_iter().map(|b| Listed::new(b.name, None)).collect())
        }
    };
    Ok(page)
}

/// Every resource of one type, fetched page by page as the stream is polled
fn list_all(
    client: Arc<dyn CloudApi>,
    resource_type: ResourceType,
) -> BoxStream<'static, Result<Listed>> {
    stream::try_unfold(Cursor::Start, move |cursor| {
        let client = Arc::clone(&client);
        async move {
            let token = match cursor {
                Cursor::Done => return Ok::<_, PaveError>(None),
                Cursor::Start => None,
                Cursor::Next(token) => Some(token),
            };
            let page = fetch_page(client.as_ref(), resource_type, token.as_deref()).await?;
            let next = page.next_token.map_or(Cursor::Done, Cursor::Next);
            Ok(Some((page.items, next)))
        }
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok::<Listed, PaveError>)))
    .try_flatten()
    .boxed()
}

/// Detach and delete everything that blocks deleting `user`
pub(crate) async fn clear_user(client: &dyn CloudApi, user: &str) -> Result<()> {
    let attached = client
        .list_attached_user_policies(user)
        .await
        .op("ListAttachedUserPolicies");
    for policy in absent_ok(attached)?.unwrap_or_default() {
        announce(&format!("detach policy {} from user {user}", policy.name));
        let detached = client.detach_user_policy(user, &policy.arn).await;
        absent_ok(detached.op("DetachUserPolicy"))?;
    }
    let inline = absent_ok(client.list_user_policies(user).await.op("ListUserPolicies"))?;
    for name in inline.unwrap_or_default() {
        announce(&format!("delete inline policy {name} of user {user}"));
        absent_ok(client.delete_user_policy(user, &name).await.op("DeleteUserPolicy"))?;
    }
    let keys = absent_ok(client.list_access_keys(user).await.op("ListAccessKeys"))?;
    for key in keys.unwrap_or_default() {
        announce(&format!("delete access key {}", key.access_key_id));
        let deleted = client.delete_access_key(user, &key.access_key_id).await;
        absent_ok(deleted.op("DeleteAccessKey"))?;
    }
    Ok(())
}

pub(crate) async fn clear_role(client: &dyn CloudApi, role: &str) -> Result<()> {
    let attached = client
        .list_attached_role_policies(role)
        .await
        .op("ListAttachedRolePolicies");
    for policy in absent_ok(attached)?.unwrap_or_default() {
        announce(&format!("detach policy {} from role {role}", policy.name));
        let detached = client.detach_role_policy(role, &policy.arn).await;
        absent_ok(detached.op("DetachRolePolicy"))?;
    }
    let inline = absent_ok(client.list_role_policies(role).await.op("ListRolePolicies"))?;
    for name in inline.unwrap_or_default() {
        announce(&format!("delete inline policy {name} of role {role}"));
        absent_ok(client.delete_role_policy(role, &name).await.op("DeleteRolePolicy"))?;
    }
    Ok(())
}

/// Detach `arn` from every entity and drop its non-default versions
pub(crate) async fn clear_policy(client: &dyn CloudApi, arn: &str, label: &str) -> Result<()> {
    let entities = client
        .list_entities_for_policy(arn)
        .await
        .op("ListEntitiesForPolicy");
    let Some(entities) = absent_ok(entities)? else {
        return Ok(());
    };
    for user in &entities.users {
        announce(&format!("detach {label} from user {user}"));
        absent_ok(client.detach_user_policy(user, arn).await.op("DetachUserPolicy"))?;
    }
    for role in &entities.roles {
        announce(&format!("detach {label} from role {role}"));
        absent_ok(client.detach_role_policy(role, arn).await.op("DetachRolePolicy"))?;
    }
    for group in &entities.groups {
        announce(&format!("detach {label} from group {group}"));
        absent_ok(client.detach_group_policy(group, arn).await.op("DetachGroupPolicy"))?;
    }

    let versions = absent_ok(client.list_policy_versions(arn).await.op("ListPolicyVersions"))?;
    for version in versions.unwrap_or_default().into_iter().filter(|v| !v.is_default) {
        announce(&format!("delete policy version {}", version.version_id));
        let deleted = client.delete_policy_version(arn, &version.version_id).await;
        absent_ok(deleted.op("DeletePolicyVersion"))?;
    }
    Ok(())
}

/// Delete every object version and delete marker in `bucket`
pub(crate) async fn empty_bucket(client: &dyn CloudApi, bucket: &str) -> Result<usize> {
    let mut versions: Vec<ObjectVersion> = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = client
            .list_object_versions(bucket, token.as_deref())
            .await
            .op("ListObjectVersions");
        let Some(page) = absent_ok(page)? else {
            return Ok(0);
        };
        versions.extend(page.items);
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    if !versions.is_empty() {
        announce(&format!("delete {} object versions from bucket {bucket}", versions.len()));
    }
    for batch in versions.chunks(DELETE_BATCH) {
        client.delete_objects(bucket, batch).await.op("DeleteObjects")?;
    }
    Ok(versions.len())
}

/// Outcome of a cleanup run
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub deleted: Vec<ManagedResourceRecord>,
    /// Matches left alone because Terraform state tracks them
    pub tracked: Vec<ManagedResourceRecord>,
}

/// Differences between Terraform state and the account
#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    /// In the account, matching the convention, absent from state
    pub orphans: Vec<ManagedResourceRecord>,
    /// In state, absent from the account
    pub missing: Vec<TrackedResource>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.missing.is_empty()
    }
}

pub struct Reconciler {
    client: Arc<dyn CloudApi>,
    tracked: TrackedState,
    predicates: Vec<(ResourceType, NamingPredicate)>,
}

impl Reconciler {
    pub fn new(config: &Config, client: Arc<dyn CloudApi>, tracked: TrackedState) -> Self {
        let predicates = ResourceType::ALL
            .into_iter()
            .map(|t| (t, NamingPredicate::from_config(config, t)))
            .collect();
        Self {
            client,
            tracked,
            predicates,
        }
    }

    fn predicate(&self, resource_type: ResourceType) -> Option<&NamingPredicate> {
        self.predicates
            .iter()
            .find(|(t, _)| *t == resource_type)
            .map(|(_, p)| p)
    }

    fn record(&self, resource_type: ResourceType, listed: Listed) -> Option<ManagedResourceRecord> {
        let prefix = self.predicate(resource_type)?.matches(&listed.name)?.to_string();
        Some(ManagedResourceRecord {
            resource_type,
            tracked_by_state: self.tracked.contains(resource_type, &listed.name),
            arn: if resource_type == ResourceType::Policy { listed.arn } else { None },
            identifier: listed.name,
            naming_prefix: prefix,
        })
    }

    /// Convention-matching resources of one type.
    ///
    /// Pages are requested only as the stream is polled and every call
    /// starts a fresh listing.
    pub fn list_candidates(
        &self,
        resource_type: ResourceType,
    ) -> BoxStream<'_, Result<ManagedResourceRecord>> {
        list_all(Arc::clone(&self.client), resource_type)
            .try_filter_map(move |listed| {
                futures::future::ready(Ok(self.record(resource_type, listed)))
            })
            .boxed()
    }

    pub async fn candidates(
        &self,
        resource_type: ResourceType,
    ) -> Result<Vec<ManagedResourceRecord>> {
        self.list_candidates(resource_type).try_collect().await
    }

    async fn resolve_dependencies(&self, record: &ManagedResourceRecord) -> Result<()> {
        let client = self.client.as_ref();
        match record.resource_type {
            ResourceType::User => clear_user(client, &record.identifier).await,
            ResourceType::Role => clear_role(client, &record.identifier).await,
            ResourceType::Policy => match &record.arn {
                Some(arn) => clear_policy(client, arn, &record.identifier).await,
                None => Ok(()),
            },
            ResourceType::Bucket => empty_bucket(client, &record.identifier).await.map(|_| ()),
        }
    }

    async fn delete_once(&self, record: &ManagedResourceRecord) -> Result<()> {
        let client = self.client.as_ref();
        let name = record.identifier.as_str();
        let result = match record.resource_type {
            ResourceType::User => client.delete_user(name).await.op("DeleteUser"),
            ResourceType::Role => client.delete_role(name).await.op("DeleteRole"),
            ResourceType::Policy => match &record.arn {
                Some(arn) => client.delete_policy(arn).await.op("DeletePolicy"),
                None => Err(PaveError::InvalidArgument {
                    message: format!("policy record {name} has no ARN"),
                }),
            },
            ResourceType::Bucket => client.delete_bucket(name).await.op("DeleteBucket"),
        };
        absent_ok(result).map(|_| ())
    }

    /// Delete one untracked resource after clearing what blocks it.
    ///
    /// A dependency error from the provider gets one more resolve and retry;
    /// a second one is returned.
    pub async fn delete(&self, record: &ManagedResourceRecord) -> Result<()> {
        if record.tracked_by_state {
            return Err(PaveError::Refused {
                message: format!("{record} is tracked by Terraform state; use `pave destroy`"),
            });
        }

        announce(&format!("delete {record}"));
        self.resolve_dependencies(record).await?;
        let result = match self.delete_once(record).await {
            Err(PaveError::Dependency { message, .. }) => {
                warn!(
                    resource = %record,
                    error = %message,
                    "Dependency left behind; resolving and retrying"
                );
                self.resolve_dependencies(record).await?;
                self.delete_once(record).await
            }
            other => other,
        };
        result?;
        info!(resource = %record, "Deleted");
        Ok(())
    }

    /// Delete every untracked candidate, users first and buckets last
    pub async fn run(&self, confirm: &dyn Confirm) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let mut pending = Vec::new();
        for resource_type in ResourceType::ALL {
            for record in self.candidates(resource_type).await? {
                if record.tracked_by_state {
                    report.tracked.push(record);
                } else {
                    pending.push(record);
                }
            }
        }

        for resource_type in ResourceType::ALL {
            let count = pending.iter().filter(|r| r.resource_type == resource_type).count();
            println!("  {:<8} {count} orphaned", resource_type.as_str());
        }
        if pending.is_empty() {
            info!(tracked = report.tracked.len(), "No orphaned resources");
            return Ok(report);
        }

        require(
            confirm,
            &format!(
                "delete {} untracked resources matching the naming convention",
                pending.len()
            ),
        )?;
        for record in pending {
            self.delete(&record).await?;
            report.deleted.push(record);
        }
        Ok(report)
    }

    /// Compare the account against the state snapshot without changing anything
    pub async fn drift(&self) -> Result<DriftReport> {
        let mut report = DriftReport::default();
        for resource_type in ResourceType::ALL {
            let listed: Vec<Listed> = list_all(Arc::clone(&self.client), resource_type)
                .try_collect()
                .await?;
            let present: BTreeSet<&str> = listed.iter().map(|l| l.name.as_str()).collect();

            report.missing.extend(
                self.tracked
                    .of_type(resource_type)
                    .filter(|r| !present.contains(r.identifier.as_str()))
                    .cloned(),
            );
            report.orphans.extend(
                listed
                    .iter()
                    .cloned()
                    .filter_map(|l| self.record(resource_type, l))
                    .filter(|r| !r.tracked_by_state),
            );
        }
        info!(
            orphans = report.orphans.len(),
            missing = report.missing.len(),
            "Drift check finished"
        );
        Ok(report)
    }
}

/// Remove local Terraform state and lock artefacts from `dir`
pub fn purge_local(dir: &Path, confirm: &dyn Confirm) -> Result<Vec<PathBuf>> {
    let present: Vec<PathBuf> = LOCAL_ARTEFACTS
        .iter()
        .map(|name| dir.join(name))
        .filter(|path| path.exists())
        .collect();
    if present.is_empty() {
        return Ok(present);
    }

    require(
        confirm,
        &format!(
            "remove {} local Terraform artefacts in {}",
            present.len(),
            dir.display()
        ),
    )?;
    for path in &present {
        announce(&format!("remove {}", path.display()));
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
    }
    Ok(present)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, Connector, MemoryCloud};
    use crate::confirm::{AssumeYes, ScriptedConfirm};
    use crate::credentials::IdentityKind;
    use crate::policy::{Effect, PolicyDocument, Statement};
    use tempfile::tempdir;

    fn client(cloud: &MemoryCloud) -> Arc<dyn CloudApi> {
        Arc::from(cloud.connect(&cloud.root_identity()))
    }

    fn reconciler(cloud: &MemoryCloud, tracked: TrackedState) -> Reconciler {
        Reconciler::new(&Config::default(), client(cloud), tracked)
    }

    fn document() -> PolicyDocument {
        PolicyDocument::default().with_statement(Statement::new(
            "ReadBuckets",
            Effect::Allow,
            ["s3:ListBucket"],
            ["*"],
        ))
    }

    #[test]
    fn test_naming_predicate() {
        let predicate = NamingPredicate::from_config(&Config::default(), ResourceType::User);
        assert_eq!(predicate.matches("admin-user"), Some("admin-user"));
        assert_eq!(predicate.matches("developer-user-staging"), Some("developer-user"));
        assert_eq!(predicate.matches("developer-users"), None);
        assert_eq!(predicate.matches("bootstrap-user"), None);

        let protected = NamingPredicate::new(
            vec!["PaveBootstrapPolicy".to_string()],
            vec!["PaveBootstrapPolicy".to_string()],
        );
        assert_eq!(protected.matches("PaveBootstrapPolicy"), None);

        let buckets = NamingPredicate::from_config(&Config::default(), ResourceType::Bucket);
        assert_eq!(buckets.matches("pave-tf-state-bucket-us-east-1"), None);
        assert_eq!(
            buckets.matches("pave-tf-state-bucket-dev"),
            Some("pave-tf-state-bucket")
        );
    }

    #[test]
    fn test_state_parsing() {
        let raw = r#"{
            "version": 4,
            "resources": [
                {"mode": "managed", "type": "aws_iam_user", "name": "dev",
                 "instances": [{"attributes": {
                     "name": "developer-user",
                     "arn": "arn:aws:iam::123456789012:user/developer-user"}}]},
                {"mode": "managed", "type": "aws_s3_bucket", "name": "state",
                 "instances": [{"attributes": {
                     "bucket": "pave-tf-state-bucket-prod",
                     "id": "pave-tf-state-bucket-prod"}}]},
                {"mode": "data", "type": "aws_iam_user", "name": "lookup",
                 "instances": [{"attributes": {"name": "admin-user"}}]},
                {"mode": "managed", "type": "aws_route53_zone", "name": "zone",
                 "instances": [{"attributes": {"name": "example.com"}}]}
            ]
        }"#;
        let state = TrackedState::from_json(raw, EmptyState::Refuse).unwrap();
        assert_eq!(state.len(), 2);
        assert!(state.contains(ResourceType::User, "developer-user"));
        assert!(state.contains(ResourceType::Bucket, "pave-tf-state-bucket-prod"));
        assert!(!state.contains(ResourceType::User, "admin-user"));

        assert!(TrackedState::from_json(r#"{"version": 3}"#, EmptyState::Allow).is_err());
    }

    #[test]
    fn test_empty_state_is_refused_unless_allowed() {
        let blank = TrackedState::from_json("  \n", EmptyState::Refuse).unwrap_err();
        assert!(matches!(blank, PaveError::Refused { .. }));
        assert!(blank.to_string().contains("--allow-empty-state"));

        let fresh = r#"{"version": 4, "resources": []}"#;
        let err = TrackedState::from_json(fresh, EmptyState::Refuse).unwrap_err();
        assert!(matches!(err, PaveError::Refused { .. }));

        assert!(TrackedState::from_json("", EmptyState::Allow).unwrap().is_empty());
        assert!(TrackedState::from_json(fresh, EmptyState::Allow).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_candidates_exhaust_pagination() {
        let cloud = MemoryCloud::new();
        cloud.set_page_size(2);
        for suffix in ["a", "b", "c", "d", "e"] {
            cloud.add_user(&format!("developer-user-{suffix}"));
        }
        cloud.add_user("someone-else");
        cloud.add_user("bootstrap-user");

        let reconciler = reconciler(&cloud, TrackedState::default());
        let first = reconciler.candidates(ResourceType::User).await.unwrap();
        assert_eq!(first.len(), 5);
        let second = reconciler.candidates(ResourceType::User).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_tracked_record_is_refused_without_calls() {
        let cloud = MemoryCloud::new();
        cloud.add_user("developer-user");
        let tracked = TrackedState::new([TrackedResource {
            resource_type: ResourceType::User,
            identifier: "developer-user".to_string(),
            arn: None,
        }]);
        let reconciler = reconciler(&cloud, tracked);
        let records = reconciler.candidates(ResourceType::User).await.unwrap();
        assert!(records[0].tracked_by_state);

        let before = cloud.call_count();
        let err = reconciler.delete(&records[0]).await.unwrap_err();
        assert!(matches!(err, PaveError::Refused { .. }));
        assert_eq!(cloud.call_count(), before);
        assert!(cloud.user_exists("developer-user"));
    }

    #[tokio::test]
    async fn test_delete_resolves_dependencies_and_retries_once() {
        let cloud = MemoryCloud::new();
        cloud.issue_identity("admin-user", IdentityKind::Admin);
        let arn = cloud.add_policy("PaveAdminPolicy", document());
        cloud.attach_user_policy("admin-user", &arn);
        cloud.put_user_policy("admin-user", "inline", document());
        cloud.fail_next(
            "DeleteUser",
            CloudError::new(
                "DeleteConflict",
                "Cannot delete entity, must delete login profile first.",
            ),
        );

        let reconciler = reconciler(&cloud, TrackedState::default());
        let record = reconciler.candidates(ResourceType::User).await.unwrap().remove(0);
        reconciler.delete(&record).await.unwrap();
        assert!(!cloud.user_exists("admin-user"));
        let deletes = cloud.calls().iter().filter(|c| c.as_str() == "DeleteUser").count();
        assert_eq!(deletes, 2);
    }

    #[tokio::test]
    async fn test_second_dependency_failure_propagates() {
        let cloud = MemoryCloud::new();
        cloud.add_role("DeveloperRole");
        for _ in 0..2 {
            cloud.fail_next(
                "DeleteRole",
                CloudError::new(
                    "DeleteConflict",
                    "Cannot delete entity, must remove roles from instance profile first.",
                ),
            );
        }

        let reconciler = reconciler(&cloud, TrackedState::default());
        let record = reconciler.candidates(ResourceType::Role).await.unwrap().remove(0);
        let err = reconciler.delete(&record).await.unwrap_err();
        assert!(matches!(err, PaveError::Dependency { .. }));
        assert!(cloud.role_exists("DeveloperRole"));
    }

    #[tokio::test]
    async fn test_run_empties_buckets_and_skips_tracked() {
        let cloud = MemoryCloud::new();
        cloud.add_bucket("pave-tf-state-bucket-dev");
        cloud.put_object("pave-tf-state-bucket-dev", "terraform.tfstate");
        cloud.put_object("pave-tf-state-bucket-dev", "terraform.tfstate");
        cloud.add_user("developer-user");
        let arn = cloud.add_policy("CICDS3SpecificAccess", document());
        cloud.add_policy_version(&arn, document());
        let tracked = TrackedState::new([TrackedResource {
            resource_type: ResourceType::User,
            identifier: "developer-user".to_string(),
            arn: None,
        }]);

        let reconciler = reconciler(&cloud, tracked);
        let report = reconciler.run(&AssumeYes).await.unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.tracked.len(), 1);
        assert!(!cloud.has_bucket("pave-tf-state-bucket-dev"));
        assert!(!cloud.policy_exists("CICDS3SpecificAccess"));
        assert!(cloud.user_exists("developer-user"));
    }

    #[tokio::test]
    async fn test_run_spares_state_bucket_with_empty_state() {
        let cloud = MemoryCloud::new();
        let state_bucket = Config::default().bootstrap.state_bucket;
        cloud.add_bucket(&state_bucket);
        cloud.put_object(&state_bucket, "pave/terraform.tfstate");
        cloud.add_bucket("pave-tf-state-bucket-scratch");

        let tracked = TrackedState::from_json("", EmptyState::Allow).unwrap();
        let report = reconciler(&cloud, tracked).run(&AssumeYes).await.unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.deleted[0].identifier, "pave-tf-state-bucket-scratch");
        assert!(cloud.has_bucket(&state_bucket));
        assert!(!cloud.calls().iter().any(|c| c == "DeleteObjects"));
    }

    #[tokio::test]
    async fn test_run_declined_deletes_nothing() {
        let cloud = MemoryCloud::new();
        cloud.add_role("DeveloperRole");
        let reconciler = reconciler(&cloud, TrackedState::default());
        let err = reconciler.run(&ScriptedConfirm::answering(["no"])).await.unwrap_err();
        assert!(matches!(err, PaveError::Cancelled { .. }));
        assert!(cloud.role_exists("DeveloperRole"));
    }

    #[tokio::test]
    async fn test_drift_reports_orphans_and_missing() {
        let cloud = MemoryCloud::new();
        cloud.add_user("admin-user");
        cloud.add_user("developer-user");
        let tracked = TrackedState::new([
            TrackedResource {
                resource_type: ResourceType::User,
                identifier: "developer-user".to_string(),
                arn: None,
            },
            TrackedResource {
                resource_type: ResourceType::Role,
                identifier: "CICDDeploymentRole".to_string(),
                arn: None,
            },
        ]);

        let drift = reconciler(&cloud, tracked).drift().await.unwrap();
        assert_eq!(drift.orphans.len(), 1);
        assert_eq!(drift.orphans[0].identifier, "admin-user");
        assert_eq!(drift.missing.len(), 1);
        assert_eq!(drift.missing[0].identifier, "CICDDeploymentRole");
        assert!(!drift.is_clean());
    }

    #[test]
    fn test_purge_local_removes_artefacts() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("terraform.tfstate"), "{}").unwrap();
        std::fs::create_dir(dir.path().join(".terraform")).unwrap();
        std::fs::write(dir.path().join("main.tf"), "").unwrap();

        let removed = purge_local(dir.path(), &AssumeYes).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(dir.path().join("main.tf").exists());
        assert!(!dir.path().join(".terraform").exists());
        assert!(purge_local(dir.path(), &ScriptedConfirm::default()).unwrap().is_empty());
    }
}
