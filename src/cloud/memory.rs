// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process AWS account
//!
//! Keys authenticate like the real service: only while active, propagated
//! and owned by an existing principal. Requests by IAM users are checked
//! against their inline and attached managed policies, so deny statements
//! behave as they do in the account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    AccessKeyMetadata, AccessKeyStatus, AttachedPolicy, Bucket, BucketSettings, CallerIdentity,
    CloudApi, CloudError, CloudResult, Connector, IamRole, IamUser, ManagedPolicy, NewAccessKey,
    ObjectVersion, Page, PolicyEntities, PolicyVersion, Tag,
};
use crate::credentials::{Identity, IdentityKind, Secret};
use crate::policy::{evaluate_all, evaluate_resource_policy, Decision, PolicyDocument, Request};

const ROOT_OWNER: &str = "root";
const DEFAULT_PAGE_SIZE: usize = 100;

/// Shared handle on one simulated account
#[derive(Debug, Clone)]
pub struct MemoryCloud {
    inner: Arc<Mutex<Account>>,
}

#[derive(Debug)]
struct Account {
    account_id: String,
    region: String,
    next_id: u64,
    root_key: (String, Secret),
    users: BTreeMap<String, UserRecord>,
    keys: BTreeMap<String, KeyRecord>,
    policies: BTreeMap<String, PolicyRecord>,
    roles: BTreeMap<String, RoleRecord>,
    buckets: BTreeMap<String, BucketRecord>,
    secrets: BTreeMap<String, Secret>,
    /// Resource policies keyed by secret ARN
    secret_policies: BTreeMap<String, PolicyDocument>,
    failures: Vec<(String, CloudError)>,
    calls: Vec<String>,
    delay_propagation: bool,
    page_size: usize,
}

#[derive(Debug)]
struct UserRecord {
    arn: String,
    user_id: String,
    attached: BTreeSet<String>,
    inline: BTreeMap<String, PolicyDocument>,
}

#[derive(Debug)]
struct KeyRecord {
    owner: String,
    secret: Secret,
    status: AccessKeyStatus,
    created_at: DateTime<Utc>,
    propagated: bool,
}

#[derive(Debug)]
struct PolicyRecord {
    name: String,
    versions: Vec<(String, PolicyDocument, bool)>,
    groups: BTreeSet<String>,
}

impl PolicyRecord {
    fn default_document(&self) -> Option<&PolicyDocument> {
        self.versions
            .iter()
            .find(|(_, _, is_default)| *is_default)
            .map(|(_, document, _)| document)
    }
}

#[derive(Debug)]
struct RoleRecord {
    arn: String,
    attached: BTreeSet<String>,
    inline: BTreeMap<String, PolicyDocument>,
}

#[derive(Debug, Default)]
struct BucketRecord {
    objects: Vec<ObjectVersion>,
    versioning: bool,
    encryption: bool,
    block_public_access: bool,
}

enum Principal {
    Root,
    User(String),
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::with_account("123456789012", "us-east-1")
    }

    pub fn with_account(account_id: &str, region: &str) -> Self {
        let root_key = ("AKIA0000000000000000".to_string(), Secret::new("root-secret"));
        let mut keys = BTreeMap::new();
        keys.insert(
            root_key.0.clone(),
            KeyRecord {
                owner: ROOT_OWNER.to_string(),
                secret: root_key.1.clone(),
                status: AccessKeyStatus::Active,
                created_at: Utc::now(),
                propagated: true,
            },
        );
        let account = Account {
            account_id: account_id.to_string(),
            region: region.to_string(),
            next_id: 1,
            root_key,
            users: BTreeMap::new(),
            keys,
            policies: BTreeMap::new(),
            roles: BTreeMap::new(),
            buckets: BTreeMap::new(),
            secrets: BTreeMap::new(),
            secret_policies: BTreeMap::new(),
            failures: Vec::new(),
            calls: Vec::new(),
            delay_propagation: false,
            page_size: DEFAULT_PAGE_SIZE,
        };
        Self {
            inner: Arc::new(Mutex::new(account)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Account> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn account_id(&self) -> String {
        self.lock().account_id.clone()
    }

    /// Credentials of the account root
    pub fn root_identity(&self) -> Identity {
        let account = self.lock();
        let (key_id, secret) = &account.root_key;
        Identity::new(
            ROOT_OWNER,
            IdentityKind::Root,
            key_id.clone(),
            secret.expose(),
            account.region.clone(),
        )
    }

    /// Create a user directly, bypassing authorization
    pub fn add_user(&self, name: &str) -> IamUser {
        let mut account = self.lock();
        account.insert_user(name)
    }

    /// Issue an active key for an existing user and return it as an identity
    pub fn issue_identity(&self, user: &str, kind: IdentityKind) -> Identity {
        let mut account = self.lock();
        if !account.users.contains_key(user) {
            account.insert_user(user);
        }
        let key = account.insert_key(user);
        Identity::new(
            user,
            kind,
            key.access_key_id,
            key.secret_access_key.expose(),
            account.region.clone(),
        )
    }

    pub fn put_user_policy(&self, user: &str, name: &str, document: PolicyDocument) {
        let mut account = self.lock();
        if let Some(record) = account.users.get_mut(user) {
            record.inline.insert(name.to_string(), document);
        }
    }

    /// Create a managed policy directly and return its ARN
    pub fn add_policy(&self, name: &str, document: PolicyDocument) -> String {
        let mut account = self.lock();
        let arn = account.policy_arn(name);
        account.policies.insert(
            arn.clone(),
            PolicyRecord {
                name: name.to_string(),
                versions: vec![("v1".to_string(), document, true)],
                groups: BTreeSet::new(),
            },
        );
        arn
    }

    /// Add a non-default version to a managed policy
    pub fn add_policy_version(&self, arn: &str, document: PolicyDocument) {
        let mut account = self.lock();
        if let Some(policy) = account.policies.get_mut(arn) {
            let version_id = format!("v{}", policy.versions.len() + 1);
            policy.versions.push((version_id, document, false));
        }
    }

    pub fn attach_user_policy(&self, user: &str, arn: &str) {
        let mut account = self.lock();
        if let Some(record) = account.users.get_mut(user) {
            record.attached.insert(arn.to_string());
        }
    }

    pub fn attach_group_policy(&self, group: &str, arn: &str) {
        let mut account = self.lock();
        if let Some(policy) = account.policies.get_mut(arn) {
            policy.groups.insert(group.to_string());
        }
    }

    pub fn add_role(&self, name: &str) -> IamRole {
        let mut account = self.lock();
        let arn = format!("arn:aws:iam::{}:role/{name}", account.account_id);
        account.roles.insert(
            name.to_string(),
            RoleRecord {
                arn: arn.clone(),
                attached: BTreeSet::new(),
                inline: BTreeMap::new(),
            },
        );
        IamRole {
            name: name.to_string(),
            arn,
        }
    }

    pub fn attach_role_policy(&self, role: &str, arn: &str) {
        let mut account = self.lock();
        if let Some(record) = account.roles.get_mut(role) {
            record.attached.insert(arn.to_string());
        }
    }

    pub fn put_role_policy(&self, role: &str, name: &str, document: PolicyDocument) {
        let mut account = self.lock();
        if let Some(record) = account.roles.get_mut(role) {
            record.inline.insert(name.to_string(), document);
        }
    }

    pub fn add_bucket(&self, name: &str) {
        self.lock().buckets.insert(name.to_string(), BucketRecord::default());
    }

    pub fn put_object(&self, bucket: &str, key: &str) {
        let mut account = self.lock();
        let version = format!("ver{:08}", account.next_id());
        if let Some(record) = account.buckets.get_mut(bucket) {
            record.objects.push(ObjectVersion {
                key: key.to_string(),
                version_id: Some(version),
            });
        }
    }

    /// Keys created while set never authenticate
    pub fn set_delay_key_propagation(&self, delay: bool) {
        self.lock().delay_propagation = delay;
    }

    pub fn set_page_size(&self, size: usize) {
        self.lock().page_size = size.max(1);
    }

    /// Fail the next call of `operation` with `error`; queued per call
    pub fn fail_next(&self, operation: &str, error: CloudError) {
        self.lock().failures.push((operation.to_string(), error));
    }

    /// Operation names of every API call received, in order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn key_status(&self, key_id: &str) -> Option<AccessKeyStatus> {
        self.lock().keys.get(key_id).map(|key| key.status)
    }

    pub fn access_keys_of(&self, user: &str) -> Vec<String> {
        self.lock()
            .keys
            .iter()
            .filter(|(_, key)| key.owner == user)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove a user together with its keys, as if deleted out of band
    pub fn drop_user(&self, name: &str) {
        let mut account = self.lock();
        account.users.remove(name);
        account.keys.retain(|_, key| key.owner != name);
    }

    pub fn user_exists(&self, name: &str) -> bool {
        self.lock().users.contains_key(name)
    }

    pub fn role_exists(&self, name: &str) -> bool {
        self.lock().roles.contains_key(name)
    }

    pub fn policy_exists(&self, name: &str) -> bool {
        self.lock().policies.values().any(|policy| policy.name == name)
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.lock().buckets.contains_key(name)
    }

    /// Versioning, encryption and public access block of a bucket
    pub fn bucket_hardening(&self, name: &str) -> Option<(bool, bool, bool)> {
        self.lock()
            .buckets
            .get(name)
            .map(|b| (b.versioning, b.encryption, b.block_public_access))
    }

    pub fn attached_user_policies(&self, user: &str) -> Vec<String> {
        self.lock()
            .users
            .get(user)
            .map(|record| record.attached.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn secret_value(&self, name: &str) -> Option<String> {
        self.lock().secrets.get(name).map(|s| s.expose().to_string())
    }

    pub fn secret_policy(&self, name: &str) -> Option<PolicyDocument> {
        let account = self.lock();
        let arn = account.secret_arn(name);
        account.secret_policies.get(&arn).cloned()
    }
}

impl Connector for MemoryCloud {
    fn connect(&self, identity: &Identity) -> Box<dyn CloudApi> {
        Box::new(MemorySession {
            cloud: self.clone(),
            access_key_id: identity.access_key_id.clone(),
            secret: identity.secret_access_key.clone(),
        })
    }
}

impl Account {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn user_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:user/{name}", self.account_id)
    }

    fn role_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:role/{name}", self.account_id)
    }

    fn policy_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:policy/{name}", self.account_id)
    }

    fn secret_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:secretsmanager:{}:{}:secret:{name}",
            self.region, self.account_id
        )
    }

    fn insert_user(&mut self, name: &str) -> IamUser {
        let arn = self.user_arn(name);
        let user_id = format!("AIDA{:016}", self.next_id());
        self.users.insert(
            name.to_string(),
            UserRecord {
                arn: arn.clone(),
                user_id,
                attached: BTreeSet::new(),
                inline: BTreeMap::new(),
            },
        );
        IamUser {
            name: name.to_string(),
            arn,
        }
    }

    fn insert_key(&mut self, owner: &str) -> NewAccessKey {
        let id = self.next_id();
        let access_key_id = format!("AKIA{id:016}");
        let secret = Secret::new(format!("memory-secret-{id:032}"));
        let created_at = Utc::now();
        self.keys.insert(
            access_key_id.clone(),
            KeyRecord {
                owner: owner.to_string(),
                secret: secret.clone(),
                status: AccessKeyStatus::Active,
                created_at,
                propagated: !self.delay_propagation,
            },
        );
        NewAccessKey {
            user_name: owner.to_string(),
            access_key_id,
            secret_access_key: secret,
            created_at,
        }
    }

    fn authenticate(&self, key_id: &str, secret: &Secret) -> CloudResult<Principal> {
        let invalid = || {
            CloudError::new(
                "InvalidClientTokenId",
                "The security token included in the request is invalid.",
            )
        };
        let key = self.keys.get(key_id).ok_or_else(invalid)?;
        if &key.secret != secret {
            return Err(CloudError::new(
                "SignatureDoesNotMatch",
                "The request signature we calculated does not match the signature you provided.",
            ));
        }
        if key.status != AccessKeyStatus::Active || !key.propagated {
            return Err(invalid());
        }
        if key.owner == ROOT_OWNER {
            Ok(Principal::Root)
        } else if self.users.contains_key(&key.owner) {
            Ok(Principal::User(key.owner.clone()))
        } else {
            Err(invalid())
        }
    }

    fn decide(&self, user: &str, action: &str, resource: &str) -> Decision {
        let Some(record) = self.users.get(user) else {
            return Decision::ImplicitDeny;
        };
        let managed = record
            .attached
            .iter()
            .filter_map(|arn| self.policies.get(arn))
            .filter_map(PolicyRecord::default_document);
        evaluate_all(record.inline.values().chain(managed), action, resource)
    }

    fn authorize(
        &mut self,
        key_id: &str,
        secret: &Secret,
        operation: &str,
        action: &str,
        resource: &str,
    ) -> CloudResult<Principal> {
        self.calls.push(operation.to_string());
        if let Some(index) = self.failures.iter().position(|(op, _)| op == operation) {
            let (_, error) = self.failures.remove(index);
            return Err(error);
        }

        let principal = self.authenticate(key_id, secret)?;
        if action == "sts:GetCallerIdentity" {
            return Ok(principal);
        }
        let principal_arn = match &principal {
            Principal::Root => format!("arn:aws:iam::{}:root", self.account_id),
            Principal::User(name) => self.user_arn(name),
        };
        let request = Request {
            principal_arn: &principal_arn,
            action,
            resource,
        };
        let resource_decision = self
            .secret_policies
            .get(resource)
            .map(|document| evaluate_resource_policy(document, &request));
        if resource_decision == Some(Decision::ExplicitDeny) {
            return Err(access_denied(
                &request,
                " with an explicit deny in a resource-based policy",
            ));
        }
        let Principal::User(name) = &principal else {
            return Ok(principal);
        };
        match self.decide(name, action, resource) {
            Decision::ExplicitDeny => Err(access_denied(
                &request,
                " with an explicit deny in an identity-based policy",
            )),
            Decision::Allow => Ok(principal),
            Decision::ImplicitDeny if resource_decision == Some(Decision::Allow) => Ok(principal),
            Decision::ImplicitDeny => Err(access_denied(
                &request,
                " because no identity-based policy allows the action",
            )),
        }
    }

    fn page<T: Clone>(&self, items: &[T], token: Option<&str>) -> CloudResult<Page<T>> {
        let start = match token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| {
                    CloudError::new("InvalidInput", format!("Invalid pagination token {token}"))
                })?,
            None => 0,
        };
        let end = (start + self.page_size).min(items.len());
        let slice = items.get(start..end).unwrap_or_default().to_vec();
        Ok(Page {
            items: slice,
            next_token: (end < items.len()).then(|| end.to_string()),
        })
    }
}

fn access_denied(request: &Request<'_>, suffix: &str) -> CloudError {
    CloudError::new(
        "AccessDenied",
        format!(
            "User: {} is not authorized to perform: {} on resource: {}{suffix}",
            request.principal_arn, request.action, request.resource
        ),
    )
}

fn no_such_entity(kind: &str, name: &str) -> CloudError {
    CloudError::new("NoSuchEntity", format!("The {kind} with name {name} cannot be found."))
}

fn delete_conflict(message: &str) -> CloudError {
    CloudError::new("DeleteConflict", message)
}

fn must_detach_policies() -> CloudError {
    delete_conflict("Cannot delete entity, must detach all policies first.")
}

fn no_such_policy(arn: &str) -> CloudError {
    CloudError::new("NoSuchEntity", format!("Policy {arn} was not found."))
}

fn no_such_bucket() -> CloudError {
    CloudError::new("NoSuchBucket", "The specified bucket does not exist")
}

fn no_such_secret() -> CloudError {
    CloudError::new(
        "ResourceNotFoundException",
        "Secrets Manager can't find the specified secret.",
    )
}

/// A client bound to one access key of a [`MemoryCloud`]
#[derive(Debug)]
pub struct MemorySession {
    cloud: MemoryCloud,
    access_key_id: String,
    secret: Secret,
}

impl MemorySession {
    fn call<T>(
        &self,
        operation: &str,
        action: &str,
        resource: impl FnOnce(&Account) -> String,
        body: impl FnOnce(&mut Account, Principal) -> CloudResult<T>,
    ) -> CloudResult<T> {
        let mut guard = self.cloud.lock();
        let account = &mut *guard;
        let resource = resource(&*account);
        let principal =
            account.authorize(&self.access_key_id, &self.secret, operation, action, &resource)?;
        body(account, principal)
    }
}

#[async_trait]
impl CloudApi for MemorySession {
    async fn caller_identity(&self) -> CloudResult<CallerIdentity> {
        self.call(
            "GetCallerIdentity",
            "sts:GetCallerIdentity",
            |_| "*".into(),
            |account, principal| {
                Ok(match principal {
                    Principal::Root => CallerIdentity {
                        account: account.account_id.clone(),
                        arn: format!("arn:aws:iam::{}:root", account.account_id),
                        user_id: account.account_id.clone(),
                    },
                    Principal::User(name) => {
                        let record = account
                            .users
                            .get(&name)
                            .ok_or_else(|| no_such_entity("user", &name))?;
                        CallerIdentity {
                            account: account.account_id.clone(),
                            arn: record.arn.clone(),
                            user_id: record.user_id.clone(),
                        }
                    }
                })
            },
        )
    }

    async fn get_user(&self, name: &str) -> CloudResult<IamUser> {
        self.call("GetUser", "iam:GetUser", |a| a.user_arn(name), |account, _| {
            let record = account.users.get(name).ok_or_else(|| no_such_entity("user", name))?;
            Ok(IamUser {
                name: name.to_string(),
                arn: record.arn.clone(),
            })
        })
    }

    async fn create_user(&self, name: &str, _tags: &[Tag]) -> CloudResult<IamUser> {
        self.call("CreateUser", "iam:CreateUser", |a| a.user_arn(name), |account, _| {
            if account.users.contains_key(name) {
                return Err(CloudError::new(
                    "EntityAlreadyExists",
                    format!("User with name {name} already exists."),
                ));
            }
            Ok(account.insert_user(name))
        })
    }

    async fn delete_user(&self, name: &str) -> CloudResult<()> {
        self.call("DeleteUser", "iam:DeleteUser", |a| a.user_arn(name), |account, _| {
            let record = account.users.get(name).ok_or_else(|| no_such_entity("user", name))?;
            if account.keys.values().any(|key| key.owner == name) {
                return Err(delete_conflict("Cannot delete entity, must delete access keys first."));
            }
            if !record.attached.is_empty() {
                return Err(must_detach_policies());
            }
            if !record.inline.is_empty() {
                return Err(delete_conflict("Cannot delete entity, must delete policies first."));
            }
            account.users.remove(name);
            Ok(())
        })
    }

    async fn list_users(&self, token: Option<&str>) -> CloudResult<Page<IamUser>> {
        self.call("ListUsers", "iam:ListUsers", |_| "*".into(), |account, _| {
            let users: Vec<IamUser> = account
                .users
                .iter()
                .map(|(name, record)| IamUser {
                    name: name.clone(),
                    arn: record.arn.clone(),
                })
                .collect();
            account.page(&users, token)
        })
    }

    async fn create_access_key(&self, user: &str) -> CloudResult<NewAccessKey> {
        self.call("CreateAccessKey", "iam:CreateAccessKey", |a| a.user_arn(user), |account, _| {
            if !account.users.contains_key(user) {
                return Err(no_such_entity("user", user));
            }
            if account.keys.values().filter(|key| key.owner == user).count() >= 2 {
                return Err(CloudError::new(
                    "LimitExceeded",
                    "Cannot exceed quota for AccessKeysPerUser: 2",
                ));
            }
            Ok(account.insert_key(user))
        })
    }

    async fn list_access_keys(&self, user: &str) -> CloudResult<Vec<AccessKeyMetadata>> {
        self.call("ListAccessKeys", "iam:ListAccessKeys", |a| a.user_arn(user), |account, _| {
            if !account.users.contains_key(user) {
                return Err(no_such_entity("user", user));
            }
            Ok(account
                .keys
                .iter()
                .filter(|(_, key)| key.owner == user)
                .map(|(id, key)| AccessKeyMetadata {
                    access_key_id: id.clone(),
                    status: key.status,
                    created_at: Some(key.created_at),
                })
                .collect())
        })
    }

    async fn update_access_key(
        &self,
        user: &str,
        key_id: &str,
        status: AccessKeyStatus,
    ) -> CloudResult<()> {
        self.call("UpdateAccessKey", "iam:UpdateAccessKey", |a| a.user_arn(user), |account, _| {
            match account.keys.get_mut(key_id) {
                Some(key) if key.owner == user => {
                    key.status = status;
                    Ok(())
                }
                _ => Err(CloudError::new(
                    "NoSuchEntity",
                    format!("The Access Key with id {key_id} cannot be found."),
                )),
            }
        })
    }

    async fn delete_access_key(&self, user: &str, key_id: &str) -> CloudResult<()> {
        self.call("DeleteAccessKey", "iam:DeleteAccessKey", |a| a.user_arn(user), |account, _| {
            if !account.keys.get(key_id).is_some_and(|key| key.owner == user) {
                return Err(CloudError::new(
                    "NoSuchEntity",
                    format!("The Access Key with id {key_id} cannot be found."),
                ));
            }
            account.keys.remove(key_id);
            Ok(())
        })
    }

    async fn create_policy(
        &self,
        name: &str,
        document: &PolicyDocument,
        _description: &str,
        _tags: &[Tag],
    ) -> CloudResult<ManagedPolicy> {
        self.call("CreatePolicy", "iam:CreatePolicy", |a| a.policy_arn(name), |account, _| {
            let arn = account.policy_arn(name);
            if account.policies.contains_key(&arn) {
                return Err(CloudError::new(
                    "EntityAlreadyExists",
                    format!(
                        "A policy called {name} already exists. Duplicate names are not allowed."
                    ),
                ));
            }
            account.policies.insert(
                arn.clone(),
                PolicyRecord {
                    name: name.to_string(),
                    versions: vec![("v1".to_string(), document.clone(), true)],
                    groups: BTreeSet::new(),
                },
            );
            Ok(ManagedPolicy {
                name: name.to_string(),
                arn,
            })
        })
    }

    async fn delete_policy(&self, arn: &str) -> CloudResult<()> {
        self.call("DeletePolicy", "iam:DeletePolicy", |_| arn.to_string(), |account, _| {
            let policy = account
                .policies
                .get(arn)
                .ok_or_else(|| no_such_policy(arn))?;
            let attached = !policy.groups.is_empty()
                || account.users.values().any(|u| u.attached.contains(arn))
                || account.roles.values().any(|r| r.attached.contains(arn));
            if attached {
                return Err(delete_conflict("Cannot delete a policy attached to entities."));
            }
            if policy.versions.len() > 1 {
                return Err(delete_conflict(
                    "This policy has more than one version. \
                     Before you delete a policy, you must delete the policy's versions.",
                ));
            }
            account.policies.remove(arn);
            Ok(())
        })
    }

    async fn list_policies(&self, token: Option<&str>) -> CloudResult<Page<ManagedPolicy>> {
        self.call("ListPolicies", "iam:ListPolicies", |_| "*".into(), |account, _| {
            let policies: Vec<ManagedPolicy> = account
                .policies
                .iter()
                .map(|(arn, policy)| ManagedPolicy {
                    name: policy.name.clone(),
                    arn: arn.clone(),
                })
                .collect();
            account.page(&policies, token)
        })
    }

    async fn list_policy_versions(&self, arn: &str) -> CloudResult<Vec<PolicyVersion>> {
        self.call(
            "ListPolicyVersions",
            "iam:ListPolicyVersions",
            |_| arn.to_string(),
            |account, _| {
                let policy = account
                    .policies
                    .get(arn)
                    .ok_or_else(|| no_such_policy(arn))?;
                Ok(policy
                    .versions
                    .iter()
                    .map(|(id, _, is_default)| PolicyVersion {
                        version_id: id.clone(),
                        is_default: *is_default,
                    })
                    .collect())
            },
        )
    }

    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> CloudResult<()> {
        self.call(
            "DeletePolicyVersion",
            "iam:DeletePolicyVersion",
            |_| arn.to_string(),
            |account, _| {
                let policy = account
                    .policies
                    .get_mut(arn)
                    .ok_or_else(|| no_such_policy(arn))?;
                let index = policy
                    .versions
                    .iter()
                    .position(|(id, _, _)| id == version_id)
                    .ok_or_else(|| {
                        CloudError::new(
                            "NoSuchEntity",
                            format!("Policy version {version_id} was not found."),
                        )
                    })?;
                if policy.versions[index].2 {
                    return Err(delete_conflict("Cannot delete the default version of a policy."));
                }
                policy.versions.remove(index);
                Ok(())
            },
        )
    }

    async fn list_entities_for_policy(&self, arn: &str) -> CloudResult<PolicyEntities> {
        self.call(
            "ListEntitiesForPolicy",
            "iam:ListEntitiesForPolicy",
            |_| arn.to_string(),
            |account, _| {
                let policy = account
                    .policies
                    .get(arn)
                    .ok_or_else(|| no_such_policy(arn))?;
                Ok(PolicyEntities {
                    users: account
                        .users
                        .iter()
                        .filter(|(_, u)| u.attached.contains(arn))
                        .map(|(name, _)| name.clone())
                        .collect(),
                    roles: account
                        .roles
                        .iter()
                        .filter(|(_, r)| r.attached.contains(arn))
                        .map(|(name, _)| name.clone())
                        .collect(),
                    groups: policy.groups.iter().cloned().collect(),
                })
            },
        )
    }

    async fn attach_user_policy(&self, user: &str, arn: &str) -> CloudResult<()> {
        self.call("AttachUserPolicy", "iam:AttachUserPolicy", |a| a.user_arn(user), |account, _| {
            if !account.policies.contains_key(arn) {
                return Err(CloudError::new(
                    "NoSuchEntity",
                    format!("Policy {arn} does not exist or is not attachable."),
                ));
            }
            let record = account.users.get_mut(user).ok_or_else(|| no_such_entity("user", user))?;
            record.attached.insert(arn.to_string());
            Ok(())
        })
    }

    async fn detach_user_policy(&self, user: &str, arn: &str) -> CloudResult<()> {
        self.call("DetachUserPolicy", "iam:DetachUserPolicy", |a| a.user_arn(user), |account, _| {
            let record = account.users.get_mut(user).ok_or_else(|| no_such_entity("user", user))?;
            if !record.attached.remove(arn) {
                return Err(no_such_policy(arn));
            }
            Ok(())
        })
    }

    async fn list_attached_user_policies(&self, user: &str) -> CloudResult<Vec<AttachedPolicy>> {
        self.call(
            "ListAttachedUserPolicies",
            "iam:ListAttachedUserPolicies",
            |a| a.user_arn(user),
            |account, _| {
                let record = account.users.get(user).ok_or_else(|| no_such_entity("user", user))?;
                Ok(record
                    .attached
                    .iter()
                    .map(|arn| AttachedPolicy {
                        name: account
                            .policies
                            .get(arn)
                            .map(|p| p.name.clone())
                            .unwrap_or_default(),
                        arn: arn.clone(),
                    })
                    .collect())
            },
        )
    }

    async fn list_user_policies(&self, user: &str) -> CloudResult<Vec<String>> {
        self.call("ListUserPolicies", "iam:ListUserPolicies", |a| a.user_arn(user), |account, _| {
            let record = account.users.get(user).ok_or_else(|| no_such_entity("user", user))?;
            Ok(record.inline.keys().cloned().collect())
        })
    }

    async fn delete_user_policy(&self, user: &str, name: &str) -> CloudResult<()> {
        self.call("DeleteUserPolicy", "iam:DeleteUserPolicy", |a| a.user_arn(user), |account, _| {
            let record = account.users.get_mut(user).ok_or_else(|| no_such_entity("user", user))?;
            record
                .inline
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| no_such_entity("policy", name))
        })
    }

    async fn detach_group_policy(&self, group: &str, arn: &str) -> CloudResult<()> {
        self.call(
            "DetachGroupPolicy",
            "iam:DetachGroupPolicy",
            |a| format!("arn:aws:iam::{}:group/{group}", a.account_id),
            |account, _| {
                let policy = account
                    .policies
                    .get_mut(arn)
                    .ok_or_else(|| no_such_policy(arn))?;
                if !policy.groups.remove(group) {
                    return Err(no_such_entity("group", group));
                }
                Ok(())
            },
        )
    }

    async fn list_roles(&self, token: Option<&str>) -> CloudResult<Page<IamRole>> {
        self.call("ListRoles", "iam:ListRoles", |_| "*".into(), |account, _| {
            let roles: Vec<IamRole> = account
                .roles
                .iter()
                .map(|(name, record)| IamRole {
                    name: name.clone(),
                    arn: record.arn.clone(),
                })
                .collect();
            account.page(&roles, token)
        })
    }

    async fn delete_role(&self, name: &str) -> CloudResult<()> {
        self.call("DeleteRole", "iam:DeleteRole", |a| a.role_arn(name), |account, _| {
            let record = account.roles.get(name).ok_or_else(|| no_such_entity("role", name))?;
            if !record.attached.is_empty() {
                return Err(must_detach_policies());
            }
            if !record.inline.is_empty() {
                return Err(delete_conflict("Cannot delete entity, must delete policies first."));
            }
            account.roles.remove(name);
            Ok(())
        })
    }

    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<AttachedPolicy>> {
        self.call(
            "ListAttachedRolePolicies",
            "iam:ListAttachedRolePolicies",
            |a| a.role_arn(role),
            |account, _| {
                let record = account.roles.get(role).ok_or_else(|| no_such_entity("role", role))?;
                Ok(record
                    .attached
                    .iter()
                    .map(|arn| AttachedPolicy {
                        name: account
                            .policies
                            .get(arn)
                            .map(|p| p.name.clone())
                            .unwrap_or_default(),
                        arn: arn.clone(),
                    })
                    .collect())
            },
        )
    }

    async fn detach_role_policy(&self, role: &str, arn: &str) -> CloudResult<()> {
        self.call("DetachRolePolicy", "iam:DetachRolePolicy", |a| a.role_arn(role), |account, _| {
            let record = account.roles.get_mut(role).ok_or_else(|| no_such_entity("role", role))?;
            if !record.attached.remove(arn) {
                return Err(no_such_policy(arn));
            }
            Ok(())
        })
    }

    async fn list_role_policies(&self, role: &str) -> CloudResult<Vec<String>> {
        self.call("ListRolePolicies", "iam:ListRolePolicies", |a| a.role_arn(role), |account, _| {
            let record = account.roles.get(role).ok_or_else(|| no_such_entity("role", role))?;
            Ok(record.inline.keys().cloned().collect())
        })
    }

    async fn delete_role_policy(&self, role: &str, name: &str) -> CloudResult<()> {
        self.call("DeleteRolePolicy", "iam:DeleteRolePolicy", |a| a.role_arn(role), |account, _| {
            let record = account.roles.get_mut(role).ok_or_else(|| no_such_entity("role", role))?;
            record
                .inline
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| no_such_entity("policy", name))
        })
    }

    async fn list_buckets(&self) -> CloudResult<Vec<Bucket>> {
        self.call("ListBuckets", "s3:ListAllMyBuckets", |_| "*".into(), |account, _| {
            Ok(account
                .buckets
                .keys()
                .map(|name| Bucket { name: name.clone() })
                .collect())
        })
    }

    async fn bucket_exists(&self, name: &str) -> CloudResult<bool> {
        self.call("HeadBucket", "s3:ListBucket", |_| format!("arn:aws:s3:::{name}"), |account, _| {
            Ok(account.buckets.contains_key(name))
        })
    }

    async fn create_bucket(&self, settings: &BucketSettings) -> CloudResult<()> {
        let name = settings.name.as_str();
        self.call(
            "CreateBucket",
            "s3:CreateBucket",
            |_| format!("arn:aws:s3:::{name}"),
            |account, _| {
                if account.buckets.contains_key(name) {
                    return Err(CloudError::new(
                        "BucketAlreadyOwnedByYou",
                        "Your previous request to create the named bucket succeeded \
                         and you already own it.",
                    ));
                }
                account.buckets.insert(
                    name.to_string(),
                    BucketRecord {
                        objects: Vec::new(),
                        versioning: settings.versioning,
                        encryption: settings.encryption,
                        block_public_access: settings.block_public_access,
                    },
                );
                Ok(())
            },
        )
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        token: Option<&str>,
    ) -> CloudResult<Page<ObjectVersion>> {
        self.call(
            "ListObjectVersions",
            "s3:ListBucketVersions",
            |_| format!("arn:aws:s3:::{bucket}"),
            |account, _| {
                let record = account
                    .buckets
                    .get(bucket)
                    .ok_or_else(no_such_bucket)?;
                account.page(&record.objects, token)
            },
        )
    }

    async fn delete_objects(&self, bucket: &str, objects: &[ObjectVersion]) -> CloudResult<()> {
        self.call(
            "DeleteObjects",
            "s3:DeleteObjectVersion",
            |_| format!("arn:aws:s3:::{bucket}/*"),
            |account, _| {
                let record = account
                    .buckets
                    .get_mut(bucket)
                    .ok_or_else(no_such_bucket)?;
                record.objects.retain(|object| !objects.contains(object));
                Ok(())
            },
        )
    }

    async fn delete_bucket(&self, name: &str) -> CloudResult<()> {
        self.call(
            "DeleteBucket",
            "s3:DeleteBucket",
            |_| format!("arn:aws:s3:::{name}"),
            |account, _| {
                let record = account
                    .buckets
                    .get(name)
                    .ok_or_else(no_such_bucket)?;
                if !record.objects.is_empty() {
                    return Err(CloudError::new(
                        "BucketNotEmpty",
                        "The bucket you tried to delete is not empty. \
                         You must delete all versions in the bucket.",
                    ));
                }
                account.buckets.remove(name);
                Ok(())
            },
        )
    }

    async fn put_secret(&self, name: &str, value: &Secret, _description: &str) -> CloudResult<()> {
        self.call(
            "PutSecretValue",
            "secretsmanager:PutSecretValue",
            |a| a.secret_arn(name),
            |account, _| {
                account.secrets.insert(name.to_string(), value.clone());
                Ok(())
            },
        )
    }

    async fn delete_secret(&self, name: &str) -> CloudResult<()> {
        self.call(
            "DeleteSecret",
            "secretsmanager:DeleteSecret",
            |a| a.secret_arn(name),
            |account, _| {
                let arn = account.secret_arn(name);
                account.secret_policies.remove(&arn);
                account.secrets.remove(name).map(|_| ()).ok_or_else(no_such_secret)
            },
        )
    }

    async fn put_secret_resource_policy(
        &self,
        name: &str,
        document: &PolicyDocument,
    ) -> CloudResult<()> {
        self.call(
            "PutResourcePolicy",
            "secretsmanager:PutResourcePolicy",
            |a| a.secret_arn(name),
            |account, _| {
                if !account.secrets.contains_key(name) {
                    return Err(no_such_secret());
                }
                let arn = account.secret_arn(name);
                account.secret_policies.insert(arn, document.clone());
                Ok(())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Effect, Statement};

    #[tokio::test]
    async fn test_root_can_do_anything() {
        let cloud = MemoryCloud::new();
        let root = cloud.connect(&cloud.root_identity());
        let caller = root.caller_identity().await.unwrap();
        assert!(caller.is_root());
        root.create_user("someone", &[]).await.unwrap();
        assert!(cloud.user_exists("someone"));
    }

    #[tokio::test]
    async fn test_user_without_policy_is_implicitly_denied() {
        let cloud = MemoryCloud::new();
        let identity = cloud.issue_identity("plain-user", IdentityKind::Developer);
        let session = cloud.connect(&identity);

        let caller = session.caller_identity().await.unwrap();
        assert_eq!(caller.user_name(), Some("plain-user"));

        let err = session.list_users(None).await.unwrap_err();
        assert!(err.is_access_denied());
        assert!(err.message.contains("no identity-based policy"));
    }

    #[tokio::test]
    async fn test_inactive_key_does_not_authenticate() {
        let cloud = MemoryCloud::new();
        let identity = cloud.issue_identity("dev", IdentityKind::Developer);
        let root = cloud.connect(&cloud.root_identity());
        root.update_access_key("dev", &identity.access_key_id, AccessKeyStatus::Inactive)
            .await
            .unwrap();

        let err = cloud.connect(&identity).caller_identity().await.unwrap_err();
        assert!(err.is_invalid_credentials());
    }

    #[tokio::test]
    async fn test_key_limit_and_delete_conflict() {
        let cloud = MemoryCloud::new();
        cloud.add_user("dev");
        let root = cloud.connect(&cloud.root_identity());
        root.create_access_key("dev").await.unwrap();
        root.create_access_key("dev").await.unwrap();
        assert!(root.create_access_key("dev").await.unwrap_err().is_limit_exceeded());
        assert!(root.delete_user("dev").await.unwrap_err().is_dependency_conflict());
    }

    #[tokio::test]
    async fn test_inline_deny_applies() {
        let cloud = MemoryCloud::new();
        let identity = cloud.issue_identity("ops", IdentityKind::Admin);
        cloud.put_user_policy(
            "ops",
            "mixed",
            PolicyDocument::default()
                .with_statement(Statement::new("All", Effect::Allow, ["*"], ["*"]))
                .with_statement(Statement::new("NoBuckets", Effect::Deny, ["s3:*"], ["*"])),
        );
        let session = cloud.connect(&identity);
        assert!(session.list_users(None).await.is_ok());
        let err = session.list_buckets().await.unwrap_err();
        assert!(err.message.contains("explicit deny"));
    }

    #[tokio::test]
    async fn test_pagination_and_fail_next() {
        let cloud = MemoryCloud::new();
        for name in ["a", "b", "c"] {
            cloud.add_user(name);
        }
        cloud.set_page_size(2);
        let root = cloud.connect(&cloud.root_identity());
        let first = root.list_users(None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let second = root.list_users(first.next_token.as_deref()).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_token.is_none());

        cloud.fail_next("ListUsers", CloudError::new("Throttling", "Rate exceeded"));
        assert_eq!(root.list_users(None).await.unwrap_err().code, "Throttling");
        assert!(root.list_users(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_secret_resource_policy_denies_allowed_user() {
        let cloud = MemoryCloud::new();
        let root = cloud.connect(&cloud.root_identity());
        let value = Secret::new("{}");
        root.put_secret("pave/creds", &value, "").await.unwrap();

        let identity = cloud.issue_identity("dev", IdentityKind::Developer);
        cloud.put_user_policy(
            "dev",
            "all",
            PolicyDocument::default()
                .with_statement(Statement::new("All", Effect::Allow, ["*"], ["*"])),
        );
        let dev = cloud.connect(&identity);
        dev.put_secret("pave/creds", &value, "").await.unwrap();

        let policy = crate::policy::secret_resource_policy("123456789012", &[]);
        root.put_secret_resource_policy("pave/creds", &policy).await.unwrap();
        let err = dev.put_secret("pave/creds", &value, "").await.unwrap_err();
        assert!(err.message.contains("resource-based policy"));
        assert!(dev.list_users(None).await.is_ok());

        root.delete_secret("pave/creds").await.unwrap();
        assert!(cloud.secret_policy("pave/creds").is_none());
        let missing = root.put_secret_resource_policy("pave/creds", &policy).await;
        assert_eq!(missing.unwrap_err().code, "ResourceNotFoundException");
    }
}
