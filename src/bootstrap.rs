// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bootstrap identity lifecycle
//!
//! The bootstrap identity is the privileged IAM user Terraform runs as. It
//! moves through `Absent -> Creating -> Active -> Destroying -> Absent`, and
//! its managed policy denies every self-modifying action on its own
//! resources. Create and destroy require root-equivalent credentials loaded
//! from `root.env`.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cleanup::{clear_policy, clear_role, clear_user};
use crate::cloud::{BucketSettings, CallerIdentity, CloudApi, CloudError, Connector, Tag};
use crate::config::{BootstrapConfig, Config};
use crate::confirm::{announce, require, Confirm};
use crate::credentials::{CredentialStore, Identity, IdentityKind, IdentitySession};
use crate::error::{absent_ok, CloudResultExt, PaveError, Result};
use crate::policy::{bootstrap_policy, secret_resource_policy, BootstrapArns};
use crate::sinks::{notify_all, SecretSink, SecretsManagerSink, SinkResult};

/// Access keys IAM allows per user
const MAX_KEYS_PER_USER: usize = 2;

/// Lifecycle state of the bootstrap identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Absent,
    /// User exists without an access key, e.g. after an interrupted create
    Creating,
    Active,
    Destroying,
}

impl std::fmt::Display for BootstrapState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(match self {
            BootstrapState::Absent => "absent",
            BootstrapState::Creating => "creating",
            BootstrapState::Active => "active",
            BootstrapState::Destroying => "destroying",
        })
    }
}

/// Result of a successful `create`
#[derive(Debug)]
pub struct CreateOutcome {
    pub previous_state: BootstrapState,
    pub identity: Identity,
    pub user_arn: String,
    pub policy_arn: String,
    pub credential_path: PathBuf,
    /// Keys deleted because `force` was set
    pub removed_keys: Vec<String>,
    /// `Some(true)` when the state bucket was created, `Some(false)` when it existed
    pub state_bucket: Option<bool>,
    pub sinks: Vec<SinkResult>,
}

/// What `destroy` removed and what was already gone
#[derive(Debug, Default)]
pub struct DestroyReport {
    pub removed: Vec<String>,
    pub absent: Vec<String>,
}

impl DestroyReport {
    fn record(&mut self, what: String, removed: bool) {
        if removed {
            self.removed.push(what);
        } else {
            self.absent.push(what);
        }
    }
}

/// Permission class exercised by a validation check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionClass {
    Credentials,
    Identity,
    IamRead,
    StorageRead,
}

impl PermissionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionClass::Credentials => "credentials",
            PermissionClass::Identity => "identity",
            PermissionClass::IamRead => "iam-read",
            PermissionClass::StorageRead => "storage-read",
        }
    }
}

impl std::fmt::Display for PermissionClass {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ValidationCheck {
    pub name: String,
    pub class: PermissionClass,
    pub passed: bool,
    pub detail: String,
}

/// Per-check results of `validate`
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub user_name: String,
    pub checks: Vec<ValidationCheck>,
}

impl ValidationReport {
    fn new(user_name: &str) -> Self {
        Self {
            user_name: user_name.to_string(),
            checks: Vec::new(),
        }
    }

    fn push(
        &mut self,
        name: &str,
        class: PermissionClass,
        outcome: std::result::Result<String, String>,
    ) {
        let (passed, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(detail) => (false, detail),
        };
        self.checks.push(ValidationCheck {
            name: name.to_string(),
            class,
            passed,
            detail,
        });
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(|check| !check.passed)
    }

    /// Whether every check of `class` passed
    pub fn class_passed(&self, class: PermissionClass) -> bool {
        self.checks
            .iter()
            .filter(|check| check.class == class)
            .all(|check| check.passed)
    }
}

/// Creates, destroys and validates the bootstrap identity
pub struct BootstrapManager {
    project: String,
    region: String,
    settings: BootstrapConfig,
    store: CredentialStore,
    connector: Arc<dyn Connector>,
    sinks: Vec<Box<dyn SecretSink>>,
}

impl BootstrapManager {
    pub fn new(config: &Config, store: CredentialStore, connector: Arc<dyn Connector>) -> Self {
        Self {
            project: config.name.clone(),
            region: config.region.clone(),
            settings: config.bootstrap.clone(),
            store,
            connector,
            sinks: Vec::new(),
        }
    }

    /// Also publish new keys to `sink` after create
    pub fn with_sink(mut self, sink: Box<dyn SecretSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn user_name(&self) -> &str {
        &self.settings.user_name
    }

    /// Root of the account, or a privileged user other than the bootstrap
    pub fn is_root_equivalent(&self, caller: &CallerIdentity) -> bool {
        if caller.is_root() {
            return true;
        }
        caller.user_name().is_some_and(|name| {
            name != self.settings.user_name
                && self.settings.privileged_users.iter().any(|u| u == name)
        })
    }

    pub fn arns(&self, account_id: &str) -> BootstrapArns {
        BootstrapArns::new(
            account_id,
            &self.settings.user_name,
            &self.settings.role_name,
            &self.settings.policy_name,
        )
    }

    /// Current lifecycle state as seen by `client`
    pub async fn state_with(&self, client: &dyn CloudApi) -> Result<BootstrapState> {
        let user = self.settings.user_name.as_str();
        match client.get_user(user).await.op("GetUser") {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(BootstrapState::Absent),
            Err(e) => return Err(e),
        }
        let keys = client.list_access_keys(user).await.op("ListAccessKeys")?;
        Ok(if keys.is_empty() {
            BootstrapState::Creating
        } else {
            BootstrapState::Active
        })
    }

    async fn root_client(&self) -> Result<(IdentitySession, Arc<dyn CloudApi>, CallerIdentity)> {
        let session = self.store.session(IdentityKind::Root)?;
        let client: Arc<dyn CloudApi> = Arc::from(self.connector.connect(&session.identity));
        let caller = client.caller_identity().await.op("GetCallerIdentity")?;
        if !self.is_root_equivalent(&caller) {
            return Err(PaveError::Permission {
                message: format!(
                    "{} is not root-equivalent; bootstrap changes need the account root \
                     or one of {:?}",
                    caller.arn, self.settings.privileged_users
                ),
            });
        }
        debug!(caller = %caller.arn, "Root-equivalent credentials verified");
        Ok((session, client, caller))
    }

    fn tags(&self) -> Vec<Tag> {
        vec![
            Tag::new("Project", &self.project),
            Tag::new("Purpose", "Bootstrap"),
            Tag::new("ManagedBy", "pave"),
        ]
    }

    /// Create the bootstrap identity and persist its key.
    ///
    /// An active identity is left untouched unless `force` is set, in which
    /// case its existing keys are replaced. Old keys are deleted only once
    /// the state bucket is in place and the new key is saved; at the
    /// two-key limit one old key goes first, never the one on disk if
    /// another is available.
    pub async fn create(&self, force: bool) -> Result<CreateOutcome> {
        let (_session, client, caller) = self.root_client().await?;
        let arns = self.arns(&caller.account);
        let user = self.settings.user_name.as_str();

        let previous_state = self.state_with(client.as_ref()).await?;
        if previous_state == BootstrapState::Active && !force {
            return Err(PaveError::AlreadyExists {
                what: format!(
                    "bootstrap identity {} is active (use --force to replace its key)",
                    arns.user
                ),
            });
        }
        info!(user, state = %previous_state, force, "Creating bootstrap identity");

        let tags = self.tags();
        match client.create_user(user, &tags).await.op("CreateUser") {
            Ok(created) => info!(arn = %created.arn, "Created bootstrap user"),
            Err(PaveError::AlreadyExists { .. }) => debug!(user, "Bootstrap user already exists"),
            Err(e) => return Err(e),
        }

        let document = bootstrap_policy(&arns, &self.settings.allowed_services);
        let policy_arn = match client
            .create_policy(
                &self.settings.policy_name,
                &document,
                "Bootstrap policy for pave infrastructure management",
                &tags,
            )
            .await
            .op("CreatePolicy")
        {
            Ok(policy) => {
                info!(arn = %policy.arn, "Created bootstrap policy");
                policy.arn
            }
            Err(PaveError::AlreadyExists { .. }) => {
                debug!(arn = %arns.policy, "Bootstrap policy already exists");
                arns.policy.clone()
            }
            Err(e) => return Err(e),
        };
        client
            .attach_user_policy(user, &policy_arn)
            .await
            .op("AttachUserPolicy")?;

        let state_bucket = if self.settings.create_state_bucket {
            Some(self.ensure_state_bucket(client.as_ref()).await?)
        } else {
            None
        };

        let mut replaced: Vec<String> = if force {
            client
                .list_access_keys(user)
                .await
                .op("ListAccessKeys")?
                .into_iter()
                .map(|key| key.access_key_id)
                .collect()
        } else {
            Vec::new()
        };
        let mut removed_keys = Vec::new();
        if replaced.len() >= MAX_KEYS_PER_USER {
            let stored = self
                .store
                .load(IdentityKind::Bootstrap)
                .ok()
                .map(|identity| identity.access_key_id);
            let index = replaced
                .iter()
                .position(|id| Some(id) != stored.as_ref())
                .unwrap_or(0);
            let key_id = replaced.remove(index);
            self.delete_key(client.as_ref(), &key_id).await?;
            removed_keys.push(key_id);
        }

        let key = client.create_access_key(user).await.op("CreateAccessKey")?;
        let identity = Identity {
            name: user.to_string(),
            kind: IdentityKind::Bootstrap,
            access_key_id: key.access_key_id,
            secret_access_key: key.secret_access_key,
            session_token: None,
            region: self.region.clone(),
            created_at: key.created_at,
        };
        let credential_path = self.store.save(IdentityKind::Bootstrap, &identity)?;
        info!(
            access_key_id = %identity.access_key_id,
            path = %credential_path.display(),
            "Bootstrap key issued"
        );
        for key_id in replaced {
            self.delete_key(client.as_ref(), &key_id).await?;
            removed_keys.push(key_id);
        }

        let secrets_manager = (!self.settings.secret_name.is_empty()).then(|| {
            self.secrets_manager(Arc::clone(&client), &caller.account)
        });
        let mut sinks: Vec<&dyn SecretSink> = Vec::new();
        if let Some(sink) = &secrets_manager {
            sinks.push(sink);
        }
        sinks.extend(self.sinks.iter().map(|sink| &**sink));
        let sinks = notify_all(&sinks, &identity).await;

        Ok(CreateOutcome {
            previous_state,
            user_arn: arns.user,
            policy_arn,
            identity,
            credential_path,
            removed_keys,
            state_bucket,
            sinks,
        })
    }

    async fn delete_key(&self, client: &dyn CloudApi, key_id: &str) -> Result<()> {
        announce(&format!("delete existing bootstrap access key {key_id}"));
        client
            .delete_access_key(&self.settings.user_name, key_id)
            .await
            .op("DeleteAccessKey")
    }

    fn secrets_manager(&self, client: Arc<dyn CloudApi>, account_id: &str) -> SecretsManagerSink {
        let sink = SecretsManagerSink::new(client, self.settings.secret_name.clone());
        if !self.settings.secret_resource_policy {
            return sink;
        }
        let principals: Vec<String> = self
            .settings
            .privileged_users
            .iter()
            .map(|user| format!("arn:aws:iam::{account_id}:user/{user}"))
            .collect();
        sink.with_resource_policy(secret_resource_policy(account_id, &principals))
    }

    /// Ensure the Terraform state bucket exists; `true` when it was created
    async fn ensure_state_bucket(&self, client: &dyn CloudApi) -> Result<bool> {
        let name = self.settings.state_bucket.as_str();
        if client.bucket_exists(name).await.op("HeadBucket")? {
            debug!(bucket = name, "State bucket already exists");
            return Ok(false);
        }
        let settings = BucketSettings {
            name: name.to_string(),
            region: self.region.clone(),
            versioning: true,
            encryption: true,
            block_public_access: true,
            tags: vec![
                Tag::new("Project", &self.project),
                Tag::new("Purpose", "TerraformState"),
            ],
        };
        match client.create_bucket(&settings).await.op("CreateBucket") {
            Ok(()) => {
                info!(bucket = name, "Created state bucket");
                Ok(true)
            }
            Err(PaveError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove the bootstrap identity and everything attached to it.
    ///
    /// Every step treats "already absent" as success, so this is safe to
    /// rerun after a partial failure.
    pub async fn destroy(&self, confirm: &dyn Confirm) -> Result<DestroyReport> {
        let (_session, client, caller) = self.root_client().await?;
        let arns = self.arns(&caller.account);
        require(
            confirm,
            &format!(
                "destroy bootstrap user '{}', policy '{}' and role '{}'",
                self.settings.user_name, self.settings.policy_name, self.settings.role_name
            ),
        )?;
        info!(
            user = %self.settings.user_name,
            state = %BootstrapState::Destroying,
            "Destroying bootstrap identity"
        );

        let mut report = DestroyReport::default();
        self.destroy_user(client.as_ref(), &mut report).await?;
        self.destroy_role(client.as_ref(), &mut report).await?;
        self.destroy_policy(client.as_ref(), &arns.policy, &mut report).await?;

        if !self.settings.secret_name.is_empty() {
            announce(&format!("delete secret {}", self.settings.secret_name));
            let sink =
                SecretsManagerSink::new(Arc::clone(&client), self.settings.secret_name.clone());
            let removed = sink.retract().await?;
            report.record(format!("secret {}", self.settings.secret_name), removed);
        }

        let removed = self.store.remove(IdentityKind::Bootstrap)?;
        let path = self.store.path_for(IdentityKind::Bootstrap);
        report.record(format!("credential file {}", path.display()), removed);

        info!(
            removed = report.removed.len(),
            absent = report.absent.len(),
            "Bootstrap identity destroyed"
        );
        Ok(report)
    }

    async fn destroy_user(&self, client: &dyn CloudApi, report: &mut DestroyReport) -> Result<()> {
        let user = self.settings.user_name.as_str();
        if absent_ok(client.get_user(user).await.op("GetUser"))?.is_none() {
            report.record(format!("user {user}"), false);
            return Ok(());
        }
        clear_user(client, user).await?;
        announce(&format!("delete user {user}"));
        let removed = absent_ok(client.delete_user(user).await.op("DeleteUser"))?.is_some();
        report.record(format!("user {user}"), removed);
        Ok(())
    }

    async fn destroy_role(&self, client: &dyn CloudApi, report: &mut DestroyReport) -> Result<()> {
        let role = self.settings.role_name.as_str();
        clear_role(client, role).await?;
        announce(&format!("delete role {role}"));
        let removed = absent_ok(client.delete_role(role).await.op("DeleteRole"))?.is_some();
        report.record(format!("role {role}"), removed);
        Ok(())
    }

    async fn destroy_policy(
        &self,
        client: &dyn CloudApi,
        arn: &str,
        report: &mut DestroyReport,
    ) -> Result<()> {
        let policy = self.settings.policy_name.as_str();
        clear_policy(client, arn, policy).await?;
        announce(&format!("delete policy {policy}"));
        let removed = absent_ok(client.delete_policy(arn).await.op("DeletePolicy"))?.is_some();
        report.record(format!("policy {policy}"), removed);
        Ok(())
    }

    /// Read-only check of the stored bootstrap credentials.
    ///
    /// Never fails: every check runs and lands in the report.
    pub async fn validate(&self) -> ValidationReport {
        let user = self.settings.user_name.as_str();
        let mut report = ValidationReport::new(user);

        let session = match self.store.session(IdentityKind::Bootstrap) {
            Ok(session) => {
                report.push(
                    "credential file",
                    PermissionClass::Credentials,
                    Ok(format!(
                        "{} ({})",
                        self.store.path_for(IdentityKind::Bootstrap).display(),
                        session.identity.access_key_id
                    )),
                );
                session
            }
            Err(e) => {
                report.push("credential file", PermissionClass::Credentials, Err(e.to_string()));
                for (name, class) in [
                    ("caller identity", PermissionClass::Identity),
                    ("get own user", PermissionClass::IamRead),
                    ("list users", PermissionClass::IamRead),
                    ("list buckets", PermissionClass::StorageRead),
                ] {
                    report.push(name, class, Err("skipped: no credentials".to_string()));
                }
                return report;
            }
        };
        let client = self.connector.connect(&session.identity);

        let identity = match client.caller_identity().await {
            Ok(caller) if caller.user_name() == Some(user) => Ok(caller.arn),
            Ok(caller) => Err(format!("authenticated as {} instead of {user}", caller.arn)),
            Err(e) => Err(describe(&e)),
        };
        report.push("caller identity", PermissionClass::Identity, identity);

        let own = client.get_user(user).await.map(|u| u.arn).map_err(|e| describe(&e));
        report.push("get own user", PermissionClass::IamRead, own);

        let users = client
            .list_users(None)
            .await
            .map(|page| format!("{} users visible", page.items.len()))
            .map_err(|e| describe(&e));
        report.push("list users", PermissionClass::IamRead, users);

        let buckets = client
            .list_buckets()
            .await
            .map(|buckets| format!("{} buckets visible", buckets.len()))
            .map_err(|e| describe(&e));
        report.push("list buckets", PermissionClass::StorageRead, buckets);

        if report.passed() {
            info!(user, "Bootstrap credentials validated");
        } else {
            warn!(user, failed = report.failures().count(), "Bootstrap validation failed");
        }
        report
    }
}

fn describe(error: &CloudError) -> String {
    if error.is_invalid_credentials() || error.is_not_found() {
        format!("identity not found: {}", error.message)
    } else {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;
    use crate::confirm::AssumeYes;
    use crate::credentials::Secret;
    use crate::policy::{Effect, PolicyDocument, Statement};
    use serial_test::serial;
    use tempfile::tempdir;

    fn manager(cloud: &MemoryCloud, dir: &std::path::Path) -> BootstrapManager {
        let mut config = Config::default();
        config.credentials_dir = dir.to_path_buf();
        let store = CredentialStore::new(dir, "us-east-1");
        store.save(IdentityKind::Root, &cloud.root_identity()).unwrap();
        BootstrapManager::new(&config, store, Arc::new(cloud.clone()))
    }

    fn caller(arn: &str) -> CallerIdentity {
        CallerIdentity {
            account: "123456789012".into(),
            arn: arn.into(),
            user_id: "AIDA".into(),
        }
    }

    #[test]
    fn test_root_equivalence() {
        let cloud = MemoryCloud::new();
        let dir = tempdir().unwrap();
        let manager = manager(&cloud, dir.path());

        let user = |name: &str| caller(&format!("arn:aws:iam::123456789012:user/{name}"));
        assert!(manager.is_root_equivalent(&caller("arn:aws:iam::123456789012:root")));
        assert!(manager.is_root_equivalent(&user("admin-user")));
        assert!(!manager.is_root_equivalent(&user("bootstrap-user")));
        assert!(!manager.is_root_equivalent(&user("developer-user")));
    }

    #[tokio::test]
    #[serial]
    async fn test_create_rejects_non_root_caller() {
        let cloud = MemoryCloud::new();
        let dir = tempdir().unwrap();
        let manager = manager(&cloud, dir.path());
        let developer = cloud.issue_identity("developer-user", IdentityKind::Root);
        manager.store.save(IdentityKind::Root, &developer).unwrap();

        let err = manager.create(false).await.unwrap_err();
        assert!(matches!(err, PaveError::Permission { .. }));
        assert!(!cloud.user_exists("bootstrap-user"));
    }

    #[tokio::test]
    #[serial]
    async fn test_interrupted_create_resumes_without_force() {
        let cloud = MemoryCloud::new();
        let dir = tempdir().unwrap();
        let manager = manager(&cloud, dir.path());
        cloud.add_user("bootstrap-user");

        let outcome = manager.create(false).await.unwrap();
        assert_eq!(outcome.previous_state, BootstrapState::Creating);
        assert_eq!(cloud.access_keys_of("bootstrap-user").len(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_force_replaces_existing_keys() {
        let cloud = MemoryCloud::new();
        let dir = tempdir().unwrap();
        let manager = manager(&cloud, dir.path());

        let first = manager.create(false).await.unwrap();
        let second = manager.create(true).await.unwrap();
        assert_eq!(second.previous_state, BootstrapState::Active);
        assert_eq!(second.removed_keys, vec![first.identity.access_key_id.clone()]);
        assert_eq!(
            cloud.access_keys_of("bootstrap-user"),
            vec![second.identity.access_key_id.clone()]
        );
        assert_eq!(second.state_bucket, Some(false));
    }

    #[tokio::test]
    #[serial]
    async fn test_force_keeps_old_key_when_bucket_creation_fails() {
        let cloud = MemoryCloud::new();
        let dir = tempdir().unwrap();
        let manager = manager(&cloud, dir.path());
        let first = manager.create(false).await.unwrap();
        let before =
            std::fs::read_to_string(manager.store.path_for(IdentityKind::Bootstrap)).unwrap();

        let root = cloud.connect(&cloud.root_identity());
        root.delete_bucket("pave-tf-state-bucket-us-east-1").await.unwrap();
        cloud.fail_next("CreateBucket", CloudError::new("AccessDenied", "Access Denied"));

        assert!(manager.create(true).await.is_err());
        assert_eq!(
            cloud.access_keys_of("bootstrap-user"),
            vec![first.identity.access_key_id.clone()]
        );
        let after =
            std::fs::read_to_string(manager.store.path_for(IdentityKind::Bootstrap)).unwrap();
        assert_eq!(before, after);
        let caller = cloud.connect(&first.identity).caller_identity().await.unwrap();
        assert_eq!(caller.user_name(), Some("bootstrap-user"));
    }

    #[tokio::test]
    #[serial]
    async fn test_force_at_key_limit_keeps_stored_key_until_saved() {
        let cloud = MemoryCloud::new();
        let dir = tempdir().unwrap();
        let manager = manager(&cloud, dir.path());
        let first = manager.create(false).await.unwrap();
        let spare = cloud.issue_identity("bootstrap-user", IdentityKind::Bootstrap);
        cloud.fail_next("CreateAccessKey", CloudError::new("ServiceFailure", "try again"));

        assert!(manager.create(true).await.is_err());
        assert_eq!(
            cloud.access_keys_of("bootstrap-user"),
            vec![first.identity.access_key_id.clone()]
        );

        let second = manager.create(true).await.unwrap();
        assert_eq!(second.removed_keys, vec![first.identity.access_key_id.clone()]);
        assert!(cloud.key_status(&spare.access_key_id).is_none());
        assert_eq!(
            cloud.access_keys_of("bootstrap-user"),
            vec![second.identity.access_key_id.clone()]
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_stored_secret_is_limited_to_root_and_privileged_users() {
        let cloud = MemoryCloud::new();
        let dir = tempdir().unwrap();
        let manager = manager(&cloud, dir.path());
        manager.create(false).await.unwrap();

        let everything = PolicyDocument::default()
            .with_statement(Statement::new("All", Effect::Allow, ["*"], ["*"]));
        let value = Secret::new("{}");
        let session = |user: &str| {
            let identity = cloud.issue_identity(user, IdentityKind::Admin);
            cloud.put_user_policy(user, "all", everything.clone());
            cloud.connect(&identity)
        };

        let developer = session("developer-user");
        let err = developer
            .put_secret("pave/bootstrap-credentials", &value, "")
            .await
            .unwrap_err();
        assert!(err.message.contains("resource-based policy"));

        let admin = session("admin-user");
        admin.put_secret("pave/bootstrap-credentials", &value, "").await.unwrap();
        assert!(cloud.secret_policy("pave/bootstrap-credentials").is_some());
    }

    #[tokio::test]
    #[serial]
    async fn test_destroy_removes_legacy_role_and_versions() {
        let cloud = MemoryCloud::new();
        let dir = tempdir().unwrap();
        let manager = manager(&cloud, dir.path());
        let outcome = manager.create(false).await.unwrap();

        cloud.add_role("PaveBootstrapRole");
        cloud.attach_role_policy("PaveBootstrapRole", &outcome.policy_arn);
        cloud.put_role_policy("PaveBootstrapRole", "legacy-inline", Default::default());
        cloud.attach_group_policy("ops", &outcome.policy_arn);
        cloud.add_policy_version(&outcome.policy_arn, Default::default());

        let report = manager.destroy(&AssumeYes).await.unwrap();
        assert!(report.removed.iter().any(|r| r == "role PaveBootstrapRole"));
        assert!(report.removed.iter().any(|r| r == "policy PaveBootstrapPolicy"));
        assert!(!cloud.role_exists("PaveBootstrapRole"));
        assert!(!cloud.policy_exists("PaveBootstrapPolicy"));
        assert!(cloud.secret_value("pave/bootstrap-credentials").is_none());
        assert!(!manager.store.path_for(IdentityKind::Bootstrap).exists());
    }
}
