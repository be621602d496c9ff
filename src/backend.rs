// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terraform backend selection and local-to-S3 state migration
//!
//! The state bucket is created by the same configuration whose state lives
//! in it, so the first apply runs against a local backend. pave owns one
//! file holding the `terraform { backend ... }` block and rewrites it when
//! switching; the previous contents are kept next to it as `<file>.backup`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cloud::{CloudApi, Connector};
use crate::config::Config;
use crate::confirm::{require, Confirm};
use crate::credentials::{CredentialStore, IdentityKind};
use crate::deploy::Terraform;
use crate::error::{CloudResultExt, PaveError, Result};
use crate::process::CommandRunner;

const LOCAL_STATE_FILE: &str = "terraform.tfstate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    Local,
    S3,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::S3 => "s3",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// How a migration request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No local state file; nothing was changed
    NoLocalState,
    /// The bucket does not exist yet; the backend was left local
    BucketMissing,
    /// State copied and remote listing verified
    Migrated { remote_resources: usize },
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub bucket: String,
    pub key: String,
    /// Resource instances in the local state file
    pub local_resources: usize,
    pub outcome: MigrationOutcome,
}

#[derive(Deserialize)]
struct LocalState {
    #[serde(default)]
    resources: Vec<LocalResource>,
}

#[derive(Deserialize)]
struct LocalResource {
    #[serde(default)]
    instances: Vec<serde_json::Value>,
}

/// Count resource instances, which is what `terraform state list` prints
pub fn count_state_instances(raw: &str) -> Result<usize> {
    let state: LocalState = serde_json::from_str(raw).map_err(|e| PaveError::InvalidArgument {
        message: format!("Local state file is corrupted: {e}"),
    })?;
    Ok(state.resources.iter().map(|r| r.instances.len()).sum())
}

pub struct BackendManager {
    path: PathBuf,
    terraform: Terraform,
    bucket: String,
    key: String,
    region: String,
    lock_table: Option<String>,
    identity_kind: IdentityKind,
    store: CredentialStore,
    connector: Arc<dyn Connector>,
}

impl BackendManager {
    pub fn new(
        config: &Config,
        store: CredentialStore,
        connector: Arc<dyn Connector>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let deploy = &config.deploy;
        Self {
            path: deploy.terraform_dir.join(&config.backend.file),
            terraform: Terraform::new(
                &deploy.terraform_dir,
                &deploy.terraform_bin,
                runner,
                Duration::from_secs(deploy.timeout_secs),
            ),
            bucket: config.backend_bucket().to_string(),
            key: config.backend.key.clone(),
            region: config.region.clone(),
            lock_table: config.backend.lock_table.clone(),
            identity_kind: deploy.identity,
            store,
            connector,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Backend declared by the managed file; a missing file means local
    pub fn current(&self) -> Result<BackendKind> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BackendKind::Local),
            Err(e) => return Err(e.into()),
        };
        let declares_s3 = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#') && !line.starts_with("//"))
            .any(|line| line.starts_with("backend \"s3\""));
        Ok(if declares_s3 {
            BackendKind::S3
        } else {
            BackendKind::Local
        })
    }

    /// The backend block as `terraform fmt` would lay it out
    pub fn render(&self, kind: BackendKind) -> String {
        let mut out = String::from("# Managed by pave; `pave backend switch` rewrites this file\n");
        out.push_str("terraform {\n");
        match kind {
            BackendKind::Local => out.push_str("  backend \"local\" {}\n"),
            BackendKind::S3 => {
                let mut attributes = vec![
                    ("bucket", quoted(&self.bucket)),
                    ("key", quoted(&self.key)),
                    ("region", quoted(&self.region)),
                    ("encrypt", "true".to_string()),
                ];
                if let Some(table) = &self.lock_table {
                    attributes.push(("dynamodb_table", quoted(table)));
                }
                let width = attributes.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
                out.push_str("  backend \"s3\" {\n");
                for (name, value) in attributes {
                    out.push_str(&format!("    {name:<width$} = {value}\n"));
                }
                out.push_str("  }\n");
            }
        }
        out.push_str("}\n");
        out
    }

    /// Rewrite the managed file for `kind`, keeping a backup of the old one.
    ///
    /// `terraform init` has to run afterwards for the change to take effect.
    pub fn switch(&self, kind: BackendKind) -> Result<PathBuf> {
        if self.path.exists() {
            let backup = self.backup_path();
            fs::copy(&self.path, &backup)?;
            debug!(backup = %backup.display(), "Backed up backend file");
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, self.render(kind))?;
        info!(backend = %kind, path = %self.path.display(), "Switched backend");
        Ok(self.path.clone())
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// Move local state into the S3 backend and verify it arrived.
    ///
    /// Nothing changes when there is no local state or the bucket does not
    /// exist yet. A failed `terraform init` restores the previous backend
    /// file.
    pub async fn migrate(&self, confirm: &dyn Confirm) -> Result<MigrationReport> {
        let mut report = MigrationReport {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            local_resources: 0,
            outcome: MigrationOutcome::NoLocalState,
        };

        let state_path = self.terraform.dir().join(LOCAL_STATE_FILE);
        let raw = match fs::read_to_string(&state_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %state_path.display(), "No local state to migrate");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };
        report.local_resources = count_state_instances(&raw)?;
        info!(resources = report.local_resources, "Local state found");

        let session = self.store.session(self.identity_kind)?;
        let client: Arc<dyn CloudApi> = Arc::from(self.connector.connect(&session.identity));
        if !client.bucket_exists(&self.bucket).await.op("HeadBucket")? {
            warn!(bucket = %self.bucket, "State bucket does not exist yet");
            report.outcome = MigrationOutcome::BucketMissing;
            return Ok(report);
        }

        require(
            confirm,
            &format!(
                "migrate {} local state resources to s3://{}/{}",
                report.local_resources, self.bucket, self.key
            ),
        )?;

        let previous = match fs::read_to_string(&self.path) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        self.switch(BackendKind::S3)?;
        let init = ["init", "-migrate-state", "-force-copy", "-input=false"];
        if let Err(e) = self.terraform.run(&init, &session.identity).await {
            warn!(error = %e, "State migration failed, restoring backend file");
            match &previous {
                Some(contents) => fs::write(&self.path, contents)?,
                None => fs::remove_file(&self.path)?,
            }
            return Err(e);
        }

        let remote_resources = self.terraform.state_list(&session.identity).await?.len();
        if remote_resources < report.local_resources {
            return Err(PaveError::CommandFailed {
                command: "terraform state list".to_string(),
                message: format!(
                    "remote state lists {remote_resources} resources, local state had {}",
                    report.local_resources
                ),
            });
        }
        info!(resources = remote_resources, bucket = %self.bucket, "Remote state verified");
        report.outcome = MigrationOutcome::Migrated { remote_resources };
        Ok(report)
    }
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;
    use crate::confirm::{AssumeYes, ScriptedConfirm};
    use crate::process::{CommandOutput, ScriptedRunner};
    use serial_test::serial;
    use tempfile::{tempdir, TempDir};

    const STATE: &str = r#"{"version": 4, "resources": [
        {"mode": "managed", "type": "aws_iam_user", "name": "admin",
         "instances": [{"attributes": {"name": "admin-user"}}]},
        {"mode": "managed", "type": "aws_s3_bucket", "name": "state",
         "instances": [{"attributes": {"bucket": "pave-tf-state-bucket-us-east-1"}}]}
    ]}"#;

    struct Fixture {
        cloud: MemoryCloud,
        runner: Arc<ScriptedRunner>,
        manager: BackendManager,
        dir: TempDir,
    }

    fn fixture(runner: ScriptedRunner, adjust: impl FnOnce(&mut Config)) -> Fixture {
        let dir = tempdir().unwrap();
        let cloud = MemoryCloud::new();
        let store = CredentialStore::new(dir.path().join("credentials"), "us-east-1");
        store
            .save(IdentityKind::Bootstrap, &cloud.root_identity())
            .unwrap();
        let mut config = Config::default();
        config.deploy.terraform_dir = dir.path().to_path_buf();
        adjust(&mut config);
        let runner = Arc::new(runner);
        let manager = BackendManager::new(&config, store, Arc::new(cloud.clone()), runner.clone());
        Fixture {
            cloud,
            runner,
            manager,
            dir,
        }
    }

    #[test]
    fn test_render_aligns_like_terraform_fmt() {
        let f = fixture(ScriptedRunner::new(), |config| {
            config.backend.lock_table = Some("pave-locks".into());
        });
        let rendered = f.manager.render(BackendKind::S3);
        assert!(rendered.contains("  backend \"s3\" {\n"));
        assert!(rendered.contains("    bucket         = \"pave-tf-state-bucket-us-east-1\"\n"));
        assert!(rendered.contains("    encrypt        = true\n"));
        assert!(rendered.contains("    dynamodb_table = \"pave-locks\"\n"));
        assert!(f.manager.render(BackendKind::Local).contains("backend \"local\" {}"));
    }

    #[test]
    fn test_switch_round_trip_keeps_backup() {
        let f = fixture(ScriptedRunner::new(), |_| {});
        assert_eq!(f.manager.current().unwrap(), BackendKind::Local);

        f.manager.switch(BackendKind::S3).unwrap();
        assert_eq!(f.manager.current().unwrap(), BackendKind::S3);

        f.manager.switch(BackendKind::Local).unwrap();
        assert_eq!(f.manager.current().unwrap(), BackendKind::Local);
        let backup = fs::read_to_string(f.dir.path().join("backend.tf.backup")).unwrap();
        assert!(backup.contains("backend \"s3\""));
    }

    #[test]
    fn test_commented_out_s3_block_is_local() {
        let f = fixture(ScriptedRunner::new(), |_| {});
        fs::write(f.manager.path(), "terraform {\n  # backend \"s3\" {\n  # }\n}\n").unwrap();
        assert_eq!(f.manager.current().unwrap(), BackendKind::Local);
    }

    #[test]
    fn test_count_state_instances() {
        assert_eq!(count_state_instances(STATE).unwrap(), 2);
        assert_eq!(count_state_instances(r#"{"version": 4}"#).unwrap(), 0);
        assert!(count_state_instances("not json").is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_migrate_without_local_state_changes_nothing() {
        let f = fixture(ScriptedRunner::new(), |_| {});
        let report = f.manager.migrate(&AssumeYes).await.unwrap();
        assert_eq!(report.outcome, MigrationOutcome::NoLocalState);
        assert!(f.runner.calls().is_empty());
        assert!(!f.manager.path().exists());
    }

    #[tokio::test]
    #[serial]
    async fn test_migrate_waits_for_the_bucket() {
        let f = fixture(ScriptedRunner::new(), |_| {});
        fs::write(f.dir.path().join(LOCAL_STATE_FILE), STATE).unwrap();

        let report = f.manager.migrate(&AssumeYes).await.unwrap();
        assert_eq!(report.outcome, MigrationOutcome::BucketMissing);
        assert_eq!(report.local_resources, 2);
        assert!(f.runner.calls().is_empty());
        assert_eq!(f.manager.current().unwrap(), BackendKind::Local);
    }

    #[tokio::test]
    #[serial]
    async fn test_migrate_copies_state_and_verifies() {
        let runner = ScriptedRunner::new().on(
            "terraform state list",
            CommandOutput::ok("aws_iam_user.admin\naws_s3_bucket.state\n"),
        );
        let f = fixture(runner, |_| {});
        f.cloud.add_bucket("pave-tf-state-bucket-us-east-1");
        fs::write(f.dir.path().join(LOCAL_STATE_FILE), STATE).unwrap();

        let report = f.manager.migrate(&AssumeYes).await.unwrap();
        assert_eq!(report.outcome, MigrationOutcome::Migrated { remote_resources: 2 });
        assert_eq!(f.manager.current().unwrap(), BackendKind::S3);
        assert_eq!(
            f.runner.call_lines(),
            vec![
                "terraform init -migrate-state -force-copy -input=false",
                "terraform state list",
            ]
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_migrate_declined_leaves_backend_alone() {
        let f = fixture(ScriptedRunner::new(), |_| {});
        f.cloud.add_bucket("pave-tf-state-bucket-us-east-1");
        fs::write(f.dir.path().join(LOCAL_STATE_FILE), STATE).unwrap();

        let err = f.manager.migrate(&ScriptedConfirm::default()).await.unwrap_err();
        assert!(matches!(err, PaveError::Cancelled { .. }));
        assert!(f.runner.calls().is_empty());
        assert!(!f.manager.path().exists());
    }

    #[tokio::test]
    #[serial]
    async fn test_failed_init_restores_previous_backend() {
        let runner = ScriptedRunner::new().on(
            "terraform init",
            CommandOutput::failed(1, "Error: Failed to get existing workspaces"),
        );
        let f = fixture(runner, |_| {});
        f.cloud.add_bucket("pave-tf-state-bucket-us-east-1");
        fs::write(f.dir.path().join(LOCAL_STATE_FILE), STATE).unwrap();
        f.manager.switch(BackendKind::Local).unwrap();

        let err = f.manager.migrate(&AssumeYes).await.unwrap_err();
        assert!(matches!(err, PaveError::CommandFailed { .. }));
        assert_eq!(f.manager.current().unwrap(), BackendKind::Local);
    }

    #[tokio::test]
    #[serial]
    async fn test_short_remote_listing_fails_verification() {
        let runner = ScriptedRunner::new()
            .on("terraform state list", CommandOutput::ok("aws_iam_user.admin\n"));
        let f = fixture(runner, |_| {});
        f.cloud.add_bucket("pave-tf-state-bucket-us-east-1");
        fs::write(f.dir.path().join(LOCAL_STATE_FILE), STATE).unwrap();

        let err = f.manager.migrate(&AssumeYes).await.unwrap_err();
        assert!(err.to_string().contains("remote state lists 1 resources"));
    }
}
