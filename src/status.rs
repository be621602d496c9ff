// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only environment summary

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::cleanup::{Reconciler, ResourceType, TrackedState};
use crate::cloud::{CallerIdentity, CloudApi, Connector};
use crate::config::Config;
use crate::credentials::{CredentialStore, IdentityKind};

/// Names shown per resource type
const SAMPLE_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerraformStatus {
    /// No `.terraform` directory
    NotInitialized,
    /// Initialized without a local state file
    NoLocalState,
    LocalState,
}

impl TerraformStatus {
    pub fn detect(dir: &Path) -> Self {
        if !dir.join(".terraform").exists() {
            TerraformStatus::NotInitialized
        } else if !dir.join("terraform.tfstate").exists() {
            TerraformStatus::NoLocalState
        } else {
            TerraformStatus::LocalState
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            TerraformStatus::NotInitialized => "not initialized (run `terraform init`)",
            TerraformStatus::NoLocalState => "initialized, no local state",
            TerraformStatus::LocalState => "initialized, local state present",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceCount {
    pub resource_type: ResourceType,
    pub count: usize,
    /// The first few matching names
    pub sample: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub credential_files: Vec<(IdentityKind, PathBuf)>,
    pub identity_kind: IdentityKind,
    pub caller: std::result::Result<CallerIdentity, String>,
    pub terraform: TerraformStatus,
    /// Counts for every resource type that could be listed
    pub resources: Vec<ResourceCount>,
    /// Resource types whose listing failed, with the reason
    pub resource_errors: Vec<(ResourceType, String)>,
}

impl StatusReport {
    pub fn count_of(&self, resource_type: ResourceType) -> Option<usize> {
        self.resources
            .iter()
            .find(|r| r.resource_type == resource_type)
            .map(|r| r.count)
    }
}

/// Summarize local files and the account as seen by `kind`.
///
/// Failures are captured in the report rather than returned. A resource type
/// that cannot be listed does not hide the counts of the others.
pub async fn collect(
    config: &Config,
    store: &CredentialStore,
    connector: &dyn Connector,
    kind: IdentityKind,
) -> StatusReport {
    let credential_files = store
        .list()
        .into_iter()
        .map(|k| (k, store.path_for(k)))
        .collect();
    let terraform = TerraformStatus::detect(&config.deploy.terraform_dir);

    let session = match store.session(kind) {
        Ok(session) => session,
        Err(e) => {
            return StatusReport {
                credential_files,
                identity_kind: kind,
                caller: Err(e.to_string()),
                terraform,
                resources: Vec::new(),
                resource_errors: ResourceType::ALL
                    .into_iter()
                    .map(|t| (t, "skipped: no credentials".to_string()))
                    .collect(),
            }
        }
    };
    let client: Arc<dyn CloudApi> = Arc::from(connector.connect(&session.identity));
    let caller = client.caller_identity().await.map_err(|e| e.to_string());

    let reconciler = Reconciler::new(config, client, TrackedState::default());
    let mut resources = Vec::new();
    let mut resource_errors = Vec::new();
    for resource_type in ResourceType::ALL {
        match reconciler.candidates(resource_type).await {
            Ok(records) => resources.push(ResourceCount {
                resource_type,
                count: records.len(),
                sample: records
                    .into_iter()
                    .take(SAMPLE_SIZE)
                    .map(|r| r.identifier)
                    .collect(),
            }),
            Err(e) => {
                warn!(resource_type = %resource_type, error = %e, "Listing failed");
                resource_errors.push((resource_type, e.to_string()));
            }
        }
    }

    StatusReport {
        credential_files,
        identity_kind: kind,
        caller,
        terraform,
        resources,
        resource_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, MemoryCloud};
    use serial_test::serial;
    use tempfile::{tempdir, TempDir};

    fn setup(cloud: &MemoryCloud) -> (TempDir, CredentialStore, Config) {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path(), "us-east-1");
        store.save(IdentityKind::Root, &cloud.root_identity()).unwrap();
        let mut config = Config::default();
        config.deploy.terraform_dir = dir.path().to_path_buf();
        (dir, store, config)
    }

    #[tokio::test]
    #[serial]
    async fn test_status_counts_convention_matches() {
        let cloud = MemoryCloud::new();
        cloud.add_user("admin-user");
        cloud.add_user("developer-user-ci");
        cloud.add_user("unrelated");
        cloud.add_bucket("pave-tf-state-bucket-us-east-1");
        cloud.add_bucket("pave-tf-state-bucket-dev");
        let (_dir, store, config) = setup(&cloud);

        let report = collect(&config, &store, &cloud, IdentityKind::Root).await;
        assert!(report.caller.as_ref().unwrap().is_root());
        assert_eq!(report.terraform, TerraformStatus::NotInitialized);
        assert_eq!(report.credential_files.len(), 1);

        assert!(report.resource_errors.is_empty());
        assert_eq!(report.count_of(ResourceType::User), Some(2));
        // The state bucket is protected and never counted
        assert_eq!(report.count_of(ResourceType::Bucket), Some(1));
    }

    #[tokio::test]
    #[serial]
    async fn test_status_keeps_counts_past_a_failed_listing() {
        let cloud = MemoryCloud::new();
        cloud.add_user("developer-user-ci");
        cloud.add_bucket("pave-tf-state-bucket-dev");
        cloud.fail_next("ListRoles", CloudError::new("AccessDenied", "not allowed"));
        let (_dir, store, config) = setup(&cloud);

        let report = collect(&config, &store, &cloud, IdentityKind::Root).await;
        assert_eq!(report.resource_errors.len(), 1);
        assert_eq!(report.resource_errors[0].0, ResourceType::Role);
        assert!(report.resource_errors[0].1.contains("not allowed"));
        assert_eq!(report.count_of(ResourceType::Role), None);
        assert_eq!(report.count_of(ResourceType::User), Some(1));
        assert_eq!(report.count_of(ResourceType::Policy), Some(0));
        assert_eq!(report.count_of(ResourceType::Bucket), Some(1));
    }

    #[tokio::test]
    #[serial]
    async fn test_status_without_credentials() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path(), "us-east-1");
        let cloud = MemoryCloud::new();
        let report = collect(&Config::default(), &store, &cloud, IdentityKind::Bootstrap).await;
        assert!(report.caller.is_err());
        assert!(report.resources.is_empty());
        assert_eq!(report.resource_errors.len(), ResourceType::ALL.len());
        assert!(report.credential_files.is_empty());
    }
}
