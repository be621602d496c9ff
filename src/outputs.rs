// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credential files for the users Terraform creates
//!
//! Terraform exposes the admin and developer key pairs as sensitive
//! outputs. Extraction reads `terraform output -json` and saves each pair
//! through the credential store. When a pair is not among the outputs, the
//! report lists the user's existing key ids instead; their secrets cannot be
//! read back from IAM.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::cloud::{CloudApi, Connector};
use crate::config::{Config, OutputsConfig};
use crate::credentials::{CredentialStore, Identity, IdentityKind};
use crate::deploy::Terraform;
use crate::error::{absent_ok, CloudResultExt, Result};
use crate::process::CommandRunner;

#[derive(Debug, Deserialize)]
struct OutputValue {
    value: serde_json::Value,
}

/// Parsed `terraform output -json`
#[derive(Debug, Default)]
pub struct TerraformOutputs(BTreeMap<String, OutputValue>);

impl TerraformOutputs {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(Self(serde_json::from_str(raw)?))
    }

    /// A non-empty string output
    pub fn string(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .and_then(|output| output.value.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Saved {
        path: PathBuf,
        access_key_id: String,
    },
    /// No outputs for this user; the key ids it already has
    NotInOutputs { existing_keys: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ExtractedUser {
    pub kind: IdentityKind,
    pub user: String,
    pub result: Extracted,
}

pub struct CredentialExtractor {
    terraform: Terraform,
    outputs: OutputsConfig,
    region: String,
    identity_kind: IdentityKind,
    store: CredentialStore,
    connector: Arc<dyn Connector>,
}

impl CredentialExtractor {
    pub fn new(
        config: &Config,
        store: CredentialStore,
        connector: Arc<dyn Connector>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let deploy = &config.deploy;
        Self {
            terraform: Terraform::new(
                &deploy.terraform_dir,
                &deploy.terraform_bin,
                runner,
                Duration::from_secs(deploy.timeout_secs),
            ),
            outputs: config.outputs.clone(),
            region: config.region.clone(),
            identity_kind: deploy.identity,
            store,
            connector,
        }
    }

    pub async fn extract(&self) -> Result<Vec<ExtractedUser>> {
        let session = self.store.session(self.identity_kind)?;
        let raw = self
            .terraform
            .output(&["output", "-json"], &session.identity)
            .await?;
        let outputs = TerraformOutputs::parse(&raw)?;
        if outputs.is_empty() {
            warn!("Terraform has no outputs; run `pave apply` first");
        }
        let client: Arc<dyn CloudApi> = Arc::from(self.connector.connect(&session.identity));

        let wanted = [
            (
                IdentityKind::Admin,
                &self.outputs.admin_user,
                &self.outputs.admin_access_key,
                &self.outputs.admin_secret_key,
            ),
            (
                IdentityKind::Developer,
                &self.outputs.developer_user,
                &self.outputs.developer_access_key,
                &self.outputs.developer_secret_key,
            ),
        ];
        let mut extracted = Vec::with_capacity(wanted.len());
        for (kind, user, access_output, secret_output) in wanted {
            let pair = outputs
                .string(access_output)
                .zip(outputs.string(secret_output));
            let result = match pair {
                Some((access_key_id, secret)) => {
                    let identity =
                        Identity::new(user.as_str(), kind, access_key_id, secret, &self.region);
                    let path = self.store.save(kind, &identity)?;
                    info!(kind = %kind, key_id = access_key_id, "Saved credentials from outputs");
                    Extracted::Saved {
                        path,
                        access_key_id: access_key_id.to_string(),
                    }
                }
                None => {
                    let keys = absent_ok(client.list_access_keys(user).await.op("ListAccessKeys"))?
                        .unwrap_or_default();
                    Extracted::NotInOutputs {
                        existing_keys: keys.into_iter().map(|k| k.access_key_id).collect(),
                    }
                }
            };
            extracted.push(ExtractedUser {
                kind,
                user: user.clone(),
                result,
            });
        }
        Ok(extracted)
    }
}
