// SPDX-License-Identifier: AGPL-3.0-or-later
//! Propagation of bootstrap credentials to external secret stores
//!
//! A failing sink never aborts the workflow that triggered it. [`notify_all`]
//! logs each failure at warn level and returns it for the caller's outcome.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cloud::CloudApi;
use crate::credentials::{Identity, Secret};
use crate::error::{CloudResultExt, PaveError, Result};
use crate::policy::PolicyDocument;
use crate::process::{CommandRunner, CommandSpec};

/// An external store that receives a freshly issued key pair
#[async_trait]
pub trait SecretSink: Send + Sync {
    /// Short name shown in reports
    fn name(&self) -> &str;

    async fn publish(&self, identity: &Identity) -> Result<()>;
}

/// Outcome of one sink notification
#[derive(Debug, Clone)]
pub struct SinkResult {
    pub sink: String,
    pub error: Option<String>,
}

impl SinkResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Publish to every sink, collecting failures instead of propagating them
pub async fn notify_all(sinks: &[&dyn SecretSink], identity: &Identity) -> Vec<SinkResult> {
    let mut results = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let error = match sink.publish(identity).await {
            Ok(()) => {
                info!(sink = sink.name(), "Credentials propagated");
                None
            }
            Err(e) => {
                warn!(sink = sink.name(), error = %e, "Credential propagation failed");
                Some(e.to_string())
            }
        };
        results.push(SinkResult {
            sink: sink.name().to_string(),
            error,
        });
    }
    results
}

/// Repository secrets set through `gh secret set`
pub struct GitHubSecrets {
    runner: Arc<dyn CommandRunner>,
    gh_bin: String,
    repository: Option<String>,
    timeout: Duration,
}

impl GitHubSecrets {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        gh_bin: impl Into<String>,
        repository: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            gh_bin: gh_bin.into(),
            repository,
            timeout,
        }
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        let mut spec = CommandSpec::new(&self.gh_bin)
            .args(["secret", "set", name])
            .stdin(Secret::new(value))
            .timeout(self.timeout);
        if let Some(repository) = &self.repository {
            spec = spec.args(["--repo", repository.as_str()]);
        }
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(PaveError::CommandFailed {
                command: spec.display(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SecretSink for GitHubSecrets {
    fn name(&self) -> &str {
        "github"
    }

    async fn publish(&self, identity: &Identity) -> Result<()> {
        self.set("AWS_ACCESS_KEY_ID", &identity.access_key_id).await?;
        self.set("AWS_SECRET_ACCESS_KEY", identity.secret_access_key.expose())
            .await?;
        self.set("AWS_REGION", &identity.region).await
    }
}

/// A Secrets Manager secret holding the key pair as JSON
pub struct SecretsManagerSink {
    client: Arc<dyn CloudApi>,
    secret_name: String,
    resource_policy: Option<PolicyDocument>,
}

impl SecretsManagerSink {
    pub fn new(client: Arc<dyn CloudApi>, secret_name: impl Into<String>) -> Self {
        Self {
            client,
            secret_name: secret_name.into(),
            resource_policy: None,
        }
    }

    /// Attach `document` to the secret after every publish
    pub fn with_resource_policy(mut self, document: PolicyDocument) -> Self {
        self.resource_policy = Some(document);
        self
    }

    fn payload(identity: &Identity) -> Secret {
        Secret::new(
            serde_json::json!({
                "AWS_ACCESS_KEY_ID": identity.access_key_id,
                "AWS_SECRET_ACCESS_KEY": identity.secret_access_key.expose(),
                "AWS_REGION": identity.region,
                "AWS_DEFAULT_REGION": identity.region,
                "created_by": "pave",
                "created_at": identity.created_at.to_rfc3339(),
            })
            .to_string(),
        )
    }

    /// Remove the secret; already absent is success
    pub async fn retract(&self) -> Result<bool> {
        match self.client.delete_secret(&self.secret_name).await.op("DeleteSecret") {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SecretSink for SecretsManagerSink {
    fn name(&self) -> &str {
        "secretsmanager"
    }

    async fn publish(&self, identity: &Identity) -> Result<()> {
        self.client
            .put_secret(
                &self.secret_name,
                &Self::payload(identity),
                "Bootstrap user credentials for pave infrastructure (root access only)",
            )
            .await
            .op("PutSecretValue")?;
        if let Some(document) = &self.resource_policy {
            self.client
                .put_secret_resource_policy(&self.secret_name, document)
                .await
                .op("PutResourcePolicy")?;
        }
        Ok(())
    }
}
