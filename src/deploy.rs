// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terraform driver with pre-flight gates
//!
//! Terraform owns the state; this module only decides whether a run may start
//! and which identity it runs as. Terraform's own output is passed through to
//! the terminal untouched.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cloud::Connector;
use crate::config::Config;
use crate::confirm::{announce, require, Confirm};
use crate::credentials::{CredentialStore, Identity, IdentityKind, AMBIENT_CREDENTIAL_VARS};
use crate::error::{PaveError, Result};
use crate::process::{CommandRunner, CommandSpec};

/// A check that must pass before `plan` or `apply`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Format,
    Lint,
    SecurityScan,
    Credentials,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gate::Format => "format",
            Gate::Lint => "lint",
            Gate::SecurityScan => "security-scan",
            Gate::Credentials => "credentials",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct GateResult {
    pub gate: Gate,
    pub passed: bool,
    pub detail: String,
}

/// Every gate's result, in run order
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub results: Vec<GateResult>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn first_failure(&self) -> Option<Gate> {
        self.results.iter().find(|r| !r.passed).map(|r| r.gate)
    }

    /// `PreflightFailed` carrying the first failing gate
    pub fn ensure_passed(&self) -> Result<()> {
        match self.first_failure() {
            Some(gate) => Err(PaveError::PreflightFailed {
                gate: gate.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// The `terraform` executable bound to one working directory
pub struct Terraform {
    dir: PathBuf,
    bin: String,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl Terraform {
    pub fn new(
        dir: impl Into<PathBuf>,
        bin: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            bin: bin.into(),
            runner,
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn spec(&self, args: &[&str], identity: &Identity) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.bin)
            .args(args.iter().copied())
            .cwd(&self.dir)
            .timeout(self.timeout);
        for var in AMBIENT_CREDENTIAL_VARS {
            spec = spec.env_remove(var);
        }
        for (key, value) in identity.env_vars() {
            spec = spec.env(key, value);
        }
        spec.env("TF_IN_AUTOMATION", "1")
    }

    /// Run with output passed through; a non-zero exit is `CommandFailed`
    pub async fn run(&self, args: &[&str], identity: &Identity) -> Result<()> {
        let spec = self.spec(args, identity).inherit_output(true);
        info!(command = %spec.display(), identity = %identity.name, "Running terraform");
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(PaveError::CommandFailed {
                command: spec.display(),
                message: match output.status {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by signal".to_string(),
                },
            });
        }
        Ok(())
    }

    /// Run with output captured and return stdout
    pub async fn output(&self, args: &[&str], identity: &Identity) -> Result<String> {
        let spec = self.spec(args, identity);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(PaveError::CommandFailed {
                command: spec.display(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Raw JSON of `terraform state pull`
    pub async fn state_pull(&self, identity: &Identity) -> Result<String> {
        self.output(&["state", "pull"], identity).await
    }

    /// Addresses listed by `terraform state list`
    pub async fn state_list(&self, identity: &Identity) -> Result<Vec<String>> {
        let stdout = self.output(&["state", "list"], identity).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

pub struct Deployer {
    terraform: Terraform,
    gate_commands: Vec<(Gate, Vec<String>)>,
    gate_timeout: Duration,
    identity_kind: IdentityKind,
    store: CredentialStore,
    connector: Arc<dyn Connector>,
}

impl Deployer {
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
            gate_commands: vec![
                (Gate::Format, deploy.format_command.clone()),
                (Gate::Lint, deploy.lint_command.clone()),
                (Gate::SecurityScan, deploy.security_command.clone()),
            ],
            gate_timeout: Duration::from_secs(config.process.timeout_secs),
            identity_kind: deploy.identity,
            store,
            connector,
        }
    }

    /// Run Terraform as a different credential file
    pub fn with_identity(mut self, kind: IdentityKind) -> Self {
        self.identity_kind = kind;
        self
    }

    pub fn terraform(&self) -> &Terraform {
        &self.terraform
    }

    async fn command_gate(&self, gate: Gate, argv: &[String]) -> GateResult {
        let Some(spec) = CommandSpec::from_argv(argv) else {
            return GateResult {
                gate,
                passed: false,
                detail: "no command configured".to_string(),
            };
        };
        let spec = spec.cwd(self.terraform.dir()).timeout(self.gate_timeout);
        let command = spec.display();
        match self.terraform.runner.run(&spec).await {
            Ok(output) if output.success() => GateResult {
                gate,
                passed: true,
                detail: command,
            },
            Ok(output) => {
                let text = if output.stderr.trim().is_empty() {
                    output.stdout
                } else {
                    output.stderr
                };
                GateResult {
                    gate,
                    passed: false,
                    detail: text.lines().next().unwrap_or("failed").trim().to_string(),
                }
            }
            Err(e) => GateResult {
                gate,
                passed: false,
                detail: e.to_string(),
            },
        }
    }

    async fn credentials_gate(&self) -> GateResult {
        let detail = match self.store.session(self.identity_kind) {
            Ok(session) => self
                .connector
                .connect(&session.identity)
                .caller_identity()
                .await
                .map(|caller| caller.arn)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match detail {
            Ok(arn) => GateResult {
                gate: Gate::Credentials,
                passed: true,
                detail: arn,
            },
            Err(detail) => GateResult {
                gate: Gate::Credentials,
                passed: false,
                detail,
            },
        }
    }

    /// Run every gate and report all of them
    pub async fn preflight(&self) -> GateReport {
        let mut report = GateReport::default();
        for (gate, argv) in &self.gate_commands {
            report.results.push(self.command_gate(*gate, argv).await);
        }
        report.results.push(self.credentials_gate().await);

        for result in &report.results {
            if result.passed {
                info!(gate = %result.gate, "Pre-flight gate passed");
            } else {
                warn!(gate = %result.gate, detail = %result.detail, "Pre-flight gate failed");
            }
        }
        report
    }

    async fn gated(&self) -> Result<GateReport> {
        let report = self.preflight().await;
        for result in &report.results {
            let mark = if result.passed { "ok  " } else { "FAIL" };
            println!("  [{mark}] {:<14} {}", result.gate.as_str(), result.detail);
        }
        report.ensure_passed()?;
        Ok(report)
    }

    pub async fn plan(&self) -> Result<()> {
        self.gated().await?;
        let session = self.store.session(self.identity_kind)?;
        self.terraform.run(&["plan"], &session.identity).await
    }

    /// Apply after the gates pass; prompts unless `auto_approve`
    pub async fn apply(&self, auto_approve: bool, confirm: &dyn Confirm) -> Result<()> {
        self.gated().await?;
        if auto_approve {
            announce("apply the Terraform configuration (auto-approved)");
        } else {
            require(confirm, "apply the Terraform configuration")?;
        }
        let session = self.store.session(self.identity_kind)?;
        self.terraform
            .run(&["apply", "-auto-approve"], &session.identity)
            .await
    }

    pub async fn destroy(&self, confirm: &dyn Confirm) -> Result<()> {
        require(confirm, "destroy all Terraform-managed infrastructure")?;
        let session = self.store.session(self.identity_kind)?;
        self.terraform
            .run(&["destroy", "-auto-approve"], &session.identity)
            .await
    }

    /// Bring an existing resource under Terraform management
    pub async fn import(&self, address: &str, id: &str) -> Result<()> {
        let (address, id) = (address.trim(), id.trim());
        if address.is_empty() || id.is_empty() {
            return Err(PaveError::InvalidArgument {
                message: "usage: pave import <address> <id> \
                          (e.g. pave import aws_iam_user.developer developer-user)"
                    .to_string(),
            });
        }
        let session = self.store.session(self.identity_kind)?;
        self.terraform
            .run(&["import", address, id], &session.identity)
            .await
    }
}
