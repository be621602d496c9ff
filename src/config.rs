// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration management for pave

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::credentials::IdentityKind;
use crate::error::{PaveError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project name, used in tags and log output
    pub name: String,

    /// Default AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Directory holding `<kind>.env` credential files
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,

    /// Naming convention for project-managed resources
    #[serde(default)]
    pub naming: NamingConfig,

    /// Bootstrap identity settings
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Key rotation settings
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Terraform deployment settings
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Terraform state backend switching
    #[serde(default)]
    pub backend: BackendConfig,

    /// Terraform outputs holding generated access keys
    #[serde(default)]
    pub outputs: OutputsConfig,

    /// GitHub secret propagation
    #[serde(default)]
    pub github: GithubConfig,

    /// Subprocess settings
    #[serde(default)]
    pub process: ProcessConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Name patterns that identify project resources.
///
/// A resource matches when its name equals a pattern or starts with
/// `<pattern>-`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    #[serde(default = "default_user_patterns")]
    pub users: Vec<String>,

    #[serde(default = "default_role_patterns")]
    pub roles: Vec<String>,

    #[serde(default = "default_policy_patterns")]
    pub policies: Vec<String>,

    #[serde(default = "default_bucket_patterns")]
    pub buckets: Vec<String>,
}

/// Bootstrap identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// IAM user name of the bootstrap identity
    #[serde(default = "default_bootstrap_user")]
    pub user_name: String,

    /// Managed policy attached to the bootstrap user
    #[serde(default = "default_bootstrap_policy")]
    pub policy_name: String,

    /// Legacy role removed on destroy
    #[serde(default = "default_bootstrap_role")]
    pub role_name: String,

    /// Users besides the account root allowed to create/destroy the bootstrap
    #[serde(default = "default_privileged_users")]
    pub privileged_users: Vec<String>,

    /// Service prefixes granted `<service>:*` by the bootstrap policy
    #[serde(default = "default_bootstrap_services")]
    pub allowed_services: Vec<String>,

    /// Terraform state bucket
    #[serde(default = "default_state_bucket")]
    pub state_bucket: String,

    /// Ensure the state bucket exists during create
    #[serde(default = "default_true")]
    pub create_state_bucket: bool,

    /// Secrets Manager secret receiving the bootstrap key (empty disables)
    #[serde(default = "default_secret_name")]
    pub secret_name: String,

    /// Restrict the secret to the root and privileged users
    #[serde(default = "default_true")]
    pub secret_resource_policy: bool,
}

/// Key rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Default user whose key is rotated
    #[serde(default = "default_rotation_user")]
    pub default_user: String,

    /// Seconds to wait before verifying a new key
    #[serde(default = "default_propagation_delay")]
    pub propagation_delay_secs: u64,
}

/// Terraform deployment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Directory containing the Terraform configuration
    #[serde(default = "default_terraform_dir")]
    pub terraform_dir: PathBuf,

    /// Terraform executable
    #[serde(default = "default_terraform_bin")]
    pub terraform_bin: String,

    /// Format check gate command
    #[serde(default = "default_format_gate")]
    pub format_command: Vec<String>,

    /// Lint gate command
    #[serde(default = "default_lint_gate")]
    pub lint_command: Vec<String>,

    /// Static security scan gate command
    #[serde(default = "default_security_gate")]
    pub security_command: Vec<String>,

    /// Credential file Terraform runs with
    #[serde(default = "default_deploy_identity")]
    pub identity: IdentityKind,

    /// Timeout for a single Terraform invocation
    #[serde(default = "default_terraform_timeout")]
    pub timeout_secs: u64,
}

/// Terraform backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// File holding the backend block, relative to `deploy.terraform_dir`
    #[serde(default = "default_backend_file")]
    pub file: PathBuf,

    /// Object key of the state in the bucket
    #[serde(default = "default_backend_key")]
    pub key: String,

    /// Bucket holding remote state; `bootstrap.state_bucket` when unset
    pub bucket: Option<String>,

    /// DynamoDB table used for state locking
    pub lock_table: Option<String>,
}

/// Names of the Terraform outputs carrying generated keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsConfig {
    #[serde(default = "default_admin_access_output")]
    pub admin_access_key: String,

    #[serde(default = "default_admin_secret_output")]
    pub admin_secret_key: String,

    #[serde(default = "default_developer_access_output")]
    pub developer_access_key: String,

    #[serde(default = "default_developer_secret_output")]
    pub developer_secret_key: String,

    /// IAM user behind the admin outputs
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// IAM user behind the developer outputs
    #[serde(default = "default_rotation_user")]
    pub developer_user: String,
}

/// GitHub secret propagation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Push bootstrap credentials to repository secrets after create
    #[serde(default)]
    pub enabled: bool,

    /// `owner/name`; the current repository when unset
    pub repository: Option<String>,
}

/// Subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// `aws` CLI executable
    #[serde(default = "default_aws_bin")]
    pub aws_bin: String,

    /// `gh` CLI executable
    #[serde(default = "default_gh_bin")]
    pub gh_bin: String,

    /// Timeout for a single subprocess
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (text, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            users: default_user_patterns(),
            roles: default_role_patterns(),
            policies: default_policy_patterns(),
            buckets: default_bucket_patterns(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            user_name: default_bootstrap_user(),
            policy_name: default_bootstrap_policy(),
            role_name: default_bootstrap_role(),
            privileged_users: default_privileged_users(),
            allowed_services: default_bootstrap_services(),
            state_bucket: default_state_bucket(),
            create_state_bucket: true,
            secret_name: default_secret_name(),
            secret_resource_policy: true,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            file: default_backend_file(),
            key: default_backend_key(),
            bucket: None,
            lock_table: None,
        }
    }
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            admin_access_key: default_admin_access_output(),
            admin_secret_key: default_admin_secret_output(),
            developer_access_key: default_developer_access_output(),
            developer_secret_key: default_developer_secret_output(),
            admin_user: default_admin_user(),
            developer_user: default_rotation_user(),
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            default_user: default_rotation_user(),
            propagation_delay_secs: default_propagation_delay(),
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            terraform_dir: default_terraform_dir(),
            terraform_bin: default_terraform_bin(),
            format_command: default_format_gate(),
            lint_command: default_lint_gate(),
            security_command: default_security_gate(),
            identity: default_deploy_identity(),
            timeout_secs: default_terraform_timeout(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            aws_bin: default_aws_bin(),
            gh_bin: default_gh_bin(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "pave".to_string(),
            region: default_region(),
            credentials_dir: default_credentials_dir(),
            naming: NamingConfig::default(),
            bootstrap: BootstrapConfig::default(),
            rotation: RotationConfig::default(),
            deploy: DeployConfig::default(),
            backend: BackendConfig::default(),
            outputs: OutputsConfig::default(),
            github: GithubConfig::default(),
            process: ProcessConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(PaveError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Load the file when present, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PaveError::InvalidConfig {
                message: "Project name cannot be empty".to_string(),
            });
        }

        if self.region.is_empty() {
            return Err(PaveError::InvalidConfig {
                message: "Region cannot be empty".to_string(),
            });
        }

        if self.bootstrap.user_name.is_empty() || self.bootstrap.policy_name.is_empty() {
            return Err(PaveError::InvalidConfig {
                message: "Bootstrap user and policy names are required".to_string(),
            });
        }

        if self.bootstrap.state_bucket.is_empty() {
            return Err(PaveError::InvalidConfig {
                message: "bootstrap.state_bucket cannot be empty".to_string(),
            });
        }

        // Bootstrap resources and the state bucket are never cleanup candidates.
        let protected = [
            ("users", &self.naming.users, &self.bootstrap.user_name),
            ("roles", &self.naming.roles, &self.bootstrap.role_name),
            ("policies", &self.naming.policies, &self.bootstrap.policy_name),
            ("buckets", &self.naming.buckets, &self.bootstrap.state_bucket),
        ];
        for (section, patterns, name) in protected {
            if patterns.iter().any(|p| p == name) {
                return Err(PaveError::InvalidConfig {
                    message: format!(
                        "naming.{section} pattern '{name}' names a protected bootstrap resource"
                    ),
                });
            }
        }

        if !matches!(self.logging.format.as_str(), "text" | "compact") {
            return Err(PaveError::InvalidConfig {
                message: format!(
                    "Unknown logging.format '{}' (expected text or compact)",
                    self.logging.format
                ),
            });
        }

        if self.deploy.terraform_bin.is_empty() {
            return Err(PaveError::InvalidConfig {
                message: "deploy.terraform_bin cannot be empty".to_string(),
            });
        }

        let gates = [
            ("format_command", &self.deploy.format_command),
            ("lint_command", &self.deploy.lint_command),
            ("security_command", &self.deploy.security_command),
        ];
        for (field, argv) in gates {
            if argv.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(PaveError::InvalidConfig {
                    message: format!("deploy.{field} cannot be empty"),
                });
            }
        }

        if self.backend.key.is_empty() {
            return Err(PaveError::InvalidConfig {
                message: "backend.key cannot be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Bucket that holds remote Terraform state
    pub fn backend_bucket(&self) -> &str {
        self.backend
            .bucket
            .as_deref()
            .unwrap_or(&self.bootstrap.state_bucket)
    }
}

// Default value functions

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_credentials_dir() -> PathBuf {
    PathBuf::from("credentials")
}

fn default_user_patterns() -> Vec<String> {
    vec!["admin-user".to_string(), "developer-user".to_string()]
}

fn default_role_patterns() -> Vec<String> {
    vec!["CICDDeploymentRole".to_string(), "DeveloperRole".to_string()]
}

fn default_policy_patterns() -> Vec<String> {
    vec!["CICDS3SpecificAccess".to_string(), "PaveAdminPolicy".to_string()]
}

fn default_bucket_patterns() -> Vec<String> {
    vec!["pave-tf-state-bucket".to_string()]
}

fn default_bootstrap_user() -> String {
    "bootstrap-user".to_string()
}

fn default_bootstrap_policy() -> String {
    "PaveBootstrapPolicy".to_string()
}

fn default_bootstrap_role() -> String {
    "PaveBootstrapRole".to_string()
}

fn default_privileged_users() -> Vec<String> {
    vec!["admin-user".to_string()]
}

fn default_bootstrap_services() -> Vec<String> {
    [
        "s3", "lambda", "ec2", "route53", "kms", "sts", "logs", "cloudwatch", "apigateway",
        "codebuild", "codepipeline", "codedeploy", "secretsmanager", "dynamodb",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_state_bucket() -> String {
    "pave-tf-state-bucket-us-east-1".to_string()
}

fn default_backend_file() -> PathBuf {
    PathBuf::from("backend.tf")
}

fn default_backend_key() -> String {
    "pave/terraform.tfstate".to_string()
}

fn default_admin_access_output() -> String {
    "admin_user_access_key".to_string()
}

fn default_admin_secret_output() -> String {
    "admin_user_secret_key".to_string()
}

fn default_developer_access_output() -> String {
    "developer_user_access_key".to_string()
}

fn default_developer_secret_output() -> String {
    "developer_user_secret_key".to_string()
}

fn default_admin_user() -> String {
    "admin-user".to_string()
}

fn default_secret_name() -> String {
    "pave/bootstrap-credentials".to_string()
}

fn default_rotation_user() -> String {
    "developer-user".to_string()
}

fn default_propagation_delay() -> u64 {
    10
}

fn default_terraform_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_terraform_bin() -> String {
    "terraform".to_string()
}

fn default_format_gate() -> Vec<String> {
    vec!["terraform".into(), "fmt".into(), "-check".into(), "-recursive".into()]
}

fn default_lint_gate() -> Vec<String> {
    vec!["tflint".into()]
}

fn default_security_gate() -> Vec<String> {
    vec!["checkov".into(), "-d".into(), ".".into(), "--quiet".into()]
}

fn default_deploy_identity() -> IdentityKind {
    IdentityKind::Bootstrap
}

fn default_terraform_timeout() -> u64 {
    3600
}

fn default_aws_bin() -> String {
    "aws".to_string()
}

fn default_gh_bin() -> String {
    "gh".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.name, "pave");
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.bootstrap.user_name, "bootstrap-user");
        assert!(config.bootstrap.create_state_bucket);
        assert!(!config.github.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_name() {
        let mut config = Config::default();
        config.name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_bootstrap_in_naming() {
        let mut config = Config::default();
        config.naming.users.push("bootstrap-user".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_protected_names_as_patterns() {
        let mut config = Config::default();
        config.naming.buckets.push(config.bootstrap.state_bucket.clone());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.naming.policies.push("PaveBootstrapPolicy".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bootstrap.state_bucket = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_empty_gate_command() {
        let mut config = Config::default();
        config.deploy.lint_command = Vec::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("deploy.lint_command"));

        let mut config = Config::default();
        config.deploy.format_command = vec![" ".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_bucket_defaults_to_state_bucket() {
        let mut config = Config::default();
        assert_eq!(config.backend_bucket(), "pave-tf-state-bucket-us-east-1");
        config.backend.bucket = Some("shared-state".to_string());
        assert_eq!(config.backend_bucket(), "shared-state");
    }

    #[test]
    fn test_config_rejects_unknown_log_format() {
        let mut config = Config::default();
        config.logging.format = "json".to_string();
        assert!(config.validate().is_err());
        config.logging.format = "compact".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_config() {
        let toml_content = r#"
            name = "test-pave"
            region = "eu-west-1"
            credentials_dir = "/tmp/creds"

            [naming]
            users = ["svc-user"]

            [bootstrap]
            user_name = "root-bootstrap"
            create_state_bucket = false

            [rotation]
            propagation_delay_secs = 0

            [deploy]
            lint_command = ["true"]

            [backend]
            lock_table = "pave-tf-locks"

            [github]
            enabled = true
            repository = "acme/infra"

            [logging]
            level = "debug"
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.name, "test-pave");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.naming.users, vec!["svc-user"]);
        assert_eq!(config.naming.roles, default_role_patterns());
        assert_eq!(config.bootstrap.user_name, "root-bootstrap");
        assert_eq!(config.bootstrap.policy_name, "PaveBootstrapPolicy");
        assert!(!config.bootstrap.create_state_bucket);
        assert_eq!(config.rotation.propagation_delay_secs, 0);
        assert_eq!(config.deploy.lint_command, vec!["true"]);
        assert_eq!(config.backend.key, "pave/terraform.tfstate");
        assert_eq!(config.backend.lock_table.as_deref(), Some("pave-tf-locks"));
        assert_eq!(config.outputs.admin_access_key, "admin_user_access_key");
        assert_eq!(config.github.repository.as_deref(), Some("acme/infra"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/pave.toml").unwrap();
        assert_eq!(config.name, "pave");
    }
}
