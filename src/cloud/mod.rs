// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed port over the AWS API calls pave needs
//!
//! [`CloudApi`] is implemented by [`AwsCli`], which drives the `aws` CLI as
//! exactly one identity, and by [`MemoryCloud`], an in-process account used
//! by tests. A [`Connector`] turns an [`Identity`] into a client.

mod aws_cli;
mod memory;

pub use aws_cli::{AwsCli, AwsCliConnector};
pub use memory::{MemoryCloud, MemorySession};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::{Identity, Secret};
use crate::policy::PolicyDocument;

/// An error reported by the provider, code and message kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudError {
    pub code: String,
    pub message: String,
}

impl CloudError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code.as_str(),
            "NoSuchEntity" | "NoSuchBucket" | "ResourceNotFoundException" | "NotFound" | "404"
        )
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(
            self.code.as_str(),
            "EntityAlreadyExists" | "BucketAlreadyOwnedByYou" | "ResourceExistsException"
        )
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(
            self.code.as_str(),
            "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation" | "403"
        )
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.code == "LimitExceeded"
    }

    pub fn is_dependency_conflict(&self) -> bool {
        matches!(self.code.as_str(), "DeleteConflict" | "BucketNotEmpty")
    }

    /// The credentials themselves were rejected
    pub fn is_invalid_credentials(&self) -> bool {
        matches!(
            self.code.as_str(),
            "InvalidClientTokenId" | "SignatureDoesNotMatch" | "ExpiredToken" | "AuthFailure"
        )
    }
}

impl std::fmt::Display for CloudError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for CloudError {}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Result of identity introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

impl CallerIdentity {
    pub fn is_root(&self) -> bool {
        self.arn.ends_with(":root")
    }

    /// IAM user name when the caller is an IAM user
    pub fn user_name(&self) -> Option<&str> {
        let (_, path) = self.arn.split_once(":user/")?;
        path.rsplit('/').next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKeyStatus {
    Active,
    Inactive,
}

impl AccessKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKeyStatus::Active => "Active",
            AccessKeyStatus::Inactive => "Inactive",
        }
    }
}

impl std::fmt::Display for AccessKeyStatus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamUser {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamRole {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyMetadata {
    pub access_key_id: String,
    pub status: AccessKeyStatus,
    pub created_at: Option<DateTime<Utc>>,
}

/// A freshly issued key pair; the secret is only ever returned here
#[derive(Debug, Clone)]
pub struct NewAccessKey {
    pub user_name: String,
    pub access_key_id: String,
    pub secret_access_key: Secret,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedPolicy {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedPolicy {
    pub name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVersion {
    pub version_id: String,
    pub is_default: bool,
}

/// Principals a managed policy is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyEntities {
    pub users: Vec<String>,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub name: String,
}

/// One object version or delete marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: Option<String>,
}

/// Hardening applied to a newly created bucket
#[derive(Debug, Clone)]
pub struct BucketSettings {
    pub name: String,
    pub region: String,
    pub versioning: bool,
    pub encryption: bool,
    pub block_public_access: bool,
    pub tags: Vec<Tag>,
}

/// One page of a paginated listing
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// The AWS operations used by the workflows, issued as one identity
#[async_trait]
pub trait CloudApi: Send + Sync {
    // STS
    async fn caller_identity(&self) -> CloudResult<CallerIdentity>;

    // IAM users and keys
    async fn get_user(&self, name: &str) -> CloudResult<IamUser>;
    async fn create_user(&self, name: &str, tags: &[Tag]) -> CloudResult<IamUser>;
    async fn delete_user(&self, name: &str) -> CloudResult<()>;
    async fn list_users(&self, token: Option<&str>) -> CloudResult<Page<IamUser>>;
    async fn create_access_key(&self, user: &str) -> CloudResult<NewAccessKey>;
    async fn list_access_keys(&self, user: &str) -> CloudResult<Vec<AccessKeyMetadata>>;
    async fn update_access_key(
        &self,
        user: &str,
        key_id: &str,
        status: AccessKeyStatus,
    ) -> CloudResult<()>;
    async fn delete_access_key(&self, user: &str, key_id: &str) -> CloudResult<()>;

    // IAM policies
    async fn create_policy(
        &self,
        name: &str,
        document: &PolicyDocument,
        description: &str,
        tags: &[Tag],
    ) -> CloudResult<ManagedPolicy>;
    async fn delete_policy(&self, arn: &str) -> CloudResult<()>;
    async fn list_policies(&self, token: Option<&str>) -> CloudResult<Page<ManagedPolicy>>;
    async fn list_policy_versions(&self, arn: &str) -> CloudResult<Vec<PolicyVersion>>;
    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> CloudResult<()>;
    async fn list_entities_for_policy(&self, arn: &str) -> CloudResult<PolicyEntities>;
    async fn attach_user_policy(&self, user: &str, arn: &str) -> CloudResult<()>;
    async fn detach_user_policy(&self, user: &str, arn: &str) -> CloudResult<()>;
    async fn list_attached_user_policies(&self, user: &str) -> CloudResult<Vec<AttachedPolicy>>;
    async fn list_user_policies(&self, user: &str) -> CloudResult<Vec<String>>;
    async fn delete_user_policy(&self, user: &str, name: &str) -> CloudResult<()>;
    async fn detach_group_policy(&self, group: &str, arn: &str) -> CloudResult<()>;

    // IAM roles
    async fn list_roles(&self, token: Option<&str>) -> CloudResult<Page<IamRole>>;
    async fn delete_role(&self, name: &str) -> CloudResult<()>;
    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<AttachedPolicy>>;
    async fn detach_role_policy(&self, role: &str, arn: &str) -> CloudResult<()>;
    async fn list_role_policies(&self, role: &str) -> CloudResult<Vec<String>>;
    async fn delete_role_policy(&self, role: &str, name: &str) -> CloudResult<()>;

    // S3
    async fn list_buckets(&self) -> CloudResult<Vec<Bucket>>;
    async fn bucket_exists(&self, name: &str) -> CloudResult<bool>;
    async fn create_bucket(&self, settings: &BucketSettings) -> CloudResult<()>;
    async fn list_object_versions(
        &self,
        bucket: &str,
        token: Option<&str>,
    ) -> CloudResult<Page<ObjectVersion>>;
    async fn delete_objects(&self, bucket: &str, objects: &[ObjectVersion]) -> CloudResult<()>;
    async fn delete_bucket(&self, name: &str) -> CloudResult<()>;

    // Secrets Manager
    async fn put_secret(&self, name: &str, value: &Secret, description: &str) -> CloudResult<()>;
    async fn delete_secret(&self, name: &str) -> CloudResult<()>;
    /// Replaces the resource-based policy attached to a secret
    async fn put_secret_resource_policy(
        &self,
        name: &str,
        document: &PolicyDocument,
    ) -> CloudResult<()>;
}

/// Builds a client acting as a given identity
pub trait Connector: Send + Sync {
    fn connect(&self, identity: &Identity) -> Box<dyn CloudApi>;
}
