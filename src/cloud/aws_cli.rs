// SPDX-License-Identifier: AGPL-3.0-or-later
//! `aws` CLI backend
//!
//! Every call runs `aws <service> <operation> --output json` with the ambient
//! credential variables removed and exactly one identity's keys set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    AccessKeyMetadata, AccessKeyStatus, AttachedPolicy, Bucket, BucketSettings, CallerIdentity,
    CloudApi, CloudError, CloudResult, Connector, IamRole, IamUser, ManagedPolicy, NewAccessKey,
    ObjectVersion, Page, PolicyEntities, PolicyVersion, Tag,
};
use crate::credentials::{Identity, Secret, AMBIENT_CREDENTIAL_VARS};
use crate::policy::PolicyDocument;
use crate::process::{CommandRunner, CommandSpec};

const PAGE_SIZE: &str = "100";
const SECRET_FROM_STDIN: &str = "file:///dev/stdin";
const DEFAULT_ENCRYPTION: &str =
    r#"{"Rules":[{"ApplyServerSideEncryptionByDefault":{"SSEAlgorithm":"AES256"}}]}"#;
const BLOCK_ALL_PUBLIC_ACCESS: &str = "BlockPublicAcls=true,IgnorePublicAcls=true,\
                                       BlockPublicPolicy=true,RestrictPublicBuckets=true";

/// Client for one identity, backed by the `aws` executable
pub struct AwsCli {
    identity: Identity,
    runner: Arc<dyn CommandRunner>,
    bin: String,
    timeout: Duration,
}

impl AwsCli {
    pub fn new(
        identity: Identity,
        runner: Arc<dyn CommandRunner>,
        bin: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            identity,
            runner,
            bin: bin.into(),
            timeout,
        }
    }

    fn spec(&self, service: &str, operation: &str, args: &[&str]) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.bin)
            .args([service, operation])
            .args(args.iter().copied())
            .args(["--output", "json"])
            .timeout(self.timeout);
        for var in AMBIENT_CREDENTIAL_VARS {
            spec = spec.env_remove(var);
        }
        for (key, value) in self.identity.env_vars() {
            spec = spec.env(key, value);
        }
        spec.env("AWS_PAGER", "")
    }

    async fn execute(&self, spec: CommandSpec) -> CloudResult<String> {
        debug!(identity = %self.identity.name, command = %spec.display(), "AWS call");
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| CloudError::new("CommandFailed", e.to_string()))?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(parse_cli_error(&output.stderr))
        }
    }

    async fn call(&self, service: &str, operation: &str, args: &[&str]) -> CloudResult<String> {
        self.execute(self.spec(service, operation, args)).await
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        args: &[&str],
    ) -> CloudResult<T> {
        let stdout = self.call(service, operation, args).await?;
        // Commands with no response body print nothing.
        let body = if stdout.trim().is_empty() { "{}" } else { stdout.as_str() };
        serde_json::from_str(body)
            .map_err(|e| CloudError::new("InvalidResponse", format!("{service} {operation}: {e}")))
    }

    async fn call_secret(
        &self,
        operation: &str,
        args: &[&str],
        value: &Secret,
    ) -> CloudResult<String> {
        let spec = self.spec("secretsmanager", operation, args).stdin(value.clone());
        self.execute(spec).await
    }

    /// Page arguments for a `--max-items` listing
    fn paging<'a>(token: Option<&'a str>) -> Vec<&'a str> {
        let mut args = vec!["--max-items", PAGE_SIZE];
        if let Some(token) = token {
            args.extend(["--starting-token", token]);
        }
        args
    }
}

/// Parse `An error occurred (Code) when calling the Op operation: message`
pub fn parse_cli_error(stderr: &str) -> CloudError {
    let text = stderr.trim();
    let Some(start) = text.find("An error occurred (") else {
        return CloudError::new("Unknown", text);
    };
    let rest = &text[start + "An error occurred (".len()..];
    let Some(end) = rest.find(')') else {
        return CloudError::new("Unknown", text);
    };
    let code = &rest[..end];
    let message = rest[end..]
        .split_once(": ")
        .map(|(_, message)| message.trim())
        .unwrap_or(text);
    CloudError::new(code, message)
}

fn tag_args(tags: &[Tag]) -> Vec<String> {
    tags.iter()
        .map(|tag| format!("Key={},Value={}", tag.key, tag.value))
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerResponse {
    account: String,
    arn: String,
    user_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserRecord {
    user_name: String,
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserResponse {
    user: UserRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UsersResponse {
    #[serde(default)]
    users: Vec<UserRecord>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedKey {
    user_name: String,
    access_key_id: String,
    secret_access_key: String,
    create_date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateKeyResponse {
    access_key: CreatedKey,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyRecord {
    access_key_id: String,
    status: AccessKeyStatus,
    create_date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct KeysResponse {
    #[serde(rename = "AccessKeyMetadata", default)]
    keys: Vec<KeyRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyRecord {
    policy_name: String,
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyResponse {
    policy: PolicyRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PoliciesResponse {
    #[serde(default)]
    policies: Vec<PolicyRecord>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionRecord {
    version_id: String,
    is_default_version: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionsResponse {
    #[serde(default)]
    versions: Vec<VersionRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EntitiesResponse {
    #[serde(default)]
    policy_users: Vec<NamedUser>,
    #[serde(default)]
    policy_roles: Vec<NamedRole>,
    #[serde(default)]
    policy_groups: Vec<NamedGroup>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NamedUser {
    user_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NamedRole {
    role_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NamedGroup {
    group_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedRecord {
    policy_name: String,
    policy_arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedResponse {
    #[serde(default)]
    attached_policies: Vec<AttachedRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InlineResponse {
    #[serde(default)]
    policy_names: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleRecord {
    role_name: String,
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RolesResponse {
    #[serde(default)]
    roles: Vec<RoleRecord>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketRecord {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketsResponse {
    #[serde(default)]
    buckets: Vec<BucketRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionEntry {
    key: String,
    version_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectVersionsResponse {
    #[serde(default)]
    versions: Vec<VersionEntry>,
    #[serde(default)]
    delete_markers: Vec<VersionEntry>,
    next_token: Option<String>,
}

fn attached(response: AttachedResponse) -> Vec<AttachedPolicy> {
    response
        .attached_policies
        .into_iter()
        .map(|p| AttachedPolicy {
            name: p.policy_name,
            arn: p.policy_arn,
        })
        .collect()
}

#[async_trait]
impl CloudApi for AwsCli {
    async fn caller_identity(&self) -> CloudResult<CallerIdentity> {
        let response: CallerResponse = self.call_json("sts", "get-caller-identity", &[]).await?;
        Ok(CallerIdentity {
            account: response.account,
            arn: response.arn,
            user_id: response.user_id,
        })
    }

    async fn get_user(&self, name: &str) -> CloudResult<IamUser> {
        let response: UserResponse = self
            .call_json("iam", "get-user", &["--user-name", name])
            .await?;
        Ok(IamUser {
            name: response.user.user_name,
            arn: response.user.arn,
        })
    }

    async fn create_user(&self, name: &str, tags: &[Tag]) -> CloudResult<IamUser> {
        let tags = tag_args(tags);
        let mut args = vec!["--user-name", name];
        if !tags.is_empty() {
            args.push("--tags");
            args.extend(tags.iter().map(String::as_str));
        }
        let response: UserResponse = self.call_json("iam", "create-user", &args).await?;
        Ok(IamUser {
            name: response.user.user_name,
            arn: response.user.arn,
        })
    }

    async fn delete_user(&self, name: &str) -> CloudResult<()> {
        self.call("iam", "delete-user", &["--user-name", name]).await.map(|_| ())
    }

    async fn list_users(&self, token: Option<&str>) -> CloudResult<Page<IamUser>> {
        let response: UsersResponse = self
            .call_json("iam", "list-users", &Self::paging(token))
            .await?;
        Ok(Page {
            items: response
                .users
                .into_iter()
                .map(|u| IamUser {
                    name: u.user_name,
                    arn: u.arn,
                })
                .collect(),
            next_token: response.next_token,
        })
    }

    async fn create_access_key(&self, user: &str) -> CloudResult<NewAccessKey> {
        let response: CreateKeyResponse = self
            .call_json("iam", "create-access-key", &["--user-name", user])
            .await?;
        let key = response.access_key;
        Ok(NewAccessKey {
            user_name: key.user_name,
            access_key_id: key.access_key_id,
            secret_access_key: Secret::new(key.secret_access_key),
            created_at: key.create_date.unwrap_or_else(Utc::now),
        })
    }

    async fn list_access_keys(&self, user: &str) -> CloudResult<Vec<AccessKeyMetadata>> {
        let response: KeysResponse = self
            .call_json("iam", "list-access-keys", &["--user-name", user])
            .await?;
        Ok(response
            .keys
            .into_iter()
            .map(|k| AccessKeyMetadata {
                access_key_id: k.access_key_id,
                status: k.status,
                created_at: k.create_date,
            })
            .collect())
    }

    async fn update_access_key(
        &self,
        user: &str,
        key_id: &str,
        status: AccessKeyStatus,
    ) -> CloudResult<()> {
        self.call(
            "iam",
            "update-access-key",
            &[
                "--user-name",
                user,
                "--access-key-id",
                key_id,
                "--status",
                status.as_str(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn delete_access_key(&self, user: &str, key_id: &str) -> CloudResult<()> {
        let args = ["--user-name", user, "--access-key-id", key_id];
        self.call("iam", "delete-access-key", &args).await.map(|_| ())
    }

    async fn create_policy(
        &self,
        name: &str,
        document: &PolicyDocument,
        description: &str,
        tags: &[Tag],
    ) -> CloudResult<ManagedPolicy> {
        let json = document.to_json();
        let tags = tag_args(tags);
        let mut args = vec![
            "--policy-name",
            name,
            "--policy-document",
            json.as_str(),
            "--description",
            description,
        ];
        if !tags.is_empty() {
            args.push("--tags");
            args.extend(tags.iter().map(String::as_str));
        }
        let response: PolicyResponse = self.call_json("iam", "create-policy", &args).await?;
        Ok(ManagedPolicy {
            name: response.policy.policy_name,
            arn: response.policy.arn,
        })
    }

    async fn delete_policy(&self, arn: &str) -> CloudResult<()> {
        self.call("iam", "delete-policy", &["--policy-arn", arn]).await.map(|_| ())
    }

    async fn list_policies(&self, token: Option<&str>) -> CloudResult<Page<ManagedPolicy>> {
        let mut args = vec!["--scope", "Local"];
        args.extend(Self::paging(token));
        let response: PoliciesResponse = self.call_json("iam", "list-policies", &args).await?;
        Ok(Page {
            items: response
                .policies
                .into_iter()
                .map(|p| ManagedPolicy {
                    name: p.policy_name,
                    arn: p.arn,
                })
                .collect(),
            next_token: response.next_token,
        })
    }

    async fn list_policy_versions(&self, arn: &str) -> CloudResult<Vec<PolicyVersion>> {
        let response: VersionsResponse = self
            .call_json("iam", "list-policy-versions", &["--policy-arn", arn])
            .await?;
        Ok(response
            .versions
            .into_iter()
            .map(|v| PolicyVersion {
                version_id: v.version_id,
                is_default: v.is_default_version,
            })
            .collect())
    }

    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> CloudResult<()> {
        let args = ["--policy-arn", arn, "--version-id", version_id];
        self.call("iam", "delete-policy-version", &args).await.map(|_| ())
    }

    async fn list_entities_for_policy(&self, arn: &str) -> CloudResult<PolicyEntities> {
        let response: EntitiesResponse = self
            .call_json("iam", "list-entities-for-policy", &["--policy-arn", arn])
            .await?;
        Ok(PolicyEntities {
            users: response.policy_users.into_iter().map(|u| u.user_name).collect(),
            roles: response.policy_roles.into_iter().map(|r| r.role_name).collect(),
            groups: response.policy_groups.into_iter().map(|g| g.group_name).collect(),
        })
    }

    async fn attach_user_policy(&self, user: &str, arn: &str) -> CloudResult<()> {
        self.call("iam", "attach-user-policy", &["--user-name", user, "--policy-arn", arn])
            .await
            .map(|_| ())
    }

    async fn detach_user_policy(&self, user: &str, arn: &str) -> CloudResult<()> {
        self.call("iam", "detach-user-policy", &["--user-name", user, "--policy-arn", arn])
            .await
            .map(|_| ())
    }

    async fn list_attached_user_policies(&self, user: &str) -> CloudResult<Vec<AttachedPolicy>> {
        let response: AttachedResponse = self
            .call_json("iam", "list-attached-user-policies", &["--user-name", user])
            .await?;
        Ok(attached(response))
    }

    async fn list_user_policies(&self, user: &str) -> CloudResult<Vec<String>> {
        let response: InlineResponse = self
            .call_json("iam", "list-user-policies", &["--user-name", user])
            .await?;
        Ok(response.policy_names)
    }

    async fn delete_user_policy(&self, user: &str, name: &str) -> CloudResult<()> {
        self.call("iam", "delete-user-policy", &["--user-name", user, "--policy-name", name])
            .await
            .map(|_| ())
    }

    async fn detach_group_policy(&self, group: &str, arn: &str) -> CloudResult<()> {
        self.call("iam", "detach-group-policy", &["--group-name", group, "--policy-arn", arn])
            .await
            .map(|_| ())
    }

    async fn list_roles(&self, token: Option<&str>) -> CloudResult<Page<IamRole>> {
        let response: RolesResponse = self
            .call_json("iam", "list-roles", &Self::paging(token))
            .await?;
        Ok(Page {
            items: response
                .roles
                .into_iter()
                .map(|r| IamRole {
                    name: r.role_name,
                    arn: r.arn,
                })
                .collect(),
            next_token: response.next_token,
        })
    }

    async fn delete_role(&self, name: &str) -> CloudResult<()> {
        self.call("iam", "delete-role", &["--role-name", name]).await.map(|_| ())
    }

    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<AttachedPolicy>> {
        let response: AttachedResponse = self
            .call_json("iam", "list-attached-role-policies", &["--role-name", role])
            .await?;
        Ok(attached(response))
    }

    async fn detach_role_policy(&self, role: &str, arn: &str) -> CloudResult<()> {
        self.call("iam", "detach-role-policy", &["--role-name", role, "--policy-arn", arn])
            .await
            .map(|_| ())
    }

    async fn list_role_policies(&self, role: &str) -> CloudResult<Vec<String>> {
        let response: InlineResponse = self
            .call_json("iam", "list-role-policies", &["--role-name", role])
            .await?;
        Ok(response.policy_names)
    }

    async fn delete_role_policy(&self, role: &str, name: &str) -> CloudResult<()> {
        self.call("iam", "delete-role-policy", &["--role-name", role, "--policy-name", name])
            .await
            .map(|_| ())
    }

    async fn list_buckets(&self) -> CloudResult<Vec<Bucket>> {
        let response: BucketsResponse = self.call_json("s3api", "list-buckets", &[]).await?;
        Ok(response
            .buckets
            .into_iter()
            .map(|b| Bucket { name: b.name })
            .collect())
    }

    async fn bucket_exists(&self, name: &str) -> CloudResult<bool> {
        match self.call("s3api", "head-bucket", &["--bucket", name]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_bucket(&self, settings: &BucketSettings) -> CloudResult<()> {
        let name = settings.name.as_str();
        let location = format!("LocationConstraint={}", settings.region);
        let mut args = vec!["--bucket", name, "--region", settings.region.as_str()];
        // us-east-1 rejects an explicit location constraint.
        if settings.region != "us-east-1" {
            args.extend(["--create-bucket-configuration", location.as_str()]);
        }
        self.call("s3api", "create-bucket", &args).await?;

        if settings.versioning {
            self.call(
                "s3api",
                "put-bucket-versioning",
                &["--bucket", name, "--versioning-configuration", "Status=Enabled"],
            )
            .await?;
        }
        if settings.encryption {
            self.call(
                "s3api",
                "put-bucket-encryption",
                &[
                    "--bucket",
                    name,
                    "--server-side-encryption-configuration",
                    DEFAULT_ENCRYPTION,
                ],
            )
            .await?;
        }
        if settings.block_public_access {
            self.call(
                "s3api",
                "put-public-access-block",
                &[
                    "--bucket",
                    name,
                    "--public-access-block-configuration",
                    BLOCK_ALL_PUBLIC_ACCESS,
                ],
            )
            .await?;
        }
        if !settings.tags.is_empty() {
            let tag_set = settings
                .tags
                .iter()
                .map(|t| serde_json::json!({"Key": t.key, "Value": t.value}))
                .collect::<Vec<_>>();
            let tagging = serde_json::json!({ "TagSet": tag_set }).to_string();
            let args = ["--bucket", name, "--tagging", tagging.as_str()];
            self.call("s3api", "put-bucket-tagging", &args).await?;
        }
        Ok(())
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        token: Option<&str>,
    ) -> CloudResult<Page<ObjectVersion>> {
        let mut args = vec!["--bucket", bucket];
        args.extend(Self::paging(token));
        let response: ObjectVersionsResponse = self
            .call_json("s3api", "list-object-versions", &args)
            .await?;
        Ok(Page {
            items: response
                .versions
                .into_iter()
                .chain(response.delete_markers)
                .map(|v| ObjectVersion {
                    key: v.key,
                    version_id: v.version_id,
                })
                .collect(),
            next_token: response.next_token,
        })
    }

    async fn delete_objects(&self, bucket: &str, objects: &[ObjectVersion]) -> CloudResult<()> {
        if objects.is_empty() {
            return Ok(());
        }
        let entries = objects
            .iter()
            .map(|o| match &o.version_id {
                Some(version) => serde_json::json!({"Key": o.key, "VersionId": version}),
                None => serde_json::json!({"Key": o.key}),
            })
            .collect::<Vec<_>>();
        let delete = serde_json::json!({ "Objects": entries, "Quiet": true }).to_string();
        let args = ["--bucket", bucket, "--delete", delete.as_str()];
        self.call("s3api", "delete-objects", &args).await.map(|_| ())
    }

    async fn delete_bucket(&self, name: &str) -> CloudResult<()> {
        self.call("s3api", "delete-bucket", &["--bucket", name]).await.map(|_| ())
    }

    async fn put_secret(&self, name: &str, value: &Secret, description: &str) -> CloudResult<()> {
        let created = self
            .call_secret(
                "create-secret",
                &[
                    "--name",
                    name,
                    "--description",
                    description,
                    "--secret-string",
                    SECRET_FROM_STDIN,
                ],
                value,
            )
            .await;
        let error = match created {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        match error.code.as_str() {
            "ResourceExistsException" => {}
            // Scheduled for deletion; bring it back before overwriting.
            "InvalidRequestException" => {
                self.call("secretsmanager", "restore-secret", &["--secret-id", name])
                    .await?;
            }
            _ => return Err(error),
        }
        self.call_secret(
            "put-secret-value",
            &["--secret-id", name, "--secret-string", SECRET_FROM_STDIN],
            value,
        )
        .await
        .map(|_| ())
    }

    async fn delete_secret(&self, name: &str) -> CloudResult<()> {
        self.call(
            "secretsmanager",
            "delete-secret",
            &["--secret-id", name, "--force-delete-without-recovery"],
        )
        .await
        .map(|_| ())
    }

    async fn put_secret_resource_policy(
        &self,
        name: &str,
        document: &PolicyDocument,
    ) -> CloudResult<()> {
        let json = document.to_json();
        self.call(
            "secretsmanager",
            "put-resource-policy",
            &["--secret-id", name, "--resource-policy", json.as_str()],
        )
        .await
        .map(|_| ())
    }
}

/// Connects identities to [`AwsCli`] clients sharing one runner
#[derive(Clone)]
pub struct AwsCliConnector {
    runner: Arc<dyn CommandRunner>,
    bin: String,
    timeout: Duration,
}

impl AwsCliConnector {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            bin: bin.into(),
            timeout,
        }
    }
}

impl Connector for AwsCliConnector {
    fn connect(&self, identity: &Identity) -> Box<dyn CloudApi> {
        Box::new(AwsCli::new(
            identity.clone(),
            Arc::clone(&self.runner),
            self.bin.clone(),
            self.timeout,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::IdentityKind;
    use crate::process::{CommandOutput, ScriptedRunner};

    fn client(runner: Arc<ScriptedRunner>) -> AwsCli {
        let identity = Identity::new(
            "bootstrap-user",
            IdentityKind::Bootstrap,
            "AKIAEXAMPLE000000001",
            "bootstrap-secret",
            "us-east-1",
        );
        AwsCli::new(identity, runner, "aws", Duration::from_secs(30))
    }

    #[test]
    fn test_parse_cli_error() {
        let err = parse_cli_error(
            "\nAn error occurred (NoSuchEntity) when calling the GetUser operation: \
             The user with name bootstrap-user cannot be found.\n",
        );
        assert_eq!(err.code, "NoSuchEntity");
        assert_eq!(err.message, "The user with name bootstrap-user cannot be found.");

        let err = parse_cli_error("Unable to locate credentials.");
        assert_eq!(err.code, "Unknown");
        assert_eq!(err.message, "Unable to locate credentials.");
    }

    #[tokio::test]
    async fn test_calls_run_with_isolated_identity_env() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "aws sts get-caller-identity",
            CommandOutput::ok(concat!(
                r#"{"UserId":"AIDA1","Account":"123456789012","#,
                r#""Arn":"arn:aws:iam::123456789012:user/bootstrap-user"}"#,
            )),
        ));
        let caller = client(runner.clone()).caller_identity().await.unwrap();
        assert_eq!(caller.user_name(), Some("bootstrap-user"));

        let call = &runner.calls()[0];
        assert_eq!(call.display(), "aws sts get-caller-identity --output json");
        assert!(call.env_remove.iter().any(|v| v == "AWS_PROFILE"));
        assert!(call
            .env
            .iter()
            .any(|(k, v)| k == "AWS_ACCESS_KEY_ID" && v == "AKIAEXAMPLE000000001"));
    }

    #[tokio::test]
    async fn test_provider_error_code_is_preserved() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "aws iam create-access-key",
            CommandOutput::failed(
                254,
                "An error occurred (LimitExceeded) when calling the CreateAccessKey operation: \
                 Cannot exceed quota for AccessKeysPerUser: 2",
            ),
        ));
        let err = client(runner).create_access_key("developer-user").await.unwrap_err();
        assert!(err.is_limit_exceeded());
        assert_eq!(err.message, "Cannot exceed quota for AccessKeysPerUser: 2");
    }

    #[tokio::test]
    async fn test_head_bucket_not_found_is_false() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "aws s3api head-bucket",
            CommandOutput::failed(
                254,
                "An error occurred (404) when calling the HeadBucket operation: Not Found",
            ),
        ));
        assert!(!client(runner).bucket_exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_object_versions_include_delete_markers() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "aws s3api list-object-versions",
            CommandOutput::ok(concat!(
                r#"{"Versions":[{"Key":"a","VersionId":"1"}],"#,
                r#""DeleteMarkers":[{"Key":"b","VersionId":"2"}],"NextToken":"t"}"#,
            )),
        ));
        let page = client(runner).list_object_versions("bucket", None).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_token.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_put_secret_falls_back_to_put_value() {
        let runner = Arc::new(
            ScriptedRunner::new().on(
                "aws secretsmanager create-secret",
                CommandOutput::failed(
                    254,
                    "An error occurred (ResourceExistsException) \
                     when calling the CreateSecret operation: exists",
                ),
            ),
        );
        client(runner.clone())
            .put_secret("pave/bootstrap-credentials", &Secret::new("{}"), "bootstrap")
            .await
            .unwrap();
        let lines = runner.call_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("aws secretsmanager put-secret-value"));
        assert!(runner.calls()[1].stdin.is_some());
        assert!(!lines[1].contains("{}"));
    }

    #[tokio::test]
    async fn test_secret_resource_policy_is_sent_as_json() {
        let runner = Arc::new(ScriptedRunner::new());
        let policy = crate::policy::secret_resource_policy("123456789012", &[]);
        client(runner.clone())
            .put_secret_resource_policy("pave/bootstrap-credentials", &policy)
            .await
            .unwrap();
        let call = &runner.calls()[0];
        assert!(call
            .display()
            .starts_with("aws secretsmanager put-resource-policy --secret-id pave/bootstrap"));
        assert!(call.args.iter().any(|arg| arg.contains("\"StringNotEquals\"")));
    }
}
