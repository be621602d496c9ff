// SPDX-License-Identifier: AGPL-3.0-or-later
//! IAM policy documents
//!
//! Documents serialize in the AWS JSON grammar. [`evaluate_all`] applies the
//! provider's precedence: any matching `Deny` wins over every `Allow` in the
//! set, and no match at all is an implicit deny.
//!
//! Resource policies additionally name a `Principal` and may carry string
//! conditions on `aws:PrincipalArn`; [`evaluate_resource_policy`] checks
//! both.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub const POLICY_VERSION: &str = "2012-10-17";

/// Actions the bootstrap identity may never perform on its own resources
pub const PROTECTED_ACTIONS: &[&str] = &[
    "iam:DeleteUser",
    "iam:UpdateUser",
    "iam:TagUser",
    "iam:UntagUser",
    "iam:AttachUserPolicy",
    "iam:DetachUserPolicy",
    "iam:PutUserPolicy",
    "iam:DeleteUserPolicy",
    "iam:DeleteRole",
    "iam:DetachRolePolicy",
    "iam:DeletePolicy",
    "iam:CreatePolicyVersion",
    "iam:DeletePolicyVersion",
    "iam:SetDefaultPolicyVersion",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// Outcome of evaluating a request against a policy set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    ExplicitDeny,
    ImplicitDeny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Principal element of a resource policy statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Principal {
    /// `"*"`
    Any(String),
    Aws {
        #[serde(rename = "AWS", deserialize_with = "one_or_many")]
        aws: Vec<String>,
    },
}

impl Principal {
    pub fn aws<I: IntoIterator<Item = String>>(arns: I) -> Self {
        Principal::Aws {
            aws: arns.into_iter().collect(),
        }
    }

    /// Whether `principal_arn` is covered; an account root ARN covers the
    /// whole account
    pub fn matches(&self, principal_arn: &str) -> bool {
        match self {
            Principal::Any(value) => value == "*",
            Principal::Aws { aws } => aws.iter().any(|entry| {
                entry == "*"
                    || entry == principal_arn
                    || entry
                        .strip_suffix(":root")
                        .is_some_and(|account| principal_arn.starts_with(&format!("{account}:")))
            }),
        }
    }
}

/// Values of one condition key, a string or a list in JSON
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionValues(pub Vec<String>);

impl<'de> Deserialize<'de> for ConditionValues {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        one_or_many(deserializer).map(ConditionValues)
    }
}

/// `operator -> key -> values`
pub type Conditions = BTreeMap<String, BTreeMap<String, ConditionValues>>;

/// A request as seen by a resource policy
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub principal_arn: &'a str,
    pub action: &'a str,
    pub resource: &'a str,
}

impl Request<'_> {
    fn context(&self, key: &str) -> Option<&str> {
        key.eq_ignore_ascii_case("aws:PrincipalArn")
            .then_some(self.principal_arn)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    #[serde(deserialize_with = "one_or_many")]
    pub action: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub resource: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: Conditions,
}

impl Statement {
    pub fn new<A, R>(sid: &str, effect: Effect, actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            sid: Some(sid.to_string()),
            effect,
            principal: None,
            action: actions.into_iter().map(Into::into).collect(),
            resource: resources.into_iter().map(Into::into).collect(),
            condition: Conditions::new(),
        }
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_condition<I>(mut self, operator: &str, key: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.condition.entry(operator.to_string()).or_default().insert(
            key.to_string(),
            ConditionValues(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Whether this statement covers `action` on `resource`
    pub fn matches(&self, action: &str, resource: &str) -> bool {
        self.action.iter().any(|p| wildcard_match(p, action, true))
            && self.resource.iter().any(|p| wildcard_match(p, resource, false))
    }

    /// Principal, action, resource and every condition all match
    pub fn matches_request(&self, request: &Request<'_>) -> bool {
        self.principal
            .as_ref()
            .is_some_and(|p| p.matches(request.principal_arn))
            && self.matches(request.action, request.resource)
            && self.conditions_hold(request)
    }

    /// Unknown operators never hold
    fn conditions_hold(&self, request: &Request<'_>) -> bool {
        self.condition.iter().all(|(operator, keys)| {
            keys.iter().all(|(key, ConditionValues(values))| {
                let actual = request.context(key);
                let equals = |v: &String| actual == Some(v.as_str());
                let like = |v: &String| actual.is_some_and(|a| wildcard_match(v, a, false));
                match operator.as_str() {
                    "StringEquals" => values.iter().any(equals),
                    "StringNotEquals" => !values.iter().any(equals),
                    "StringLike" => values.iter().any(like),
                    "StringNotLike" => !values.iter().any(like),
                    _ => false,
                }
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    #[serde(default = "default_version")]
    pub version: String,
    pub statement: Vec<Statement>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            version: default_version(),
            statement: Vec::new(),
        }
    }
}

impl PolicyDocument {
    pub fn with_statement(mut self, statement: Statement) -> Self {
        self.statement.push(statement);
        self
    }

    pub fn evaluate(&self, action: &str, resource: &str) -> Decision {
        evaluate_all(std::iter::once(self), action, resource)
    }

    pub fn to_json(&self) -> String {
        // Serializing plain strings and enums cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Evaluate a request against every document in a set
pub fn evaluate_all<'a, I>(documents: I, action: &str, resource: &str) -> Decision
where
    I: IntoIterator<Item = &'a PolicyDocument>,
{
    let mut allowed = false;
    for statement in documents.into_iter().flat_map(|d| d.statement.iter()) {
        if !statement.matches(action, resource) {
            continue;
        }
        match statement.effect {
            Effect::Deny => return Decision::ExplicitDeny,
            Effect::Allow => allowed = true,
        }
    }
    if allowed {
        Decision::Allow
    } else {
        Decision::ImplicitDeny
    }
}

/// Evaluate a request against a resource policy
pub fn evaluate_resource_policy(document: &PolicyDocument, request: &Request<'_>) -> Decision {
    let mut allowed = false;
    for statement in document.statement.iter().filter(|s| s.matches_request(request)) {
        match statement.effect {
            Effect::Deny => return Decision::ExplicitDeny,
            Effect::Allow => allowed = true,
        }
    }
    if allowed {
        Decision::Allow
    } else {
        Decision::ImplicitDeny
    }
}

/// Glob match supporting `*` (any run) and `?` (one character)
pub fn wildcard_match(pattern: &str, value: &str, case_insensitive: bool) -> bool {
    let fold = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.to_lowercase().chars().collect()
        } else {
            s.chars().collect()
        }
    };
    let p = fold(pattern);
    let v = fold(value);

    let (mut pi, mut vi) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while vi < v.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            resume = vi;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            vi = resume;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// ARNs of the resources making up the bootstrap identity
#[derive(Debug, Clone)]
pub struct BootstrapArns {
    pub user: String,
    pub role: String,
    pub policy: String,
}

impl BootstrapArns {
    pub fn new(account_id: &str, user_name: &str, role_name: &str, policy_name: &str) -> Self {
        Self {
            user: format!("arn:aws:iam::{account_id}:user/{user_name}"),
            role: format!("arn:aws:iam::{account_id}:role/{role_name}"),
            policy: format!("arn:aws:iam::{account_id}:policy/{policy_name}"),
        }
    }
}

/// Policy granting broad provisioning rights while denying every
/// self-modifying action on the bootstrap's own resources
pub fn bootstrap_policy(arns: &BootstrapArns, allowed_services: &[String]) -> PolicyDocument {
    let protected = [arns.user.clone(), arns.role.clone(), arns.policy.clone()];

    let mut document = PolicyDocument::default()
        .with_statement(Statement::new("FullIAMAccess", Effect::Allow, ["iam:*"], ["*"]))
        .with_statement(Statement::new(
            "ProtectBootstrapResources",
            Effect::Deny,
            PROTECTED_ACTIONS.iter().copied(),
            protected,
        ));

    if !allowed_services.is_empty() {
        document = document.with_statement(Statement::new(
            "ProvisioningServices",
            Effect::Allow,
            allowed_services.iter().map(|s| format!("{s}:*")),
            ["*"],
        ));
    }
    document
}

/// Secrets Manager policy that only the account root and `admin_arns` pass
pub fn secret_resource_policy(account_id: &str, admin_arns: &[String]) -> PolicyDocument {
    let root = format!("arn:aws:iam::{account_id}:root");
    let exempt: Vec<String> = std::iter::once(root.clone())
        .chain(admin_arns.iter().cloned())
        .collect();

    PolicyDocument::default()
        .with_statement(
            Statement::new("AllowRootAccount", Effect::Allow, ["secretsmanager:*"], ["*"])
                .with_principal(Principal::aws([root])),
        )
        .with_statement(
            Statement::new("DenyEveryoneElse", Effect::Deny, ["secretsmanager:*"], ["*"])
                .with_principal(Principal::Any("*".to_string()))
                .with_condition("StringNotEquals", "aws:PrincipalArn", exempt),
        )
}

fn default_version() -> String {
    POLICY_VERSION.to_string()
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arns() -> BootstrapArns {
        BootstrapArns::new(
            "123456789012",
            "bootstrap-user",
            "PaveBootstrapRole",
            "PaveBootstrapPolicy",
        )
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("iam:*", "iam:DeleteUser", false));
        assert!(wildcard_match("IAM:delete*", "iam:DeleteUser", true));
        assert!(!wildcard_match("IAM:delete*", "iam:DeleteUser", false));
        assert!(wildcard_match(
            "arn:aws:iam::*:user/boot?trap-user",
            "arn:aws:iam::1:user/bootstrap-user",
            false
        ));
        assert!(wildcard_match("*", "", false));
        assert!(wildcard_match("a*b*c", "aXXbYYc", false));
        assert!(!wildcard_match("a*b*c", "aXXbYY", false));
        assert!(!wildcard_match("s3:*", "iam:ListUsers", false));
    }

    #[test]
    fn test_deny_overrides_allow() {
        let policy = bootstrap_policy(&arns(), &["s3".to_string()]);
        let own_user = "arn:aws:iam::123456789012:user/bootstrap-user";

        assert_eq!(policy.evaluate("iam:DeleteUser", own_user), Decision::ExplicitDeny);
        let own_policy = "arn:aws:iam::123456789012:policy/PaveBootstrapPolicy";
        assert_eq!(policy.evaluate("iam:DeletePolicy", own_policy), Decision::ExplicitDeny);
        assert_eq!(
            policy.evaluate("iam:DeleteUser", "arn:aws:iam::123456789012:user/developer-user"),
            Decision::Allow
        );
        assert_eq!(policy.evaluate("iam:CreateAccessKey", own_user), Decision::Allow);
        assert_eq!(policy.evaluate("s3:ListAllMyBuckets", "*"), Decision::Allow);
        assert_eq!(policy.evaluate("ec2:RunInstances", "*"), Decision::ImplicitDeny);
    }

    #[test]
    fn test_deny_in_other_document_still_wins() {
        let allow_all = PolicyDocument::default()
            .with_statement(Statement::new("All", Effect::Allow, ["*"], ["*"]));
        let deny = PolicyDocument::default()
            .with_statement(Statement::new("NoDelete", Effect::Deny, ["iam:DeleteUser"], ["*"]));
        assert_eq!(
            evaluate_all([&allow_all, &deny], "iam:DeleteUser", "arn:x"),
            Decision::ExplicitDeny
        );
        assert!(evaluate_all([&allow_all, &deny], "iam:GetUser", "arn:x").is_allowed());
    }

    #[test]
    fn test_parse_aws_json_with_scalar_fields() {
        let json = r#"{
            "Version": "2012-10-17",
            "Statement": [
                {"Effect": "Allow", "Action": "s3:GetObject",
                 "Resource": "arn:aws:s3:::bucket/*"},
                {"Sid": "Two", "Effect": "Deny", "Action": ["s3:DeleteObject"],
                 "Resource": ["*"]}
            ]
        }"#;
        let policy = PolicyDocument::from_json(json).unwrap();
        assert_eq!(policy.statement.len(), 2);
        assert_eq!(policy.statement[0].action, vec!["s3:GetObject"]);
        assert!(policy.evaluate("s3:GetObject", "arn:aws:s3:::bucket/key").is_allowed());
    }

    #[test]
    fn test_bootstrap_policy_serializes_in_aws_grammar() {
        let json = bootstrap_policy(&arns(), &[]).to_json();
        assert!(json.contains("\"Version\":\"2012-10-17\""));
        assert!(json.contains("\"Effect\":\"Deny\""));
        assert!(json.contains("arn:aws:iam::123456789012:user/bootstrap-user"));
        assert!(!json.contains("ProvisioningServices"));
        let back = PolicyDocument::from_json(&json).unwrap();
        assert_eq!(back, bootstrap_policy(&arns(), &[]));
    }

    #[test]
    fn test_secret_policy_denies_everyone_but_root_and_admins() {
        let admin = "arn:aws:iam::123456789012:user/admin-user".to_string();
        let policy = secret_resource_policy("123456789012", &[admin.clone()]);
        fn request(principal_arn: &str) -> Request<'_> {
            Request {
                principal_arn,
                action: "secretsmanager:GetSecretValue",
                resource: "arn:aws:secretsmanager:us-east-1:123456789012:secret:pave/bootstrap",
            }
        }

        let root = evaluate_resource_policy(&policy, &request("arn:aws:iam::123456789012:root"));
        assert_eq!(root, Decision::Allow);
        let admin_decision = evaluate_resource_policy(&policy, &request(&admin));
        assert_eq!(admin_decision, Decision::Allow);
        let bootstrap = request("arn:aws:iam::123456789012:user/bootstrap-user");
        assert_eq!(evaluate_resource_policy(&policy, &bootstrap), Decision::ExplicitDeny);
    }

    #[test]
    fn test_parse_resource_policy_with_scalar_principal_and_condition() {
        let json = r#"{
            "Version": "2012-10-17",
            "Statement": [
                {"Effect": "Allow", "Principal": {"AWS": "arn:aws:iam::1:root"},
                 "Action": "secretsmanager:*", "Resource": "*"},
                {"Effect": "Deny", "Principal": "*", "Action": "secretsmanager:*",
                 "Resource": "*",
                 "Condition": {"StringNotLike": {"aws:PrincipalArn": "arn:aws:iam::1:user/ops-*"}}}
            ]
        }"#;
        let policy = PolicyDocument::from_json(json).unwrap();
        assert_eq!(
            policy.statement[0].principal,
            Some(Principal::aws(["arn:aws:iam::1:root".to_string()]))
        );
        let request = Request {
            principal_arn: "arn:aws:iam::1:user/ops-alice",
            action: "secretsmanager:PutSecretValue",
            resource: "*",
        };
        assert_eq!(evaluate_resource_policy(&policy, &request), Decision::Allow);
        let outsider = Request {
            principal_arn: "arn:aws:iam::1:user/dev",
            ..request
        };
        assert_eq!(evaluate_resource_policy(&policy, &outsider), Decision::ExplicitDeny);
    }
}
