// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local credential files
//!
//! Every AWS-calling operation runs as exactly one identity loaded from a
//! `<kind>.env` file. The store writes those files atomically with mode 0600
//! and hands out sessions that hide ambient credentials from the process
//! environment while they are alive.

mod file;
mod store;

pub use file::{parse_credential_file, render_credential_file};
pub use store::{
    clear_environment, ClearedEnvironment, CredentialStore, IdentitySession,
    AMBIENT_CREDENTIAL_VARS,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{PaveError, Result};

/// The role an identity plays in the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Root,
    Bootstrap,
    Admin,
    Developer,
    Ci,
}

impl IdentityKind {
    pub const ALL: [IdentityKind; 5] = [
        IdentityKind::Root,
        IdentityKind::Bootstrap,
        IdentityKind::Admin,
        IdentityKind::Developer,
        IdentityKind::Ci,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Root => "root",
            IdentityKind::Bootstrap => "bootstrap",
            IdentityKind::Admin => "admin",
            IdentityKind::Developer => "developer",
            IdentityKind::Ci => "ci",
        }
    }

    /// File name of this kind's credential file
    pub fn file_name(&self) -> String {
        format!("{}.env", self.as_str())
    }
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl std::str::FromStr for IdentityKind {
    type Err = PaveError;

    fn from_str(s: &str) -> Result<Self> {
        IdentityKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| PaveError::InvalidArgument {
                message: format!("Unknown identity kind: {s}"),
            })
    }
}

/// A secret value wiped from memory on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("Secret(***)")
    }
}

/// An access key pair bound to a named identity
#[derive(Debug, Clone)]
pub struct Identity {
    /// IAM user name (or `root`)
    pub name: String,
    pub kind: IdentityKind,
    pub access_key_id: String,
    pub secret_access_key: Secret,
    pub session_token: Option<Secret>,
    pub region: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(
        name: impl Into<String>,
        kind: IdentityKind,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            access_key_id: access_key_id.into(),
            secret_access_key: Secret::new(secret_access_key),
            session_token: None,
            region: region.into(),
            created_at: Utc::now(),
        }
    }

    /// Environment assignments handed to subprocesses acting as this identity
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("AWS_ACCESS_KEY_ID", self.access_key_id.clone()),
            ("AWS_SECRET_ACCESS_KEY", self.secret_access_key.expose().to_string()),
            ("AWS_REGION", self.region.clone()),
            ("AWS_DEFAULT_REGION", self.region.clone()),
        ];
        if let Some(token) = &self.session_token {
            vars.push(("AWS_SESSION_TOKEN", token.expose().to_string()));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in IdentityKind::ALL {
            assert_eq!(kind.as_str().parse::<IdentityKind>().unwrap(), kind);
        }
        assert!("operator".parse::<IdentityKind>().is_err());
        assert_eq!(IdentityKind::Developer.file_name(), "developer.env");
    }

    #[test]
    fn test_secret_is_redacted_in_debug() {
        let identity = Identity::new(
            "bootstrap-user",
            IdentityKind::Bootstrap,
            "AKIAEXAMPLE000000001",
            "very-secret-value",
            "us-east-1",
        );
        let debug = format!("{identity:?}");
        assert!(debug.contains("AKIAEXAMPLE000000001"));
        assert!(!debug.contains("very-secret-value"));
    }

    #[test]
    fn test_env_vars_include_session_token_when_present() {
        let mut identity = Identity::new("ci", IdentityKind::Ci, "ASIAEXAMPLE", "s", "eu-west-1");
        assert_eq!(identity.env_vars().len(), 4);
        identity.session_token = Some(Secret::new("token"));
        let vars = identity.env_vars();
        assert!(vars.iter().any(|(k, v)| *k == "AWS_SESSION_TOKEN" && v == "token"));
    }
}
