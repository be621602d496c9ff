// SPDX-License-Identifier: AGPL-3.0-or-later
//! `KEY=VALUE` credential file format

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

use super::{Identity, IdentityKind, Secret};
use crate::error::{PaveError, Result};

const CREATED_PREFIX: &str = "# Created:";
const USER_PREFIX: &str = "# User:";

/// Render an identity as the contents of a credential file
pub fn render_credential_file(identity: &Identity) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {} credentials\n", identity.kind));
    out.push_str(&format!("{USER_PREFIX} {}\n", identity.name));
    out.push_str(&format!(
        "{CREATED_PREFIX} {}\n",
        identity.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    for (key, value) in identity.env_vars() {
        out.push_str(key);
        out.push('=');
        out.push_str(&value);
        out.push('\n');
    }
    out
}

/// Parse credential file contents for the given kind.
///
/// Blank lines and `#` comments are skipped; values are taken verbatim
/// after the first `=`.
pub fn parse_credential_file(
    contents: &str,
    kind: IdentityKind,
    default_region: &str,
) -> Result<Identity> {
    let mut values: HashMap<&str, &str> = HashMap::new();
    let mut created_at: Option<DateTime<Utc>> = None;
    let mut name: Option<String> = None;

    for (number, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(CREATED_PREFIX) {
            created_at = DateTime::parse_from_rfc3339(rest.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
            continue;
        }
        if let Some(rest) = line.strip_prefix(USER_PREFIX) {
            name = Some(rest.trim().to_string());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| PaveError::InvalidArgument {
            message: format!("{} credential file line {}: expected KEY=VALUE", kind, number + 1),
        })?;
        values.insert(key.trim(), value.trim());
    }

    let required = |key: &str| -> Result<String> {
        values
            .get(key)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .ok_or_else(|| PaveError::InvalidArgument {
                message: format!("{kind} credential file is missing {key}"),
            })
    };

    let access_key_id = required("AWS_ACCESS_KEY_ID")?;
    let secret_access_key = required("AWS_SECRET_ACCESS_KEY")?;
    let region = values
        .get("AWS_REGION")
        .or_else(|| values.get("AWS_DEFAULT_REGION"))
        .map(|v| v.to_string())
        .unwrap_or_else(|| default_region.to_string());

    Ok(Identity {
        name: name.unwrap_or_else(|| kind.as_str().to_string()),
        kind,
        access_key_id,
        secret_access_key: Secret::new(secret_access_key),
        session_token: values
            .get("AWS_SESSION_TOKEN")
            .filter(|v| !v.is_empty())
            .map(|v| Secret::new(*v)),
        region,
        created_at: created_at.unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_file() {
        let contents = "AWS_ACCESS_KEY_ID=AKIA1234\nAWS_SECRET_ACCESS_KEY=abc/def=\n";
        let identity = parse_credential_file(contents, IdentityKind::Admin, "us-east-1").unwrap();
        assert_eq!(identity.access_key_id, "AKIA1234");
        // Only the first '=' separates key from value.
        assert_eq!(identity.secret_access_key.expose(), "abc/def=");
        assert_eq!(identity.region, "us-east-1");
        assert_eq!(identity.name, "admin");
        assert!(identity.session_token.is_none());
    }

    #[test]
    fn test_parse_legacy_default_region_and_comments() {
        let contents = r#"
# Developer user credentials - Limited AWS access
# Created: 2025-03-01T10:00:00Z
# User: developer-user
AWS_ACCESS_KEY_ID=AKIADEV
AWS_SECRET_ACCESS_KEY=secret
AWS_DEFAULT_REGION=eu-central-1
AWS_SESSION_TOKEN=tok
"#;
        let identity =
            parse_credential_file(contents, IdentityKind::Developer, "us-east-1").unwrap();
        assert_eq!(identity.region, "eu-central-1");
        assert_eq!(identity.name, "developer-user");
        assert_eq!(identity.created_at.to_rfc3339(), "2025-03-01T10:00:00+00:00");
        assert_eq!(identity.session_token.unwrap().expose(), "tok");
    }

    #[test]
    fn test_parse_missing_secret_is_invalid() {
        let err = parse_credential_file("AWS_ACCESS_KEY_ID=AKIA\n", IdentityKind::Ci, "us-east-1")
            .unwrap_err();
        assert!(matches!(err, PaveError::InvalidArgument { .. }));
        assert!(err.to_string().contains("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn test_parse_rejects_garbage_line() {
        let err = parse_credential_file("export AWS\n", IdentityKind::Ci, "us-east-1").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_rendered_file_parses_back() {
        let identity = Identity::new(
            "bootstrap-user",
            IdentityKind::Bootstrap,
            "AKIABOOT",
            "s3cr3t",
            "us-west-2",
        );
        let rendered = render_credential_file(&identity);
        assert!(rendered.contains("AWS_REGION=us-west-2\n"));
        assert!(rendered.contains("AWS_DEFAULT_REGION=us-west-2\n"));

        let parsed =
            parse_credential_file(&rendered, IdentityKind::Bootstrap, "us-east-1").unwrap();
        assert_eq!(parsed.name, "bootstrap-user");
        assert_eq!(parsed.access_key_id, "AKIABOOT");
        assert_eq!(parsed.secret_access_key.expose(), "s3cr3t");
        assert_eq!(parsed.created_at.timestamp(), identity.created_at.timestamp());
    }
}
