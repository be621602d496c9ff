// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credential file store and ambient-environment isolation

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{parse_credential_file, render_credential_file, Identity, IdentityKind};
use crate::error::{PaveError, Result};

/// Variables through which ambient AWS credentials leak into a process
pub const AMBIENT_CREDENTIAL_VARS: [&str; 6] = [
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_SECURITY_TOKEN",
    "AWS_PROFILE",
    "AWS_DEFAULT_PROFILE",
];

const OWNER_READ_WRITE: u32 = 0o600;

/// Reads and writes `<kind>.env` files under one directory
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
    default_region: String,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>, default_region: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            default_region: default_region.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the credential file for `kind`
    pub fn path_for(&self, kind: IdentityKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Load the identity stored for `kind`
    pub fn load(&self, kind: IdentityKind) -> Result<Identity> {
        let path = self.path_for(kind);
        if !path.exists() {
            return Err(PaveError::NotFound {
                what: format!("{kind} credential file {}", path.display()),
            });
        }
        let contents = fs::read_to_string(&path)?;
        let identity = parse_credential_file(&contents, kind, &self.default_region)?;
        debug!(kind = %kind, access_key_id = %identity.access_key_id, "Loaded credentials");
        Ok(identity)
    }

    /// Clear ambient credentials, then load exactly one credential file
    pub fn session(&self, kind: IdentityKind) -> Result<IdentitySession> {
        let environment = clear_environment();
        let identity = self.load(kind)?;
        Ok(IdentitySession {
            identity,
            _environment: environment,
        })
    }

    /// Atomically write the credential file for `kind` with mode 0600.
    ///
    /// The temp file is created 0600, fsynced and renamed over the target;
    /// the final mode is checked after the rename.
    pub fn save(&self, kind: IdentityKind, identity: &Identity) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(kind);
        let temp_path = self.dir.join(format!(".{}.tmp", kind.file_name()));
        let contents = render_credential_file(identity);

        let write_result = write_restricted(&temp_path, contents.as_bytes());
        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        fs::rename(&temp_path, &path)?;
        sync_dir(&self.dir);
        verify_restricted(&path)?;

        info!(kind = %kind, path = %path.display(), "Saved credentials");
        Ok(path)
    }

    /// Delete the credential file for `kind`; absent is success
    pub fn remove(&self, kind: IdentityKind) -> Result<bool> {
        let path = self.path_for(kind);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(kind = %kind, "Removed credential file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Kinds that currently have a credential file
    pub fn list(&self) -> Vec<IdentityKind> {
        IdentityKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.path_for(*kind).is_file())
            .collect()
    }
}

/// A loaded identity with ambient credentials hidden for its lifetime
#[derive(Debug)]
pub struct IdentitySession {
    pub identity: Identity,
    _environment: ClearedEnvironment,
}

/// Scope in which ambient AWS credential variables are unset.
///
/// The removed values are put back when the guard drops.
#[derive(Debug)]
pub struct ClearedEnvironment {
    saved: Vec<(&'static str, std::ffi::OsString)>,
}

/// Remove ambient credential variables until the returned guard drops
pub fn clear_environment() -> ClearedEnvironment {
    let mut saved = Vec::new();
    for var in AMBIENT_CREDENTIAL_VARS {
        if let Some(value) = std::env::var_os(var) {
            saved.push((var, value));
            std::env::remove_var(var);
        }
    }
    if !saved.is_empty() {
        warn!(
            count = saved.len(),
            "Ambient AWS credentials hidden for this operation"
        );
    }
    ClearedEnvironment { saved }
}

impl Drop for ClearedEnvironment {
    fn drop(&mut self) {
        for (var, value) in self.saved.drain(..) {
            std::env::set_var(var, value);
        }
    }
}

fn write_restricted(path: &Path, data: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(OWNER_READ_WRITE);
    }
    let mut file = options.open(path)?;
    set_restricted(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn set_restricted(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    // A pre-existing temp file keeps its old mode under `open`.
    fs::set_permissions(path, fs::Permissions::from_mode(OWNER_READ_WRITE)).map_err(|e| {
        PaveError::Permission {
            message: format!("cannot restrict {}: {e}", path.display()),
        }
    })
}

#[cfg(not(unix))]
fn set_restricted(path: &Path) -> Result<()> {
    Err(PaveError::Permission {
        message: format!(
            "{}: owner-only permissions are not enforceable on this platform",
            path.display()
        ),
    })
}

#[cfg(unix)]
fn verify_restricted(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode() & 0o777;
    if mode != OWNER_READ_WRITE {
        return Err(PaveError::Permission {
            message: format!("{} has mode {:o}, expected 600", path.display(), mode),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn verify_restricted(path: &Path) -> Result<()> {
    set_restricted(path)
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
