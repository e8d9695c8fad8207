//! Maps `owner/name` to the on-disk bare repository path. Two hash-derived
//! prefix directories keep any single directory to a few thousand entries.

use std::path::{Path, PathBuf};

use crate::errors::{ForgeError, Result};
use crate::utils::sha256_hex;

/// Resolves repository names to confined paths under a fixed root.
#[derive(Debug, Clone)]
pub struct RepoLocator {
    root: PathBuf,
}

impl RepoLocator {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `RepositoryRoot / sha256(owner)[0..2] / sha256(owner)[2..4] / owner /
    /// name.git`. Both names must pass [`validate_name`].
    pub fn locate(&self, owner: &str, name: &str) -> Result<PathBuf> {
        validate_name(owner)?;
        validate_name(name)?;
        let digest = sha256_hex(owner.as_bytes());
        Ok(self
            .root
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(owner)
            .join(format!("{name}.git")))
    }

    /// Parse an `owner/name[.git]` path (as it appears in SSH exec commands
    /// and request URLs) into its components.
    pub fn parse_repo_path(path: &str) -> Result<(String, String)> {
        let trimmed = path.trim_matches('/');
        let (owner, name) = trimmed
            .split_once('/')
            .ok_or_else(|| ForgeError::InvalidRepository(format!("expected owner/name: {path}")))?;
        if name.contains('/') {
            return Err(ForgeError::InvalidRepository(format!(
                "expected exactly one separator: {path}"
            )));
        }
        let name = name.strip_suffix(".git").unwrap_or(name);
        validate_name(owner)?;
        validate_name(name)?;
        Ok((owner.to_string(), name.to_string()))
    }
}

/// Owner and repository names match `^[A-Za-z0-9][A-Za-z0-9._-]{0,62}$` and
/// are never `.` or `..`.
pub fn validate_name(name: &str) -> Result<()> {
    if name == "." || name == ".." {
        return Err(ForgeError::InvalidRepository(format!(
            "reserved name: {name}"
        )));
    }
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return Err(ForgeError::InvalidRepository(format!(
            "name length out of range: {name}"
        )));
    }
    if !bytes[0].is_ascii_alphanumeric() {
        return Err(ForgeError::InvalidRepository(format!(
            "name must start alphanumeric: {name}"
        )));
    }
    for &b in &bytes[1..] {
        if !(b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')) {
            return Err(ForgeError::InvalidRepository(format!(
                "invalid byte in name: {name}"
            )));
        }
    }
    Ok(())
}
