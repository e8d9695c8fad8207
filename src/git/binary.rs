//! One-time resolution of the bundled git binary. The absolute path is
//! resolved from configured candidates at startup and cached; `PATH` is never
//! consulted at request time.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::GitConfig;
use crate::errors::{ForgeError, Result};

/// Resolved, canonicalized location of the git executable.
#[derive(Debug, Clone)]
pub struct GitBinary {
    path: PathBuf,
}

impl GitBinary {
    /// Resolve the git binary from the configured candidate list. The first
    /// existing executable wins. Fails with `GitNotFound` when no candidate
    /// resolves.
    pub fn locate(config: &GitConfig) -> Result<Self> {
        for candidate in &config.binary_candidates {
            if let Some(found) = Self::probe(candidate) {
                tracing::info!(path = %found.display(), "resolved git binary");
                return Ok(Self { path: found });
            }
        }
        Err(ForgeError::GitNotFound(format!(
            "no executable among candidates: {:?}",
            config.binary_candidates
        )))
    }

    /// Use an explicit path, still canonicalized and checked for
    /// executability. Intended for tests and embedders that bundle git at a
    /// known location.
    pub fn at(path: &Path) -> Result<Self> {
        Self::probe(path)
            .map(|path| Self { path })
            .ok_or_else(|| ForgeError::GitNotFound(path.display().to_string()))
    }

    fn probe(candidate: &Path) -> Option<PathBuf> {
        let resolved = std::fs::canonicalize(candidate).ok()?;
        let meta = std::fs::metadata(&resolved).ok()?;
        if !meta.is_file() {
            return None;
        }
        if meta.permissions().mode() & 0o111 == 0 {
            return None;
        }
        Some(resolved)
    }

    /// Cached absolute path, used for every spawn.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
