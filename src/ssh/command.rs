//! Parsing and vetting of the single exec command an SSH session may issue.
//! Only the three git server-side programs are dispatched, each against one
//! quoted `owner/name[.git]` path.

use crate::errors::{ForgeError, Result};
use crate::git::locator::RepoLocator;
use crate::store::records::Access;

/// The git server-side programs reachable over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    UploadArchive,
    ReceivePack,
}

impl GitService {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitService::UploadPack => "git-upload-pack",
            GitService::UploadArchive => "git-upload-archive",
            GitService::ReceivePack => "git-receive-pack",
        }
    }

    /// Subcommand passed to the mediated git binary.
    pub fn subcommand(&self) -> &'static str {
        match self {
            GitService::UploadPack => "upload-pack",
            GitService::UploadArchive => "upload-archive",
            GitService::ReceivePack => "receive-pack",
        }
    }

    /// Access level the authenticated user must hold.
    pub fn required_access(&self) -> Access {
        match self {
            GitService::UploadPack | GitService::UploadArchive => Access::Read,
            GitService::ReceivePack => Access::Write,
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self, GitService::ReceivePack)
    }
}

/// A fully parsed exec request.
#[derive(Debug, Clone, PartialEq)]
pub struct SshCommand {
    pub service: GitService,
    pub owner: String,
    pub repo: String,
}

impl SshCommand {
    /// Parse an exec command line like `git-upload-pack 'owner/name.git'`.
    ///
    /// Exactly one path argument is accepted; shells, flags, and extra
    /// arguments are protocol errors that disconnect the session.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (name, rest) = line
            .split_once(' ')
            .ok_or_else(|| ForgeError::InvalidInput(format!("missing path in command: {line}")))?;

        let service = match name {
            "git-upload-pack" => GitService::UploadPack,
            "git-upload-archive" => GitService::UploadArchive,
            "git-receive-pack" => GitService::ReceivePack,
            other => {
                return Err(ForgeError::InvalidInput(format!(
                    "command not allowed: {other}"
                )));
            }
        };

        let rest = rest.trim();
        if rest.split_whitespace().count() != 1 {
            return Err(ForgeError::InvalidInput(format!(
                "expected a single path argument: {line}"
            )));
        }
        let quoted = rest;
        let path = unquote(quoted)?;
        let (owner, repo) = RepoLocator::parse_repo_path(&path)?;

        Ok(Self {
            service,
            owner,
            repo,
        })
    }
}

/// Strip one matched level of single or double quotes.
fn unquote(token: &str) -> Result<String> {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            let inner = &token[1..token.len() - 1];
            if inner.contains('\'') || inner.contains('"') {
                return Err(ForgeError::InvalidInput(format!(
                    "nested quoting in path: {token}"
                )));
            }
            return Ok(inner.to_string());
        }
        if first == b'\'' || first == b'"' || last == b'\'' || last == b'"' {
            return Err(ForgeError::InvalidInput(format!(
                "unbalanced quoting in path: {token}"
            )));
        }
    }
    Ok(token.to_string())
}
