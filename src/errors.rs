//! Error types for the crucible forge core.
//!
//! This module defines a unified error enumeration used across git command
//! mediation, the SSH transport, LFS storage, and the Actions control plane.
//! It integrates with `thiserror` to provide rich `Display` implementations
//! and error source chaining where applicable.
//!
//! Notes:
//! - Each variant is one semantic failure kind; the embedding HTTP layer maps
//!   kinds to status codes.
//! - Kinds are preserved across propagation boundaries. A component that
//!   cannot handle a failure re-raises it unchanged.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the forge core.
///
/// - Used across git execution, repository location, SSH sessions, LFS
///   storage and batch handling, and run dispatch.
/// - Implements `std::error::Error` via `thiserror`.
pub enum ForgeError {
    /// The bundled git binary could not be resolved at startup.
    #[error("git binary not found: {0}")]
    GitNotFound(String),

    /// A command argument failed the safe-value filter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A command argument matched a flag that allows arbitrary command
    /// execution through git's hook or transport machinery.
    #[error("argument rejected as command injection vector: {0}")]
    CommandInjection(String),

    /// A deadline elapsed before the operation completed.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The spawned process exited non-zero.
    #[error("process exited with code {code}: {stderr}")]
    ProcessFailed { code: i32, stderr: String },

    /// The caller lacks the required access level.
    #[error("permission denied")]
    PermissionDenied,

    /// Repository name, owner, or path failed validation or confinement.
    #[error("invalid repository: {0}")]
    InvalidRepository(String),

    /// Authentication failed. Presented to remote clients identically to
    /// `RateLimitExceeded` so key enumeration is not possible.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Captured process output exceeded the configured bound.
    #[error("process output exceeded {0} bytes")]
    OutputTooLarge(usize),

    /// Too many failed attempts from one address inside the window.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Stored content did not hash to the expected OID or size.
    #[error("checksum mismatch for {oid}: {detail}")]
    InvalidChecksum { oid: String, detail: String },

    /// Object missing from content storage.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Admitting the upload would exceed the storage quota.
    #[error("storage limit exceeded: {used} + {requested} > {limit} bytes")]
    StorageLimitExceeded {
        used: u64,
        requested: u64,
        limit: u64,
    },

    /// A derived filesystem path escaped its configured root.
    #[error("path traversal attempt: {0}")]
    PathTraversalAttempt(String),

    /// A storage backend failed (S3 error response, unreachable endpoint).
    #[error("backend error: {0}")]
    BackendError(String),

    /// A state transition was requested that the state machine forbids.
    #[error("invalid state transition: {0}")]
    InvalidState(String),

    /// Free-form input failed validation (path segment, label color,
    /// timestamp, identifier bound).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O error from the underlying reader, writer, or filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForgeError {
    /// Short stable name of the failure kind, for logging with a correlation
    /// identifier. Internal kinds map to a generic client message upstream.
    pub fn kind(&self) -> &'static str {
        match self {
            ForgeError::GitNotFound(_) => "git_not_found",
            ForgeError::InvalidArgument(_) => "invalid_argument",
            ForgeError::CommandInjection(_) => "command_injection",
            ForgeError::Timeout(_) => "timeout",
            ForgeError::ProcessFailed { .. } => "process_failed",
            ForgeError::PermissionDenied => "permission_denied",
            ForgeError::InvalidRepository(_) => "invalid_repository",
            ForgeError::AuthenticationFailed => "authentication_failed",
            ForgeError::OutputTooLarge(_) => "output_too_large",
            ForgeError::RateLimitExceeded => "rate_limit_exceeded",
            ForgeError::InvalidChecksum { .. } => "invalid_checksum",
            ForgeError::ObjectNotFound(_) => "object_not_found",
            ForgeError::StorageLimitExceeded { .. } => "storage_limit_exceeded",
            ForgeError::PathTraversalAttempt(_) => "path_traversal_attempt",
            ForgeError::BackendError(_) => "backend_error",
            ForgeError::InvalidState(_) => "invalid_state",
            ForgeError::InvalidInput(_) => "invalid_input",
            ForgeError::Io(_) => "io",
        }
    }

    /// Whether remote clients must receive the indistinguishable
    /// authentication-failure message for this kind.
    pub fn is_auth_shaped(&self) -> bool {
        matches!(
            self,
            ForgeError::AuthenticationFailed | ForgeError::RateLimitExceeded
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ForgeError>;
