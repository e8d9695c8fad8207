//! Record types of the persistence contract. The relational store behind
//! them is opaque to the core; these are the shapes its operations exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = i64;
pub type RepoId = i64;

/// Access level a user holds on a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    None,
    Read,
    Write,
}

/// A stored repository. The on-disk bare tree lives at the path derived by
/// `RepoLocator`; this row carries everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepoId,
    pub owner_id: UserId,
    pub owner_name: String,
    pub name: String,
    pub default_branch: String,
    pub is_private: bool,
    pub is_archived: bool,
    pub size_bytes: i64,
}

/// A user's SSH public key. The comment is stored with control characters
/// stripped; fingerprints are unique across all active keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyRecord {
    pub id: i64,
    pub user_id: UserId,
    /// base64 SHA-256 of the wire-format blob, `SHA256:` prefix included.
    pub fingerprint: String,
    pub algorithm: String,
    pub blob: Vec<u8>,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// Which content backend physically holds an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    Filesystem,
    S3,
}

/// Per-repository LFS object row, keyed by `(repo_id, oid)`.
/// `present` implies the stored content hashes to `oid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LfsObjectRecord {
    pub repo_id: RepoId,
    pub oid: String,
    pub size: i64,
    pub backend: StorageBackendKind,
    pub present: bool,
    pub checksum_verified: bool,
    pub created_at: DateTime<Utc>,
}

/// Direction of an LFS transfer, for the bandwidth ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOp {
    Upload,
    Download,
}

/// One bandwidth ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthRecord {
    pub repo_id: RepoId,
    pub operation: TransferOp,
    pub bytes: u64,
    pub ts: DateTime<Utc>,
}

/// Event that can start a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Push,
    PullRequest,
    Schedule,
    WorkflowDispatch,
    RepositoryDispatch,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::Push => "push",
            TriggerEvent::PullRequest => "pull_request",
            TriggerEvent::Schedule => "schedule",
            TriggerEvent::WorkflowDispatch => "workflow_dispatch",
            TriggerEvent::RepositoryDispatch => "repository_dispatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "push" => Some(TriggerEvent::Push),
            "pull_request" => Some(TriggerEvent::PullRequest),
            "schedule" => Some(TriggerEvent::Schedule),
            "workflow_dispatch" => Some(TriggerEvent::WorkflowDispatch),
            "repository_dispatch" => Some(TriggerEvent::RepositoryDispatch),
            _ => None,
        }
    }
}

/// Lifecycle state of a run or job. Transitions are monotonic:
/// queued → in_progress → completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
}

impl RunStatus {
    /// Ordering rank used to enforce monotonic transitions.
    pub fn rank(&self) -> u8 {
        match self {
            RunStatus::Queued => 0,
            RunStatus::InProgress => 1,
            RunStatus::Completed => 2,
        }
    }
}

/// Terminal outcome, present only once status is `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
}

/// A stored workflow, unique per `(repo_id, file_path)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: i64,
    pub repo_id: RepoId,
    pub file_path: String,
    pub source: String,
    pub is_active: bool,
}

/// One workflow run. `run_number` increases monotonically per repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub workflow_id: i64,
    pub repo_id: RepoId,
    pub run_number: i64,
    pub trigger_event: TriggerEvent,
    pub commit_sha: String,
    pub branch: String,
    pub actor_id: UserId,
    pub status: RunStatus,
    pub conclusion: Option<RunConclusion>,
    pub timeout_minutes: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One job within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub run_id: i64,
    pub repo_id: RepoId,
    pub name: String,
    pub labels: Vec<String>,
    pub status: RunStatus,
    pub conclusion: Option<RunConclusion>,
    pub runner_id: Option<Uuid>,
    pub queued_at: DateTime<Utc>,
}

/// Availability of a registered runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Online,
    Offline,
    Busy,
}

/// A registered runner. `repository_id == 0` marks an org-scoped runner.
/// Only the SHA-256 hash of its auth token is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub uuid: Uuid,
    pub name: String,
    pub owner_id: UserId,
    pub repository_id: RepoId,
    pub token_hash: String,
    pub labels: Vec<String>,
    pub status: RunnerStatus,
    pub last_seen: DateTime<Utc>,
}

impl RunnerRecord {
    pub fn is_org_scoped(&self) -> bool {
        self.repository_id == 0
    }
}

/// An encrypted secret, unique per `(owner_id, repository_id, name)`.
/// Plaintext is never stored, logged, or returned after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub owner_id: UserId,
    pub repository_id: RepoId,
    pub name: String,
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
