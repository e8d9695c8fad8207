//! The persistence contract consumed by the core. Storage-level semantics
//! only; protocol formatting, permission policy, and dispatch logic live in
//! the components that call these traits.
//!
//! Implementations map each operation onto their relational store. The
//! in-memory implementation in [`crate::store::memory`] is the reference for
//! the atomicity each operation promises.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::store::records::*;

/// Repository rows and access checks.
#[async_trait]
pub trait RepositoryDao: Send + Sync {
    /// Look up a repository by `owner/name`.
    async fn repository_by_path(&self, owner: &str, name: &str) -> Result<Option<Repository>>;

    /// Insert a repository; the `(owner_id, name)` pair is unique. Returns
    /// the row with its assigned id.
    async fn create_repository(&self, repo: Repository) -> Result<Repository>;

    /// Access level `user_id` holds on `repo`.
    async fn access_for(&self, user_id: UserId, repo: &Repository) -> Result<Access>;

    /// All repositories, used to scope LFS garbage collection.
    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    /// Update the accounted on-disk size.
    async fn update_size(&self, repo_id: RepoId, size_bytes: i64) -> Result<()>;

    /// Delete the repository row and every dependent row (issues, runs, LFS
    /// references). Called last during force-delete.
    async fn delete_repository_rows(&self, repo_id: RepoId) -> Result<()>;
}

/// SSH public keys.
#[async_trait]
pub trait SshKeyDao: Send + Sync {
    /// Resolve an active key by fingerprint.
    async fn key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<SshKeyRecord>>;

    /// Insert a key; fingerprints are unique across all active keys.
    async fn add_key(&self, key: SshKeyRecord) -> Result<SshKeyRecord>;

    /// Remove a key by id.
    async fn remove_key(&self, id: i64) -> Result<()>;
}

/// LFS object rows, quota sums, and the bandwidth ledger.
#[async_trait]
pub trait LfsDao: Send + Sync {
    async fn lfs_object(&self, repo_id: RepoId, oid: &str) -> Result<Option<LfsObjectRecord>>;

    /// Insert or replace the `(repo_id, oid)` row.
    async fn upsert_lfs_object(&self, record: LfsObjectRecord) -> Result<()>;

    /// Flip the row to present after a successful verify.
    async fn mark_present(&self, repo_id: RepoId, oid: &str, verified: bool) -> Result<()>;

    async fn delete_lfs_object(&self, repo_id: RepoId, oid: &str) -> Result<()>;

    async fn lfs_objects_for_repo(&self, repo_id: RepoId) -> Result<Vec<LfsObjectRecord>>;

    /// Repositories whose rows reference `oid`, across the whole store.
    async fn repos_referencing_oid(&self, oid: &str) -> Result<Vec<RepoId>>;

    /// Cumulative present bytes for a repository. Updated in the same
    /// transaction as the object row so the counter cannot drift.
    async fn repo_usage_bytes(&self, repo_id: RepoId) -> Result<u64>;

    /// Cumulative present bytes across all repositories of an owner.
    async fn owner_usage_bytes(&self, owner_id: UserId) -> Result<u64>;

    async fn record_bandwidth(&self, record: BandwidthRecord) -> Result<()>;

    /// Total bytes transferred for a repository inside `[from, to)`,
    /// optionally filtered by direction.
    async fn bandwidth_between(
        &self,
        repo_id: RepoId,
        operation: Option<TransferOp>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Workflows, runs, jobs, runners, and secrets.
#[async_trait]
pub trait ActionsDao: Send + Sync {
    /// Insert or replace the workflow at `(repo_id, file_path)`.
    async fn upsert_workflow(&self, workflow: WorkflowRecord) -> Result<WorkflowRecord>;

    async fn workflows_for_repo(&self, repo_id: RepoId) -> Result<Vec<WorkflowRecord>>;

    /// Insert a run, assigning `run_number = max(run_number) + 1` for the
    /// repository atomically with the insert.
    async fn create_run(&self, run: RunRecord) -> Result<RunRecord>;

    async fn run(&self, run_id: i64) -> Result<Option<RunRecord>>;

    /// Compare-and-set status transition. Returns false when the stored
    /// status no longer equals `from` (another writer advanced it).
    async fn transition_run(
        &self,
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
        conclusion: Option<RunConclusion>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Runs currently in progress, for timeout enforcement.
    async fn runs_in_progress(&self) -> Result<Vec<RunRecord>>;

    async fn create_job(&self, job: JobRecord) -> Result<JobRecord>;

    async fn job(&self, job_id: i64) -> Result<Option<JobRecord>>;

    async fn jobs_for_run(&self, run_id: i64) -> Result<Vec<JobRecord>>;

    /// All queued jobs, oldest first.
    async fn queued_jobs(&self) -> Result<Vec<JobRecord>>;

    /// Optimistic claim: set `runner_id` and move to in_progress only while
    /// the job is still queued. Returns false when the claim lost the race.
    async fn claim_job(&self, job_id: i64, runner: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Compare-and-set status transition for a job.
    async fn transition_job(
        &self,
        job_id: i64,
        from: RunStatus,
        to: RunStatus,
        conclusion: Option<RunConclusion>,
    ) -> Result<bool>;

    /// Reclaim every in-progress job held by `runner` back to queued.
    /// Returns the number of jobs released.
    async fn release_jobs_for_runner(&self, runner: Uuid) -> Result<u64>;

    async fn register_runner(&self, runner: RunnerRecord) -> Result<()>;

    async fn runner(&self, uuid: Uuid) -> Result<Option<RunnerRecord>>;

    async fn runners(&self) -> Result<Vec<RunnerRecord>>;

    async fn update_runner_status(&self, uuid: Uuid, status: RunnerStatus) -> Result<()>;

    /// Heartbeat: advance `last_seen` only if it still equals `expected`
    /// (optimistic CAS). Returns false when another poll raced ahead.
    async fn touch_runner(
        &self,
        uuid: Uuid,
        expected: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn remove_runner(&self, uuid: Uuid) -> Result<()>;

    /// Insert or replace the secret at `(owner_id, repository_id, name)`.
    async fn upsert_secret(&self, secret: SecretRecord) -> Result<()>;

    /// Exact-scope lookup; scope preference is applied by the caller.
    async fn secret(
        &self,
        owner_id: UserId,
        repository_id: RepoId,
        name: &str,
    ) -> Result<Option<SecretRecord>>;
}
