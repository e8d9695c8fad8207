//! In-memory implementation of the persistence contract, backed by
//! concurrent maps. Used by tests and by embeddings that have not wired a
//! relational store yet; it is also the reference for the atomicity each
//! DAO operation promises.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::errors::{ForgeError, Result};
use crate::store::dao::{ActionsDao, LfsDao, RepositoryDao, SshKeyDao};
use crate::store::records::*;

/// DashMap-backed store. Uniqueness constraints are enforced through index
/// maps; counters are computed from the rows so they cannot drift.
#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicI64,

    repositories: DashMap<RepoId, Repository>,
    repo_index: DashMap<(String, String), RepoId>,
    grants: DashMap<(UserId, RepoId), Access>,

    keys: DashMap<i64, SshKeyRecord>,
    fingerprint_index: DashMap<String, i64>,

    lfs_objects: DashMap<(RepoId, String), LfsObjectRecord>,
    bandwidth: Mutex<Vec<BandwidthRecord>>,

    workflows: DashMap<(RepoId, String), WorkflowRecord>,
    runs: DashMap<i64, RunRecord>,
    run_numbers: DashMap<RepoId, i64>,
    jobs: DashMap<i64, JobRecord>,
    runners: DashMap<Uuid, RunnerRecord>,
    secrets: DashMap<(UserId, RepoId, String), SecretRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Grant an explicit access level; owners hold write implicitly.
    pub fn grant(&self, user_id: UserId, repo_id: RepoId, access: Access) {
        self.grants.insert((user_id, repo_id), access);
    }
}

#[async_trait]
impl RepositoryDao for MemoryStore {
    async fn repository_by_path(&self, owner: &str, name: &str) -> Result<Option<Repository>> {
        let id = self
            .repo_index
            .get(&(owner.to_string(), name.to_string()))
            .map(|r| *r.value());
        Ok(id.and_then(|id| self.repositories.get(&id).map(|r| r.value().clone())))
    }

    async fn create_repository(&self, mut repo: Repository) -> Result<Repository> {
        let key = (repo.owner_name.clone(), repo.name.clone());
        match self.repo_index.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ForgeError::InvalidInput(format!(
                "repository exists: {}/{}",
                repo.owner_name, repo.name
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                repo.id = self.allocate_id();
                slot.insert(repo.id);
                self.repositories.insert(repo.id, repo.clone());
                Ok(repo)
            }
        }
    }

    async fn access_for(&self, user_id: UserId, repo: &Repository) -> Result<Access> {
        if repo.owner_id == user_id {
            return Ok(Access::Write);
        }
        if let Some(granted) = self.grants.get(&(user_id, repo.id)) {
            return Ok(*granted.value());
        }
        if !repo.is_private {
            return Ok(Access::Read);
        }
        Ok(Access::None)
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let mut repos: Vec<_> = self
            .repositories
            .iter()
            .map(|r| r.value().clone())
            .collect();
        repos.sort_by_key(|r| r.id);
        Ok(repos)
    }

    async fn update_size(&self, repo_id: RepoId, size_bytes: i64) -> Result<()> {
        if let Some(mut repo) = self.repositories.get_mut(&repo_id) {
            repo.size_bytes = size_bytes;
        }
        Ok(())
    }

    async fn delete_repository_rows(&self, repo_id: RepoId) -> Result<()> {
        if let Some((_, repo)) = self.repositories.remove(&repo_id) {
            self.repo_index.remove(&(repo.owner_name, repo.name));
        }
        self.lfs_objects.retain(|(rid, _), _| *rid != repo_id);
        self.workflows.retain(|(rid, _), _| *rid != repo_id);
        let run_ids: Vec<i64> = self
            .runs
            .iter()
            .filter(|r| r.value().repo_id == repo_id)
            .map(|r| *r.key())
            .collect();
        for run_id in run_ids {
            self.runs.remove(&run_id);
        }
        self.jobs.retain(|_, job| job.repo_id != repo_id);
        self.run_numbers.remove(&repo_id);
        Ok(())
    }
}

#[async_trait]
impl SshKeyDao for MemoryStore {
    async fn key_by_fingerprint(&self, fingerprint: &str) -> Result<Option<SshKeyRecord>> {
        let id = self
            .fingerprint_index
            .get(fingerprint)
            .map(|entry| *entry.value());
        Ok(id.and_then(|id| self.keys.get(&id).map(|k| k.value().clone())))
    }

    async fn add_key(&self, mut key: SshKeyRecord) -> Result<SshKeyRecord> {
        match self.fingerprint_index.entry(key.fingerprint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ForgeError::InvalidInput(format!(
                "fingerprint already registered: {}",
                key.fingerprint
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                key.id = self.allocate_id();
                slot.insert(key.id);
                self.keys.insert(key.id, key.clone());
                Ok(key)
            }
        }
    }

    async fn remove_key(&self, id: i64) -> Result<()> {
        if let Some((_, key)) = self.keys.remove(&id) {
            self.fingerprint_index.remove(&key.fingerprint);
        }
        Ok(())
    }
}

#[async_trait]
impl LfsDao for MemoryStore {
    async fn lfs_object(&self, repo_id: RepoId, oid: &str) -> Result<Option<LfsObjectRecord>> {
        Ok(self
            .lfs_objects
            .get(&(repo_id, oid.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn upsert_lfs_object(&self, record: LfsObjectRecord) -> Result<()> {
        self.lfs_objects
            .insert((record.repo_id, record.oid.clone()), record);
        Ok(())
    }

    async fn mark_present(&self, repo_id: RepoId, oid: &str, verified: bool) -> Result<()> {
        match self.lfs_objects.get_mut(&(repo_id, oid.to_string())) {
            Some(mut record) => {
                record.present = true;
                record.checksum_verified = verified;
                Ok(())
            }
            None => Err(ForgeError::ObjectNotFound(oid.to_string())),
        }
    }

    async fn delete_lfs_object(&self, repo_id: RepoId, oid: &str) -> Result<()> {
        self.lfs_objects.remove(&(repo_id, oid.to_string()));
        Ok(())
    }

    async fn lfs_objects_for_repo(&self, repo_id: RepoId) -> Result<Vec<LfsObjectRecord>> {
        let mut rows: Vec<_> = self
            .lfs_objects
            .iter()
            .filter(|r| r.key().0 == repo_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.oid.cmp(&b.oid));
        Ok(rows)
    }

    async fn repos_referencing_oid(&self, oid: &str) -> Result<Vec<RepoId>> {
        let mut repos: Vec<_> = self
            .lfs_objects
            .iter()
            .filter(|r| r.key().1 == oid)
            .map(|r| r.key().0)
            .collect();
        repos.sort_unstable();
        Ok(repos)
    }

    async fn repo_usage_bytes(&self, repo_id: RepoId) -> Result<u64> {
        Ok(self
            .lfs_objects
            .iter()
            .filter(|r| r.key().0 == repo_id && r.value().present)
            .map(|r| r.value().size.max(0) as u64)
            .sum())
    }

    async fn owner_usage_bytes(&self, owner_id: UserId) -> Result<u64> {
        let repo_ids: Vec<RepoId> = self
            .repositories
            .iter()
            .filter(|r| r.value().owner_id == owner_id)
            .map(|r| *r.key())
            .collect();
        let mut total = 0u64;
        for repo_id in repo_ids {
            total += self.repo_usage_bytes(repo_id).await?;
        }
        Ok(total)
    }

    async fn record_bandwidth(&self, record: BandwidthRecord) -> Result<()> {
        self.bandwidth
            .lock()
            .map_err(|_| ForgeError::BackendError("bandwidth ledger poisoned".into()))?
            .push(record);
        Ok(())
    }

    async fn bandwidth_between(
        &self,
        repo_id: RepoId,
        operation: Option<TransferOp>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let ledger = self
            .bandwidth
            .lock()
            .map_err(|_| ForgeError::BackendError("bandwidth ledger poisoned".into()))?;
        Ok(ledger
            .iter()
            .filter(|r| r.repo_id == repo_id)
            .filter(|r| operation.is_none_or(|op| r.operation == op))
            .filter(|r| r.ts >= from && r.ts < to)
            .map(|r| r.bytes)
            .sum())
    }
}

#[async_trait]
impl ActionsDao for MemoryStore {
    async fn upsert_workflow(&self, mut workflow: WorkflowRecord) -> Result<WorkflowRecord> {
        let key = (workflow.repo_id, workflow.file_path.clone());
        match self.workflows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                workflow.id = slot.get().id;
                slot.insert(workflow.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                workflow.id = self.allocate_id();
                slot.insert(workflow.clone());
            }
        }
        Ok(workflow)
    }

    async fn workflows_for_repo(&self, repo_id: RepoId) -> Result<Vec<WorkflowRecord>> {
        let mut rows: Vec<_> = self
            .workflows
            .iter()
            .filter(|r| r.key().0 == repo_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(rows)
    }

    async fn create_run(&self, mut run: RunRecord) -> Result<RunRecord> {
        // Holding the per-repo counter entry makes number allocation and the
        // insert atomic with respect to concurrent pushes.
        let mut counter = self.run_numbers.entry(run.repo_id).or_insert(0);
        *counter += 1;
        run.run_number = *counter;
        run.id = self.allocate_id();
        self.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        Ok(self.runs.get(&run_id).map(|r| r.value().clone()))
    }

    async fn transition_run(
        &self,
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
        conclusion: Option<RunConclusion>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        match self.runs.get_mut(&run_id) {
            Some(mut run) => {
                if run.status != from {
                    return Ok(false);
                }
                run.status = to;
                match to {
                    RunStatus::InProgress => run.started_at = Some(at),
                    RunStatus::Completed => {
                        run.conclusion = conclusion;
                        run.completed_at = Some(at);
                    }
                    RunStatus::Queued => {}
                }
                Ok(true)
            }
            None => Err(ForgeError::ObjectNotFound(format!("run {run_id}"))),
        }
    }

    async fn runs_in_progress(&self) -> Result<Vec<RunRecord>> {
        Ok(self
            .runs
            .iter()
            .filter(|r| r.value().status == RunStatus::InProgress)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn create_job(&self, mut job: JobRecord) -> Result<JobRecord> {
        job.id = self.allocate_id();
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn job(&self, job_id: i64) -> Result<Option<JobRecord>> {
        Ok(self.jobs.get(&job_id).map(|r| r.value().clone()))
    }

    async fn jobs_for_run(&self, run_id: i64) -> Result<Vec<JobRecord>> {
        let mut rows: Vec<_> = self
            .jobs
            .iter()
            .filter(|r| r.value().run_id == run_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|j| j.id);
        Ok(rows)
    }

    async fn queued_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut rows: Vec<_> = self
            .jobs
            .iter()
            .filter(|r| r.value().status == RunStatus::Queued)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn claim_job(&self, job_id: i64, runner: Uuid, _at: DateTime<Utc>) -> Result<bool> {
        match self.jobs.get_mut(&job_id) {
            Some(mut job) => {
                if job.status != RunStatus::Queued {
                    return Ok(false);
                }
                job.status = RunStatus::InProgress;
                job.runner_id = Some(runner);
                Ok(true)
            }
            None => Err(ForgeError::ObjectNotFound(format!("job {job_id}"))),
        }
    }

    async fn transition_job(
        &self,
        job_id: i64,
        from: RunStatus,
        to: RunStatus,
        conclusion: Option<RunConclusion>,
    ) -> Result<bool> {
        match self.jobs.get_mut(&job_id) {
            Some(mut job) => {
                if job.status != from {
                    return Ok(false);
                }
                job.status = to;
                if to == RunStatus::Completed {
                    job.conclusion = conclusion;
                }
                Ok(true)
            }
            None => Err(ForgeError::ObjectNotFound(format!("job {job_id}"))),
        }
    }

    async fn release_jobs_for_runner(&self, runner: Uuid) -> Result<u64> {
        let mut released = 0u64;
        for mut job in self.jobs.iter_mut() {
            if job.runner_id == Some(runner) && job.status == RunStatus::InProgress {
                job.status = RunStatus::Queued;
                job.runner_id = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn register_runner(&self, runner: RunnerRecord) -> Result<()> {
        self.runners.insert(runner.uuid, runner);
        Ok(())
    }

    async fn runner(&self, uuid: Uuid) -> Result<Option<RunnerRecord>> {
        Ok(self.runners.get(&uuid).map(|r| r.value().clone()))
    }

    async fn runners(&self) -> Result<Vec<RunnerRecord>> {
        Ok(self.runners.iter().map(|r| r.value().clone()).collect())
    }

    async fn update_runner_status(&self, uuid: Uuid, status: RunnerStatus) -> Result<()> {
        match self.runners.get_mut(&uuid) {
            Some(mut runner) => {
                runner.status = status;
                Ok(())
            }
            None => Err(ForgeError::ObjectNotFound(format!("runner {uuid}"))),
        }
    }

    async fn touch_runner(
        &self,
        uuid: Uuid,
        expected: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.runners.get_mut(&uuid) {
            Some(mut runner) => {
                if runner.last_seen != expected {
                    return Ok(false);
                }
                runner.last_seen = now;
                Ok(true)
            }
            None => Err(ForgeError::ObjectNotFound(format!("runner {uuid}"))),
        }
    }

    async fn remove_runner(&self, uuid: Uuid) -> Result<()> {
        self.runners.remove(&uuid);
        Ok(())
    }

    async fn upsert_secret(&self, secret: SecretRecord) -> Result<()> {
        let key = (secret.owner_id, secret.repository_id, secret.name.clone());
        match self.secrets.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let created_at = slot.get().created_at;
                let mut updated = secret;
                updated.created_at = created_at;
                slot.insert(updated);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(secret);
            }
        }
        Ok(())
    }

    async fn secret(
        &self,
        owner_id: UserId,
        repository_id: RepoId,
        name: &str,
    ) -> Result<Option<SecretRecord>> {
        Ok(self
            .secrets
            .get(&(owner_id, repository_id, name.to_string()))
            .map(|r| r.value().clone()))
    }
}
