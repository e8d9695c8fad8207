//! Run and job state machine. Transitions are monotonic: queued →
//! in_progress → completed; only completion carries a conclusion.

use std::sync::Arc;

use chrono::Utc;

use crate::errors::{ForgeError, Result};
use crate::store::dao::ActionsDao;
use crate::store::records::{RunConclusion, RunRecord, RunStatus};

/// Validate a requested transition. Backwards and no-op transitions are
/// rejected; reaching `Completed` requires a conclusion.
pub fn check_transition(
    from: RunStatus,
    to: RunStatus,
    conclusion: Option<RunConclusion>,
) -> Result<()> {
    if to.rank() <= from.rank() {
        return Err(ForgeError::InvalidState(format!(
            "cannot move {from:?} -> {to:?}"
        )));
    }
    if to == RunStatus::Completed && conclusion.is_none() {
        return Err(ForgeError::InvalidState(
            "completion requires a conclusion".into(),
        ));
    }
    if to != RunStatus::Completed && conclusion.is_some() {
        return Err(ForgeError::InvalidState(
            "conclusion is only set on completion".into(),
        ));
    }
    Ok(())
}

/// Run-level operations over the DAO, with the state machine enforced
/// before any write.
pub struct RunControl {
    dao: Arc<dyn ActionsDao>,
}

impl RunControl {
    pub fn new(dao: Arc<dyn ActionsDao>) -> Self {
        Self { dao }
    }

    async fn load(&self, run_id: i64) -> Result<RunRecord> {
        self.dao
            .run(run_id)
            .await?
            .ok_or_else(|| ForgeError::ObjectNotFound(format!("run {run_id}")))
    }

    /// queued → in_progress. Loses gracefully if another writer advanced
    /// the run first.
    pub async fn start(&self, run_id: i64) -> Result<bool> {
        let run = self.load(run_id).await?;
        check_transition(run.status, RunStatus::InProgress, None)?;
        self.dao
            .transition_run(
                run_id,
                run.status,
                RunStatus::InProgress,
                None,
                Utc::now(),
            )
            .await
    }

    /// Any live state → completed with the given conclusion.
    pub async fn complete(&self, run_id: i64, conclusion: RunConclusion) -> Result<bool> {
        let run = self.load(run_id).await?;
        check_transition(run.status, RunStatus::Completed, Some(conclusion))?;
        self.dao
            .transition_run(
                run_id,
                run.status,
                RunStatus::Completed,
                Some(conclusion),
                Utc::now(),
            )
            .await
    }

    /// Force-cancel runs whose wall clock exceeded their timeout. Returns
    /// how many runs were cancelled.
    pub async fn enforce_timeouts(&self) -> Result<usize> {
        let now = Utc::now();
        let mut cancelled = 0;
        for run in self.dao.runs_in_progress().await? {
            let Some(started_at) = run.started_at else {
                continue;
            };
            let limit = chrono::Duration::minutes(run.timeout_minutes as i64);
            if now - started_at <= limit {
                continue;
            }
            if self
                .dao
                .transition_run(
                    run.id,
                    RunStatus::InProgress,
                    RunStatus::Completed,
                    Some(RunConclusion::Cancelled),
                    now,
                )
                .await?
            {
                // Cancel the run's live jobs along with it.
                for job in self.dao.jobs_for_run(run.id).await? {
                    if job.status != RunStatus::Completed {
                        let _ = self
                            .dao
                            .transition_job(
                                job.id,
                                job.status,
                                RunStatus::Completed,
                                Some(RunConclusion::Cancelled),
                            )
                            .await?;
                    }
                }
                tracing::info!(run_id = run.id, "run cancelled after timeout");
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::records::{JobRecord, TriggerEvent};

    fn queued_run(repo_id: i64, timeout_minutes: u64) -> RunRecord {
        RunRecord {
            id: 0,
            workflow_id: 1,
            repo_id,
            run_number: 0,
            trigger_event: TriggerEvent::Push,
            commit_sha: "c".repeat(40),
            branch: "main".to_string(),
            actor_id: 1,
            status: RunStatus::Queued,
            conclusion: None,
            timeout_minutes,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Forward transitions pass; backwards and sideways ones do not.
    #[test]
    fn transition_matrix() {
        use RunStatus::*;
        assert!(check_transition(Queued, InProgress, None).is_ok());
        assert!(
            check_transition(InProgress, Completed, Some(RunConclusion::Success)).is_ok()
        );
        assert!(
            check_transition(Queued, Completed, Some(RunConclusion::Cancelled)).is_ok()
        );

        assert!(check_transition(InProgress, Queued, None).is_err());
        assert!(check_transition(Completed, InProgress, None).is_err());
        assert!(check_transition(Queued, Queued, None).is_err());
        // Completion without a conclusion is rejected, and vice versa.
        assert!(check_transition(InProgress, Completed, None).is_err());
        assert!(
            check_transition(Queued, InProgress, Some(RunConclusion::Success)).is_err()
        );
    }

    /// start/complete drive the record through the full lifecycle.
    #[tokio::test]
    async fn lifecycle_round_trip() {
        let dao = Arc::new(MemoryStore::new());
        let run = dao.create_run(queued_run(1, 60)).await.unwrap();
        let control = RunControl::new(dao.clone());

        assert!(control.start(run.id).await.unwrap());
        let loaded = dao.run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::InProgress);
        assert!(loaded.started_at.is_some());
        assert!(loaded.conclusion.is_none());

        assert!(control.complete(run.id, RunConclusion::Success).await.unwrap());
        let loaded = dao.run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.conclusion, Some(RunConclusion::Success));
        assert!(loaded.completed_at.is_some());

        // A second completion is an invalid transition.
        assert!(control.complete(run.id, RunConclusion::Failure).await.is_err());
    }

    /// Timed-out runs are cancelled together with their live jobs.
    #[tokio::test]
    async fn timeout_enforcement() {
        let dao = Arc::new(MemoryStore::new());
        let run = dao.create_run(queued_run(1, 1)).await.unwrap();
        let job = dao
            .create_job(JobRecord {
                id: 0,
                run_id: run.id,
                repo_id: 1,
                name: "build".to_string(),
                labels: vec!["linux".to_string()],
                status: RunStatus::InProgress,
                conclusion: None,
                runner_id: None,
                queued_at: Utc::now(),
            })
            .await
            .unwrap();

        // Started long enough ago to be past its one-minute budget.
        let started = Utc::now() - chrono::Duration::minutes(5);
        assert!(
            dao.transition_run(run.id, RunStatus::Queued, RunStatus::InProgress, None, started)
                .await
                .unwrap()
        );

        let control = RunControl::new(dao.clone());
        assert_eq!(control.enforce_timeouts().await.unwrap(), 1);

        let loaded = dao.run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.conclusion, Some(RunConclusion::Cancelled));
        let job = dao.job(job.id).await.unwrap().unwrap();
        assert_eq!(job.conclusion, Some(RunConclusion::Cancelled));
    }
}
