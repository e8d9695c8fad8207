//! Job dispatch: matches queued jobs to online runners by label-set
//! inclusion, with repo-scoped runners preferred over org-scoped ones and
//! FIFO order within a priority. Claims are optimistic; a losing dispatcher
//! simply moves on.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::actions::run::RunControl;
use crate::actions::runner::RunnerManager;
use crate::errors::Result;
use crate::store::dao::ActionsDao;
use crate::store::records::{JobRecord, RunStatus, RunnerRecord, RunnerStatus};

/// Whether every label the job demands is offered by the runner.
pub fn labels_match(job: &JobRecord, runner: &RunnerRecord) -> bool {
    let offered: HashSet<&str> = runner.labels.iter().map(String::as_str).collect();
    job.labels.iter().all(|label| offered.contains(label.as_str()))
}

/// One dispatcher instance. Several may run concurrently (multiple forge
/// processes); the claim CAS keeps them from double-assigning.
pub struct Dispatcher {
    dao: Arc<dyn ActionsDao>,
    runs: RunControl,
    runners: Arc<RunnerManager>,
}

impl Dispatcher {
    pub fn new(dao: Arc<dyn ActionsDao>, runners: Arc<RunnerManager>) -> Self {
        let runs = RunControl::new(dao.clone());
        Self { dao, runs, runners }
    }

    /// One dispatch round: reap stale runners, enforce run timeouts, then
    /// assign queued jobs. Returns the number of jobs assigned.
    pub async fn tick(&self) -> Result<usize> {
        self.runners.reap_stale().await?;
        self.runs.enforce_timeouts().await?;
        self.assign_queued().await
    }

    async fn assign_queued(&self) -> Result<usize> {
        let online: Vec<RunnerRecord> = self
            .dao
            .runners()
            .await?
            .into_iter()
            .filter(|r| r.status == RunnerStatus::Online)
            .collect();
        if online.is_empty() {
            return Ok(0);
        }

        let mut assigned = 0;
        for job in self.dao.queued_jobs().await? {
            // Repo-scoped candidates first, org-scoped second.
            let mut candidates: Vec<&RunnerRecord> = online
                .iter()
                .filter(|r| r.repository_id == job.repo_id && labels_match(&job, r))
                .collect();
            candidates.extend(
                online
                    .iter()
                    .filter(|r| r.is_org_scoped() && labels_match(&job, r)),
            );

            for runner in candidates {
                if self.dao.claim_job(job.id, runner.uuid, Utc::now()).await? {
                    // First claimed job moves the run out of queued; losing
                    // that race just means another job got there first.
                    let _ = self.runs.start(job.run_id).await;
                    self.dao
                        .update_runner_status(runner.uuid, RunnerStatus::Busy)
                        .await?;
                    tracing::info!(
                        job_id = job.id,
                        run_id = job.run_id,
                        runner = %runner.uuid,
                        "job dispatched"
                    );
                    assigned += 1;
                    break;
                }
                // Lost the CAS: the job is no longer queued, stop trying
                // runners for it.
                break;
            }
        }
        Ok(assigned)
    }

    /// Long-running dispatch loop for the embedding process. Ends when
    /// `shutdown` resolves.
    pub async fn run_loop(
        &self,
        interval: std::time::Duration,
        shutdown: &crate::ssh::shutdown::LifecycleManager,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, kind = e.kind(), "dispatch tick failed");
                    }
                }
                _ = shutdown.wait_for_shutdown() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::records::{RunConclusion, RunRecord, TriggerEvent};
    use std::time::Duration;
    use uuid::Uuid;

    async fn seeded_dao() -> (Arc<MemoryStore>, Arc<RunnerManager>, i64) {
        let dao = Arc::new(MemoryStore::new());
        let run = dao
            .create_run(RunRecord {
                id: 0,
                workflow_id: 1,
                repo_id: 5,
                run_number: 0,
                trigger_event: TriggerEvent::Push,
                commit_sha: "d".repeat(40),
                branch: "main".to_string(),
                actor_id: 1,
                status: RunStatus::Queued,
                conclusion: None,
                timeout_minutes: 60,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            })
            .await
            .unwrap();
        let runners = Arc::new(RunnerManager::new(
            dao.clone(),
            "reg-token",
            Duration::from_secs(90),
        ));
        (dao, runners, run.id)
    }

    fn job(run_id: i64, repo_id: i64, labels: &[&str]) -> JobRecord {
        JobRecord {
            id: 0,
            run_id,
            repo_id,
            name: "build".to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            status: RunStatus::Queued,
            conclusion: None,
            runner_id: None,
            queued_at: Utc::now(),
        }
    }

    /// Label matching is subset inclusion over the runner's offer.
    #[test]
    fn label_subset_matching() {
        let j = job(1, 1, &["linux"]);
        let mut r = RunnerRecord {
            uuid: Uuid::new_v4(),
            name: "r".to_string(),
            owner_id: 1,
            repository_id: 0,
            token_hash: String::new(),
            labels: vec!["linux".to_string(), "x64".to_string()],
            status: RunnerStatus::Online,
            last_seen: Utc::now(),
        };
        assert!(labels_match(&j, &r));

        r.labels = vec!["macos".to_string()];
        assert!(!labels_match(&j, &r));

        let j = job(1, 1, &[]);
        assert!(labels_match(&j, &r));
    }

    /// The end-to-end dispatch scenario: one matching online runner claims
    /// the job, the run starts, and a racing second claim loses its CAS.
    #[tokio::test]
    async fn dispatches_to_matching_runner() {
        let (dao, runners, run_id) = seeded_dao().await;
        let (matching, _) = runners
            .register("good", 1, 0, vec!["linux".into(), "x64".into()], "reg-token")
            .await
            .unwrap();
        runners
            .register("wrong-labels", 1, 0, vec!["macos".into()], "reg-token")
            .await
            .unwrap();

        let created = dao.create_job(job(run_id, 5, &["linux"])).await.unwrap();
        let dispatcher = Dispatcher::new(dao.clone(), runners);
        assert_eq!(dispatcher.tick().await.unwrap(), 1);

        let claimed = dao.job(created.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, RunStatus::InProgress);
        assert_eq!(claimed.runner_id, Some(matching.uuid));

        let run = dao.run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::InProgress);

        // A second dispatcher racing on the same job loses the claim.
        assert!(
            !dao.claim_job(created.id, Uuid::new_v4(), Utc::now())
                .await
                .unwrap()
        );

        // Another round assigns nothing new.
        assert_eq!(dispatcher.tick().await.unwrap(), 0);
    }

    /// Repo-scoped runners win over org-scoped ones with the same labels.
    #[tokio::test]
    async fn repo_scope_has_priority() {
        let (dao, runners, run_id) = seeded_dao().await;
        let (_org, _) = runners
            .register("org", 1, 0, vec!["linux".into()], "reg-token")
            .await
            .unwrap();
        let (repo_scoped, _) = runners
            .register("repo", 1, 5, vec!["linux".into()], "reg-token")
            .await
            .unwrap();

        let created = dao.create_job(job(run_id, 5, &["linux"])).await.unwrap();
        let dispatcher = Dispatcher::new(dao.clone(), runners);
        assert_eq!(dispatcher.tick().await.unwrap(), 1);

        let claimed = dao.job(created.id).await.unwrap().unwrap();
        assert_eq!(claimed.runner_id, Some(repo_scoped.uuid));
    }

    /// Offline runners receive nothing.
    #[tokio::test]
    async fn offline_runners_are_skipped() {
        let (dao, runners, run_id) = seeded_dao().await;
        let (runner, _) = runners
            .register("sleepy", 1, 0, vec!["linux".into()], "reg-token")
            .await
            .unwrap();
        dao.update_runner_status(runner.uuid, RunnerStatus::Offline)
            .await
            .unwrap();

        dao.create_job(job(run_id, 5, &["linux"])).await.unwrap();
        let dispatcher = Dispatcher::new(dao.clone(), runners);
        assert_eq!(dispatcher.tick().await.unwrap(), 0);
    }

    /// Completing the last job completes nothing automatically; run
    /// conclusions stay explicit.
    #[tokio::test]
    async fn completion_stays_explicit() {
        let (dao, runners, run_id) = seeded_dao().await;
        runners
            .register("r", 1, 0, vec!["linux".into()], "reg-token")
            .await
            .unwrap();
        let created = dao.create_job(job(run_id, 5, &["linux"])).await.unwrap();
        let dispatcher = Dispatcher::new(dao.clone(), runners);
        dispatcher.tick().await.unwrap();

        assert!(
            dao.transition_job(
                created.id,
                RunStatus::InProgress,
                RunStatus::Completed,
                Some(RunConclusion::Success),
            )
            .await
            .unwrap()
        );
        let run = dao.run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
    }
}
