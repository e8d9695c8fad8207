//! The push → run trigger path: after a successful receive-pack, enumerate
//! `.github/workflows/*.yml` at each pushed branch head through the mediated
//! git binary and queue a run for every workflow that fires on push.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::actions::workflow::Workflow;
use crate::config::ActionsConfig;
use crate::errors::Result;
use crate::git::{GitExec, RepoLocator};
use crate::protocol::RefUpdate;
use crate::ssh::server::PushHook;
use crate::store::dao::ActionsDao;
use crate::store::records::{
    JobRecord, Repository, RunRecord, RunStatus, TriggerEvent, UserId, WorkflowRecord,
};
use crate::utils::Deadline;

const WORKFLOW_DIR: &str = ".github/workflows";

/// Whether a tree path is a workflow document.
fn is_workflow_path(path: &str) -> bool {
    path.starts_with(WORKFLOW_DIR)
        && (path.ends_with(".yml") || path.ends_with(".yaml"))
}

/// Split `git ls-tree -z --name-only` output into paths.
fn split_tree_listing(stdout: &[u8]) -> Vec<String> {
    use bstr::ByteSlice;

    stdout
        .split_str("\0")
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| entry.to_str().ok())
        .map(str::to_owned)
        .collect()
}

/// Creates queued runs from pushes. Wired as the SSH bridge's push hook.
pub struct PushTrigger {
    git: Arc<GitExec>,
    locator: RepoLocator,
    dao: Arc<dyn ActionsDao>,
    config: ActionsConfig,
}

impl PushTrigger {
    pub fn new(
        git: Arc<GitExec>,
        locator: RepoLocator,
        dao: Arc<dyn ActionsDao>,
        config: ActionsConfig,
    ) -> Self {
        Self {
            git,
            locator,
            dao,
            config,
        }
    }

    /// Process one push. Returns the number of runs queued. A workflow that
    /// fails to parse is skipped; it must not block the others.
    pub async fn trigger_push(
        &self,
        repo: &Repository,
        pusher: UserId,
        updates: &[RefUpdate],
        deadline: &Deadline,
    ) -> Result<usize> {
        if !self.config.enable {
            return Ok(0);
        }
        let repo_path = self.locator.locate(&repo.owner_name, &repo.name)?;
        let mut queued = 0;

        for update in updates {
            let Some(branch) = update.branch() else {
                continue;
            };
            if update.is_delete() {
                continue;
            }
            let commit = update.new_id.as_str();

            let listing = match self
                .git
                .run(
                    &repo_path,
                    &[
                        "ls-tree",
                        "-z",
                        "--name-only",
                        commit,
                        &format!("{WORKFLOW_DIR}/"),
                    ],
                    &[],
                    deadline,
                )
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        commit,
                        "workflow enumeration failed, skipping ref"
                    );
                    continue;
                }
            };

            for path in split_tree_listing(&listing.stdout) {
                if !is_workflow_path(&path) {
                    continue;
                }
                match self
                    .queue_workflow(repo, pusher, branch, commit, &path, deadline)
                    .await
                {
                    Ok(true) => queued += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, path, "workflow skipped"),
                }
            }
        }
        Ok(queued)
    }

    /// Returns true when a run was actually queued.
    async fn queue_workflow(
        &self,
        repo: &Repository,
        pusher: UserId,
        branch: &str,
        commit: &str,
        path: &str,
        deadline: &Deadline,
    ) -> Result<bool> {
        let repo_path = self.locator.locate(&repo.owner_name, &repo.name)?;
        let blob = self
            .git
            .run(
                &repo_path,
                &["cat-file", "blob", &format!("{commit}:{path}")],
                &[],
                deadline,
            )
            .await?;
        let source = String::from_utf8_lossy(&blob.stdout).into_owned();
        let workflow = Workflow::parse(&source)?;

        let record = self
            .dao
            .upsert_workflow(WorkflowRecord {
                id: 0,
                repo_id: repo.id,
                file_path: path.to_string(),
                source,
                is_active: true,
            })
            .await?;

        if !workflow.fires_on(TriggerEvent::Push) {
            return Ok(false);
        }

        let run = self
            .dao
            .create_run(RunRecord {
                id: 0,
                workflow_id: record.id,
                repo_id: repo.id,
                run_number: 0,
                trigger_event: TriggerEvent::Push,
                commit_sha: commit.to_string(),
                branch: branch.to_string(),
                actor_id: pusher,
                status: RunStatus::Queued,
                conclusion: None,
                timeout_minutes: workflow.timeout_minutes(self.config.default_timeout_minutes),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            })
            .await?;

        for (name, job) in &workflow.jobs {
            self.dao
                .create_job(JobRecord {
                    id: 0,
                    run_id: run.id,
                    repo_id: repo.id,
                    name: name.clone(),
                    labels: job.runs_on.labels(),
                    status: RunStatus::Queued,
                    conclusion: None,
                    runner_id: None,
                    queued_at: Utc::now(),
                })
                .await?;
        }

        tracing::info!(
            repo = %repo.name,
            run_number = run.run_number,
            workflow = path,
            commit,
            "run queued from push"
        );
        Ok(true)
    }
}

#[async_trait]
impl PushHook for PushTrigger {
    async fn on_push(
        &self,
        repo: &Repository,
        pusher: UserId,
        updates: &[RefUpdate],
    ) -> Result<()> {
        let deadline = Deadline::after(std::time::Duration::from_secs(60));
        self.trigger_push(repo, pusher, updates, &deadline).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Only YAML files under the workflow directory qualify.
    #[test]
    fn workflow_path_filter() {
        assert!(is_workflow_path(".github/workflows/ci.yml"));
        assert!(is_workflow_path(".github/workflows/release.yaml"));
        assert!(!is_workflow_path(".github/workflows/README.md"));
        assert!(!is_workflow_path("docs/ci.yml"));
        assert!(!is_workflow_path(".github/ci.yml"));
    }

    /// NUL-separated listings split cleanly.
    #[test]
    fn tree_listing_split() {
        let raw = b".github/workflows/a.yml\0.github/workflows/b.yaml\0";
        assert_eq!(
            split_tree_listing(raw),
            vec![".github/workflows/a.yml", ".github/workflows/b.yaml"]
        );
        assert!(split_tree_listing(b"").is_empty());
    }
}
