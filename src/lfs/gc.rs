//! LFS garbage collection: a three-phase mark/sweep that enumerates stored
//! objects, collects the OIDs still referenced by any repository's Git
//! history, and deletes the unreferenced remainder past a minimum age.
//!
//! At most one pass runs per collector; uploads proceed untouched while a
//! pass is active (young objects are never collected).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use crate::errors::{ForgeError, Result};
use crate::git::{GitExec, RepoLocator};
use crate::lfs::storage::{ContentStore, validate_oid};
use crate::store::dao::{LfsDao, RepositoryDao};
use crate::utils::Deadline;

/// Totals of one completed pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GcReport {
    pub scanned: usize,
    pub referenced: usize,
    pub deleted: usize,
    pub deleted_bytes: u64,
    pub kept_young: usize,
}

/// Single-writer garbage collector over one content backend.
pub struct GarbageCollector {
    content: Arc<dyn ContentStore>,
    repos: Arc<dyn RepositoryDao>,
    lfs: Arc<dyn LfsDao>,
    git: Arc<GitExec>,
    locator: RepoLocator,
    min_age: Duration,
    running: AtomicBool,
}

impl GarbageCollector {
    pub fn new(
        content: Arc<dyn ContentStore>,
        repos: Arc<dyn RepositoryDao>,
        lfs: Arc<dyn LfsDao>,
        git: Arc<GitExec>,
        locator: RepoLocator,
        min_age: Duration,
    ) -> Self {
        Self {
            content,
            repos,
            lfs,
            git,
            locator,
            min_age,
            running: AtomicBool::new(false),
        }
    }

    /// Run one pass. Fails with `InvalidState` if a pass is already active.
    pub async fn collect(&self, deadline: &Deadline) -> Result<GcReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ForgeError::InvalidState("gc pass already running".into()));
        }
        let result = self.collect_inner(deadline).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn collect_inner(&self, deadline: &Deadline) -> Result<GcReport> {
        let mut report = GcReport::default();

        // Phase 1: the stored object set.
        let stored = self.content.list().await?;
        report.scanned = stored.len();

        // Phase 2: referenced OIDs across every repository in scope. A
        // repository whose on-disk tree is missing contributes nothing; that
        // is what lets a crashed force-delete converge. A failing git
        // invocation on an existing tree aborts the pass instead, so a
        // broken enumeration can never widen the delete set.
        let mut referenced: HashSet<String> = HashSet::new();
        for repo in self.repos.list_repositories().await? {
            deadline.check()?;
            let path = self.locator.locate(&repo.owner_name, &repo.name)?;
            if !path.exists() {
                tracing::debug!(repo = %repo.name, "no on-disk tree, skipping enumeration");
                continue;
            }
            let output = self
                .git
                .run(
                    &path,
                    &["lfs", "ls-files", "--all", "--long"],
                    &[],
                    deadline,
                )
                .await?;
            for oid in parse_ls_files(&output.stdout) {
                referenced.insert(oid);
            }
        }
        report.referenced = referenced.len();

        // Phase 3: delete the unreferenced remainder past the age floor.
        let now = SystemTime::now();
        for object in stored {
            deadline.check()?;
            if referenced.contains(&object.oid) {
                continue;
            }
            let age = now
                .duration_since(object.modified)
                .unwrap_or(Duration::ZERO);
            if age <= self.min_age {
                // Possibly an in-flight upload; the next pass will see it.
                report.kept_young += 1;
                continue;
            }

            self.content.delete(&object.oid).await?;
            for repo_id in self.lfs.repos_referencing_oid(&object.oid).await? {
                self.lfs.delete_lfs_object(repo_id, &object.oid).await?;
            }
            report.deleted += 1;
            report.deleted_bytes += object.size;
        }

        tracing::info!(
            scanned = report.scanned,
            referenced = report.referenced,
            deleted = report.deleted,
            deleted_bytes = report.deleted_bytes,
            "gc pass complete"
        );
        Ok(report)
    }
}

/// Extract full OIDs from `git lfs ls-files --all --long` output. Each line
/// is `<oid> <*|-> <path>`; unparseable lines are skipped.
fn parse_ls_files(stdout: &[u8]) -> Vec<String> {
    use bstr::ByteSlice;

    let mut oids = Vec::new();
    for line in stdout.lines() {
        let Some(first) = line.fields().next() else {
            continue;
        };
        let Ok(oid) = std::str::from_utf8(first) else {
            continue;
        };
        if validate_oid(oid).is_ok() {
            oids.push(oid.to_string());
        }
    }
    oids
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ls-files parsing takes the leading full OID of each line.
    #[test]
    fn parses_ls_files_output() {
        let a = "a".repeat(64);
        let b = "b".repeat(64);
        let out = format!("{a} * img/logo.png\n{b} - data/big.bin\n\nnot an oid line\n");
        assert_eq!(parse_ls_files(out.as_bytes()), vec![a, b]);
    }

    /// Truncated OIDs are not accepted as references.
    #[test]
    fn rejects_short_oids() {
        let out = format!("{} * short.bin\n", "a".repeat(10));
        assert!(parse_ls_files(out.as_bytes()).is_empty());
    }
}
