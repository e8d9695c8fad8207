//! Repository lifecycle: creating bare repositories through the mediated
//! git binary and force-deleting them in crash-safe order (on-disk tree
//! first, LFS content second, database rows last).

use std::sync::Arc;

use crate::errors::{ForgeError, Result};
use crate::git::{GitExec, RepoLocator};
use crate::lfs::storage::ContentStore;
use crate::store::dao::{LfsDao, RepositoryDao};
use crate::store::records::{Repository, UserId};
use crate::utils::Deadline;

pub struct RepoManager {
    git: Arc<GitExec>,
    locator: RepoLocator,
    repos: Arc<dyn RepositoryDao>,
    lfs: Arc<dyn LfsDao>,
    content: Arc<dyn ContentStore>,
}

impl RepoManager {
    pub fn new(
        git: Arc<GitExec>,
        locator: RepoLocator,
        repos: Arc<dyn RepositoryDao>,
        lfs: Arc<dyn LfsDao>,
        content: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            git,
            locator,
            repos,
            lfs,
            content,
        }
    }

    /// Create a bare repository on disk and its row. The on-disk tree is
    /// removed again if the row insert fails.
    pub async fn create(
        &self,
        owner_id: UserId,
        owner_name: &str,
        name: &str,
        default_branch: &str,
        is_private: bool,
        deadline: &Deadline,
    ) -> Result<Repository> {
        let path = self.locator.locate(owner_name, name)?;
        if path.exists() {
            return Err(ForgeError::InvalidRepository(format!(
                "{owner_name}/{name} already exists on disk"
            )));
        }
        tokio::fs::create_dir_all(&path).await?;

        let init = async {
            self.git.run(&path, &["init", "--bare"], &[], deadline).await?;
            self.git
                .run(
                    &path,
                    &[
                        "symbolic-ref",
                        "HEAD",
                        &format!("refs/heads/{default_branch}"),
                    ],
                    &[],
                    deadline,
                )
                .await?;
            self.repos
                .create_repository(Repository {
                    id: 0,
                    owner_id,
                    owner_name: owner_name.to_string(),
                    name: name.to_string(),
                    default_branch: default_branch.to_string(),
                    is_private,
                    is_archived: false,
                    size_bytes: 0,
                })
                .await
        };

        match init.await {
            Ok(repo) => Ok(repo),
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&path).await;
                Err(e)
            }
        }
    }

    /// Force-delete a repository. Ordering is deliberate: the Git tree goes
    /// first and the rows go last, so a crash anywhere in between leaves
    /// orphans that the next GC pass (or this call, retried) still finds
    /// through the surviving rows.
    pub async fn force_delete(&self, repo: &Repository) -> Result<()> {
        // 1. On-disk Git tree.
        let path = self.locator.locate(&repo.owner_name, &repo.name)?;
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }

        // 2. LFS content no other repository references.
        for row in self.lfs.lfs_objects_for_repo(repo.id).await? {
            let holders = self.lfs.repos_referencing_oid(&row.oid).await?;
            if holders == [repo.id] {
                self.content.delete(&row.oid).await?;
            }
        }

        // 3. Database rows, dependents included.
        self.repos.delete_repository_rows(repo.id).await?;
        tracing::info!(repo = %repo.name, owner = %repo.owner_name, "repository deleted");
        Ok(())
    }
}
