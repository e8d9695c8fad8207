//! Storage quota admission and the transfer concurrency gate. Quota checks
//! run at batch-upload admission; the gate bounds concurrent transfers per
//! backend and produces the retry-after signal.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LfsConfig;
use crate::errors::{ForgeError, Result};
use crate::store::dao::LfsDao;
use crate::store::records::{BandwidthRecord, RepoId, TransferOp, UserId};

/// Enforces cumulative byte quotas using the DAO's usage sums. Zero limits
/// disable the corresponding check.
pub struct QuotaTracker {
    dao: Arc<dyn LfsDao>,
    repo_limit: u64,
    owner_limit: u64,
}

impl QuotaTracker {
    pub fn new(dao: Arc<dyn LfsDao>, config: &LfsConfig) -> Self {
        Self {
            dao,
            repo_limit: config.repo_quota_bytes,
            owner_limit: config.owner_quota_bytes,
        }
    }

    /// Admit `requested` additional bytes for `(owner, repo)`, or fail with
    /// `StorageLimitExceeded`.
    pub async fn admit(&self, owner: UserId, repo: RepoId, requested: u64) -> Result<()> {
        if self.repo_limit > 0 {
            let used = self.dao.repo_usage_bytes(repo).await?;
            if used.saturating_add(requested) > self.repo_limit {
                return Err(ForgeError::StorageLimitExceeded {
                    used,
                    requested,
                    limit: self.repo_limit,
                });
            }
        }
        if self.owner_limit > 0 {
            let used = self.dao.owner_usage_bytes(owner).await?;
            if used.saturating_add(requested) > self.owner_limit {
                return Err(ForgeError::StorageLimitExceeded {
                    used,
                    requested,
                    limit: self.owner_limit,
                });
            }
        }
        Ok(())
    }

    /// Append one entry to the bandwidth ledger.
    pub async fn record(&self, repo: RepoId, operation: TransferOp, bytes: u64) -> Result<()> {
        self.dao
            .record_bandwidth(BandwidthRecord {
                repo_id: repo,
                operation,
                bytes,
                ts: Utc::now(),
            })
            .await
    }
}

/// Bounds concurrent transfers against one storage backend. When saturated,
/// admission reports the seconds a client should wait before retrying.
pub struct TransferGate {
    slots: Arc<Semaphore>,
    retry_after_secs: u64,
}

impl TransferGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry_after_secs: 5,
        }
    }

    /// Try to take a transfer slot. `Err(secs)` is the retry-after hint.
    pub fn try_admit(&self) -> std::result::Result<OwnedSemaphorePermit, u64> {
        self.slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| self.retry_after_secs)
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}
