//! Runner registration, token authentication, and heartbeat tracking. Auth
//! tokens are returned exactly once; only their SHA-256 hash is stored, and
//! presented tokens are compared in constant time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::errors::{ForgeError, Result};
use crate::store::dao::ActionsDao;
use crate::store::records::{RepoId, RunnerRecord, RunnerStatus, UserId};
use crate::utils::sha256_hex;
use crate::validate::bounded_ident;

/// Constant-time equality over the hex hashes of two tokens.
fn token_matches(presented: &str, stored_hash: &str) -> bool {
    let presented_hash = sha256_hex(presented.as_bytes());
    presented_hash
        .as_bytes()
        .ct_eq(stored_hash.as_bytes())
        .into()
}

/// Manages runner identity and liveness against the DAO.
pub struct RunnerManager {
    dao: Arc<dyn ActionsDao>,
    registration_token_hash: String,
    heartbeat_timeout: Duration,
    rng: SystemRandom,
}

impl RunnerManager {
    /// `registration_token` is the shared secret new runners present; it is
    /// hashed immediately and the plaintext dropped.
    pub fn new(
        dao: Arc<dyn ActionsDao>,
        registration_token: &str,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            dao,
            registration_token_hash: sha256_hex(registration_token.as_bytes()),
            heartbeat_timeout,
            rng: SystemRandom::new(),
        }
    }

    /// Register a runner. Returns the record and the plaintext auth token;
    /// this is the only time the token ever leaves this function.
    pub async fn register(
        &self,
        name: &str,
        owner_id: UserId,
        repository_id: RepoId,
        labels: Vec<String>,
        registration_token: &str,
    ) -> Result<(RunnerRecord, String)> {
        bounded_ident(name)?;
        if !token_matches(registration_token, &self.registration_token_hash) {
            return Err(ForgeError::AuthenticationFailed);
        }

        let mut secret = [0u8; 32];
        self.rng
            .fill(&mut secret)
            .map_err(|_| ForgeError::BackendError("token generation failed".into()))?;
        let token = hex::encode(secret);

        let record = RunnerRecord {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            owner_id,
            repository_id,
            token_hash: sha256_hex(token.as_bytes()),
            labels: labels
                .into_iter()
                .map(|l| l.to_ascii_lowercase())
                .collect(),
            status: RunnerStatus::Online,
            last_seen: Utc::now(),
        };
        self.dao.register_runner(record.clone()).await?;
        tracing::info!(uuid = %record.uuid, name = %record.name, "runner registered");
        Ok((record, token))
    }

    /// Authenticate a poll by uuid + token. Unknown uuids and bad tokens are
    /// indistinguishable.
    pub async fn authenticate(&self, uuid: Uuid, token: &str) -> Result<RunnerRecord> {
        let Some(record) = self.dao.runner(uuid).await? else {
            return Err(ForgeError::AuthenticationFailed);
        };
        if !token_matches(token, &record.token_hash) {
            return Err(ForgeError::AuthenticationFailed);
        }
        Ok(record)
    }

    /// Record a heartbeat. Retries the optimistic `last_seen` CAS a few
    /// times; a runner racing its own heartbeats is harmless.
    pub async fn heartbeat(&self, uuid: Uuid) -> Result<()> {
        for _ in 0..3 {
            let Some(record) = self.dao.runner(uuid).await? else {
                return Err(ForgeError::ObjectNotFound(format!("runner {uuid}")));
            };
            if self
                .dao
                .touch_runner(uuid, record.last_seen, Utc::now())
                .await?
            {
                if record.status == RunnerStatus::Offline {
                    self.dao
                        .update_runner_status(uuid, RunnerStatus::Online)
                        .await?;
                }
                return Ok(());
            }
        }
        // Every retry lost the CAS, meaning fresher heartbeats landed.
        Ok(())
    }

    /// Mark runners silent past the heartbeat timeout offline and reclaim
    /// their in-progress jobs back to the queue. Returns (runners marked,
    /// jobs reclaimed).
    pub async fn reap_stale(&self) -> Result<(usize, u64)> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.heartbeat_timeout)
            .map_err(|e| ForgeError::InvalidInput(format!("heartbeat timeout: {e}")))?;
        let mut marked = 0;
        let mut reclaimed = 0;
        for runner in self.dao.runners().await? {
            if runner.status == RunnerStatus::Offline {
                continue;
            }
            if now - runner.last_seen <= cutoff {
                continue;
            }
            self.dao
                .update_runner_status(runner.uuid, RunnerStatus::Offline)
                .await?;
            let released = self.dao.release_jobs_for_runner(runner.uuid).await?;
            if released > 0 {
                tracing::warn!(
                    uuid = %runner.uuid,
                    released,
                    "runner lost mid-job, work reclaimed"
                );
            }
            marked += 1;
            reclaimed += released;
        }
        Ok((marked, reclaimed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::records::{JobRecord, RunStatus};

    fn manager(dao: Arc<MemoryStore>) -> RunnerManager {
        RunnerManager::new(dao, "reg-token", Duration::from_secs(90))
    }

    /// Registration returns the token once; the stored record carries only
    /// its hash.
    #[tokio::test]
    async fn registration_hashes_token() {
        let dao = Arc::new(MemoryStore::new());
        let mgr = manager(dao.clone());
        let (record, token) = mgr
            .register("builder-1", 1, 0, vec!["Linux".to_string()], "reg-token")
            .await
            .unwrap();

        assert_ne!(record.token_hash, token);
        assert!(!record.token_hash.contains(&token));
        assert_eq!(record.labels, vec!["linux"]);

        let stored = dao.runner(record.uuid).await.unwrap().unwrap();
        assert_eq!(stored.token_hash, sha256_hex(token.as_bytes()));
    }

    /// A wrong registration token is refused.
    #[tokio::test]
    async fn registration_requires_token() {
        let dao = Arc::new(MemoryStore::new());
        let mgr = manager(dao);
        let err = mgr
            .register("builder-1", 1, 0, vec![], "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::AuthenticationFailed));
    }

    /// Poll authentication accepts the issued token and nothing else.
    #[tokio::test]
    async fn poll_authentication() {
        let dao = Arc::new(MemoryStore::new());
        let mgr = manager(dao);
        let (record, token) = mgr
            .register("builder-1", 1, 0, vec![], "reg-token")
            .await
            .unwrap();

        assert!(mgr.authenticate(record.uuid, &token).await.is_ok());
        assert!(matches!(
            mgr.authenticate(record.uuid, "forged").await,
            Err(ForgeError::AuthenticationFailed)
        ));
        assert!(matches!(
            mgr.authenticate(Uuid::new_v4(), &token).await,
            Err(ForgeError::AuthenticationFailed)
        ));
    }

    /// Silent runners go offline and their jobs return to the queue.
    #[tokio::test]
    async fn stale_runners_are_reaped() {
        let dao = Arc::new(MemoryStore::new());
        let mgr = manager(dao.clone());
        let (record, _) = mgr
            .register("builder-1", 1, 0, vec![], "reg-token")
            .await
            .unwrap();

        let job = dao
            .create_job(JobRecord {
                id: 0,
                run_id: 1,
                repo_id: 1,
                name: "build".to_string(),
                labels: vec![],
                status: RunStatus::Queued,
                conclusion: None,
                runner_id: None,
                queued_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(dao.claim_job(job.id, record.uuid, Utc::now()).await.unwrap());

        // Rewind last_seen past the timeout.
        assert!(
            dao.touch_runner(
                record.uuid,
                record.last_seen,
                Utc::now() - chrono::Duration::seconds(600),
            )
            .await
            .unwrap()
        );

        let (marked, reclaimed) = mgr.reap_stale().await.unwrap();
        assert_eq!((marked, reclaimed), (1, 1));

        let job = dao.job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, RunStatus::Queued);
        assert_eq!(job.runner_id, None);
        let runner = dao.runner(record.uuid).await.unwrap().unwrap();
        assert_eq!(runner.status, RunnerStatus::Offline);

        // A heartbeat brings the runner back online.
        mgr.heartbeat(record.uuid).await.unwrap();
        let runner = dao.runner(record.uuid).await.unwrap().unwrap();
        assert_eq!(runner.status, RunnerStatus::Online);
    }
}
