//! Git-LFS v2 batch protocol: translates batch requests into per-object
//! transfer actions against the content store, with quota admission,
//! permission checks, and verify-on-completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;

use crate::config::LfsConfig;
use crate::errors::{ForgeError, Result};
use crate::lfs::quota::{QuotaTracker, TransferGate};
use crate::lfs::storage::{ContentStore, validate_oid};
use crate::store::dao::{LfsDao, RepositoryDao};
use crate::store::records::{
    Access, LfsObjectRecord, Repository, TransferOp, UserId,
};

/// A batch request as posted to `objects/batch`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub operation: String,
    #[serde(default)]
    pub transfers: Vec<String>,
    pub objects: Vec<ObjectSpec>,
}

/// One `{oid, size}` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub oid: String,
    pub size: i64,
}

/// A single transfer action (upload, verify, or download).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAction {
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Per-object error in a batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectError {
    pub code: u16,
    pub message: String,
}

/// One object entry of a batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseObject {
    pub oid: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<BTreeMap<String, BatchAction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

/// The full batch response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub transfer: String,
    pub objects: Vec<ResponseObject>,
}

/// Outcome of batch admission: either a response, or a saturation signal
/// the HTTP layer maps to a retry-after.
#[derive(Debug)]
pub enum BatchReply {
    Ready(BatchResponse),
    Saturated { retry_after_secs: u64 },
}

/// The batch translator. One instance per active content backend.
pub struct BatchProcessor {
    content: Arc<dyn ContentStore>,
    lfs: Arc<dyn LfsDao>,
    repos: Arc<dyn RepositoryDao>,
    quota: QuotaTracker,
    gate: TransferGate,
    config: LfsConfig,
}

impl BatchProcessor {
    pub fn new(
        content: Arc<dyn ContentStore>,
        lfs: Arc<dyn LfsDao>,
        repos: Arc<dyn RepositoryDao>,
        config: LfsConfig,
    ) -> Self {
        let quota = QuotaTracker::new(lfs.clone(), &config);
        let gate = TransferGate::new(config.max_concurrent_transfers);
        Self {
            content,
            lfs,
            repos,
            quota,
            gate,
            config,
        }
    }

    /// Handle one batch request for `requester` against `repo`.
    pub async fn process(
        &self,
        repo: &Repository,
        requester: UserId,
        request: &BatchRequest,
    ) -> Result<BatchReply> {
        if !request.transfers.is_empty() && !request.transfers.iter().any(|t| t == "basic") {
            return Err(ForgeError::InvalidInput(
                "no supported transfer adapter offered".into(),
            ));
        }

        // One slot covers the negotiation; the data transfers themselves are
        // admitted per object by the href endpoints.
        let Ok(_permit) = self.gate.try_admit() else {
            return Ok(BatchReply::Saturated {
                retry_after_secs: 5,
            });
        };

        let access = self.repos.access_for(requester, repo).await?;
        let objects = match request.operation.as_str() {
            "upload" => {
                if access < Access::Write {
                    return Err(ForgeError::PermissionDenied);
                }
                self.upload_objects(repo, &request.objects).await?
            }
            "download" => {
                if access < Access::Read {
                    return Err(ForgeError::PermissionDenied);
                }
                self.download_objects(repo, &request.objects).await?
            }
            other => {
                return Err(ForgeError::InvalidInput(format!(
                    "unknown batch operation: {other}"
                )));
            }
        };

        Ok(BatchReply::Ready(BatchResponse {
            transfer: "basic".to_string(),
            objects,
        }))
    }

    async fn upload_objects(
        &self,
        repo: &Repository,
        specs: &[ObjectSpec],
    ) -> Result<Vec<ResponseObject>> {
        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            if validate_oid(&spec.oid).is_err() || spec.size < 0 {
                out.push(object_error(spec, 422, "invalid oid or size"));
                continue;
            }

            // Already present: nothing to do for this object.
            if let Some(row) = self.lfs.lfs_object(repo.id, &spec.oid).await?
                && row.present
            {
                out.push(ResponseObject {
                    oid: spec.oid.clone(),
                    size: spec.size,
                    actions: None,
                    error: None,
                });
                continue;
            }

            if let Err(e) = self
                .quota
                .admit(repo.owner_id, repo.id, spec.size as u64)
                .await
            {
                match e {
                    ForgeError::StorageLimitExceeded { .. } => {
                        out.push(object_error(spec, 507, "storage quota exceeded"));
                        continue;
                    }
                    other => return Err(other),
                }
            }

            self.lfs
                .upsert_lfs_object(LfsObjectRecord {
                    repo_id: repo.id,
                    oid: spec.oid.clone(),
                    size: spec.size,
                    backend: self.content.kind(),
                    present: false,
                    checksum_verified: false,
                    created_at: Utc::now(),
                })
                .await?;

            let expires_at = Utc::now()
                + chrono::Duration::seconds(self.config.action_expires_secs as i64);
            let mut actions = BTreeMap::new();
            actions.insert(
                "upload".to_string(),
                BatchAction {
                    href: self.object_href(repo, &spec.oid),
                    header: None,
                    expires_at: Some(expires_at),
                },
            );
            actions.insert(
                "verify".to_string(),
                BatchAction {
                    href: format!("{}/verify", self.object_href(repo, &spec.oid)),
                    header: None,
                    expires_at: Some(expires_at),
                },
            );
            out.push(ResponseObject {
                oid: spec.oid.clone(),
                size: spec.size,
                actions: Some(actions),
                error: None,
            });
        }
        Ok(out)
    }

    async fn download_objects(
        &self,
        repo: &Repository,
        specs: &[ObjectSpec],
    ) -> Result<Vec<ResponseObject>> {
        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            if validate_oid(&spec.oid).is_err() {
                out.push(object_error(spec, 422, "invalid oid"));
                continue;
            }
            let row = self.lfs.lfs_object(repo.id, &spec.oid).await?;
            let present = match &row {
                Some(row) => row.present && self.content.exists(&spec.oid).await?,
                None => false,
            };
            if !present {
                out.push(object_error(spec, 404, "object does not exist"));
                continue;
            }
            let size = row.map(|r| r.size).unwrap_or(spec.size);
            self.quota
                .record(repo.id, TransferOp::Download, size.max(0) as u64)
                .await?;

            let mut actions = BTreeMap::new();
            actions.insert(
                "download".to_string(),
                BatchAction {
                    href: self.object_href(repo, &spec.oid),
                    header: None,
                    expires_at: None,
                },
            );
            out.push(ResponseObject {
                oid: spec.oid.clone(),
                size,
                actions: Some(actions),
                error: None,
            });
        }
        Ok(out)
    }

    /// Store an uploaded body under `(repo, oid)`. Repeated uploads of the
    /// same oid land on the same key; verify decides what is kept.
    pub async fn receive_upload(
        &self,
        repo: &Repository,
        oid: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        validate_oid(oid)?;
        if self.lfs.lfs_object(repo.id, oid).await?.is_none() {
            return Err(ForgeError::ObjectNotFound(oid.to_string()));
        }
        let Ok(_permit) = self.gate.try_admit() else {
            return Err(ForgeError::BackendError(
                "transfer concurrency exhausted".into(),
            ));
        };
        self.content.put(oid, body).await
    }

    /// Verify an uploaded object: re-read it, hash it, and compare hash and
    /// size. A mismatch deletes the blob; only success marks the row
    /// present.
    pub async fn verify(&self, repo: &Repository, oid: &str, size: i64) -> Result<()> {
        use futures::StreamExt;

        validate_oid(oid)?;
        let mut stream = self.content.get(oid).await?;
        let mut hasher = Sha256::new();
        let mut total: i64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            total += chunk.len() as i64;
        }
        let digest = hex::encode(hasher.finalize());

        if digest != oid || total != size {
            self.content.delete(oid).await?;
            return Err(ForgeError::InvalidChecksum {
                oid: oid.to_string(),
                detail: format!(
                    "got hash {digest} ({total} bytes), expected {oid} ({size} bytes)"
                ),
            });
        }

        self.lfs.mark_present(repo.id, oid, true).await?;
        self.quota
            .record(repo.id, TransferOp::Upload, total as u64)
            .await?;
        Ok(())
    }

    /// Stream an object for download, recording nothing; the ledger entry
    /// was written at batch time.
    pub async fn open_download(
        &self,
        repo: &Repository,
        oid: &str,
    ) -> Result<crate::lfs::storage::ObjectStream> {
        validate_oid(oid)?;
        match self.lfs.lfs_object(repo.id, oid).await? {
            Some(row) if row.present => self.content.get(oid).await,
            _ => Err(ForgeError::ObjectNotFound(oid.to_string())),
        }
    }

    fn object_href(&self, repo: &Repository, oid: &str) -> String {
        format!(
            "{}/{}/{}.git/info/lfs/objects/{}",
            self.config.url_base.trim_end_matches('/'),
            repo.owner_name,
            repo.name,
            oid
        )
    }
}

fn object_error(spec: &ObjectSpec, code: u16, message: &str) -> ResponseObject {
    ResponseObject {
        oid: spec.oid.clone(),
        size: spec.size,
        actions: None,
        error: Some(ObjectError {
            code,
            message: message.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lfs::local::LocalStore;
    use crate::store::memory::MemoryStore;
    use crate::utils::sha256_hex;

    struct Fixture {
        processor: BatchProcessor,
        repo: Repository,
        #[allow(dead_code)]
        dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let repo = store
            .create_repository(Repository {
                id: 0,
                owner_id: 1,
                owner_name: "alice".to_string(),
                name: "demo".to_string(),
                default_branch: "main".to_string(),
                is_private: true,
                is_archived: false,
                size_bytes: 0,
            })
            .await
            .unwrap();
        let content = Arc::new(LocalStore::open(dir.path()).unwrap());
        let processor = BatchProcessor::new(
            content,
            store.clone(),
            store,
            LfsConfig {
                url_base: "https://forge.example".to_string(),
                ..LfsConfig::default()
            },
        );
        Fixture {
            processor,
            repo,
            dir,
        }
    }

    fn upload_request(oid: &str, size: i64) -> BatchRequest {
        BatchRequest {
            operation: "upload".to_string(),
            transfers: vec!["basic".to_string()],
            objects: vec![ObjectSpec {
                oid: oid.to_string(),
                size,
            }],
        }
    }

    fn ready(reply: BatchReply) -> BatchResponse {
        match reply {
            BatchReply::Ready(response) => response,
            BatchReply::Saturated { .. } => panic!("unexpected saturation"),
        }
    }

    /// Upload, verify, then download round-trips the content.
    #[tokio::test]
    async fn upload_verify_download_round_trip() {
        let fx = fixture().await;
        let content = b"ten megabytes would also work here".to_vec();
        let oid = sha256_hex(&content);

        let reply = fx
            .processor
            .process(&fx.repo, 1, &upload_request(&oid, content.len() as i64))
            .await
            .unwrap();
        let response = ready(reply);
        let actions = response.objects[0].actions.as_ref().unwrap();
        assert!(actions.contains_key("upload"));
        assert!(actions.contains_key("verify"));
        assert!(
            actions["upload"]
                .href
                .starts_with("https://forge.example/alice/demo.git/info/lfs/objects/")
        );
        assert!(actions["upload"].expires_at.is_some());

        fx.processor
            .receive_upload(&fx.repo, &oid, &mut content.as_slice())
            .await
            .unwrap();
        fx.processor
            .verify(&fx.repo, &oid, content.len() as i64)
            .await
            .unwrap();

        // A second upload batch reports the object as already present.
        let reply = fx
            .processor
            .process(&fx.repo, 1, &upload_request(&oid, content.len() as i64))
            .await
            .unwrap();
        let response = ready(reply);
        assert!(response.objects[0].actions.is_none());
        assert!(response.objects[0].error.is_none());

        // Download returns an action for the present object.
        let reply = fx
            .processor
            .process(
                &fx.repo,
                1,
                &BatchRequest {
                    operation: "download".to_string(),
                    transfers: Vec::new(),
                    objects: vec![ObjectSpec {
                        oid: oid.clone(),
                        size: content.len() as i64,
                    }],
                },
            )
            .await
            .unwrap();
        let response = ready(reply);
        assert!(
            response.objects[0]
                .actions
                .as_ref()
                .unwrap()
                .contains_key("download")
        );

        use futures::StreamExt;
        let mut stream = fx.processor.open_download(&fx.repo, &oid).await.unwrap();
        let mut fetched = Vec::new();
        while let Some(chunk) = stream.next().await {
            fetched.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(fetched, content);
    }

    /// Corrupted uploads fail verify, and the blob is deleted.
    #[tokio::test]
    async fn verify_rejects_corruption() {
        let fx = fixture().await;
        let content = b"original".to_vec();
        let oid = sha256_hex(&content);

        ready(
            fx.processor
                .process(&fx.repo, 1, &upload_request(&oid, content.len() as i64))
                .await
                .unwrap(),
        );
        fx.processor
            .receive_upload(&fx.repo, &oid, &mut &b"tampered"[..])
            .await
            .unwrap();

        let err = fx
            .processor
            .verify(&fx.repo, &oid, content.len() as i64)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidChecksum { .. }));

        // The tampered blob is gone and the row never became present.
        assert!(fx.processor.open_download(&fx.repo, &oid).await.is_err());
    }

    /// Bad oids and negative sizes produce per-object 422 errors.
    #[tokio::test]
    async fn invalid_specs_get_per_object_errors() {
        let fx = fixture().await;
        let reply = fx
            .processor
            .process(
                &fx.repo,
                1,
                &BatchRequest {
                    operation: "upload".to_string(),
                    transfers: Vec::new(),
                    objects: vec![
                        ObjectSpec {
                            oid: "short".to_string(),
                            size: 1,
                        },
                        ObjectSpec {
                            oid: "d".repeat(64),
                            size: -5,
                        },
                    ],
                },
            )
            .await
            .unwrap();
        let response = ready(reply);
        assert_eq!(response.objects[0].error.as_ref().unwrap().code, 422);
        assert_eq!(response.objects[1].error.as_ref().unwrap().code, 422);
    }

    /// Missing objects yield per-object 404s on download.
    #[tokio::test]
    async fn absent_download_is_404() {
        let fx = fixture().await;
        let reply = fx
            .processor
            .process(
                &fx.repo,
                1,
                &BatchRequest {
                    operation: "download".to_string(),
                    transfers: Vec::new(),
                    objects: vec![ObjectSpec {
                        oid: "e".repeat(64),
                        size: 3,
                    }],
                },
            )
            .await
            .unwrap();
        let response = ready(reply);
        assert_eq!(response.objects[0].error.as_ref().unwrap().code, 404);
    }

    /// Readers cannot upload; unknown users cannot download private repos.
    #[tokio::test]
    async fn permissions_enforced() {
        let fx = fixture().await;
        let err = fx
            .processor
            .process(&fx.repo, 99, &upload_request(&"f".repeat(64), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::PermissionDenied));

        let err = fx
            .processor
            .process(
                &fx.repo,
                99,
                &BatchRequest {
                    operation: "download".to_string(),
                    transfers: Vec::new(),
                    objects: vec![],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::PermissionDenied));
    }

    /// Over-quota uploads are refused with a 507 object error.
    #[tokio::test]
    async fn quota_surfaces_as_507() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let repo = store
            .create_repository(Repository {
                id: 0,
                owner_id: 1,
                owner_name: "bob".to_string(),
                name: "big".to_string(),
                default_branch: "main".to_string(),
                is_private: false,
                is_archived: false,
                size_bytes: 0,
            })
            .await
            .unwrap();
        let processor = BatchProcessor::new(
            Arc::new(LocalStore::open(dir.path()).unwrap()),
            store.clone(),
            store,
            LfsConfig {
                repo_quota_bytes: 100,
                ..LfsConfig::default()
            },
        );
        let reply = processor
            .process(&repo, 1, &upload_request(&"a".repeat(64), 101))
            .await
            .unwrap();
        let response = ready(reply);
        assert_eq!(response.objects[0].error.as_ref().unwrap().code, 507);
    }
}
