//! Filesystem content store: `LFSRoot/oid[0..2]/oid[2..4]/oid` with
//! canonicalized prefix checks on every resolved path and a filtered,
//! deterministic directory walk.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::errors::{ForgeError, Result};
use crate::lfs::storage::{ContentStore, ObjectStream, StoredObject, validate_oid};
use crate::store::records::StorageBackendKind;

/// Local filesystem backend rooted at a canonicalized directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) the store root. The canonical root is the
    /// prefix every resolved path must keep.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let root = std::fs::canonicalize(root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fan-out path for an oid. The oid shape is validated first, so the
    /// joined path cannot contain separators or dot segments.
    fn object_path(&self, oid: &str) -> Result<PathBuf> {
        validate_oid(oid)?;
        Ok(self
            .root
            .join(&oid[0..2])
            .join(&oid[2..4])
            .join(oid))
    }

    /// Resolve an existing path (following symlinks) and insist the result
    /// stays under the root.
    fn confine_existing(&self, path: &Path) -> Result<PathBuf> {
        let resolved = std::fs::canonicalize(path)
            .map_err(|_| ForgeError::ObjectNotFound(path.display().to_string()))?;
        if !resolved.starts_with(&self.root) {
            return Err(ForgeError::PathTraversalAttempt(
                path.display().to_string(),
            ));
        }
        Ok(resolved)
    }

    /// Directory-entry filter applied during listing: skip names containing
    /// `..`, absolute names, NUL bytes, and dot-prefixed entries.
    fn acceptable_entry(name: &std::ffi::OsStr) -> bool {
        let Some(name) = name.to_str() else {
            return false;
        };
        !(name.contains("..")
            || name.starts_with('/')
            || name.contains('\0')
            || name.starts_with('.'))
    }
}

#[async_trait]
impl ContentStore for LocalStore {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::Filesystem
    }

    async fn exists(&self, oid: &str) -> Result<bool> {
        let path = self.object_path(oid)?;
        match self.confine_existing(&path) {
            Ok(resolved) => Ok(tokio::fs::try_exists(&resolved).await?),
            Err(ForgeError::ObjectNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, oid: &str) -> Result<ObjectStream> {
        let path = self.object_path(oid)?;
        let resolved = self.confine_existing(&path)?;
        let mut file = tokio::fs::File::open(&resolved)
            .await
            .map_err(|_| ForgeError::ObjectNotFound(oid.to_string()))?;

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes>>(8);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx
                            .send(Ok(Bytes::copy_from_slice(&buf[..n])))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(ForgeError::Io(e))).await;
                        break;
                    }
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn put(&self, oid: &str, body: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        let path = self.object_path(oid)?;
        let parent = path
            .parent()
            .ok_or_else(|| ForgeError::PathTraversalAttempt(oid.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        // The fan-out directories now exist; re-resolve and confine them
        // before any write lands.
        let parent = self.confine_existing(parent)?;
        let final_path = parent.join(oid);

        // Stage into a temporary file and promote with a rename so readers
        // never observe partial content.
        let staging = tempfile::NamedTempFile::new_in(&parent)?.into_temp_path();
        let mut file = tokio::fs::File::create(&staging).await?;

        let mut written = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        file.sync_all().await?;
        drop(file);

        staging
            .persist(&final_path)
            .map_err(|e| ForgeError::Io(e.error))?;
        Ok(written)
    }

    async fn delete(&self, oid: &str) -> Result<()> {
        let path = self.object_path(oid)?;
        match self.confine_existing(&path) {
            Ok(resolved) => {
                tokio::fs::remove_file(&resolved).await?;
                Ok(())
            }
            Err(ForgeError::ObjectNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut outer = tokio::fs::read_dir(&self.root).await?;
        while let Some(level1) = outer.next_entry().await? {
            if !Self::acceptable_entry(&level1.file_name()) || !level1.file_type().await?.is_dir() {
                continue;
            }
            let mut inner = tokio::fs::read_dir(level1.path()).await?;
            while let Some(level2) = inner.next_entry().await? {
                if !Self::acceptable_entry(&level2.file_name())
                    || !level2.file_type().await?.is_dir()
                {
                    continue;
                }
                let mut files = tokio::fs::read_dir(level2.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    let name = entry.file_name();
                    if !Self::acceptable_entry(&name) {
                        continue;
                    }
                    let Some(oid) = name.to_str().map(str::to_owned) else {
                        continue;
                    };
                    if validate_oid(&oid).is_err() {
                        continue;
                    }
                    let resolved = match self.confine_existing(&entry.path()) {
                        Ok(resolved) => resolved,
                        Err(_) => continue,
                    };
                    let meta = tokio::fs::metadata(&resolved).await?;
                    if !meta.is_file() {
                        continue;
                    }
                    objects.push(StoredObject {
                        oid,
                        size: meta.len(),
                        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    });
                }
            }
        }
        objects.sort_by(|a, b| a.oid.cmp(&b.oid));
        Ok(objects)
    }
}
