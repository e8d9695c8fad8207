//! The content-store seam shared by the filesystem and S3 backends. Objects
//! are immutable and addressed solely by the lowercase hex SHA-256 of their
//! content.

use std::pin::Pin;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use tokio::io::AsyncRead;

use crate::errors::{ForgeError, Result};
use crate::store::records::StorageBackendKind;

/// Type alias for object content streams to reduce nesting.
pub type ObjectStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// One stored object as reported by a backend listing.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub oid: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// Validate the LFS object identifier shape: exactly 64 lowercase hex
/// characters. Everything derived from an OID (paths, keys) assumes this has
/// passed.
pub fn validate_oid(oid: &str) -> Result<()> {
    let ok = oid.len() == 64
        && oid
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(ForgeError::InvalidInput(format!(
            "OID must be 64 lowercase hex characters: {oid}"
        )))
    }
}

/// Storage-level operations. Backends hold no per-repository state; the
/// `(repo_id, oid)` rows governing access live in the DAO.
#[async_trait]
pub trait ContentStore: Send + Sync {
    fn kind(&self) -> StorageBackendKind;

    async fn exists(&self, oid: &str) -> Result<bool>;

    /// Stream the object's content. `ObjectNotFound` when absent.
    async fn get(&self, oid: &str) -> Result<ObjectStream>;

    /// Store content under `oid`, reading the body to completion. Returns
    /// the number of bytes written. Writing the same oid twice is
    /// idempotent; verification decides whether the content is kept.
    async fn put(&self, oid: &str, body: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64>;

    async fn delete(&self, oid: &str) -> Result<()>;

    /// Enumerate every stored object, sorted by oid.
    async fn list(&self) -> Result<Vec<StoredObject>>;
}
