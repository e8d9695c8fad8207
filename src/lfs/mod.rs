//! Git LFS support: the content-addressed object store (filesystem and S3),
//! the batch protocol translator, quota and bandwidth accounting, and
//! garbage collection.

pub mod batch;
pub mod gc;
pub mod local;
pub mod quota;
pub mod s3;
pub mod storage;

pub use batch::{BatchProcessor, BatchReply, BatchRequest, BatchResponse};
pub use gc::{GarbageCollector, GcReport};
pub use local::LocalStore;
pub use quota::{QuotaTracker, TransferGate};
pub use s3::S3Store;
pub use storage::{ContentStore, ObjectStream, StoredObject, validate_oid};
