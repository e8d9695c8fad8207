//! The opaque persistence contract: record shapes, DAO traits, and the
//! in-memory reference implementation.

pub mod dao;
pub mod memory;
pub mod records;

pub use dao::{ActionsDao, LfsDao, RepositoryDao, SshKeyDao};
pub use memory::MemoryStore;
pub use records::*;
