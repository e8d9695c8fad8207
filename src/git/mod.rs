//! Mediated access to the bundled git binary: argument vetting, one-time
//! binary resolution, confined execution, URL sanitization, and repository
//! path location.

pub mod args;
pub mod binary;
pub mod exec;
pub mod locator;
pub mod url;

pub use binary::GitBinary;
pub use exec::{GitExec, GitOutput};
pub use locator::RepoLocator;
