//! SSH termination for the git smart protocol: public-key authentication,
//! rate limiting, lifecycle management, and command dispatch onto the
//! mediated git binary.

pub mod command;
pub mod keys;
pub mod limiter;
pub mod server;
pub mod shutdown;

pub use command::{GitService, SshCommand};
pub use limiter::{Clock, RateLimiter, SystemClock};
pub use server::{PushHook, SshServer};
pub use shutdown::{LifecycleManager, LifecycleState};
