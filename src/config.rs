use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GitConfig {
    /// Candidate locations for the bundled git binary, tried in order at
    /// startup. The first existing executable wins and is cached.
    pub binary_candidates: Vec<PathBuf>,
    /// Root under which every bare repository must live.
    pub repository_root: PathBuf,
    /// Upper bound on captured stdout/stderr per invocation, in bytes.
    pub max_output_bytes: usize,
    /// Wall-clock limit per invocation.
    pub command_timeout_secs: u64,
    /// Grace between SIGTERM and SIGKILL when a child overruns its deadline.
    pub kill_grace_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary_candidates: vec![
                PathBuf::from("/usr/lib/crucible/bin/git"),
                PathBuf::from("/usr/local/bin/git"),
                PathBuf::from("/usr/bin/git"),
            ],
            repository_root: PathBuf::from("/var/lib/crucible/repositories"),
            max_output_bytes: 16 * 1024 * 1024,
            command_timeout_secs: 360,
            kill_grace_secs: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SshConfig {
    pub enable: bool,
    pub host: String,
    pub port: u16,
    /// Maximum concurrently served sessions; connections past this are
    /// refused at accept.
    pub max_sessions: usize,
    /// Handshake-to-auth deadline per connection.
    pub handshake_timeout_secs: u64,
    /// Failed auth attempts tolerated per remote IP inside the window.
    pub rate_limit_attempts: u32,
    pub rate_limit_window_secs: u64,
    /// Grace given to live sessions once shutdown is initiated.
    pub shutdown_grace_secs: u64,
    /// PEM-encoded host keys; generated ephemerally when empty (tests,
    /// first boot).
    pub host_key_paths: Vec<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: "0.0.0.0".to_string(),
            port: 2222,
            max_sessions: 256,
            handshake_timeout_secs: 10,
            rate_limit_attempts: 10,
            rate_limit_window_secs: 60,
            shutdown_grace_secs: 30,
            host_key_paths: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LfsConfig {
    pub enable: bool,
    /// Root of the filesystem object store.
    pub root: PathBuf,
    /// External base URL embedded into batch action hrefs.
    pub url_base: String,
    /// Seconds an issued action URL stays valid.
    pub action_expires_secs: u64,
    /// Per-repository cumulative storage quota in bytes. Zero disables the
    /// check.
    pub repo_quota_bytes: u64,
    /// Per-owner cumulative storage quota in bytes. Zero disables the check.
    pub owner_quota_bytes: u64,
    /// Concurrent transfers admitted per storage backend before the batch
    /// endpoint answers with a retry-after.
    pub max_concurrent_transfers: usize,
    /// Objects younger than this are never garbage collected.
    pub gc_min_age_secs: u64,
}

impl Default for LfsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            root: PathBuf::from("/var/lib/crucible/lfs"),
            url_base: "https://localhost:3000".to_string(),
            action_expires_secs: 3600,
            repo_quota_bytes: 10 * 1024 * 1024 * 1024,
            owner_quota_bytes: 0,
            max_concurrent_transfers: 32,
            gc_min_age_secs: 24 * 3600,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Key prefix inside the bucket, without trailing slash.
    pub prefix: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Override endpoint for S3-compatible stores; empty selects
    /// `bucket.s3.region.amazonaws.com`.
    pub endpoint: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            prefix: "lfs".to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            endpoint: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActionsConfig {
    pub enable: bool,
    /// Runner heartbeat gap after which the runner is marked offline and its
    /// jobs are reclaimed.
    pub heartbeat_timeout_secs: u64,
    /// Dispatcher poll interval.
    pub dispatch_interval_secs: u64,
    /// Default run timeout when the workflow does not set timeout-minutes.
    pub default_timeout_minutes: u64,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            heartbeat_timeout_secs: 90,
            dispatch_interval_secs: 5,
            default_timeout_minutes: 360,
        }
    }
}

/// Aggregated configuration for the forge core. Loaded once at startup and
/// treated as immutable process-wide state afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ForgeConfig {
    pub git: GitConfig,
    pub ssh: SshConfig,
    pub lfs: LfsConfig,
    pub s3: Option<S3Config>,
    pub actions: ActionsConfig,
}

impl SshConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl GitConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}
