//! Mediated execution of the bundled git binary: argument vetting, path
//! confinement, environment filtering, bounded output capture, and deadline
//! enforcement with SIGTERM/SIGKILL escalation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::config::GitConfig;
use crate::errors::{ForgeError, Result};
use crate::git::args::{check_args, check_safe_value};
use crate::git::binary::GitBinary;
use crate::utils::Deadline;

/// Captured result of one git invocation.
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl GitOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Safe executor for the bundled git binary. One instance is built at
/// startup and shared; it is immutable afterwards.
#[derive(Debug, Clone)]
pub struct GitExec {
    binary: GitBinary,
    config: GitConfig,
    repository_root: PathBuf,
}

impl GitExec {
    pub fn new(binary: GitBinary, config: GitConfig) -> Result<Self> {
        let repository_root = std::fs::canonicalize(&config.repository_root)?;
        Ok(Self {
            binary,
            config,
            repository_root,
        })
    }

    pub fn repository_root(&self) -> &Path {
        &self.repository_root
    }

    pub fn binary(&self) -> &GitBinary {
        &self.binary
    }

    /// Canonicalize `repo_path` (resolving symlinks) and require it to lie
    /// under the repository root.
    pub fn confine(&self, repo_path: &Path) -> Result<PathBuf> {
        let canonical = std::fs::canonicalize(repo_path)
            .map_err(|e| ForgeError::InvalidRepository(format!("{}: {e}", repo_path.display())))?;
        if !canonical.starts_with(&self.repository_root) {
            return Err(ForgeError::InvalidRepository(format!(
                "{} escapes repository root",
                repo_path.display()
            )));
        }
        Ok(canonical)
    }

    /// Run git to completion, capturing bounded output. Non-zero exit is
    /// `ProcessFailed`; callers that interpret exit codes themselves use
    /// [`GitExec::run_unchecked`].
    pub async fn run<S: AsRef<str>>(
        &self,
        repo_path: &Path,
        args: &[S],
        env: &[(String, String)],
        deadline: &Deadline,
    ) -> Result<GitOutput> {
        let output = self.run_unchecked(repo_path, args, env, deadline).await?;
        if output.exit_code != 0 {
            return Err(ForgeError::ProcessFailed {
                code: output.exit_code,
                stderr: output.stderr_str(),
            });
        }
        Ok(output)
    }

    /// Run git to completion and return stdout/stderr/exit verbatim.
    pub async fn run_unchecked<S: AsRef<str>>(
        &self,
        repo_path: &Path,
        args: &[S],
        env: &[(String, String)],
        deadline: &Deadline,
    ) -> Result<GitOutput> {
        deadline.check()?;
        let mut child = self.spawn(repo_path, args, env, Stdio::null())?;

        let cap = self.config.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (overflow_tx, mut overflow_rx) = tokio::sync::mpsc::channel::<()>(2);
        let out_task = tokio::spawn(read_capped(stdout, cap, overflow_tx.clone()));
        let err_task = tokio::spawn(read_capped(stderr, cap, overflow_tx));

        let limit = match deadline.remaining() {
            Some(left) => left.min(self.config.command_timeout()),
            None => self.config.command_timeout(),
        };
        let grace = self.config.kill_grace();
        let timeout_sleep = tokio::time::sleep(limit);
        tokio::pin!(timeout_sleep);

        let mut overflowed = false;
        let mut timed_out = false;
        let mut killed = false;
        let status = loop {
            tokio::select! {
                res = child.wait() => break res?,
                _ = overflow_rx.recv(), if !killed => overflowed = true,
                _ = &mut timeout_sleep, if !killed => timed_out = true,
            }
            // Reached only when a limit fired; the child is still running.
            killed = true;
            terminate(&mut child, grace).await;
        };

        let (stdout, out_over) = out_task.await.unwrap_or_default();
        let (stderr, err_over) = err_task.await.unwrap_or_default();

        if timed_out {
            return Err(ForgeError::Timeout(limit));
        }
        if overflowed || out_over || err_over {
            return Err(ForgeError::OutputTooLarge(cap));
        }

        let exit_code = status.code().unwrap_or(-1);
        Ok(GitOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Spawn git with piped stdio for callers that bridge the streams
    /// themselves (the SSH session bridge). The same filters and confinement
    /// apply; the child is killed if its handle is dropped.
    pub fn spawn_streaming<S: AsRef<str>>(
        &self,
        repo_path: &Path,
        args: &[S],
        env: &[(String, String)],
    ) -> Result<Child> {
        self.spawn(repo_path, args, env, Stdio::piped())
    }

    fn spawn<S: AsRef<str>>(
        &self,
        repo_path: &Path,
        args: &[S],
        env: &[(String, String)],
        stdin: Stdio,
    ) -> Result<Child> {
        check_args(args)?;
        let repo_path = self.confine(repo_path)?;

        let mut cmd = Command::new(self.binary.path());
        cmd.env_clear();
        for key in ["HOME", "USER", "LANG", "LC_ALL"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("PATH", "/usr/bin:/bin");
        for (key, value) in env {
            check_safe_value(key)?;
            check_safe_value(value)?;
            cmd.env(key, value);
        }

        cmd.current_dir(&repo_path)
            .args(args.iter().map(|a| a.as_ref()))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            repo = %repo_path.display(),
            argv = ?args.iter().map(|a| a.as_ref()).collect::<Vec<_>>(),
            "spawning git"
        );
        cmd.spawn().map_err(ForgeError::Io)
    }
}

/// SIGTERM, a grace period, then SIGKILL.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a child we spawned and still hold a handle to.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    let done = tokio::time::timeout(grace, child.wait()).await.is_ok();
    if !done {
        let _ = child.start_kill();
    }
}

/// Read from an optional pipe into a buffer capped at `cap` bytes. When the
/// cap is crossed the overflow channel fires and reading stops so the parent
/// can kill the writer.
async fn read_capped(
    stream: Option<impl tokio::io::AsyncRead + Unpin>,
    cap: usize,
    overflow: tokio::sync::mpsc::Sender<()>,
) -> (Vec<u8>, bool) {
    let Some(mut stream) = stream else {
        return (Vec::new(), false);
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return (buf, false),
            Ok(n) => {
                if buf.len() + n > cap {
                    let _ = overflow.send(()).await;
                    return (buf, true);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}
