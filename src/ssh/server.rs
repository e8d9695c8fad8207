//! SSH transport for the git smart protocol: public-key authentication
//! against the key store, per-IP rate limiting, single-exec command
//! dispatch, and stdio bridging between the channel and the mediated git
//! server-side programs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use rand_core::OsRng;
use russh::keys::ssh_key::PublicKey;
use russh::server::{Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};

use crate::config::SshConfig;
use crate::errors::{ForgeError, Result};
use crate::git::{GitExec, RepoLocator};
use crate::protocol::{PushSniffer, RefUpdate};
use crate::ssh::command::SshCommand;
use crate::ssh::keys::{fingerprint, is_accepted_algorithm};
use crate::ssh::limiter::RateLimiter;
use crate::ssh::shutdown::LifecycleManager;
use crate::store::dao::{RepositoryDao, SshKeyDao};
use crate::store::records::{Repository, UserId};

/// Invoked after a successful receive-pack with the parsed ref updates.
/// The Actions trigger path implements this.
#[async_trait]
pub trait PushHook: Send + Sync {
    async fn on_push(
        &self,
        repo: &Repository,
        pusher: UserId,
        updates: &[RefUpdate],
    ) -> Result<()>;
}

struct Shared {
    config: SshConfig,
    git: Arc<GitExec>,
    locator: RepoLocator,
    keys: Arc<dyn SshKeyDao>,
    repos: Arc<dyn RepositoryDao>,
    limiter: Arc<RateLimiter>,
    lifecycle: Arc<LifecycleManager>,
    session_slots: Arc<Semaphore>,
    push_hook: Option<Arc<dyn PushHook>>,
    shutdown_tx: watch::Sender<bool>,
}

/// The SSH listener. Owns the shared state; one instance serves one bound
/// address for the lifetime of the process.
pub struct SshServer {
    shared: Arc<Shared>,
}

impl SshServer {
    pub fn new(
        config: SshConfig,
        git: Arc<GitExec>,
        locator: RepoLocator,
        keys: Arc<dyn SshKeyDao>,
        repos: Arc<dyn RepositoryDao>,
        push_hook: Option<Arc<dyn PushHook>>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_attempts,
            std::time::Duration::from_secs(config.rate_limit_window_secs),
        ));
        let session_slots = Arc::new(Semaphore::new(config.max_sessions));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                git,
                locator,
                keys,
                repos,
                limiter,
                lifecycle: Arc::new(LifecycleManager::new()),
                session_slots,
                push_hook,
                shutdown_tx,
            }),
        }
    }

    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        self.shared.lifecycle.clone()
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.shared.limiter.clone()
    }

    /// Bind the configured address and serve until shutdown is initiated.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.shared.config.host, self.shared.config.port);
        let socket = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "ssh listener bound");
        self.run_on_listener(socket).await
    }

    /// Serve on an already-bound listener. Returns after draining.
    pub async fn run_on_listener(&self, socket: TcpListener) -> Result<()> {
        let config = Arc::new(self.russh_config()?);
        let lifecycle = self.shared.lifecycle.clone();

        // Periodic eviction of aged-out limiter entries.
        let sweeper = {
            let limiter = self.shared.limiter.clone();
            let period = std::time::Duration::from_secs(
                self.shared.config.rate_limit_window_secs.max(1),
            );
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    limiter.sweep();
                }
            })
        };

        let mut acceptor = Acceptor {
            shared: self.shared.clone(),
        };
        tokio::select! {
            res = acceptor.run_on_socket(config, &socket) => {
                sweeper.abort();
                lifecycle.mark_stopped();
                return res.map_err(|e| ForgeError::BackendError(format!("ssh listener: {e}")));
            }
            _ = lifecycle.wait_for_shutdown() => {
                tracing::info!("ssh listener draining");
            }
        }

        // Dropping the accept future above stopped new connections; give the
        // live sessions their grace window, then cut the bridges.
        let grace = self.shared.config.shutdown_grace();
        if tokio::time::timeout(grace, lifecycle.wait_for_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = lifecycle.active_sessions(),
                "grace window elapsed, terminating sessions"
            );
        }
        let _ = self.shared.shutdown_tx.send(true);
        sweeper.abort();
        lifecycle.mark_stopped();
        Ok(())
    }

    fn russh_config(&self) -> Result<russh::server::Config> {
        let mut host_keys = Vec::new();
        for path in &self.shared.config.host_key_paths {
            let key = russh::keys::load_secret_key(path, None)
                .map_err(|e| ForgeError::BackendError(format!("host key {}: {e}", path.display())))?;
            host_keys.push(key);
        }
        if host_keys.is_empty() {
            let key =
                russh::keys::PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519)
                    .map_err(|e| ForgeError::BackendError(format!("host key generation: {e}")))?;
            host_keys.push(key);
        }

        Ok(russh::server::Config {
            auth_rejection_time: std::time::Duration::from_secs(3),
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            inactivity_timeout: Some(std::time::Duration::from_secs(600)),
            keys: host_keys,
            ..Default::default()
        })
    }
}

struct Acceptor {
    shared: Arc<Shared>,
}

impl russh::server::Server for Acceptor {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<std::net::SocketAddr>) -> Self::Handler {
        let permit = self.shared.session_slots.clone().try_acquire_owned().ok();
        let counted = permit.is_some();
        if counted {
            self.shared.lifecycle.session_opened();
        }
        SshSession {
            shared: self.shared.clone(),
            peer: peer_addr.map(|a| a.ip()),
            connected_at: Instant::now(),
            authed: None,
            exec_used: false,
            permit,
            counted,
            channels: HashMap::new(),
        }
    }
}

/// Per-connection handler state.
pub struct SshSession {
    shared: Arc<Shared>,
    peer: Option<IpAddr>,
    connected_at: Instant,
    authed: Option<AuthedUser>,
    exec_used: bool,
    permit: Option<OwnedSemaphorePermit>,
    counted: bool,
    channels: HashMap<ChannelId, ChannelBridge>,
}

#[derive(Clone)]
struct AuthedUser {
    user_id: UserId,
    fingerprint: String,
}

struct ChannelBridge {
    stdin: Option<tokio::process::ChildStdin>,
    sniffer: Option<Arc<Mutex<PushSniffer>>>,
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.counted {
            self.shared.lifecycle.session_closed();
        }
    }
}

impl SshSession {
    fn reject(continue_with_publickey: bool) -> Auth {
        let proceed = continue_with_publickey
            .then(|| MethodSet::from(&[MethodKind::PublicKey][..]));
        Auth::Reject {
            proceed_with_methods: proceed,
            partial_success: false,
        }
    }

    fn record_failure(&self) {
        if let Some(ip) = self.peer {
            self.shared.limiter.record_failure(ip);
        }
    }

    /// Gate applied to every auth attempt: lifecycle, capacity, handshake
    /// deadline, and the per-IP rate limit. Indistinguishable rejections.
    fn auth_gate(&self) -> std::result::Result<(), Auth> {
        if !self.shared.lifecycle.should_accept_connection() {
            return Err(Self::reject(false));
        }
        if self.permit.is_none() {
            tracing::debug!("session refused: worker pool saturated");
            return Err(Self::reject(false));
        }
        if self.connected_at.elapsed() > self.shared.config.handshake_timeout() {
            tracing::debug!("session refused: handshake deadline exceeded");
            return Err(Self::reject(false));
        }
        if let Some(ip) = self.peer
            && self.shared.limiter.check(ip).is_err()
        {
            tracing::debug!(%ip, "session refused: rate limited");
            return Err(Self::reject(false));
        }
        Ok(())
    }

    async fn lookup_key(&self, key: &PublicKey) -> Option<(UserId, String)> {
        if !is_accepted_algorithm(&key.algorithm()) {
            return None;
        }
        let print = fingerprint(key);
        match self.shared.keys.key_by_fingerprint(&print).await {
            Ok(Some(record)) => Some((record.user_id, print)),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(error = %e, "key lookup failed");
                None
            }
        }
    }

    fn fail_channel(
        &self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), russh::Error> {
        self.record_failure();
        session.channel_failure(channel)?;
        session.disconnect(russh::Disconnect::ByApplication, "request rejected", "")?;
        Ok(())
    }
}

impl russh::server::Handler for SshSession {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> std::result::Result<Auth, Self::Error> {
        Ok(Self::reject(true))
    }

    async fn auth_password(
        &mut self,
        _user: &str,
        _password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        // Password auth is never supported; the attempt still costs budget.
        self.record_failure();
        Ok(Self::reject(true))
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if let Err(rejection) = self.auth_gate() {
            return Ok(rejection);
        }
        match self.lookup_key(public_key).await {
            Some(_) => Ok(Auth::Accept),
            None => {
                self.record_failure();
                Ok(Self::reject(true))
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if let Err(rejection) = self.auth_gate() {
            return Ok(rejection);
        }
        // The signature over the session identifier has been verified by the
        // transport at this point; what remains is binding it to a user.
        match self.lookup_key(public_key).await {
            Some((user_id, print)) => {
                tracing::info!(ssh_user = %user, user_id, fingerprint = %print, "ssh auth ok");
                self.authed = Some(AuthedUser {
                    user_id,
                    fingerprint: print,
                });
                Ok(Auth::Accept)
            }
            None => {
                self.record_failure();
                Ok(Self::reject(false))
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(self.authed.is_some())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        // Interactive shells are rejected outright.
        self.fail_channel(channel, session)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.fail_channel(channel, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let Some(authed) = self.authed.clone() else {
            return self.fail_channel(channel, session);
        };
        if self.exec_used {
            // Exactly one exec request per session.
            return self.fail_channel(channel, session);
        }
        self.exec_used = true;

        let line = String::from_utf8_lossy(data);
        let command = match SshCommand::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(error = %e, "bad exec request");
                return self.fail_channel(channel, session);
            }
        };

        let repo = match self
            .shared
            .repos
            .repository_by_path(&command.owner, &command.repo)
            .await
        {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                tracing::debug!(owner = %command.owner, repo = %command.repo, "unknown repository");
                return self.fail_channel(channel, session);
            }
            Err(e) => {
                tracing::error!(error = %e, "repository lookup failed");
                return self.fail_channel(channel, session);
            }
        };

        let access = match self.shared.repos.access_for(authed.user_id, &repo).await {
            Ok(access) => access,
            Err(e) => {
                tracing::error!(error = %e, "access lookup failed");
                return self.fail_channel(channel, session);
            }
        };
        if access < command.service.required_access() {
            tracing::info!(
                user_id = authed.user_id,
                repo = %repo.name,
                service = command.service.as_str(),
                "permission denied"
            );
            return self.fail_channel(channel, session);
        }

        let repo_path = match self.shared.locator.locate(&command.owner, &command.repo) {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!(error = %e, "repository path rejected");
                return self.fail_channel(channel, session);
            }
        };
        let Some(path_str) = repo_path.to_str() else {
            return self.fail_channel(channel, session);
        };

        tracing::info!(
            user_id = authed.user_id,
            fingerprint = %authed.fingerprint,
            service = command.service.as_str(),
            repo = %repo.name,
            "dispatching git service"
        );
        let args = vec![command.service.subcommand().to_string(), path_str.to_string()];
        let mut child = match self.shared.git.spawn_streaming(&repo_path, &args, &[]) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, kind = e.kind(), "failed to start git service");
                return self.fail_channel(channel, session);
            }
        };

        let stdin = child.stdin.take();
        let sniffer = command
            .service
            .is_push()
            .then(|| Arc::new(Mutex::new(PushSniffer::new())));
        self.channels.insert(
            channel,
            ChannelBridge {
                stdin,
                sniffer: sniffer.clone(),
            },
        );

        let handle = session.handle();
        let shared = self.shared.clone();
        let service = command.service;
        let pusher = authed.user_id;
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut stdout = child.stdout.take();
            let mut stderr = child.stderr.take();

            let io = async {
                let out = pump_stdout(&handle, channel, &mut stdout);
                let err = pump_stderr(&handle, channel, &mut stderr);
                tokio::join!(out, err);
            };
            let wait_for_shutdown = async {
                loop {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            };
            tokio::select! {
                _ = io => {}
                _ = wait_for_shutdown => {
                    crate::git::exec::terminate(&mut child, std::time::Duration::from_secs(1))
                        .await;
                }
            }
            let status = child.wait().await;

            let code = match status {
                Ok(status) => status.code().unwrap_or(128 + libc::SIGTERM) as u32,
                Err(e) => {
                    tracing::warn!(error = %e, "wait on git service failed");
                    1
                }
            };

            if service.is_push() && code == 0 {
                let updates: Vec<RefUpdate> = sniffer
                    .as_ref()
                    .and_then(|s| s.lock().ok().map(|s| s.updates().to_vec()))
                    .unwrap_or_default();
                if let Some(hook) = &shared.push_hook
                    && !updates.is_empty()
                    && let Err(e) = hook.on_push(&repo, pusher, &updates).await
                {
                    tracing::error!(error = %e, repo = %repo.name, "push hook failed");
                }
            }

            // Exit status is only sent after the subprocess has exited.
            let _ = handle.exit_status_request(channel, code).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });

        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if !self.channels.contains_key(&channel) {
            return Ok(());
        }

        let sniffer = self.channels.get(&channel).and_then(|b| b.sniffer.clone());
        if let Some(sniffer) = sniffer {
            let fed = match sniffer.lock() {
                Ok(mut sniffer) => sniffer.feed(data).is_ok(),
                Err(_) => false,
            };
            if !fed {
                // Malformed pkt framing closes the connection.
                self.channels.remove(&channel);
                self.record_failure();
                session.disconnect(russh::Disconnect::ProtocolError, "malformed packet", "")?;
                return Ok(());
            }
        }

        let write_failed = match self.channels.get_mut(&channel).and_then(|b| b.stdin.as_mut()) {
            Some(stdin) => stdin.write_all(data).await.is_err(),
            None => false,
        };
        if write_failed
            && let Some(bridge) = self.channels.get_mut(&channel)
        {
            // Child went away; drop our end.
            bridge.stdin = None;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some(bridge) = self.channels.get_mut(&channel) {
            // Closing our write end signals EOF to git.
            bridge.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

async fn pump_stdout(
    handle: &russh::server::Handle,
    channel: ChannelId,
    stdout: &mut Option<tokio::process::ChildStdout>,
) {
    let Some(stdout) = stdout.as_mut() else {
        return;
    };
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if handle.data(channel, CryptoVec::from(&buf[..n])).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn pump_stderr(
    handle: &russh::server::Handle,
    channel: ChannelId,
    stderr: &mut Option<tokio::process::ChildStderr>,
) {
    let Some(stderr) = stderr.as_mut() else {
        return;
    };
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if handle
                    .extended_data(channel, 1, CryptoVec::from(&buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
