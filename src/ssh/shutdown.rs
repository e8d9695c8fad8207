//! Listener lifecycle management. Once shutdown is initiated the manager
//! never accepts another connection; live sessions get a grace window before
//! the state settles at stopped.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Lifecycle states of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Running,
            1 => LifecycleState::Draining,
            _ => LifecycleState::Stopped,
        }
    }
}

/// Tracks listener state and the number of live sessions.
#[derive(Debug, Default)]
pub struct LifecycleManager {
    state: AtomicU8,
    active_sessions: AtomicUsize,
    shutdown_notify: Notify,
    idle_notify: Notify,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Hard invariant: false forever once shutdown has been initiated.
    pub fn should_accept_connection(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Move running → draining. Idempotent; a stopped manager stays stopped.
    pub fn initiate_shutdown(&self) {
        let _ = self.state.compare_exchange(
            LifecycleState::Running as u8,
            LifecycleState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.shutdown_notify.notify_waiters();
    }

    /// Settle at stopped after draining finishes.
    pub fn mark_stopped(&self) {
        self.state
            .store(LifecycleState::Stopped as u8, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Resolves once shutdown has been initiated.
    pub async fn wait_for_shutdown(&self) {
        loop {
            // Register interest before the check so a notify between the
            // check and the await cannot be missed.
            let notified = self.shutdown_notify.notified();
            if self.state() != LifecycleState::Running {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once no sessions remain.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if self.active_sessions.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn session_closed(&self) {
        let previous = self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        if previous <= 1 {
            self.idle_notify.notify_waiters();
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// should_accept_connection is false forever after initiate_shutdown,
    /// and the state is draining or stopped.
    #[test]
    fn shutdown_is_permanent() {
        let manager = LifecycleManager::new();
        assert!(manager.should_accept_connection());
        assert_eq!(manager.state(), LifecycleState::Running);

        manager.initiate_shutdown();
        assert!(!manager.should_accept_connection());
        assert!(matches!(
            manager.state(),
            LifecycleState::Draining | LifecycleState::Stopped
        ));

        // Repeated initiation does not resurrect the listener.
        manager.initiate_shutdown();
        assert!(!manager.should_accept_connection());

        manager.mark_stopped();
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert!(!manager.should_accept_connection());

        manager.initiate_shutdown();
        assert_eq!(manager.state(), LifecycleState::Stopped);
    }

    /// wait_for_idle resolves when the last session closes.
    #[tokio::test]
    async fn idle_wait_resolves() {
        let manager = Arc::new(LifecycleManager::new());
        manager.session_opened();
        manager.session_opened();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_for_idle().await })
        };

        manager.session_closed();
        assert_eq!(manager.active_sessions(), 1);
        manager.session_closed();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("idle wait should resolve")
            .unwrap();
    }

    /// wait_for_shutdown resolves after initiation.
    #[tokio::test]
    async fn shutdown_wait_resolves() {
        let manager = Arc::new(LifecycleManager::new());
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_for_shutdown().await })
        };
        // Give the waiter a chance to park before notifying.
        tokio::task::yield_now().await;
        manager.initiate_shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("shutdown wait should resolve")
            .unwrap();
    }
}
