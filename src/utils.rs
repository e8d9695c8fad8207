//! Shared utilities: the cooperative `Deadline` token threaded through every
//! blocking operation, and small hashing helpers used across components.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::errors::{ForgeError, Result};

/// Hex-encoded SHA-256 of the given bytes, lowercase.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Cooperative deadline and cancellation token.
///
/// Cloned freely; all clones observe the same cancellation flag. Components
/// call [`Deadline::check`] at each suspension point and use
/// [`Deadline::remaining`] to bound individual waits. Expiry and explicit
/// cancellation are both reported as [`ForgeError::Timeout`].
#[derive(Clone, Debug)]
pub struct Deadline {
    expires_at: Option<Instant>,
    started_at: Instant,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    /// A deadline that never expires, cancellable only explicitly.
    pub fn none() -> Self {
        Self {
            expires_at: None,
            started_at: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A deadline expiring after `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + timeout),
            started_at: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel every clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the token is cancelled or past its expiry.
    pub fn is_expired(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Error out if the deadline has passed. Called at suspension points.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(ForgeError::Timeout(self.started_at.elapsed()))
        } else {
            Ok(())
        }
    }

    /// Time left before expiry. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Run a future, racing it against the remaining time on this token.
    pub async fn bound<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        self.check()?;
        match self.remaining() {
            Some(left) => tokio::time::timeout(left, fut)
                .await
                .map_err(|_| ForgeError::Timeout(self.started_at.elapsed())),
            None => Ok(fut.await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An unbounded deadline never expires on its own.
    #[test]
    fn none_does_not_expire() {
        let d = Deadline::none();
        assert!(!d.is_expired());
        assert!(d.check().is_ok());
        assert!(d.remaining().is_none());
    }

    /// Cancellation propagates to every clone.
    #[test]
    fn cancel_reaches_clones() {
        let d = Deadline::none();
        let clone = d.clone();
        d.cancel();
        assert!(clone.is_expired());
        assert!(matches!(clone.check(), Err(ForgeError::Timeout(_))));
    }

    /// A zero-length deadline is immediately expired.
    #[test]
    fn zero_deadline_expires() {
        let d = Deadline::after(Duration::ZERO);
        assert!(d.is_expired());
    }

    /// bound() times out a future that outlives the deadline.
    #[tokio::test]
    async fn bound_times_out() {
        let d = Deadline::after(Duration::from_millis(20));
        let res = d
            .bound(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(matches!(res, Err(ForgeError::Timeout(_))));
    }

    /// sha256_hex produces the well-known empty-input digest.
    #[test]
    fn sha256_hex_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
