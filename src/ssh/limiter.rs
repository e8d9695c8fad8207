//! Sliding-window rate limiting of failed authentication attempts, keyed by
//! remote IP. Entries are evicted lazily on access and by a periodic sweep.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::errors::{ForgeError, Result};

/// Clock seam so the window behavior is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Per-IP failure counter over a sliding window. All reads and writes are
/// brief; the map shards internally.
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    table: DashMap<IpAddr, Vec<Instant>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self::with_clock(max_attempts, window, Arc::new(SystemClock))
    }

    pub fn with_clock(max_attempts: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts,
            window,
            table: DashMap::new(),
            clock,
        }
    }

    /// Fail with `RateLimitExceeded` when `addr` has reached the attempt
    /// budget inside the window. Also performs lazy eviction for the entry.
    pub fn check(&self, addr: IpAddr) -> Result<()> {
        if self.failures(addr) >= self.max_attempts {
            Err(ForgeError::RateLimitExceeded)
        } else {
            Ok(())
        }
    }

    /// Record one failed attempt for `addr`.
    pub fn record_failure(&self, addr: IpAddr) {
        let now = self.clock.now();
        let cutoff = now.checked_sub(self.window);
        let mut entry = self.table.entry(addr).or_default();
        if let Some(cutoff) = cutoff {
            entry.retain(|&at| at > cutoff);
        }
        entry.push(now);
    }

    /// Observable failure count currently inside the window.
    pub fn failures(&self, addr: IpAddr) -> u32 {
        let now = self.clock.now();
        let cutoff = now.checked_sub(self.window);
        let Some(mut entry) = self.table.get_mut(&addr) else {
            return 0;
        };
        if let Some(cutoff) = cutoff {
            entry.retain(|&at| at > cutoff);
        }
        entry.len() as u32
    }

    /// Evict entries whose every attempt has aged out of the window. Run
    /// periodically by the server.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        self.table.retain(|_, attempts| {
            attempts.retain(|&at| at > cutoff);
            !attempts.is_empty()
        });
    }

    /// Number of addresses currently tracked.
    pub fn tracked_addrs(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Manually advanced clock for deterministic window tests.
    struct TestClock {
        now: Mutex<Instant>,
    }

    impl TestClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                // Base far enough in the past that cutoff subtraction is
                // always representable.
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    const ADDR: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(203, 0, 113, 9));

    /// After N failures within the window the next check is rejected.
    #[test]
    fn rejects_after_budget() {
        let clock = TestClock::new();
        let limiter = RateLimiter::with_clock(3, Duration::from_secs(60), clock.clone());

        for _ in 0..3 {
            assert!(limiter.check(ADDR).is_ok());
            limiter.record_failure(ADDR);
            clock.advance(Duration::from_secs(1));
        }
        assert!(matches!(
            limiter.check(ADDR),
            Err(ForgeError::RateLimitExceeded)
        ));
    }

    /// After the window passes, attempts are accepted again.
    #[test]
    fn window_slides() {
        let clock = TestClock::new();
        let limiter = RateLimiter::with_clock(2, Duration::from_secs(60), clock.clone());

        limiter.record_failure(ADDR);
        limiter.record_failure(ADDR);
        assert!(limiter.check(ADDR).is_err());

        clock.advance(Duration::from_secs(61));
        assert!(limiter.check(ADDR).is_ok());
        assert_eq!(limiter.failures(ADDR), 0);
    }

    /// The sweep removes fully aged-out tracking entries.
    #[test]
    fn sweep_evicts_entries() {
        let clock = TestClock::new();
        let limiter = RateLimiter::with_clock(2, Duration::from_secs(60), clock.clone());

        limiter.record_failure(ADDR);
        assert_eq!(limiter.tracked_addrs(), 1);

        clock.advance(Duration::from_secs(120));
        limiter.sweep();
        assert_eq!(limiter.tracked_addrs(), 0);
    }

    /// Addresses are tracked independently.
    #[test]
    fn addresses_are_independent() {
        let clock = TestClock::new();
        let limiter = RateLimiter::with_clock(1, Duration::from_secs(60), clock);
        let other: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(198, 51, 100, 1));

        limiter.record_failure(ADDR);
        assert!(limiter.check(ADDR).is_err());
        assert!(limiter.check(other).is_ok());
    }
}
