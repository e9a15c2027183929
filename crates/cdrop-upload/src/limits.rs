//! Per-key rate limiting.
//!
//! Each key (client address, upload id, ...) gets its own governor token
//! bucket, created on first use. Buckets untouched for longer than the idle
//! window are evicted by a background sweep that starts with the first
//! request seen inside a tokio runtime.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cdrop_core::config::LimitsConfig;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sweeper::spawn_periodic;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct Entry {
    limiter: DirectLimiter,
    last_seen: Instant,
}

struct Inner {
    entries: DashMap<String, Entry>,
    quota: Quota,
    idle: Duration,
    sweep_every: Duration,
    sweeper_started: AtomicBool,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("keys", &self.inner.entries.len())
            .field("idle", &self.inner.idle)
            .field("sweeper_started", &self.inner.sweeper_started.load(Ordering::Relaxed))
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter from configuration.
    ///
    /// # Panics
    ///
    /// Panics if `rate_per_second` or `burst` is zero.
    pub fn new(config: &LimitsConfig) -> Self {
        let rate = NonZeroU32::new(config.rate_per_second).expect("rate_per_second must be > 0");
        let burst = NonZeroU32::new(config.burst).expect("burst must be > 0");

        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                quota: Quota::per_second(rate).allow_burst(burst),
                idle: Duration::from_secs(config.idle_secs),
                sweep_every: Duration::from_secs(config.sweep_secs.max(1)),
                sweeper_started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Consume one token for `key`. Returns false when the key is over its
    /// limit.
    pub fn allow(&self, key: &str) -> bool {
        self.ensure_sweeper();

        let mut entry = self
            .inner
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                limiter: governor::RateLimiter::direct(self.inner.quota),
                last_seen: Instant::now(),
            });
        entry.last_seen = Instant::now();
        let allowed = entry.limiter.check().is_ok();
        if !allowed {
            debug!(key, "rate limit exceeded");
        }
        allowed
    }

    /// Drop entries idle for longer than the configured window.
    pub fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Stop the background sweep. Limiting itself keeps working.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn ensure_sweeper(&self) {
        if self.inner.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            self.inner.sweeper_started.store(false, Ordering::Release);
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        spawn_periodic(
            "rate-limiter-sweep",
            self.inner.sweep_every,
            self.inner.cancel.clone(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep_idle();
                }
                std::future::ready(())
            },
        );
    }
}

impl Inner {
    fn sweep_idle(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_seen.elapsed() <= self.idle);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!(removed, "idle rate limiter entries evicted");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(&LimitsConfig::default())
    }

    #[test]
    fn test_burst_then_denied() {
        let l = limiter();
        for _ in 0..4 {
            assert!(l.allow("10.0.0.1"));
        }
        assert!(!l.allow("10.0.0.1"));
    }

    #[test]
    fn test_keys_are_independent() {
        let l = limiter();
        for _ in 0..4 {
            assert!(l.allow("a"));
        }
        assert!(!l.allow("a"));
        assert!(l.allow("b"));
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn test_refill_after_one_second() {
        let l = limiter();
        for _ in 0..4 {
            assert!(l.allow("k"));
        }
        assert!(!l.allow("k"));

        std::thread::sleep(Duration::from_millis(1100));
        assert!(l.allow("k"));
    }

    #[test]
    fn test_sweep_evicts_idle_entries() {
        let l = RateLimiter::new(&LimitsConfig {
            idle_secs: 1,
            ..LimitsConfig::default()
        });
        l.allow("old");
        std::thread::sleep(Duration::from_millis(1100));
        l.allow("fresh");

        assert_eq!(l.sweep_idle(), 1);
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn test_no_sweeper_without_runtime() {
        let l = limiter();
        l.allow("k");
        assert!(!l.inner.sweeper_started.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_sweeper_starts_once_in_runtime() {
        let l = limiter();
        l.allow("k");
        l.allow("k");
        assert!(l.inner.sweeper_started.load(Ordering::Acquire));

        l.stop();
        assert!(l.cancellation_token().is_cancelled());
    }

    #[test]
    #[should_panic(expected = "burst must be > 0")]
    fn test_zero_burst_panics() {
        RateLimiter::new(&LimitsConfig {
            burst: 0,
            ..LimitsConfig::default()
        });
    }
}
