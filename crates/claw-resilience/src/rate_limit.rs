//! Sliding-window admission control.
//!
//! Each key owns an ordered list of admission timestamps. Every operation
//! first drops timestamps that fell out of the trailing window, so a bucket
//! never holds more than `max_requests` entries regardless of call volume.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Result of [`SlidingWindowRateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request was admitted and recorded.
    pub allowed: bool,
    /// Admissions left in the current window after this decision.
    pub remaining: u32,
    /// Time until another admission is possible. Zero if one is possible now.
    pub retry_after: Duration,
}

/// Admission timestamps for one key, oldest first.
#[derive(Debug, Default)]
struct Bucket {
    timestamps: VecDeque<Instant>,
}

impl Bucket {
    fn prune(&mut self, now: Instant, window: Duration) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while self.timestamps.front().is_some_and(|t| *t < cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn count(&self) -> u32 {
        u32::try_from(self.timestamps.len()).unwrap_or(u32::MAX)
    }

    fn retry_after(&self, now: Instant, config: &RateLimitConfig) -> Duration {
        if config.max_requests == 0 {
            return config.window;
        }
        if self.count() < config.max_requests {
            return Duration::ZERO;
        }
        self.timestamps
            .front()
            .map_or(Duration::ZERO, |oldest| {
                (*oldest + config.window).saturating_duration_since(now)
            })
    }
}

/// Per-key sliding-window rate limiter.
///
/// Admission holds the key map's read lock while it records into a bucket,
/// and each bucket is serialized by its own mutex, so different keys never
/// contend with each other.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter<K> {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<K, Arc<Mutex<Bucket>>>>,
}

impl<K> SlidingWindowRateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    /// Create a new rate limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// The limiter's configuration.
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn bucket(&self, key: &K) -> Option<Arc<Mutex<Bucket>>> {
        self.buckets.read().get(key).cloned()
    }

    /// Try to admit one request for `key`, recording it if admitted.
    pub fn try_acquire(&self, key: &K) -> bool {
        self.check(key).allowed
    }

    /// Try to admit one request and report the bucket state afterwards.
    pub fn check(&self, key: &K) -> RateLimitDecision {
        if self.config.max_requests == 0 {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after: self.config.window,
            };
        }

        loop {
            // Recording under the map read lock keeps cleanup() and reset()
            // from dropping the bucket between lookup and insert.
            {
                let buckets = self.buckets.read();
                if let Some(bucket) = buckets.get(key) {
                    return self.record(&mut bucket.lock());
                }
            }
            self.buckets.write().entry(key.clone()).or_default();
        }
    }

    fn record(&self, bucket: &mut Bucket) -> RateLimitDecision {
        let now = Instant::now();
        bucket.prune(now, self.config.window);

        let allowed = bucket.count() < self.config.max_requests;
        if allowed {
            bucket.timestamps.push_back(now);
        } else {
            debug!(
                count = bucket.count(),
                max_requests = self.config.max_requests,
                "rate limit exceeded"
            );
        }

        RateLimitDecision {
            allowed,
            remaining: self.config.max_requests.saturating_sub(bucket.count()),
            retry_after: bucket.retry_after(now, &self.config),
        }
    }

    /// Admissions left for `key` in the current window.
    ///
    /// An unknown key reports the full `max_requests`.
    pub fn remaining(&self, key: &K) -> u32 {
        let Some(bucket) = self.bucket(key) else {
            return self.config.max_requests;
        };
        let mut bucket = bucket.lock();
        bucket.prune(Instant::now(), self.config.window);
        self.config.max_requests.saturating_sub(bucket.count())
    }

    /// Time until `key` may be admitted again.
    pub fn retry_after(&self, key: &K) -> Duration {
        let Some(bucket) = self.bucket(key) else {
            return if self.config.max_requests == 0 {
                self.config.window
            } else {
                Duration::ZERO
            };
        };
        let mut bucket = bucket.lock();
        let now = Instant::now();
        bucket.prune(now, self.config.window);
        bucket.retry_after(now, &self.config)
    }

    /// Clear one key's history.
    pub fn reset(&self, key: &K) {
        self.buckets.write().remove(key);
    }

    /// Clear all history.
    pub fn reset_all(&self) {
        self.buckets.write().clear();
    }

    /// Number of keys with a bucket.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.read().len()
    }

    /// Drop buckets whose every timestamp has left the window.
    ///
    /// Returns the number of buckets removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let mut bucket = bucket.lock();
            bucket.prune(now, window);
            !bucket.timestamps.is_empty()
        });
        before - buckets.len()
    }
}

impl<K> Default for SlidingWindowRateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(max_requests: u32, window_ms: u64) -> SlidingWindowRateLimiter<String> {
        SlidingWindowRateLimiter::new(RateLimitConfig::new(
            max_requests,
            Duration::from_millis(window_ms),
        ))
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    // ==================== Acquire Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_acquire_allows_up_to_limit() {
        let limiter = limiter(3, 1000);
        let alice = key("alice");

        assert!(limiter.try_acquire(&alice));
        assert!(limiter.try_acquire(&alice));
        assert!(limiter.try_acquire(&alice));
        assert!(!limiter.try_acquire(&alice));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_recovers_after_window() {
        let limiter = limiter(3, 1000);
        let alice = key("alice");

        for _ in 0..3 {
            assert!(limiter.try_acquire(&alice));
        }
        assert!(!limiter.try_acquire(&alice));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!limiter.try_acquire(&alice));

        tokio::time::advance(Duration::from_millis(501)).await;
        assert!(limiter.try_acquire(&alice));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_rejected_does_not_record() {
        let limiter = limiter(1, 1000);
        let alice = key("alice");

        assert!(limiter.try_acquire(&alice));
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!limiter.try_acquire(&alice));

        // The rejection at +600ms must not extend the window.
        tokio::time::advance(Duration::from_millis(401)).await;
        assert!(limiter.try_acquire(&alice));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_zero_max_always_rejects() {
        let limiter = limiter(0, 1000);
        let alice = key("alice");

        assert!(!limiter.try_acquire(&alice));
        assert_eq!(limiter.remaining(&alice), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!limiter.try_acquire(&alice));
        assert_eq!(limiter.remaining(&alice), 0);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_keys_are_independent() {
        let limiter = limiter(2, 1000);
        let alice = key("alice");
        let bob = key("bob");

        assert!(limiter.try_acquire(&alice));
        assert!(limiter.try_acquire(&alice));
        assert!(!limiter.try_acquire(&alice));

        assert!(limiter.try_acquire(&bob));
        assert_eq!(limiter.remaining(&bob), 1);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    // ==================== Remaining Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_remaining_decreases_and_recovers() {
        let limiter = limiter(3, 1000);
        let alice = key("alice");

        assert_eq!(limiter.remaining(&alice), 3);
        limiter.try_acquire(&alice);
        assert_eq!(limiter.remaining(&alice), 2);
        limiter.try_acquire(&alice);
        assert_eq!(limiter.remaining(&alice), 1);
        limiter.try_acquire(&alice);
        assert_eq!(limiter.remaining(&alice), 0);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(limiter.remaining(&alice), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_unknown_key_is_full() {
        let limiter = limiter(7, 1000);
        assert_eq!(limiter.remaining(&key("nobody")), 7);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    // ==================== Retry After Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_tracks_oldest_entry() {
        let limiter = limiter(2, 1000);
        let alice = key("alice");

        assert_eq!(limiter.retry_after(&alice), Duration::ZERO);
        limiter.try_acquire(&alice);
        tokio::time::advance(Duration::from_millis(300)).await;
        limiter.try_acquire(&alice);

        assert_eq!(limiter.retry_after(&alice), Duration::from_millis(700));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(limiter.retry_after(&alice), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reports_decision() {
        let limiter = limiter(2, 1000);
        let alice = key("alice");

        let first = limiter.check(&alice);
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.retry_after, Duration::ZERO);

        let second = limiter.check(&alice);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        assert_eq!(second.retry_after, Duration::from_millis(1000));

        let third = limiter.check(&alice);
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert!(third.retry_after > Duration::ZERO);
    }

    // ==================== Reset Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_reset_single_key() {
        let limiter = limiter(1, 1000);
        let alice = key("alice");
        let bob = key("bob");

        limiter.try_acquire(&alice);
        limiter.try_acquire(&bob);
        limiter.reset(&alice);

        assert!(limiter.try_acquire(&alice));
        assert!(!limiter.try_acquire(&bob));

        // Unknown key is a no-op.
        limiter.reset(&key("carol"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all() {
        let limiter = limiter(1, 1000);
        limiter.try_acquire(&key("alice"));
        limiter.try_acquire(&key("bob"));
        assert_eq!(limiter.tracked_keys(), 2);

        limiter.reset_all();
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.try_acquire(&key("alice")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_idle_buckets() {
        let limiter = limiter(5, 1000);
        limiter.try_acquire(&key("alice"));
        tokio::time::advance(Duration::from_millis(600)).await;
        limiter.try_acquire(&key("bob"));
        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(limiter.cleanup(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.remaining(&key("bob")), 4);
    }

    #[test]
    fn test_default_config() {
        let limiter: SlidingWindowRateLimiter<u64> = SlidingWindowRateLimiter::default();
        assert_eq!(limiter.config().max_requests, 100);
        assert_eq!(limiter.config().window, Duration::from_secs(60));
    }

    // ==================== Concurrency Tests ====================

    #[test]
    fn test_concurrent_acquire_is_exact() {
        let limiter = Arc::new(SlidingWindowRateLimiter::new(RateLimitConfig::new(
            50,
            Duration::from_secs(60),
        )));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20).filter(|_| limiter.try_acquire(&1u32)).count()
                })
            })
            .collect();

        let admitted: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .sum();
        assert_eq!(admitted, 50);
        assert_eq!(limiter.remaining(&1u32), 0);
    }

    #[test]
    fn test_cleanup_racing_acquire_never_over_admits() {
        use std::sync::atomic::{AtomicBool, Ordering};

        const KEYS: u32 = 2000;
        let limiter = Arc::new(SlidingWindowRateLimiter::new(RateLimitConfig::new(
            1,
            Duration::from_secs(60),
        )));
        let done = Arc::new(AtomicBool::new(false));

        let sweeper = {
            let limiter = Arc::clone(&limiter);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    limiter.cleanup();
                }
            })
        };

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..KEYS)
                        .filter(|k| limiter.try_acquire(k))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut admitted = vec![0u32; KEYS as usize];
        for handle in handles {
            for k in handle.join().unwrap_or_default() {
                admitted[k as usize] += 1;
            }
        }
        done.store(true, Ordering::SeqCst);
        let _ = sweeper.join();

        assert!(admitted.iter().all(|&n| n == 1));
    }

    // ==================== Property Tests ====================

    proptest! {
        #[test]
        fn prop_bucket_never_exceeds_max(max in 0u32..20, attempts in 0usize..60) {
            let limiter = SlidingWindowRateLimiter::new(RateLimitConfig::new(
                max,
                Duration::from_secs(60),
            ));
            let admitted = (0..attempts).filter(|_| limiter.try_acquire(&"k")).count();
            prop_assert_eq!(admitted, attempts.min(max as usize));
            prop_assert_eq!(limiter.remaining(&"k") as usize, max as usize - admitted);
        }
    }
}
