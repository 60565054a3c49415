//! Admission rate limiting
//!
//! Sliding window limiter keyed by principal or network address. It sheds
//! bursts before the quota ledger is reached and is not the source of
//! truth: state is process-local and lost on restart.
//! Uses DashMap so requests for different keys never contend. Sweeps run
//! on the blocking pool when a tokio runtime is available, so the request
//! that triggers one only pays for scheduling it.

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Minimum gap between sweeps forced by the key cap
const FORCED_SWEEP_GAP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// How often idle keys are swept from the hot path
    pub cleanup_interval: Duration,
    /// Soft cap on tracked keys; exceeding it forces a sweep
    pub max_keys: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(5 * 60),
            max_keys: 100_000,
        }
    }
}

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the window after this one
    pub remaining: usize,
    pub limit: usize,
    /// Zero when allowed
    pub retry_after: Duration,
}

struct RateLimitEntry {
    timestamps: VecDeque<Instant>,
    /// Window last used for this key, so sweeps prune by it
    window: Duration,
}

impl RateLimitEntry {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) < self.window {
                break;
            }
            self.timestamps.pop_front();
        }
    }
}

/// Sliding window rate limiter using lock-free DashMap
pub struct RateLimiter {
    entries: Arc<DashMap<String, RateLimitEntry>>,
    config: RateLimiterConfig,
    /// Time of the last sweep; `try_lock`ed so sweeps never block requests
    last_sweep: Mutex<Instant>,
    /// Set while a background sweep is queued or running
    sweeping: Arc<AtomicBool>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
            last_sweep: Mutex::new(Instant::now()),
            sweeping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if a request is allowed and record it if so
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> RateDecision {
        self.check_at(key, limit, window, Instant::now())
    }

    pub fn check_at(&self, key: &str, limit: usize, window: Duration, now: Instant) -> RateDecision {
        self.maybe_sweep(now);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                timestamps: VecDeque::new(),
                window,
            });
        let entry = entry.value_mut();
        entry.window = window;
        entry.prune(now);

        if entry.timestamps.len() >= limit {
            let retry_after = entry
                .timestamps
                .front()
                .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(window);
            warn!(
                key,
                requests = entry.timestamps.len(),
                max = limit,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            return RateDecision {
                allowed: false,
                remaining: 0,
                limit,
                retry_after,
            };
        }

        entry.timestamps.push_back(now);
        RateDecision {
            allowed: true,
            remaining: limit - entry.timestamps.len(),
            limit,
            retry_after: Duration::ZERO,
        }
    }

    /// Requests left for a key without recording one
    pub fn remaining(&self, key: &str, limit: usize, now: Instant) -> usize {
        let count = self
            .entries
            .get(key)
            .map(|entry| {
                entry
                    .timestamps
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < entry.window)
                    .count()
            })
            .unwrap_or(0);
        limit.saturating_sub(count)
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    /// Drop expired timestamps and keys with none left. Returns keys removed.
    pub fn sweep(&self, now: Instant) -> usize {
        sweep_entries(&self.entries, now)
    }

    fn maybe_sweep(&self, now: Instant) {
        let over_capacity = self.entries.len() > self.config.max_keys;

        let mut last = match self.last_sweep.try_lock() {
            Ok(guard) => guard,
            // Another request is sweeping
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("Rate limiter sweep mutex was poisoned, recovering inner value");
                poisoned.into_inner()
            }
        };

        let elapsed = now.saturating_duration_since(*last);
        let due = elapsed >= self.config.cleanup_interval
            || (over_capacity && elapsed >= FORCED_SWEEP_GAP);
        if !due {
            return;
        }
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *last = now;
        drop(last);

        let entries = Arc::clone(&self.entries);
        let sweeping = Arc::clone(&self.sweeping);
        let max_keys = self.config.max_keys;
        let run = move || {
            let removed = sweep_entries(&entries, now);
            debug!(removed, remaining = entries.len(), "Rate limiter sweep");
            if entries.len() > max_keys {
                warn!(
                    keys = entries.len(),
                    max_keys,
                    "Rate limiter over key capacity after sweep"
                );
            }
            sweeping.store(false, Ordering::Release);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(run);
            }
            // No runtime (sync callers): sweep in place
            Err(_) => run(),
        }
    }
}

/// `retain` takes every shard's write lock in turn
fn sweep_entries(entries: &DashMap<String, RateLimitEntry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| {
        entry.prune(now);
        !entry.timestamps.is_empty()
    });
    before.saturating_sub(entries.len())
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

static GLOBAL: OnceCell<Arc<RateLimiter>> = OnceCell::new();

/// Install the process-wide limiter. Later calls return the first instance.
pub fn install_global(config: RateLimiterConfig) -> Arc<RateLimiter> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(RateLimiter::new(config))))
}

pub fn global() -> Option<Arc<RateLimiter>> {
    GLOBAL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(1000);

    #[test]
    fn test_rate_limit_blocks_over_limit() {
        let limiter = RateLimiter::default();
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at("user1", 3, WINDOW, t0).allowed);
        }
        let denied = limiter.check_at("user1", 3, WINDOW, t0);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, WINDOW);

        let later = t0 + Duration::from_millis(1001);
        assert!(limiter.check_at("user1", 3, WINDOW, later).allowed);
    }

    #[test]
    fn test_retry_after_tracks_oldest_request() {
        let limiter = RateLimiter::default();
        let t0 = Instant::now();
        limiter.check_at("user1", 2, WINDOW, t0);
        limiter.check_at("user1", 2, WINDOW, t0 + Duration::from_millis(400));

        let denied = limiter.check_at("user1", 2, WINDOW, t0 + Duration::from_millis(700));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_millis(300));
    }

    #[test]
    fn test_rejections_are_not_recorded() {
        let limiter = RateLimiter::default();
        let t0 = Instant::now();
        assert!(limiter.check_at("user1", 1, WINDOW, t0).allowed);
        for ms in [100, 200, 900] {
            assert!(!limiter.check_at("user1", 1, WINDOW, t0 + Duration::from_millis(ms)).allowed);
        }
        assert!(limiter.check_at("user1", 1, WINDOW, t0 + WINDOW).allowed);
    }

    #[test]
    fn test_rate_limit_per_key() {
        let limiter = RateLimiter::default();
        let t0 = Instant::now();
        assert!(limiter.check_at("user1", 1, WINDOW, t0).allowed);
        assert!(limiter.check_at("user2", 1, WINDOW, t0).allowed); // Different key, allowed
        assert!(!limiter.check_at("user1", 1, WINDOW, t0).allowed);
    }

    #[test]
    fn test_remaining_count() {
        let limiter = RateLimiter::default();
        let t0 = Instant::now();
        assert_eq!(limiter.remaining("user1", 5, t0), 5);

        let decision = limiter.check_at("user1", 5, WINDOW, t0);
        assert_eq!(decision.remaining, 4);
        limiter.check_at("user1", 5, WINDOW, t0);
        limiter.check_at("user1", 5, WINDOW, t0);
        assert_eq!(limiter.remaining("user1", 5, t0), 2);
        assert_eq!(limiter.remaining("user1", 5, t0 + WINDOW), 5);
    }

    #[test]
    fn test_sweep_removes_idle_keys() {
        let limiter = RateLimiter::default();
        let t0 = Instant::now();
        limiter.check_at("short", 5, Duration::from_millis(100), t0);
        limiter.check_at("long", 5, Duration::from_secs(60), t0);

        let removed = limiter.sweep(t0 + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.remaining("long", 5, t0 + Duration::from_secs(1)), 4);
    }

    #[test]
    fn test_interval_sweep_runs_from_hot_path() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            cleanup_interval: Duration::from_secs(10),
            max_keys: 1000,
        });
        let t0 = Instant::now();
        for i in 0..10 {
            limiter.check_at(&format!("ip-{}", i), 5, WINDOW, t0);
        }
        assert_eq!(limiter.tracked_keys(), 10);

        limiter.check_at("late", 5, WINDOW, t0 + Duration::from_secs(11));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_key_cap_forces_sweep() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            cleanup_interval: Duration::from_secs(3600),
            max_keys: 4,
        });
        let t0 = Instant::now();
        for i in 0..6 {
            limiter.check_at(&format!("ip-{}", i), 5, WINDOW, t0);
        }
        assert_eq!(limiter.tracked_keys(), 6);

        limiter.check_at("next", 5, WINDOW, t0 + Duration::from_secs(2));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_sweep_runs_off_the_request_path() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            cleanup_interval: Duration::from_secs(10),
            max_keys: 1000,
        });
        let t0 = Instant::now();
        for i in 0..10 {
            limiter.check_at(&format!("ip-{}", i), 5, WINDOW, t0);
        }

        // The triggering request is admitted without waiting on the sweep
        assert!(limiter.check_at("late", 5, WINDOW, t0 + Duration::from_secs(11)).allowed);

        for _ in 0..200 {
            if limiter.tracked_keys() == 1 && !limiter.sweeping.load(Ordering::Acquire) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(limiter.tracked_keys(), 1);
        assert!(!limiter.sweeping.load(Ordering::Acquire));
    }

    #[test]
    fn test_concurrent_checks_respect_limit() {
        let limiter = Arc::new(RateLimiter::default());
        let t0 = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.check_at("shared", 50, Duration::from_secs(60), t0).allowed)
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }

    #[test]
    fn test_global_is_installed_once() {
        let first = install_global(RateLimiterConfig::default());
        let second = install_global(RateLimiterConfig {
            cleanup_interval: Duration::from_secs(1),
            max_keys: 1,
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert!(global().is_some_and(|g| Arc::ptr_eq(&g, &first)));
    }
}
