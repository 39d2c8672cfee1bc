//! In-memory windowed rate limiting keyed by API key.
//!
//! Admission control only: decisions never touch change state. The table is
//! process-local; counters reset when the window rolls over, and stale
//! entries are dropped by [`RateLimiter::gc`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Window ceiling.
    pub limit: u32,
    /// Requests remaining in the current window.
    pub remaining: u32,
    /// Seconds until the window resets.
    pub reset_in_secs: u64,
}

#[derive(Debug)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Windowed counter table.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    entries: RwLock<HashMap<String, WindowEntry>>,
}

impl RateLimiter {
    /// Creates a limiter with the given window and ceiling.
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Checks and counts one request for a key. Increment and decision are
    /// made under one lock, so concurrent callers cannot both take the last
    /// slot.
    pub fn check(&self, api_key: &str) -> RateDecision {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let entry = entries.entry(api_key.to_string()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) > self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        let reset_in = self
            .window
            .saturating_sub(now.duration_since(entry.window_start));

        if entry.count >= self.max_requests {
            return RateDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset_in_secs: reset_in.as_secs(),
            };
        }

        entry.count += 1;
        RateDecision {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests - entry.count,
            reset_in_secs: reset_in.as_secs(),
        }
    }

    /// Drops entries whose window has fully elapsed.
    pub fn gc(&self) {
        let now = Instant::now();
        let window = self.window;
        self.entries
            .write()
            .retain(|_, entry| now.duration_since(entry.window_start) <= window);
    }

    /// Number of tracked keys (for metrics).
    pub fn tracked_keys(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_until_ceiling() {
        let limiter = RateLimiter::new(Duration::from_secs(3600), 3);
        assert!(limiter.check("sr_a").allowed);
        assert!(limiter.check("sr_a").allowed);
        let third = limiter.check("sr_a");
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);

        let fourth = limiter.check("sr_a");
        assert!(!fourth.allowed);
        assert_eq!(fourth.remaining, 0);
        assert!(fourth.reset_in_secs <= 3600);
    }

    #[test]
    fn test_keys_are_isolated() {
        let limiter = RateLimiter::new(Duration::from_secs(3600), 1);
        assert!(limiter.check("sr_a").allowed);
        assert!(!limiter.check("sr_a").allowed);
        assert!(limiter.check("sr_b").allowed);
    }

    #[test]
    fn test_window_rollover_resets() {
        let limiter = RateLimiter::new(Duration::from_millis(0), 1);
        assert!(limiter.check("sr_a").allowed);
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.check("sr_a").allowed);
    }

    #[test]
    fn test_gc_drops_stale_entries() {
        let limiter = RateLimiter::new(Duration::from_millis(0), 5);
        limiter.check("sr_a");
        assert_eq!(limiter.tracked_keys(), 1);
        std::thread::sleep(Duration::from_millis(5));
        limiter.gc();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_concurrent_increments_never_exceed_limit() {
        use std::sync::Arc;
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(3600), 50));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                (0..20).filter(|_| limiter.check("sr_a").allowed).count()
            }));
        }
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
