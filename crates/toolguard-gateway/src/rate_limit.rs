//! Sliding-window rate limiter with a bounded client table.
//!
//! Each tracked client keeps the timestamps of its admitted requests within
//! the trailing window. Expired timestamps are pruned lazily on access. The
//! table never holds more than `max_clients` entries: admitting a new client
//! at capacity evicts the client whose most recent request is oldest.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default sliding window (60 seconds).
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default cap on distinct tracked clients.
pub const DEFAULT_MAX_CLIENTS: usize = 10_000;

/// Per-client admission control shared by every in-flight request.
#[derive(Debug)]
pub struct RateLimiter {
    /// Duration of the sliding window.
    window: Duration,
    /// Maximum number of distinct clients tracked at once.
    max_clients: usize,
    /// Per-client tracking: client id → admitted timestamps, oldest first.
    entries: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_CLIENTS)
    }
}

impl RateLimiter {
    /// A zero `max_clients` is raised to 1.
    pub fn new(window: Duration, max_clients: usize) -> Self {
        Self {
            window,
            max_clients: max_clients.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check whether `client` may make another request, recording it if so.
    ///
    /// `limit == 0` means unlimited. A rejected attempt is not recorded.
    pub fn admit(&self, client: &str, limit: u32) -> bool {
        self.admit_at(client, limit, Instant::now())
    }

    /// [`RateLimiter::admit`] against an explicit clock reading.
    ///
    /// Prune, check, evict and record happen under one lock acquisition so
    /// concurrent callers cannot both slip past the limit.
    pub fn admit_at(&self, client: &str, limit: u32, now: Instant) -> bool {
        if limit == 0 {
            return true;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(timestamps) = entries.get_mut(client) {
            prune(timestamps, now, self.window);
            if timestamps.len() >= limit as usize {
                return false;
            }
            timestamps.push_back(now);
            return true;
        }

        if entries.len() >= self.max_clients {
            evict_stalest(&mut entries);
        }
        entries.insert(client.to_string(), VecDeque::from([now]));
        true
    }

    /// Number of distinct clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&self) {
        self.gc_at(Instant::now());
    }

    pub fn gc_at(&self, now: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, timestamps| {
            prune(timestamps, now, self.window);
            !timestamps.is_empty()
        });
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

/// Remove the client whose most recent timestamp is oldest. Clients with no
/// timestamps left count as older than any client that has one.
fn evict_stalest(entries: &mut HashMap<String, VecDeque<Instant>>) {
    let stalest = entries
        .iter()
        .min_by(|(_, a), (_, b)| a.back().cmp(&b.back()))
        .map(|(client, _)| client.clone());
    if let Some(client) = stalest {
        debug!(client = %client, "rate limiter at capacity, evicting stalest client");
        entries.remove(&client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::default();
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(limiter.admit_at("agent", 3, t0));
        }
        assert!(!limiter.admit_at("agent", 3, t0));
    }

    #[test]
    fn admits_again_after_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 10);
        let t0 = Instant::now();
        assert!(limiter.admit_at("agent", 1, t0));
        assert!(!limiter.admit_at("agent", 1, t0 + Duration::from_secs(30)));
        assert!(limiter.admit_at("agent", 1, t0 + Duration::from_secs(61)));
    }

    #[test]
    fn rejected_attempts_are_not_recorded() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 10);
        let t0 = Instant::now();
        assert!(limiter.admit_at("a", 1, t0));
        // Hammering while limited must not extend the window.
        for s in 1..10 {
            assert!(!limiter.admit_at("a", 1, t0 + Duration::from_secs(s)));
        }
        assert!(limiter.admit_at("a", 1, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn zero_limit_is_unlimited_and_untracked() {
        let limiter = RateLimiter::default();
        for _ in 0..1000 {
            assert!(limiter.admit("agent", 0));
        }
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn clients_are_independent() {
        let limiter = RateLimiter::default();
        let t0 = Instant::now();
        assert!(limiter.admit_at("a", 1, t0));
        assert!(limiter.admit_at("b", 1, t0));
        assert!(!limiter.admit_at("a", 1, t0));
    }

    #[test]
    fn table_never_exceeds_capacity() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 50);
        let t0 = Instant::now();
        for i in 0..500u64 {
            let now = t0 + Duration::from_millis(i);
            assert!(limiter.admit_at(&format!("spoofed-{i}"), 5, now));
            assert!(limiter.tracked_clients() <= 50);
        }
        assert_eq!(limiter.tracked_clients(), 50);
    }

    #[test]
    fn evicts_client_with_oldest_latest_request() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        assert!(limiter.admit_at("old", 1, t0));
        assert!(limiter.admit_at("recent", 1, t0 + Duration::from_secs(5)));
        assert!(limiter.admit_at("new", 1, t0 + Duration::from_secs(6)));
        // "old" was evicted, so it is admitted afresh; "recent" is still limited.
        assert!(!limiter.admit_at("recent", 1, t0 + Duration::from_secs(7)));
        assert!(limiter.admit_at("old", 1, t0 + Duration::from_secs(7)));
    }

    #[test]
    fn gc_drops_idle_clients() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 10);
        let t0 = Instant::now();
        limiter.admit_at("a", 5, t0);
        limiter.admit_at("b", 5, t0 + Duration::from_millis(1500));
        limiter.gc_at(t0 + Duration::from_secs(2));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn concurrent_admits_respect_limit() {
        let limiter = Arc::new(RateLimiter::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..25).filter(|_| limiter.admit("shared", 100)).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
