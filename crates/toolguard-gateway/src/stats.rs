//! Process-wide gateway counters.
//!
//! [`GatewayStats`] is owned by whoever builds the gateway and shared by
//! `Arc`; every counter is an atomic so concurrent request state machines
//! can bump them without a lock. Each finished request lands in exactly one
//! terminal bucket (`requests_forwarded`, `requests_blocked`, or one of the
//! rejection/failure buckets); scan counters are tracked alongside.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Terminal outcome of one client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Upstream response returned to the client.
    Returned,
    /// Blocked at either the request or the response stage.
    Blocked,
    RateLimited,
    TooLarge,
    /// Framing, JSON or message-shape error.
    Malformed,
    NoUpstream,
    UpstreamFailed,
    Internal,
}

#[derive(Debug, Default)]
pub struct GatewayStats {
    requests_forwarded: AtomicU64,
    requests_blocked: AtomicU64,
    rate_limited: AtomicU64,
    oversized: AtomicU64,
    malformed: AtomicU64,
    no_upstream: AtomicU64,
    upstream_errors: AtomicU64,
    internal_errors: AtomicU64,
    responses_scanned: AtomicU64,
    threats_detected: AtomicU64,
    scan_time_micros: AtomicU64,
    upstreams_connected: AtomicUsize,
    /// Unix millis of the last recorded terminal event (overwritten).
    last_event_ms: AtomicU64,
    /// Unix millis of the last stats flush (overwritten).
    last_flush_ms: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`] for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub requests_forwarded: u64,
    pub requests_blocked: u64,
    pub requests_rate_limited: u64,
    pub requests_oversized: u64,
    pub requests_malformed: u64,
    pub requests_no_upstream: u64,
    pub upstream_errors: u64,
    pub internal_errors: u64,
    pub responses_scanned: u64,
    pub threats_detected: u64,
    pub total_scan_time_ms: f64,
    pub upstreams_connected: usize,
    pub rate_limited_clients: usize,
    pub last_event_ms: Option<u64>,
    pub last_flush_ms: Option<u64>,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one terminal outcome.
    pub fn record(&self, terminal: Terminal) {
        let counter = match terminal {
            Terminal::Returned => &self.requests_forwarded,
            Terminal::Blocked => &self.requests_blocked,
            Terminal::RateLimited => &self.rate_limited,
            Terminal::TooLarge => &self.oversized,
            Terminal::Malformed => &self.malformed,
            Terminal::NoUpstream => &self.no_upstream,
            Terminal::UpstreamFailed => &self.upstream_errors,
            Terminal::Internal => &self.internal_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_event_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// Account for one scanner invocation.
    pub fn record_scan(&self, elapsed: Duration, threat: bool) {
        self.scan_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if threat {
            self.threats_detected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_response_scanned(&self) {
        self.responses_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_upstreams_connected(&self, count: usize) {
        self.upstreams_connected.store(count, Ordering::Relaxed);
    }

    pub fn mark_flushed(&self) {
        self.last_flush_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// Copy every counter. `rate_limited_clients` comes from the rate
    /// limiter, which owns that state.
    ///
    /// Uses `Relaxed` loads, so counters read during traffic are only
    /// mutually consistent to within in-flight requests.
    pub fn snapshot(&self, rate_limited_clients: usize) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let stamp = |c: &AtomicU64| Some(c.load(Ordering::Relaxed)).filter(|ms| *ms > 0);
        StatsSnapshot {
            requests_forwarded: load(&self.requests_forwarded),
            requests_blocked: load(&self.requests_blocked),
            requests_rate_limited: load(&self.rate_limited),
            requests_oversized: load(&self.oversized),
            requests_malformed: load(&self.malformed),
            requests_no_upstream: load(&self.no_upstream),
            upstream_errors: load(&self.upstream_errors),
            internal_errors: load(&self.internal_errors),
            responses_scanned: load(&self.responses_scanned),
            threats_detected: load(&self.threats_detected),
            total_scan_time_ms: load(&self.scan_time_micros) as f64 / 1000.0,
            upstreams_connected: self.upstreams_connected.load(Ordering::Relaxed),
            rate_limited_clients,
            last_event_ms: stamp(&self.last_event_ms),
            last_flush_ms: stamp(&self.last_flush_ms),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
