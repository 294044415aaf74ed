//! The gateway orchestrator: read, admit, scan, forward, scan, reply.
//!
//! Each client message walks one state machine:
//!
//! ```text
//! RECEIVED → SIZE_CHECKED → RATE_CHECKED → REQUEST_SCANNED
//!   ├─ BLOCKED                      (upstream never contacted)
//!   └─ FORWARDED → RESPONSE_RECEIVED → RESPONSE_SCANNED
//!                    ├─ BLOCKED
//!                    └─ RETURNED
//! ```
//!
//! A response-stage block stops the content from reaching the client but
//! cannot undo whatever the backend already did while serving the request.
//! Callers that need a tool to never run must block it at the request stage.
//!
//! The client-facing loop is sequential, but [`Gateway::handle_message`]
//! takes `&self` and may be driven concurrently; the upstream connections
//! correlate overlapping requests by id.

use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::policy::{PolicyResolver, Severity, Verdict};
use crate::rate_limit::RateLimiter;
use crate::scanner::{PatternScanner, ScanError, ScanOutcome, Scanner};
use crate::stats::{GatewayStats, StatsSnapshot, Terminal};
use crate::upstream::{ConnectionSettings, UpstreamPool};
use futures_util::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use toolguard_core::{write_frame, CodecError, ErrorCode, FrameReader, Message, MessageId, SizeGuard};
use tracing::{debug, error, info, warn};

pub struct Gateway {
    pool: UpstreamPool,
    scanner: Arc<dyn Scanner>,
    policies: PolicyResolver,
    rate_limiter: Arc<RateLimiter>,
    stats: Arc<GatewayStats>,
    size_guard: SizeGuard,
    /// Rate-limit identity of the client on the other end of the stream.
    client_id: String,
}

impl Gateway {
    pub fn new(
        pool: UpstreamPool,
        scanner: Arc<dyn Scanner>,
        policies: PolicyResolver,
        rate_limiter: Arc<RateLimiter>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            pool,
            scanner,
            policies,
            rate_limiter,
            stats,
            size_guard: SizeGuard::default(),
            client_id: "stdio".to_string(),
        }
    }

    pub fn with_size_guard(mut self, size_guard: SizeGuard) -> Self {
        self.size_guard = size_guard;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Build a gateway with process-backed upstreams and the reference
    /// [`PatternScanner`].
    pub fn from_config(config: &GatewayConfig, stats: Arc<GatewayStats>) -> GatewayResult<Self> {
        let settings = ConnectionSettings {
            request_timeout: config.request_timeout,
            shutdown_grace: config.shutdown_grace,
            size_guard: config.size_guard,
        };
        let scanner = PatternScanner::new(&config.scanner_rules)?;
        let policies = PolicyResolver::new(config.default_policy, Arc::new(config.policy_overrides()));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_window,
            config.max_tracked_clients,
        ));
        Ok(Self::new(
            UpstreamPool::from_specs(&config.upstreams, settings),
            Arc::new(scanner),
            policies,
            rate_limiter,
            stats,
        )
        .with_size_guard(config.size_guard)
        .with_client_id(config.client_id.clone()))
    }

    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Start every upstream. A spawn failure is a fatal configuration error.
    pub async fn start(&self) -> GatewayResult<()> {
        let result = self.pool.start_all().await;
        self.stats.set_upstreams_connected(self.pool.connected());
        Ok(result?)
    }

    pub async fn shutdown(&self) {
        self.pool.stop_all().await;
        self.stats.set_upstreams_connected(self.pool.connected());
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.set_upstreams_connected(self.pool.connected());
        self.stats.snapshot(self.rate_limiter.tracked_clients())
    }

    /// Log a stats snapshot and prune idle rate-limit entries.
    pub fn flush_stats(&self) {
        self.rate_limiter.gc();
        let snapshot = self.stats_snapshot();
        self.stats.mark_flushed();
        info!(
            forwarded = snapshot.requests_forwarded,
            blocked = snapshot.requests_blocked,
            rate_limited = snapshot.requests_rate_limited,
            upstream_errors = snapshot.upstream_errors,
            responses_scanned = snapshot.responses_scanned,
            threats = snapshot.threats_detected,
            scan_ms = snapshot.total_scan_time_ms,
            upstreams = snapshot.upstreams_connected,
            "gateway stats"
        );
    }

    /// Serve one client stream until EOF.
    ///
    /// Per-frame problems (oversized, malformed, handler failures) become
    /// error responses and the loop moves on. Only a broken stream ends it.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> GatewayResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut frames = FrameReader::new(reader, self.size_guard);
        loop {
            let reply = match frames.decode_next().await {
                Ok(Some(message)) => self.handle_message(message).await,
                Ok(None) => {
                    info!("client closed the stream");
                    return Ok(());
                }
                Err(e) => Some(self.reject_frame(e)?),
            };
            if let Some(reply) = reply {
                write_frame(&mut writer, &reply).await?;
            }
        }
    }

    /// Turn a per-frame decode error into the client's error response.
    fn reject_frame(&self, error: CodecError) -> Result<Message, CodecError> {
        match error {
            CodecError::TooLarge { declared, limit } => {
                self.stats.record(Terminal::TooLarge);
                Ok(Message::error_with(
                    None,
                    ErrorCode::MessageTooLarge,
                    ErrorCode::MessageTooLarge.default_message(),
                    Some(json!({ "size": declared, "maxSize": limit })),
                ))
            }
            CodecError::InvalidJson(e) => {
                warn!(error = %e, "malformed JSON from client");
                self.stats.record(Terminal::Malformed);
                Ok(Message::error_response(None, ErrorCode::ParseError))
            }
            CodecError::MalformedHeader(reason) => {
                warn!(reason = %reason, "malformed frame header from client");
                self.stats.record(Terminal::Malformed);
                Ok(Message::error_response(None, ErrorCode::ParseError))
            }
            CodecError::InvalidMessage { id, reason } => {
                warn!(reason = %reason, "invalid JSON-RPC message from client");
                self.stats.record(Terminal::Malformed);
                Ok(Message::error_response(id, ErrorCode::InvalidRequest))
            }
            e @ CodecError::Io(_) => Err(e),
        }
    }

    /// Run one message through the state machine, isolating any panic.
    ///
    /// Returns the reply to write, or `None` for notifications and for
    /// messages that need no answer.
    pub async fn handle_message(&self, message: Message) -> Option<Message> {
        let id = message.id.clone();
        let expects_reply = message.is_request();
        match AssertUnwindSafe(self.process(message)).catch_unwind().await {
            Ok(reply) => reply,
            Err(panic) => {
                error!(id = ?id, panic = %panic_message(panic.as_ref()), "message handler panicked");
                self.stats.record(Terminal::Internal);
                expects_reply.then(|| Message::error_response(id, ErrorCode::InternalError))
            }
        }
    }

    async fn process(&self, message: Message) -> Option<Message> {
        if message.is_response() {
            debug!(id = ?message.id, "dropping response from client; nothing was forwarded to it");
            return None;
        }
        if message.method.is_none() {
            warn!(id = ?message.id, "client message has neither method nor result");
            self.stats.record(Terminal::Malformed);
            return Some(Message::error_response(message.id, ErrorCode::InvalidRequest));
        }

        let request_id = message.id.clone();
        let expects_reply = message.is_request();
        let reply = |code: ErrorCode| expects_reply.then(|| Message::error_response(request_id.clone(), code));

        let route = match self.pool.route(&message) {
            Some(route) if route.upstream.is_running() => route,
            Some(route) => {
                warn!(upstream = %route.upstream.name(), method = %message.method(), "upstream not running");
                self.stats.record(Terminal::NoUpstream);
                return reply(ErrorCode::NoUpstream);
            }
            None => {
                warn!(method = %message.method(), "no upstream configured");
                self.stats.record(Terminal::NoUpstream);
                return reply(ErrorCode::NoUpstream);
            }
        };
        let upstream = route.upstream.name().to_string();
        let policy = self.policies.resolve(&upstream);

        let rate_key = format!("{}/{}", self.client_id, upstream);
        if !self.rate_limiter.admit(&rate_key, policy.rate_limit_per_minute) {
            warn!(client = %self.client_id, upstream = %upstream, limit = policy.rate_limit_per_minute, "rate limit exceeded");
            self.stats.record(Terminal::RateLimited);
            return reply(ErrorCode::RateLimited);
        }

        let outcome = match self.timed_scan(|| self.scanner.scan_request(&route.message)) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(upstream = %upstream, error = %e, "request scan failed");
                self.stats.record(Terminal::Internal);
                return reply(ErrorCode::InternalError);
            }
        };
        match self.policies.verdict(&outcome, &policy) {
            Verdict::Block { severity, reason } => {
                warn!(
                    upstream = %upstream,
                    method = %route.message.method(),
                    severity = %severity,
                    reason = %reason,
                    "request blocked"
                );
                self.stats.record(Terminal::Blocked);
                return expects_reply.then(|| blocked(request_id.clone(), "request", severity, &reason));
            }
            Verdict::Allow if outcome.has_threat => {
                info!(
                    upstream = %upstream,
                    severity = %outcome.severity,
                    reason = outcome.reason.as_deref().unwrap_or(""),
                    "threat below blocking policy, forwarding"
                );
            }
            Verdict::Allow => {}
        }

        if !expects_reply {
            match route.upstream.send_notification(route.message).await {
                Ok(()) => self.stats.record(Terminal::Returned),
                Err(e) => {
                    error!(upstream = %upstream, error = %e, "notification forward failed");
                    self.stats.record(Terminal::UpstreamFailed);
                }
            }
            return None;
        }

        let response = match route.upstream.send_request(route.message.clone()).await {
            Ok(response) => response,
            Err(e) => {
                error!(upstream = %upstream, id = ?request_id, error = %e, "upstream request failed");
                self.stats.record(Terminal::UpstreamFailed);
                return reply(ErrorCode::UpstreamFailure);
            }
        };

        let outcome = match self.timed_scan(|| self.scanner.scan_response(&route.message, &response)) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(upstream = %upstream, error = %e, "response scan failed");
                self.stats.record(Terminal::Internal);
                return reply(ErrorCode::InternalError);
            }
        };
        self.stats.record_response_scanned();

        if let Verdict::Block { severity, reason } = self.policies.verdict(&outcome, &policy) {
            // The backend has already executed the request at this point.
            warn!(
                upstream = %upstream,
                method = %route.message.method(),
                severity = %severity,
                reason = %reason,
                "response blocked after upstream handled the request"
            );
            self.stats.record(Terminal::Blocked);
            return Some(blocked(request_id.clone(), "response", severity, &reason));
        }

        self.stats.record(Terminal::Returned);
        Some(response)
    }

    fn timed_scan(
        &self,
        scan: impl FnOnce() -> Result<ScanOutcome, ScanError>,
    ) -> Result<ScanOutcome, ScanError> {
        let started = Instant::now();
        let result = scan();
        let threat = matches!(&result, Ok(outcome) if outcome.has_threat);
        self.stats.record_scan(started.elapsed(), threat);
        result
    }
}

fn blocked(id: Option<MessageId>, stage: &str, severity: Severity, reason: &str) -> Message {
    Message::error_with(
        id,
        ErrorCode::Blocked,
        ErrorCode::Blocked.default_message(),
        Some(json!({
            "stage": stage,
            "severity": severity,
            "reason": reason,
        })),
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
