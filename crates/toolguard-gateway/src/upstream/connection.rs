//! One backend tool-provider process and its framed stdio channel.
//!
//! Writes go through a writer mutex held only for the duration of one
//! frame. Reads happen on a dedicated task per connection, so a slow or
//! wedged backend can never stall the client-facing loop; that task routes
//! each response to its [`PendingRequests`] waiter.

use super::pending::{PendingGuard, PendingRequests};
use super::{Upstream, UpstreamError, UpstreamFuture, UpstreamResult, UpstreamState};
use crate::config::UpstreamSpec;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use toolguard_core::{write_frame, CodecError, FrameReader, Message, MessageId, SizeGuard};
use tracing::{debug, error, info, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Timeouts and limits applied to one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// How long `send_request` waits for the matching response.
    pub request_timeout: Duration,
    /// How long `stop` waits after closing stdin before killing.
    pub shutdown_grace: Duration,
    /// Limits frames read back from the backend.
    pub size_guard: SizeGuard,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            size_guard: SizeGuard::default(),
        }
    }
}

pub struct UpstreamConnection {
    spec: UpstreamSpec,
    settings: ConnectionSettings,
    state: Arc<Mutex<UpstreamState>>,
    pending: Arc<PendingRequests>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    child: AsyncMutex<Option<Child>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamConnection {
    pub fn new(spec: UpstreamSpec, settings: ConnectionSettings) -> Self {
        Self {
            spec,
            settings,
            state: Arc::new(Mutex::new(UpstreamState::Stopped)),
            pending: Arc::new(PendingRequests::new()),
            writer: AsyncMutex::new(None),
            child: AsyncMutex::new(None),
            reader_task: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &UpstreamSpec {
        &self.spec
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn current_state(&self) -> UpstreamState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: UpstreamState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Spawn the configured process and start its reader task.
    pub async fn start_process(&self) -> UpstreamResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != UpstreamState::Stopped {
                debug!(upstream = %self.spec.name, state = ?*state, "start ignored");
                return Ok(());
            }
            *state = UpstreamState::Starting;
        }

        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(UpstreamState::Stopped);
                return Err(UpstreamError::SpawnFailed {
                    name: self.spec.name.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.set_state(UpstreamState::Stopped);
            let _ = child.kill().await;
            return Err(UpstreamError::SpawnFailed {
                name: self.spec.name.clone(),
                reason: "child stdio was not captured".to_string(),
            });
        };

        info!(
            upstream = %self.spec.name,
            command = %self.spec.command,
            pid = child.id(),
            "upstream process spawned"
        );
        *self.child.lock().await = Some(child);
        self.run_with_streams(stdout, stdin).await;
        Ok(())
    }

    /// Wire the connection to an already-open reader/writer pair.
    ///
    /// Used by [`UpstreamConnection::start_process`] with the child's stdio,
    /// and directly with in-memory streams in tests.
    pub async fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.set_state(UpstreamState::Starting);
        self.run_with_streams(reader, writer).await;
    }

    async fn run_with_streams<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.writer.lock().await = Some(Box::new(writer));
        self.pending.reopen();

        let frames = FrameReader::new(Box::new(reader) as BoxedReader, self.settings.size_guard);
        let task = tokio::spawn(read_loop(
            self.spec.name.clone(),
            frames,
            self.pending.clone(),
            self.state.clone(),
        ));
        if let Some(old) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            old.abort();
        }
        self.set_state(UpstreamState::Running);
    }

    /// Close the backend's stdin, wait out the grace period, then kill.
    ///
    /// Idempotent; always leaves the connection `Stopped` with every pending
    /// request failed.
    pub async fn stop_process(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, UpstreamState::Running | UpstreamState::Starting) {
                *state = UpstreamState::Stopping;
            }
        }

        // A write stalled on a full pipe holds the writer; don't wait on it
        // past the grace period.
        match tokio::time::timeout(self.settings.shutdown_grace, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Some(mut writer) = writer.take() {
                    match tokio::time::timeout(self.settings.shutdown_grace, writer.shutdown()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(upstream = %self.spec.name, error = %e, "closing upstream stdin failed")
                        }
                        Err(_) => debug!(upstream = %self.spec.name, "closing upstream stdin timed out"),
                    }
                }
            }
            Err(_) => {
                warn!(upstream = %self.spec.name, "upstream stdin busy with a stalled write, skipping graceful close");
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.settings.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(upstream = %self.spec.name, code = ?status.code(), "upstream exited after stdin close");
                }
                Ok(Err(e)) => {
                    warn!(upstream = %self.spec.name, error = %e, "waiting for upstream failed");
                }
                Err(_) => {
                    warn!(
                        upstream = %self.spec.name,
                        grace = ?self.settings.shutdown_grace,
                        "upstream did not exit within grace period, killing"
                    );
                    if let Err(e) = child.kill().await {
                        error!(upstream = %self.spec.name, error = %e, "kill failed");
                    }
                }
            }
        }

        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let failed = self
            .pending
            .fail_all(|| UpstreamError::Closed(self.spec.name.clone()));
        if failed > 0 {
            warn!(upstream = %self.spec.name, failed, "failed pending requests on stop");
        }
        self.set_state(UpstreamState::Stopped);
        info!(upstream = %self.spec.name, "upstream stopped");
    }

    /// Forward a request and await the matching response.
    pub async fn request(&self, mut request: Message) -> UpstreamResult<Message> {
        if self.current_state() != UpstreamState::Running {
            return Err(UpstreamError::NotRunning(self.spec.name.clone()));
        }

        // One deadline covers both writing the request and awaiting its response.
        let deadline = tokio::time::Instant::now() + self.settings.request_timeout;
        let (wire_id, rx) = self.pending.register(request.id.take(), &self.spec.name)?;
        let _guard = PendingGuard {
            pending: &self.pending,
            wire_id,
        };
        request.id = Some(MessageId::Number(wire_id));
        self.write_before(deadline, &request).await?;
        debug!(upstream = %self.spec.name, wire_id, method = %request.method(), "request forwarded");

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpstreamError::Closed(self.spec.name.clone())),
            Err(_) => {
                warn!(upstream = %self.spec.name, wire_id, "upstream request timed out");
                Err(UpstreamError::Timeout {
                    name: self.spec.name.clone(),
                    after: self.settings.request_timeout,
                })
            }
        }
    }

    pub async fn notify(&self, notification: Message) -> UpstreamResult<()> {
        if self.current_state() != UpstreamState::Running {
            return Err(UpstreamError::NotRunning(self.spec.name.clone()));
        }
        let deadline = tokio::time::Instant::now() + self.settings.request_timeout;
        self.write_before(deadline, &notification).await
    }

    /// Write one frame, giving up at `deadline`.
    ///
    /// A frame cut short leaves the pipe out of sync, so a stalled write
    /// fails the whole connection.
    async fn write_before(&self, deadline: tokio::time::Instant, message: &Message) -> UpstreamResult<()> {
        match tokio::time::timeout_at(deadline, self.write(message)).await {
            Ok(result) => result,
            Err(_) => {
                error!(upstream = %self.spec.name, "upstream stopped reading its input, failing connection");
                self.fail_connection();
                Err(UpstreamError::Timeout {
                    name: self.spec.name.clone(),
                    after: self.settings.request_timeout,
                })
            }
        }
    }

    /// Mark a running connection `Stopped`, drop its input and fail every
    /// pending request. The process itself is left for `stop_process`.
    fn fail_connection(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != UpstreamState::Running {
                return;
            }
            *state = UpstreamState::Stopped;
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        let failed = self
            .pending
            .fail_all(|| UpstreamError::Closed(self.spec.name.clone()));
        if failed > 0 {
            warn!(upstream = %self.spec.name, failed, "failed pending requests after stalled write");
        }
    }

    async fn write(&self, message: &Message) -> UpstreamResult<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| UpstreamError::NotRunning(self.spec.name.clone()))?;
        write_frame(&mut **writer, message).await?;
        Ok(())
    }
}

/// Dedicated reader: decode frames from the backend until it goes away.
async fn read_loop(
    name: String,
    mut frames: FrameReader<BoxedReader>,
    pending: Arc<PendingRequests>,
    state: Arc<Mutex<UpstreamState>>,
) {
    loop {
        match frames.decode_next().await {
            Ok(Some(message)) => {
                if message.method.is_some() {
                    debug!(upstream = %name, method = %message.method(), "dropping upstream-initiated message");
                    continue;
                }
                let id = message.id.clone();
                if !pending.resolve(message) {
                    warn!(upstream = %name, id = ?id, "dropping response with no pending request");
                }
            }
            Ok(None) => {
                info!(upstream = %name, "upstream closed its output");
                break;
            }
            Err(CodecError::InvalidMessage {
                id: Some(MessageId::Number(wire_id)),
                reason,
            }) => {
                warn!(upstream = %name, wire_id, reason = %reason, "malformed response from upstream");
                pending.fail(
                    wire_id,
                    UpstreamError::Codec(CodecError::InvalidMessage {
                        id: Some(MessageId::Number(wire_id)),
                        reason,
                    }),
                );
            }
            Err(e) if e.is_recoverable() => {
                warn!(upstream = %name, error = %e, "discarding bad frame from upstream");
            }
            Err(e) => {
                error!(upstream = %name, error = %e, "upstream read failed");
                break;
            }
        }
    }

    {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == UpstreamState::Running {
            error!(upstream = %name, "upstream exited unexpectedly");
            *state = UpstreamState::Stopped;
        }
    }
    let failed = pending.fail_all(|| UpstreamError::ProcessExited(name.clone()));
    if failed > 0 {
        warn!(upstream = %name, failed, "failed pending requests after upstream exit");
    }
}

impl Upstream for UpstreamConnection {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn state(&self) -> UpstreamState {
        self.current_state()
    }

    fn start(&self) -> UpstreamFuture<'_, ()> {
        Box::pin(self.start_process())
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.stop_process())
    }

    fn send_request(&self, request: Message) -> UpstreamFuture<'_, Message> {
        Box::pin(self.request(request))
    }

    fn send_notification(&self, notification: Message) -> UpstreamFuture<'_, ()> {
        Box::pin(self.notify(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    fn spec(name: &str) -> UpstreamSpec {
        UpstreamSpec {
            name: name.to_string(),
            command: "unused".to_string(),
            args: vec![],
            env: HashMap::new(),
            policy: None,
        }
    }

    fn settings(timeout_ms: u64) -> ConnectionSettings {
        ConnectionSettings {
            request_timeout: Duration::from_millis(timeout_ms),
            shutdown_grace: Duration::from_millis(200),
            size_guard: SizeGuard::default(),
        }
    }

    /// Connection wired to in-memory pipes; returns the backend's ends.
    async fn attached(
        timeout_ms: u64,
    ) -> (
        Arc<UpstreamConnection>,
        FrameReader<ReadHalf<DuplexStream>>,
        WriteHalf<DuplexStream>,
    ) {
        let (gateway_side, backend_side) = duplex(64 * 1024);
        let (gw_read, gw_write) = tokio::io::split(gateway_side);
        let (be_read, be_write) = tokio::io::split(backend_side);
        let conn = Arc::new(UpstreamConnection::new(spec("fake"), settings(timeout_ms)));
        conn.attach(gw_read, gw_write).await;
        (conn, FrameReader::new(be_read, SizeGuard::default()), be_write)
    }

    /// Echo backend: answers each request with `{"echo": <wire id>}`.
    fn spawn_echo(
        mut requests: FrameReader<ReadHalf<DuplexStream>>,
        mut out: WriteHalf<DuplexStream>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(Some(req)) = requests.decode_next().await {
                if req.id.is_none() {
                    continue;
                }
                let resp = Message::success(req.id.clone(), json!({"echo": req.id}));
                if write_frame(&mut out, &resp).await.is_err() {
                    break;
                }
            }
        })
    }

    #[tokio::test]
    async fn request_gets_matching_response_with_client_id() {
        let (conn, requests, out) = attached(1000).await;
        spawn_echo(requests, out);
        let resp = conn
            .request(Message::request(Some("client-7".into()), "tools/list", None))
            .await
            .unwrap();
        assert_eq!(resp.id, Some(MessageId::String("client-7".into())));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_ids() {
        let (conn, requests, out) = attached(2000).await;
        spawn_echo(requests, out);
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.request(Message::request(None, "ping", None)).await })
            })
            .collect();
        let mut ids = HashSet::new();
        for h in handles {
            let resp = h.await.unwrap().unwrap();
            // The echo payload is the wire id the backend saw.
            assert_eq!(resp.result.as_ref().unwrap()["echo"], json!(resp.id));
            assert!(ids.insert(resp.id.unwrap()));
        }
        assert_eq!(ids.len(), 50);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_match_their_requests() {
        let (conn, mut requests, mut out) = attached(2000).await;
        let backend = tokio::spawn(async move {
            let first = requests.decode_next().await.unwrap().unwrap();
            let second = requests.decode_next().await.unwrap().unwrap();
            for req in [second, first] {
                let resp = Message::success(req.id.clone(), json!({"method": req.method()}));
                write_frame(&mut out, &resp).await.unwrap();
            }
        });
        let a = conn.request(Message::request(Some(1.into()), "first", None));
        let b = conn.request(Message::request(Some(2.into()), "second", None));
        let (a, b) = tokio::join!(a, b);
        backend.await.unwrap();
        assert_eq!(a.unwrap().result.unwrap()["method"], "first");
        assert_eq!(b.unwrap().result.unwrap()["method"], "second");
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry_only_for_that_request() {
        let (conn, mut requests, mut out) = attached(150).await;
        let backend = tokio::spawn(async move {
            let a = requests.decode_next().await.unwrap().unwrap();
            let b = requests.decode_next().await.unwrap().unwrap();
            let fast = if a.method() == "fast" { a } else { b };
            write_frame(&mut out, &Message::success(fast.id.clone(), json!("fast")))
                .await
                .unwrap();
            // Keep the pipe open past the timeout.
            tokio::time::sleep(Duration::from_millis(400)).await;
        });
        let slow = conn.request(Message::request(Some(1.into()), "slow", None));
        let fast = conn.request(Message::request(Some(2.into()), "fast", None));
        let (slow, fast) = tokio::join!(slow, fast);
        assert!(matches!(slow, Err(UpstreamError::Timeout { .. })));
        assert_eq!(fast.unwrap().result, Some(json!("fast")));
        assert_eq!(conn.pending_count(), 0);
        assert!(conn.is_running());
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn backend_exit_fails_pending_requests() {
        let (conn, mut requests, out) = attached(5000).await;
        let backend = tokio::spawn(async move {
            let _req = requests.decode_next().await.unwrap().unwrap();
            drop(out);
        });
        let err = conn
            .request(Message::request(Some(1.into()), "tools/call", None))
            .await
            .unwrap_err();
        backend.await.unwrap();
        assert!(matches!(err, UpstreamError::ProcessExited(_)));
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.state(), UpstreamState::Stopped);
        assert!(matches!(
            conn.request(Message::request(Some(2.into()), "again", None)).await,
            Err(UpstreamError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn unmatched_and_server_initiated_messages_are_dropped() {
        let (conn, mut requests, mut out) = attached(2000).await;
        let backend = tokio::spawn(async move {
            let req = requests.decode_next().await.unwrap().unwrap();
            let noise = [
                Message::success(Some(MessageId::Number(9999)), json!("stray")),
                Message::request(None, "notifications/progress", None),
                Message::request(Some(5.into()), "sampling/createMessage", None),
            ];
            for msg in &noise {
                write_frame(&mut out, msg).await.unwrap();
            }
            write_frame(&mut out, &Message::success(req.id.clone(), json!("real")))
                .await
                .unwrap();
            out
        });
        let resp = conn
            .request(Message::request(Some(1.into()), "tools/call", None))
            .await
            .unwrap();
        assert_eq!(resp.result, Some(json!("real")));
        let _out = backend.await.unwrap();
    }

    #[tokio::test]
    async fn stop_fails_pending_and_is_idempotent() {
        let (conn, mut requests, _out) = attached(5000).await;
        let sink = tokio::spawn(async move { while let Ok(Some(_)) = requests.decode_next().await {} });
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request(Message::request(Some(1.into()), "hang", None)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.stop_process().await;
        assert!(waiter.await.unwrap().is_err());
        assert_eq!(conn.state(), UpstreamState::Stopped);
        assert_eq!(conn.pending_count(), 0);
        conn.stop_process().await;
        assert_eq!(conn.state(), UpstreamState::Stopped);
        sink.abort();
    }

    /// Connection whose backend never reads, over a pipe too small for one frame.
    async fn wedged(request_timeout: Duration) -> (Arc<UpstreamConnection>, DuplexStream) {
        let (gateway_side, backend_side) = duplex(64);
        let (gw_read, gw_write) = tokio::io::split(gateway_side);
        let conn = Arc::new(UpstreamConnection::new(
            spec("wedged"),
            ConnectionSettings {
                request_timeout,
                shutdown_grace: Duration::from_millis(100),
                size_guard: SizeGuard::default(),
            },
        ));
        conn.attach(gw_read, gw_write).await;
        (conn, backend_side)
    }

    fn bulky(id: i64) -> Message {
        Message::request(
            Some(id.into()),
            "tools/call",
            Some(json!({"name": "upload", "arguments": {"blob": "x".repeat(4096)}})),
        )
    }

    #[tokio::test]
    async fn stalled_write_times_out_and_fails_connection() {
        let (conn, _backend) = wedged(Duration::from_millis(200)).await;
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(3), conn.request(bulky(1)))
            .await
            .expect("request should give up within its own timeout");
        assert!(matches!(result, Err(UpstreamError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.state(), UpstreamState::Stopped);
        assert!(matches!(
            conn.request(Message::request(Some(2.into()), "ping", None)).await,
            Err(UpstreamError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn stalled_notification_is_bounded() {
        let (conn, _backend) = wedged(Duration::from_millis(200)).await;
        let mut note = bulky(1);
        note.id = None;
        let result = tokio::time::timeout(Duration::from_secs(3), conn.notify(note))
            .await
            .expect("notification should give up within its own timeout");
        assert!(matches!(result, Err(UpstreamError::Timeout { .. })));
        assert_eq!(conn.state(), UpstreamState::Stopped);
    }

    #[tokio::test]
    async fn stop_completes_while_a_write_is_stalled() {
        let (conn, _backend) = wedged(Duration::from_secs(30)).await;
        let stuck = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.request(bulky(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(3), conn.stop_process())
            .await
            .expect("stop should not wait on a stalled write");
        assert_eq!(conn.state(), UpstreamState::Stopped);
        stuck.abort();
    }

    #[tokio::test]
    async fn malformed_response_fails_its_request_immediately() {
        let (conn, mut requests, mut out) = attached(5000).await;
        let backend = tokio::spawn(async move {
            let req = requests.decode_next().await.unwrap().unwrap();
            let body = format!(r#"{{"jsonrpc":"2.0","id":{},"error":"boom"}}"#, json!(req.id));
            let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
            out.write_all(frame.as_bytes()).await.unwrap();
            out
        });
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            conn.request(Message::request(Some(1.into()), "tools/call", None)),
        )
        .await
        .expect("malformed response should fail the request without waiting");
        assert!(matches!(result, Err(UpstreamError::Codec(_))));
        assert_eq!(conn.pending_count(), 0);
        assert!(conn.is_running());
        let _out = backend.await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let mut bad = spec("missing");
        bad.command = "/nonexistent/toolguard-test-binary".to_string();
        let conn = UpstreamConnection::new(bad, settings(100));
        let err = conn.start_process().await.unwrap_err();
        assert!(matches!(err, UpstreamError::SpawnFailed { .. }));
        assert_eq!(conn.state(), UpstreamState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_process_round_trip_and_stop() {
        // `cat` echoes the framed request back verbatim, which doubles as a
        // response once it carries an id.
        let mut cat = spec("cat");
        cat.command = "cat".to_string();
        let conn = UpstreamConnection::new(cat, settings(2000));
        conn.start_process().await.unwrap();
        assert!(conn.is_running());
        let resp = conn
            .request(Message::success(Some(42.into()), json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(resp.id, Some(MessageId::Number(42)));
        assert_eq!(resp.result, Some(json!({"ok": true})));
        conn.stop_process().await;
        assert_eq!(conn.state(), UpstreamState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let mut stubborn = spec("sleeper");
        stubborn.command = "sh".to_string();
        stubborn.args = vec!["-c".into(), "exec sleep 30".into()];
        let conn = UpstreamConnection::new(stubborn, settings(100));
        conn.start_process().await.unwrap();
        let started = std::time::Instant::now();
        conn.stop_process().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(conn.state(), UpstreamState::Stopped);
    }
}
