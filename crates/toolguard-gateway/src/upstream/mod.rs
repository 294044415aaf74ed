//! Upstream tool-provider connections.
//!
//! # Submodule Architecture
//!
//! - **[`pending`]**: the [`PendingRequests`] table correlating wire ids to
//!   single-use completion handles. Owns the per-connection id counter.
//!
//! - **[`connection`]**: [`UpstreamConnection`] owns one backend process:
//!   spawn, graceful stop, framed writes, and a dedicated reader task that
//!   resolves pending requests as responses arrive.
//!
//! - **[`pool`]**: [`UpstreamPool`] holds every configured upstream in
//!   order and routes client messages to one of them.
//!
//! The [`Upstream`] trait is the seam the gateway talks through, so the
//! orchestrator never depends on process details.

pub mod connection;
pub mod pending;
pub mod pool;

pub use connection::{ConnectionSettings, UpstreamConnection};
pub use pending::PendingRequests;
pub use pool::{Route, UpstreamPool};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use toolguard_core::{CodecError, Message};

/// Errors raised by upstream connections. These are logged in full and
/// never shown to the client verbatim.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to spawn upstream {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("upstream {0} is not running")]
    NotRunning(String),

    #[error("upstream {name} did not respond within {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("upstream {0} exited")]
    ProcessExited(String),

    #[error("upstream {0} connection closed")]
    Closed(String),

    #[error("upstream io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Boxed future returned by [`Upstream`] methods.
pub type UpstreamFuture<'a, T> = Pin<Box<dyn Future<Output = UpstreamResult<T>> + Send + 'a>>;

/// Lifecycle of one upstream connection.
///
/// `Stopped → Starting → Running → Stopping → Stopped`. A backend that
/// exits on its own goes straight from `Running` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// A backend the gateway can forward to.
pub trait Upstream: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> UpstreamState;

    fn is_running(&self) -> bool {
        self.state() == UpstreamState::Running
    }

    /// Start the backend. Failure is a configuration error and is not retried.
    fn start(&self) -> UpstreamFuture<'_, ()>;

    /// Stop the backend, failing every pending request. Always ends `Stopped`.
    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Forward a request and wait for its matching response.
    ///
    /// The returned response carries the caller's original id.
    fn send_request(&self, request: Message) -> UpstreamFuture<'_, Message>;

    /// Forward a notification; no response is awaited.
    fn send_notification(&self, notification: Message) -> UpstreamFuture<'_, ()>;
}
