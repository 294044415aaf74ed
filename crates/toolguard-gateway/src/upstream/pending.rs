//! Pending-request table for one upstream connection.
//!
//! Every outgoing request is registered under a fresh wire id drawn from a
//! strictly increasing counter, so wire ids are never reused on the
//! connection. The caller's own id is remembered and put back on the
//! response. All state lives behind one mutex that is never held across an
//! await point.

use super::UpstreamError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use toolguard_core::{Message, MessageId};

type Completion = oneshot::Sender<Result<Message, UpstreamError>>;

struct Waiter {
    /// Id to restore on the response.
    client_id: MessageId,
    tx: Completion,
}

struct Table {
    next_id: i64,
    waiters: HashMap<i64, Waiter>,
    /// Set once the connection has failed; new registrations are refused
    /// until [`PendingRequests::reopen`].
    closed: bool,
}

pub struct PendingRequests {
    table: Mutex<Table>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                next_id: 1,
                waiters: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a wire id and register a waiter for it.
    ///
    /// `client_id` is restored on the response; `None` means the response
    /// carries the allocated id.
    pub fn register(
        &self,
        client_id: Option<MessageId>,
        upstream: &str,
    ) -> Result<(i64, oneshot::Receiver<Result<Message, UpstreamError>>), UpstreamError> {
        let mut table = self.lock();
        if table.closed {
            return Err(UpstreamError::Closed(upstream.to_string()));
        }
        let wire_id = table.next_id;
        table.next_id += 1;
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(
            wire_id,
            Waiter {
                client_id: client_id.unwrap_or(MessageId::Number(wire_id)),
                tx,
            },
        );
        Ok((wire_id, rx))
    }

    /// Complete the waiter matching `response.id`.
    ///
    /// Returns `false` when no request with that id is pending.
    pub fn resolve(&self, mut response: Message) -> bool {
        let Some(MessageId::Number(wire_id)) = response.id else {
            return false;
        };
        let Some(waiter) = self.lock().waiters.remove(&wire_id) else {
            return false;
        };
        response.id = Some(waiter.client_id);
        // The requester may have given up already; nothing left to do then.
        let _ = waiter.tx.send(Ok(response));
        true
    }

    /// Drop the waiter for `wire_id`. Returns whether it was still pending.
    pub fn remove(&self, wire_id: i64) -> bool {
        self.lock().waiters.remove(&wire_id).is_some()
    }

    /// Fail one waiter. Returns whether it was still pending.
    pub fn fail(&self, wire_id: i64, error: UpstreamError) -> bool {
        let Some(waiter) = self.lock().waiters.remove(&wire_id) else {
            return false;
        };
        let _ = waiter.tx.send(Err(error));
        true
    }

    /// Fail every pending request and refuse new ones.
    pub fn fail_all(&self, error: impl Fn() -> UpstreamError) -> usize {
        let drained: Vec<Waiter> = {
            let mut table = self.lock();
            table.closed = true;
            table.waiters.drain().map(|(_, w)| w).collect()
        };
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(Err(error()));
        }
        count
    }

    /// Accept registrations again after a restart. The id counter keeps
    /// counting up.
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a pending entry when the request future finishes or is dropped.
pub(crate) struct PendingGuard<'a> {
    pub(crate) pending: &'a PendingRequests,
    pub(crate) wire_id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.wire_id);
    }
}
