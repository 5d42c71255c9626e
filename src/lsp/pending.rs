// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! In-flight request bookkeeping for one backend process.
//!
//! Insert, complete, sweep and fail-all all take the same lock, so an entry
//! is resolved exactly once no matter which of them gets to it first.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Outcome delivered to the waiting caller.
pub type Outcome = Result<Value>;

/// The MCP call a backend request is made on behalf of.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Printable reference to the originating MCP request id.
    pub origin: Option<String>,
    /// Flips to `true` when the MCP client cancels the call.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl CallContext {
    /// Context for a call with the given origin and no cancellation signal.
    pub fn with_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            cancel: None,
        }
    }
}

/// One outstanding request.
#[derive(Debug)]
pub struct PendingRequest {
    /// Correlation id sent to the backend.
    pub id: i64,
    /// LSP method, kept for timeout messages and logs.
    pub method: String,
    /// Reference to the MCP call that caused this request, if any.
    pub origin: Option<String>,
    /// When the request was registered.
    pub issued_at: Instant,
    /// When the request times out.
    pub deadline: Instant,
    /// The timeout the deadline was derived from.
    pub timeout: Duration,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<i64, PendingRequest>,
    /// Set once the owning process is gone; later inserts fail with it.
    closed: Option<BridgeError>,
}

/// Pending-request table for one backend process.
#[derive(Debug)]
pub struct PendingTable {
    server: String,
    inner: Mutex<Inner>,
}

impl PendingTable {
    /// Creates an empty table for `server`.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a request and returns the receiver its outcome will arrive
    /// on, together with its deadline.
    ///
    /// # Errors
    ///
    /// Fails with the table's close reason once [`fail_all`](Self::fail_all)
    /// has run, or if `id` is already pending.
    pub fn insert(
        &self,
        id: i64,
        method: &str,
        origin: Option<String>,
        timeout: Duration,
    ) -> Result<(oneshot::Receiver<Outcome>, Instant)> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        if inner.entries.contains_key(&id) {
            return Err(BridgeError::invalid_arguments(format!(
                "correlation id {id} is already pending on '{}'",
                self.server
            )));
        }
        let (tx, rx) = oneshot::channel();
        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        inner.entries.insert(
            id,
            PendingRequest {
                id,
                method: method.to_string(),
                origin,
                issued_at,
                deadline,
                timeout,
                tx,
            },
        );
        drop(inner);
        Ok((rx, deadline))
    }

    /// Delivers `outcome` to the caller waiting on `id`.
    ///
    /// Returns false, and logs, if nothing is waiting: the entry already
    /// timed out or was never ours.
    pub fn complete(&self, id: i64, outcome: Outcome) -> bool {
        let entry = self.lock().entries.remove(&id);
        let Some(entry) = entry else {
            warn!(
                "Discarding late response for request {} on '{}'",
                id, self.server
            );
            return false;
        };
        debug!(
            "Request {} ({}) on '{}' answered after {:?}",
            id,
            entry.method,
            self.server,
            entry.issued_at.elapsed()
        );
        // The caller may have gone away; nothing to do then.
        let _ = entry.tx.send(outcome);
        true
    }

    /// Removes a request without resolving it. Used when the write fails.
    pub fn remove(&self, id: i64) -> Option<PendingRequest> {
        self.lock().entries.remove(&id)
    }

    /// Resolves every entry whose deadline is at or before `now` with a
    /// timeout. Returns how many were expired.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingRequest> = {
            let mut inner = self.lock();
            let ids: Vec<i64> = inner
                .entries
                .values()
                .filter(|p| p.deadline <= now)
                .map(|p| p.id)
                .collect();
            ids.iter()
                .filter_map(|id| inner.entries.remove(id))
                .collect()
        };

        let count = expired.len();
        for entry in expired {
            warn!(
                "Request {} ({}) on '{}' timed out",
                entry.id, entry.method, self.server
            );
            let _ = entry.tx.send(Err(BridgeError::Timeout {
                server: self.server.clone(),
                method: entry.method,
                timeout_ms: u64::try_from(entry.timeout.as_millis()).unwrap_or(u64::MAX),
            }));
        }
        count
    }

    /// Resolves every entry with `err` and refuses further inserts.
    /// Returns how many callers were failed.
    pub fn fail_all(&self, err: &BridgeError) -> usize {
        self.resolve_all(err, true)
    }

    /// Resolves every current entry with `err` but keeps accepting new ones.
    /// Used before a graceful `shutdown`, which itself needs the table.
    pub fn fail_outstanding(&self, err: &BridgeError) -> usize {
        self.resolve_all(err, false)
    }

    fn resolve_all(&self, err: &BridgeError, close: bool) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.lock();
            if close && inner.closed.is_none() {
                inner.closed = Some(err.clone());
            }
            inner.entries.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        if count > 0 {
            debug!(
                "Failing {} pending request(s) on '{}': {}",
                count, self.server, err
            );
        }
        for entry in drained {
            let _ = entry.tx.send(Err(err.clone()));
        }
        count
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Origins of the outstanding requests, for diagnostics.
    #[must_use]
    pub fn origins(&self) -> Vec<(i64, Option<String>)> {
        let mut out: Vec<_> = self
            .lock()
            .entries
            .values()
            .map(|p| (p.id, p.origin.clone()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}
