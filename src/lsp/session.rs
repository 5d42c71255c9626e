/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Backend session state, capabilities and status.
//!
//! Only the supervisor mutates a [`BridgeSession`]; everything outside
//! `crate::lsp` sees it through a [`SessionView`].

use chrono::{DateTime, Utc};
use lsp_types::Diagnostic;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::connection::{Connection, DiagnosticsCache};
use super::pending::CallContext;
use crate::error::{BridgeError, Result};
use crate::registry::ServerDefinition;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not running. Initial state, and final after an explicit stop.
    Stopped,
    /// Process is being spawned.
    Starting,
    /// `initialize` handshake in progress.
    Initializing,
    /// Handshake done; requests are forwarded.
    Ready,
    /// Crashed; waiting out the restart backoff.
    Degraded,
    /// Restart budget exhausted or the executable cannot be launched.
    PermanentlyFailed,
}

impl SessionState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Stopped | Self::Degraded, Self::Starting)
                | (Self::Starting, Self::Initializing)
                | (Self::Initializing, Self::Ready)
                | (
                    Self::Starting | Self::Initializing | Self::Ready,
                    Self::Degraded
                )
                | (
                    Self::Starting | Self::Initializing | Self::Ready | Self::Degraded,
                    Self::PermanentlyFailed
                )
                | (
                    Self::Starting
                        | Self::Initializing
                        | Self::Ready
                        | Self::Degraded
                        | Self::PermanentlyFailed,
                    Self::Stopped
                )
        )
    }

    /// States a readiness wait stops at.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Ready | Self::PermanentlyFailed | Self::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::PermanentlyFailed => "permanently_failed",
        })
    }
}

/// Server capabilities advertised in the `initialize` response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    raw: Map<String, Value>,
}

impl CapabilitySet {
    /// Extracts `capabilities` from an `initialize` result. Anything that is
    /// not an object yields an empty set.
    #[must_use]
    pub fn from_initialize_result(result: &Value) -> Self {
        let raw = result
            .get("capabilities")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self { raw }
    }

    /// True if `key` is advertised with anything other than `false`/`null`.
    #[must_use]
    pub fn supports(&self, key: &str) -> bool {
        self.raw
            .get(key)
            .is_some_and(|v| !matches!(v, Value::Null | Value::Bool(false)))
    }

    /// Raw options for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// Names of supported capabilities, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .raw
            .keys()
            .filter(|k| self.supports(k))
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// One backend's session: the definition it was launched from, its current
/// process, lifecycle state and what the handshake negotiated.
#[derive(Debug)]
pub struct BridgeSession {
    definition: ServerDefinition,
    created_at: DateTime<Utc>,
    state: watch::Sender<SessionState>,
    connection: Mutex<Option<Arc<Connection>>>,
    capabilities: Mutex<CapabilitySet>,
    restart_history: Mutex<VecDeque<Instant>>,
    restart_count: AtomicU32,
    ready_since: Mutex<Option<Instant>>,
    failure: Mutex<Option<String>>,
    ids: Arc<AtomicI64>,
    diagnostics: DiagnosticsCache,
}

impl BridgeSession {
    pub(super) fn new(definition: ServerDefinition) -> Self {
        let (state, _) = watch::channel(SessionState::Stopped);
        Self {
            definition,
            created_at: Utc::now(),
            state,
            connection: Mutex::new(None),
            capabilities: Mutex::new(CapabilitySet::default()),
            restart_history: Mutex::new(VecDeque::new()),
            restart_count: AtomicU32::new(0),
            ready_since: Mutex::new(None),
            failure: Mutex::new(None),
            ids: Arc::new(AtomicI64::new(1)),
            diagnostics: DiagnosticsCache::default(),
        }
    }

    /// Server id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// The definition this session launches.
    #[must_use]
    pub const fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Moves to `next` if the lifecycle allows it. Returns false otherwise.
    pub(super) fn transition(&self, next: SessionState) -> bool {
        self.transition_if(|_| true, next)
    }

    /// Moves to `next` only if the session is still in `expected`.
    pub(super) fn transition_from(&self, expected: SessionState, next: SessionState) -> bool {
        self.transition_if(|current| current == expected, next)
    }

    fn transition_if(&self, guard: impl Fn(SessionState) -> bool, next: SessionState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|current| {
            if guard(*current) && current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) if changed => {
                info!("Server '{}': {} -> {}", self.id(), from, next);
                *lock(&self.ready_since) = (next == SessionState::Ready).then(Instant::now);
            }
            _ => debug!(
                "Server '{}': ignoring transition {} -> {}",
                self.id(),
                self.state(),
                next
            ),
        }
        changed
    }

    pub(super) fn attach(&self, connection: Arc<Connection>) {
        *lock(&self.connection) = Some(connection);
    }

    pub(super) fn detach(&self) -> Option<Arc<Connection>> {
        lock(&self.connection).take()
    }

    /// Detaches the current connection only if it is the given launch.
    pub(super) fn detach_generation(&self, generation: u64) -> Option<Arc<Connection>> {
        let mut current = lock(&self.connection);
        if current.as_ref().is_some_and(|c| c.generation() == generation) {
            current.take()
        } else {
            None
        }
    }

    pub(super) fn is_current(&self, connection: &Connection) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|c| c.generation() == connection.generation())
    }

    pub(super) fn connection(&self) -> Option<Arc<Connection>> {
        lock(&self.connection).clone()
    }

    pub(super) fn set_capabilities(&self, capabilities: CapabilitySet) {
        *lock(&self.capabilities) = capabilities;
    }

    pub(super) fn set_failure(&self, reason: impl Into<String>) {
        *lock(&self.failure) = Some(reason.into());
    }

    pub(super) fn ids(&self) -> Arc<AtomicI64> {
        self.ids.clone()
    }

    pub(super) fn diagnostics_cache(&self) -> DiagnosticsCache {
        self.diagnostics.clone()
    }

    /// Records a restart at `now` if fewer than `budget` restarts happened
    /// within `window`. Returns the attempt number inside the window.
    pub(super) fn record_restart(
        &self,
        now: Instant,
        window: Duration,
        budget: u32,
    ) -> Option<u32> {
        let mut history = lock(&self.restart_history);
        while history
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            history.pop_front();
        }
        if history.len() >= budget as usize {
            return None;
        }
        history.push_back(now);
        self.restart_count.fetch_add(1, Ordering::SeqCst);
        Some(u32::try_from(history.len()).unwrap_or(u32::MAX))
    }

    /// Total restarts over the session's life.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    /// Snapshot for `server_status`.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let connection = self.connection();
        SessionStatus {
            server: self.id().to_string(),
            state: self.state(),
            languages: self.definition.languages.clone(),
            restart_count: self.restart_count(),
            generation: connection.as_ref().map(|c| c.generation()),
            pid: connection.as_ref().and_then(|c| c.pid()),
            created_at: self.created_at,
            uptime_secs: lock(&self.ready_since).map(|at| at.elapsed().as_secs()),
            pending_requests: connection.as_ref().map_or(0, |c| c.pending().len()),
            capabilities: lock(&self.capabilities).names(),
            last_error: lock(&self.failure).clone(),
        }
    }
}

/// Serializable status of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Server id.
    pub server: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Languages the server is configured for.
    pub languages: Vec<String>,
    /// Restarts since the session was created.
    pub restart_count: u32,
    /// Launch generation of the current process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    /// OS process id of the current process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Seconds since the session last became ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    /// Requests awaiting a response.
    pub pending_requests: usize,
    /// Supported capability keys.
    pub capabilities: Vec<String>,
    /// Why the session failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Read-only handle on a session, used by the router.
#[derive(Debug, Clone)]
pub struct SessionView {
    session: Arc<BridgeSession>,
}

impl SessionView {
    pub(super) const fn new(session: Arc<BridgeSession>) -> Self {
        Self { session }
    }

    /// Server id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.session.id()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The definition the session was launched from.
    #[must_use]
    pub fn definition(&self) -> &ServerDefinition {
        self.session.definition()
    }

    /// Waits until the session is ready.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotReady`] if `timeout` elapses first,
    /// [`BridgeError::BackendUnavailable`] if the session failed for good, or
    /// [`BridgeError::SessionTerminated`] if it was stopped.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.session.state.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_settled()).await.map(|s| *s)
        })
        .await;

        match settled {
            Ok(Ok(SessionState::Ready)) => Ok(()),
            Ok(Ok(SessionState::PermanentlyFailed)) => Err(self.unavailable()),
            Ok(_) => Err(BridgeError::terminated(self.id(), "session stopped")),
            Err(_) => Err(BridgeError::NotReady {
                server: self.id().to_string(),
            }),
        }
    }

    fn unavailable(&self) -> BridgeError {
        let reason = lock(&self.session.failure)
            .clone()
            .unwrap_or_else(|| "server failed".to_string());
        BridgeError::unavailable(self.id(), reason)
    }

    /// What the backend advertised.
    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        lock(&self.session.capabilities).clone()
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.session.connection().ok_or_else(|| match self.state() {
            SessionState::PermanentlyFailed => self.unavailable(),
            _ => BridgeError::terminated(self.id(), "no running process"),
        })
    }

    /// Forwards a request to the current process.
    ///
    /// # Errors
    ///
    /// See [`Connection::request`].
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        ctx: &CallContext,
    ) -> Result<Value> {
        self.connection()?
            .request(method, params, timeout, ctx)
            .await
    }

    /// Makes sure `uri` is open on the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no process or the notification cannot be queued.
    pub async fn ensure_open(&self, uri: &str, language_id: &str) -> Result<bool> {
        self.connection()?.ensure_open(uri, language_id).await
    }

    /// Diagnostics last pushed for `uri`, if any.
    #[must_use]
    pub fn cached_diagnostics(&self, uri: &str) -> Option<Vec<Diagnostic>> {
        lock(&self.session.diagnostics).get(uri).cloned()
    }

    /// Status snapshot.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }
}

#[cfg(test)]
impl SessionView {
    /// A view on a session that was never launched, with a handle on its
    /// diagnostics cache.
    pub(crate) fn unlaunched(definition: ServerDefinition) -> (Self, DiagnosticsCache) {
        let session = Arc::new(BridgeSession::new(definition));
        let cache = session.diagnostics_cache();
        (Self::new(session), cache)
    }
}
