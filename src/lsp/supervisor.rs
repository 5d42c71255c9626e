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

//! Owns every backend session: lazy launch, crash recovery with a restart
//! budget and backoff, and graceful stop.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::connection::{BackendNotification, Connection, ConnectionSinks, ExitEvent};
use super::negotiator;
use super::pending::CallContext;
use super::session::{BridgeSession, SessionState, SessionStatus, SessionView};
use crate::config::BridgeSettings;
use crate::error::{BridgeError, Result};
use crate::registry::ServerRegistry;

/// Manages the lifecycle of backend sessions.
///
/// Cloning is cheap; clones share the same sessions.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: ServerRegistry,
    settings: BridgeSettings,
    root: PathBuf,
    sessions: Mutex<HashMap<String, Arc<BridgeSession>>>,
    generations: AtomicU64,
    exits: mpsc::UnboundedSender<ExitEvent>,
    notifications: mpsc::UnboundedSender<BackendNotification>,
    accepting: AtomicBool,
}

impl Supervisor {
    /// Creates a supervisor and starts its exit monitor.
    ///
    /// Backend notifications arrive on the returned receiver. Must be called
    /// inside a tokio runtime.
    #[must_use]
    pub fn new(
        registry: ServerRegistry,
        settings: BridgeSettings,
        root: PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<BackendNotification>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            registry,
            settings,
            root,
            sessions: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
            exits,
            notifications,
            accepting: AtomicBool::new(true),
        });
        tokio::spawn(monitor(Arc::downgrade(&inner), exit_rx));
        (Self { inner }, notification_rx)
    }

    /// The registry sessions are launched from.
    #[must_use]
    pub fn registry(&self) -> &ServerRegistry {
        &self.inner.registry
    }

    /// Timeouts and restart policy.
    #[must_use]
    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    /// Workspace root sent to backends.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Starts `id` if it is not already running and returns a view on it.
    ///
    /// The handshake runs in the background; use
    /// [`SessionView::wait_ready`] to wait for it.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotFound`] for an unknown id, [`BridgeError::Startup`]
    /// if the executable cannot be launched (the session is then
    /// permanently failed), or [`BridgeError::ShuttingDown`].
    pub async fn start(&self, id: &str) -> Result<SessionView> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }
        let definition = self.inner.registry.lookup(id)?.clone();

        let mut sessions = self.inner.sessions.lock().await;
        if let Some(session) = sessions.get(id) {
            return Ok(SessionView::new(session.clone()));
        }
        let session = Arc::new(BridgeSession::new(definition));
        // Published already starting so concurrent acquirers wait for it.
        session.transition(SessionState::Starting);
        sessions.insert(id.to_string(), session.clone());
        drop(sessions);

        launch(&self.inner, &session)?;
        Ok(SessionView::new(session))
    }

    /// Returns a view on `id`, launching it on first use.
    ///
    /// A permanently failed session is returned as is; its requests fail
    /// with `BackendUnavailableError`.
    ///
    /// # Errors
    ///
    /// As for [`start`](Self::start), except that a previously recorded
    /// launch failure is reported through the view rather than here.
    pub async fn acquire(&self, id: &str) -> Result<SessionView> {
        self.start(id).await
    }

    /// Stops `id`: graceful `shutdown`/`exit`, then a kill after the grace
    /// period. Outstanding requests fail with `SessionTerminatedError`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotFound`] if no session is active for `id`.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let session = self
            .inner
            .sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;
        stop_session(&self.inner.settings, &session).await;
        Ok(())
    }

    /// Stops accepting new sessions and stops every active one in parallel.
    pub async fn shutdown_all(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let sessions: Vec<Arc<BridgeSession>> = self
            .inner
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        if sessions.is_empty() {
            return;
        }

        info!("Stopping {} backend session(s)", sessions.len());
        let mut tasks = JoinSet::new();
        for session in sessions {
            let settings = self.inner.settings.clone();
            tasks.spawn(async move { stop_session(&settings, &session).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Session stop task failed: {}", e);
            }
        }
    }

    /// Status of every known session, in registry order.
    pub async fn status(&self) -> Vec<SessionStatus> {
        let sessions = self.inner.sessions.lock().await.clone();
        self.inner
            .registry
            .iter()
            .filter_map(|def| sessions.get(&def.id))
            .map(|s| s.status())
            .collect()
    }

    /// Current state of `id`, or `None` if it was never started.
    pub async fn state(&self, id: &str) -> Option<SessionState> {
        self.inner.sessions.lock().await.get(id).map(|s| s.state())
    }
}

/// Spawns a process for a `Starting` session and kicks off its handshake.
fn launch(inner: &Arc<Inner>, session: &Arc<BridgeSession>) -> Result<()> {
    let generation = inner.generations.fetch_add(1, Ordering::SeqCst);
    let sinks = ConnectionSinks {
        exits: inner.exits.clone(),
        notifications: inner.notifications.clone(),
        diagnostics: session.diagnostics_cache(),
    };

    match Connection::spawn(
        session.definition(),
        &inner.root,
        generation,
        session.ids(),
        sinks,
    ) {
        Ok(connection) => {
            session.attach(connection.clone());
            tokio::spawn(handshake(inner.clone(), session.clone(), connection));
            Ok(())
        }
        Err(err) => {
            error!("{}", err);
            session.set_failure(err.to_string());
            session.transition(SessionState::PermanentlyFailed);
            Err(err)
        }
    }
}

async fn handshake(inner: Arc<Inner>, session: Arc<BridgeSession>, connection: Arc<Connection>) {
    session.transition(SessionState::Initializing);
    let outcome = negotiator::negotiate(
        &connection,
        session.definition(),
        &inner.root,
        inner.settings.readiness_timeout(),
    )
    .await;

    match outcome {
        Ok(capabilities) if session.is_current(&connection) => {
            session.set_capabilities(capabilities);
            session.transition(SessionState::Ready);
        }
        Ok(_) => debug!(
            "'{}' finished a handshake for a replaced process",
            session.id()
        ),
        Err(e) => {
            // Killing hands the failure to the exit monitor, which treats
            // it as a crash.
            warn!("Handshake with '{}' failed: {}", session.id(), e);
            connection.kill();
        }
    }
}

async fn monitor(inner: Weak<Inner>, mut exits: mpsc::UnboundedReceiver<ExitEvent>) {
    while let Some(event) = exits.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let session = inner.sessions.lock().await.get(&event.server).cloned();
        match session {
            Some(session) => {
                // Backoff sleeps must not hold up exits from other backends.
                tokio::spawn(handle_exit(inner, session, event));
            }
            None => debug!(
                "Exit of '{}' (generation {}) after its session ended",
                event.server, event.generation
            ),
        }
    }
    debug!("Exit monitor finished");
}

async fn handle_exit(inner: Arc<Inner>, session: Arc<BridgeSession>, event: ExitEvent) {
    let Some(connection) = session.detach_generation(event.generation) else {
        debug!(
            "Ignoring exit of stale '{}' generation {}",
            event.server, event.generation
        );
        return;
    };
    let server = session.id().to_string();

    if !inner.accepting.load(Ordering::SeqCst) {
        session.transition(SessionState::Stopped);
        connection
            .pending()
            .fail_all(&BridgeError::terminated(&server, "bridge shutting down"));
        return;
    }

    warn!("'{}' exited unexpectedly: {}", server, event.status);
    let settings = &inner.settings;
    let Some(attempt) = session.record_restart(
        Instant::now(),
        settings.restart_window(),
        settings.restart_budget,
    ) else {
        let reason = format!(
            "crashed more than {} time(s) within {}s (last exit: {})",
            settings.restart_budget, settings.restart_window_secs, event.status
        );
        error!("Giving up on '{}': {}", server, reason);
        session.set_failure(reason.clone());
        session.transition(SessionState::PermanentlyFailed);
        connection
            .pending()
            .fail_all(&BridgeError::unavailable(&server, reason));
        return;
    };

    connection.pending().fail_all(&BridgeError::terminated(
        &server,
        format!("server exited ({}); restarting", event.status),
    ));
    session.transition(SessionState::Degraded);

    let delay = settings.restart_backoff(attempt);
    info!(
        "Restarting '{}' in {:?} (attempt {} of {})",
        server, delay, attempt, settings.restart_budget
    );
    tokio::time::sleep(delay).await;

    if !session.transition_from(SessionState::Degraded, SessionState::Starting) {
        debug!("'{}' left degraded state during backoff", server);
        return;
    }
    if let Err(e) = launch(&inner, &session) {
        error!("Restart of '{}' failed: {}", server, e);
    }
}

async fn stop_session(settings: &BridgeSettings, session: &BridgeSession) {
    let server = session.id().to_string();
    session.transition(SessionState::Stopped);
    let Some(connection) = session.detach() else {
        return;
    };

    let terminated = BridgeError::terminated(&server, "session stopped");
    connection.pending().fail_outstanding(&terminated);

    if !connection.has_exited() {
        let grace = settings.shutdown_grace();
        match connection
            .request("shutdown", Value::Null, grace, &CallContext::default())
            .await
        {
            Ok(_) => debug!("'{}' acknowledged shutdown", server),
            Err(e) => debug!("'{}' did not acknowledge shutdown: {}", server, e),
        }
        if let Err(e) = connection.notify("exit", Value::Null) {
            debug!("Could not send exit to '{}': {}", server, e);
        }

        if connection.wait_exit(grace).await {
            info!("'{}' exited", server);
        } else {
            warn!("'{}' did not exit within {:?}; killing", server, grace);
            connection.kill();
            if !connection.wait_exit(grace).await {
                error!("'{}' survived a kill", server);
            }
        }
    }

    connection.pending().fail_all(&terminated);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerDefinition;
    use anyhow::Result;

    fn supervisor(command: &str) -> Result<Supervisor> {
        let registry = ServerRegistry::load(vec![ServerDefinition::new(
            "ghost",
            command,
            Vec::new(),
            vec!["ghost".into()],
        )])?;
        let (supervisor, _notifications) =
            Supervisor::new(registry, BridgeSettings::default(), std::env::temp_dir());
        Ok(supervisor)
    }

    #[tokio::test]
    async fn test_unknown_server_is_not_found() -> Result<()> {
        let supervisor = supervisor("ghost-ls")?;
        let result = supervisor.start("nope").await;
        assert!(matches!(result, Err(BridgeError::NotFound(ref id)) if id == "nope"));
        assert!(supervisor.status().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_launch_failure_marks_session_failed() -> Result<()> {
        let supervisor = supervisor("/nonexistent/ghost-ls")?;
        let result = supervisor.start("ghost").await;
        assert!(matches!(result, Err(BridgeError::Startup { .. })));
        assert_eq!(
            supervisor.state("ghost").await,
            Some(SessionState::PermanentlyFailed)
        );

        // Later acquisitions see the failure through the view.
        let view = supervisor.acquire("ghost").await?;
        let ready = view.wait_ready(std::time::Duration::from_secs(1)).await;
        assert!(matches!(ready, Err(BridgeError::BackendUnavailable { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_is_abandoned_after_stop() -> Result<()> {
        let supervisor = supervisor("/nonexistent/ghost-ls")?;
        let session = Arc::new(BridgeSession::new(
            supervisor.inner.registry.lookup("ghost")?.clone(),
        ));
        assert!(!session.transition_from(SessionState::Degraded, SessionState::Starting));
        assert!(session.transition(SessionState::Starting));
        assert!(session.transition(SessionState::Degraded));
        // A stop lands during the restart backoff.
        assert!(session.transition(SessionState::Stopped));
        assert!(!session.transition_from(SessionState::Degraded, SessionState::Starting));
        assert_eq!(session.state(), SessionState::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_sessions() -> Result<()> {
        let supervisor = supervisor("ghost-ls")?;
        supervisor.shutdown_all().await;
        assert_eq!(
            supervisor.start("ghost").await.err(),
            Some(BridgeError::ShuttingDown)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_unknown_session() -> Result<()> {
        let supervisor = supervisor("ghost-ls")?;
        assert!(matches!(
            supervisor.stop("ghost").await,
            Err(BridgeError::NotFound(_))
        ));
        Ok(())
    }
}
