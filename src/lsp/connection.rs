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

//! One running backend process and the tasks that talk to it.
//!
//! Each connection owns three tasks: a writer draining an outbound queue
//! into the child's stdin, a reader routing the child's stdout, and an exit
//! watcher that owns the `Child` and reports when it goes away. Slow output
//! from one backend never blocks writes to it or to any other backend.

use lsp_types::{
    Diagnostic, DidOpenTextDocumentParams, PublishDiagnosticsParams, TextDocumentItem, Uri,
};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Notify, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::pending::{CallContext, Outcome, PendingTable};
use super::protocol::{
    Incoming, METHOD_NOT_FOUND, NotificationMessage, REQUEST_CANCELLED, RequestId, RequestMessage,
    ResponseMessage,
};
use crate::codec::{Framing, FramedReader, FramedWriter};
use crate::error::{BridgeError, Result};
use crate::registry::ServerDefinition;

/// Diagnostics most recently pushed by a backend, keyed by document URI.
pub type DiagnosticsCache = Arc<std::sync::Mutex<HashMap<String, Vec<Diagnostic>>>>;

/// A notification a backend sent on its own initiative.
#[derive(Debug, Clone)]
pub struct BackendNotification {
    /// Server id of the sender.
    pub server: String,
    /// LSP method, e.g. `window/logMessage`.
    pub method: String,
    /// Notification parameters.
    pub params: Value,
}

/// Reported by the exit watcher when a backend process ends.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    /// Server id.
    pub server: String,
    /// Which launch of the server this was.
    pub generation: u64,
    /// Human-readable exit status.
    pub status: String,
}

/// Where a connection delivers what it observes.
#[derive(Debug, Clone)]
pub struct ConnectionSinks {
    /// Process exits.
    pub exits: mpsc::UnboundedSender<ExitEvent>,
    /// Server-initiated notifications.
    pub notifications: mpsc::UnboundedSender<BackendNotification>,
    /// Per-session diagnostics cache fed by `publishDiagnostics`.
    pub diagnostics: DiagnosticsCache,
}

/// A live backend process.
#[derive(Debug)]
pub struct Connection {
    server: String,
    generation: u64,
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<Value>,
    pending: Arc<PendingTable>,
    ids: Arc<AtomicI64>,
    open_documents: Mutex<HashSet<String>>,
    kill: Arc<Notify>,
    exited: watch::Receiver<bool>,
}

impl Connection {
    /// Spawns the server described by `definition` in `root`.
    ///
    /// `ids` is shared across every launch of the same session so a
    /// correlation id is never reused while the session lives.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Startup`] if the executable cannot be launched.
    pub fn spawn(
        definition: &ServerDefinition,
        root: &Path,
        generation: u64,
        ids: Arc<AtomicI64>,
        sinks: ConnectionSinks,
    ) -> Result<Arc<Self>> {
        let server = definition.id.clone();
        info!(
            "Spawning '{}' (generation {}): {} {}",
            server,
            generation,
            definition.command,
            definition.args.join(" ")
        );

        let startup = |message: String| BridgeError::Startup {
            server: server.clone(),
            message,
        };

        let mut child = Command::new(&definition.command)
            .args(&definition.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| startup(format!("{}: {e}", definition.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| startup("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| startup("stdout not captured".to_string()))?;
        let pid = child.id();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited) = watch::channel(false);
        let pending = Arc::new(PendingTable::new(server.clone()));
        let kill = Arc::new(Notify::new());

        tokio::spawn(write_loop(stdin, outbound_rx, server.clone()));
        tokio::spawn(read_loop(
            stdout,
            Inbound {
                server: server.clone(),
                pending: pending.clone(),
                outbound: outbound.clone(),
                notifications: sinks.notifications,
                diagnostics: sinks.diagnostics,
                kill: kill.clone(),
            },
        ));
        tokio::spawn(watch_exit(
            child,
            kill.clone(),
            exited_tx,
            ExitEvent {
                server: server.clone(),
                generation,
                status: String::new(),
            },
            sinks.exits,
        ));

        debug!("'{}' started with pid {:?}", server, pid);

        Ok(Arc::new(Self {
            server,
            generation,
            pid,
            outbound,
            pending,
            ids,
            open_documents: Mutex::new(HashSet::new()),
            kill,
            exited,
        }))
    }

    /// Server id.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Launch generation of this process within its session.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// OS process id, if still known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The in-flight table for this process.
    #[must_use]
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Sends a request and waits for its response.
    ///
    /// The caller is resolved exactly once: by the matching response, by
    /// the deadline, or by the process going away. A cancel signal in `ctx`
    /// forwards `$/cancelRequest` and keeps waiting.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Timeout`], [`BridgeError::Backend`] for a JSON-RPC
    /// error reply, or the session's termination error.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        ctx: &CallContext,
    ) -> Result<Value> {
        let id = self.ids.fetch_add(1, Ordering::SeqCst);
        let message = serde_json::to_value(RequestMessage::new(id, method, params))
            .map_err(|e| BridgeError::Parse(e.to_string()))?;

        let (mut rx, deadline) = self
            .pending
            .insert(id, method, ctx.origin.clone(), timeout)?;

        trace!("-> '{}' request {} {}", self.server, id, method);
        if self.outbound.send(message).is_err() {
            self.pending.remove(id);
            return Err(BridgeError::terminated(&self.server, "connection closed"));
        }

        let mut cancel = ctx.cancel.clone();
        let mut cancel_sent = false;
        loop {
            tokio::select! {
                outcome = &mut rx => return self.settle(outcome),
                () = tokio::time::sleep_until(deadline) => {
                    self.pending.sweep_expired(Instant::now());
                    return self.settle((&mut rx).await);
                }
                () = cancelled(cancel.as_mut()), if !cancel_sent => {
                    cancel_sent = true;
                    debug!("Cancelling request {} ({}) on '{}'", id, method, self.server);
                    if let Err(e) = self.notify("$/cancelRequest", json!({ "id": id })) {
                        debug!("Could not forward cancellation: {}", e);
                    }
                }
            }
        }
    }

    fn settle(
        &self,
        outcome: std::result::Result<Outcome, oneshot::error::RecvError>,
    ) -> Result<Value> {
        outcome.unwrap_or_else(|_| {
            Err(BridgeError::terminated(
                &self.server,
                "request dropped without a reply",
            ))
        })
    }

    /// Queues a notification.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SessionTerminated`] if the writer is gone.
    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        let message = serde_json::to_value(NotificationMessage::new(method, params))
            .map_err(|e| BridgeError::Parse(e.to_string()))?;
        trace!("-> '{}' notification {}", self.server, method);
        self.outbound
            .send(message)
            .map_err(|_| BridgeError::terminated(&self.server, "connection closed"))
    }

    /// Opens `uri` on this process with `textDocument/didOpen` if it is a
    /// readable local file that has not been opened yet.
    ///
    /// Returns true if a `didOpen` was sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the notification cannot be queued.
    pub async fn ensure_open(&self, uri: &str, language_id: &str) -> Result<bool> {
        let mut open = self.open_documents.lock().await;
        if open.contains(uri) {
            return Ok(false);
        }

        let Some(path) = url::Url::parse(uri)
            .ok()
            .filter(|u| u.scheme() == "file")
            .and_then(|u| u.to_file_path().ok())
        else {
            return Ok(false);
        };

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                debug!("Not opening {}: {}", path.display(), e);
                return Ok(false);
            }
        };

        let lsp_uri: Uri = uri
            .parse()
            .map_err(|_| BridgeError::invalid_arguments(format!("invalid URI '{uri}'")))?;
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: lsp_uri,
                language_id: language_id.to_string(),
                version: 1,
                text,
            },
        };
        let params =
            serde_json::to_value(params).map_err(|e| BridgeError::Parse(e.to_string()))?;
        self.notify("textDocument/didOpen", params)?;
        open.insert(uri.to_string());
        drop(open);

        debug!("Opened {} on '{}'", uri, self.server);
        Ok(true)
    }

    /// Forcibly terminates the process.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Waits up to `grace` for the process to exit. Returns true if it did.
    pub async fn wait_exit(&self, grace: Duration) -> bool {
        let mut exited = self.exited.clone();
        tokio::time::timeout(grace, exited.wait_for(|gone| *gone))
            .await
            .is_ok()
    }

    /// Returns true once the process has exited.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

async fn cancelled(signal: Option<&mut watch::Receiver<bool>>) {
    if let Some(rx) = signal
        && rx.wait_for(|c| *c).await.is_ok()
    {
        return;
    }
    std::future::pending::<()>().await;
}

async fn write_loop(
    stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    server: String,
) {
    let mut writer = FramedWriter::new(stdin);
    while let Some(message) = outbound.recv().await {
        if let Err(e) = writer.send(Framing::Header, &message).await {
            warn!("Failed to write to '{}': {}", server, e);
            break;
        }
    }
    trace!("Writer for '{}' finished", server);
}

/// Reader-side routing state.
struct Inbound {
    server: String,
    pending: Arc<PendingTable>,
    outbound: mpsc::UnboundedSender<Value>,
    notifications: mpsc::UnboundedSender<BackendNotification>,
    diagnostics: DiagnosticsCache,
    kill: Arc<Notify>,
}

async fn read_loop(stdout: ChildStdout, inbound: Inbound) {
    let mut reader = FramedReader::new(stdout);
    while let Some(next) = reader.next().await {
        match next {
            Ok(frame) => inbound.dispatch(frame.value),
            Err(e) if e.is_fatal() => {
                error!("Unrecoverable stream error from '{}': {}", inbound.server, e);
                inbound.kill.notify_one();
                break;
            }
            Err(e) => warn!("Resynchronising stream from '{}' after {}", inbound.server, e),
        }
    }
    debug!("'{}' stdout closed", inbound.server);
}

impl Inbound {
    fn dispatch(&self, value: Value) {
        match Incoming::classify(value) {
            Incoming::Response(response) => self.on_response(response),
            Incoming::Request(request) => self.on_request(&request),
            Incoming::Notification(notification) => self.on_notification(notification),
            Incoming::Invalid(value) => {
                warn!("Ignoring non JSON-RPC message from '{}': {}", self.server, value);
            }
        }
    }

    fn on_response(&self, response: ResponseMessage) {
        let Some(RequestId::Number(id)) = response.id else {
            warn!(
                "Response from '{}' carries an id the bridge never issued: {:?}",
                self.server, response.id
            );
            return;
        };
        let outcome = match response.error {
            Some(err) if err.code == REQUEST_CANCELLED => {
                debug!("'{}' cancelled request {}", self.server, id);
                Err(BridgeError::Cancelled {
                    server: self.server.clone(),
                    message: err.message,
                })
            }
            Some(err) => Err(BridgeError::Backend {
                server: self.server.clone(),
                code: err.code,
                message: err.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        self.pending.complete(id, outcome);
    }

    fn on_request(&self, request: &RequestMessage) {
        debug!(
            "Received server request from '{}': {} (id: {})",
            self.server, request.method, request.id
        );
        let reply = reply_to_server_request(request);
        match serde_json::to_value(reply) {
            Ok(value) => {
                if self.outbound.send(value).is_err() {
                    debug!("Writer for '{}' gone; dropping reply", self.server);
                }
            }
            Err(e) => warn!("Failed to encode reply to '{}': {}", self.server, e),
        }
    }

    fn on_notification(&self, notification: NotificationMessage) {
        if notification.method == "textDocument/publishDiagnostics" {
            match serde_json::from_value::<PublishDiagnosticsParams>(notification.params.clone()) {
                Ok(params) => {
                    debug!(
                        "Received {} diagnostics for {} from '{}'",
                        params.diagnostics.len(),
                        params.uri.as_str(),
                        self.server
                    );
                    self.diagnostics
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(params.uri.as_str().to_string(), params.diagnostics);
                }
                Err(e) => warn!("Failed to parse publishDiagnostics params: {}", e),
            }
        }

        let _ = self.notifications.send(BackendNotification {
            server: self.server.clone(),
            method: notification.method,
            params: notification.params,
        });
    }
}

/// Answers a request a backend sent to the bridge so the backend never
/// blocks waiting on a client that has no editor behind it.
#[must_use]
pub fn reply_to_server_request(request: &RequestMessage) -> ResponseMessage {
    let id = request.id.clone();
    match request.method.as_str() {
        "workspace/configuration" => {
            let items = request
                .params
                .get("items")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            ResponseMessage::success(id, Value::Array(vec![Value::Null; items]))
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create"
        | "window/showMessageRequest" => ResponseMessage::success(id, Value::Null),
        "workspace/applyEdit" => ResponseMessage::success(
            id,
            json!({ "applied": false, "failureReason": "edits are not applied by this client" }),
        ),
        method => ResponseMessage::error(
            id,
            METHOD_NOT_FOUND,
            format!("Method '{method}' not supported by client"),
        ),
    }
}

async fn watch_exit(
    mut child: Child,
    kill: Arc<Notify>,
    exited: watch::Sender<bool>,
    mut event: ExitEvent,
    exits: mpsc::UnboundedSender<ExitEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.notified() => {
            debug!("Killing '{}' (generation {})", event.server, event.generation);
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill '{}': {}", event.server, e);
            }
            child.wait().await
        }
    };

    event.status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };
    debug!(
        "'{}' (generation {}) exited: {}",
        event.server, event.generation, event.status
    );
    exited.send_replace(true);
    let _ = exits.send(event);
}
