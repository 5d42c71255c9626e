// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! MCP server implementation.
//!
//! One reader loop decodes client messages; one writer task owns the output
//! stream. `tools/call` runs on its own task so a slow backend never holds
//! up `ping`, `tools/list`, or calls routed to other backends.

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use super::types::{
    CallToolParams, CallToolResult, CancelledParams, INVALID_PARAMS, INVALID_REQUEST,
    InitializeParams, InitializeResult, ListToolsResult, LoggingLevel, LoggingMessageParams,
    METHOD_NOT_FOUND, Notification, PARSE_ERROR, PROTOCOL_VERSION, Request, RequestId, Response,
    ServerCapabilities, ServerInfo, SetLevelParams, Tool, ToolsCapability,
};
use crate::codec::{FramedReader, FramedWriter, Framing};
use crate::error::CodecError;

/// The MCP request a tool call belongs to.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Id of the `tools/call` request.
    pub request_id: RequestId,
    /// Becomes `true` if the client sends `notifications/cancelled`.
    pub cancelled: watch::Receiver<bool>,
}

/// Trait for handling MCP tool calls.
pub trait ToolHandler: Send + Sync + 'static {
    /// Returns the list of available tools.
    fn list_tools(&self) -> Vec<Tool>;

    /// Handles a tool call. Failures are reported inside the result with
    /// `isError` set; they never fail the JSON-RPC request.
    fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        call: ToolCall,
    ) -> impl Future<Output = CallToolResult> + Send;
}

type InFlight = Arc<Mutex<HashMap<RequestId, watch::Sender<bool>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// MCP server speaking JSON-RPC over a byte stream pair (normally stdio).
pub struct McpServer<H: ToolHandler> {
    handler: Arc<H>,
    drain_grace: Duration,
    instructions: Option<String>,
}

/// Per-connection state shared by the reader loop and call tasks.
struct Session<H: ToolHandler> {
    handler: Arc<H>,
    out: mpsc::UnboundedSender<Value>,
    in_flight: InFlight,
    calls: JoinSet<()>,
    min_level: LoggingLevel,
    instructions: Option<String>,
}

impl<H: ToolHandler> McpServer<H> {
    /// Creates a server around `handler`.
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            drain_grace: Duration::from_secs(5),
            instructions: None,
        }
    }

    /// How long in-flight calls may keep running after intake stops.
    #[must_use]
    pub const fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Usage hint sent in the `initialize` result.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Serves one client until its input closes or `shutdown` resolves, then
    /// gives in-flight calls the drain grace period to finish.
    ///
    /// `events` carries server-initiated notifications to forward.
    ///
    /// # Errors
    ///
    /// Returns an error if the output stream fails.
    pub async fn run<R, W>(
        self,
        input: R,
        output: W,
        mut events: mpsc::UnboundedReceiver<Notification>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (framing_tx, framing_rx) = watch::channel(Framing::default());
        let writer = tokio::spawn(write_loop(output, out_rx, framing_rx));

        let mut session = Session {
            handler: self.handler,
            out: out_tx,
            in_flight: InFlight::default(),
            calls: JoinSet::new(),
            min_level: LoggingLevel::Debug,
            instructions: self.instructions,
        };

        info!("MCP server starting, waiting for requests on stdin");
        let mut reader = FramedReader::new(input);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested; no longer accepting requests");
                    break;
                }
                Some(event) = events.recv() => session.forward_event(event),
                Some(joined) = session.calls.join_next(), if !session.calls.is_empty() => {
                    if let Err(e) = joined {
                        error!("Tool call task failed: {}", e);
                    }
                }
                next = reader.next() => match next {
                    None => {
                        info!("MCP server shutting down (stdin closed)");
                        break;
                    }
                    Some(Ok(frame)) => {
                        framing_tx.send_replace(frame.framing);
                        session.handle_message(frame.value);
                    }
                    Some(Err(e)) if e.is_fatal() => {
                        error!("Unrecoverable error on MCP input: {}", e);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Discarding malformed MCP message: {}", e);
                        if matches!(e, CodecError::Parse(_)) {
                            session.reply(Response::error(None, PARSE_ERROR, format!("Parse error: {e}")));
                        }
                    }
                },
            }
        }

        session.drain(self.drain_grace).await;
        drop(session);
        match writer.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("MCP writer task failed: {e}")),
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    output: W,
    mut messages: mpsc::UnboundedReceiver<Value>,
    framing: watch::Receiver<Framing>,
) -> Result<()> {
    let mut writer = FramedWriter::new(output);
    while let Some(message) = messages.recv().await {
        trace!("Sending: {}", message);
        let mode = *framing.borrow();
        writer.send(mode, &message).await?;
    }
    Ok(())
}

impl<H: ToolHandler> Session<H> {
    fn reply(&self, response: Response) {
        match serde_json::to_value(&response) {
            Ok(value) => {
                if self.out.send(value).is_err() {
                    warn!("MCP writer closed; dropping response");
                }
            }
            Err(e) => error!("Failed to serialize response: {}", e),
        }
    }

    fn respond(&self, id: RequestId, result: impl serde::Serialize) {
        match Response::success(id.clone(), result) {
            Ok(response) => self.reply(response),
            Err(e) => self.reply(Response::error(
                Some(id),
                super::types::INTERNAL_ERROR,
                e.to_string(),
            )),
        }
    }

    fn forward_event(&self, event: Notification) {
        if event.method == "notifications/message"
            && let Some(level) = event
                .params
                .as_ref()
                .and_then(|p| p.get("level"))
                .and_then(|l| serde_json::from_value::<LoggingLevel>(l.clone()).ok())
            && level < self.min_level
        {
            return;
        }
        match serde_json::to_value(&event) {
            Ok(value) => {
                let _ = self.out.send(value);
            }
            Err(e) => error!("Failed to serialize notification: {}", e),
        }
    }

    fn handle_message(&mut self, value: Value) {
        trace!("Received: {}", value);
        let has_method = value.get("method").is_some_and(Value::is_string);
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        match (has_method, has_id) {
            (true, true) => match serde_json::from_value::<Request>(value) {
                Ok(request) => self.handle_request(request),
                Err(e) => self.reply(Response::error(
                    None,
                    INVALID_REQUEST,
                    format!("Invalid request: {e}"),
                )),
            },
            (true, false) => match serde_json::from_value::<Notification>(value) {
                Ok(notification) => self.handle_notification(&notification),
                Err(e) => warn!("Ignoring malformed notification: {}", e),
            },
            (false, true) => debug!("Ignoring response from client: {}", value),
            (false, false) => self.reply(Response::error(
                None,
                INVALID_REQUEST,
                "Invalid request: missing method",
            )),
        }
    }

    fn handle_request(&mut self, request: Request) {
        debug!("Handling request: {} (id={:?})", request.method, request.id);

        match request.method.as_str() {
            "initialize" => self.handle_initialize(request),
            "tools/list" => {
                let tools = self.handler.list_tools();
                debug!("Listing {} tools", tools.len());
                self.respond(request.id, ListToolsResult { tools });
            }
            "tools/call" => self.handle_tools_call(request),
            "logging/setLevel" => match parse_params::<SetLevelParams>(request.params) {
                Ok(params) => {
                    info!("MCP client set log level to {:?}", params.level);
                    self.min_level = params.level;
                    self.respond(request.id, serde_json::json!({}));
                }
                Err(message) => self.reply(Response::error(Some(request.id), INVALID_PARAMS, message)),
            },
            "ping" => self.respond(request.id, serde_json::json!({})),
            _ => {
                warn!("Unknown method: {}", request.method);
                self.reply(Response::error(
                    Some(request.id),
                    METHOD_NOT_FOUND,
                    format!("Unknown method: {}", request.method),
                ));
            }
        }
    }

    fn handle_notification(&self, notification: &Notification) {
        debug!("Handling notification: {}", notification.method);

        match notification.method.as_str() {
            "notifications/initialized" => info!("MCP client initialized"),
            "notifications/cancelled" => {
                match parse_params::<CancelledParams>(notification.params.clone()) {
                    Ok(params) => {
                        if let Some(signal) = lock(&self.in_flight).get(&params.request_id) {
                            info!(
                                "Cancelling call {} ({})",
                                params.request_id,
                                params.reason.as_deref().unwrap_or("no reason given")
                            );
                            signal.send_replace(true);
                        } else {
                            debug!("Cancel for unknown call {}", params.request_id);
                        }
                    }
                    Err(message) => warn!("Ignoring cancellation: {}", message),
                }
            }
            _ => debug!("Ignoring unknown notification: {}", notification.method),
        }
    }

    fn handle_initialize(&self, request: Request) {
        let params = match parse_params::<InitializeParams>(request.params) {
            Ok(params) => params,
            Err(message) => {
                self.reply(Response::error(Some(request.id), INVALID_PARAMS, message));
                return;
            }
        };

        if let Some(client) = &params.client_info {
            info!(
                "MCP client connecting: {} v{}",
                client.name,
                client.version.as_deref().unwrap_or("unknown")
            );
        }
        info!("Protocol version: {}", params.protocol_version);

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: None }),
                logging: Some(serde_json::json!({})),
            },
            server_info: ServerInfo {
                name: "lsp-mcp-server".to_string(),
                version: Some(env!("LSP_MCP_VERSION").to_string()),
            },
            instructions: self.instructions.clone(),
        };
        self.respond(request.id, result);
    }

    fn handle_tools_call(&mut self, request: Request) {
        let params = match parse_params::<CallToolParams>(request.params) {
            Ok(params) => params,
            Err(message) => {
                self.reply(Response::error(Some(request.id), INVALID_PARAMS, message));
                return;
            }
        };

        debug!("Calling tool: {}", params.name);
        let id = request.id;
        let (signal, cancelled) = watch::channel(false);
        lock(&self.in_flight).insert(id.clone(), signal);

        let handler = self.handler.clone();
        let in_flight = self.in_flight.clone();
        let out = self.out.clone();
        self.calls.spawn(async move {
            let call = ToolCall {
                request_id: id.clone(),
                cancelled,
            };
            let result = handler.call_tool(&params.name, params.arguments, call).await;
            lock(&in_flight).remove(&id);

            if result.is_error == Some(true) {
                debug!("Tool {} failed: {:?}", params.name, result.first_text());
            }
            let response = match Response::success(id.clone(), result) {
                Ok(response) => response,
                Err(e) => Response::error(Some(id), super::types::INTERNAL_ERROR, e.to_string()),
            };
            match serde_json::to_value(&response) {
                Ok(value) => {
                    let _ = out.send(value);
                }
                Err(e) => error!("Failed to serialize tool result: {}", e),
            }
        });
    }

    async fn drain(&mut self, grace: Duration) {
        if self.calls.is_empty() {
            return;
        }
        info!("Waiting up to {:?} for {} in-flight call(s)", grace, self.calls.len());
        let calls = &mut self.calls;
        let drained = tokio::time::timeout(grace, async {
            while calls.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Abandoning {} call(s) still running", self.calls.len());
            self.calls.abort_all();
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, String> {
    let params = params.ok_or_else(|| "Missing params".to_string())?;
    serde_json::from_value(params).map_err(|e| format!("Invalid params: {e}"))
}

/// Builds a `notifications/message` event.
#[must_use]
pub fn log_event(level: LoggingLevel, logger: &str, data: Value) -> Notification {
    let params = LoggingMessageParams {
        level,
        logger: Some(logger.to_string()),
        data,
    };
    Notification::new("notifications/message", serde_json::to_value(params).ok())
}
