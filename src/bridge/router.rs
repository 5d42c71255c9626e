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

//! Routes tool calls to a backend and forwards them as LSP requests.

use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::tools::{ToolArgs, ToolKind, ToolSpec};
use crate::error::{BridgeError, Result};
use crate::lsp::{CallContext, SessionView, Supervisor};
use crate::registry::RoutingTable;

/// How long the diagnostics tool waits for a first push after opening a
/// document on a server without pull diagnostics.
const DIAGNOSTICS_PATIENCE: Duration = Duration::from_secs(2);
const DIAGNOSTICS_POLL: Duration = Duration::from_millis(50);

/// Resolves backends by language tag and runs tool calls against them.
#[derive(Clone)]
pub struct Router {
    supervisor: Supervisor,
    routing: RoutingTable,
}

impl Router {
    /// Creates a router over `supervisor`'s sessions.
    #[must_use]
    pub const fn new(supervisor: Supervisor, routing: RoutingTable) -> Self {
        Self {
            supervisor,
            routing,
        }
    }

    /// The supervisor requests are sent through.
    #[must_use]
    pub const fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// The server that handles `language`, or the default server.
    ///
    /// # Errors
    ///
    /// See [`RoutingTable::route`].
    pub fn route(&self, language: Option<&str>) -> Result<&str> {
        self.routing.route(language)
    }

    /// Runs one tool call to completion.
    ///
    /// Arguments are validated before any backend is touched, so a bad call
    /// never spawns a process. The backend is launched on first use and the
    /// call waits (bounded by the readiness timeout) for its handshake.
    ///
    /// # Errors
    ///
    /// Routing, readiness, capability and argument errors, plus whatever the
    /// backend request fails with.
    pub async fn dispatch(
        &self,
        spec: &ToolSpec,
        args: &ToolArgs,
        ctx: &CallContext,
    ) -> Result<Value> {
        if spec.kind == ToolKind::ServerStatus {
            return self.status().await;
        }
        let method = spec
            .method
            .ok_or_else(|| BridgeError::UnknownTool(spec.name.to_string()))?;
        let params = spec.build_params(args)?;
        let uri = if spec.is_document_scoped() {
            Some(args.document_uri()?)
        } else {
            None
        };

        let server = self.route(args.language.as_deref())?;
        let settings = self.supervisor.settings();
        let view = self.supervisor.acquire(server).await?;
        view.wait_ready(settings.readiness_timeout()).await?;

        let capabilities = view.capabilities();
        if let Some(capability) = spec.capability
            && !capabilities.supports(capability)
        {
            return Err(BridgeError::UnsupportedCapability {
                server: server.to_string(),
                capability: capability.to_string(),
            });
        }

        let mut opened = false;
        if let Some(uri) = &uri {
            let language = args
                .language
                .as_deref()
                .or_else(|| view.definition().languages.first().map(String::as_str))
                .unwrap_or_default();
            opened = view.ensure_open(uri, language).await?;
        }

        if spec.kind == ToolKind::Diagnostics && !capabilities.supports("diagnosticProvider") {
            let uri = uri.unwrap_or_default();
            return Ok(pushed_diagnostics(&view, &uri, opened).await);
        }

        debug!(
            "Forwarding {} to '{}' as {} (origin {:?})",
            spec.name, server, method, ctx.origin
        );
        view.request(method, params, settings.request_timeout(), ctx)
            .await
    }

    /// Snapshot of every started session.
    async fn status(&self) -> Result<Value> {
        let sessions = self.supervisor.status().await;
        let mut known = serde_json::to_value(&sessions)
            .map_err(|e| BridgeError::Parse(e.to_string()))?;

        // Configured servers that were never started still show up.
        if let Value::Array(entries) = &mut known {
            for def in self.supervisor.registry().iter() {
                if !sessions.iter().any(|s| s.server == def.id) {
                    entries.push(json!({
                        "server": def.id,
                        "state": "stopped",
                        "languages": def.languages,
                        "restart_count": 0,
                    }));
                }
            }
        }

        Ok(json!({
            "default_server": self.routing.default_server(),
            "sessions": known,
        }))
    }
}

/// Diagnostics from the push cache, shaped like a full pull report.
///
/// A document opened by this very call has had no chance to be analysed yet,
/// so the first push is waited for briefly.
async fn pushed_diagnostics(view: &SessionView, uri: &str, just_opened: bool) -> Value {
    let deadline = Instant::now() + DIAGNOSTICS_PATIENCE;
    loop {
        if let Some(items) = view.cached_diagnostics(uri) {
            return json!({ "kind": "full", "items": items });
        }
        if !just_opened || Instant::now() >= deadline {
            info!("No diagnostics published for {} by '{}'", uri, view.id());
            return json!({ "kind": "full", "items": [] });
        }
        tokio::time::sleep(DIAGNOSTICS_POLL).await;
    }
}
