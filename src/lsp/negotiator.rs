// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The `initialize` / `initialized` handshake.

use lsp_types::{
    ClientCapabilities, ClientInfo, GeneralClientCapabilities, HoverClientCapabilities,
    InitializeParams, MarkupKind, PositionEncodingKind, PublishDiagnosticsClientCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncClientCapabilities, Uri,
    WindowClientCapabilities, WorkspaceClientCapabilities, WorkspaceFolder,
};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::connection::Connection;
use super::pending::CallContext;
use super::session::CapabilitySet;
use crate::error::{BridgeError, Result};
use crate::registry::ServerDefinition;

/// What the bridge tells every backend it can do.
#[must_use]
pub fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        general: Some(GeneralClientCapabilities {
            position_encodings: Some(vec![PositionEncodingKind::UTF16]),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities::default()),
            hover: Some(HoverClientCapabilities {
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                ..Default::default()
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
            ..Default::default()
        }),
        workspace: Some(WorkspaceClientCapabilities {
            configuration: Some(true),
            workspace_folders: Some(true),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the `initialize` parameters for `definition` rooted at `root`.
///
/// # Errors
///
/// Returns [`BridgeError::Startup`] if `root` cannot be expressed as a URI.
#[allow(
    deprecated,
    reason = "root_uri is still read by servers that predate workspace folders"
)]
pub fn initialize_params(definition: &ServerDefinition, root: &Path) -> Result<InitializeParams> {
    let root_uri: Uri = url::Url::from_file_path(root)
        .ok()
        .and_then(|url| url.as_str().parse().ok())
        .ok_or_else(|| BridgeError::Startup {
            server: definition.id.clone(),
            message: format!("workspace root {} is not an absolute path", root.display()),
        })?;

    Ok(InitializeParams {
        process_id: Some(std::process::id()),
        client_info: Some(ClientInfo {
            name: "lsp-mcp-server".to_string(),
            version: Some(env!("LSP_MCP_VERSION").to_string()),
        }),
        capabilities: client_capabilities(),
        workspace_folders: Some(vec![WorkspaceFolder {
            uri: root_uri.clone(),
            name: root
                .file_name()
                .map_or_else(|| "workspace".to_string(), |s| s.to_string_lossy().to_string()),
        }]),
        root_uri: Some(root_uri),
        initialization_options: definition.initialization_options.clone(),
        ..Default::default()
    })
}

/// Runs the handshake on a freshly spawned process and returns what the
/// backend advertised. `timeout` bounds the `initialize` request.
///
/// # Errors
///
/// Any error from the `initialize` request, or a closed connection when
/// sending `initialized`.
pub async fn negotiate(
    connection: &Connection,
    definition: &ServerDefinition,
    root: &Path,
    timeout: Duration,
) -> Result<CapabilitySet> {
    let params = serde_json::to_value(initialize_params(definition, root)?)
        .map_err(|e| BridgeError::Parse(e.to_string()))?;

    let result = connection
        .request("initialize", params, timeout, &CallContext::default())
        .await?;

    let capabilities = CapabilitySet::from_initialize_result(&result);
    let server_name = result
        .pointer("/serverInfo/name")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    info!(
        "'{}' initialized ({}), {} capabilities",
        definition.id,
        server_name,
        capabilities.names().len()
    );
    debug!("'{}' capabilities: {:?}", definition.id, capabilities.names());

    connection.notify("initialized", json!({}))?;
    Ok(capabilities)
}
