// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! LSP results and notifications rendered for the MCP client.
//!
//! Results are translated structurally: the LSP payload is carried as-is in
//! `structuredContent` and pretty-printed into the text block.

use serde_json::{Value, json};
use tracing::trace;

use crate::error::BridgeError;
use crate::lsp::BackendNotification;
use crate::mcp::{CallToolResult, LoggingLevel, Notification, log_event};

/// Wraps an LSP result for the MCP caller. A `null` result means the server
/// had nothing to say at that position.
#[must_use]
pub fn tool_result(result: Value) -> CallToolResult {
    let text = if result.is_null() {
        "No result".to_string()
    } else {
        serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string())
    };
    CallToolResult::text(text).with_structured(json!({ "result": result }))
}

/// Reports a failed call as a tool error that names the error kind.
#[must_use]
pub fn tool_error(err: &BridgeError) -> CallToolResult {
    CallToolResult::error(format!("{}: {err}", err.kind())).with_structured(json!({
        "error": {
            "kind": err.kind(),
            "message": err.to_string(),
        }
    }))
}

/// Maps an LSP `MessageType` (1 = Error .. 4 = Log) to an MCP logging level.
const fn message_level(message_type: i64) -> LoggingLevel {
    match message_type {
        1 => LoggingLevel::Error,
        2 => LoggingLevel::Warning,
        3 => LoggingLevel::Info,
        _ => LoggingLevel::Debug,
    }
}

/// Turns a backend notification into an MCP event, or `None` if it is not
/// forwarded.
#[must_use]
pub fn notification_event(notification: &BackendNotification) -> Option<Notification> {
    let level = match notification.method.as_str() {
        "textDocument/publishDiagnostics" => LoggingLevel::Info,
        "window/logMessage" | "window/showMessage" => message_level(
            notification
                .params
                .get("type")
                .and_then(Value::as_i64)
                .unwrap_or(4),
        ),
        _ => {
            trace!(
                "Dropping notification {} from '{}'",
                notification.method, notification.server
            );
            return None;
        }
    };

    Some(log_event(
        level,
        &notification.server,
        json!({
            "method": notification.method,
            "params": notification.params,
        }),
    ))
}
