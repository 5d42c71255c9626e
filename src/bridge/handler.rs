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

//! Bridge handler that maps MCP tool calls to LSP requests.

use serde_json::Value;
use std::time::Instant;
use tracing::{debug, warn};

use super::router::Router;
use super::tools::{self, ToolArgs, ToolSpec};
use super::translate::{tool_error, tool_result};
use crate::error::Result;
use crate::lsp::CallContext;
use crate::mcp::{CallToolResult, Tool, ToolCall, ToolHandler};

/// Serves the tool catalogue over a [`Router`].
pub struct LspBridgeHandler {
    router: Router,
}

impl LspBridgeHandler {
    /// Creates a new `LspBridgeHandler`.
    #[must_use]
    pub const fn new(router: Router) -> Self {
        Self { router }
    }

    async fn run(&self, name: &str, arguments: Option<Value>, call: ToolCall) -> Result<Value> {
        let spec = tools::find(name)?;
        let args = ToolArgs::parse(arguments)?;
        let ctx = CallContext {
            origin: Some(call.request_id.to_string()),
            cancel: Some(call.cancelled),
        };
        self.router.dispatch(spec, &args, &ctx).await
    }
}

impl ToolHandler for LspBridgeHandler {
    fn list_tools(&self) -> Vec<Tool> {
        tools::catalogue().iter().map(ToolSpec::to_tool).collect()
    }

    async fn call_tool(&self, name: &str, arguments: Option<Value>, call: ToolCall) -> CallToolResult {
        let start = Instant::now();
        let request_id = call.request_id.clone();
        match self.run(name, arguments, call).await {
            Ok(result) => {
                debug!(
                    "Tool {} (call {}) completed in {}ms",
                    name,
                    request_id,
                    start.elapsed().as_millis()
                );
                tool_result(result)
            }
            Err(e) => {
                warn!("Tool {} (call {}) failed: {}", name, request_id, e);
                tool_error(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeSettings;
    use crate::lsp::Supervisor;
    use crate::mcp::RequestId;
    use crate::registry::{RoutingTable, ServerDefinition, ServerRegistry};
    use anyhow::{Context, Result};
    use serde_json::json;
    use tokio::sync::watch;

    fn handler() -> Result<LspBridgeHandler> {
        let registry = ServerRegistry::load(vec![ServerDefinition::new(
            "zls",
            "lsp-mcp-server-test-no-such-binary",
            Vec::new(),
            vec!["zig".into()],
        )])?;
        let routing = RoutingTable::new(&registry, Some("zls".into()))?;
        let (supervisor, _events) =
            Supervisor::new(registry, BridgeSettings::default(), std::env::temp_dir());
        Ok(LspBridgeHandler::new(Router::new(supervisor, routing)))
    }

    fn call(id: i64) -> ToolCall {
        let (_tx, cancelled) = watch::channel(false);
        ToolCall {
            request_id: RequestId::Number(id),
            cancelled,
        }
    }

    fn error_kind(result: &CallToolResult) -> Option<&str> {
        result
            .structured_content
            .as_ref()?
            .pointer("/error/kind")?
            .as_str()
    }

    #[tokio::test]
    async fn test_lists_catalogue() -> Result<()> {
        let handler = handler()?;
        let tools = handler.list_tools();
        assert_eq!(tools.len(), tools::catalogue().len());
        assert!(tools.iter().any(|t| t.name == "hover"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tool_is_tool_error() -> Result<()> {
        let handler = handler()?;
        let result = handler.call_tool("paint", None, call(1)).await;
        assert_eq!(result.is_error, Some(true));
        assert_eq!(error_kind(&result), Some("UnknownToolError"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unroutable_language_spawns_nothing() -> Result<()> {
        let handler = handler()?;
        let result = handler
            .call_tool(
                "hover",
                Some(json!({"uri": "file:///tmp/a.rb", "line": 0, "character": 0, "language": "ruby"})),
                call(2),
            )
            .await;
        assert_eq!(error_kind(&result), Some("NoServerForLanguageError"));
        assert!(handler.router.supervisor().state("zls").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_arguments_spawn_nothing() -> Result<()> {
        let handler = handler()?;
        let result = handler
            .call_tool("hover", Some(json!({"uri": "file:///tmp/a.zig"})), call(3))
            .await;
        assert_eq!(error_kind(&result), Some("InvalidArgumentsError"));
        assert!(handler.router.supervisor().state("zls").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_launch_failure_reports_startup_error() -> Result<()> {
        let handler = handler()?;
        let result = handler
            .call_tool(
                "hover",
                Some(json!({"uri": "file:///tmp/a.zig", "line": 0, "character": 0})),
                call(4),
            )
            .await;
        assert_eq!(error_kind(&result), Some("StartupError"));
        let text = result.first_text().context("missing text")?;
        assert!(text.contains("zls"));
        Ok(())
    }

    #[tokio::test]
    async fn test_status_lists_unstarted_servers() -> Result<()> {
        let handler = handler()?;
        let result = handler.call_tool("server_status", None, call(5)).await;
        assert_eq!(result.is_error, None);
        let structured = result.structured_content.context("no structured content")?;
        assert_eq!(structured["result"]["default_server"], "zls");
        assert_eq!(structured["result"]["sessions"][0]["state"], "stopped");
        Ok(())
    }
}
