// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Supervision, correlation and routing against real `mockls` processes.
//!
//! Each test launches mockls with flags that force one behaviour: slow or
//! out-of-order replies, crashes, hangs, or missing capabilities.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use lsp_mcp_server::bridge::Router;
use lsp_mcp_server::bridge::tools::{self, ToolArgs};
use lsp_mcp_server::config::BridgeSettings;
use lsp_mcp_server::error::BridgeError;
use lsp_mcp_server::lsp::{BackendNotification, CallContext, SessionState, SessionView, Supervisor};
use lsp_mcp_server::registry::{RoutingTable, ServerDefinition, ServerRegistry};

fn mockls(id: &str, languages: &[&str], args: &[&str]) -> ServerDefinition {
    ServerDefinition::new(
        id,
        env!("CARGO_BIN_EXE_mockls"),
        args.iter().map(ToString::to_string).collect(),
        languages.iter().map(ToString::to_string).collect(),
    )
}

fn fast_settings() -> BridgeSettings {
    BridgeSettings {
        request_timeout_ms: 5_000,
        readiness_timeout_ms: 5_000,
        restart_budget: 3,
        restart_window_secs: 60,
        restart_backoff_initial_ms: 10,
        restart_backoff_max_ms: 50,
        shutdown_grace_ms: 300,
        drain_grace_ms: 500,
    }
}

struct Harness {
    supervisor: Supervisor,
    router: Router,
    notifications: mpsc::UnboundedReceiver<BackendNotification>,
    workspace: tempfile::TempDir,
}

impl Harness {
    fn new(definitions: Vec<ServerDefinition>, settings: BridgeSettings) -> Result<Self> {
        let workspace = tempfile::tempdir()?;
        let default_server = definitions.first().map(|d| d.id.clone());
        let registry = ServerRegistry::load(definitions)?;
        let routing = RoutingTable::new(&registry, default_server)?;
        let (supervisor, notifications) =
            Supervisor::new(registry, settings, workspace.path().to_path_buf());
        let router = Router::new(supervisor.clone(), routing);
        Ok(Self {
            supervisor,
            router,
            notifications,
            workspace,
        })
    }

    fn write_document(&self, name: &str, text: &str) -> Result<String> {
        let path = self.workspace.path().join(name);
        std::fs::write(&path, text)?;
        file_uri(&path)
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<Value, BridgeError> {
        let spec = tools::find(tool)?;
        let args = ToolArgs::parse(Some(arguments))?;
        self.router.dispatch(spec, &args, &CallContext::default()).await
    }

    async fn wait_for_state(&self, id: &str, state: SessionState) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let current = self.supervisor.state(id).await;
            if current == Some(state) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("'{id}' never reached {state}; last state {current:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Waits for a process other than `generation` to finish its handshake.
    async fn wait_for_restart(&self, view: &SessionView, generation: Option<u64>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = view.status();
            if status.state == SessionState::Ready
                && status.generation.is_some()
                && status.generation != generation
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("'{}' was not restarted; state {}", view.id(), status.state);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn next_log_message(&mut self, contains: &str) -> Result<BackendNotification> {
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            while let Some(notification) = self.notifications.recv().await {
                let text = notification.params.to_string();
                if text.contains(contains) {
                    return Ok(notification);
                }
            }
            bail!("notification channel closed")
        })
        .await
        .context("timed out waiting for notification")?
    }
}

fn file_uri(path: &Path) -> Result<String> {
    url::Url::from_file_path(path)
        .map(|u| u.to_string())
        .map_err(|()| anyhow::anyhow!("not an absolute path: {}", path.display()))
}

fn hover_params(uri: &str, line: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": 0 }
    })
}

fn hover_text(result: &Value) -> &str {
    result
        .pointer("/contents/value")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

#[tokio::test]
async fn test_concurrent_requests_correlate_out_of_order() -> Result<()> {
    let harness = Harness::new(vec![mockls("zls", &["zig"], &["--reverse-batch", "4"])], fast_settings())?;
    let view = harness.supervisor.start("zls").await?;
    view.wait_ready(Duration::from_secs(5)).await?;

    let mut calls = JoinSet::new();
    for line in 0..4u32 {
        let view = view.clone();
        calls.spawn(async move {
            let result = view
                .request(
                    "textDocument/hover",
                    hover_params("file:///virtual/a.zig", line),
                    Duration::from_secs(5),
                    &CallContext::with_origin(format!("call-{line}")),
                )
                .await;
            (line, result)
        });
    }

    let mut seen = 0;
    while let Some(joined) = calls.join_next().await {
        let (line, result) = joined?;
        let result = result?;
        let text = hover_text(&result);
        assert!(
            text.ends_with(&format!("a.zig:{line}:0")),
            "call for line {line} got {text:?}"
        );
        seen += 1;
    }
    assert_eq!(seen, 4);
    assert_eq!(view.status().pending_requests, 0);
    Ok(())
}

#[tokio::test]
async fn test_timeout_then_late_response_is_discarded() -> Result<()> {
    let harness = Harness::new(vec![mockls("zls", &["zig"], &["--response-delay", "300"])], fast_settings())?;
    let view = harness.supervisor.start("zls").await?;
    view.wait_ready(Duration::from_secs(5)).await?;

    let first = view
        .request(
            "textDocument/hover",
            hover_params("file:///virtual/a.zig", 1),
            Duration::from_millis(50),
            &CallContext::default(),
        )
        .await;
    match first {
        Err(BridgeError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
        other => bail!("expected a timeout, got {other:?}"),
    }

    // The late reply to the first request must not satisfy this one.
    let second = view
        .request(
            "textDocument/hover",
            hover_params("file:///virtual/a.zig", 2),
            Duration::from_secs(5),
            &CallContext::default(),
        )
        .await?;
    assert!(hover_text(&second).ends_with("a.zig:2:0"));
    assert_eq!(view.state(), SessionState::Ready);
    Ok(())
}

#[tokio::test]
async fn test_crash_within_budget_restarts() -> Result<()> {
    let harness = Harness::new(
        vec![mockls("zls", &["zig"], &["--crash-on", "textDocument/hover"])],
        fast_settings(),
    )?;
    let view = harness.supervisor.start("zls").await?;
    view.wait_ready(Duration::from_secs(5)).await?;
    let first_generation = view.status().generation;

    let crashed = harness
        .call("hover", json!({"uri": "file:///virtual/a.zig", "line": 0, "character": 0}))
        .await;
    assert!(
        matches!(crashed, Err(BridgeError::SessionTerminated { .. })),
        "expected SessionTerminated, got {crashed:?}"
    );

    harness.wait_for_restart(&view, first_generation).await?;
    assert_eq!(view.status().restart_count, 1);

    // The restarted process serves requests that do not crash it.
    let symbols = harness
        .call("workspace_symbols", json!({"query": "main"}))
        .await?;
    assert_eq!(symbols, json!([]));
    Ok(())
}

#[tokio::test]
async fn test_budget_exhaustion_fails_permanently() -> Result<()> {
    let settings = BridgeSettings {
        restart_budget: 2,
        ..fast_settings()
    };
    let harness = Harness::new(vec![mockls("zls", &["zig"], &["--drop-after", "1"])], settings)?;
    let view = harness.supervisor.start("zls").await?;

    harness
        .wait_for_state("zls", SessionState::PermanentlyFailed)
        .await?;
    assert_eq!(view.status().restart_count, 2);

    let result = view.wait_ready(Duration::from_secs(1)).await;
    assert!(
        matches!(result, Err(BridgeError::BackendUnavailable { .. })),
        "expected BackendUnavailable, got {result:?}"
    );

    let call = harness
        .call("hover", json!({"uri": "file:///virtual/a.zig", "line": 0, "character": 0}))
        .await;
    assert!(matches!(call, Err(BridgeError::BackendUnavailable { .. })));
    let status = view.status();
    assert!(status.last_error.is_some_and(|e| e.contains("crashed")));
    Ok(())
}

#[tokio::test]
async fn test_graceful_stop_terminates_pending() -> Result<()> {
    let harness = Harness::new(
        vec![mockls("zls", &["zig"], &["--hang-on", "textDocument/hover"])],
        fast_settings(),
    )?;
    let view = harness.supervisor.start("zls").await?;
    view.wait_ready(Duration::from_secs(5)).await?;

    let waiting = {
        let view = view.clone();
        tokio::spawn(async move {
            view.request(
                "textDocument/hover",
                hover_params("file:///virtual/a.zig", 0),
                Duration::from_secs(10),
                &CallContext::default(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.supervisor.stop("zls").await?;
    let result = tokio::time::timeout(Duration::from_secs(2), waiting).await??;
    assert!(
        matches!(result, Err(BridgeError::SessionTerminated { .. })),
        "expected SessionTerminated, got {result:?}"
    );
    assert_eq!(view.state(), SessionState::Stopped);
    assert!(harness.supervisor.state("zls").await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_unresponsive_server_is_killed_on_stop() -> Result<()> {
    let harness = Harness::new(
        vec![mockls("zls", &["zig"], &["--hang-on", "shutdown", "--ignore-exit"])],
        fast_settings(),
    )?;
    let view = harness.supervisor.start("zls").await?;
    view.wait_ready(Duration::from_secs(5)).await?;
    let pid = view.status().pid.context("no pid for running server")?;

    let started = tokio::time::Instant::now();
    harness.supervisor.shutdown_all().await;
    // Shutdown request grace, exit grace, then the kill.
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(view.state(), SessionState::Stopped);

    if cfg!(target_os = "linux") {
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }

    let after = harness.supervisor.start("zls").await;
    assert!(matches!(after, Err(BridgeError::ShuttingDown)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_waits_for_one_launch() -> Result<()> {
    let harness = Harness::new(vec![mockls("zls", &["zig"], &[])], fast_settings())?;

    let mut acquirers = JoinSet::new();
    for _ in 0..16 {
        let supervisor = harness.supervisor.clone();
        acquirers.spawn(async move {
            let view = supervisor.acquire("zls").await?;
            let state = view.status().state;
            view.wait_ready(Duration::from_secs(5)).await?;
            Ok::<_, BridgeError>((state, view.status().generation))
        });
    }

    let mut generations = Vec::new();
    while let Some(joined) = acquirers.join_next().await {
        let (state, generation) = joined??;
        assert_ne!(state, SessionState::Stopped);
        generations.push(generation);
    }
    generations.dedup();
    assert_eq!(generations.len(), 1, "more than one process: {generations:?}");
    assert_eq!(harness.supervisor.status().await.len(), 1);
    harness.supervisor.shutdown_all().await;
    Ok(())
}

#[tokio::test]
async fn test_startup_error_is_isolated() -> Result<()> {
    let broken = ServerDefinition::new(
        "broken",
        "/nonexistent/lsp-mcp-server-test-binary",
        Vec::new(),
        vec!["zig".into()],
    );
    let harness = Harness::new(
        vec![broken, mockls("gopls", &["go"], &[])],
        fast_settings(),
    )?;

    let result = harness.supervisor.start("broken").await;
    assert!(matches!(result, Err(BridgeError::Startup { .. })));
    assert_eq!(
        harness.supervisor.state("broken").await,
        Some(SessionState::PermanentlyFailed)
    );

    let hover = harness
        .call(
            "hover",
            json!({"uri": "file:///virtual/main.go", "line": 3, "character": 1, "language": "go"}),
        )
        .await?;
    assert!(hover_text(&hover).ends_with("main.go:3:1"));

    let zig = harness
        .call(
            "hover",
            json!({"uri": "file:///virtual/main.zig", "line": 0, "character": 0, "language": "zig"}),
        )
        .await;
    assert!(matches!(zig, Err(BridgeError::BackendUnavailable { .. })));
    Ok(())
}

#[tokio::test]
async fn test_missing_capability_is_rejected_before_forwarding() -> Result<()> {
    let harness = Harness::new(
        vec![mockls("zls", &["zig"], &["--disable", "hoverProvider"])],
        fast_settings(),
    )?;

    let hover = harness
        .call("hover", json!({"uri": "file:///virtual/a.zig", "line": 0, "character": 0}))
        .await;
    match hover {
        Err(BridgeError::UnsupportedCapability { capability, .. }) => {
            assert_eq!(capability, "hoverProvider");
        }
        other => bail!("expected UnsupportedCapability, got {other:?}"),
    }

    let definition = harness
        .call("definition", json!({"uri": "file:///virtual/a.zig", "line": 0, "character": 0}))
        .await?;
    assert_eq!(definition, Value::Null);
    Ok(())
}

#[tokio::test]
async fn test_request_during_handshake_is_not_ready() -> Result<()> {
    let settings = BridgeSettings {
        readiness_timeout_ms: 200,
        ..fast_settings()
    };
    let harness = Harness::new(vec![mockls("zls", &["zig"], &["--hang-on", "initialize"])], settings)?;

    let result = harness
        .call("hover", json!({"uri": "file:///virtual/a.zig", "line": 0, "character": 0}))
        .await;
    assert!(
        matches!(result, Err(BridgeError::NotReady { .. })),
        "expected NotReady, got {result:?}"
    );
    Ok(())
}

#[tokio::test]
async fn test_unroutable_language_starts_nothing() -> Result<()> {
    let harness = Harness::new(vec![mockls("zls", &["zig"], &[])], fast_settings())?;
    let result = harness
        .call(
            "hover",
            json!({"uri": "file:///virtual/a.rb", "line": 0, "character": 0, "language": "ruby"}),
        )
        .await;
    assert!(matches!(result, Err(BridgeError::NoServerForLanguage(ref tag)) if tag == "ruby"));
    assert!(harness.supervisor.status().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_document_opened_and_diagnostics_served_from_cache() -> Result<()> {
    let mut harness = Harness::new(vec![mockls("zls", &["zig"], &[])], fast_settings())?;
    let uri = harness.write_document("main.zig", "const std = @import(\"std\");\n")?;

    let hover = harness
        .call("hover", json!({"uri": uri, "line": 0, "character": 7}))
        .await?;
    assert!(
        hover_text(&hover).contains("```\nstd\n```"),
        "document was not opened"
    );

    let diagnostics = harness.call("diagnostics", json!({"uri": uri})).await?;
    assert_eq!(diagnostics["kind"], "full");
    assert_eq!(diagnostics["items"][0]["source"], "mockls");

    let published = harness.next_log_message("mock diagnostic").await?;
    assert_eq!(published.server, "zls");
    assert_eq!(published.method, "textDocument/publishDiagnostics");
    Ok(())
}

#[tokio::test]
async fn test_server_configuration_request_is_answered() -> Result<()> {
    let mut harness = Harness::new(
        vec![mockls("zls", &["zig"], &["--send-configuration-request"])],
        fast_settings(),
    )?;
    let view = harness.supervisor.start("zls").await?;
    view.wait_ready(Duration::from_secs(5)).await?;

    let echo = harness.next_log_message("mockls: configuration").await?;
    let message = echo
        .params
        .get("message")
        .and_then(Value::as_str)
        .context("logMessage without message")?;
    assert!(message.contains("[null,null]"), "unexpected reply {message}");
    Ok(())
}
