// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end tests driving the `lsp-mcp-server` binary over stdio, with
//! `mockls` standing in for the language servers.

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes a configuration routing zig to mockls (the default) and go to a
/// second mockls instance.
fn write_config(dir: &Path, default_command: &str, default_args: &[&str]) -> Result<PathBuf> {
    let mockls = env!("CARGO_BIN_EXE_mockls");
    let config = json!({
        "servers": {
            "zls": { "command": default_command, "args": default_args, "languages": ["zig"] },
            "gopls": { "command": mockls, "languages": ["go"] }
        },
        "default_server": "zls",
        "restart_backoff_initial_ms": 10,
        "shutdown_grace_ms": 500
    });
    let path = dir.join("config.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
    Ok(path)
}

fn bridge_command(dir: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_lsp-mcp-server"));
    cmd.args(args)
        .current_dir(dir)
        .env("XDG_CONFIG_HOME", dir)
        .env_remove("RUST_LOG");
    cmd
}

/// Reads newline-delimited or `Content-Length` framed messages.
fn read_message(reader: &mut impl BufRead) -> Result<Option<Value>> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }

    if let Some(length) = line.trim().strip_prefix("Content-Length:") {
        let length: usize = length.trim().parse()?;
        // Skip the remaining headers up to the blank separator.
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                bail!("EOF inside message headers");
            }
            if line.trim().is_empty() {
                break;
            }
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body)?;
        return Ok(Some(serde_json::from_slice(&body)?));
    }

    Ok(Some(serde_json::from_str(line.trim())?))
}

struct BridgeProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    messages: mpsc::Receiver<Value>,
    seen: Vec<Value>,
    dir: tempfile::TempDir,
}

impl BridgeProcess {
    fn spawn() -> Result<Self> {
        Self::spawn_with(&[])
    }

    fn spawn_with(mock_args: &[&str]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let config = write_config(dir.path(), env!("CARGO_BIN_EXE_mockls"), mock_args)?;

        let config_arg = config.to_string_lossy().into_owned();
        let mut child = bridge_command(dir.path(), &["--config", &config_arg])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn bridge")?;

        let stdin = child.stdin.take().context("Failed to get stdin")?;
        let stdout = child.stdout.take().context("Failed to get stdout")?;

        let (tx, messages) = mpsc::channel();
        std::thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            while let Ok(Some(message)) = read_message(&mut reader) {
                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            messages,
            seen: Vec::new(),
            dir,
        })
    }

    fn workspace(&self) -> &Path {
        self.dir.path()
    }

    fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().context("stdin closed")?;
        stdin.write_all(bytes)?;
        stdin.flush()?;
        Ok(())
    }

    fn send(&mut self, message: &Value) -> Result<()> {
        let line = format!("{}\n", serde_json::to_string(message)?);
        self.send_raw(line.as_bytes())
    }

    fn next_message(&mut self, deadline: Instant) -> Result<Value> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.messages
            .recv_timeout(remaining)
            .map_err(|e| anyhow!("no message from bridge: {e}"))
    }

    /// Waits for the response to `id`, keeping notifications for later.
    fn response(&mut self, id: i64) -> Result<Value> {
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            let message = self.next_message(deadline)?;
            if message.get("id") == Some(&json!(id)) {
                return Ok(message);
            }
            self.seen.push(message);
        }
    }

    /// Waits for a notification matching `predicate`, including ones already
    /// seen while waiting for responses.
    fn notification(&mut self, predicate: impl Fn(&Value) -> bool) -> Result<Value> {
        if let Some(pos) = self.seen.iter().position(&predicate) {
            return Ok(self.seen.remove(pos));
        }
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            let message = self.next_message(deadline)?;
            if predicate(&message) {
                return Ok(message);
            }
            self.seen.push(message);
        }
    }

    fn request(&mut self, id: i64, method: &str, params: Value) -> Result<Value> {
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;
        self.response(id)
    }

    fn call_tool(&mut self, id: i64, name: &str, arguments: Value) -> Result<Value> {
        let response = self.request(
            id,
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        )?;
        response
            .get("result")
            .cloned()
            .with_context(|| format!("tools/call returned no result: {response}"))
    }

    fn initialize(&mut self) -> Result<Value> {
        let response = self.request(
            1,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }),
        )?;
        self.send(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))?;
        Ok(response)
    }

    /// Closes stdin and waits for the process to exit on its own.
    fn finish(mut self) -> Result<i32> {
        drop(self.stdin.take());
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return status.code().context("bridge killed by a signal");
            }
            if Instant::now() >= deadline {
                bail!("bridge did not exit after stdin closed");
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn result_text(result: &Value) -> &str {
    result
        .pointer("/content/0/text")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

#[test]
fn test_initialize_and_list_tools() -> Result<()> {
    let mut bridge = BridgeProcess::spawn()?;

    let response = bridge.initialize()?;
    let result = response.get("result").context("initialize failed")?;
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "lsp-mcp-server");
    assert!(result["capabilities"]["tools"].is_object());

    let response = bridge.request(2, "tools/list", json!({}))?;
    let tools = response
        .pointer("/result/tools")
        .and_then(Value::as_array)
        .context("tools/list returned no tools")?;
    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    for expected in ["hover", "definition", "references", "diagnostics", "server_status"] {
        assert!(names.contains(&expected), "missing tool {expected}: {names:?}");
    }
    let hover = tools
        .iter()
        .find(|t| t["name"] == "hover")
        .context("no hover tool")?;
    assert_eq!(hover["inputSchema"]["type"], "object");
    Ok(())
}

#[test]
fn test_hover_on_default_server() -> Result<()> {
    let mut bridge = BridgeProcess::spawn()?;
    bridge.initialize()?;

    let result = bridge.call_tool(
        2,
        "hover",
        json!({ "uri": "file:///virtual/main.zig", "line": 4, "character": 2 }),
    )?;
    assert_eq!(result.get("isError"), None);
    assert!(
        result_text(&result).contains("mockls hover file:///virtual/main.zig:4:2"),
        "unexpected hover: {result}"
    );
    Ok(())
}

#[test]
fn test_language_routing() -> Result<()> {
    let mut bridge = BridgeProcess::spawn()?;
    bridge.initialize()?;

    let result = bridge.call_tool(
        2,
        "hover",
        json!({ "uri": "file:///virtual/main.go", "line": 1, "character": 0, "language": "go" }),
    )?;
    assert!(result_text(&result).contains("main.go:1:0"));

    let status = bridge.call_tool(3, "server_status", json!({}))?;
    let sessions = status
        .pointer("/structuredContent/result/sessions")
        .and_then(Value::as_array)
        .context("no sessions in status")?;
    let ready: Vec<&str> = sessions
        .iter()
        .filter(|s| s["state"] == "ready")
        .filter_map(|s| s["server"].as_str())
        .collect();
    assert_eq!(ready, ["zls", "gopls"]);
    Ok(())
}

#[test]
fn test_unknown_language_is_tool_error() -> Result<()> {
    let mut bridge = BridgeProcess::spawn()?;
    bridge.initialize()?;

    let result = bridge.call_tool(
        2,
        "hover",
        json!({ "uri": "file:///virtual/a.rb", "line": 0, "character": 0, "language": "ruby" }),
    )?;
    assert_eq!(result["isError"], true);
    assert_eq!(
        result["structuredContent"]["error"]["kind"],
        "NoServerForLanguageError"
    );
    assert!(result_text(&result).contains("ruby"));
    Ok(())
}

#[test]
fn test_unknown_tool_and_method() -> Result<()> {
    let mut bridge = BridgeProcess::spawn()?;
    bridge.initialize()?;

    let result = bridge.call_tool(2, "paint", json!({}))?;
    assert_eq!(result["isError"], true);
    assert_eq!(result["structuredContent"]["error"]["kind"], "UnknownToolError");

    let response = bridge.request(3, "resources/list", json!({}))?;
    assert_eq!(response["error"]["code"], -32601);
    Ok(())
}

#[test]
fn test_diagnostics_arrive_as_log_messages() -> Result<()> {
    let mut bridge = BridgeProcess::spawn()?;
    bridge.initialize()?;

    let path = bridge.workspace().join("main.zig");
    std::fs::write(&path, "fn main() void {}\n")?;
    let uri = url::Url::from_file_path(&path)
        .map_err(|()| anyhow!("bad path"))?
        .to_string();

    let result = bridge.call_tool(2, "diagnostics", json!({ "uri": uri }))?;
    let items = result
        .pointer("/structuredContent/result/items")
        .and_then(Value::as_array)
        .context("no diagnostics items")?;
    assert_eq!(items.len(), 1);

    let event = bridge.notification(|m| {
        m["method"] == "notifications/message"
            && m["params"]["data"]["method"] == "textDocument/publishDiagnostics"
    })?;
    assert_eq!(event["params"]["level"], "info");
    assert_eq!(event["params"]["logger"], "zls");
    Ok(())
}

#[test]
fn test_content_length_framing_is_mirrored() -> Result<()> {
    let mut bridge = BridgeProcess::spawn()?;
    let body = serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "framed-client", "version": "1.0.0" }
        }
    }))?;
    bridge.send_raw(format!("Content-Length: {}\r\n\r\n{body}", body.len()).as_bytes())?;

    let response = bridge.response(1)?;
    assert_eq!(response["result"]["serverInfo"]["name"], "lsp-mcp-server");
    Ok(())
}

#[test]
fn test_parse_error_keeps_serving() -> Result<()> {
    let mut bridge = BridgeProcess::spawn()?;
    bridge.send_raw(b"{not json\n")?;
    let error = bridge.notification(|m| m.get("error").is_some())?;
    assert_eq!(error["error"]["code"], -32700);
    assert_eq!(error["id"], Value::Null);

    let response = bridge.initialize()?;
    assert!(response.get("result").is_some());
    Ok(())
}

#[test]
fn test_stdin_eof_exits_cleanly() -> Result<()> {
    let mut bridge = BridgeProcess::spawn()?;
    bridge.initialize()?;
    assert_eq!(bridge.finish()?, 0);
    Ok(())
}

#[test]
fn test_crashed_backend_recovers() -> Result<()> {
    let mut bridge = BridgeProcess::spawn_with(&["--crash-on", "textDocument/definition"])?;
    bridge.initialize()?;

    let crashed = bridge.call_tool(
        2,
        "definition",
        json!({ "uri": "file:///virtual/main.zig", "line": 0, "character": 0 }),
    )?;
    assert_eq!(crashed["isError"], true);
    assert_eq!(
        crashed["structuredContent"]["error"]["kind"],
        "SessionTerminatedError"
    );

    // The restart happens in the background; hover waits for readiness.
    let deadline = Instant::now() + RECV_TIMEOUT;
    let mut id = 3;
    loop {
        let result = bridge.call_tool(
            id,
            "hover",
            json!({ "uri": "file:///virtual/main.zig", "line": 0, "character": 0 }),
        )?;
        if result.get("isError").is_none() {
            assert!(result_text(&result).contains("mockls hover"));
            break;
        }
        if Instant::now() >= deadline {
            bail!("backend never recovered: {result}");
        }
        id += 1;
        std::thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

#[test]
fn test_cancelled_call_is_forwarded_to_backend() -> Result<()> {
    let mut bridge = BridgeProcess::spawn_with(&["--park-on", "textDocument/hover"])?;
    bridge.initialize()?;

    bridge.send(&json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "tools/call",
        "params": {
            "name": "hover",
            "arguments": { "uri": "file:///virtual/main.zig", "line": 0, "character": 0 }
        }
    }))?;
    bridge.send(&json!({
        "jsonrpc": "2.0",
        "method": "notifications/cancelled",
        "params": { "requestId": 7, "reason": "user aborted" }
    }))?;

    let seen = bridge.notification(|m| {
        m["params"]["logger"] == "zls"
            && m["params"]["data"]["params"]["message"]
                .as_str()
                .is_some_and(|text| text.starts_with("mockls: cancel request"))
    })?;
    assert_eq!(seen["params"]["data"]["method"], "window/logMessage");

    // mockls only releases the parked hover when the cancelled id matches it.
    let response = bridge.response(7)?;
    let result = response.get("result").context("tools/call returned no result")?;
    assert_eq!(result["isError"], true);
    assert_eq!(result["structuredContent"]["error"]["kind"], "CancelledError");
    Ok(())
}

#[test]
fn test_help_names_the_bridge() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = bridge_command(dir.path(), &["--help"]).output()?;
    assert!(output.status.success());
    let help = String::from_utf8(output.stdout)?;
    assert!(help.contains("LSP-MCP Bridge Server"));
    assert!(help.contains("--server"));
    assert!(help.contains("--config"));
    Ok(())
}

#[test]
fn test_malformed_config_exits_with_config_code() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ \"servers\": [ }")?;
    let status = bridge_command(dir.path(), &["--config", &path.to_string_lossy()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    assert_eq!(status.code(), Some(2));
    Ok(())
}

#[test]
fn test_empty_server_table_exits_with_config_code() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{ "servers": {} }"#)?;
    let status = bridge_command(dir.path(), &["--config", &path.to_string_lossy()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    assert_eq!(status.code(), Some(2));
    Ok(())
}

#[test]
fn test_unknown_server_flag_exits_with_config_code() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), env!("CARGO_BIN_EXE_mockls"), &[])?;
    let status = bridge_command(
        dir.path(),
        &["--config", &path.to_string_lossy(), "--server", "clangd"],
    )
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .status()?;
    assert_eq!(status.code(), Some(2));
    Ok(())
}

#[test]
fn test_missing_default_binary_exits_with_startup_code() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_config(dir.path(), "/nonexistent/lsp-mcp-server-test-zls", &[])?;
    let status = bridge_command(dir.path(), &["--config", &path.to_string_lossy()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    assert_eq!(status.code(), Some(3));
    Ok(())
}
