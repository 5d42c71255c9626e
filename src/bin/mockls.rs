// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Scriptable stand-in for a language server.
//!
//! Reads `Content-Length` framed JSON-RPC on stdin and answers on stdout.
//! Flags select the misbehaviour under test: slow or reordered replies,
//! crashes, hangs, missing capabilities and server-initiated requests.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::time::Duration;

use clap::Parser;
use lsp_types::TextDocumentPositionParams;
use serde::Deserialize;
use serde_json::{Value, json};

/// Mock language server used by the bridge's tests.
#[derive(Parser, Debug, Default)]
#[command(name = "mockls")]
#[allow(
    clippy::struct_excessive_bools,
    reason = "each flag toggles one independent behaviour"
)]
struct Args {
    /// Sleep this many milliseconds before answering any request.
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Exit with status 1 once n responses have been written.
    #[arg(long)]
    drop_after: Option<u64>,

    /// Exit with status 1 when this method arrives, without replying (repeatable).
    #[arg(long)]
    crash_on: Vec<String>,

    /// Swallow requests for this method (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Hold requests for this method until the client cancels them, then
    /// answer with `RequestCancelled` (repeatable).
    #[arg(long)]
    park_on: Vec<String>,

    /// Answer this method with an `InternalError` (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Drop this key from the advertised capabilities (repeatable).
    #[arg(long)]
    disable: Vec<String>,

    /// Queue replies until n are waiting, then flush them newest first.
    #[arg(long)]
    reverse_batch: Option<usize>,

    /// Keep running after `exit` and after stdin closes.
    #[arg(long)]
    ignore_exit: bool,

    /// Do not publish diagnostics on `didOpen`.
    #[arg(long)]
    no_diagnostics: bool,

    /// Ask the client for `workspace/configuration` right after `initialize`.
    #[arg(long)]
    send_configuration_request: bool,

    /// Emit a `window/logMessage` when `initialized` arrives.
    #[arg(long)]
    log_on_initialized: bool,
}

/// Anything the client can send: request, notification or reply.
#[derive(Debug, Deserialize)]
struct Incoming {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
}

/// Why the message loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Eof,
    Requested,
    Crash,
}

/// Reads one framed message body. `Ok(None)` on a clean EOF.
fn read_frame(reader: &mut impl BufRead) -> io::Result<Option<Vec<u8>>> {
    let mut length = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let header = line.trim_end();
        if header.is_empty() {
            if length.is_some() {
                break;
            }
            continue;
        }
        if let Some((name, value)) = header.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            length = value.trim().parse::<usize>().ok();
        }
    }

    let mut body = vec![0; length.unwrap_or_default()];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

fn reply(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn reply_error(id: Value, code: i64, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// A definition found by keyword scan.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Symbol {
    name: String,
    kind: u8,
    line: usize,
    indent: usize,
    name_start: usize,
    line_end: usize,
}

impl Symbol {
    fn selection(&self) -> Value {
        range(self.line, self.name_start, self.name_start + self.name.len())
    }

    fn document_symbol(&self) -> Value {
        json!({
            "name": self.name,
            "kind": self.kind,
            "range": range(self.line, self.indent, self.line_end),
            "selectionRange": self.selection(),
        })
    }

    fn symbol_information(&self, uri: &str) -> Value {
        json!({
            "name": self.name,
            "kind": self.kind,
            "location": { "uri": uri, "range": range(self.line, self.indent, self.line_end) },
        })
    }
}

/// Keyword and LSP `SymbolKind` of the definitions the scan recognises.
const DEFINITION_KEYWORDS: &[(&str, u8)] = &[
    ("pub fn ", 12),
    ("fn ", 12),
    ("func ", 12),
    ("def ", 12),
    ("const ", 14),
    ("let ", 13),
    ("var ", 13),
];

fn scan_symbols(content: &str) -> Vec<Symbol> {
    content
        .lines()
        .enumerate()
        .filter_map(|(line, text)| {
            let body = text.trim_start();
            let indent = text.len() - body.len();
            let (keyword, kind) = DEFINITION_KEYWORDS
                .iter()
                .find(|(keyword, _)| body.starts_with(keyword))?;
            let name: String = body[keyword.len()..]
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            (!name.is_empty()).then(|| Symbol {
                name,
                kind: *kind,
                line,
                indent,
                name_start: indent + keyword.len(),
                line_end: text.len(),
            })
        })
        .collect()
}

fn range(line: usize, start: usize, end: usize) -> Value {
    json!({
        "start": { "line": line, "character": start },
        "end": { "line": line, "character": end },
    })
}

const fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// The identifier under `character` on `line`, if any.
fn word_at(content: &str, line: usize, character: usize) -> Option<&str> {
    let text = content.lines().nth(line)?;
    if character >= text.len() || !is_identifier_byte(text.as_bytes()[character]) {
        return None;
    }
    let (before, after) = text.split_at(character);
    let start = before
        .bytes()
        .rposition(|b| !is_identifier_byte(b))
        .map_or(0, |i| i + 1);
    let end = character
        + after
            .bytes()
            .position(|b| !is_identifier_byte(b))
            .unwrap_or(after.len());
    Some(&text[start..end])
}

/// `(uri, line, character)` of a position request.
fn position_of(params: &Value) -> Option<(String, usize, usize)> {
    let params = TextDocumentPositionParams::deserialize(params).ok()?;
    Some((
        params.text_document.uri.as_str().to_string(),
        usize::try_from(params.position.line).ok()?,
        usize::try_from(params.position.character).ok()?,
    ))
}

struct MockServer<W: Write> {
    args: Args,
    out: W,
    documents: BTreeMap<String, String>,
    held: Vec<Value>,
    parked: Vec<(Value, String)>,
    responses_sent: u64,
    next_id: u64,
    configuration_request: Option<u64>,
    exit: Option<Exit>,
}

impl<W: Write> MockServer<W> {
    fn new(args: Args, out: W) -> Self {
        Self {
            args,
            out,
            documents: BTreeMap::new(),
            held: Vec::new(),
            parked: Vec::new(),
            responses_sent: 0,
            next_id: 1,
            configuration_request: None,
            exit: None,
        }
    }

    fn run(&mut self, input: &mut impl BufRead) -> Exit {
        loop {
            let body = match read_frame(input) {
                Ok(Some(body)) => body,
                Ok(None) | Err(_) => return Exit::Eof,
            };
            let Ok(message) = serde_json::from_slice::<Incoming>(&body) else {
                continue;
            };
            match (message.method, message.id) {
                (Some(method), Some(id)) => self.on_request(&method, id, &message.params),
                (Some(method), None) => self.on_notification(&method, &message.params),
                (None, Some(id)) => self.on_client_reply(&id, message.result),
                (None, None) => {}
            }
            if let Some(exit) = self.exit {
                return exit;
            }
        }
    }

    fn on_request(&mut self, method: &str, id: Value, params: &Value) {
        let listed = |flags: &[String]| flags.iter().any(|m| m == method);
        if listed(&self.args.crash_on) {
            self.exit = Some(Exit::Crash);
            return;
        }
        if listed(&self.args.hang_on) {
            return;
        }
        if listed(&self.args.park_on) {
            self.parked.push((id, method.to_string()));
            return;
        }
        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }
        if listed(&self.args.fail_on) {
            let message = format!("mockls: configured to fail on {method}");
            self.respond(method, reply_error(id, -32603, message));
            return;
        }

        let result = match method {
            "initialize" => self.initialize_result(),
            "shutdown" => Value::Null,
            "textDocument/hover" => self.hover(params),
            "textDocument/definition" => self.definition(params),
            "textDocument/references" => self.references(params),
            "textDocument/completion" => self.completion(params),
            "textDocument/documentSymbol" => self.document_symbols(params),
            "workspace/symbol" => self.workspace_symbols(params),
            _ => {
                let message = format!("mockls: method not found: {method}");
                self.respond(method, reply_error(id, -32601, message));
                return;
            }
        };
        self.respond(method, reply(id, result));

        if method == "initialize" && self.args.send_configuration_request {
            let id = self.next_id;
            self.next_id += 1;
            self.configuration_request = Some(id);
            self.write(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "workspace/configuration",
                "params": { "items": [{ "section": "mockls" }, { "section": "mockls.format" }] }
            }));
        }
    }

    fn on_notification(&mut self, method: &str, params: &Value) {
        let uri = params
            .pointer("/textDocument/uri")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match method {
            "initialized" if self.args.log_on_initialized => {
                self.write(&notification(
                    "window/logMessage",
                    json!({ "type": 3, "message": "mockls: initialized" }),
                ));
            }
            "textDocument/didOpen" => {
                let text = params
                    .pointer("/textDocument/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.documents.insert(uri.clone(), text.to_string());
                if !self.args.no_diagnostics {
                    self.write(&notification(
                        "textDocument/publishDiagnostics",
                        json!({
                            "uri": uri,
                            "diagnostics": [{
                                "range": range(0, 0, 1),
                                "severity": 2,
                                "source": "mockls",
                                "message": "mockls: mock diagnostic"
                            }]
                        }),
                    ));
                }
            }
            "textDocument/didClose" => {
                self.documents.remove(&uri);
            }
            "$/cancelRequest" => self.on_cancel(params.get("id").unwrap_or(&Value::Null)),
            "exit" if !self.args.ignore_exit => self.exit = Some(Exit::Requested),
            _ => {}
        }
    }

    /// Logs the cancelled id and releases the request if it was parked.
    fn on_cancel(&mut self, id: &Value) {
        self.write(&notification(
            "window/logMessage",
            json!({ "type": 4, "message": format!("mockls: cancel request {id}") }),
        ));
        if let Some(pos) = self.parked.iter().position(|(parked, _)| parked == id) {
            let (id, method) = self.parked.remove(pos);
            let message = format!("mockls: {method} cancelled");
            self.respond(&method, reply_error(id, -32800, message));
        }
    }

    /// Echoes the answer to our configuration request back as a log line.
    fn on_client_reply(&mut self, id: &Value, result: Option<Value>) {
        if id.as_u64().is_some() && id.as_u64() == self.configuration_request {
            let echoed = result.unwrap_or(Value::Null);
            self.write(&notification(
                "window/logMessage",
                json!({ "type": 4, "message": format!("mockls: configuration {echoed}") }),
            ));
        }
    }

    fn initialize_result(&self) -> Value {
        let mut capabilities = json!({
            "hoverProvider": true,
            "definitionProvider": true,
            "referencesProvider": true,
            "documentSymbolProvider": true,
            "workspaceSymbolProvider": true,
            "completionProvider": { "triggerCharacters": ["."] },
            "textDocumentSync": { "openClose": true, "change": 1 }
        });
        if let Some(map) = capabilities.as_object_mut() {
            map.retain(|key, _| !self.args.disable.contains(key));
        }
        json!({
            "capabilities": capabilities,
            "serverInfo": { "name": "mockls", "version": env!("CARGO_PKG_VERSION") }
        })
    }

    /// Answers every position, echoing it so callers can check correlation.
    fn hover(&self, params: &Value) -> Value {
        let Some((uri, line, character)) = position_of(params) else {
            return Value::Null;
        };
        let mut value = format!("mockls hover {uri}:{line}:{character}");
        if let Some(word) = self
            .documents
            .get(&uri)
            .and_then(|text| word_at(text, line, character))
        {
            value.push_str(&format!("\n```\n{word}\n```"));
        }
        json!({ "contents": { "kind": "markdown", "value": value } })
    }

    fn word_under(&self, params: &Value) -> Option<(String, String)> {
        let (uri, line, character) = position_of(params)?;
        let word = word_at(self.documents.get(&uri)?, line, character)?.to_string();
        Some((uri, word))
    }

    fn definition(&self, params: &Value) -> Value {
        let Some((uri, word)) = self.word_under(params) else {
            return Value::Null;
        };
        self.documents
            .get(&uri)
            .and_then(|text| scan_symbols(text).into_iter().find(|s| s.name == word))
            .map_or(Value::Null, |symbol| {
                json!({ "uri": uri, "range": symbol.selection() })
            })
    }

    fn references(&self, params: &Value) -> Value {
        let Some((uri, word)) = self.word_under(params) else {
            return json!([]);
        };
        let text = self.documents.get(&uri).map_or("", String::as_str);
        let word = word.as_str();
        let locations: Vec<Value> = text
            .lines()
            .enumerate()
            .flat_map(|(line, content)| {
                content
                    .match_indices(word)
                    .map(move |(col, found)| (line, col, col + found.len()))
            })
            .map(|(line, start, end)| json!({ "uri": uri, "range": range(line, start, end) }))
            .collect();
        Value::Array(locations)
    }

    /// Document symbols as completion items, after a fixed keyword.
    fn completion(&self, params: &Value) -> Value {
        let symbols = position_of(params)
            .and_then(|(uri, _, _)| self.documents.get(&uri))
            .map(|text| scan_symbols(text))
            .unwrap_or_default();
        let items: Vec<Value> = std::iter::once(json!({ "label": "mockls_keyword", "kind": 14 }))
            .chain(symbols.iter().map(|s| json!({ "label": s.name, "kind": 3 })))
            .collect();
        json!({ "isIncomplete": false, "items": items })
    }

    fn document_symbols(&self, params: &Value) -> Value {
        params
            .pointer("/textDocument/uri")
            .and_then(Value::as_str)
            .and_then(|uri| self.documents.get(uri))
            .map(|text| scan_symbols(text).iter().map(Symbol::document_symbol).collect())
            .unwrap_or_else(|| json!([]))
    }

    fn workspace_symbols(&self, params: &Value) -> Value {
        let query = params.get("query").and_then(Value::as_str).unwrap_or("");
        let found: Vec<Value> = self
            .documents
            .iter()
            .flat_map(|(uri, text)| {
                scan_symbols(text)
                    .into_iter()
                    .filter(move |s| s.name.contains(query))
                    .map(move |s| s.symbol_information(uri))
            })
            .collect();
        Value::Array(found)
    }

    /// Writes a reply now, or queues it when replies are being reordered.
    /// The handshake and shutdown are never held back.
    fn respond(&mut self, method: &str, response: Value) {
        let batch = self.args.reverse_batch.unwrap_or(0);
        if batch <= 1 || matches!(method, "initialize" | "shutdown") {
            self.send_reply(&response);
            return;
        }
        self.held.push(response);
        if self.held.len() >= batch {
            for response in std::mem::take(&mut self.held).into_iter().rev() {
                self.send_reply(&response);
            }
        }
    }

    fn send_reply(&mut self, response: &Value) {
        if self.exit.is_some() {
            return;
        }
        self.write(response);
        self.responses_sent += 1;
        if self
            .args
            .drop_after
            .is_some_and(|limit| self.responses_sent >= limit)
        {
            self.exit = Some(Exit::Crash);
        }
    }

    fn write(&mut self, message: &Value) {
        let body = message.to_string();
        let _ = write!(self.out, "Content-Length: {}\r\n\r\n{body}", body.len());
        let _ = self.out.flush();
    }
}

fn main() {
    let args = Args::parse();
    let linger = args.ignore_exit;
    let mut server = MockServer::new(args, io::stdout());

    match server.run(&mut io::stdin().lock()) {
        Exit::Crash => std::process::exit(1),
        Exit::Requested => std::process::exit(0),
        Exit::Eof if linger => loop {
            std::thread::sleep(Duration::from_secs(60));
        },
        Exit::Eof => {}
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(message: &Value) -> Vec<u8> {
        let body = message.to_string();
        format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    fn request(id: u64, method: &str, params: &Value) -> Vec<u8> {
        frame(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
    }

    fn initialize(id: u64) -> Vec<u8> {
        request(id, "initialize", &json!({ "processId": null, "capabilities": {} }))
    }

    fn position(uri: &str, line: u64, character: u64) -> Value {
        json!({ "textDocument": { "uri": uri }, "position": { "line": line, "character": character } })
    }

    fn hover(id: u64, uri: &str, line: u64, character: u64) -> Vec<u8> {
        request(id, "textDocument/hover", &position(uri, line, character))
    }

    fn did_open(uri: &str, text: &str) -> Vec<u8> {
        frame(&notification(
            "textDocument/didOpen",
            json!({ "textDocument": { "uri": uri, "languageId": "zig", "version": 1, "text": text } }),
        ))
    }

    fn run(args: Args, input: &[u8]) -> (Exit, Vec<Value>) {
        let mut server = MockServer::new(args, Vec::new());
        let exit = server.run(&mut Cursor::new(input));
        let mut output = Cursor::new(server.out);
        let mut messages = Vec::new();
        while let Some(body) = read_frame(&mut output).unwrap() {
            messages.push(serde_json::from_slice(&body).unwrap());
        }
        (exit, messages)
    }

    fn reply_to(messages: &[Value], id: u64) -> &Value {
        messages
            .iter()
            .find(|m| m.get("method").is_none() && m["id"] == id)
            .expect("reply present")
    }

    fn reply_ids(messages: &[Value]) -> Vec<u64> {
        messages
            .iter()
            .filter(|m| m.get("method").is_none())
            .filter_map(|m| m["id"].as_u64())
            .collect()
    }

    fn with_method<'a>(messages: &'a [Value], method: &str) -> Option<&'a Value> {
        messages.iter().find(|m| m["method"] == method)
    }

    #[test]
    fn test_initialize_advertises_capabilities() {
        let (_, messages) = run(Args::default(), &initialize(1));
        let result = &reply_to(&messages, 1)["result"];
        assert_eq!(result["capabilities"]["hoverProvider"], true);
        assert!(result["capabilities"]["completionProvider"].is_object());
        assert_eq!(result["serverInfo"]["name"], "mockls");

        let args = Args {
            disable: vec!["hoverProvider".into()],
            ..Args::default()
        };
        let (_, messages) = run(args, &initialize(1));
        let caps = &reply_to(&messages, 1)["result"]["capabilities"];
        assert!(caps.get("hoverProvider").is_none());
        assert_eq!(caps["definitionProvider"], true);
    }

    #[test]
    fn test_hover_echoes_position_and_word() {
        let uri = "file:///tmp/main.zig";
        let mut input = initialize(1);
        input.extend(did_open(uri, "const std = @import(\"std\");\n"));
        input.extend(hover(2, uri, 0, 7));

        let (_, messages) = run(Args::default(), &input);
        let value = reply_to(&messages, 2)["result"]["contents"]["value"]
            .as_str()
            .unwrap();
        assert!(value.starts_with("mockls hover file:///tmp/main.zig:0:7"));
        assert!(value.ends_with("```\nstd\n```"));
    }

    #[test]
    fn test_definition_and_references() {
        let uri = "file:///tmp/lib.zig";
        let mut input = initialize(1);
        input.extend(did_open(uri, "fn helper() void {}\nfn main() void { helper(); }\n"));
        input.extend(request(2, "textDocument/definition", &position(uri, 1, 18)));
        input.extend(request(3, "textDocument/references", &position(uri, 0, 4)));

        let (_, messages) = run(Args::default(), &input);
        let definition = &reply_to(&messages, 2)["result"];
        assert_eq!(definition["range"]["start"], json!({ "line": 0, "character": 3 }));
        let references = reply_to(&messages, 3)["result"].as_array().unwrap();
        assert_eq!(references.len(), 2);
        assert_eq!(references[1]["range"]["start"]["line"], 1);
    }

    #[test]
    fn test_did_open_publishes_diagnostics() {
        let uri = "file:///tmp/main.zig";
        let mut input = initialize(1);
        input.extend(did_open(uri, "fn main() void {}\n"));

        let (_, messages) = run(Args::default(), &input);
        let published = with_method(&messages, "textDocument/publishDiagnostics").unwrap();
        assert_eq!(published["params"]["uri"], uri);
        assert_eq!(published["params"]["diagnostics"][0]["source"], "mockls");

        let args = Args {
            no_diagnostics: true,
            ..Args::default()
        };
        let (_, messages) = run(args, &input);
        assert!(messages.iter().all(|m| m.get("method").is_none()));
    }

    #[test]
    fn test_reverse_batch_reorders_replies() {
        let args = Args {
            reverse_batch: Some(3),
            ..Args::default()
        };
        let mut input = initialize(1);
        for id in 2..=4 {
            input.extend(hover(id, "file:///tmp/a.zig", id, 0));
        }

        let (_, messages) = run(args, &input);
        assert_eq!(reply_ids(&messages), vec![1, 4, 3, 2]);
    }

    #[test]
    fn test_hang_and_fail() {
        let args = Args {
            hang_on: vec!["textDocument/hover".into()],
            fail_on: vec!["textDocument/definition".into()],
            ..Args::default()
        };
        let mut input = initialize(1);
        input.extend(hover(2, "file:///tmp/a.zig", 0, 0));
        input.extend(request(3, "textDocument/definition", &position("file:///tmp/a.zig", 0, 0)));

        let (_, messages) = run(args, &input);
        assert_eq!(reply_ids(&messages), vec![1, 3]);
        assert_eq!(reply_to(&messages, 3)["error"]["code"], -32603);
    }

    #[test]
    fn test_parked_request_answers_cancel() {
        let args = Args {
            park_on: vec!["textDocument/hover".into()],
            ..Args::default()
        };
        let mut input = initialize(1);
        input.extend(hover(2, "file:///tmp/a.zig", 0, 0));
        input.extend(hover(3, "file:///tmp/a.zig", 0, 0));
        input.extend(frame(&notification("$/cancelRequest", json!({ "id": 3 }))));
        input.extend(frame(&notification("$/cancelRequest", json!({ "id": 9 }))));

        let (_, messages) = run(args, &input);
        assert_eq!(reply_ids(&messages), vec![1, 3]);
        assert_eq!(reply_to(&messages, 3)["error"]["code"], -32800);
        let logged: Vec<&str> = messages
            .iter()
            .filter(|m| m["method"] == "window/logMessage")
            .filter_map(|m| m["params"]["message"].as_str())
            .collect();
        assert_eq!(
            logged,
            vec!["mockls: cancel request 3", "mockls: cancel request 9"]
        );
    }

    #[test]
    fn test_drop_after_and_crash_on() {
        let mut input = initialize(1);
        input.extend(hover(2, "file:///tmp/a.zig", 0, 0));
        input.extend(hover(3, "file:///tmp/a.zig", 0, 0));

        let args = Args {
            drop_after: Some(2),
            ..Args::default()
        };
        let (exit, messages) = run(args, &input);
        assert_eq!(exit, Exit::Crash);
        assert_eq!(reply_ids(&messages), vec![1, 2]);

        let args = Args {
            crash_on: vec!["textDocument/hover".into()],
            ..Args::default()
        };
        let (exit, messages) = run(args, &input);
        assert_eq!(exit, Exit::Crash);
        assert_eq!(reply_ids(&messages), vec![1]);
    }

    #[test]
    fn test_exit_notification() {
        let mut input = initialize(1);
        input.extend(request(2, "shutdown", &Value::Null));
        input.extend(frame(&json!({ "jsonrpc": "2.0", "method": "exit" })));
        let (exit, _) = run(Args::default(), &input);
        assert_eq!(exit, Exit::Requested);

        let args = Args {
            ignore_exit: true,
            ..Args::default()
        };
        let (exit, _) = run(args, &input);
        assert_eq!(exit, Exit::Eof);
    }

    #[test]
    fn test_configuration_reply_is_echoed() {
        let args = Args {
            send_configuration_request: true,
            ..Args::default()
        };
        let mut input = initialize(1);
        input.extend(frame(&json!({ "jsonrpc": "2.0", "id": 1, "result": [null, null] })));

        let (_, messages) = run(args, &input);
        let asked = with_method(&messages, "workspace/configuration").unwrap();
        assert_eq!(asked["id"], 1);
        let echo = with_method(&messages, "window/logMessage").unwrap();
        assert_eq!(echo["params"]["message"], "mockls: configuration [null,null]");
    }

    #[test]
    fn test_completion_lists_symbols() {
        let uri = "file:///tmp/lib.rs";
        let mut input = initialize(1);
        input.extend(did_open(uri, "pub fn alpha() {}\nfn beta() {}\n"));
        input.extend(request(2, "textDocument/completion", &position(uri, 1, 0)));

        let (_, messages) = run(Args::default(), &input);
        let labels: Vec<&str> = reply_to(&messages, 2)["result"]["items"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|i| i["label"].as_str())
            .collect();
        assert_eq!(labels, vec!["mockls_keyword", "alpha", "beta"]);
    }

    #[test]
    fn test_word_at_boundaries() {
        let text = "let foo_bar = 1;";
        assert_eq!(word_at(text, 0, 4), Some("foo_bar"));
        assert_eq!(word_at(text, 0, 10), Some("foo_bar"));
        assert_eq!(word_at(text, 0, 11), None);
        assert_eq!(word_at(text, 3, 0), None);
    }
}
