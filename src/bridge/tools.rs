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

//! The fixed set of MCP tools and how each maps onto an LSP request.

use lsp_types::{
    CodeActionContext, CodeActionParams, CompletionParams, DocumentDiagnosticParams,
    DocumentFormattingParams, DocumentSymbolParams, FormattingOptions, GotoDefinitionParams,
    HoverParams, PartialResultParams, Position, Range, ReferenceContext, ReferenceParams,
    RenameParams, SignatureHelpParams, TextDocumentIdentifier, TextDocumentPositionParams, Uri,
    WorkDoneProgressParams, WorkspaceSymbolParams,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;

use crate::error::{BridgeError, Result};
use crate::mcp::Tool;

/// What a tool needs from its arguments and which LSP request it becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// `textDocument/hover`.
    Hover,
    /// `textDocument/definition`.
    Definition,
    /// `textDocument/typeDefinition`.
    TypeDefinition,
    /// `textDocument/implementation`.
    Implementation,
    /// `textDocument/references`.
    References,
    /// `textDocument/completion`.
    Completion,
    /// `textDocument/signatureHelp`.
    SignatureHelp,
    /// `textDocument/documentSymbol`.
    DocumentSymbols,
    /// `workspace/symbol`.
    WorkspaceSymbols,
    /// `textDocument/codeAction`.
    CodeActions,
    /// `textDocument/rename`.
    Rename,
    /// `textDocument/formatting`.
    Formatting,
    /// Pull diagnostics, or the cache of pushed ones.
    Diagnostics,
    /// Answered by the bridge itself.
    ServerStatus,
}

/// One entry in the tool catalogue.
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    /// MCP tool name.
    pub name: &'static str,
    /// Shown to the MCP client.
    pub description: &'static str,
    /// Request shape.
    pub kind: ToolKind,
    /// LSP method, `None` for tools the bridge answers locally.
    pub method: Option<&'static str>,
    /// Server capability that must be advertised before the call is forwarded.
    pub capability: Option<&'static str>,
}

const CATALOGUE: &[ToolSpec] = &[
    ToolSpec {
        name: "hover",
        description: "Get hover information (documentation, type info) at a position.",
        kind: ToolKind::Hover,
        method: Some("textDocument/hover"),
        capability: Some("hoverProvider"),
    },
    ToolSpec {
        name: "definition",
        description: "Go to the definition of the symbol at a position.",
        kind: ToolKind::Definition,
        method: Some("textDocument/definition"),
        capability: Some("definitionProvider"),
    },
    ToolSpec {
        name: "type_definition",
        description: "Go to the definition of the type of the symbol at a position.",
        kind: ToolKind::TypeDefinition,
        method: Some("textDocument/typeDefinition"),
        capability: Some("typeDefinitionProvider"),
    },
    ToolSpec {
        name: "implementation",
        description: "Find implementations of the interface or trait at a position.",
        kind: ToolKind::Implementation,
        method: Some("textDocument/implementation"),
        capability: Some("implementationProvider"),
    },
    ToolSpec {
        name: "references",
        description: "Find all references to the symbol at a position.",
        kind: ToolKind::References,
        method: Some("textDocument/references"),
        capability: Some("referencesProvider"),
    },
    ToolSpec {
        name: "completion",
        description: "Get completion candidates at a position.",
        kind: ToolKind::Completion,
        method: Some("textDocument/completion"),
        capability: Some("completionProvider"),
    },
    ToolSpec {
        name: "signature_help",
        description: "Get signature help for the call surrounding a position.",
        kind: ToolKind::SignatureHelp,
        method: Some("textDocument/signatureHelp"),
        capability: Some("signatureHelpProvider"),
    },
    ToolSpec {
        name: "document_symbols",
        description: "Get the symbol outline of a document.",
        kind: ToolKind::DocumentSymbols,
        method: Some("textDocument/documentSymbol"),
        capability: Some("documentSymbolProvider"),
    },
    ToolSpec {
        name: "workspace_symbols",
        description: "Search for symbols across the workspace.",
        kind: ToolKind::WorkspaceSymbols,
        method: Some("workspace/symbol"),
        capability: Some("workspaceSymbolProvider"),
    },
    ToolSpec {
        name: "code_actions",
        description: "Get available code actions (quick fixes, refactorings) for a range.",
        kind: ToolKind::CodeActions,
        method: Some("textDocument/codeAction"),
        capability: Some("codeActionProvider"),
    },
    ToolSpec {
        name: "rename",
        description: "Compute the workspace edit that renames the symbol at a position. Nothing is applied.",
        kind: ToolKind::Rename,
        method: Some("textDocument/rename"),
        capability: Some("renameProvider"),
    },
    ToolSpec {
        name: "formatting",
        description: "Compute formatting edits for a whole document. Nothing is applied.",
        kind: ToolKind::Formatting,
        method: Some("textDocument/formatting"),
        capability: Some("documentFormattingProvider"),
    },
    ToolSpec {
        name: "diagnostics",
        description: "Get diagnostics for a document.",
        kind: ToolKind::Diagnostics,
        method: Some("textDocument/diagnostic"),
        capability: None,
    },
    ToolSpec {
        name: "server_status",
        description: "Show the state, restart count and capabilities of every configured language server.",
        kind: ToolKind::ServerStatus,
        method: None,
        capability: None,
    },
];

/// Every tool the bridge exposes, in listing order.
#[must_use]
pub const fn catalogue() -> &'static [ToolSpec] {
    CATALOGUE
}

/// Looks a tool up by its MCP name.
///
/// # Errors
///
/// Returns [`BridgeError::UnknownTool`] for names outside the catalogue.
pub fn find(name: &str) -> Result<&'static ToolSpec> {
    CATALOGUE
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| BridgeError::UnknownTool(name.to_string()))
}

/// Tool arguments. Which fields are required depends on the tool.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ToolArgs {
    /// Document URI.
    #[serde(default)]
    pub uri: Option<String>,
    /// Absolute file path, an alternative to `uri`.
    #[serde(default)]
    pub file: Option<String>,
    /// 0-based line.
    #[serde(default)]
    pub line: Option<u32>,
    /// 0-based UTF-16 character offset.
    #[serde(default)]
    pub character: Option<u32>,
    /// Routing tag; the default server handles calls without one.
    #[serde(default)]
    pub language: Option<String>,
    /// End of a range (`code_actions`).
    #[serde(default)]
    pub end_line: Option<u32>,
    /// End of a range (`code_actions`).
    #[serde(default)]
    pub end_character: Option<u32>,
    /// `references`: include the declaration itself.
    #[serde(default)]
    pub include_declaration: Option<bool>,
    /// `workspace_symbols`: search text.
    #[serde(default)]
    pub query: Option<String>,
    /// `rename`: the new identifier.
    #[serde(default)]
    pub new_name: Option<String>,
    /// `formatting`: spaces per tab.
    #[serde(default)]
    pub tab_size: Option<u32>,
    /// `formatting`: prefer spaces over tabs.
    #[serde(default)]
    pub insert_spaces: Option<bool>,
}

impl ToolArgs {
    /// Parses the raw `arguments` object of a `tools/call`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidArguments`] if the value does not fit.
    pub fn parse(arguments: Option<Value>) -> Result<Self> {
        match arguments {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| BridgeError::invalid_arguments(e.to_string())),
        }
    }

    /// The target document as a URI string.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidArguments`] if neither `uri` nor `file`
    /// is given, or the value cannot be made into a URI.
    pub fn document_uri(&self) -> Result<String> {
        if let Some(uri) = &self.uri {
            let parsed = url::Url::parse(uri)
                .map_err(|e| BridgeError::invalid_arguments(format!("invalid uri {uri:?}: {e}")))?;
            return Ok(parsed.to_string());
        }
        let Some(file) = &self.file else {
            return Err(BridgeError::invalid_arguments("missing 'uri' or 'file'"));
        };
        url::Url::from_file_path(Path::new(file))
            .map(|u| u.to_string())
            .map_err(|()| {
                BridgeError::invalid_arguments(format!("'file' must be an absolute path: {file}"))
            })
    }

    fn text_document(&self) -> Result<TextDocumentIdentifier> {
        let uri = self.document_uri()?;
        let uri: Uri = uri
            .parse()
            .map_err(|_| BridgeError::invalid_arguments(format!("invalid uri {uri:?}")))?;
        Ok(TextDocumentIdentifier { uri })
    }

    fn position(&self) -> Result<Position> {
        match (self.line, self.character) {
            (Some(line), Some(character)) => Ok(Position { line, character }),
            _ => Err(BridgeError::invalid_arguments(
                "'line' and 'character' are required",
            )),
        }
    }

    fn document_position(&self) -> Result<TextDocumentPositionParams> {
        Ok(TextDocumentPositionParams {
            text_document: self.text_document()?,
            position: self.position()?,
        })
    }

    fn range(&self) -> Result<Range> {
        let start = self.position()?;
        let end = Position {
            line: self.end_line.unwrap_or(start.line),
            character: self.end_character.unwrap_or(start.character),
        };
        if (end.line, end.character) < (start.line, start.character) {
            return Err(BridgeError::invalid_arguments("range end precedes its start"));
        }
        Ok(Range { start, end })
    }

    fn required<'a>(field: Option<&'a String>, name: &str) -> Result<&'a str> {
        field
            .map(String::as_str)
            .ok_or_else(|| BridgeError::invalid_arguments(format!("'{name}' is required")))
    }
}

impl ToolSpec {
    /// Whether the call targets one document, which must be opened first.
    #[must_use]
    pub const fn is_document_scoped(&self) -> bool {
        !matches!(self.kind, ToolKind::WorkspaceSymbols | ToolKind::ServerStatus)
    }

    /// Builds the LSP request parameters from parsed arguments.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidArguments`] if a required field is
    /// missing or malformed.
    pub fn build_params(&self, args: &ToolArgs) -> Result<Value> {
        let work_done = WorkDoneProgressParams::default();
        let partial = PartialResultParams::default();
        let params = match self.kind {
            ToolKind::Hover => to_value(HoverParams {
                text_document_position_params: args.document_position()?,
                work_done_progress_params: work_done,
            }),
            ToolKind::Definition | ToolKind::TypeDefinition | ToolKind::Implementation => {
                to_value(GotoDefinitionParams {
                    text_document_position_params: args.document_position()?,
                    work_done_progress_params: work_done,
                    partial_result_params: partial,
                })
            }
            ToolKind::References => to_value(ReferenceParams {
                text_document_position: args.document_position()?,
                work_done_progress_params: work_done,
                partial_result_params: partial,
                context: ReferenceContext {
                    include_declaration: args.include_declaration.unwrap_or(true),
                },
            }),
            ToolKind::Completion => to_value(CompletionParams {
                text_document_position: args.document_position()?,
                work_done_progress_params: work_done,
                partial_result_params: partial,
                context: None,
            }),
            ToolKind::SignatureHelp => to_value(SignatureHelpParams {
                context: None,
                text_document_position_params: args.document_position()?,
                work_done_progress_params: work_done,
            }),
            ToolKind::DocumentSymbols => to_value(DocumentSymbolParams {
                text_document: args.text_document()?,
                work_done_progress_params: work_done,
                partial_result_params: partial,
            }),
            ToolKind::WorkspaceSymbols => to_value(WorkspaceSymbolParams {
                query: ToolArgs::required(args.query.as_ref(), "query")?.to_string(),
                work_done_progress_params: work_done,
                partial_result_params: partial,
            }),
            ToolKind::CodeActions => to_value(CodeActionParams {
                text_document: args.text_document()?,
                range: args.range()?,
                context: CodeActionContext::default(),
                work_done_progress_params: work_done,
                partial_result_params: partial,
            }),
            ToolKind::Rename => to_value(RenameParams {
                text_document_position: args.document_position()?,
                new_name: ToolArgs::required(args.new_name.as_ref(), "new_name")?.to_string(),
                work_done_progress_params: work_done,
            }),
            ToolKind::Formatting => to_value(DocumentFormattingParams {
                text_document: args.text_document()?,
                options: FormattingOptions {
                    tab_size: args.tab_size.unwrap_or(4),
                    insert_spaces: args.insert_spaces.unwrap_or(true),
                    ..Default::default()
                },
                work_done_progress_params: work_done,
            }),
            ToolKind::Diagnostics => to_value(DocumentDiagnosticParams {
                text_document: args.text_document()?,
                identifier: None,
                previous_result_id: None,
                work_done_progress_params: work_done,
                partial_result_params: partial,
            }),
            ToolKind::ServerStatus => Ok(json!({})),
        }?;
        Ok(params)
    }

    /// The MCP tool listing entry.
    #[must_use]
    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.name.to_string(),
            description: Some(self.description.to_string()),
            input_schema: self.schema(),
        }
    }

    fn schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required: Vec<&str> = Vec::new();

        if self.is_document_scoped() {
            properties.insert(
                "uri".into(),
                json!({ "type": "string", "description": "Document URI, e.g. file:///abs/path/main.zig" }),
            );
            properties.insert(
                "file".into(),
                json!({ "type": "string", "description": "Absolute path to the document; used when 'uri' is absent" }),
            );
        }
        if matches!(
            self.kind,
            ToolKind::Hover
                | ToolKind::Definition
                | ToolKind::TypeDefinition
                | ToolKind::Implementation
                | ToolKind::References
                | ToolKind::Completion
                | ToolKind::SignatureHelp
                | ToolKind::CodeActions
                | ToolKind::Rename
        ) {
            properties.insert(
                "line".into(),
                json!({ "type": "integer", "minimum": 0, "description": "Line number (0-indexed)" }),
            );
            properties.insert(
                "character".into(),
                json!({ "type": "integer", "minimum": 0, "description": "Character offset in UTF-16 code units (0-indexed)" }),
            );
            required.extend(["line", "character"]);
        }
        if self.kind != ToolKind::ServerStatus {
            properties.insert(
                "language".into(),
                json!({ "type": "string", "description": "Language tag used to pick the server (e.g. 'zig', 'rust'). Defaults to the default server." }),
            );
        }

        match self.kind {
            ToolKind::References => {
                properties.insert(
                    "include_declaration".into(),
                    json!({ "type": "boolean", "description": "Include the declaration in results (default: true)" }),
                );
            }
            ToolKind::WorkspaceSymbols => {
                properties.insert(
                    "query".into(),
                    json!({ "type": "string", "description": "Symbol name or prefix to search for" }),
                );
                required.push("query");
            }
            ToolKind::CodeActions => {
                properties.insert(
                    "end_line".into(),
                    json!({ "type": "integer", "minimum": 0, "description": "End line (0-indexed, defaults to 'line')" }),
                );
                properties.insert(
                    "end_character".into(),
                    json!({ "type": "integer", "minimum": 0, "description": "End character (0-indexed, defaults to 'character')" }),
                );
            }
            ToolKind::Rename => {
                properties.insert(
                    "new_name".into(),
                    json!({ "type": "string", "description": "New name for the symbol" }),
                );
                required.push("new_name");
            }
            ToolKind::Formatting => {
                properties.insert(
                    "tab_size".into(),
                    json!({ "type": "integer", "description": "Spaces per tab (default: 4)" }),
                );
                properties.insert(
                    "insert_spaces".into(),
                    json!({ "type": "boolean", "description": "Use spaces instead of tabs (default: true)" }),
                );
            }
            _ => {}
        }

        let mut schema = json!({
            "type": "object",
            "properties": properties,
        });
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        schema
    }
}

fn to_value(params: impl Serialize) -> Result<Value> {
    serde_json::to_value(params).map_err(|e| BridgeError::Parse(e.to_string()))
}
