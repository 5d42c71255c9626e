// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// Maps MCP tool calls to LSP requests.
mod handler;
/// Language routing and request dispatch.
pub mod router;
/// The MCP tool catalogue.
pub mod tools;
/// LSP payloads rendered as MCP results and events.
pub mod translate;

pub use handler::LspBridgeHandler;
pub use router::Router;
