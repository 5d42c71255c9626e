// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A bridge between MCP (Model Context Protocol) and LSP (Language Server Protocol).
//!
//! Tool calls from an MCP client are routed by language tag to a supervised
//! language server process, forwarded as LSP requests, and their results
//! handed back as MCP tool results. Backends are launched lazily, restarted
//! within a budget when they crash, and stopped gracefully on shutdown.

/// Bridge logic between MCP and LSP.
pub mod bridge;
/// Content-Length and newline framing shared by both protocol sides.
pub mod codec;
/// Configuration file loading and bridge tunables.
pub mod config;
/// Error taxonomy and process exit codes.
pub mod error;
/// LSP backend sessions and their supervision.
pub mod lsp;
/// MCP server implementation and type definitions.
pub mod mcp;
/// Configured servers and language routing.
pub mod registry;
