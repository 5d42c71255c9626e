// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! lsp-mcp-server entry point.
//!
//! Speaks MCP on stdin/stdout; everything else, logs included, goes to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lsp_mcp_server::bridge::translate::notification_event;
use lsp_mcp_server::bridge::{LspBridgeHandler, Router};
use lsp_mcp_server::config::Config;
use lsp_mcp_server::error::{BridgeError, EXIT_CONFIG, EXIT_OK, EXIT_RUNTIME, EXIT_STARTUP};
use lsp_mcp_server::lsp::Supervisor;
use lsp_mcp_server::mcp::McpServer;
use lsp_mcp_server::registry::{RoutingTable, ServerRegistry};

/// Command-line arguments for lsp-mcp-server.
#[derive(Parser, Debug)]
#[command(name = "lsp-mcp-server")]
#[command(about = "LSP-MCP Bridge Server: exposes language servers (zls, rust-analyzer, gopls, ...) as MCP tools")]
#[command(version = env!("LSP_MCP_VERSION"))]
struct Args {
    /// Server to use when a tool call names no language (overrides `default_server`).
    #[arg(short, long)]
    server: Option<String>,

    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

const USAGE: &str = "Code intelligence from language servers. Document tools take a `uri` \
(or an absolute `file` path) and 0-based `line`/`character`; pass `language` to pick a \
server, otherwise the default server answers.";

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_tracing() {
        // No subscriber yet, so this is the only way to report it.
        #[allow(clippy::print_stderr, reason = "logging is not initialised")]
        {
            eprintln!("lsp-mcp-server: {e:#}");
        }
        return ExitCode::from(EXIT_RUNTIME);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    let code = match runtime.block_on(run(args)) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("{:#}", e);
            exit_code(&e)
        }
    };

    // A blocked stdin read must not hold the process open.
    runtime.shutdown_timeout(Duration::from_millis(500));
    ExitCode::from(code)
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lsp_mcp_server=info".parse()?))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<BridgeError>() {
        Some(BridgeError::Config(_) | BridgeError::NotFound(_)) => EXIT_CONFIG,
        Some(BridgeError::Startup { .. }) => EXIT_STARTUP,
        _ => EXIT_RUNTIME,
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    info!("Using configuration from {}", config.source);

    let default_server = args.server.or(config.default_server);
    let registry = ServerRegistry::load(config.servers).context("invalid server table")?;
    let routing = RoutingTable::new(&registry, default_server)
        .context("invalid default server")?;
    info!("{} server(s) configured", registry.len());

    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let root = config.root.map_or_else(|| cwd.clone(), |root| cwd.join(root));
    info!("Workspace root: {}", root.display());

    let settings = config.settings;
    let (supervisor, mut backend_events) = Supervisor::new(registry, settings.clone(), root);

    if let Some(id) = routing.default_server() {
        supervisor
            .start(id)
            .await
            .with_context(|| format!("failed to start default server '{id}'"))?;
    } else {
        warn!("No default server configured; calls must name a language");
    }

    let (events, events_rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(async move {
        while let Some(notification) = backend_events.recv().await {
            if let Some(event) = notification_event(&notification)
                && events.send(event).is_err()
            {
                break;
            }
        }
    });

    let handler = LspBridgeHandler::new(Router::new(supervisor.clone(), routing));
    let server = McpServer::new(handler)
        .with_drain_grace(settings.drain_grace())
        .with_instructions(USAGE);

    let result = server
        .run(tokio::io::stdin(), tokio::io::stdout(), events_rx, shutdown_signal())
        .await;

    info!("Shutting down LSP servers");
    supervisor.shutdown_all().await;
    forwarder.abort();

    result
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
