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

//! Configuration file loading.
//!
//! The file is JSON. Server definitions are read in document order (that
//! order is the routing preference); the numeric tunables are layered with
//! the `config` crate so they can be overridden from the environment.

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::registry::ServerDefinition;

/// Configuration used when no file is given and none exists in the user
/// config directory.
pub const DEFAULT_CONFIG: &str = include_str!("default_config.json");

/// Prefix for environment overrides, e.g. `LSP_MCP_REQUEST_TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "LSP_MCP";

/// Where the configuration text came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A file named on the command line or found in the config directory.
    File(PathBuf),
    /// The built-in default.
    Embedded,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Embedded => f.write_str("<embedded default>"),
        }
    }
}

/// Fully parsed configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server definitions in file order. Not yet validated; see
    /// [`ServerRegistry::load`](crate::registry::ServerRegistry::load).
    pub servers: Vec<ServerDefinition>,
    /// Server used when a tool call carries no language tag.
    pub default_server: Option<String>,
    /// Workspace root announced to backends. Defaults to the current directory.
    pub root: Option<PathBuf>,
    /// Timeouts, restart policy and grace periods.
    pub settings: BridgeSettings,
    /// Origin of the configuration text.
    pub source: ConfigSource,
}

/// Tunables. Every field has a default so a file may list only `servers`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeSettings {
    /// Deadline for each forwarded LSP request.
    pub request_timeout_ms: u64,
    /// How long a request waits for a backend's handshake before failing
    /// with `NotReadyError`. Also bounds the `initialize` request itself.
    pub readiness_timeout_ms: u64,
    /// Maximum restarts inside the sliding window before giving up.
    pub restart_budget: u32,
    /// Length of the sliding restart window.
    pub restart_window_secs: u64,
    /// First restart backoff; doubles on each consecutive restart.
    pub restart_backoff_initial_ms: u64,
    /// Upper bound on restart backoff.
    pub restart_backoff_max_ms: u64,
    /// Time a backend gets to exit after `shutdown`/`exit` before it is killed.
    pub shutdown_grace_ms: u64,
    /// Time in-flight MCP calls get to finish once shutdown begins.
    pub drain_grace_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            readiness_timeout_ms: 30_000,
            restart_budget: 3,
            restart_window_secs: 60,
            restart_backoff_initial_ms: 100,
            restart_backoff_max_ms: 5_000,
            shutdown_grace_ms: 2_000,
            drain_grace_ms: 5_000,
        }
    }
}

impl BridgeSettings {
    /// Per-request deadline.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Readiness wait.
    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Sliding restart window.
    #[must_use]
    pub const fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    /// Backend exit grace period.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// In-flight drain grace period.
    #[must_use]
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Delay before restart attempt `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// capped at the configured maximum.
    #[must_use]
    pub fn restart_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(30);
        let candidate = self.restart_backoff_initial_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(candidate.min(self.restart_backoff_max_ms))
    }
}

/// Shape of the JSON file, minus the tunables.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    servers: ServerTable,
    #[serde(default)]
    default_server: Option<String>,
    #[serde(default)]
    root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    initialization_options: Option<serde_json::Value>,
}

/// The `servers` object, kept in document order with duplicate ids rejected.
#[derive(Debug)]
struct ServerTable(Vec<(String, ServerEntry)>);

impl<'de> Deserialize<'de> for ServerTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = ServerTable;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping server ids to server definitions")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<ServerTable, A::Error> {
                let mut entries: Vec<(String, ServerEntry)> = Vec::new();
                while let Some((id, entry)) = map.next_entry::<String, ServerEntry>()? {
                    if entries.iter().any(|(existing, _)| *existing == id) {
                        return Err(de::Error::custom(format!("duplicate server id '{id}'")));
                    }
                    entries.push((id, entry));
                }
                Ok(ServerTable(entries))
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

impl Config {
    /// Loads configuration from `explicit`, else the user config directory
    /// (`<config dir>/lsp-mcp-server/config.json`), else the embedded default.
    /// Tunables may be overridden by `LSP_MCP_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the explicit file is missing, or if
    /// any file is not valid JSON of the expected shape.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (text, source) = if let Some(path) = explicit {
            let text = std::fs::read_to_string(path).map_err(|e| {
                BridgeError::config(format!(
                    "failed to read configuration file {}: {e}",
                    path.display()
                ))
            })?;
            (text, ConfigSource::File(path.to_path_buf()))
        } else if let Some(path) = user_config_path().filter(|p| p.exists()) {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                BridgeError::config(format!(
                    "failed to read configuration file {}: {e}",
                    path.display()
                ))
            })?;
            (text, ConfigSource::File(path))
        } else {
            (DEFAULT_CONFIG.to_string(), ConfigSource::Embedded)
        };

        Self::parse(&text, source, true)
    }

    /// Parses configuration text without consulting the environment.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the text is not valid JSON of the
    /// expected shape.
    pub fn from_json(text: &str) -> Result<Self> {
        Self::parse(text, ConfigSource::Embedded, false)
    }

    fn parse(text: &str, source: ConfigSource, with_env: bool) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(text)
            .map_err(|e| BridgeError::config(format!("malformed configuration ({source}): {e}")))?;

        let settings = layer_settings(text, with_env)
            .map_err(|e| BridgeError::config(format!("invalid settings ({source}): {e}")))?;

        let servers = file
            .servers
            .0
            .into_iter()
            .map(|(id, entry)| ServerDefinition {
                id,
                command: entry.command,
                args: entry.args,
                languages: entry.languages,
                initialization_options: entry.initialization_options,
            })
            .collect();

        Ok(Self {
            servers,
            default_server: file.default_server,
            root: file.root,
            settings,
            source,
        })
    }
}

fn layer_settings(
    text: &str,
    with_env: bool,
) -> std::result::Result<BridgeSettings, config::ConfigError> {
    let defaults = BridgeSettings::default();
    let mut builder = config::Config::builder()
        .set_default("request_timeout_ms", defaults.request_timeout_ms)?
        .set_default("readiness_timeout_ms", defaults.readiness_timeout_ms)?
        .set_default("restart_budget", defaults.restart_budget)?
        .set_default("restart_window_secs", defaults.restart_window_secs)?
        .set_default(
            "restart_backoff_initial_ms",
            defaults.restart_backoff_initial_ms,
        )?
        .set_default("restart_backoff_max_ms", defaults.restart_backoff_max_ms)?
        .set_default("shutdown_grace_ms", defaults.shutdown_grace_ms)?
        .set_default("drain_grace_ms", defaults.drain_grace_ms)?
        .add_source(config::File::from_str(text, config::FileFormat::Json));

    if with_env {
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));
    }

    builder.build()?.try_deserialize()
}

/// `<config dir>/lsp-mcp-server/config.json`, if the platform has a config dir.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lsp-mcp-server").join("config.json"))
}
