// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Validated server definitions and language routing.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// How to launch one backend language server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDefinition {
    /// Unique name, e.g. `rust-analyzer`.
    pub id: String,
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Language tags this server handles, e.g. `["rust"]`.
    pub languages: Vec<String>,
    /// Forwarded verbatim as `initializationOptions`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<Value>,
}

impl ServerDefinition {
    /// Convenience constructor used by tests and embedders.
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        languages: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args,
            languages,
            initialization_options: None,
        }
    }

    /// Returns true if this server declares `language`.
    #[must_use]
    pub fn handles(&self, language: &str) -> bool {
        self.languages.iter().any(|l| l == language)
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BridgeError::config("server id must not be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(BridgeError::config(format!(
                "server '{}': command must not be empty",
                self.id
            )));
        }
        if self.languages.is_empty() {
            return Err(BridgeError::config(format!(
                "server '{}': languages must list at least one tag",
                self.id
            )));
        }
        for (i, tag) in self.languages.iter().enumerate() {
            if tag.trim().is_empty() {
                return Err(BridgeError::config(format!(
                    "server '{}': language tags must not be blank",
                    self.id
                )));
            }
            if self.languages[..i].contains(tag) {
                return Err(BridgeError::config(format!(
                    "server '{}': language '{tag}' listed twice",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Immutable, ordered set of validated server definitions.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Vec<ServerDefinition>,
}

impl ServerRegistry {
    /// Validates `definitions` and freezes them in the given order.
    ///
    /// Language tags may repeat across servers; the earlier server wins
    /// when routing.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] for an empty table, a duplicate id,
    /// an empty command, or an empty, blank or repeated language list.
    pub fn load(definitions: Vec<ServerDefinition>) -> Result<Self> {
        if definitions.is_empty() {
            return Err(BridgeError::config("no servers configured"));
        }
        for (i, def) in definitions.iter().enumerate() {
            def.validate()?;
            if definitions[..i].iter().any(|other| other.id == def.id) {
                return Err(BridgeError::config(format!(
                    "duplicate server id '{}'",
                    def.id
                )));
            }
        }
        debug!(
            "Loaded {} server definition(s): {}",
            definitions.len(),
            definitions
                .iter()
                .map(|d| d.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self {
            servers: definitions,
        })
    }

    /// Looks up a definition by id.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotFound`] if no server has that id.
    pub fn lookup(&self, id: &str) -> Result<&ServerDefinition> {
        self.servers
            .iter()
            .find(|def| def.id == id)
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))
    }

    /// Definitions in registry order.
    pub fn iter(&self) -> impl Iterator<Item = &ServerDefinition> {
        self.servers.iter()
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns true if no servers are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Language tag → server id, derived from a registry.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// `(tag, server ids in registry order)`, in first-seen tag order.
    rules: Vec<(String, Vec<String>)>,
    default_server: Option<String>,
}

impl RoutingTable {
    /// Builds the routing view over `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if `default_server` is not in the registry.
    pub fn new(registry: &ServerRegistry, default_server: Option<String>) -> Result<Self> {
        if let Some(id) = &default_server
            && registry.lookup(id).is_err()
        {
            return Err(BridgeError::config(format!(
                "default server '{id}' is not defined in the configuration"
            )));
        }

        let mut rules: Vec<(String, Vec<String>)> = Vec::new();
        for def in registry.iter() {
            for tag in &def.languages {
                if let Some((_, ids)) = rules.iter_mut().find(|(t, _)| t == tag) {
                    ids.push(def.id.clone());
                } else {
                    rules.push((tag.clone(), vec![def.id.clone()]));
                }
            }
        }

        Ok(Self {
            rules,
            default_server,
        })
    }

    /// Chooses the server for a tool call.
    ///
    /// With a tag, the first server in registry order that declares it.
    /// Without one, the configured default.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NoServerForLanguage`] if nothing declares the tag, or
    /// [`BridgeError::NoDefaultServer`] if no tag was given and no default is set.
    pub fn route(&self, language: Option<&str>) -> Result<&str> {
        match language {
            Some(tag) => self
                .candidates(tag)
                .first()
                .map(String::as_str)
                .ok_or_else(|| BridgeError::NoServerForLanguage(tag.to_string())),
            None => self
                .default_server
                .as_deref()
                .ok_or(BridgeError::NoDefaultServer),
        }
    }

    /// All servers declaring `tag`, in registry order.
    #[must_use]
    pub fn candidates(&self, tag: &str) -> &[String] {
        self.rules
            .iter()
            .find(|(t, _)| t == tag)
            .map_or(&[], |(_, ids)| ids.as_slice())
    }

    /// The configured default server id.
    #[must_use]
    pub fn default_server(&self) -> Option<&str> {
        self.default_server.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn def(id: &str, languages: &[&str]) -> ServerDefinition {
        ServerDefinition::new(
            id,
            format!("{id}-bin"),
            Vec::new(),
            languages.iter().map(ToString::to_string).collect(),
        )
    }

    #[test]
    fn test_lookup() -> Result<()> {
        let registry = ServerRegistry::load(vec![def("zls", &["zig"]), def("gopls", &["go"])])?;
        assert_eq!(registry.lookup("gopls")?.command, "gopls-bin");
        assert_eq!(
            registry.lookup("pyright"),
            Err(BridgeError::NotFound("pyright".into()))
        );
        Ok(())
    }

    #[test]
    fn test_rejects_empty_table() {
        assert!(matches!(
            ServerRegistry::load(Vec::new()),
            Err(BridgeError::Config(ref m)) if m.contains("no servers")
        ));
    }

    #[test]
    fn test_rejects_duplicate_id() {
        let result = ServerRegistry::load(vec![def("zls", &["zig"]), def("zls", &["zig"])]);
        assert!(matches!(result, Err(BridgeError::Config(ref m)) if m.contains("duplicate")));
    }

    #[test]
    fn test_rejects_empty_command() {
        let mut bad = def("zls", &["zig"]);
        bad.command = "  ".into();
        assert!(matches!(
            ServerRegistry::load(vec![bad]),
            Err(BridgeError::Config(ref m)) if m.contains("command")
        ));
    }

    #[test]
    fn test_rejects_empty_languages() {
        assert!(matches!(
            ServerRegistry::load(vec![def("zls", &[])]),
            Err(BridgeError::Config(ref m)) if m.contains("languages")
        ));
    }

    #[test]
    fn test_rejects_repeated_tag_within_server() {
        assert!(matches!(
            ServerRegistry::load(vec![def("ts", &["typescript", "typescript"])]),
            Err(BridgeError::Config(ref m)) if m.contains("listed twice")
        ));
    }

    #[test]
    fn test_route_by_language() -> Result<()> {
        let registry = ServerRegistry::load(vec![def("zls", &["zig"]), def("gopls", &["go"])])?;
        let table = RoutingTable::new(&registry, None)?;
        assert_eq!(table.route(Some("zig"))?, "zls");
        assert_eq!(table.route(Some("go"))?, "gopls");
        Ok(())
    }

    #[test]
    fn test_route_unknown_language() -> Result<()> {
        let registry = ServerRegistry::load(vec![def("zls", &["zig"])])?;
        let table = RoutingTable::new(&registry, Some("zls".into()))?;
        assert_eq!(
            table.route(Some("ruby")),
            Err(BridgeError::NoServerForLanguage("ruby".into()))
        );
        Ok(())
    }

    #[test]
    fn test_shared_tag_prefers_registry_order() -> Result<()> {
        let registry = ServerRegistry::load(vec![
            def("tsserver", &["typescript", "javascript"]),
            def("biome", &["javascript"]),
        ])?;
        let table = RoutingTable::new(&registry, None)?;
        assert_eq!(table.route(Some("javascript"))?, "tsserver");
        assert_eq!(table.candidates("javascript"), ["tsserver", "biome"]);
        Ok(())
    }

    #[test]
    fn test_route_default() -> Result<()> {
        let registry = ServerRegistry::load(vec![def("zls", &["zig"]), def("gopls", &["go"])])?;
        let table = RoutingTable::new(&registry, Some("gopls".into()))?;
        assert_eq!(table.route(None)?, "gopls");

        let without = RoutingTable::new(&registry, None)?;
        assert_eq!(without.route(None), Err(BridgeError::NoDefaultServer));
        Ok(())
    }

    #[test]
    fn test_unknown_default_is_config_error() -> Result<()> {
        let registry = ServerRegistry::load(vec![def("zls", &["zig"])])?;
        assert!(matches!(
            RoutingTable::new(&registry, Some("clangd".into())),
            Err(BridgeError::Config(_))
        ));
        Ok(())
    }
}
