// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Error taxonomy shared by the registry, transports, supervisor and router.
//!
//! Every failure that reaches an MCP caller is a [`BridgeError`]; its
//! [`kind`](BridgeError::kind) is the stable name reported in structured
//! tool errors.

use thiserror::Error;

/// Result alias used throughout the bridge engine.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Process exit code for a clean shutdown.
pub const EXIT_OK: u8 = 0;
/// Process exit code for a fault after startup completed.
pub const EXIT_RUNTIME: u8 = 1;
/// Process exit code for an unusable configuration.
pub const EXIT_CONFIG: u8 = 2;
/// Process exit code when the initial backend cannot be launched.
pub const EXIT_STARTUP: u8 = 3;

/// Errors surfaced by the bridge engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The configuration is missing, malformed, or fails validation.
    #[error("{0}")]
    Config(String),

    /// A backend executable could not be launched.
    #[error("failed to launch server '{server}': {message}")]
    Startup {
        /// Server id from the registry.
        server: String,
        /// Underlying OS error text.
        message: String,
    },

    /// A message header could not be parsed.
    #[error("framing error: {0}")]
    Framing(String),

    /// A well-framed message body was not valid JSON.
    #[error("invalid JSON payload: {0}")]
    Parse(String),

    /// The backend did not finish its handshake within the readiness timeout.
    #[error("server '{server}' is not ready (handshake still in progress)")]
    NotReady {
        /// Server id from the registry.
        server: String,
    },

    /// No response arrived before the request deadline.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Server id from the registry.
        server: String,
        /// LSP method name.
        method: String,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// The backend crashed past its restart budget or never launched.
    #[error("server '{server}' is unavailable: {reason}")]
    BackendUnavailable {
        /// Server id from the registry.
        server: String,
        /// Why the backend was given up on.
        reason: String,
    },

    /// The backend session ended while the request was outstanding.
    #[error("session with server '{server}' was terminated: {reason}")]
    SessionTerminated {
        /// Server id from the registry.
        server: String,
        /// What ended the session.
        reason: String,
    },

    /// No configured server declares the requested language.
    #[error("no server configured for language '{0}'")]
    NoServerForLanguage(String),

    /// No language tag was given and no default server is configured.
    #[error("no language given and no default server configured")]
    NoDefaultServer,

    /// The backend did not advertise the capability the tool needs.
    #[error("server '{server}' does not support {capability}")]
    UnsupportedCapability {
        /// Server id from the registry.
        server: String,
        /// The LSP server-capability key, e.g. `hoverProvider`.
        capability: String,
    },

    /// A server id that is not in the registry.
    #[error("server '{0}' is not defined in the configuration")]
    NotFound(String),

    /// Tool arguments failed validation.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The MCP client called a tool the bridge does not expose.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The backend answered with a JSON-RPC error object.
    #[error("server '{server}' returned error {code}: {message}")]
    Backend {
        /// Server id from the registry.
        server: String,
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// The backend abandoned the request after a `$/cancelRequest`.
    #[error("request to server '{server}' was cancelled: {message}")]
    Cancelled {
        /// Server id from the registry.
        server: String,
        /// The backend's error message.
        message: String,
    },

    /// The bridge stopped accepting requests.
    #[error("the bridge is shutting down")]
    ShuttingDown,
}

impl BridgeError {
    /// Stable taxonomy name reported to MCP callers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Startup { .. } => "StartupError",
            Self::Framing(_) => "FramingError",
            Self::Parse(_) => "ParseError",
            Self::NotReady { .. } => "NotReadyError",
            Self::Timeout { .. } => "TimeoutError",
            Self::BackendUnavailable { .. } => "BackendUnavailableError",
            Self::SessionTerminated { .. } => "SessionTerminatedError",
            Self::NoServerForLanguage(_) => "NoServerForLanguageError",
            Self::NoDefaultServer => "NoDefaultServerError",
            Self::UnsupportedCapability { .. } => "UnsupportedCapabilityError",
            Self::NotFound(_) => "NotFoundError",
            Self::InvalidArguments(_) => "InvalidArgumentsError",
            Self::UnknownTool(_) => "UnknownToolError",
            Self::Backend { .. } => "BackendError",
            Self::Cancelled { .. } => "CancelledError",
            Self::ShuttingDown => "ShuttingDownError",
        }
    }

    /// Builds a [`BridgeError::Config`] from anything displayable.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Builds a [`BridgeError::InvalidArguments`].
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    /// Builds a [`BridgeError::SessionTerminated`].
    pub fn terminated(server: &str, reason: impl Into<String>) -> Self {
        Self::SessionTerminated {
            server: server.to_string(),
            reason: reason.into(),
        }
    }

    /// Builds a [`BridgeError::BackendUnavailable`].
    pub fn unavailable(server: &str, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            server: server.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors produced while decoding a framed JSON-RPC stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The header block was malformed.
    ///
    /// When `fatal` is false the decoder has already skipped to the next
    /// plausible header and the stream can keep going.
    #[error("framing error: {message}")]
    Framing {
        /// What was wrong with the header.
        message: String,
        /// Whether the connection must be torn down.
        fatal: bool,
    },

    /// The body of a complete frame was not valid JSON.
    #[error("invalid JSON payload: {0}")]
    Parse(#[from] serde_json::Error),

    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Returns true if the stream cannot be resynchronised.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Framing { fatal, .. } => *fatal,
            Self::Parse(_) => false,
            Self::Io(_) => true,
        }
    }

    pub(crate) fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
            fatal: false,
        }
    }

    pub(crate) fn fatal(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
            fatal: true,
        }
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Framing { message, .. } => Self::Framing(message),
            CodecError::Parse(e) => Self::Parse(e.to_string()),
            CodecError::Io(e) => Self::Framing(e.to_string()),
        }
    }
}
