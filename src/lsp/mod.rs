// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// One backend process and its JSON-RPC plumbing.
pub mod connection;
/// The initialize handshake and client capabilities.
pub mod negotiator;
/// Outstanding request bookkeeping.
pub mod pending;
/// LSP message protocol definitions.
pub mod protocol;
/// Per-backend lifecycle state.
pub mod session;
/// Owns every backend session and restarts crashed ones.
pub mod supervisor;

pub use connection::{BackendNotification, reply_to_server_request};
pub use pending::CallContext;
pub use session::{CapabilitySet, SessionState, SessionStatus, SessionView};
pub use supervisor::Supervisor;
