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

//! JSON-RPC message shapes spoken with backend language servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC `MethodNotFound`.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// LSP `RequestCancelled`.
pub const REQUEST_CANCELLED: i64 = -32800;

fn default_null() -> Value {
    Value::Null
}

/// A request sent to, or received from, a language server.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id.
    pub id: RequestId,
    /// LSP method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: Value,
}

/// A response to a request.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id of the request being answered.
    pub id: Option<RequestId>,
    /// Result payload. A JSON `null` result deserialises to `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// A notification; carries no id and expects no response.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// LSP method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: Value,
}

/// JSON-RPC ids may be numbers or strings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id. The bridge only ever issues these.
    Number(i64),
    /// String id.
    String(String),
}

/// JSON-RPC error object.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional extra data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl RequestMessage {
    /// Builds a request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

impl NotificationMessage {
    /// Builds a notification.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

impl ResponseMessage {
    /// Builds a successful response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// What a decoded message from a server turned out to be.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Answer to one of our requests.
    Response(ResponseMessage),
    /// A request the server wants the bridge to answer.
    Request(RequestMessage),
    /// A server notification.
    Notification(NotificationMessage),
    /// Well-formed JSON that is not a JSON-RPC message.
    Invalid(Value),
}

impl Incoming {
    /// Classifies a raw JSON value by the presence of `method` and `id`.
    #[must_use]
    pub fn classify(value: Value) -> Self {
        let has_method = value.get("method").is_some_and(Value::is_string);
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        let parsed = match (has_method, has_id) {
            (true, true) => serde_json::from_value(value.clone()).map(Self::Request),
            (true, false) => serde_json::from_value(value.clone()).map(Self::Notification),
            (false, true) => serde_json::from_value(value.clone()).map(Self::Response),
            (false, false) => return Self::Invalid(value),
        };

        parsed.unwrap_or(Self::Invalid(value))
    }
}
