//! Common types shared across Buildbot API models.
//!
//! This module defines the JSON-RPC envelope used by control operations and
//! the structured error body returned by failed requests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_RPC_ID: AtomicU64 = AtomicU64::new(1);

/// A JSON-RPC 2.0 control request (`force`, `stop`, ...).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,

    /// Request ID, unique within the process.
    pub id: u64,

    /// Control method name.
    pub method: String,

    /// Method parameters.
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    /// Creates a request with a fresh ID.
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: NEXT_RPC_ID.fetch_add(1, Ordering::Relaxed),
            method: method.into(),
            params,
        }
    }

    /// A `force` request.
    pub fn force(params: serde_json::Map<String, serde_json::Value>) -> Self {
        Self::new("force", serde_json::Value::Object(params))
    }

    /// A `stop` request with an optional reason.
    pub fn stop(reason: Option<&str>) -> Self {
        let params = match reason {
            Some(reason) => serde_json::json!({ "reason": reason }),
            None => serde_json::json!({}),
        };
        Self::new("stop", params)
    }
}

/// Error message of a failed request: either plain text or per-field messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ErrorMessage {
    /// A single message.
    Text(String),
    /// Messages keyed by field name.
    Fields(BTreeMap<String, String>),
}

impl ErrorMessage {
    /// Renders the message; field messages become `key: value` pairs joined by `"; "`.
    pub fn render(&self) -> String {
        match self {
            ErrorMessage::Text(text) => text.clone(),
            ErrorMessage::Fields(fields) => fields
                .iter()
                .map(|(key, value)| format!("{}: {}", key, value))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    /// The error message.
    pub message: ErrorMessage,

    /// JSON-RPC error code, when the failure came from a control request.
    #[serde(default)]
    pub code: Option<i64>,
}

/// Body of a failed response: `{"error": {"message": ...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    /// The error details.
    pub error: ErrorDetail,
}

impl ErrorBody {
    /// Decodes the message of an error body, if the body has that shape.
    pub fn decode_message(body: &str) -> Option<String> {
        serde_json::from_str::<ErrorBody>(body)
            .ok()
            .map(|b| b.error.message.render())
    }
}

/// A JSON-RPC response. Only the result is of interest.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    /// Method result.
    #[serde(default)]
    pub result: serde_json::Value,
}
