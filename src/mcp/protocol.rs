//! JSON-RPC 2.0 wire frames and typed MCP payloads.
//!
//! A frame is exactly one of request / response / notification:
//! a request has `id` and `method`, a response has `id` and exactly one of
//! `result` / `error`, a notification has `method` and no `id`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol revision spoken by the peer client.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// Standard JSON-RPC error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Extension codes for peer-specific conditions.
pub const INVALID_PROTOCOL_VERSION: i64 = -32001;
pub const RESOURCE_NOT_FOUND: i64 = -32002;
pub const TOOL_NOT_FOUND: i64 = -32003;
pub const PROMPT_NOT_FOUND: i64 = -32004;

// ─── Frame ────────────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Value, code: i64, message: &str, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data,
            }),
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Enforce version, shape exclusivity, and presence rules.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.jsonrpc != "2.0" {
            return Err(RpcError {
                code: INVALID_REQUEST,
                message: "invalid JSON-RPC version".to_string(),
                data: None,
            });
        }
        if let Some(id) = &self.id {
            if !id.is_u64() && !id.is_i64() && !id.is_string() {
                return Err(RpcError {
                    code: INVALID_REQUEST,
                    message: "id must be an integer or string".to_string(),
                    data: None,
                });
            }
        }
        if self.is_response() && self.result.is_some() && self.error.is_some() {
            return Err(RpcError {
                code: INVALID_REQUEST,
                message: "response carries both result and error".to_string(),
                data: None,
            });
        }
        if !self.is_request() && !self.is_response() && !self.is_notification() {
            return Err(RpcError {
                code: INVALID_REQUEST,
                message: "frame is not a request, response, or notification".to_string(),
                data: None,
            });
        }
        Ok(())
    }
}

/// Strictly monotonic request id source, starting at 1.
#[derive(Debug)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Handshake payloads ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ─── Catalog payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResult {
    #[serde(default)]
    pub prompts: Vec<PromptDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadResourceResult {
    #[serde(default)]
    pub contents: Vec<ResourceContents>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_is_identity_on_valid_frames() {
        let frames = vec![
            Frame::request(7, "tools/list", None),
            Frame::request(8, "tools/call", Some(json!({"name": "echo"}))),
            Frame::response(json!(7), json!({"tools": []})),
            Frame::error_response(json!(9), METHOD_NOT_FOUND, "method not found", None),
            Frame::notification("notifications/initialized", None),
        ];
        for frame in frames {
            let encoded = serde_json::to_string(&frame).unwrap();
            let decoded: Frame = serde_json::from_str(&encoded).unwrap();
            assert_eq!(frame, decoded);
            assert!(decoded.validate().is_ok());
        }
    }

    #[test]
    fn classification_is_exclusive() {
        let req = Frame::request(1, "resources/list", None);
        assert!(req.is_request() && !req.is_response() && !req.is_notification());

        let resp = Frame::response(json!(1), json!({}));
        assert!(resp.is_response() && !resp.is_request() && !resp.is_notification());

        let notif = Frame::notification("notifications/tools/list_changed", None);
        assert!(notif.is_notification() && !notif.is_request() && !notif.is_response());

        let err = Frame::error_response(json!(2), INTERNAL_ERROR, "boom", None);
        assert!(err.is_response() && err.is_error());
    }

    #[test]
    fn validate_rejects_bad_frames() {
        let mut wrong_version = Frame::request(1, "x", None);
        wrong_version.jsonrpc = "1.0".to_string();
        assert!(wrong_version.validate().is_err());

        // id present but neither request nor complete response.
        let hollow = Frame {
            jsonrpc: "2.0".to_string(),
            id: Some(json!(3)),
            method: None,
            params: None,
            result: None,
            error: None,
        };
        assert!(hollow.validate().is_err());

        let bad_id = Frame {
            id: Some(json!({"nested": true})),
            ..Frame::request(1, "x", None)
        };
        assert!(bad_id.validate().is_err());
    }

    #[test]
    fn id_generator_is_monotonic_from_one() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn string_ids_survive_round_trip() {
        let frame = Frame::response(json!("abc-1"), json!({"ok": true}));
        let decoded: Frame = serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert!(decoded.validate().is_ok());
        assert_eq!(decoded.id, Some(json!("abc-1")));
    }
}
