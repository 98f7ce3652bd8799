//! Minimal JSON-RPC 2.0 wire types and MCP method shapes.
//!
//! All three transports speak the same framing: a `JsonRpcRequest` goes out,
//! a `JsonRpcResponse` comes back correlated by id. Only the handful of MCP
//! methods the client core needs are modeled (`initialize`, `tools/list`,
//! `tools/call`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use opswatch_core::{OpsError, OpsResult};

/// JSON-RPC protocol version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision this client negotiates.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Request identifier: string or number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String identifier
    String(String),
    /// Numeric identifier
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// JSON-RPC request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Correlation id
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i64,
    /// Error message
    pub message: String,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Correlation id (absent for parse-failure responses)
    pub id: Option<RequestId>,
    /// Success payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Convert into the result payload, mapping server errors onto the
    /// client error taxonomy.
    ///
    /// # Errors
    /// Returns `ToolNotFound` for the MCP unknown-tool code, `ToolExecution`
    /// for tool-level failures, and `Server` otherwise.
    pub fn into_result(self, operation: &str) -> OpsResult<Value> {
        if let Some(error) = self.error {
            let err = match error.code {
                -32001 => OpsError::tool_not_found(error.message),
                -32002 => {
                    let transient = error
                        .data
                        .as_ref()
                        .and_then(|d| d.get("transient"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    OpsError::tool_execution(operation, error.message, transient)
                }
                _ => OpsError::server(format!("server error {}: {}", error.code, error.message)),
            };
            return Err(err.with_operation(operation));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Protocol revision requested
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Client identity
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
    /// Capability flags (opaque to this client)
    pub capabilities: Value,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_info: ClientInfo::default(),
            capabilities: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Client identity advertised during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name
    pub name: String,
    /// Client version
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "opswatch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One tool entry in a `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema of the tool parameters
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    /// Advertised tools
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
}

/// Build a `tools/call` params value.
pub fn call_tool_params(name: &str, arguments: &Value) -> Value {
    serde_json::json!({
        "name": name,
        "arguments": arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_version() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "tools/list");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn response_error_maps_tool_not_found() {
        let resp = JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(1.into()),
            result: None,
            error: Some(JsonRpcError {
                code: -32001,
                message: "no such tool".into(),
                data: None,
            }),
        };
        let err = resp.into_result("call_tool(x)").unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.kind.label(), "tool_not_found");
    }

    #[test]
    fn response_error_maps_transient_tool_failure() {
        let resp = JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(1.into()),
            result: None,
            error: Some(JsonRpcError {
                code: -32002,
                message: "backend busy".into(),
                data: Some(serde_json::json!({"transient": true})),
            }),
        };
        let err = resp.into_result("call_tool(x)").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn request_id_accepts_strings_and_numbers() {
        let s: RequestId = serde_json::from_str("\"abc\"").unwrap();
        let n: RequestId = serde_json::from_str("42").unwrap();
        assert_eq!(s, RequestId::String("abc".into()));
        assert_eq!(n, RequestId::Number(42));
    }
}
