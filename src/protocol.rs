//! Newline-delimited JSON request/response messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCode, ToolError, ToolResult};

pub const PROTOCOL_VERSION: &str = "1.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    pub fn new(method: &str, params: Value, id: Value) -> Self {
        Self {
            method: method.to_string(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&ToolError> for RpcError {
    fn from(e: &ToolError) -> Self {
        Self {
            code: e.code(),
            message: e.wire_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parameters of `tools/call`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default = "new_request_id")]
    pub request_id: String,
}

impl DispatchRequest {
    pub fn new(tool_name: &str, arguments: Map<String, Value>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            arguments,
            request_id: new_request_id(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Ok,
    Error,
}

/// Normalized outcome of a dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub request_id: String,
    pub status: DispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<RpcError>,
}

impl DispatchResult {
    pub fn ok(request_id: String, payload: Value) -> Self {
        Self {
            request_id,
            status: DispatchStatus::Ok,
            payload: Some(payload),
            error_detail: None,
        }
    }

    pub fn error(request_id: String, error: &ToolError) -> Self {
        Self {
            request_id,
            status: DispatchStatus::Error,
            payload: None,
            error_detail: Some(RpcError::from(error)),
        }
    }

    pub fn from_outcome(request_id: String, outcome: ToolResult<Value>) -> Self {
        match outcome {
            Ok(payload) => Self::ok(request_id, payload),
            Err(e) => Self::error(request_id, &e),
        }
    }

    /// Convert a result received from a peer back into a local outcome.
    pub fn into_outcome(self) -> ToolResult<Value> {
        match self.status {
            DispatchStatus::Ok => Ok(self.payload.unwrap_or(Value::Null)),
            DispatchStatus::Error => {
                let detail = self.error_detail.unwrap_or(RpcError {
                    code: ErrorCode::HandlerError,
                    message: "remote error without detail".into(),
                });
                Err(ToolError::from_wire(detail.code, detail.message))
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == DispatchStatus::Ok
    }
}

/// Parse one request line. On failure, the ready-made error response.
pub fn parse_request(line: &str) -> Result<RpcRequest, RpcResponse> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| RpcResponse::err(Value::Null, ErrorCode::ParseError, e.to_string()))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| RpcResponse::err(id, ErrorCode::InvalidParams, e.to_string()))
}

/// Serialize a message followed by the line terminator
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
