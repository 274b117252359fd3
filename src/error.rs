use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Wire-level error codes shared by dispatch results and protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    DuplicateTool,
    ToolDisabled,
    ValidationError,
    BridgeUnavailable,
    Timeout,
    HandlerError,
    StorageError,
    ParseError,
    MethodNotFound,
    InvalidParams,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NotFound => "NotFound",
            ErrorCode::DuplicateTool => "DuplicateTool",
            ErrorCode::ToolDisabled => "ToolDisabled",
            ErrorCode::ValidationError => "ValidationError",
            ErrorCode::BridgeUnavailable => "BridgeUnavailable",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::HandlerError => "HandlerError",
            ErrorCode::StorageError => "StorageError",
            ErrorCode::ParseError => "ParseError",
            ErrorCode::MethodNotFound => "MethodNotFound",
            ErrorCode::InvalidParams => "InvalidParams",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the catalogue, the dispatch bridge and the world.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
    #[error("tool '{0}' is disabled")]
    ToolDisabled(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("bridge to {endpoint} unavailable after {attempts} attempt(s)")]
    BridgeUnavailable { endpoint: String, attempts: u32 },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("configuration store error: {0}")]
    Storage(String),
}

impl ToolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ToolError::NotFound(_) => ErrorCode::NotFound,
            ToolError::DuplicateTool(_) => ErrorCode::DuplicateTool,
            ToolError::ToolDisabled(_) => ErrorCode::ToolDisabled,
            ToolError::Validation(_) => ErrorCode::ValidationError,
            ToolError::BridgeUnavailable { .. } => ErrorCode::BridgeUnavailable,
            ToolError::Timeout(_) => ErrorCode::Timeout,
            ToolError::Handler(_) => ErrorCode::HandlerError,
            ToolError::Storage(_) => ErrorCode::StorageError,
        }
    }

    /// Message sent over the wire; `from_wire` rebuilds the variant around it.
    pub fn wire_message(&self) -> String {
        match self {
            ToolError::NotFound(m)
            | ToolError::DuplicateTool(m)
            | ToolError::ToolDisabled(m)
            | ToolError::Validation(m)
            | ToolError::Handler(m)
            | ToolError::Storage(m) => m.clone(),
            ToolError::BridgeUnavailable { endpoint, .. } => endpoint.clone(),
            ToolError::Timeout(d) => format!("{:?}", d),
        }
    }

    /// Rebuild an error from a code and message received over the wire.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::NotFound => ToolError::NotFound(message),
            ErrorCode::DuplicateTool => ToolError::DuplicateTool(message),
            ErrorCode::ToolDisabled => ToolError::ToolDisabled(message),
            ErrorCode::ValidationError | ErrorCode::InvalidParams => ToolError::Validation(message),
            ErrorCode::BridgeUnavailable => ToolError::BridgeUnavailable {
                endpoint: message,
                attempts: 0,
            },
            ErrorCode::Timeout => ToolError::Handler(format!("remote timeout: {}", message)),
            ErrorCode::StorageError => ToolError::Storage(message),
            ErrorCode::HandlerError | ErrorCode::ParseError | ErrorCode::MethodNotFound => {
                ToolError::Handler(message)
            }
        }
    }
}

impl From<crate::store::StoreError> for ToolError {
    fn from(e: crate::store::StoreError) -> Self {
        ToolError::Storage(e.to_string())
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_variants() {
        assert_eq!(ToolError::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(
            ToolError::Timeout(Duration::from_millis(5)).code(),
            ErrorCode::Timeout
        );
        assert_eq!(
            ToolError::BridgeUnavailable {
                endpoint: "tcp://h:1".into(),
                attempts: 3
            }
            .code(),
            ErrorCode::BridgeUnavailable
        );
    }

    #[test]
    fn test_code_serializes_as_name() {
        let json = serde_json::to_string(&ErrorCode::ToolDisabled).unwrap();
        assert_eq!(json, "\"ToolDisabled\"");
        assert_eq!(ErrorCode::ToolDisabled.to_string(), "ToolDisabled");
    }

    #[test]
    fn test_wire_roundtrip_keeps_message() {
        let err = ToolError::ToolDisabled("echo".into());
        let back = ToolError::from_wire(err.code(), err.wire_message());
        assert_eq!(back, err);
    }

    #[test]
    fn test_remote_timeout_is_not_local_timeout() {
        let err = ToolError::from_wire(ErrorCode::Timeout, "slow peer".into());
        assert_eq!(err.code(), ErrorCode::HandlerError);
    }
}
