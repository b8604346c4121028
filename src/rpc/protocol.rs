//! JSON-RPC 2.0 message types and the daemon's error codes.
//!
//! Standard codes are used for protocol faults; engine errors get codes in
//! the server-defined range so callers can tell a busy target from a typo.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::EngineError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// A sync is already running for the target.
pub const TARGET_BUSY: i32 = -32001;
/// Unknown target or job.
pub const NOT_FOUND: i32 = -32002;
/// A setting, URL or policy was rejected; `data.key` names the field.
pub const VALIDATION_ERROR: i32 = -32003;
pub const TARGET_DISABLED: i32 = -32004;
pub const SHUTTING_DOWN: i32 = -32005;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications, which get no reply.
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    pub fn new(method: &str, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&EngineError> for RpcError {
    fn from(err: &EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::TargetBusy(name) => {
                RpcError::new(TARGET_BUSY, message).with_data(json!({ "target": name }))
            }
            EngineError::TargetDisabled(name) => {
                RpcError::new(TARGET_DISABLED, message).with_data(json!({ "target": name }))
            }
            EngineError::TargetNotFound(name) => {
                RpcError::new(NOT_FOUND, message).with_data(json!({ "target": name }))
            }
            EngineError::JobNotFound(job) => {
                RpcError::new(NOT_FOUND, message).with_data(json!({ "job": job }))
            }
            EngineError::Validation { key, reason } => RpcError::new(VALIDATION_ERROR, message)
                .with_data(json!({ "key": key, "reason": reason })),
            EngineError::ShuttingDown => RpcError::new(SHUTTING_DOWN, message),
            EngineError::Precondition(_) | EngineError::Storage(_) => {
                RpcError::new(INTERNAL_ERROR, message)
            }
        }
    }
}

impl Response {
    pub fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                jsonrpc: JSONRPC_VERSION.to_string(),
                result: Some(value),
                error: None,
                id,
            },
            Err(e) => Self::failure(id, RpcError::new(INTERNAL_ERROR, e.to_string())),
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Reply to a line that was not JSON; the request id is unknown.
    pub fn parse_error() -> Self {
        Self::failure(Value::Null, RpcError::new(PARSE_ERROR, "Parse error"))
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::failure(id, RpcError::new(INVALID_REQUEST, "Invalid request"))
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::failure(
            id,
            RpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", method)),
        )
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::failure(id, RpcError::new(INVALID_PARAMS, details))
    }

    pub fn engine_error(id: Value, err: &EngineError) -> Self {
        Self::failure(id, RpcError::from(err))
    }
}
