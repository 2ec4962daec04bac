//! hubrpc Message Schema
//!
//! The wire unit is a [`Message`], tagged on `"type"`. Field names are
//! camelCase on the wire; unknown fields are ignored by decoders so that
//! endpoints can evolve independently.
//!
//! `params` and `data` are opaque to the router and framed verbatim; they
//! are modelled as [`serde_json::Value`], the arbitrary value of either
//! codec. Handlers are responsible for validating them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::{generate_request_id, now_millis, CallContext};
use super::error::{ErrorCode, Result, RpcError};

/// The `metadata` key that marks a REGISTER frame as one member of a pooled
/// registration. The value is informational; arrival order is authoritative.
pub const POOL_INDEX_KEY: &str = "poolIndex";

/// Outcome tag of a RESPONSE.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// The error payload carried by RESPONSE and ERROR frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WireError {
    pub fn new(err: &RpcError) -> Self {
        WireError {
            message: err.to_string(),
            code: Some(err.code()),
            stack: match err {
                RpcError::Remote { stack, .. } => stack.clone(),
                _ => None,
            },
        }
    }

    /// Converts back into a typed error. A remote that omitted the code is
    /// treated as a failed execution.
    pub fn into_error(self) -> RpcError {
        RpcError::Remote {
            code: self.code.unwrap_or(ErrorCode::ExecutionFailed),
            message: self.message,
            stack: self.stack,
        }
    }
}

/// One frame's payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    /// Client → gateway on connect: claim a service name and advertise methods.
    #[serde(rename = "REGISTER", rename_all = "camelCase")]
    Register {
        service_name: String,
        methods: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// Gateway → client: registration accepted.
    #[serde(rename = "REGISTER_ACK")]
    RegisterAck,

    /// A request from caller to callee, routed by the gateway.
    #[serde(rename = "CALL", rename_all = "camelCase")]
    Call {
        id: String,
        from: String,
        to: String,
        method: String,
        params: Value,
        context: CallContext,
    },

    /// The reply to a CALL; `id` matches, `from`/`to` are swapped.
    #[serde(rename = "RESPONSE", rename_all = "camelCase")]
    Response {
        id: String,
        from: String,
        to: String,
        status: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
        context: CallContext,
    },

    /// One-way liveness signal.
    #[serde(rename = "HEARTBEAT", rename_all = "camelCase")]
    Heartbeat { from: String, timestamp: u64 },

    /// An unsolicited error pushed on a socket (duplicate registration,
    /// unroutable frame, protocol violation).
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: WireError,
    },
}

impl Message {
    /// Builds a CALL with a fresh globally unique request id.
    pub fn call(
        from: impl Into<String>,
        to: impl Into<String>,
        method: impl Into<String>,
        params: Value,
        context: CallContext,
    ) -> Message {
        Message::Call {
            id: generate_request_id(),
            from: from.into(),
            to: to.into(),
            method: method.into(),
            params,
            context,
        }
    }

    /// Builds the success RESPONSE to `call`, swapping `from`/`to` and
    /// carrying the context unchanged.
    pub fn success_response(call: &Message, data: Value) -> Result<Message> {
        match call {
            Message::Call {
                id,
                from,
                to,
                context,
                ..
            } => Ok(Message::Response {
                id: id.clone(),
                from: to.clone(),
                to: from.clone(),
                status: ResponseStatus::Success,
                data: Some(data),
                error: None,
                context: context.clone(),
            }),
            other => Err(RpcError::InvalidMessage(format!(
                "cannot respond to a {} frame",
                other.type_name()
            ))),
        }
    }

    /// Builds the error RESPONSE to `call`, swapping `from`/`to` and
    /// carrying the context unchanged.
    pub fn error_response(call: &Message, err: &RpcError) -> Result<Message> {
        match call {
            Message::Call {
                id,
                from,
                to,
                context,
                ..
            } => Ok(Message::Response {
                id: id.clone(),
                from: to.clone(),
                to: from.clone(),
                status: ResponseStatus::Error,
                data: None,
                error: Some(WireError::new(err)),
                context: context.clone(),
            }),
            other => Err(RpcError::InvalidMessage(format!(
                "cannot respond to a {} frame",
                other.type_name()
            ))),
        }
    }

    /// Builds a HEARTBEAT stamped with the current wall clock.
    pub fn heartbeat(from: impl Into<String>) -> Message {
        Message::Heartbeat {
            from: from.into(),
            timestamp: now_millis(),
        }
    }

    /// Builds an unsolicited ERROR frame.
    pub fn protocol_error(id: Option<String>, err: &RpcError) -> Message {
        Message::Error {
            id,
            error: WireError::new(err),
        }
    }

    /// The wire tag of this message, for logs and error text.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Register { .. } => "REGISTER",
            Message::RegisterAck => "REGISTER_ACK",
            Message::Call { .. } => "CALL",
            Message::Response { .. } => "RESPONSE",
            Message::Heartbeat { .. } => "HEARTBEAT",
            Message::Error { .. } => "ERROR",
        }
    }
}

/// REGISTER metadata for pool member `index`.
pub fn pool_metadata(index: usize) -> Value {
    serde_json::json!({ POOL_INDEX_KEY: index })
}

/// Extracts an integer `poolIndex` from REGISTER metadata, if present.
pub fn pool_index(metadata: Option<&Value>) -> Option<u64> {
    metadata?.get(POOL_INDEX_KEY)?.as_u64()
}
