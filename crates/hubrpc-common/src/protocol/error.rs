//! hubrpc Error Model
//!
//! Errors are classified into four families by how they propagate:
//!
//! - **Transport** (`CONNECTION_FAILED`, `CONNECTION_LOST`, `NOT_CONNECTED`,
//!   `SERIALIZATION_FAILED`, `DESERIALIZATION_FAILED`, `INVALID_MESSAGE`):
//!   signalled locally; a received malformed frame closes the connection.
//! - **Routing** (`SERVICE_NOT_FOUND`, `METHOD_NOT_FOUND`): surfaced as
//!   error RESPONSEs to the caller.
//! - **Deadline / capacity** (`TIMEOUT`, `DEADLINE_EXCEEDED`,
//!   `MAX_DEPTH_EXCEEDED`): surfaced to the caller by whichever hop
//!   observes the violation.
//! - **Execution** (`EXECUTION_FAILED`, `INVALID_CONTEXT`,
//!   `INTERNAL_ERROR`): the handler or the plumbing failed in a way the
//!   caller should see.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The stable set of error codes exchanged on the wire.
///
/// Codes travel inside `RESPONSE.error.code` and `ERROR.error.code`. A code
/// this build does not know degrades to [`ErrorCode::InternalError`] on
/// decode rather than poisoning the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionFailed,
    ConnectionLost,
    NotConnected,
    ServiceNotFound,
    MethodNotFound,
    ExecutionFailed,
    Timeout,
    DeadlineExceeded,
    InvalidMessage,
    SerializationFailed,
    DeserializationFailed,
    InvalidContext,
    MaxDepthExceeded,
    InternalError,
}

impl ErrorCode {
    /// The wire spelling of this code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::ExecutionFailed => "EXECUTION_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::SerializationFailed => "SERIALIZATION_FAILED",
            ErrorCode::DeserializationFailed => "DESERIALIZATION_FAILED",
            ErrorCode::InvalidContext => "INVALID_CONTEXT",
            ErrorCode::MaxDepthExceeded => "MAX_DEPTH_EXCEEDED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Parses a wire code; unknown spellings fall back to `InternalError`.
    pub fn parse(s: &str) -> ErrorCode {
        match s {
            "CONNECTION_FAILED" => ErrorCode::ConnectionFailed,
            "CONNECTION_LOST" => ErrorCode::ConnectionLost,
            "NOT_CONNECTED" => ErrorCode::NotConnected,
            "SERVICE_NOT_FOUND" => ErrorCode::ServiceNotFound,
            "METHOD_NOT_FOUND" => ErrorCode::MethodNotFound,
            "EXECUTION_FAILED" => ErrorCode::ExecutionFailed,
            "TIMEOUT" => ErrorCode::Timeout,
            "DEADLINE_EXCEEDED" => ErrorCode::DeadlineExceeded,
            "INVALID_MESSAGE" => ErrorCode::InvalidMessage,
            "SERIALIZATION_FAILED" => ErrorCode::SerializationFailed,
            "DESERIALIZATION_FAILED" => ErrorCode::DeserializationFailed,
            "INVALID_CONTEXT" => ErrorCode::InvalidContext,
            "MAX_DEPTH_EXCEEDED" => ErrorCode::MaxDepthExceeded,
            _ => ErrorCode::InternalError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Err(D::Error::custom("empty error code"));
        }
        Ok(ErrorCode::parse(&s))
    }
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not connected to the gateway")]
    NotConnected,

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("Maximum call depth exceeded at depth {0}")]
    MaxDepthExceeded(u32),

    #[error("Internal error: {0}")]
    Internal(String),

    /// An error that arrived off the wire; the original code is preserved.
    #[error("{message}")]
    Remote {
        code: ErrorCode,
        message: String,
        stack: Option<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// The wire code this error travels under.
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            RpcError::ConnectionLost(_) => ErrorCode::ConnectionLost,
            RpcError::NotConnected => ErrorCode::NotConnected,
            RpcError::ServiceNotFound(_) => ErrorCode::ServiceNotFound,
            RpcError::MethodNotFound(_) => ErrorCode::MethodNotFound,
            RpcError::ExecutionFailed(_) => ErrorCode::ExecutionFailed,
            RpcError::Timeout(_) => ErrorCode::Timeout,
            RpcError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            RpcError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            RpcError::SerializationFailed(_) => ErrorCode::SerializationFailed,
            RpcError::DeserializationFailed(_) => ErrorCode::DeserializationFailed,
            RpcError::InvalidContext(_) => ErrorCode::InvalidContext,
            RpcError::MaxDepthExceeded(_) => ErrorCode::MaxDepthExceeded,
            RpcError::Internal(_) => ErrorCode::InternalError,
            RpcError::Remote { code, .. } => *code,
            RpcError::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Whether a retry wrapper should attempt this call again.
    ///
    /// Transient failures (timeouts, lost or missing connections, a handler
    /// that failed this once) are worth retrying. Routing misses and
    /// malformed traffic are permanent: retrying them repeats the mistake.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Timeout
                | ErrorCode::ConnectionLost
                | ErrorCode::NotConnected
                | ErrorCode::ConnectionFailed
                | ErrorCode::ExecutionFailed
        )
    }

    /// Maps an IO error to the transport error it represents.
    ///
    /// Timeouts/would-block become `Timeout`, peer-gone conditions become
    /// `ConnectionLost`, the rest stay `Io`.
    pub fn from_io(err: std::io::Error, context: &str) -> RpcError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => RpcError::Timeout(0),
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected => {
                RpcError::ConnectionLost(format!("{}: {}", context, err))
            }
            _ => RpcError::Io(err),
        }
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RpcError::SerializationFailed(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RpcError::DeserializationFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
