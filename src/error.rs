//! Error types for AtlasDir
//!
//! Provides a unified error type for the client, the server and the codec.

use thiserror::Error;

use crate::protocol::{MessageId, OpCode, ResultCode};

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasDir operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O and Transport Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Request Errors
    // -------------------------------------------------------------------------
    #[error("Request {id} timed out")]
    RequestTimeout { id: MessageId },

    #[error("Request {id} abandoned")]
    Abandoned { id: MessageId },

    #[error("{code}: {message}")]
    Operation {
        code: ResultCode,
        matched_dn: String,
        message: String,
    },

    #[error("Correlation id space exhausted")]
    ExhaustedIdSpace,

    // -------------------------------------------------------------------------
    // Connection Errors
    // -------------------------------------------------------------------------
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup failed: {0}")]
    SetupFailure(#[source] Box<AtlasError>),

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    // -------------------------------------------------------------------------
    // Server Errors
    // -------------------------------------------------------------------------
    #[error("No handler for {op:?} on '{target}'")]
    NoMatchingHandler { op: OpCode, target: String },

    #[error("Response {id} already finalized")]
    AlreadyFinalized { id: MessageId },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AtlasError {
    /// Build an operation error from a result code and diagnostic message.
    pub fn operation(code: ResultCode, message: impl Into<String>) -> Self {
        AtlasError::Operation {
            code,
            matched_dn: String::new(),
            message: message.into(),
        }
    }

    /// The protocol result code this error maps to.
    ///
    /// Used by the server when turning an error into a response, and by callers
    /// that want to branch on the peer's status.
    pub fn result_code(&self) -> ResultCode {
        match self {
            AtlasError::Operation { code, .. } => *code,
            AtlasError::SetupFailure(inner) => inner.result_code(),
            AtlasError::NoMatchingHandler { op: OpCode::ExtendedRequest, .. } => {
                ResultCode::ProtocolError
            }
            AtlasError::NoMatchingHandler { .. } => ResultCode::NoSuchObject,
            AtlasError::ProtocolDecode(_) | AtlasError::Serialization(_) => {
                ResultCode::ProtocolError
            }
            AtlasError::RequestTimeout { .. } => ResultCode::TimeLimitExceeded,
            AtlasError::NotConnected
            | AtlasError::ConnectionClosed
            | AtlasError::ReconnectExhausted { .. } => ResultCode::Unavailable,
            _ => ResultCode::Other,
        }
    }

    /// True for failures of the byte stream itself (retried per reconnect policy).
    pub fn is_transport(&self) -> bool {
        matches!(self, AtlasError::Io(_) | AtlasError::Transport(_))
    }
}

impl From<bincode::Error> for AtlasError {
    fn from(err: bincode::Error) -> Self {
        AtlasError::Serialization(err.to_string())
    }
}
