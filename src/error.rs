//! Session level error taxonomy

use thiserror::Error;

use crate::pipeline::PipelineError;
use crate::store::StoreError;

/// Malformed, oversized or out-of-sequence traffic
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown request {0:?}")]
    UnknownRequest(String),
    #[error("request has no \"req\" field")]
    MissingRequestType,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unexpected request {got:?} while {state}")]
    Unexpected { got: String, state: &'static str },
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
    #[error("payload of {size} bytes exceeds the limit of {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("connection idle for too long")]
    IdleTimeout,
    #[error("connection closed by client")]
    ConnectionClosed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("user {0:?} not found")]
    Auth(String),
    #[error("invalid password for user {0:?}")]
    Credential(String),
    #[error("{0}")]
    Permission(String),
    #[error("user {0:?} already exists")]
    UserExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("password hashing failed: {0}")]
    Hashing(#[from] argon2::Error),
}

impl SessionError {
    /// Text sent after `ERROR: `. Internal failures are not spelled out.
    pub fn client_message(&self) -> String {
        match self {
            SessionError::Storage(_) => "internal storage error".to_string(),
            SessionError::Pipeline(PipelineError::Closed) => "server is shutting down".to_string(),
            SessionError::Pipeline(_) => "internal processing error".to_string(),
            SessionError::Io(_) => "connection error".to_string(),
            SessionError::Hashing(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// The client went away or went quiet, nothing to report loudly
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SessionError::Protocol(ProtocolError::ConnectionClosed | ProtocolError::IdleTimeout)
                | SessionError::Io(_)
        )
    }
}
