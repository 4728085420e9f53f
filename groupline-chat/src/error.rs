//! Error taxonomy shared by the client, the server and the collaborators.
//!
//! Errors split into three propagation classes:
//!
//! | Class        | Variants                                      | Handling                        |
//! |--------------|-----------------------------------------------|---------------------------------|
//! | fatal        | `Auth`, `GaveUp`                              | surfaced once, never retried    |
//! | transient    | `Connection`                                  | backoff + reconnect             |
//! | command      | everything else                               | `error` frame to one session    |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Machine-readable error code carried by the `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthError,
    ConnectionError,
    NotAuthorized,
    NotFound,
    Expired,
    Validation,
    RateLimited,
    Store,
    GaveUp,
}

/// Errors produced by the messaging core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Bad or expired token. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network or socket failure. Triggers the reconnect path.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The edit window for this message has elapsed.
    #[error("edit window expired for message {0}")]
    Expired(String),

    #[error("invalid command: {0}")]
    Validation(String),

    #[error("rate limited, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Message store collaborator failed.
    #[error("store error: {0}")]
    Store(String),

    /// Client reconnection exhausted its attempts.
    #[error("gave up reconnecting after {0} attempts")]
    GaveUp(u32),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::Auth(_) => ErrorCode::AuthError,
            ChatError::Connection(_) => ErrorCode::ConnectionError,
            ChatError::NotAuthorized(_) => ErrorCode::NotAuthorized,
            ChatError::NotFound(_) => ErrorCode::NotFound,
            ChatError::Expired(_) => ErrorCode::Expired,
            ChatError::Validation(_) => ErrorCode::Validation,
            ChatError::RateLimited { .. } => ErrorCode::RateLimited,
            ChatError::Store(_) => ErrorCode::Store,
            ChatError::GaveUp(_) => ErrorCode::GaveUp,
        }
    }

    /// Fatal errors end the connection lifecycle and require user action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChatError::Auth(_) | ChatError::GaveUp(_))
    }

    /// Transient errors are retried by the reconnect logic.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Connection(_))
    }

    /// Rebuild a command-level error from an `error` frame.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::AuthError => ChatError::Auth(message),
            ErrorCode::ConnectionError => ChatError::Connection(message),
            ErrorCode::NotAuthorized => ChatError::NotAuthorized(message),
            ErrorCode::NotFound => ChatError::NotFound(message),
            ErrorCode::Expired => ChatError::Expired(message),
            ErrorCode::Validation => ChatError::Validation(message),
            ErrorCode::RateLimited => ChatError::RateLimited { retry_after_ms: 0 },
            ErrorCode::Store => ChatError::Store(message),
            ErrorCode::GaveUp => ChatError::GaveUp(0),
        }
    }
}

impl From<ProtocolError> for ChatError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Deserialization(msg) => ChatError::Validation(msg),
            other => ChatError::Connection(other.to_string()),
        }
    }
}
