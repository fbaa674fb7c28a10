//! Error types for the conversation client.

use std::fmt;

use thiserror::Error;

use crate::error_policy::ApplicationError;

/// Result type for conversation operations.
pub type Result<T, E = ConversationError> = std::result::Result<T, E>;

/// Addressable entity kinds, used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Session,
    Exchange,
    Message,
    ContentPart,
    ToolCall,
    Interrupt,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Exchange => write!(f, "exchange"),
            Self::Message => write!(f, "message"),
            Self::ContentPart => write!(f, "content part"),
            Self::ToolCall => write!(f, "tool call"),
            Self::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Network-level failures.
///
/// These surface through status-change observers and through rejection of
/// callers waiting for a connected socket. They are never retried past a
/// `disconnect()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// A caller was waiting for a connection when `disconnect()` was called.
    #[error("closed while waiting for connection")]
    ClosedWhileWaiting,

    /// There is no transport handle to send on.
    #[error("not connected")]
    NotConnected,

    /// A connection attempt failed. The transport may retry.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// An established connection was lost.
    #[error("connection dropped: {0}")]
    Dropped(String),

    /// The transport gave up and will not retry.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The token provider could not produce a credential.
    #[error("failed to obtain access token: {0}")]
    Token(String),
}

/// A mutating call or inbound event conflicts with the current hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolStateError {
    /// The node (or one of its ancestors) has already ended.
    #[error("{kind} {id} has already ended")]
    Ended { kind: NodeKind, id: String },

    /// The node does not exist, or no longer exists.
    #[error("{kind} {id} does not exist")]
    UnknownNode { kind: NodeKind, id: String },

    /// A start was sent for a node that is already open.
    #[error("{kind} {id} has already started")]
    AlreadyStarted { kind: NodeKind, id: String },

    #[error("feedback can only be sent after exchange {0} has ended")]
    FeedbackBeforeEnd(String),

    #[error("feedback was already sent for exchange {0}")]
    FeedbackAlreadySent(String),

    #[error("content part {0} has no external value")]
    NotExternal(String),
}

impl ProtocolStateError {
    pub(crate) fn ended(kind: NodeKind, id: &str) -> Self {
        Self::Ended {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn unknown(kind: NodeKind, id: &str) -> Self {
        Self::UnknownNode {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn already_started(kind: NodeKind, id: &str) -> Self {
        Self::AlreadyStarted {
            kind,
            id: id.to_string(),
        }
    }
}

/// Errors returned by conversation operations.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    ProtocolState(#[from] ProtocolStateError),

    /// An application error reached no local, "any" or "unhandled" handler.
    #[error("unhandled application error: {0}")]
    UnhandledApplicationError(Box<ApplicationError>),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// A collaborator (REST API, token provider) call failed.
    #[error("collaborator request failed: {0:#}")]
    Collaborator(anyhow::Error),
}

impl ConversationError {
    pub fn is_protocol_state(&self) -> bool {
        matches!(self, Self::ProtocolState(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
