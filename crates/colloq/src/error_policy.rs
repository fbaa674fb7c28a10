//! Three-tier routing of application errors.
//!
//! An `errorStart`/`errorEnd` addressed to a node is delivered to exactly one
//! tier:
//!
//! 1. the node's own handlers, if it has any;
//! 2. otherwise the dispatcher's "any error" handlers, if any;
//! 3. otherwise the dispatcher's "unhandled error" handlers, if any;
//! 4. otherwise nobody: the error is reported back to the caller of
//!    `dispatch` as [`ConversationError::UnhandledApplicationError`].
//!
//! Start and end are resolved independently.
//!
//! [`ConversationError::UnhandledApplicationError`]: crate::ConversationError::UnhandledApplicationError

use std::fmt;
use std::sync::Arc;

use colloq_protocol::{ErrorEnd, ErrorStart, EventPayload};
use serde_json::Value;

use crate::handlers::{Deferred, HandlerId, HandlerList};
use crate::state::generate_id;

/// Handler for application errors, at any tier.
pub type ErrorHandler = dyn Fn(&ApplicationError) + Send + Sync;

/// Whether an error is being raised or cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    Start,
    End,
}

/// The node an application error is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorTarget {
    Session,
    Exchange {
        exchange_id: String,
    },
    Message {
        exchange_id: String,
        message_id: String,
    },
    ContentPart {
        exchange_id: String,
        message_id: String,
        content_part_id: String,
    },
}

impl ErrorTarget {
    /// Resolve the target from the optional wire ids.
    ///
    /// Ids below a missing ancestor id are ignored.
    pub fn from_ids(
        exchange_id: Option<&str>,
        message_id: Option<&str>,
        content_part_id: Option<&str>,
    ) -> Self {
        match (exchange_id, message_id, content_part_id) {
            (Some(ex), Some(msg), Some(part)) => Self::ContentPart {
                exchange_id: ex.to_string(),
                message_id: msg.to_string(),
                content_part_id: part.to_string(),
            },
            (Some(ex), Some(msg), None) => Self::Message {
                exchange_id: ex.to_string(),
                message_id: msg.to_string(),
            },
            (Some(ex), None, _) => Self::Exchange {
                exchange_id: ex.to_string(),
            },
            (None, _, _) => Self::Session,
        }
    }

    /// Split back into wire ids (exchange, message, content part).
    pub fn ids(&self) -> (Option<String>, Option<String>, Option<String>) {
        match self {
            Self::Session => (None, None, None),
            Self::Exchange { exchange_id } => (Some(exchange_id.clone()), None, None),
            Self::Message {
                exchange_id,
                message_id,
            } => (Some(exchange_id.clone()), Some(message_id.clone()), None),
            Self::ContentPart {
                exchange_id,
                message_id,
                content_part_id,
            } => (
                Some(exchange_id.clone()),
                Some(message_id.clone()),
                Some(content_part_id.clone()),
            ),
        }
    }
}

/// Arguments for the `send_error_start` methods on every node.
#[derive(Debug, Clone, Default)]
pub struct ErrorArgs {
    /// Generated when absent.
    pub error_id: Option<String>,
    pub message: String,
    pub details: Option<Value>,
}

impl ErrorArgs {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_id: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Build the `errorStart` payload addressed to `target`.
    pub(crate) fn into_payload(self, target: &ErrorTarget) -> (String, EventPayload) {
        let error_id = self.error_id.unwrap_or_else(generate_id);
        let (exchange_id, message_id, content_part_id) = target.ids();
        let payload = EventPayload::ErrorStart(ErrorStart {
            error_id: error_id.clone(),
            message: self.message,
            details: self.details,
            exchange_id,
            message_id,
            content_part_id,
        });
        (error_id, payload)
    }
}

impl ErrorTarget {
    pub(crate) fn end_payload(&self, error_id: &str) -> EventPayload {
        let (exchange_id, message_id, content_part_id) = self.ids();
        EventPayload::ErrorEnd(ErrorEnd {
            error_id: error_id.to_string(),
            exchange_id,
            message_id,
            content_part_id,
        })
    }
}

impl fmt::Display for ErrorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Exchange { exchange_id } => write!(f, "exchange {exchange_id}"),
            Self::Message { message_id, .. } => write!(f, "message {message_id}"),
            Self::ContentPart {
                content_part_id, ..
            } => write!(f, "content part {content_part_id}"),
        }
    }
}

/// An error raised by the remote side against a node.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationError {
    pub conversation_id: String,
    pub target: ErrorTarget,
    pub error_id: String,
    pub phase: ErrorPhase,
    /// Present on start events.
    pub message: Option<String>,
    pub details: Option<Value>,
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            ErrorPhase::Start => "start",
            ErrorPhase::End => "end",
        };
        write!(
            f,
            "error {} ({phase}) on {} in conversation {}",
            self.error_id, self.target, self.conversation_id
        )?;
        if let Some(ref message) = self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Local error handlers owned by one node.
#[derive(Default)]
pub(crate) struct LocalErrorHandlers {
    pub start: HandlerList<ErrorHandler>,
    pub end: HandlerList<ErrorHandler>,
}

impl LocalErrorHandlers {
    pub(crate) fn for_phase(&self, phase: ErrorPhase) -> &HandlerList<ErrorHandler> {
        match phase {
            ErrorPhase::Start => &self.start,
            ErrorPhase::End => &self.end,
        }
    }

    pub(crate) fn add(&mut self, phase: ErrorPhase, handler: Arc<ErrorHandler>) -> HandlerId {
        match phase {
            ErrorPhase::Start => self.start.add(handler),
            ErrorPhase::End => self.end.add(handler),
        }
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        self.start.remove(id) || self.end.remove(id)
    }
}

/// Dispatcher-level error handlers: tiers two and three.
#[derive(Default)]
pub(crate) struct FallbackErrorHandlers {
    pub any: LocalErrorHandlers,
    pub unhandled: LocalErrorHandlers,
}

impl FallbackErrorHandlers {
    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        self.any.remove(id) || self.unhandled.remove(id)
    }
}

/// Which tier an error was delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTier {
    Local,
    Any,
    Unhandled,
    /// No handler at any tier.
    Unclaimed,
}

/// Pick the tier for `error` and queue its handlers.
///
/// `local` is `None` when the addressed node does not exist.
pub(crate) fn route(
    error: ApplicationError,
    local: Option<&LocalErrorHandlers>,
    fallback: &FallbackErrorHandlers,
    out: &mut Vec<Deferred>,
) -> ErrorTier {
    let phase = error.phase;
    let tiers = [
        (ErrorTier::Local, local.map(|l| l.for_phase(phase))),
        (ErrorTier::Any, Some(fallback.any.for_phase(phase))),
        (ErrorTier::Unhandled, Some(fallback.unhandled.for_phase(phase))),
    ];

    for (tier, list) in tiers {
        let Some(list) = list else { continue };
        if list.is_empty() {
            continue;
        }
        let handlers = list.snapshot();
        out.push(Box::new(move || {
            for handler in &handlers {
                handler(&error);
            }
        }));
        return tier;
    }

    ErrorTier::Unclaimed
}
