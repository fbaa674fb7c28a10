//! The conversation hierarchy as plain, id-keyed registries.
//!
//! Every level owns its children through a map; the map is the only path to a
//! child. Handles (`Session`, `Exchange`, ...) hold a path of ids, never a
//! reference into this tree.

use std::collections::HashMap;

use chrono::Utc;
use colloq_protocol::{CitationMarker, ExternalValue, FeedbackRating, Properties, Role};

use crate::citations::{self, CitationBoundary};
use crate::content_part::{ChunkHandler, CompletedContentPart, ContentPartCompletedHandler};
use crate::dispatcher::{EnvelopeHandler, SessionHandler, SessionRemovedHandler, SignalHandler};
use crate::error::{NodeKind, ProtocolStateError};
use crate::error_policy::{FallbackErrorHandlers, LocalErrorHandlers};
use crate::exchange::{CompletedExchange, ExchangeCompletedHandler, MessageHandler};
use crate::handlers::{HandlerId, HandlerList};
use crate::message::{
    CompletedMessage, ContentPartHandler, Interrupt, InterruptHandler, MessageCompletedHandler,
    ToolCall, ToolCallHandler,
};
use crate::session::{ExchangeHandler, MetaEventHandler};

type StateResult<T> = Result<T, ProtocolStateError>;

/// Fresh identifier for nodes and errors started without an explicit id.
pub(crate) fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Paths
// ============================================================================

/// Identifies one incarnation of a session.
///
/// Starting a session again under the same conversation id bumps the
/// generation, so handles to the replaced session stop resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionKey {
    pub conversation_id: String,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExchangePath {
    pub session: SessionKey,
    pub exchange_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessagePath {
    pub exchange: ExchangePath,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContentPartPath {
    pub message: MessagePath,
    pub content_part_id: String,
}

impl SessionKey {
    pub(crate) fn exchange(&self, exchange_id: &str) -> ExchangePath {
        ExchangePath {
            session: self.clone(),
            exchange_id: exchange_id.to_string(),
        }
    }
}

impl ExchangePath {
    pub(crate) fn message(&self, message_id: &str) -> MessagePath {
        MessagePath {
            exchange: self.clone(),
            message_id: message_id.to_string(),
        }
    }
}

impl MessagePath {
    pub(crate) fn content_part(&self, content_part_id: &str) -> ContentPartPath {
        ContentPartPath {
            message: self.clone(),
            content_part_id: content_part_id.to_string(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Default)]
pub(crate) struct ConversationState {
    pub sessions: HashMap<String, SessionNode>,
    next_generation: u64,
    pub any_event: HandlerList<EnvelopeHandler>,
    pub session_start: HandlerList<SessionHandler>,
    pub session_removed: HandlerList<SessionRemovedHandler>,
    pub errors: FallbackErrorHandlers,
}

impl ConversationState {
    pub(crate) fn insert_session(
        &mut self,
        conversation_id: &str,
        properties: Option<Properties>,
    ) -> SessionKey {
        self.next_generation += 1;
        let node = SessionNode::new(self.next_generation, properties.unwrap_or_default());
        self.sessions.insert(conversation_id.to_string(), node);
        SessionKey {
            conversation_id: conversation_id.to_string(),
            generation: self.next_generation,
        }
    }

    pub(crate) fn current_key(&self, conversation_id: &str) -> Option<SessionKey> {
        self.sessions.get(conversation_id).map(|node| SessionKey {
            conversation_id: conversation_id.to_string(),
            generation: node.generation,
        })
    }

    pub(crate) fn session(&self, key: &SessionKey) -> StateResult<&SessionNode> {
        self.sessions
            .get(&key.conversation_id)
            .filter(|node| node.generation == key.generation)
            .ok_or_else(|| ProtocolStateError::unknown(NodeKind::Session, &key.conversation_id))
    }

    pub(crate) fn session_mut(&mut self, key: &SessionKey) -> StateResult<&mut SessionNode> {
        self.sessions
            .get_mut(&key.conversation_id)
            .filter(|node| node.generation == key.generation)
            .ok_or_else(|| ProtocolStateError::unknown(NodeKind::Session, &key.conversation_id))
    }

    pub(crate) fn exchange(&self, path: &ExchangePath) -> StateResult<&ExchangeNode> {
        self.session(&path.session)?
            .exchanges
            .get(&path.exchange_id)
            .ok_or_else(|| ProtocolStateError::unknown(NodeKind::Exchange, &path.exchange_id))
    }

    pub(crate) fn exchange_mut(&mut self, path: &ExchangePath) -> StateResult<&mut ExchangeNode> {
        self.session_mut(&path.session)?
            .exchanges
            .get_mut(&path.exchange_id)
            .ok_or_else(|| ProtocolStateError::unknown(NodeKind::Exchange, &path.exchange_id))
    }

    pub(crate) fn message(&self, path: &MessagePath) -> StateResult<&MessageNode> {
        self.exchange(&path.exchange)?
            .messages
            .get(&path.message_id)
            .ok_or_else(|| ProtocolStateError::unknown(NodeKind::Message, &path.message_id))
    }

    pub(crate) fn message_mut(&mut self, path: &MessagePath) -> StateResult<&mut MessageNode> {
        self.exchange_mut(&path.exchange)?
            .messages
            .get_mut(&path.message_id)
            .ok_or_else(|| ProtocolStateError::unknown(NodeKind::Message, &path.message_id))
    }

    pub(crate) fn content_part(&self, path: &ContentPartPath) -> StateResult<&ContentPartNode> {
        self.message(&path.message)?
            .parts
            .get(&path.content_part_id)
            .ok_or_else(|| {
                ProtocolStateError::unknown(NodeKind::ContentPart, &path.content_part_id)
            })
    }

    pub(crate) fn content_part_mut(
        &mut self,
        path: &ContentPartPath,
    ) -> StateResult<&mut ContentPartNode> {
        self.message_mut(&path.message)?
            .parts
            .get_mut(&path.content_part_id)
            .ok_or_else(|| {
                ProtocolStateError::unknown(NodeKind::ContentPart, &path.content_part_id)
            })
    }

    /// Remove a dispatcher-level handler.
    pub(crate) fn remove_handler(&mut self, id: HandlerId) -> bool {
        self.any_event.remove(id)
            || self.session_start.remove(id)
            || self.session_removed.remove(id)
            || self.errors.remove(id)
    }
}

// ============================================================================
// Session
// ============================================================================

pub(crate) struct SessionNode {
    pub generation: u64,
    pub properties: Properties,
    /// The runtime acknowledged the session (`sessionStarted`).
    pub started: bool,
    pub ended: bool,
    pub exchanges: HashMap<String, ExchangeNode>,
    pub exchange_order: Vec<String>,
    pub handlers: SessionHandlers,
}

#[derive(Default)]
pub(crate) struct SessionHandlers {
    pub exchange_start: HandlerList<ExchangeHandler>,
    pub session_started: HandlerList<SignalHandler>,
    pub session_end: HandlerList<SignalHandler>,
    pub removed: HandlerList<SignalHandler>,
    pub meta_event: HandlerList<MetaEventHandler>,
    pub errors: LocalErrorHandlers,
}

impl SessionHandlers {
    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        self.exchange_start.remove(id)
            || self.session_started.remove(id)
            || self.session_end.remove(id)
            || self.removed.remove(id)
            || self.meta_event.remove(id)
            || self.errors.remove(id)
    }
}

impl SessionNode {
    fn new(generation: u64, properties: Properties) -> Self {
        Self {
            generation,
            properties,
            started: false,
            ended: false,
            exchanges: HashMap::new(),
            exchange_order: Vec::new(),
            handlers: SessionHandlers::default(),
        }
    }

    pub(crate) fn merge_properties(&mut self, properties: Option<&Properties>) {
        if let Some(properties) = properties {
            for (key, value) in properties {
                self.properties.insert(key.clone(), value.clone());
            }
        }
    }

    pub(crate) fn insert_exchange(&mut self, exchange_id: &str, properties: Option<Properties>) {
        self.exchanges.insert(
            exchange_id.to_string(),
            ExchangeNode::new(properties.unwrap_or_default()),
        );
        self.exchange_order.push(exchange_id.to_string());
    }
}

// ============================================================================
// Exchange
// ============================================================================

pub(crate) struct ExchangeNode {
    pub properties: Properties,
    pub ended: bool,
    pub feedback: Option<FeedbackRating>,
    pub messages: HashMap<String, MessageNode>,
    pub message_order: Vec<String>,
    pub handlers: ExchangeHandlers,
}

#[derive(Default)]
pub(crate) struct ExchangeHandlers {
    pub message_start: HandlerList<MessageHandler>,
    pub exchange_end: HandlerList<SignalHandler>,
    pub completed: HandlerList<ExchangeCompletedHandler>,
    pub errors: LocalErrorHandlers,
}

impl ExchangeHandlers {
    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        self.message_start.remove(id)
            || self.exchange_end.remove(id)
            || self.completed.remove(id)
            || self.errors.remove(id)
    }
}

impl ExchangeNode {
    fn new(properties: Properties) -> Self {
        Self {
            properties,
            ended: false,
            feedback: None,
            messages: HashMap::new(),
            message_order: Vec::new(),
            handlers: ExchangeHandlers::default(),
        }
    }

    pub(crate) fn insert_message(&mut self, message_id: &str, role: Role) {
        self.messages
            .insert(message_id.to_string(), MessageNode::new(role));
        self.message_order.push(message_id.to_string());
    }

    pub(crate) fn aggregate(&self, exchange_id: &str) -> CompletedExchange {
        CompletedExchange {
            exchange_id: exchange_id.to_string(),
            messages: self
                .message_order
                .iter()
                .filter_map(|id| self.messages.get(id).map(|m| m.aggregate(id)))
                .collect(),
        }
    }
}

// ============================================================================
// Message
// ============================================================================

pub(crate) struct MessageNode {
    pub role: Role,
    pub ended: bool,
    pub parts: HashMap<String, ContentPartNode>,
    pub part_order: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    pub interrupts: Vec<Interrupt>,
    pub handlers: MessageHandlers,
}

#[derive(Default)]
pub(crate) struct MessageHandlers {
    pub content_part_start: HandlerList<ContentPartHandler>,
    pub tool_call_start: HandlerList<ToolCallHandler>,
    pub tool_call_end: HandlerList<ToolCallHandler>,
    pub interrupt_start: HandlerList<InterruptHandler>,
    pub interrupt_end: HandlerList<InterruptHandler>,
    pub message_end: HandlerList<SignalHandler>,
    pub completed: HandlerList<MessageCompletedHandler>,
    pub errors: LocalErrorHandlers,
}

impl MessageHandlers {
    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        self.content_part_start.remove(id)
            || self.tool_call_start.remove(id)
            || self.tool_call_end.remove(id)
            || self.interrupt_start.remove(id)
            || self.interrupt_end.remove(id)
            || self.message_end.remove(id)
            || self.completed.remove(id)
            || self.errors.remove(id)
    }
}

impl MessageNode {
    fn new(role: Role) -> Self {
        Self {
            role,
            ended: false,
            parts: HashMap::new(),
            part_order: Vec::new(),
            tool_calls: Vec::new(),
            interrupts: Vec::new(),
            handlers: MessageHandlers::default(),
        }
    }

    pub(crate) fn insert_part(&mut self, content_part_id: &str, part: ContentPartNode) {
        self.parts.insert(content_part_id.to_string(), part);
        self.part_order.push(content_part_id.to_string());
    }

    pub(crate) fn tool_call_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolCall> {
        self.tool_calls
            .iter_mut()
            .find(|call| call.tool_call_id == tool_call_id)
    }

    pub(crate) fn interrupt_mut(&mut self, interrupt_id: &str) -> Option<&mut Interrupt> {
        self.interrupts
            .iter_mut()
            .find(|interrupt| interrupt.interrupt_id == interrupt_id)
    }

    /// Parts that have not ended are aggregated from what has been buffered.
    pub(crate) fn aggregate(&self, message_id: &str) -> CompletedMessage {
        CompletedMessage {
            message_id: message_id.to_string(),
            role: self.role,
            content_parts: self
                .part_order
                .iter()
                .filter_map(|id| {
                    self.parts
                        .get(id)
                        .map(|part| part.completed.clone().unwrap_or_else(|| part.aggregate(id)))
                })
                .collect(),
            tool_calls: self.tool_calls.clone(),
            interrupts: self.interrupts.clone(),
        }
    }
}

// ============================================================================
// Content part
// ============================================================================

pub(crate) struct ContentPartNode {
    pub mime_type: String,
    pub name: Option<String>,
    pub external_value: Option<ExternalValue>,
    pub is_incomplete: bool,
    pub is_transcript: bool,
    pub chunks: Vec<String>,
    /// Length of the buffered text in characters.
    pub char_len: usize,
    pub boundaries: Vec<CitationBoundary>,
    pub ended: bool,
    pub completed: Option<CompletedContentPart>,
    pub handlers: ContentPartHandlers,
}

#[derive(Default)]
pub(crate) struct ContentPartHandlers {
    pub chunk: HandlerList<ChunkHandler>,
    pub content_part_end: HandlerList<SignalHandler>,
    pub completed: HandlerList<ContentPartCompletedHandler>,
    pub errors: LocalErrorHandlers,
}

impl ContentPartHandlers {
    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        self.chunk.remove(id)
            || self.content_part_end.remove(id)
            || self.completed.remove(id)
            || self.errors.remove(id)
    }
}

impl ContentPartNode {
    pub(crate) fn new(
        mime_type: String,
        name: Option<String>,
        external_value: Option<ExternalValue>,
        is_incomplete: bool,
        is_transcript: bool,
    ) -> Self {
        Self {
            mime_type,
            name,
            external_value,
            is_incomplete,
            is_transcript,
            chunks: Vec::new(),
            char_len: 0,
            boundaries: Vec::new(),
            ended: false,
            completed: None,
            handlers: ContentPartHandlers::default(),
        }
    }

    pub(crate) fn push_chunk(&mut self, data: &str, citation: Option<&CitationMarker>) {
        let start = self.char_len;
        self.char_len += data.chars().count();
        self.chunks.push(data.to_string());

        if let Some(marker) = citation {
            self.boundaries.push(CitationBoundary {
                marker: marker.clone(),
                start,
                end: self.char_len,
                at: Utc::now(),
            });
        }
    }

    pub(crate) fn text(&self) -> String {
        self.chunks.concat()
    }

    pub(crate) fn aggregate(&self, content_part_id: &str) -> CompletedContentPart {
        let (citations, defects) = citations::resolve(&self.boundaries);
        CompletedContentPart {
            content_part_id: content_part_id.to_string(),
            mime_type: self.mime_type.clone(),
            name: self.name.clone(),
            external_value: self.external_value.clone(),
            is_incomplete: self.is_incomplete,
            is_transcript: self.is_transcript,
            text: self.text(),
            citations,
            defects,
        }
    }
}
