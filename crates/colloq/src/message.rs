//! One role-tagged turn, with its content parts, tool calls and interrupts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use colloq_protocol::{
    ContentPartStart, EventPayload, InterruptEnd, InterruptStart, MessageEnd, Role, ToolCallEnd,
    ToolCallStart,
};
use log::debug;
use serde::Serialize;
use serde_json::Value;

use crate::content_part::{CompletedContentPart, ContentPart, StartContentPartArgs};
use crate::dispatcher::Shared;
use crate::error::Result;
use crate::error_policy::{ApplicationError, ErrorArgs, ErrorPhase, ErrorTarget};
use crate::handlers::HandlerId;
use crate::state::{MessageHandlers, MessagePath, generate_id};

/// Observer for content parts started by the remote side.
pub type ContentPartHandler = dyn Fn(ContentPart) + Send + Sync;
pub type ToolCallHandler = dyn Fn(&ToolCall) + Send + Sync;
pub type InterruptHandler = dyn Fn(&Interrupt) + Send + Sync;
pub type MessageCompletedHandler = dyn Fn(&CompletedMessage) + Send + Sync;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Set when the call ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolCallResult>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub is_error: bool,
    pub cancelled: bool,
}

/// A pause in the message waiting on the other side, e.g. a tool approval.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Interrupt {
    pub interrupt_id: String,
    pub interrupt_type: String,
    /// What triggered the interrupt.
    pub value: Value,
    /// What resolved it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Buffered result of a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedMessage {
    pub message_id: String,
    pub role: Role,
    pub content_parts: Vec<CompletedContentPart>,
    pub tool_calls: Vec<ToolCall>,
    pub interrupts: Vec<Interrupt>,
}

#[derive(Debug, Clone)]
pub struct StartToolCallArgs {
    /// Generated when absent.
    pub tool_call_id: Option<String>,
    pub tool_name: String,
    pub input: Option<Value>,
}

impl StartToolCallArgs {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: None,
            tool_name: tool_name.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

#[derive(Debug, Clone)]
pub struct StartInterruptArgs {
    /// Generated when absent.
    pub interrupt_id: Option<String>,
    pub interrupt_type: String,
    pub value: Value,
}

impl StartInterruptArgs {
    pub fn new(interrupt_type: impl Into<String>, value: Value) -> Self {
        Self {
            interrupt_id: None,
            interrupt_type: interrupt_type.into(),
            value,
        }
    }
}

/// Handle to a message.
#[derive(Clone)]
pub struct Message {
    shared: Arc<Shared>,
    path: MessagePath,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("exchange_id", &self.path.exchange.exchange_id)
            .field("message_id", &self.path.message_id)
            .finish()
    }
}

impl Message {
    pub(crate) fn new(shared: Arc<Shared>, path: MessagePath) -> Self {
        Self { shared, path }
    }

    pub fn message_id(&self) -> &str {
        &self.path.message_id
    }

    pub fn exchange_id(&self) -> &str {
        &self.path.exchange.exchange_id
    }

    pub fn role(&self) -> Option<Role> {
        self.shared
            .read(|state| state.message(&self.path).ok().map(|m| m.role))
    }

    pub fn is_ended(&self) -> bool {
        self.shared
            .read(|state| state.message(&self.path).map(|m| m.ended).unwrap_or(true))
    }

    /// Aggregate what has been received so far.
    pub fn completed(&self) -> Option<CompletedMessage> {
        self.shared.read(|state| {
            state
                .message(&self.path)
                .ok()
                .map(|m| m.aggregate(&self.path.message_id))
        })
    }

    pub fn start_content_part(&self, args: StartContentPartArgs) -> Result<ContentPart> {
        let content_part_id = args.content_part_id.unwrap_or_else(generate_id);
        self.send(EventPayload::ContentPartStart(ContentPartStart {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message_id.clone(),
            content_part_id: content_part_id.clone(),
            mime_type: args.mime_type,
            external_value: args.external_value,
            name: args.name,
            is_incomplete: args.is_incomplete,
            is_transcript: args.is_transcript,
        }))?;
        Ok(ContentPart::new(
            self.shared.clone(),
            self.path.content_part(&content_part_id),
        ))
    }

    pub fn get_content_part(&self, content_part_id: &str) -> Option<ContentPart> {
        let path = self.path.content_part(content_part_id);
        self.shared
            .read(|state| state.content_part(&path).is_ok())
            .then(|| ContentPart::new(self.shared.clone(), path))
    }

    /// Content parts in start order.
    pub fn content_parts(&self) -> Vec<ContentPart> {
        let ids = self.shared.read(|state| {
            state
                .message(&self.path)
                .map(|m| m.part_order.clone())
                .unwrap_or_default()
        });
        ids.iter()
            .map(|id| ContentPart::new(self.shared.clone(), self.path.content_part(id)))
            .collect()
    }

    /// Start a tool call; returns its id.
    pub fn start_tool_call(&self, args: StartToolCallArgs) -> Result<String> {
        let tool_call_id = args.tool_call_id.unwrap_or_else(generate_id);
        self.send(EventPayload::ToolCallStart(ToolCallStart {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message_id.clone(),
            tool_call_id: tool_call_id.clone(),
            tool_name: args.tool_name,
            input: args.input,
            timestamp: Some(Utc::now()),
        }))?;
        Ok(tool_call_id)
    }

    pub fn end_tool_call(&self, tool_call_id: &str, result: ToolCallResult) -> Result<()> {
        self.send(EventPayload::ToolCallEnd(ToolCallEnd {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message_id.clone(),
            tool_call_id: tool_call_id.to_string(),
            output: result.output,
            is_error: result.is_error,
            cancelled: result.cancelled,
            timestamp: Some(Utc::now()),
        }))
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.shared.read(|state| {
            state
                .message(&self.path)
                .map(|m| m.tool_calls.clone())
                .unwrap_or_default()
        })
    }

    /// Start an interrupt; returns its id.
    pub fn start_interrupt(&self, args: StartInterruptArgs) -> Result<String> {
        let interrupt_id = args.interrupt_id.unwrap_or_else(generate_id);
        self.send(EventPayload::InterruptStart(InterruptStart {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message_id.clone(),
            interrupt_id: interrupt_id.clone(),
            interrupt_type: args.interrupt_type,
            value: args.value,
        }))?;
        Ok(interrupt_id)
    }

    /// Resolve an interrupt, optionally with the resolving value.
    pub fn end_interrupt(&self, interrupt_id: &str, value: Option<Value>) -> Result<()> {
        self.send(EventPayload::InterruptEnd(InterruptEnd {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message_id.clone(),
            interrupt_id: interrupt_id.to_string(),
            value,
        }))
    }

    pub fn interrupts(&self) -> Vec<Interrupt> {
        self.shared.read(|state| {
            state
                .message(&self.path)
                .map(|m| m.interrupts.clone())
                .unwrap_or_default()
        })
    }

    pub fn send_end(&self) -> Result<()> {
        self.send(EventPayload::MessageEnd(MessageEnd {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message_id.clone(),
        }))
    }

    pub fn send_error_start(&self, args: ErrorArgs) -> Result<String> {
        let (error_id, payload) = args.into_payload(&self.target());
        self.send(payload)?;
        Ok(error_id)
    }

    pub fn send_error_end(&self, error_id: &str) -> Result<()> {
        self.send(self.target().end_payload(error_id))
    }

    fn target(&self) -> ErrorTarget {
        ErrorTarget::Message {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message_id.clone(),
        }
    }

    fn send(&self, payload: EventPayload) -> Result<()> {
        self.shared.send(&self.path.exchange.session, payload)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn register(&self, add: impl FnOnce(&mut MessageHandlers) -> HandlerId) -> HandlerId {
        self.shared.write(|state| match state.message_mut(&self.path) {
            Ok(message) => add(&mut message.handlers),
            Err(err) => {
                debug!("handler not registered: {err}");
                HandlerId::next()
            }
        })
    }

    pub fn on_content_part_start(
        &self,
        handler: impl Fn(ContentPart) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.content_part_start.add(Arc::new(handler)))
    }

    pub fn on_tool_call_start(
        &self,
        handler: impl Fn(&ToolCall) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.tool_call_start.add(Arc::new(handler)))
    }

    /// Called with the finished call, result included.
    pub fn on_tool_call_end(
        &self,
        handler: impl Fn(&ToolCall) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.tool_call_end.add(Arc::new(handler)))
    }

    pub fn on_interrupt_start(
        &self,
        handler: impl Fn(&Interrupt) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.interrupt_start.add(Arc::new(handler)))
    }

    pub fn on_interrupt_end(
        &self,
        handler: impl Fn(&Interrupt) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.interrupt_end.add(Arc::new(handler)))
    }

    pub fn on_message_end(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        self.register(|h| h.message_end.add(Arc::new(handler)))
    }

    /// Called with the aggregated message when the remote side ends it.
    pub fn on_completed(
        &self,
        handler: impl Fn(&CompletedMessage) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.completed.add(Arc::new(handler)))
    }

    pub fn on_error_start(
        &self,
        handler: impl Fn(&ApplicationError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.errors.add(ErrorPhase::Start, Arc::new(handler)))
    }

    pub fn on_error_end(
        &self,
        handler: impl Fn(&ApplicationError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.errors.add(ErrorPhase::End, Arc::new(handler)))
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.shared.write(|state| {
            state
                .message_mut(&self.path)
                .map(|m| m.handlers.remove(id))
                .unwrap_or(false)
        })
    }
}
