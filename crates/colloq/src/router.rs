//! Applies one event to the conversation hierarchy.
//!
//! Both directions go through [`apply`]. Inbound events may create missing
//! ancestors for start events and queue handler invocations; outbound events
//! only mutate state and must address nodes that already exist. In both
//! directions an event addressed to an ended node (or a node below one) is
//! rejected.

use std::sync::Arc;

use chrono::Utc;
use colloq_protocol::{EventPayload, ExchangeStart, MessageStart, Properties, Role};
use log::debug;

use crate::content_part::ContentPart;
use crate::dispatcher::Shared;
use crate::error::{NodeKind, ProtocolStateError};
use crate::error_policy::{self, ApplicationError, ErrorPhase, ErrorTarget, ErrorTier};
use crate::exchange::Exchange;
use crate::handlers::{Deferred, defer_each};
use crate::message::{Interrupt, Message, ToolCall, ToolCallResult};
use crate::state::{
    ContentPartNode, ConversationState, ExchangeNode, ExchangePath, MessageNode, MessagePath,
    SessionKey, SessionNode,
};

type StateResult<T> = Result<T, ProtocolStateError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Received from the remote side.
    Inbound,
    /// Sent by this client.
    Outbound,
}

#[derive(Default)]
pub(crate) struct Applied {
    pub deferred: Vec<Deferred>,
    /// An inbound application error nobody handles.
    pub unclaimed: Option<ApplicationError>,
}

pub(crate) fn apply(
    ctx: &Arc<Shared>,
    state: &mut ConversationState,
    key: &SessionKey,
    payload: &EventPayload,
    origin: Origin,
) -> StateResult<Applied> {
    let mut applied = Applied::default();
    let inbound = origin == Origin::Inbound;
    let out = &mut applied.deferred;

    match payload {
        EventPayload::StartSession(p) => {
            open_session(state, key)?.merge_properties(p.properties.as_ref());
        }

        EventPayload::SessionStarted(p) => {
            let session = open_session(state, key)?;
            session.merge_properties(p.properties.as_ref());
            session.started = true;
            if inbound {
                defer_each(out, &session.handlers.session_started, |h| h());
            }
        }

        EventPayload::EndSession(_) => {
            let session = open_session(state, key)?;
            session.ended = true;
            if inbound {
                defer_each(out, &session.handlers.session_end, |h| h());
            }
            remove_session(state, &key.conversation_id, out);
        }

        EventPayload::ExchangeStart(p) => {
            let session = open_session(state, key)?;
            match session.exchanges.get_mut(&p.exchange_id) {
                Some(exchange) if exchange.ended => {
                    return Err(ProtocolStateError::ended(NodeKind::Exchange, &p.exchange_id));
                }
                Some(exchange) => {
                    if !inbound {
                        return Err(ProtocolStateError::already_started(
                            NodeKind::Exchange,
                            &p.exchange_id,
                        ));
                    }
                    // Implicitly created earlier; the late start only adds properties.
                    if let Some(ref properties) = p.properties {
                        for (k, v) in properties {
                            exchange.properties.insert(k.clone(), v.clone());
                        }
                    }
                }
                None => {
                    session.insert_exchange(&p.exchange_id, p.properties.clone());
                    if inbound {
                        let handle = Exchange::new(ctx.clone(), key.exchange(&p.exchange_id));
                        defer_each(out, &session.handlers.exchange_start, move |h| {
                            h(handle.clone())
                        });
                    }
                }
            }
        }

        EventPayload::ExchangeEnd(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, false, out)?;
            exchange.ended = true;
            if inbound {
                defer_each(out, &exchange.handlers.exchange_end, |h| h());
                if !exchange.handlers.completed.is_empty() {
                    let completed = exchange.aggregate(&p.exchange_id);
                    defer_each(out, &exchange.handlers.completed, move |h| h(&completed));
                }
            }
        }

        EventPayload::MessageStart(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, inbound, out)?;
            match exchange.messages.get(&p.message_id) {
                Some(message) if message.ended => {
                    return Err(ProtocolStateError::ended(NodeKind::Message, &p.message_id));
                }
                Some(_) if !inbound => {
                    return Err(ProtocolStateError::already_started(
                        NodeKind::Message,
                        &p.message_id,
                    ));
                }
                Some(_) => debug!("ignoring repeated start for message {}", p.message_id),
                None => {
                    exchange.insert_message(&p.message_id, p.role);
                    if inbound {
                        let handle = Message::new(
                            ctx.clone(),
                            key.exchange(&p.exchange_id).message(&p.message_id),
                        );
                        defer_each(out, &exchange.handlers.message_start, move |h| {
                            h(handle.clone())
                        });
                    }
                }
            }
        }

        EventPayload::MessageEnd(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, false, out)?;
            let path = key.exchange(&p.exchange_id);
            let message = open_message(ctx, exchange, &path, &p.message_id, false, out)?;
            message.ended = true;
            if inbound {
                defer_each(out, &message.handlers.message_end, |h| h());
                if !message.handlers.completed.is_empty() {
                    let completed = message.aggregate(&p.message_id);
                    defer_each(out, &message.handlers.completed, move |h| h(&completed));
                }
            }
        }

        EventPayload::ContentPartStart(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, inbound, out)?;
            let path = key.exchange(&p.exchange_id);
            let message = open_message(ctx, exchange, &path, &p.message_id, inbound, out)?;
            match message.parts.get(&p.content_part_id) {
                Some(part) if part.ended => {
                    return Err(ProtocolStateError::ended(
                        NodeKind::ContentPart,
                        &p.content_part_id,
                    ));
                }
                Some(_) if !inbound => {
                    return Err(ProtocolStateError::already_started(
                        NodeKind::ContentPart,
                        &p.content_part_id,
                    ));
                }
                Some(_) => debug!("ignoring repeated start for content part {}", p.content_part_id),
                None => {
                    message.insert_part(
                        &p.content_part_id,
                        ContentPartNode::new(
                            p.mime_type.clone(),
                            p.name.clone(),
                            p.external_value.clone(),
                            p.is_incomplete,
                            p.is_transcript,
                        ),
                    );
                    if inbound {
                        let handle = ContentPart::new(
                            ctx.clone(),
                            path.message(&p.message_id).content_part(&p.content_part_id),
                        );
                        defer_each(out, &message.handlers.content_part_start, move |h| {
                            h(handle.clone())
                        });
                    }
                }
            }
        }

        EventPayload::ContentPartChunk(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, false, out)?;
            let path = key.exchange(&p.exchange_id);
            let message = open_message(ctx, exchange, &path, &p.message_id, false, out)?;
            let part = open_part(message, &p.content_part_id)?;
            part.push_chunk(&p.data, p.citation.as_ref());
            if inbound {
                let chunk = p.clone();
                defer_each(out, &part.handlers.chunk, move |h| h(&chunk));
            }
        }

        EventPayload::ContentPartEnd(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, false, out)?;
            let path = key.exchange(&p.exchange_id);
            let message = open_message(ctx, exchange, &path, &p.message_id, false, out)?;
            let part = open_part(message, &p.content_part_id)?;
            part.ended = true;
            let completed = part.aggregate(&p.content_part_id);
            if !completed.defects.is_empty() {
                debug!(
                    "content part {} ended with citation defects: {:?}",
                    p.content_part_id, completed.defects
                );
            }
            part.completed = Some(completed.clone());
            if inbound {
                defer_each(out, &part.handlers.content_part_end, |h| h());
                defer_each(out, &part.handlers.completed, move |h| h(&completed));
            }
        }

        EventPayload::ToolCallStart(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, inbound, out)?;
            let path = key.exchange(&p.exchange_id);
            let message = open_message(ctx, exchange, &path, &p.message_id, inbound, out)?;
            match message.tool_call_mut(&p.tool_call_id) {
                Some(call) if call.ended_at.is_some() => {
                    return Err(ProtocolStateError::ended(NodeKind::ToolCall, &p.tool_call_id));
                }
                Some(_) if !inbound => {
                    return Err(ProtocolStateError::already_started(
                        NodeKind::ToolCall,
                        &p.tool_call_id,
                    ));
                }
                Some(_) => debug!("ignoring repeated start for tool call {}", p.tool_call_id),
                None => {
                    let call = ToolCall {
                        tool_call_id: p.tool_call_id.clone(),
                        tool_name: p.tool_name.clone(),
                        input: p.input.clone(),
                        result: None,
                        started_at: p.timestamp.unwrap_or_else(Utc::now),
                        ended_at: None,
                    };
                    message.tool_calls.push(call.clone());
                    if inbound {
                        defer_each(out, &message.handlers.tool_call_start, move |h| h(&call));
                    }
                }
            }
        }

        EventPayload::ToolCallEnd(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, false, out)?;
            let path = key.exchange(&p.exchange_id);
            let message = open_message(ctx, exchange, &path, &p.message_id, false, out)?;
            let call = message
                .tool_call_mut(&p.tool_call_id)
                .ok_or_else(|| ProtocolStateError::unknown(NodeKind::ToolCall, &p.tool_call_id))?;
            if call.ended_at.is_some() {
                return Err(ProtocolStateError::ended(NodeKind::ToolCall, &p.tool_call_id));
            }
            call.result = Some(ToolCallResult {
                output: p.output.clone(),
                is_error: p.is_error,
                cancelled: p.cancelled,
            });
            call.ended_at = Some(p.timestamp.unwrap_or_else(Utc::now));
            if inbound {
                let call = call.clone();
                defer_each(out, &message.handlers.tool_call_end, move |h| h(&call));
            }
        }

        EventPayload::InterruptStart(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, inbound, out)?;
            let path = key.exchange(&p.exchange_id);
            let message = open_message(ctx, exchange, &path, &p.message_id, inbound, out)?;
            match message.interrupt_mut(&p.interrupt_id) {
                Some(interrupt) if interrupt.ended_at.is_some() => {
                    return Err(ProtocolStateError::ended(NodeKind::Interrupt, &p.interrupt_id));
                }
                Some(_) if !inbound => {
                    return Err(ProtocolStateError::already_started(
                        NodeKind::Interrupt,
                        &p.interrupt_id,
                    ));
                }
                Some(_) => debug!("ignoring repeated start for interrupt {}", p.interrupt_id),
                None => {
                    let interrupt = Interrupt {
                        interrupt_id: p.interrupt_id.clone(),
                        interrupt_type: p.interrupt_type.clone(),
                        value: p.value.clone(),
                        resolution: None,
                        started_at: Utc::now(),
                        ended_at: None,
                    };
                    message.interrupts.push(interrupt.clone());
                    if inbound {
                        defer_each(out, &message.handlers.interrupt_start, move |h| {
                            h(&interrupt)
                        });
                    }
                }
            }
        }

        EventPayload::InterruptEnd(p) => {
            let session = open_session(state, key)?;
            let exchange = open_exchange(ctx, session, key, &p.exchange_id, false, out)?;
            let path = key.exchange(&p.exchange_id);
            let message = open_message(ctx, exchange, &path, &p.message_id, false, out)?;
            let interrupt = message.interrupt_mut(&p.interrupt_id).ok_or_else(|| {
                ProtocolStateError::unknown(NodeKind::Interrupt, &p.interrupt_id)
            })?;
            if interrupt.ended_at.is_some() {
                return Err(ProtocolStateError::ended(NodeKind::Interrupt, &p.interrupt_id));
            }
            interrupt.resolution = p.value.clone();
            interrupt.ended_at = Some(Utc::now());
            if inbound {
                let interrupt = interrupt.clone();
                defer_each(out, &message.handlers.interrupt_end, move |h| h(&interrupt));
            }
        }

        EventPayload::ErrorStart(p) => {
            if inbound {
                let error = ApplicationError {
                    conversation_id: key.conversation_id.clone(),
                    target: ErrorTarget::from_ids(
                        p.exchange_id.as_deref(),
                        p.message_id.as_deref(),
                        p.content_part_id.as_deref(),
                    ),
                    error_id: p.error_id.clone(),
                    phase: ErrorPhase::Start,
                    message: Some(p.message.clone()),
                    details: p.details.clone(),
                };
                applied.unclaimed = route_error(state, key, error, out);
            } else {
                open_session(state, key)?;
            }
        }

        EventPayload::ErrorEnd(p) => {
            if inbound {
                let error = ApplicationError {
                    conversation_id: key.conversation_id.clone(),
                    target: ErrorTarget::from_ids(
                        p.exchange_id.as_deref(),
                        p.message_id.as_deref(),
                        p.content_part_id.as_deref(),
                    ),
                    error_id: p.error_id.clone(),
                    phase: ErrorPhase::End,
                    message: None,
                    details: None,
                };
                applied.unclaimed = route_error(state, key, error, out);
            } else {
                open_session(state, key)?;
            }
        }

        EventPayload::MetaEvent(value) => {
            let session = open_session(state, key)?;
            if inbound {
                let value = value.clone();
                defer_each(out, &session.handlers.meta_event, move |h| h(&value));
            }
        }
    }

    Ok(applied)
}

/// Start events for the ancestors an inbound start event is missing,
/// outermost first.
///
/// The dispatcher applies these one at a time so that handlers registered
/// by a parent's start observers see the children created after it.
pub(crate) fn implicit_parents(
    state: &ConversationState,
    key: &SessionKey,
    payload: &EventPayload,
) -> Vec<EventPayload> {
    let (exchange_id, message_id) = match payload {
        EventPayload::MessageStart(p) => (&p.exchange_id, None),
        EventPayload::ContentPartStart(p) => (&p.exchange_id, Some(&p.message_id)),
        EventPayload::ToolCallStart(p) => (&p.exchange_id, Some(&p.message_id)),
        EventPayload::InterruptStart(p) => (&p.exchange_id, Some(&p.message_id)),
        _ => return Vec::new(),
    };
    let Ok(session) = state.session(key) else {
        return Vec::new();
    };

    let exchange = session.exchanges.get(exchange_id.as_str());
    let mut parents = Vec::new();
    if exchange.is_none() {
        parents.push(EventPayload::ExchangeStart(ExchangeStart {
            exchange_id: exchange_id.clone(),
            properties: None,
            timestamp: None,
        }));
    }
    if let Some(message_id) = message_id
        && exchange.is_none_or(|e| !e.messages.contains_key(message_id.as_str()))
    {
        parents.push(EventPayload::MessageStart(MessageStart {
            exchange_id: exchange_id.clone(),
            message_id: message_id.clone(),
            role: Role::Assistant,
            timestamp: None,
        }));
    }
    parents
}

/// Remove a session and queue its deletion notices.
///
/// Returns whether a session was removed.
pub(crate) fn remove_session(
    state: &mut ConversationState,
    conversation_id: &str,
    out: &mut Vec<Deferred>,
) -> bool {
    let Some(node) = state.sessions.remove(conversation_id) else {
        return false;
    };
    debug!("removed session {conversation_id}");

    defer_each(out, &node.handlers.removed, |h| h());
    let id = conversation_id.to_string();
    defer_each(out, &state.session_removed, move |h| h(&id));
    true
}

fn open_session<'a>(
    state: &'a mut ConversationState,
    key: &SessionKey,
) -> StateResult<&'a mut SessionNode> {
    let session = state.session_mut(key)?;
    if session.ended {
        return Err(ProtocolStateError::ended(
            NodeKind::Session,
            &key.conversation_id,
        ));
    }
    Ok(session)
}

/// Look up an open exchange, creating it first when `create` is set.
fn open_exchange<'a>(
    ctx: &Arc<Shared>,
    session: &'a mut SessionNode,
    key: &SessionKey,
    exchange_id: &str,
    create: bool,
    out: &mut Vec<Deferred>,
) -> StateResult<&'a mut ExchangeNode> {
    if !session.exchanges.contains_key(exchange_id) {
        if !create {
            return Err(ProtocolStateError::unknown(NodeKind::Exchange, exchange_id));
        }
        debug!(
            "creating exchange {exchange_id} implicitly in session {}",
            key.conversation_id
        );
        session.insert_exchange(exchange_id, None::<Properties>);
        let handle = Exchange::new(ctx.clone(), key.exchange(exchange_id));
        defer_each(out, &session.handlers.exchange_start, move |h| {
            h(handle.clone())
        });
    }

    let exchange = session
        .exchanges
        .get_mut(exchange_id)
        .ok_or_else(|| ProtocolStateError::unknown(NodeKind::Exchange, exchange_id))?;
    if exchange.ended {
        return Err(ProtocolStateError::ended(NodeKind::Exchange, exchange_id));
    }
    Ok(exchange)
}

/// Look up an open message, creating it first when `create` is set.
///
/// Implicitly created messages are assumed to come from the assistant.
fn open_message<'a>(
    ctx: &Arc<Shared>,
    exchange: &'a mut ExchangeNode,
    path: &ExchangePath,
    message_id: &str,
    create: bool,
    out: &mut Vec<Deferred>,
) -> StateResult<&'a mut MessageNode> {
    if !exchange.messages.contains_key(message_id) {
        if !create {
            return Err(ProtocolStateError::unknown(NodeKind::Message, message_id));
        }
        debug!(
            "creating message {message_id} implicitly in exchange {}",
            path.exchange_id
        );
        exchange.insert_message(message_id, Role::Assistant);
        let handle = Message::new(ctx.clone(), path.message(message_id));
        defer_each(out, &exchange.handlers.message_start, move |h| {
            h(handle.clone())
        });
    }

    let message = exchange
        .messages
        .get_mut(message_id)
        .ok_or_else(|| ProtocolStateError::unknown(NodeKind::Message, message_id))?;
    if message.ended {
        return Err(ProtocolStateError::ended(NodeKind::Message, message_id));
    }
    Ok(message)
}

fn open_part<'a>(
    message: &'a mut MessageNode,
    content_part_id: &str,
) -> StateResult<&'a mut ContentPartNode> {
    let part = message
        .parts
        .get_mut(content_part_id)
        .ok_or_else(|| ProtocolStateError::unknown(NodeKind::ContentPart, content_part_id))?;
    if part.ended {
        return Err(ProtocolStateError::ended(NodeKind::ContentPart, content_part_id));
    }
    Ok(part)
}

/// Route an inbound application error; returns it back if nobody claims it.
///
/// A target that does not exist has no local handlers, so the error falls
/// through to the dispatcher tiers.
fn route_error(
    state: &ConversationState,
    key: &SessionKey,
    error: ApplicationError,
    out: &mut Vec<Deferred>,
) -> Option<ApplicationError> {
    let session = state.session(key).ok();
    let local = session.and_then(|session| match &error.target {
        ErrorTarget::Session => Some(&session.handlers.errors),
        ErrorTarget::Exchange { exchange_id } => session
            .exchanges
            .get(exchange_id)
            .map(|e| &e.handlers.errors),
        ErrorTarget::Message {
            exchange_id,
            message_id,
        } => session
            .exchanges
            .get(exchange_id)
            .and_then(|e| e.messages.get(message_id))
            .map(|m| &m.handlers.errors),
        ErrorTarget::ContentPart {
            exchange_id,
            message_id,
            content_part_id,
        } => session
            .exchanges
            .get(exchange_id)
            .and_then(|e| e.messages.get(message_id))
            .and_then(|m| m.parts.get(content_part_id))
            .map(|p| &p.handlers.errors),
    });

    let unrouted = error.clone();
    match error_policy::route(error, local, &state.errors, out) {
        ErrorTier::Unclaimed => Some(unrouted),
        tier => {
            debug!("application error {} routed to {tier:?} handlers", unrouted.error_id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::EventDispatcher;
    use crate::sink::MemorySink;
    use colloq_protocol::{ContentPartChunk, ToolCallStart};

    fn setup() -> (Arc<Shared>, SessionKey) {
        let dispatcher = EventDispatcher::new(Arc::new(MemorySink::new()));
        let shared = dispatcher.shared().clone();
        let key = shared.state.lock().insert_session("conv-1", None);
        (shared, key)
    }

    #[test]
    fn test_outbound_requires_existing_parent() {
        let (shared, key) = setup();
        let mut state = shared.state.lock();
        let payload = EventPayload::MessageStart(MessageStart {
            exchange_id: "missing".to_string(),
            message_id: "m1".to_string(),
            role: Role::User,
            timestamp: None,
        });

        let err = apply(&shared, &mut state, &key, &payload, Origin::Outbound).err();
        assert_eq!(
            err,
            Some(ProtocolStateError::unknown(NodeKind::Exchange, "missing"))
        );
    }

    #[test]
    fn test_inbound_start_creates_parents() {
        let (shared, key) = setup();
        let mut state = shared.state.lock();
        let payload = EventPayload::MessageStart(MessageStart {
            exchange_id: "ex-1".to_string(),
            message_id: "m1".to_string(),
            role: Role::Assistant,
            timestamp: None,
        });

        apply(&shared, &mut state, &key, &payload, Origin::Inbound).unwrap();
        let session = state.session(&key).unwrap();
        assert_eq!(session.exchanges.len(), 1);
        assert_eq!(session.exchanges["ex-1"].messages.len(), 1);
    }

    #[test]
    fn test_chunk_for_unknown_part_is_rejected() {
        let (shared, key) = setup();
        let mut state = shared.state.lock();
        let start = EventPayload::ExchangeStart(ExchangeStart {
            exchange_id: "ex-1".to_string(),
            properties: None,
            timestamp: None,
        });
        apply(&shared, &mut state, &key, &start, Origin::Inbound).unwrap();

        let chunk = EventPayload::ContentPartChunk(ContentPartChunk {
            exchange_id: "ex-1".to_string(),
            message_id: "m1".to_string(),
            content_part_id: "cp".to_string(),
            data: "x".to_string(),
            citation: None,
        });
        let err = apply(&shared, &mut state, &key, &chunk, Origin::Inbound).err();
        assert_eq!(err, Some(ProtocolStateError::unknown(NodeKind::Message, "m1")));
    }

    #[test]
    fn test_repeated_outbound_exchange_start_is_rejected() {
        let (shared, key) = setup();
        let mut state = shared.state.lock();
        let start = EventPayload::ExchangeStart(ExchangeStart {
            exchange_id: "ex-1".to_string(),
            properties: None,
            timestamp: None,
        });
        apply(&shared, &mut state, &key, &start, Origin::Outbound).unwrap();
        let err = apply(&shared, &mut state, &key, &start, Origin::Outbound).err();
        assert_eq!(
            err,
            Some(ProtocolStateError::already_started(NodeKind::Exchange, "ex-1"))
        );
    }

    #[test]
    fn test_implicit_parents_outermost_first() {
        let (shared, key) = setup();
        let state = shared.state.lock();
        let payload = EventPayload::ToolCallStart(ToolCallStart {
            exchange_id: "ex-1".to_string(),
            message_id: "m1".to_string(),
            tool_call_id: "t1".to_string(),
            tool_name: "search".to_string(),
            input: None,
            timestamp: None,
        });

        let names: Vec<_> = implicit_parents(&state, &key, &payload)
            .iter()
            .map(EventPayload::name)
            .collect();
        assert_eq!(names, vec!["exchangeStart", "messageStart"]);
    }
}
