//! Routing, lifecycle and aggregation tests against an in-memory sink.

use std::sync::Arc;

use colloq::protocol::{CitationSource, Role, mime};
use colloq::{
    ApplicationError, CitationDefectKind, ConversationError, ErrorPhase, MessageWithContentPartArgs,
    NodeKind, ProtocolStateError, StartContentPartArgs, StartExchangeArgs, StartMessageArgs,
    StartSessionArgs, StartToolCallArgs,
};
use parking_lot::Mutex;
use serde_json::json;

mod common;
use common::{count, counter, dispatch_all, dispatcher, envelope};

fn is_ended(err: &ConversationError, expected: NodeKind) -> bool {
    matches!(
        err,
        ConversationError::ProtocolState(ProtocolStateError::Ended { kind, .. })
            if *kind == expected
    )
}

/// Streaming a one-chunk reply leaves a navigable tree behind.
#[test]
fn test_inbound_reply_builds_tree() {
    let (dispatcher, _sink) = dispatcher();

    dispatch_all(
        &dispatcher,
        vec![
            json!({"conversationId": "conv-1", "exchangeStart": {"exchangeId": "ex-1"}}),
            json!({"conversationId": "conv-1", "messageStart": {
                "exchangeId": "ex-1", "messageId": "m-1", "role": "assistant"}}),
            json!({"conversationId": "conv-1", "contentPartStart": {
                "exchangeId": "ex-1", "messageId": "m-1", "contentPartId": "cp-1",
                "mimeType": "text/plain"}}),
            json!({"conversationId": "conv-1", "contentPartChunk": {
                "exchangeId": "ex-1", "messageId": "m-1", "contentPartId": "cp-1", "data": "hi"}}),
            json!({"conversationId": "conv-1", "contentPartEnd": {
                "exchangeId": "ex-1", "messageId": "m-1", "contentPartId": "cp-1"}}),
            json!({"conversationId": "conv-1", "messageEnd": {
                "exchangeId": "ex-1", "messageId": "m-1"}}),
            json!({"conversationId": "conv-1", "exchangeEnd": {"exchangeId": "ex-1"}}),
        ],
    );

    let message = dispatcher
        .get_session("conv-1")
        .and_then(|s| s.get_exchange("ex-1"))
        .and_then(|e| e.get_message("m-1"))
        .expect("message exists");
    assert_eq!(message.role(), Some(Role::Assistant));
    assert!(message.is_ended());

    let parts = message.content_parts();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].text().as_deref(), Some("hi"));
    assert_eq!(parts[0].completed().map(|c| c.text), Some("hi".to_string()));
}

/// An exchange for an unknown conversation creates exactly one session.
#[test]
fn test_lazy_session_creation() {
    let (dispatcher, _sink) = dispatcher();
    let (sessions, bump_session) = counter();
    let exchanges = Arc::new(Mutex::new(Vec::new()));
    {
        let exchanges = exchanges.clone();
        dispatcher.on_session_start(move |session| {
            bump_session();
            let exchanges = exchanges.clone();
            session.on_exchange_start(move |exchange| {
                exchanges.lock().push(exchange.exchange_id().to_string());
            });
        });
    }

    dispatch_all(
        &dispatcher,
        vec![
            json!({"conversationId": "conv-9", "exchangeStart": {"exchangeId": "ex-1"}}),
            json!({"conversationId": "conv-9", "exchangeStart": {"exchangeId": "ex-2"}}),
        ],
    );

    assert_eq!(count(&sessions), 1);
    assert_eq!(dispatcher.sessions().len(), 1);
    assert_eq!(*exchanges.lock(), vec!["ex-1", "ex-2"]);
}

/// Any-event observers see a remote conversation before its session exists.
#[test]
fn test_any_event_precedes_session_start() {
    let (dispatcher, _sink) = dispatcher();
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = order.clone();
        dispatcher.on_any_event(move |envelope| {
            order.lock().push(format!("any:{}", envelope.payload.name()));
        });
    }
    {
        let order = order.clone();
        dispatcher.on_session_start(move |session| {
            order.lock().push(format!("session:{}", session.conversation_id()));
        });
    }

    dispatch_all(
        &dispatcher,
        vec![json!({"conversationId": "conv-7", "exchangeStart": {"exchangeId": "ex-1"}})],
    );

    assert_eq!(*order.lock(), vec!["any:exchangeStart", "session:conv-7"]);
}

#[test]
fn test_outbound_order_matches_calls() {
    let (dispatcher, sink) = dispatcher();
    let session = dispatcher
        .start_session(StartSessionArgs::new("conv-1"))
        .unwrap();
    let exchange = session
        .start_exchange(StartExchangeArgs::with_id("ex-1"))
        .unwrap();
    let message = exchange
        .start_message(StartMessageArgs::new(Role::User))
        .unwrap();
    let part = message
        .start_content_part(StartContentPartArgs::new(mime::TEXT_PLAIN))
        .unwrap();
    part.send_chunk("a").unwrap();
    part.send_chunk("b").unwrap();
    part.send_end().unwrap();
    message.send_end().unwrap();
    exchange.send_end().unwrap();
    session.send_end().unwrap();

    assert_eq!(
        sink.sent_names(),
        vec![
            "startSession",
            "exchangeStart",
            "messageStart",
            "contentPartStart",
            "contentPartChunk",
            "contentPartChunk",
            "contentPartEnd",
            "messageEnd",
            "exchangeEnd",
            "endSession",
        ]
    );
    assert!(sink.sent().iter().all(|e| e.conversation_id == "conv-1"));
    assert!(dispatcher.get_session("conv-1").is_none());
}

#[test]
fn test_ended_nodes_reject_children() {
    let (dispatcher, _sink) = dispatcher();
    let session = dispatcher
        .start_session(StartSessionArgs::new("conv-1"))
        .unwrap();
    let exchange = session.start_exchange(StartExchangeArgs::default()).unwrap();
    let message = exchange.start_message(StartMessageArgs::default()).unwrap();
    let part = message
        .start_content_part(StartContentPartArgs::new(mime::TEXT_PLAIN))
        .unwrap();

    part.send_end().unwrap();
    let err = part.send_chunk("late").unwrap_err();
    assert!(is_ended(&err, NodeKind::ContentPart), "{err}");

    message.send_end().unwrap();
    let err = message
        .start_content_part(StartContentPartArgs::new(mime::TEXT_PLAIN))
        .unwrap_err();
    assert!(is_ended(&err, NodeKind::Message), "{err}");
    let err = message
        .start_tool_call(StartToolCallArgs::new("search"))
        .unwrap_err();
    assert!(is_ended(&err, NodeKind::Message), "{err}");

    exchange.send_end().unwrap();
    let err = exchange.start_message(StartMessageArgs::default()).unwrap_err();
    assert!(is_ended(&err, NodeKind::Exchange), "{err}");

    session.send_end().unwrap();
    assert!(session.is_ended());
    let err = session.start_exchange(StartExchangeArgs::default()).unwrap_err();
    assert!(err.is_protocol_state(), "{err}");
}

#[test]
fn test_inbound_event_after_end_is_rejected() {
    let (dispatcher, _sink) = dispatcher();
    dispatch_all(
        &dispatcher,
        vec![
            json!({"conversationId": "conv-1", "exchangeStart": {"exchangeId": "ex-1"}}),
            json!({"conversationId": "conv-1", "exchangeEnd": {"exchangeId": "ex-1"}}),
        ],
    );

    let late = envelope(json!({"conversationId": "conv-1", "messageStart": {
        "exchangeId": "ex-1", "messageId": "m-1", "role": "assistant"}}));
    let err = dispatcher.dispatch(&late).unwrap_err();
    assert!(is_ended(&err, NodeKind::Exchange), "{err}");
}

/// Replacing a session notifies removal before the new one is visible.
#[test]
fn test_replacement_notifies_before_insert() {
    let (dispatcher, sink) = dispatcher();
    let first = dispatcher
        .start_session(StartSessionArgs::new("conv-1"))
        .unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let observed = observed.clone();
        let lookup = dispatcher.clone();
        first.on_removed(move || {
            observed
                .lock()
                .push(lookup.get_session("conv-1").is_some());
        });
    }
    let (removed, bump) = counter();
    dispatcher.on_session_removed(move |id| {
        assert_eq!(id, "conv-1");
        bump();
    });

    let second = dispatcher
        .start_session(StartSessionArgs::new("conv-1"))
        .unwrap();

    assert_eq!(*observed.lock(), vec![false]);
    assert_eq!(count(&removed), 1);
    assert!(first.is_ended());
    assert!(!second.is_ended());
    assert_eq!(sink.sent_names(), vec!["startSession", "startSession"]);

    // The stale handle no longer reaches the new session.
    assert!(first.start_exchange(StartExchangeArgs::default()).is_err());
    assert!(second.start_exchange(StartExchangeArgs::default()).is_ok());
}

#[test]
fn test_citations_resolve_on_part_end() {
    let (dispatcher, _sink) = dispatcher();
    let completed = Arc::new(Mutex::new(None));
    {
        let completed = completed.clone();
        dispatcher.on_session_start(move |session| {
            let completed = completed.clone();
            session.on_exchange_start(move |exchange| {
                let completed = completed.clone();
                exchange.on_message_start(move |message| {
                    let completed = completed.clone();
                    message.on_content_part_start(move |part| {
                        let completed = completed.clone();
                        part.on_completed(move |done| {
                            *completed.lock() = Some(done.clone());
                        });
                    });
                });
            });
        });
    }

    let chunk = |data: &str, citation: serde_json::Value| {
        json!({"conversationId": "conv-1", "contentPartChunk": {
            "exchangeId": "ex-1", "messageId": "m-1", "contentPartId": "cp-1",
            "data": data, "citation": citation}})
    };
    dispatch_all(
        &dispatcher,
        vec![
            json!({"conversationId": "conv-1", "contentPartStart": {
                "exchangeId": "ex-1", "messageId": "m-1", "contentPartId": "cp-1",
                "mimeType": "text/markdown"}}),
            json!({"conversationId": "conv-1", "contentPartChunk": {
                "exchangeId": "ex-1", "messageId": "m-1", "contentPartId": "cp-1",
                "data": "Rust is "}}),
            chunk("memory-", json!({"kind": "start", "citationId": "c-1"})),
            chunk("safe", json!({"kind": "end", "citationId": "c-1",
                "sources": [{"title": "The Book", "url": "https://doc.rust-lang.org/book/"}]})),
            chunk(". See ", json!({"kind": "start", "citationId": "c-2"})),
            json!({"conversationId": "conv-1", "contentPartEnd": {
                "exchangeId": "ex-1", "messageId": "m-1", "contentPartId": "cp-1"}}),
        ],
    );

    let done = completed.lock().clone().expect("part completed");
    assert_eq!(done.text, "Rust is memory-safe. See ");
    assert_eq!(done.citations.len(), 1);
    let citation = &done.citations[0];
    assert_eq!(citation.citation_id, "c-1");
    assert_eq!((citation.offset, citation.length), (8, 11));
    assert_eq!(
        citation.sources,
        vec![CitationSource {
            title: "The Book".to_string(),
            url: Some("https://doc.rust-lang.org/book/".to_string()),
            ..Default::default()
        }]
    );
    assert_eq!(done.defects.len(), 1);
    assert_eq!(done.defects[0].citation_id, "c-2");
    assert_eq!(done.defects[0].kind, CitationDefectKind::NotEnded);
}

// ============================================================================
// Application errors
// ============================================================================

fn exchange_error(error_id: &str) -> serde_json::Value {
    json!({"conversationId": "conv-1", "errorStart": {
        "errorId": error_id, "message": "model overloaded", "exchangeId": "ex-1"}})
}

#[test]
fn test_error_goes_to_unhandled_when_only_tier() {
    let (dispatcher, _sink) = dispatcher();
    dispatch_all(
        &dispatcher,
        vec![json!({"conversationId": "conv-1", "exchangeStart": {"exchangeId": "ex-1"}})],
    );
    let seen: Arc<Mutex<Vec<ApplicationError>>> = Arc::default();
    {
        let seen = seen.clone();
        dispatcher.on_unhandled_error_start(move |err| seen.lock().push(err.clone()));
    }

    dispatcher.dispatch(&envelope(exchange_error("err-1"))).unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].error_id, "err-1");
    assert_eq!(seen[0].phase, ErrorPhase::Start);
    assert_eq!(seen[0].message.as_deref(), Some("model overloaded"));
}

#[test]
fn test_local_error_handler_takes_precedence() {
    let (dispatcher, _sink) = dispatcher();
    dispatch_all(
        &dispatcher,
        vec![json!({"conversationId": "conv-1", "exchangeStart": {"exchangeId": "ex-1"}})],
    );
    let exchange = dispatcher
        .get_session("conv-1")
        .and_then(|s| s.get_exchange("ex-1"))
        .unwrap();

    let (local, bump_local) = counter();
    let (any, bump_any) = counter();
    let (unhandled, bump_unhandled) = counter();
    exchange.on_error_start(move |_| bump_local());
    dispatcher.on_any_error_start(move |_| bump_any());
    dispatcher.on_unhandled_error_start(move |_| bump_unhandled());

    dispatcher.dispatch(&envelope(exchange_error("err-1"))).unwrap();
    assert_eq!((count(&local), count(&any), count(&unhandled)), (1, 0, 0));

    // An error for an exchange that does not exist skips the local tier.
    let orphan = json!({"conversationId": "conv-1", "errorStart": {
        "errorId": "err-2", "message": "lost", "exchangeId": "ex-404"}});
    dispatcher.dispatch(&envelope(orphan)).unwrap();
    assert_eq!((count(&local), count(&any), count(&unhandled)), (1, 1, 0));
}

#[test]
fn test_unclaimed_error_fails_dispatch() {
    let (dispatcher, _sink) = dispatcher();
    let err = dispatcher
        .dispatch(&envelope(json!({"conversationId": "conv-1", "errorStart": {
            "errorId": "err-1", "message": "boom"}})))
        .unwrap_err();

    match err {
        ConversationError::UnhandledApplicationError(error) => {
            assert_eq!(error.error_id, "err-1");
            assert_eq!(error.conversation_id, "conv-1");
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// A locally sent message can be read back through the session tree.
#[tokio::test]
async fn test_sent_message_is_navigable() {
    let (dispatcher, _sink) = dispatcher();
    let session = dispatcher
        .start_session(StartSessionArgs::new("conv-1"))
        .unwrap();
    let exchange = session
        .start_exchange(StartExchangeArgs::with_id("ex-1"))
        .unwrap();
    let sent = exchange
        .send_message_with_content_part(MessageWithContentPartArgs::text("hi"))
        .await
        .unwrap();

    let message = dispatcher
        .get_session("conv-1")
        .and_then(|s| s.get_exchange("ex-1"))
        .and_then(|e| e.get_message(sent.message_id()))
        .expect("message exists");
    assert!(message.is_ended());

    let parts = message.content_parts();
    assert_eq!(parts.len(), 1);
    assert!(parts[0].is_ended());
    assert_eq!(parts[0].text().as_deref(), Some("hi"));
    assert_eq!(parts[0].mime_type().as_deref(), Some(mime::TEXT_PLAIN));
}

#[tokio::test]
async fn test_message_with_content_part_flushes_once() {
    let (dispatcher, sink) = dispatcher();
    let session = dispatcher
        .start_session(StartSessionArgs::new("conv-1"))
        .unwrap();
    let exchange = session.start_exchange(StartExchangeArgs::default()).unwrap();

    let message = exchange
        .send_message_with_content_part(MessageWithContentPartArgs::text("hello"))
        .await
        .unwrap();

    assert!(message.is_ended());
    assert_eq!(message.role(), Some(Role::User));
    assert_eq!(
        sink.sent_names()[2..],
        [
            "messageStart",
            "contentPartStart",
            "contentPartChunk",
            "contentPartEnd",
            "messageEnd",
        ]
    );
    assert_eq!(sink.flush_count(), 1);
}
