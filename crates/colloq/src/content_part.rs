//! One streamed content fragment.
//!
//! Chunks are buffered in arrival order. A chunk may carry a citation marker;
//! the marker applies to that chunk's text. On end the buffer is concatenated
//! and the markers are resolved into [`Citation`] ranges over the text.

use std::sync::Arc;

use colloq_protocol::{
    CitationMarker, CitationSource, ContentPartChunk, ContentPartEnd, EventPayload, ExternalValue,
};
use log::debug;
use serde::Serialize;

use crate::citations::{Citation, CitationDefect};
use crate::collaborators::ConversationApi;
use crate::dispatcher::Shared;
use crate::error::{ConversationError, ProtocolStateError, Result};
use crate::error_policy::{ApplicationError, ErrorArgs, ErrorPhase, ErrorTarget};
use crate::handlers::HandlerId;
use crate::state::{ContentPartHandlers, ContentPartPath};

pub type ChunkHandler = dyn Fn(&ContentPartChunk) + Send + Sync;
pub type ContentPartCompletedHandler = dyn Fn(&CompletedContentPart) + Send + Sync;

/// Buffered result of a content part.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedContentPart {
    pub content_part_id: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_value: Option<ExternalValue>,
    pub is_incomplete: bool,
    pub is_transcript: bool,
    pub text: String,
    pub citations: Vec<Citation>,
    /// Citation markers that did not pair up.
    pub defects: Vec<CitationDefect>,
}

/// Arguments for [`Message::start_content_part`](crate::Message::start_content_part).
#[derive(Debug, Clone)]
pub struct StartContentPartArgs {
    /// Generated when absent.
    pub content_part_id: Option<String>,
    pub mime_type: String,
    pub name: Option<String>,
    pub external_value: Option<ExternalValue>,
    pub is_incomplete: bool,
    pub is_transcript: bool,
}

impl StartContentPartArgs {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            content_part_id: None,
            mime_type: mime_type.into(),
            name: None,
            external_value: None,
            is_incomplete: false,
            is_transcript: false,
        }
    }

    pub fn with_id(mut self, content_part_id: impl Into<String>) -> Self {
        self.content_part_id = Some(content_part_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_external_value(mut self, external_value: ExternalValue) -> Self {
        self.external_value = Some(external_value);
        self
    }

    pub fn transcript(mut self) -> Self {
        self.is_transcript = true;
        self
    }
}

/// Handle to a content part.
#[derive(Clone)]
pub struct ContentPart {
    shared: Arc<Shared>,
    path: ContentPartPath,
}

impl std::fmt::Debug for ContentPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentPart")
            .field("message_id", &self.path.message.message_id)
            .field("content_part_id", &self.path.content_part_id)
            .finish()
    }
}

impl ContentPart {
    pub(crate) fn new(shared: Arc<Shared>, path: ContentPartPath) -> Self {
        Self { shared, path }
    }

    pub fn content_part_id(&self) -> &str {
        &self.path.content_part_id
    }

    pub fn mime_type(&self) -> Option<String> {
        self.shared
            .read(|state| state.content_part(&self.path).ok().map(|p| p.mime_type.clone()))
    }

    pub fn external_value(&self) -> Option<ExternalValue> {
        self.shared.read(|state| {
            state
                .content_part(&self.path)
                .ok()
                .and_then(|p| p.external_value.clone())
        })
    }

    pub fn is_ended(&self) -> bool {
        self.shared
            .read(|state| state.content_part(&self.path).map(|p| p.ended).unwrap_or(true))
    }

    /// Text buffered so far.
    pub fn text(&self) -> Option<String> {
        self.shared
            .read(|state| state.content_part(&self.path).ok().map(|p| p.text()))
    }

    /// The aggregated part; present once the part has ended.
    pub fn completed(&self) -> Option<CompletedContentPart> {
        self.shared.read(|state| {
            state
                .content_part(&self.path)
                .ok()
                .and_then(|p| p.completed.clone())
        })
    }

    /// Download the payload of a part whose content lives elsewhere.
    pub async fn fetch_external_data(&self, api: &dyn ConversationApi) -> Result<Vec<u8>> {
        let external = self.shared.read(|state| -> Result<ExternalValue> {
            state
                .content_part(&self.path)?
                .external_value
                .clone()
                .ok_or_else(|| {
                    ProtocolStateError::NotExternal(self.path.content_part_id.clone()).into()
                })
        })?;

        api.fetch_content(&external.uri)
            .await
            .map_err(ConversationError::Collaborator)
    }

    pub fn send_chunk(&self, data: impl Into<String>) -> Result<()> {
        self.send_chunk_with(data.into(), None)
    }

    /// Send a chunk that opens citation `citation_id`.
    pub fn send_chunk_with_citation_start(
        &self,
        data: impl Into<String>,
        citation_id: impl Into<String>,
    ) -> Result<()> {
        let marker = CitationMarker::Start {
            citation_id: citation_id.into(),
        };
        self.send_chunk_with(data.into(), Some(marker))
    }

    /// Send a chunk that closes citation `citation_id`.
    pub fn send_chunk_with_citation_end(
        &self,
        data: impl Into<String>,
        citation_id: impl Into<String>,
        sources: Vec<CitationSource>,
    ) -> Result<()> {
        let marker = CitationMarker::End {
            citation_id: citation_id.into(),
            sources,
        };
        self.send_chunk_with(data.into(), Some(marker))
    }

    /// Send a chunk that is cited as a whole.
    pub fn send_chunk_with_citation(
        &self,
        data: impl Into<String>,
        citation_id: impl Into<String>,
        sources: Vec<CitationSource>,
    ) -> Result<()> {
        let marker = CitationMarker::Whole {
            citation_id: citation_id.into(),
            sources,
        };
        self.send_chunk_with(data.into(), Some(marker))
    }

    fn send_chunk_with(&self, data: String, citation: Option<CitationMarker>) -> Result<()> {
        self.send(EventPayload::ContentPartChunk(ContentPartChunk {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message.message_id.clone(),
            content_part_id: self.path.content_part_id.clone(),
            data,
            citation,
        }))
    }

    pub fn send_end(&self) -> Result<()> {
        self.send(EventPayload::ContentPartEnd(ContentPartEnd {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message.message_id.clone(),
            content_part_id: self.path.content_part_id.clone(),
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

    fn exchange_id(&self) -> &str {
        &self.path.message.exchange.exchange_id
    }

    fn target(&self) -> ErrorTarget {
        ErrorTarget::ContentPart {
            exchange_id: self.exchange_id().to_string(),
            message_id: self.path.message.message_id.clone(),
            content_part_id: self.path.content_part_id.clone(),
        }
    }

    fn send(&self, payload: EventPayload) -> Result<()> {
        self.shared
            .send(&self.path.message.exchange.session, payload)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn register(&self, add: impl FnOnce(&mut ContentPartHandlers) -> HandlerId) -> HandlerId {
        self.shared
            .write(|state| match state.content_part_mut(&self.path) {
                Ok(part) => add(&mut part.handlers),
                Err(err) => {
                    debug!("handler not registered: {err}");
                    HandlerId::next()
                }
            })
    }

    pub fn on_chunk(
        &self,
        handler: impl Fn(&ContentPartChunk) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.chunk.add(Arc::new(handler)))
    }

    pub fn on_content_part_end(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        self.register(|h| h.content_part_end.add(Arc::new(handler)))
    }

    /// Called with the aggregated part when the remote side ends it.
    pub fn on_completed(
        &self,
        handler: impl Fn(&CompletedContentPart) + Send + Sync + 'static,
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
                .content_part_mut(&self.path)
                .map(|p| p.handlers.remove(id))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citations::CitationDefectKind;
    use crate::dispatcher::{EventDispatcher, StartSessionArgs};
    use crate::error::NodeKind;
    use crate::exchange::StartMessageArgs;
    use crate::session::StartExchangeArgs;
    use crate::sink::MemorySink;
    use colloq_protocol::{Envelope, mime};
    use parking_lot::Mutex;

    fn part(args: StartContentPartArgs) -> (EventDispatcher, ContentPart, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let dispatcher = EventDispatcher::new(sink.clone());
        let part = dispatcher
            .start_session(StartSessionArgs::new("conv-1"))
            .and_then(|s| s.start_exchange(StartExchangeArgs::with_id("ex-1")))
            .and_then(|e| {
                e.start_message(StartMessageArgs {
                    message_id: Some("m1".to_string()),
                    role: colloq_protocol::Role::Assistant,
                })
            })
            .and_then(|m| m.start_content_part(args.with_id("cp-1")))
            .unwrap();
        (dispatcher, part, sink)
    }

    fn source(title: &str) -> CitationSource {
        CitationSource {
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_citation_round_trip() {
        let (_, part, _) = part(StartContentPartArgs::new(mime::TEXT_MARKDOWN));
        part.send_chunk("Rust is ").unwrap();
        part.send_chunk_with_citation_start("memory", "c1").unwrap();
        part.send_chunk("-safe").unwrap();
        part.send_chunk_with_citation_end("", "c1", vec![source("The Book")])
            .unwrap();
        part.send_end().unwrap();

        let completed = part.completed().unwrap();
        assert_eq!(completed.text, "Rust is memory-safe");
        assert_eq!(completed.citations.len(), 1);
        assert_eq!(completed.citations[0].citation_id, "c1");
        assert_eq!(completed.citations[0].offset, 8);
        assert_eq!(completed.citations[0].length, 11);
        assert_eq!(completed.citations[0].sources, vec![source("The Book")]);
        assert!(completed.defects.is_empty());
    }

    #[test]
    fn test_open_citation_becomes_defect() {
        let (_, part, _) = part(StartContentPartArgs::new(mime::TEXT_PLAIN));
        part.send_chunk_with_citation_start("cited", "c1").unwrap();
        part.send_end().unwrap();

        let completed = part.completed().unwrap();
        assert!(completed.citations.is_empty());
        assert_eq!(completed.defects.len(), 1);
        assert_eq!(completed.defects[0].citation_id, "c1");
        assert_eq!(completed.defects[0].kind, CitationDefectKind::NotEnded);
    }

    #[test]
    fn test_chunk_after_end_is_rejected() {
        let (_, part, sink) = part(StartContentPartArgs::new(mime::TEXT_PLAIN));
        part.send_end().unwrap();
        let sent = sink.sent().len();

        let err = part.send_chunk("late").unwrap_err();
        assert!(matches!(
            err,
            ConversationError::ProtocolState(ProtocolStateError::Ended {
                kind: NodeKind::ContentPart,
                ..
            })
        ));
        assert!(part.send_chunk_with_citation("late", "c", vec![]).is_err());
        assert_eq!(sink.sent().len(), sent);
    }

    #[test]
    fn test_chunk_handler_sees_inbound_chunks() {
        let (dispatcher, part, _) = part(StartContentPartArgs::new(mime::TEXT_PLAIN));
        let seen = Arc::new(Mutex::new(String::new()));
        let buffer = seen.clone();
        part.on_chunk(move |chunk| buffer.lock().push_str(&chunk.data));

        for data in ["he", "llo"] {
            dispatcher
                .dispatch(&Envelope::new(
                    "conv-1",
                    EventPayload::ContentPartChunk(ContentPartChunk {
                        exchange_id: "ex-1".to_string(),
                        message_id: "m1".to_string(),
                        content_part_id: "cp-1".to_string(),
                        data: data.to_string(),
                        citation: None,
                    }),
                ))
                .unwrap();
        }

        assert_eq!(*seen.lock(), "hello");
        assert_eq!(part.text().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_fetch_requires_external_value() {
        struct NoApi;

        #[async_trait::async_trait]
        impl ConversationApi for NoApi {
            async fn list_exchanges(
                &self,
                _: &str,
            ) -> anyhow::Result<Vec<crate::collaborators::ExchangeRecord>> {
                Ok(vec![])
            }
            async fn list_messages(
                &self,
                _: &str,
                _: &str,
            ) -> anyhow::Result<Vec<crate::collaborators::MessageRecord>> {
                Ok(vec![])
            }
            async fn submit_feedback(
                &self,
                _: &str,
                _: &str,
                _: &crate::collaborators::Feedback,
            ) -> anyhow::Result<()> {
                Ok(())
            }
            async fn fetch_content(&self, uri: &str) -> anyhow::Result<Vec<u8>> {
                Ok(uri.as_bytes().to_vec())
            }
        }

        let (_, inline, _) = part(StartContentPartArgs::new(mime::TEXT_PLAIN));
        let err = inline.fetch_external_data(&NoApi).await.unwrap_err();
        assert!(matches!(
            err,
            ConversationError::ProtocolState(ProtocolStateError::NotExternal(_))
        ));

        let external = ExternalValue {
            uri: "blob://doc".to_string(),
            byte_count: None,
        };
        let (_, linked, _) =
            part(StartContentPartArgs::new("application/pdf").with_external_value(external));
        assert_eq!(linked.fetch_external_data(&NoApi).await.unwrap(), b"blob://doc");
    }

    #[test]
    fn test_ended_part_rejects_sends() {
        let (_, part, _) = part(StartContentPartArgs::new(mime::TEXT_PLAIN));
        part.send_chunk("done").unwrap();
        part.send_end().unwrap();

        let err = part.send_end().unwrap_err();
        assert!(err.is_protocol_state());
        let err = part.send_chunk("late").unwrap_err();
        assert!(err.is_protocol_state());
        assert_eq!(part.text().as_deref(), Some("done"));
    }

    #[test]
    fn test_part_without_chunks() {
        let (_, part, sink) = part(StartContentPartArgs::new(mime::TEXT_PLAIN));
        part.send_end().unwrap();

        let names = sink.sent_names();
        assert_eq!(names[names.len() - 2..], ["contentPartStart", "contentPartEnd"]);
        let completed = part.completed().unwrap();
        assert_eq!(completed.text, "");
        assert!(completed.citations.is_empty());
    }
}
