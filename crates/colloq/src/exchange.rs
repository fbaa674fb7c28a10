//! One request/response cycle within a session.

use std::sync::Arc;

use chrono::Utc;
use colloq_protocol::{
    ContentPartChunk, ContentPartEnd, ContentPartStart, EventPayload, ExchangeEnd, FeedbackRating,
    MessageEnd, MessageStart, Properties, Role, mime,
};
use log::debug;
use serde::Serialize;

use crate::collaborators::{ConversationApi, Feedback, MessageRecord};
use crate::dispatcher::Shared;
use crate::error::{ConversationError, ProtocolStateError, Result};
use crate::error_policy::{ApplicationError, ErrorArgs, ErrorPhase, ErrorTarget};
use crate::handlers::HandlerId;
use crate::message::{CompletedMessage, Message};
use crate::state::{ExchangeHandlers, ExchangePath, generate_id};

/// Observer for messages started by the remote side.
pub type MessageHandler = dyn Fn(Message) + Send + Sync;
pub type ExchangeCompletedHandler = dyn Fn(&CompletedExchange) + Send + Sync;

/// Buffered result of an exchange, in message start order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedExchange {
    pub exchange_id: String,
    pub messages: Vec<CompletedMessage>,
}

/// Arguments for [`Exchange::start_message`].
#[derive(Debug, Clone)]
pub struct StartMessageArgs {
    /// Generated when absent.
    pub message_id: Option<String>,
    pub role: Role,
}

impl Default for StartMessageArgs {
    fn default() -> Self {
        Self {
            message_id: None,
            role: Role::User,
        }
    }
}

impl StartMessageArgs {
    pub fn new(role: Role) -> Self {
        Self {
            message_id: None,
            role,
        }
    }
}

/// Arguments for [`Exchange::send_message_with_content_part`].
#[derive(Debug, Clone)]
pub struct MessageWithContentPartArgs {
    pub data: String,
    pub role: Role,
    pub mime_type: String,
    pub message_id: Option<String>,
    pub content_part_id: Option<String>,
}

impl MessageWithContentPartArgs {
    /// A plain-text user message.
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            role: Role::User,
            mime_type: mime::TEXT_PLAIN.to_string(),
            message_id: None,
            content_part_id: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

/// Handle to an exchange.
#[derive(Clone)]
pub struct Exchange {
    shared: Arc<Shared>,
    path: ExchangePath,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("conversation_id", &self.path.session.conversation_id)
            .field("exchange_id", &self.path.exchange_id)
            .finish()
    }
}

impl Exchange {
    pub(crate) fn new(shared: Arc<Shared>, path: ExchangePath) -> Self {
        Self { shared, path }
    }

    pub fn conversation_id(&self) -> &str {
        &self.path.session.conversation_id
    }

    pub fn exchange_id(&self) -> &str {
        &self.path.exchange_id
    }

    /// True once the exchange ended or its session is gone.
    pub fn is_ended(&self) -> bool {
        self.shared
            .read(|state| state.exchange(&self.path).map(|e| e.ended).unwrap_or(true))
    }

    pub fn properties(&self) -> Properties {
        self.shared.read(|state| {
            state
                .exchange(&self.path)
                .map(|e| e.properties.clone())
                .unwrap_or_default()
        })
    }

    pub fn feedback(&self) -> Option<FeedbackRating> {
        self.shared
            .read(|state| state.exchange(&self.path).ok().and_then(|e| e.feedback))
    }

    /// Aggregate what has been received so far.
    pub fn completed(&self) -> Option<CompletedExchange> {
        self.shared.read(|state| {
            state
                .exchange(&self.path)
                .ok()
                .map(|e| e.aggregate(&self.path.exchange_id))
        })
    }

    pub fn start_message(&self, args: StartMessageArgs) -> Result<Message> {
        let message_id = args.message_id.unwrap_or_else(generate_id);
        self.send(EventPayload::MessageStart(MessageStart {
            exchange_id: self.path.exchange_id.clone(),
            message_id: message_id.clone(),
            role: args.role,
            timestamp: Some(Utc::now()),
        }))?;
        Ok(Message::new(self.shared.clone(), self.path.message(&message_id)))
    }

    /// Send a complete single-part message and wait for it to be flushed.
    ///
    /// Emits message start, content part start, one chunk, content part end
    /// and message end in that order.
    pub async fn send_message_with_content_part(
        &self,
        args: MessageWithContentPartArgs,
    ) -> Result<Message> {
        let message_id = args.message_id.unwrap_or_else(generate_id);
        let content_part_id = args.content_part_id.unwrap_or_else(generate_id);
        let exchange_id = self.path.exchange_id.clone();

        self.send(EventPayload::MessageStart(MessageStart {
            exchange_id: exchange_id.clone(),
            message_id: message_id.clone(),
            role: args.role,
            timestamp: Some(Utc::now()),
        }))?;
        self.send(EventPayload::ContentPartStart(ContentPartStart {
            exchange_id: exchange_id.clone(),
            message_id: message_id.clone(),
            content_part_id: content_part_id.clone(),
            mime_type: args.mime_type,
            external_value: None,
            name: None,
            is_incomplete: false,
            is_transcript: false,
        }))?;
        self.send(EventPayload::ContentPartChunk(ContentPartChunk {
            exchange_id: exchange_id.clone(),
            message_id: message_id.clone(),
            content_part_id: content_part_id.clone(),
            data: args.data,
            citation: None,
        }))?;
        self.send(EventPayload::ContentPartEnd(ContentPartEnd {
            exchange_id: exchange_id.clone(),
            message_id: message_id.clone(),
            content_part_id,
        }))?;
        self.send(EventPayload::MessageEnd(MessageEnd {
            exchange_id,
            message_id: message_id.clone(),
        }))?;

        self.shared.sink.flush().await?;
        Ok(Message::new(self.shared.clone(), self.path.message(&message_id)))
    }

    pub fn get_message(&self, message_id: &str) -> Option<Message> {
        let path = self.path.message(message_id);
        self.shared
            .read(|state| state.message(&path).is_ok())
            .then(|| Message::new(self.shared.clone(), path))
    }

    /// Messages in start order.
    pub fn messages(&self) -> Vec<Message> {
        let ids = self.shared.read(|state| {
            state
                .exchange(&self.path)
                .map(|e| e.message_order.clone())
                .unwrap_or_default()
        });
        ids.iter()
            .map(|id| Message::new(self.shared.clone(), self.path.message(id)))
            .collect()
    }

    pub fn send_end(&self) -> Result<()> {
        self.send(EventPayload::ExchangeEnd(ExchangeEnd {
            exchange_id: self.path.exchange_id.clone(),
        }))
    }

    /// Rate the exchange. Allowed once, after the exchange has ended.
    ///
    /// The rating is reserved before the request and released again if the
    /// request fails.
    pub async fn send_feedback(&self, api: &dyn ConversationApi, feedback: Feedback) -> Result<()> {
        let exchange_id = self.path.exchange_id.clone();
        self.shared.write(|state| -> Result<()> {
            let exchange = state.exchange_mut(&self.path)?;
            if !exchange.ended {
                return Err(ProtocolStateError::FeedbackBeforeEnd(exchange_id.clone()).into());
            }
            if exchange.feedback.is_some() {
                return Err(ProtocolStateError::FeedbackAlreadySent(exchange_id.clone()).into());
            }
            exchange.feedback = Some(feedback.rating);
            Ok(())
        })?;

        let submitted = api
            .submit_feedback(self.conversation_id(), &exchange_id, &feedback)
            .await;
        if let Err(err) = submitted {
            self.shared.write(|state| {
                if let Ok(exchange) = state.exchange_mut(&self.path) {
                    exchange.feedback = None;
                }
            });
            return Err(ConversationError::Collaborator(err));
        }
        Ok(())
    }

    /// Load the stored messages of this exchange.
    pub async fn history(&self, api: &dyn ConversationApi) -> Result<Vec<MessageRecord>> {
        api.list_messages(self.conversation_id(), &self.path.exchange_id)
            .await
            .map_err(ConversationError::Collaborator)
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
        ErrorTarget::Exchange {
            exchange_id: self.path.exchange_id.clone(),
        }
    }

    fn send(&self, payload: EventPayload) -> Result<()> {
        self.shared.send(&self.path.session, payload)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn register(&self, add: impl FnOnce(&mut ExchangeHandlers) -> HandlerId) -> HandlerId {
        self.shared.write(|state| match state.exchange_mut(&self.path) {
            Ok(exchange) => add(&mut exchange.handlers),
            Err(err) => {
                debug!("handler not registered: {err}");
                HandlerId::next()
            }
        })
    }

    pub fn on_message_start(&self, handler: impl Fn(Message) + Send + Sync + 'static) -> HandlerId {
        self.register(|h| h.message_start.add(Arc::new(handler)))
    }

    pub fn on_exchange_end(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        self.register(|h| h.exchange_end.add(Arc::new(handler)))
    }

    /// Called with the aggregated exchange when the remote side ends it.
    pub fn on_completed(
        &self,
        handler: impl Fn(&CompletedExchange) + Send + Sync + 'static,
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
                .exchange_mut(&self.path)
                .map(|e| e.handlers.remove(id))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{EventDispatcher, StartSessionArgs};
    use crate::error::NodeKind;
    use crate::session::StartExchangeArgs;
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use colloq_protocol::Envelope;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeApi {
        fail: bool,
        submitted: Mutex<Vec<(String, Feedback)>>,
    }

    #[async_trait]
    impl ConversationApi for FakeApi {
        async fn list_exchanges(
            &self,
            _: &str,
        ) -> anyhow::Result<Vec<crate::collaborators::ExchangeRecord>> {
            Ok(vec![])
        }

        async fn list_messages(&self, _: &str, _: &str) -> anyhow::Result<Vec<MessageRecord>> {
            Ok(vec![])
        }

        async fn submit_feedback(
            &self,
            _: &str,
            exchange_id: &str,
            feedback: &Feedback,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("service unavailable");
            }
            self.submitted
                .lock()
                .push((exchange_id.to_string(), feedback.clone()));
            Ok(())
        }

        async fn fetch_content(&self, _: &str) -> anyhow::Result<Vec<u8>> {
            Ok(vec![])
        }
    }

    fn exchange() -> (EventDispatcher, Exchange, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let dispatcher = EventDispatcher::new(sink.clone());
        let session = dispatcher.start_session(StartSessionArgs::new("conv-1")).unwrap();
        let exchange = session
            .start_exchange(StartExchangeArgs::with_id("ex-1"))
            .unwrap();
        (dispatcher, exchange, sink)
    }

    #[tokio::test]
    async fn test_send_message_with_content_part_order() {
        let (_, exchange, sink) = exchange();
        sink.clear();

        let message = exchange
            .send_message_with_content_part(MessageWithContentPartArgs::text("hi"))
            .await
            .unwrap();

        assert_eq!(
            sink.sent_names(),
            vec![
                "messageStart",
                "contentPartStart",
                "contentPartChunk",
                "contentPartEnd",
                "messageEnd"
            ]
        );
        assert_eq!(sink.flush_count(), 1);
        assert_eq!(message.role(), Some(Role::User));
        assert!(message.is_ended());
    }

    #[tokio::test]
    async fn test_feedback_requires_end() {
        let (_, exchange, _) = exchange();
        let api = FakeApi::default();

        let err = exchange
            .send_feedback(&api, Feedback::new(FeedbackRating::Positive))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConversationError::ProtocolState(ProtocolStateError::FeedbackBeforeEnd(_))
        ));
    }

    #[tokio::test]
    async fn test_feedback_at_most_once() {
        let (_, exchange, _) = exchange();
        let api = FakeApi::default();
        exchange.send_end().unwrap();

        exchange
            .send_feedback(&api, Feedback::new(FeedbackRating::Negative).with_comment("slow"))
            .await
            .unwrap();
        let err = exchange
            .send_feedback(&api, Feedback::new(FeedbackRating::Positive))
            .await
            .unwrap_err();

        assert!(err.is_protocol_state());
        assert_eq!(exchange.feedback(), Some(FeedbackRating::Negative));
        assert_eq!(api.submitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_feedback_can_be_retried() {
        let (_, exchange, _) = exchange();
        exchange.send_end().unwrap();
        let failing = FakeApi {
            fail: true,
            ..Default::default()
        };

        let err = exchange
            .send_feedback(&failing, Feedback::new(FeedbackRating::Positive))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::Collaborator(_)));
        assert_eq!(exchange.feedback(), None);

        let api = FakeApi::default();
        exchange
            .send_feedback(&api, Feedback::new(FeedbackRating::Positive))
            .await
            .unwrap();
        assert_eq!(exchange.feedback(), Some(FeedbackRating::Positive));
    }

    #[test]
    fn test_on_completed_fires_for_inbound_end() {
        let (dispatcher, exchange, _) = exchange();
        let completed = Arc::new(Mutex::new(None));
        let slot = completed.clone();
        exchange.on_completed(move |c| *slot.lock() = Some(c.clone()));

        dispatcher
            .dispatch(&Envelope::new(
                "conv-1",
                EventPayload::MessageStart(MessageStart {
                    exchange_id: "ex-1".to_string(),
                    message_id: "m1".to_string(),
                    role: Role::Assistant,
                    timestamp: None,
                }),
            ))
            .unwrap();
        dispatcher
            .dispatch(&Envelope::new(
                "conv-1",
                EventPayload::ExchangeEnd(ExchangeEnd {
                    exchange_id: "ex-1".to_string(),
                }),
            ))
            .unwrap();

        let completed = completed.lock().clone().unwrap();
        assert_eq!(completed.exchange_id, "ex-1");
        assert_eq!(completed.messages.len(), 1);
        assert_eq!(completed.messages[0].role, Role::Assistant);
    }

    #[test]
    fn test_ended_exchange_rejects_messages() {
        let (_, exchange, _) = exchange();
        exchange.send_end().unwrap();

        let err = exchange.start_message(StartMessageArgs::default()).unwrap_err();
        assert!(matches!(
            err,
            ConversationError::ProtocolState(ProtocolStateError::Ended {
                kind: NodeKind::Exchange,
                ..
            })
        ));
    }

    #[test]
    fn test_second_end_is_rejected() {
        let (_, exchange, sink) = exchange();
        exchange.send_end().unwrap();

        let err = exchange.send_end().unwrap_err();
        assert!(err.is_protocol_state());
        assert_eq!(
            sink.sent_names().iter().filter(|n| **n == "exchangeEnd").count(),
            1
        );
    }
}
