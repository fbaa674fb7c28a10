//! One conversation's runtime.

use std::sync::Arc;

use chrono::Utc;
use colloq_protocol::{EndSession, EventPayload, ExchangeStart, Properties};
use log::debug;
use serde_json::Value;

use crate::collaborators::{ConversationApi, ExchangeRecord};
use crate::dispatcher::Shared;
use crate::error::{ConversationError, Result};
use crate::error_policy::{ApplicationError, ErrorArgs, ErrorPhase, ErrorTarget};
use crate::exchange::Exchange;
use crate::handlers::HandlerId;
use crate::state::{SessionHandlers, SessionKey, generate_id};

/// Observer for exchanges started by the remote side.
pub type ExchangeHandler = dyn Fn(Exchange) + Send + Sync;
pub type MetaEventHandler = dyn Fn(&Value) + Send + Sync;

/// Arguments for [`Session::start_exchange`].
#[derive(Debug, Clone, Default)]
pub struct StartExchangeArgs {
    /// Generated when absent.
    pub exchange_id: Option<String>,
    pub properties: Option<Properties>,
}

impl StartExchangeArgs {
    pub fn with_id(exchange_id: impl Into<String>) -> Self {
        Self {
            exchange_id: Some(exchange_id.into()),
            properties: None,
        }
    }
}

/// Handle to a session.
///
/// Handles are cheap to clone. A handle keeps referring to the session it was
/// created for: once that session ends or is replaced, reads return nothing
/// and sends fail with a protocol state error.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    key: SessionKey,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conversation_id", &self.key.conversation_id)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(shared: Arc<Shared>, key: SessionKey) -> Self {
        Self { shared, key }
    }

    pub fn conversation_id(&self) -> &str {
        &self.key.conversation_id
    }

    /// Whether the runtime acknowledged the session.
    pub fn is_started(&self) -> bool {
        self.shared
            .read(|state| state.session(&self.key).map(|s| s.started).unwrap_or(false))
    }

    /// True once the session ended, was removed or was replaced.
    pub fn is_ended(&self) -> bool {
        self.shared
            .read(|state| state.session(&self.key).map(|s| s.ended).unwrap_or(true))
    }

    pub fn properties(&self) -> Properties {
        self.shared.read(|state| {
            state
                .session(&self.key)
                .map(|s| s.properties.clone())
                .unwrap_or_default()
        })
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.shared.read(|state| {
            state
                .session(&self.key)
                .ok()
                .and_then(|s| s.properties.get(name).cloned())
        })
    }

    /// Set a local property. Last write wins.
    pub fn set_property(&self, name: impl Into<String>, value: Value) -> Result<()> {
        self.shared.write(|state| -> Result<()> {
            let session = state.session_mut(&self.key)?;
            session.properties.insert(name.into(), value);
            Ok(())
        })
    }

    pub fn start_exchange(&self, args: StartExchangeArgs) -> Result<Exchange> {
        let exchange_id = args.exchange_id.unwrap_or_else(generate_id);
        self.shared.send(
            &self.key,
            EventPayload::ExchangeStart(ExchangeStart {
                exchange_id: exchange_id.clone(),
                properties: args.properties,
                timestamp: Some(Utc::now()),
            }),
        )?;
        Ok(Exchange::new(self.shared.clone(), self.key.exchange(&exchange_id)))
    }

    pub fn get_exchange(&self, exchange_id: &str) -> Option<Exchange> {
        let path = self.key.exchange(exchange_id);
        self.shared
            .read(|state| state.exchange(&path).is_ok())
            .then(|| Exchange::new(self.shared.clone(), path))
    }

    /// Exchanges in start order.
    pub fn exchanges(&self) -> Vec<Exchange> {
        let ids = self.shared.read(|state| {
            state
                .session(&self.key)
                .map(|s| s.exchange_order.clone())
                .unwrap_or_default()
        });
        ids.iter()
            .map(|id| Exchange::new(self.shared.clone(), self.key.exchange(id)))
            .collect()
    }

    pub fn send_meta_event(&self, value: Value) -> Result<()> {
        self.shared.send(&self.key, EventPayload::MetaEvent(value))
    }

    /// Raise an error against the session; returns the error id.
    pub fn send_error_start(&self, args: ErrorArgs) -> Result<String> {
        let (error_id, payload) = args.into_payload(&ErrorTarget::Session);
        self.shared.send(&self.key, payload)?;
        Ok(error_id)
    }

    pub fn send_error_end(&self, error_id: &str) -> Result<()> {
        self.shared
            .send(&self.key, ErrorTarget::Session.end_payload(error_id))
    }

    /// End the session. It is removed from the dispatcher once sent.
    pub fn send_end(&self) -> Result<()> {
        self.shared
            .send(&self.key, EventPayload::EndSession(EndSession {}))
    }

    pub async fn flush(&self) -> Result<()> {
        self.shared.sink.flush().await
    }

    /// Load the conversation's stored exchanges.
    pub async fn history(&self, api: &dyn ConversationApi) -> Result<Vec<ExchangeRecord>> {
        api.list_exchanges(self.conversation_id())
            .await
            .map_err(ConversationError::Collaborator)
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    fn register(&self, add: impl FnOnce(&mut SessionHandlers) -> HandlerId) -> HandlerId {
        self.shared.write(|state| match state.session_mut(&self.key) {
            Ok(session) => add(&mut session.handlers),
            Err(_) => {
                debug!(
                    "session {} is gone; handler not registered",
                    self.key.conversation_id
                );
                HandlerId::next()
            }
        })
    }

    pub fn on_exchange_start(
        &self,
        handler: impl Fn(Exchange) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(|h| h.exchange_start.add(Arc::new(handler)))
    }

    /// The runtime acknowledged the session (`sessionStarted`).
    pub fn on_session_started(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        self.register(|h| h.session_started.add(Arc::new(handler)))
    }

    pub fn on_session_end(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        self.register(|h| h.session_end.add(Arc::new(handler)))
    }

    /// The session was removed from the dispatcher: ended, replaced or
    /// removed explicitly.
    pub fn on_removed(&self, handler: impl Fn() + Send + Sync + 'static) -> HandlerId {
        self.register(|h| h.removed.add(Arc::new(handler)))
    }

    pub fn on_meta_event(&self, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        self.register(|h| h.meta_event.add(Arc::new(handler)))
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
                .session_mut(&self.key)
                .map(|s| s.handlers.remove(id))
                .unwrap_or(false)
        })
    }
}
