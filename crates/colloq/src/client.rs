//! A connection and a dispatcher wired together.

use std::sync::Arc;

use colloq_protocol::Envelope;
use log::warn;
use parking_lot::Mutex;

use crate::collaborators::TokenProvider;
use crate::config::ClientConfig;
use crate::connection::{
    ConnectionManager, ConnectionParams, ConnectionStatus, Connector, TransportHandle,
    WebSocketConnector,
};
use crate::dispatcher::{EventDispatcher, StartSessionArgs};
use crate::error::{ConnectionError, ConversationError, Result};
use crate::handlers::{HandlerId, HandlerList};
use crate::session::Session;

/// Observer for inbound frames that could not be routed.
pub type DispatchErrorHandler = dyn Fn(&ConversationError) + Send + Sync;

/// Client for the conversation service.
///
/// Inbound text frames are decoded into envelopes and dispatched in arrival
/// order. Frames that fail to decode are logged and skipped. Dispatch errors,
/// including unhandled application errors, go to [`on_dispatch_error`]
/// observers.
///
/// [`on_dispatch_error`]: ConversationClient::on_dispatch_error
pub struct ConversationClient {
    connection: ConnectionManager,
    dispatcher: EventDispatcher,
    dispatch_errors: Arc<Mutex<HandlerList<DispatchErrorHandler>>>,
    frame_handler: HandlerId,
}

impl ConversationClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let connection = ConnectionManager::new(connector);
        let dispatcher = EventDispatcher::new(Arc::new(connection.clone()));
        let dispatch_errors: Arc<Mutex<HandlerList<DispatchErrorHandler>>> = Arc::default();

        let weak = dispatcher.downgrade();
        let errors = dispatch_errors.clone();
        let frame_handler = connection.on_frame(move |frame| {
            let Some(dispatcher) = EventDispatcher::upgrade(&weak) else {
                return;
            };
            let result = serde_json::from_str::<Envelope>(frame)
                .map_err(ConversationError::from)
                .and_then(|envelope| dispatcher.dispatch(&envelope));

            if let Err(err) = result {
                if matches!(err, ConversationError::Encode(_)) {
                    warn!("skipping undecodable frame: {err}");
                }
                let handlers = errors.lock().snapshot();
                for handler in handlers {
                    handler(&err);
                }
            }
        });

        Self {
            connection,
            dispatcher,
            dispatch_errors,
            frame_handler,
        }
    }

    /// A client over the WebSocket transport.
    pub fn from_config(config: &ClientConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        let connector = WebSocketConnector::new(
            ConnectionParams::from(config),
            tokens,
            config.reconnect.clone(),
        );
        Self::new(Arc::new(connector))
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Wait until the connection is up.
    pub async fn connected(
        &self,
    ) -> std::result::Result<Arc<dyn TransportHandle>, ConnectionError> {
        self.connection.get_connected_socket().await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn start_session(&self, args: StartSessionArgs) -> Result<Session> {
        self.dispatcher.start_session(args)
    }

    pub fn get_session(&self, conversation_id: &str) -> Option<Session> {
        self.dispatcher.get_session(conversation_id)
    }

    pub fn on_status_change(
        &self,
        handler: impl Fn(ConnectionStatus, Option<&ConnectionError>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.connection.on_status_change(handler)
    }

    pub fn on_dispatch_error(
        &self,
        handler: impl Fn(&ConversationError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.dispatch_errors.lock().add(Arc::new(handler))
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.dispatch_errors.lock().remove(id)
            || self.connection.remove_handler(id)
            || self.dispatcher.remove_handler(id)
    }
}

impl Drop for ConversationClient {
    fn drop(&mut self) {
        self.connection.remove_handler(self.frame_handler);
    }
}
