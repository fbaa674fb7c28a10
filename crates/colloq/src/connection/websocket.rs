//! WebSocket transport.
//!
//! Each [`WebSocketConnector::open`] spawns one task that owns the socket for
//! the lifetime of the handle. The task reconnects with exponential backoff
//! after connect failures and dropped sockets; outbound frames queue in an
//! unbounded channel meanwhile and are written once a socket is up.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::{Connector, TransportEvents, TransportHandle};
use crate::collaborators::TokenProvider;
use crate::config::{ClientConfig, ReconnectConfig};
use crate::error::ConnectionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where to connect, and as whom.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParams {
    pub url: String,
    pub organization_id: String,
    pub tenant_id: String,
    pub external_user_id: Option<String>,
}

impl ConnectionParams {
    /// The endpoint with identity query parameters; empty values are omitted.
    pub fn request_url(&self) -> String {
        let params = [
            ("organizationId", self.organization_id.as_str()),
            ("tenantId", self.tenant_id.as_str()),
            (
                "externalUserId",
                self.external_user_id.as_deref().unwrap_or_default(),
            ),
        ];
        let query: Vec<String> = params
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect();

        if query.is_empty() {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}{}", self.url, query.join("&"))
    }
}

impl From<&ClientConfig> for ConnectionParams {
    fn from(config: &ClientConfig) -> Self {
        Self {
            url: config.url.clone(),
            organization_id: config.organization_id.clone(),
            tenant_id: config.tenant_id.clone(),
            external_user_id: config.external_user_id.clone(),
        }
    }
}

enum Outbound {
    Frame(String),
    Flush(oneshot::Sender<()>),
}

struct WebSocketHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl TransportHandle for WebSocketHandle {
    fn send(&self, frame: String) -> Result<(), ConnectionError> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ConnectionError::TransportClosed("socket task has stopped".to_string()))
    }

    fn flush(&self, done: oneshot::Sender<()>) -> Result<(), ConnectionError> {
        self.outbound
            .send(Outbound::Flush(done))
            .map_err(|_| ConnectionError::TransportClosed("socket task has stopped".to_string()))
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Opens reconnecting WebSocket transports. Must be used inside a Tokio
/// runtime.
pub struct WebSocketConnector {
    params: ConnectionParams,
    tokens: Arc<dyn TokenProvider>,
    reconnect: ReconnectConfig,
}

impl WebSocketConnector {
    pub fn new(
        params: ConnectionParams,
        tokens: Arc<dyn TokenProvider>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            params,
            tokens,
            reconnect,
        }
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, events: TransportEvents) -> Arc<dyn TransportHandle> {
        let (outbound, queue) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = SocketTask {
            params: self.params.clone(),
            tokens: self.tokens.clone(),
            reconnect: self.reconnect.clone(),
            events,
            queue,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Arc::new(WebSocketHandle { outbound, cancel })
    }
}

enum PumpEnd {
    /// Closed locally or the handle was dropped.
    Stopped,
    /// The socket failed; reconnect.
    Lost(String),
}

struct SocketTask {
    params: ConnectionParams,
    tokens: Arc<dyn TokenProvider>,
    reconnect: ReconnectConfig,
    events: TransportEvents,
    queue: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
}

impl SocketTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                opened = self.open_socket() => opened,
            };

            match opened {
                Ok(socket) => {
                    attempt = 0;
                    info!("websocket connected to {}", self.params.url);
                    self.events.connected();
                    match self.pump(socket).await {
                        PumpEnd::Stopped => return,
                        PumpEnd::Lost(reason) => {
                            warn!("websocket lost: {reason}");
                            self.events.disconnected(reason);
                        }
                    }
                }
                Err(err) => {
                    attempt += 1;
                    warn!("websocket connect attempt {attempt} failed: {err}");
                    self.events.connect_error(err);
                    if self.reconnect.exhausted(attempt) {
                        self.events
                            .closed(format!("gave up after {attempt} failed attempts"));
                        return;
                    }
                }
            }

            if !self.events.is_attached() {
                return;
            }
            let delay = self.reconnect.backoff(attempt.max(1));
            debug!("reconnecting in {delay:?}");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn open_socket(&self) -> Result<WsStream, ConnectionError> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|err| ConnectionError::Token(format!("{err:#}")))?;

        let mut request = self
            .params
            .request_url()
            .into_client_request()
            .map_err(|err| ConnectionError::ConnectFailed(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ConnectionError::Token(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _) = connect_async(request)
            .await
            .map_err(|err| ConnectionError::ConnectFailed(err.to_string()))?;
        Ok(socket)
    }

    async fn pump(&mut self, socket: WsStream) -> PumpEnd {
        let (mut write, mut read) = socket.split();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return PumpEnd::Stopped;
                }
                item = self.queue.recv() => match item {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(err) = write.send(WsMessage::Text(frame.into())).await {
                            return PumpEnd::Lost(err.to_string());
                        }
                    }
                    Some(Outbound::Flush(done)) => {
                        if let Err(err) = write.flush().await {
                            return PumpEnd::Lost(err.to_string());
                        }
                        let _ = done.send(());
                    }
                    None => {
                        debug!("transport handle dropped; closing socket");
                        let _ = write.send(WsMessage::Close(None)).await;
                        return PumpEnd::Stopped;
                    }
                },
                message = read.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => self.events.frame(text.as_str()),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return PumpEnd::Lost("closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return PumpEnd::Lost(err.to_string()),
                },
            }
        }
    }
}
