//! Connection lifecycle state machine.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use colloq_protocol::Envelope;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{ConnectionStatus, Connector, TransportHandle};
use crate::error::{ConnectionError, Result};
use crate::handlers::{HandlerId, HandlerList};
use crate::sink::EnvelopeSink;

/// Observer for status changes. The error is set for connect errors and
/// dropped connections.
pub type StatusHandler = dyn Fn(ConnectionStatus, Option<&ConnectionError>) + Send + Sync;
/// Observer for inbound text frames.
pub type FrameHandler = dyn Fn(&str) + Send + Sync;

type Waiter = oneshot::Sender<std::result::Result<Arc<dyn TransportHandle>, ConnectionError>>;

struct ActiveHandle {
    id: u64,
    handle: Option<Arc<dyn TransportHandle>>,
    deprecated: bool,
}

struct ManagerState {
    status: ConnectionStatus,
    last_error: Option<ConnectionError>,
    active: Option<ActiveHandle>,
    next_handle_id: u64,
    waiters: Vec<Waiter>,
    status_handlers: HandlerList<StatusHandler>,
    frame_handlers: HandlerList<FrameHandler>,
}

impl ManagerState {
    fn is_current(&self, handle_id: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == handle_id)
    }

    fn live_handle(&self) -> Option<Arc<dyn TransportHandle>> {
        self.active.as_ref().and_then(|a| a.handle.clone())
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    state: Mutex<ManagerState>,
}

/// Owns one logical connection.
///
/// Cloning yields another reference to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                state: Mutex::new(ManagerState {
                    status: ConnectionStatus::Disconnected,
                    last_error: None,
                    active: None,
                    next_handle_id: 0,
                    waiters: Vec::new(),
                    status_handlers: HandlerList::default(),
                    frame_handlers: HandlerList::default(),
                }),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    pub fn last_error(&self) -> Option<ConnectionError> {
        self.inner.state.lock().last_error.clone()
    }

    /// Start connecting. No-op unless disconnected.
    pub fn connect(&self) {
        let handle_id = {
            let mut state = self.inner.state.lock();
            if state.status != ConnectionStatus::Disconnected {
                return;
            }
            state.next_handle_id += 1;
            let id = state.next_handle_id;
            state.status = ConnectionStatus::Connecting;
            state.active = Some(ActiveHandle {
                id,
                handle: None,
                deprecated: false,
            });
            id
        };
        info!("connecting (transport {handle_id})");
        self.inner.notify(ConnectionStatus::Connecting, None);

        let events = TransportEvents {
            handle_id,
            inner: Arc::downgrade(&self.inner),
        };
        let handle = self.inner.connector.open(events);

        let mut state = self.inner.state.lock();
        if !state.is_current(handle_id) {
            drop(state);
            debug!("transport {handle_id} superseded while opening; closing it");
            handle.close();
            return;
        }
        if let Some(active) = state.active.as_mut() {
            active.handle = Some(handle.clone());
        }
        // A connected signal may have raced ahead of the handle.
        let ready = (state.status == ConnectionStatus::Connected)
            .then(|| std::mem::take(&mut state.waiters));
        drop(state);

        if let Some(waiters) = ready {
            resolve(waiters, &handle);
        }
    }

    /// Drop the connection and reject everyone waiting for it.
    ///
    /// The handle is closed unless it was deprecated.
    pub fn disconnect(&self) {
        let (active, waiters) = {
            let mut state = self.inner.state.lock();
            if state.status == ConnectionStatus::Disconnected {
                return;
            }
            state.status = ConnectionStatus::Disconnected;
            (state.active.take(), std::mem::take(&mut state.waiters))
        };
        info!("disconnected");

        if let Some(ActiveHandle {
            handle: Some(handle),
            deprecated: false,
            ..
        }) = active
        {
            handle.close();
        }
        for waiter in waiters {
            let _ = waiter.send(Err(ConnectionError::ClosedWhileWaiting));
        }
        self.inner.notify(ConnectionStatus::Disconnected, None);
    }

    /// Mark the current handle so that a later disconnect discards it without
    /// closing it.
    pub fn deprecate(&self) {
        if let Some(active) = self.inner.state.lock().active.as_mut() {
            debug!("deprecating transport {}", active.id);
            active.deprecated = true;
        }
    }

    /// Resolve with the live handle, connecting first if needed.
    ///
    /// Fails with [`ConnectionError::ClosedWhileWaiting`] if the connection
    /// is dropped before it comes up.
    pub async fn get_connected_socket(
        &self,
    ) -> std::result::Result<Arc<dyn TransportHandle>, ConnectionError> {
        let receiver = {
            let mut state = self.inner.state.lock();
            if state.status == ConnectionStatus::Connected
                && let Some(handle) = state.live_handle()
            {
                return Ok(handle);
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.retain(|waiter| !waiter.is_closed());
            state.waiters.push(sender);
            receiver
        };
        self.connect();

        receiver
            .await
            .unwrap_or(Err(ConnectionError::ClosedWhileWaiting))
    }

    pub fn on_status_change(
        &self,
        handler: impl Fn(ConnectionStatus, Option<&ConnectionError>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner
            .state
            .lock()
            .status_handlers
            .add(Arc::new(handler))
    }

    pub fn on_frame(&self, handler: impl Fn(&str) + Send + Sync + 'static) -> HandlerId {
        self.inner.state.lock().frame_handlers.add(Arc::new(handler))
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut state = self.inner.state.lock();
        state.status_handlers.remove(id) || state.frame_handlers.remove(id)
    }
}

fn resolve(waiters: Vec<Waiter>, handle: &Arc<dyn TransportHandle>) {
    for waiter in waiters {
        let _ = waiter.send(Ok(handle.clone()));
    }
}

impl Inner {
    fn notify(&self, status: ConnectionStatus, error: Option<&ConnectionError>) {
        let handlers = self.state.lock().status_handlers.snapshot();
        for handler in handlers {
            handler(status, error);
        }
    }

    fn on_connected(&self, handle_id: u64) {
        let ready = {
            let mut state = self.state.lock();
            if !state.is_current(handle_id) {
                debug!("ignoring connected signal from stale transport {handle_id}");
                return;
            }
            state.status = ConnectionStatus::Connected;
            state.last_error = None;
            state
                .live_handle()
                .map(|handle| (handle, std::mem::take(&mut state.waiters)))
        };
        info!("connected (transport {handle_id})");

        if let Some((handle, waiters)) = ready {
            resolve(waiters, &handle);
        }
        self.notify(ConnectionStatus::Connected, None);
    }

    fn on_connect_error(&self, handle_id: u64, error: ConnectionError) {
        let status = {
            let mut state = self.state.lock();
            if !state.is_current(handle_id) {
                debug!("ignoring connect error from stale transport {handle_id}: {error}");
                return;
            }
            state.last_error = Some(error.clone());
            state.status
        };
        warn!("connect attempt failed: {error}");
        self.notify(status, Some(&error));
    }

    /// The transport lost its socket and is retrying.
    fn on_disconnected(&self, handle_id: u64, reason: String) {
        let error = ConnectionError::Dropped(reason);
        {
            let mut state = self.state.lock();
            if !state.is_current(handle_id) {
                debug!("ignoring disconnect from stale transport {handle_id}");
                return;
            }
            state.status = ConnectionStatus::Connecting;
            state.last_error = Some(error.clone());
        }
        warn!("{error}; reconnecting");
        self.notify(ConnectionStatus::Connecting, Some(&error));
    }

    /// The transport gave up. The handle is discarded without closing it.
    fn on_closed(&self, handle_id: u64, reason: String) {
        let error = ConnectionError::TransportClosed(reason);
        let waiters = {
            let mut state = self.state.lock();
            if !state.is_current(handle_id) {
                debug!("ignoring close from stale transport {handle_id}");
                return;
            }
            state.status = ConnectionStatus::Disconnected;
            state.active = None;
            state.last_error = Some(error.clone());
            std::mem::take(&mut state.waiters)
        };
        warn!("{error}");

        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        self.notify(ConnectionStatus::Disconnected, Some(&error));
    }

    fn on_frame(&self, handle_id: u64, frame: &str) {
        let handlers = {
            let state = self.state.lock();
            if !state.is_current(handle_id) {
                debug!("dropping frame from stale transport {handle_id}");
                return;
            }
            state.frame_handlers.snapshot()
        };
        for handler in handlers {
            handler(frame);
        }
    }
}

/// Signal channel from one transport back to its manager.
///
/// Every signal is tagged with the transport it came from; signals from a
/// transport that is no longer the manager's current one are ignored.
#[derive(Clone)]
pub struct TransportEvents {
    handle_id: u64,
    inner: Weak<Inner>,
}

impl TransportEvents {
    pub fn connected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_connected(self.handle_id);
        }
    }

    pub fn connect_error(&self, error: ConnectionError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_connect_error(self.handle_id, error);
        }
    }

    pub fn disconnected(&self, reason: impl Into<String>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_disconnected(self.handle_id, reason.into());
        }
    }

    pub fn closed(&self, reason: impl Into<String>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_closed(self.handle_id, reason.into());
        }
    }

    pub fn frame(&self, frame: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_frame(self.handle_id, frame);
        }
    }

    /// False once the manager is gone.
    pub fn is_attached(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

#[async_trait]
impl EnvelopeSink for ConnectionManager {
    /// Queue an envelope on the transport, connecting first if disconnected.
    fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = serde_json::to_string(envelope)?;
        if self.status() == ConnectionStatus::Disconnected {
            self.connect();
        }

        let handle = self
            .inner
            .state
            .lock()
            .live_handle()
            .ok_or(ConnectionError::NotConnected)?;
        handle.send(frame)?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let Some(handle) = self.inner.state.lock().live_handle() else {
            return Ok(());
        };
        let (done, flushed) = oneshot::channel();
        handle.flush(done)?;
        flushed
            .await
            .map_err(|_| {
                ConnectionError::Dropped("transport stopped before flushing".to_string())
            })?;
        Ok(())
    }
}
