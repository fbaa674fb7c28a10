//! Routes envelopes to sessions and owns the dispatcher-wide observers.
//!
//! The dispatcher, every session and every node handle share one [`Shared`]
//! core. All mutation goes through its state lock; handlers are collected
//! while the lock is held and invoked after it is released. A reentrant gate
//! serializes `dispatch` and outbound sends, so a handler may send events
//! from inside `dispatch` on the same thread.

use std::future::Future;
use std::sync::{Arc, Weak};

use colloq_protocol::{Envelope, EventPayload, Properties, StartSession};
use log::{debug, error, warn};
use parking_lot::{Mutex, ReentrantMutex};

use crate::error::{ConversationError, Result};
use crate::error_policy::{ApplicationError, ErrorHandler, ErrorPhase};
use crate::handlers::{Deferred, HandlerId, defer_each, run_deferred};
use crate::router::{self, Origin};
use crate::session::Session;
use crate::sink::EnvelopeSink;
use crate::state::{ConversationState, SessionKey};

/// Observer for every inbound envelope.
pub type EnvelopeHandler = dyn Fn(&Envelope) + Send + Sync;
/// Observer for sessions created by inbound events.
pub type SessionHandler = dyn Fn(Session) + Send + Sync;
/// Observer for removed sessions, called with the conversation id.
pub type SessionRemovedHandler = dyn Fn(&str) + Send + Sync;
/// Observer without arguments (`on_*_end`, `on_removed`, ...).
pub type SignalHandler = dyn Fn() + Send + Sync;

// ============================================================================
// Shared core
// ============================================================================

pub(crate) struct Shared {
    pub sink: Arc<dyn EnvelopeSink>,
    pub state: Mutex<ConversationState>,
    gate: ReentrantMutex<()>,
}

impl Shared {
    /// Apply an outbound event to local state, then hand it to the sink.
    ///
    /// State is updated before the sink is called; if the sink fails the
    /// local hierarchy is ahead of what was sent.
    pub(crate) fn send(self: &Arc<Self>, key: &SessionKey, payload: EventPayload) -> Result<()> {
        let _gate = self.gate.lock();
        let envelope = Envelope::new(key.conversation_id.clone(), payload);

        let applied = {
            let mut state = self.state.lock();
            router::apply(self, &mut state, key, &envelope.payload, Origin::Outbound)?
        };

        let sent = self.sink.send(&envelope);
        run_deferred(applied.deferred);
        sent
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&ConversationState) -> T) -> T {
        f(&self.state.lock())
    }

    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut ConversationState) -> T) -> T {
        f(&mut self.state.lock())
    }

    /// Remove a session and run its deletion notices.
    pub(crate) fn remove_session(&self, conversation_id: &str) -> bool {
        let mut deferred = Vec::new();
        let removed =
            self.write(|state| router::remove_session(state, conversation_id, &mut deferred));
        run_deferred(deferred);
        removed
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Arguments for [`EventDispatcher::start_session`].
#[derive(Debug, Clone, Default)]
pub struct StartSessionArgs {
    pub conversation_id: String,
    pub properties: Option<Properties>,
}

impl StartSessionArgs {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            properties: None,
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Owns the conversation id to session map and routes inbound envelopes.
#[derive(Clone)]
pub struct EventDispatcher {
    shared: Arc<Shared>,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn EnvelopeSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                state: Mutex::new(ConversationState::default()),
                gate: ReentrantMutex::new(()),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// A reference that does not keep the dispatcher alive.
    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Start a session, replacing any session with the same conversation id.
    ///
    /// The replaced session's deletion notices run before the new session
    /// becomes retrievable.
    pub fn start_session(&self, args: StartSessionArgs) -> Result<Session> {
        let _gate = self.shared.gate.lock();
        let conversation_id = args.conversation_id;

        if self.shared.remove_session(&conversation_id) {
            debug!("replacing session {conversation_id}");
        }

        let key = self
            .shared
            .write(|state| state.insert_session(&conversation_id, args.properties.clone()));
        let payload = EventPayload::StartSession(StartSession {
            properties: args.properties,
        });

        if let Err(err) = self.shared.send(&key, payload) {
            self.shared.write(|state| {
                if state.current_key(&conversation_id).as_ref() == Some(&key) {
                    state.sessions.remove(&conversation_id);
                }
            });
            return Err(err);
        }

        Ok(Session::new(self.shared.clone(), key))
    }

    /// Start a session, run `f` with it, then end the session.
    ///
    /// The end event is sent and flushed even when `f` fails; the callback's
    /// error takes precedence over a failure to end.
    pub async fn with_session<F, Fut, T, E>(&self, args: StartSessionArgs, f: F) -> Result<T, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ConversationError>,
    {
        let session = self.start_session(args)?;
        let outcome = f(session.clone()).await;

        let ended = if session.is_ended() {
            Ok(())
        } else {
            session.send_end()
        };
        let flushed = self.flush().await;

        let value = outcome?;
        ended?;
        flushed?;
        Ok(value)
    }

    /// Route one inbound envelope.
    ///
    /// Missing ancestors of a start event are created first, one level at a
    /// time, with their start observers run before the next level. Returns
    /// `UnhandledApplicationError` when the envelope carried an application
    /// error that no handler claimed; routing and every other handler have
    /// run by then.
    pub fn dispatch(&self, envelope: &Envelope) -> Result<()> {
        let _gate = self.shared.gate.lock();
        let mut deferred: Vec<Deferred> = Vec::new();

        let target = {
            let mut state = self.shared.state.lock();
            let raw = envelope.clone();
            defer_each(&mut deferred, &state.any_event, move |h| h(&raw));

            self.session_for(&mut state, envelope, &mut deferred)
                .map(|key| {
                    let parents = router::implicit_parents(&state, &key, &envelope.payload);
                    (key, parents)
                })
        };
        run_deferred(deferred);

        let Some((key, parents)) = target else {
            return Ok(());
        };
        for parent in &parents {
            self.apply_inbound(&key, parent)?;
        }
        self.apply_inbound(&key, &envelope.payload)
    }

    fn apply_inbound(&self, key: &SessionKey, payload: &EventPayload) -> Result<()> {
        let outcome = {
            let mut state = self.shared.state.lock();
            router::apply(&self.shared, &mut state, key, payload, Origin::Inbound)
        };

        let applied = match outcome {
            Ok(applied) => applied,
            Err(err) => {
                warn!(
                    "rejected {} for conversation {}: {err}",
                    payload.name(),
                    key.conversation_id
                );
                return Err(err.into());
            }
        };
        run_deferred(applied.deferred);

        match applied.unclaimed {
            Some(unclaimed) => {
                error!("{unclaimed}");
                Err(ConversationError::UnhandledApplicationError(Box::new(
                    unclaimed,
                )))
            }
            None => Ok(()),
        }
    }

    /// Find the session an inbound envelope belongs to, creating it if needed.
    fn session_for(
        &self,
        state: &mut ConversationState,
        envelope: &Envelope,
        out: &mut Vec<Deferred>,
    ) -> Option<SessionKey> {
        let conversation_id = envelope.conversation_id.as_str();
        if let Some(key) = state.current_key(conversation_id) {
            return Some(key);
        }
        if matches!(envelope.payload, EventPayload::EndSession(_)) {
            debug!("ignoring endSession for unknown conversation {conversation_id}");
            return None;
        }

        debug!("creating session {conversation_id} for inbound {}", envelope.payload.name());
        let key = state.insert_session(conversation_id, None);
        let session = Session::new(self.shared.clone(), key.clone());
        defer_each(out, &state.session_start, move |h| h(session.clone()));
        Some(key)
    }

    pub fn get_session(&self, conversation_id: &str) -> Option<Session> {
        let key = self.shared.read(|state| state.current_key(conversation_id))?;
        Some(Session::new(self.shared.clone(), key))
    }

    /// All live sessions, ordered by conversation id.
    pub fn sessions(&self) -> Vec<Session> {
        let mut keys: Vec<SessionKey> = self.shared.read(|state| {
            state
                .sessions
                .keys()
                .filter_map(|id| state.current_key(id))
                .collect()
        });
        keys.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        keys.into_iter()
            .map(|key| Session::new(self.shared.clone(), key))
            .collect()
    }

    /// Drop a session locally without sending anything.
    pub fn remove_session(&self, conversation_id: &str) -> bool {
        let _gate = self.shared.gate.lock();
        self.shared.remove_session(conversation_id)
    }

    /// Observe every inbound envelope before it is routed.
    ///
    /// For a conversation opened by the remote side these observers run
    /// before the session exists, so they also precede
    /// [`on_session_start`](Self::on_session_start).
    pub fn on_any_event(&self, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> HandlerId {
        self.shared.write(|state| state.any_event.add(Arc::new(handler)))
    }

    pub fn on_session_start(&self, handler: impl Fn(Session) + Send + Sync + 'static) -> HandlerId {
        self.shared
            .write(|state| state.session_start.add(Arc::new(handler)))
    }

    pub fn on_session_removed(
        &self,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> HandlerId {
        self.shared
            .write(|state| state.session_removed.add(Arc::new(handler)))
    }

    /// Second tier: errors whose node has no local handler.
    pub fn on_any_error_start(
        &self,
        handler: impl Fn(&ApplicationError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.add_fallback(false, ErrorPhase::Start, Arc::new(handler))
    }

    pub fn on_any_error_end(
        &self,
        handler: impl Fn(&ApplicationError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.add_fallback(false, ErrorPhase::End, Arc::new(handler))
    }

    /// Third tier: errors with neither a local nor an "any" handler.
    pub fn on_unhandled_error_start(
        &self,
        handler: impl Fn(&ApplicationError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.add_fallback(true, ErrorPhase::Start, Arc::new(handler))
    }

    pub fn on_unhandled_error_end(
        &self,
        handler: impl Fn(&ApplicationError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.add_fallback(true, ErrorPhase::End, Arc::new(handler))
    }

    fn add_fallback(
        &self,
        unhandled: bool,
        phase: ErrorPhase,
        handler: Arc<ErrorHandler>,
    ) -> HandlerId {
        self.shared.write(|state| {
            if unhandled {
                state.errors.unhandled.add(phase, handler)
            } else {
                state.errors.any.add(phase, handler)
            }
        })
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.shared.write(|state| state.remove_handler(id))
    }

    /// Wait until everything sent so far has been handed to the transport.
    pub async fn flush(&self) -> Result<()> {
        self.shared.sink.flush().await
    }
}
