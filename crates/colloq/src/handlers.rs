//! Handler lists with removal tokens.
//!
//! Every `on_*` registration returns a [`HandlerId`]. Handlers are stored as
//! `Arc`s so a list can be snapshotted under a lock and invoked after the lock
//! is released; a handler may therefore register or remove handlers, or send
//! events, without deadlocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Token returned by handler registration, used to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Work collected while the state lock is held, run after it is released.
pub(crate) type Deferred = Box<dyn FnOnce()>;

pub(crate) struct HandlerList<F: ?Sized> {
    entries: Vec<(HandlerId, Arc<F>)>,
}

impl<F: ?Sized> Default for HandlerList<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<F: ?Sized> HandlerList<F> {
    pub(crate) fn add(&mut self, handler: Arc<F>) -> HandlerId {
        let id = HandlerId::next();
        self.entries.push((id, handler));
        id
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries.iter().map(|(_, h)| h.clone()).collect()
    }
}

/// Queue one invocation of every handler in `list`.
///
/// `call` receives each handler in registration order.
pub(crate) fn defer_each<F>(
    out: &mut Vec<Deferred>,
    list: &HandlerList<F>,
    call: impl Fn(&F) + 'static,
) where
    F: ?Sized + 'static,
{
    let handlers = list.snapshot();
    if handlers.is_empty() {
        return;
    }
    out.push(Box::new(move || {
        for handler in &handlers {
            call(handler);
        }
    }));
}

pub(crate) fn run_deferred(deferred: Vec<Deferred>) {
    for job in deferred {
        job();
    }
}
