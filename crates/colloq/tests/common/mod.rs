//! Test utilities shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use colloq::protocol::Envelope;
use colloq::{
    ConnectionError, Connector, EventDispatcher, MemorySink, TransportEvents, TransportHandle,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

/// Dispatcher over an in-memory sink.
pub fn dispatcher() -> (EventDispatcher, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    (EventDispatcher::new(sink.clone()), sink)
}

/// Decode a wire frame written as JSON.
pub fn envelope(frame: Value) -> Envelope {
    serde_json::from_value(frame).expect("valid envelope")
}

/// Dispatch a sequence of wire frames, failing on the first rejection.
pub fn dispatch_all(dispatcher: &EventDispatcher, frames: Vec<Value>) {
    for frame in frames {
        let envelope = envelope(frame);
        dispatcher
            .dispatch(&envelope)
            .unwrap_or_else(|err| panic!("{} rejected: {err}", envelope.payload.name()));
    }
}

/// A shared counter plus a closure that bumps it.
pub fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + Clone + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let bump = {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    };
    (count, bump)
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

// ============================================================================
// Scripted transport
// ============================================================================

/// Transport handle that records frames instead of writing them.
#[derive(Default)]
pub struct FakeHandle {
    pub frames: Mutex<Vec<String>>,
    pub flushes: AtomicUsize,
    pub closed: AtomicUsize,
}

impl FakeHandle {
    pub fn sent(&self) -> Vec<Value> {
        self.frames
            .lock()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("frame is JSON"))
            .collect()
    }
}

impl TransportHandle for FakeHandle {
    fn send(&self, frame: String) -> Result<(), ConnectionError> {
        self.frames.lock().push(frame);
        Ok(())
    }

    fn flush(&self, done: oneshot::Sender<()>) -> Result<(), ConnectionError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let _ = done.send(());
        Ok(())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector whose transports are driven by the test.
#[derive(Default)]
pub struct FakeConnector {
    pub opened: Mutex<Vec<(TransportEvents, Arc<FakeHandle>)>>,
}

impl FakeConnector {
    pub fn attempts(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn events(&self, index: usize) -> TransportEvents {
        self.opened.lock()[index].0.clone()
    }

    pub fn handle(&self, index: usize) -> Arc<FakeHandle> {
        self.opened.lock()[index].1.clone()
    }

    pub async fn wait_for_attempt(&self, index: usize) {
        while self.attempts() <= index {
            tokio::task::yield_now().await;
        }
    }
}

impl Connector for FakeConnector {
    fn open(&self, events: TransportEvents) -> Arc<dyn TransportHandle> {
        let handle = Arc::new(FakeHandle::default());
        self.opened.lock().push((events, handle.clone()));
        handle
    }
}
