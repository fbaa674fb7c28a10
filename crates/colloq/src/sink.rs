//! Outbound send primitive.

use async_trait::async_trait;
use colloq_protocol::Envelope;
use parking_lot::Mutex;

use crate::error::Result;

/// Where the dispatcher writes outbound envelopes.
///
/// `send` is fire-and-forget: it queues the envelope and returns. `flush`
/// resolves once everything queued before it has been written out.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    fn send(&self, envelope: &Envelope) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}

/// In-memory sink that records every envelope.
///
/// Useful for exercising handler code without a socket.
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: Mutex<Vec<Envelope>>,
    flushes: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Payload names of everything sent so far, in order.
    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|e| e.payload.name()).collect()
    }

    pub fn flush_count(&self) -> usize {
        *self.flushes.lock()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl EnvelopeSink for MemorySink {
    fn send(&self, envelope: &Envelope) -> Result<()> {
        self.sent.lock().push(envelope.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        *self.flushes.lock() += 1;
        Ok(())
    }
}
