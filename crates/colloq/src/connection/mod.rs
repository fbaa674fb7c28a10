//! Connection lifecycle and transports.
//!
//! [`ConnectionManager`] owns at most one live transport handle and runs the
//! status state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --connected--> Connected
//!      ^                          |  ^                      |
//!      +------disconnect()--------+  +----disconnected------+
//!      +------closed / disconnect()-------------------------+
//! ```
//!
//! A connect error leaves the status unchanged and is surfaced to status
//! observers. Transports are produced by a [`Connector`] and report back
//! through the [`TransportEvents`] they were opened with.

pub mod manager;
pub mod websocket;

use std::fmt;

use tokio::sync::oneshot;

use crate::error::ConnectionError;

pub use manager::{ConnectionManager, FrameHandler, StatusHandler, TransportEvents};
pub use websocket::{ConnectionParams, WebSocketConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// A live transport. Sends are queued; the transport writes them in order.
pub trait TransportHandle: Send + Sync {
    fn send(&self, frame: String) -> Result<(), ConnectionError>;

    /// Signal `done` once every frame queued before this call is written.
    fn flush(&self, done: oneshot::Sender<()>) -> Result<(), ConnectionError>;

    fn close(&self);
}

/// Opens transports for a [`ConnectionManager`].
///
/// `open` must return without emitting any signal on `events`; signals are
/// delivered later, from the transport's own task.
pub trait Connector: Send + Sync {
    fn open(&self, events: TransportEvents) -> std::sync::Arc<dyn TransportHandle>;
}
