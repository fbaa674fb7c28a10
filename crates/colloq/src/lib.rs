//! Client for the colloq real-time conversation protocol.
//!
//! One connection multiplexes many conversations. Inbound envelopes are
//! routed by [`EventDispatcher`] into a hierarchy of sessions, exchanges,
//! messages and content parts; outbound sends go through the same hierarchy,
//! so local state always reflects what was sent.
//!
//! ```text
//! ConversationClient
//!  ├── ConnectionManager   (status machine, transport handle, waiters)
//!  │    └── Connector       (WebSocketConnector: reconnect + backoff)
//!  └── EventDispatcher     (conversation id -> Session)
//!       └── Session -> Exchange -> Message -> ContentPart / ToolCall / Interrupt
//! ```
//!
//! Application errors raised by the remote side are delivered to exactly one
//! handler tier (node, "any", "unhandled"); see [`error_policy`].

pub mod citations;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod content_part;
pub mod dispatcher;
pub mod error;
pub mod error_policy;
pub mod exchange;
pub mod handlers;
pub mod message;
pub mod session;
pub mod sink;

mod router;
mod state;

pub use citations::{Citation, CitationDefect, CitationDefectKind};
pub use client::ConversationClient;
pub use collaborators::{
    ContentPartRecord, ConversationApi, ExchangeRecord, Feedback, MessageRecord,
    StaticTokenProvider, TokenProvider,
};
pub use config::{ClientConfig, ReconnectConfig};
pub use connection::{
    ConnectionManager, ConnectionParams, ConnectionStatus, Connector, TransportEvents,
    TransportHandle, WebSocketConnector,
};
pub use content_part::{CompletedContentPart, ContentPart, StartContentPartArgs};
pub use dispatcher::{EventDispatcher, StartSessionArgs};
pub use error::{ConnectionError, ConversationError, NodeKind, ProtocolStateError, Result};
pub use error_policy::{ApplicationError, ErrorArgs, ErrorPhase, ErrorTarget};
pub use exchange::{CompletedExchange, Exchange, MessageWithContentPartArgs, StartMessageArgs};
pub use handlers::HandlerId;
pub use message::{
    CompletedMessage, Interrupt, Message, StartInterruptArgs, StartToolCallArgs, ToolCall,
    ToolCallResult,
};
pub use session::{Session, StartExchangeArgs};
pub use sink::{EnvelopeSink, MemorySink};

pub use colloq_protocol as protocol;
