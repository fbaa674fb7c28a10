//! Canonical wire types for the colloq conversation protocol.
//!
//! Every frame exchanged between a client and an agent runtime is one
//! [`Envelope`]: a conversation id plus exactly one typed event payload.
//! Many conversations are multiplexed over a single socket by that id.
//!
//! ```text
//! Client <--[WS: envelopes]--> Agent runtime
//!
//! Session
//!  └── Exchange
//!       └── Message
//!            ├── ContentPart (chunks, citations)
//!            ├── ToolCall
//!            └── Interrupt
//! ```
//!
//! This crate is I/O free. Routing, aggregation and connection handling
//! live in the `colloq` crate.

pub mod citations;
pub mod events;
pub mod messages;

pub use citations::{CitationMarker, CitationSource};
pub use events::{
    ContentPartChunk, ContentPartEnd, ContentPartStart, EndSession, Envelope, ErrorEnd, ErrorStart,
    EventPayload, ExchangeEnd, ExchangeStart, InterruptEnd, InterruptStart, MessageEnd,
    MessageStart, Properties, SessionStarted, StartSession, ToolCallEnd, ToolCallStart,
};
pub use messages::{ExternalValue, FeedbackRating, Role, mime};
