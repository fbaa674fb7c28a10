//! Envelope and event payload types.
//!
//! An envelope is serialized as a flat JSON object: the conversation id plus
//! exactly one payload key, e.g.
//!
//! ```json
//! {"conversationId":"conv-1","exchangeStart":{"exchangeId":"ex-1"}}
//! ```
//!
//! Child events carry the ids of every ancestor below the session so that a
//! receiver can route them without any other context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::citations::CitationMarker;
use crate::messages::{ExternalValue, Role};

/// Arbitrary key/value bag attached to sessions and exchanges.
pub type Properties = Map<String, Value>;

// ============================================================================
// Envelope
// ============================================================================

/// One protocol frame, scoped to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawEnvelope")]
pub struct Envelope {
    /// Which conversation (session) this event belongs to.
    pub conversation_id: String,

    /// The event payload, flattened as a single key.
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Wire shape before the payload key count is checked.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    conversation_id: String,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = String;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        if raw.rest.len() != 1 {
            let keys: Vec<&str> = raw.rest.keys().map(String::as_str).collect();
            return Err(format!(
                "envelope must carry exactly one payload key, found {}: {:?}",
                keys.len(),
                keys
            ));
        }
        let payload =
            serde_json::from_value(Value::Object(raw.rest)).map_err(|e| e.to_string())?;
        Ok(Self {
            conversation_id: raw.conversation_id,
            payload,
        })
    }
}

impl Envelope {
    pub fn new(conversation_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            payload,
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// All event kinds, keyed by payload name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventPayload {
    // -- Session --
    StartSession(StartSession),
    EndSession(EndSession),
    SessionStarted(SessionStarted),

    // -- Exchange --
    ExchangeStart(ExchangeStart),
    ExchangeEnd(ExchangeEnd),

    // -- Message --
    MessageStart(MessageStart),
    MessageEnd(MessageEnd),

    // -- Content parts --
    ContentPartStart(ContentPartStart),
    ContentPartChunk(ContentPartChunk),
    ContentPartEnd(ContentPartEnd),

    // -- Tool calls --
    ToolCallStart(ToolCallStart),
    ToolCallEnd(ToolCallEnd),

    // -- Interrupts --
    InterruptStart(InterruptStart),
    InterruptEnd(InterruptEnd),

    // -- Application errors --
    ErrorStart(ErrorStart),
    ErrorEnd(ErrorEnd),

    /// Free-form metadata, not interpreted by the protocol layer.
    MetaEvent(Value),
}

impl EventPayload {
    /// Wire name of the payload key.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartSession(_) => "startSession",
            Self::EndSession(_) => "endSession",
            Self::SessionStarted(_) => "sessionStarted",
            Self::ExchangeStart(_) => "exchangeStart",
            Self::ExchangeEnd(_) => "exchangeEnd",
            Self::MessageStart(_) => "messageStart",
            Self::MessageEnd(_) => "messageEnd",
            Self::ContentPartStart(_) => "contentPartStart",
            Self::ContentPartChunk(_) => "contentPartChunk",
            Self::ContentPartEnd(_) => "contentPartEnd",
            Self::ToolCallStart(_) => "toolCallStart",
            Self::ToolCallEnd(_) => "toolCallEnd",
            Self::InterruptStart(_) => "interruptStart",
            Self::InterruptEnd(_) => "interruptEnd",
            Self::ErrorStart(_) => "errorStart",
            Self::ErrorEnd(_) => "errorEnd",
            Self::MetaEvent(_) => "metaEvent",
        }
    }
}

// -- Session -----------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndSession {}

/// Sent by the runtime once it has accepted a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
}

// -- Exchange ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeStart {
    pub exchange_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeEnd {
    pub exchange_id: String,
}

// -- Message -----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStart {
    pub exchange_id: String,
    pub message_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnd {
    pub exchange_id: String,
    pub message_id: String,
}

// -- Content parts -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPartStart {
    pub exchange_id: String,
    pub message_id: String,
    pub content_part_id: String,
    pub mime_type: String,

    /// Set when the payload is not streamed inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_value: Option<ExternalValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The part was cut short (e.g. generation stopped).
    #[serde(default)]
    pub is_incomplete: bool,

    /// The part is a transcript of audio input or output.
    #[serde(default)]
    pub is_transcript: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPartChunk {
    pub exchange_id: String,
    pub message_id: String,
    pub content_part_id: String,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<CitationMarker>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPartEnd {
    pub exchange_id: String,
    pub message_id: String,
    pub content_part_id: String,
}

// -- Tool calls --------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStart {
    pub exchange_id: String,
    pub message_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEnd {
    pub exchange_id: String,
    pub message_id: String,
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

// -- Interrupts --------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptStart {
    pub exchange_id: String,
    pub message_id: String,
    pub interrupt_id: String,
    /// Interrupt kind, e.g. `"toolCallConfirmation"`.
    pub interrupt_type: String,
    /// The value that triggered the interrupt.
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptEnd {
    pub exchange_id: String,
    pub message_id: String,
    pub interrupt_id: String,
    /// The resolving value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

// -- Application errors ------------------------------------------------------

/// An application-level error raised against a node.
///
/// The deepest id present names the node: content part, then message, then
/// exchange. With no ids the error targets the session itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStart {
    pub error_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_part_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnd {
    pub error_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_part_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let env = Envelope::new(
            "conv-1",
            EventPayload::ExchangeStart(ExchangeStart {
                exchange_id: "ex-1".to_string(),
                properties: None,
                timestamp: None,
            }),
        );

        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(
            json,
            r#"{"conversationId":"conv-1","exchangeStart":{"exchangeId":"ex-1"}}"#
        );
    }

    #[test]
    fn test_envelope_parse_chunk_with_citation() {
        let json = r#"{
            "conversationId": "conv-1",
            "contentPartChunk": {
                "exchangeId": "ex-1",
                "messageId": "m-1",
                "contentPartId": "cp-1",
                "data": "Paris",
                "citation": {"kind": "whole", "citationId": "c1", "sources": [{"title": "Atlas"}]}
            }
        }"#;

        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.conversation_id, "conv-1");
        match &env.payload {
            EventPayload::ContentPartChunk(chunk) => {
                assert_eq!(chunk.data, "Paris");
                let citation = chunk.citation.as_ref().unwrap();
                assert_eq!(citation.citation_id(), "c1");
            }
            other => panic!("wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn test_empty_payloads() {
        let env = Envelope::new("conv-2", EventPayload::EndSession(EndSession {}));
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"endSession\":{}"));

        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_error_start_addressing_fields_omitted() {
        let env = Envelope::new(
            "conv-3",
            EventPayload::ErrorStart(ErrorStart {
                error_id: "err-1".to_string(),
                message: "rate limited".to_string(),
                details: None,
                exchange_id: Some("ex-1".to_string()),
                message_id: None,
                content_part_id: None,
            }),
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"errorId\":\"err-1\""));
        assert!(json.contains("\"exchangeId\":\"ex-1\""));
        assert!(!json.contains("messageId"));
    }

    #[test]
    fn test_meta_event_roundtrip() {
        let json = r#"{"conversationId":"c","metaEvent":{"typing":true}}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.payload.name(), "metaEvent");
        assert_eq!(serde_json::to_string(&env).unwrap(), json);
    }

    #[test]
    fn test_envelope_rejects_multiple_payload_keys() {
        let json = r#"{"conversationId":"c","exchangeEnd":{"exchangeId":"ex-1"},"exchangeStart":{"exchangeId":"ex-2"}}"#;
        let err = serde_json::from_str::<Envelope>(json).unwrap_err();
        assert!(err.to_string().contains("exactly one payload key"));
    }

    #[test]
    fn test_envelope_rejects_missing_payload() {
        let err = serde_json::from_str::<Envelope>(r#"{"conversationId":"c"}"#).unwrap_err();
        assert!(err.to_string().contains("found 0"));
    }

    #[test]
    fn test_envelope_rejects_unknown_payload_key() {
        let json = r#"{"conversationId":"c","somethingElse":{}}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }
}
