//! Boundaries to services the core does not implement.
//!
//! The core performs no HTTP calls. Credentials come from a [`TokenProvider`];
//! history, feedback and external content go through a [`ConversationApi`]
//! supplied by the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colloq_protocol::{CitationSource, ExternalValue, FeedbackRating, Properties, Role};
use serde::{Deserialize, Serialize};

/// Produces a valid bearer credential for the connection.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> anyhow::Result<String>;
}

/// A fixed token, e.g. from configuration.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.token.clone())
    }
}

/// REST side of the conversation service.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Exchanges of a conversation, oldest first.
    async fn list_exchanges(&self, conversation_id: &str) -> anyhow::Result<Vec<ExchangeRecord>>;

    async fn list_messages(
        &self,
        conversation_id: &str,
        exchange_id: &str,
    ) -> anyhow::Result<Vec<MessageRecord>>;

    async fn submit_feedback(
        &self,
        conversation_id: &str,
        exchange_id: &str,
        feedback: &Feedback,
    ) -> anyhow::Result<()>;

    /// Download the payload behind a content part's external value.
    async fn fetch_content(&self, uri: &str) -> anyhow::Result<Vec<u8>>;
}

/// Feedback on a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub rating: FeedbackRating,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Feedback {
    pub fn new(rating: FeedbackRating) -> Self {
        Self {
            rating,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

// ============================================================================
// History records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRecord {
    pub exchange_id: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_rating: Option<FeedbackRating>,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_parts: Vec<ContentPartRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPartRecord {
    pub content_part_id: String,
    pub mime_type: String,
    /// Inline text; absent when the content is external.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_value: Option<ExternalValue>,
    #[serde(default)]
    pub citations: Vec<CitationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationRecord {
    pub citation_id: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default)]
    pub sources: Vec<CitationSource>,
}
