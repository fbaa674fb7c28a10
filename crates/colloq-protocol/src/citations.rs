//! Citation markers carried on content-part chunks.
//!
//! A citation range opens on a chunk carrying a `start` marker and closes on a
//! later chunk carrying an `end` marker with the same id. A `whole` marker
//! cites exactly the data of the chunk it rides on.

use serde::{Deserialize, Serialize};

/// Citation boundary attached to a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CitationMarker {
    /// The range begins at the first character of this chunk.
    #[serde(rename_all = "camelCase")]
    Start { citation_id: String },

    /// The range ends after the last character of this chunk.
    #[serde(rename_all = "camelCase")]
    End {
        citation_id: String,
        #[serde(default)]
        sources: Vec<CitationSource>,
    },

    /// The range is exactly this chunk.
    #[serde(rename_all = "camelCase")]
    Whole {
        citation_id: String,
        #[serde(default)]
        sources: Vec<CitationSource>,
    },
}

impl CitationMarker {
    pub fn citation_id(&self) -> &str {
        match self {
            Self::Start { citation_id }
            | Self::End { citation_id, .. }
            | Self::Whole { citation_id, .. } => citation_id,
        }
    }
}

/// Where a cited range came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationSource {
    pub title: String,

    /// Display number (footnote index).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
}
