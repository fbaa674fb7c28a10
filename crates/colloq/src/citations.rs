//! Citation range tracking for streamed content parts.
//!
//! While a part streams, each chunk that carries a citation marker records a
//! [`CitationBoundary`]: the marker plus the character span the chunk's data
//! occupies in the part's text. When the part ends, the boundaries are
//! resolved into [`Citation`] ranges. Unbalanced markers become
//! [`CitationDefect`]s; they are data for the caller, never errors.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use colloq_protocol::{CitationMarker, CitationSource};
use log::debug;
use serde::Serialize;

/// A resolved citation range within a content part's text.
///
/// `offset` and `length` count Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub citation_id: String,
    pub offset: usize,
    pub length: usize,
    pub sources: Vec<CitationSource>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CitationDefectKind {
    /// An end marker arrived with no open range for its id.
    NotStarted,
    /// The part ended while the range was still open.
    NotEnded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationDefect {
    pub citation_id: String,
    pub kind: CitationDefectKind,
}

/// A marker seen on one chunk, with the span of that chunk's data.
#[derive(Debug, Clone)]
pub(crate) struct CitationBoundary {
    pub marker: CitationMarker,
    /// Offset of the chunk's first character.
    pub start: usize,
    /// Offset just past the chunk's last character.
    pub end: usize,
    pub at: DateTime<Utc>,
}

/// Resolve recorded boundaries into citations and defects.
///
/// Citations are ordered by offset; defects by the order they were detected,
/// with ranges left open reported in the order they were opened.
pub(crate) fn resolve(boundaries: &[CitationBoundary]) -> (Vec<Citation>, Vec<CitationDefect>) {
    let mut citations = Vec::new();
    let mut defects = Vec::new();
    let mut open: HashMap<&str, (usize, DateTime<Utc>)> = HashMap::new();
    let mut open_order: Vec<&str> = Vec::new();

    for boundary in boundaries {
        match &boundary.marker {
            CitationMarker::Start { citation_id } => {
                if open
                    .insert(citation_id.as_str(), (boundary.start, boundary.at))
                    .is_some()
                {
                    debug!("citation {citation_id} restarted before it ended");
                } else {
                    open_order.push(citation_id.as_str());
                }
            }
            CitationMarker::End {
                citation_id,
                sources,
            } => match open.remove(citation_id.as_str()) {
                Some((start, created_at)) => {
                    open_order.retain(|id| *id != citation_id.as_str());
                    citations.push(Citation {
                        citation_id: citation_id.clone(),
                        offset: start,
                        length: boundary.end.saturating_sub(start),
                        sources: sources.clone(),
                        created_at,
                        updated_at: boundary.at,
                    });
                }
                None => defects.push(CitationDefect {
                    citation_id: citation_id.clone(),
                    kind: CitationDefectKind::NotStarted,
                }),
            },
            CitationMarker::Whole {
                citation_id,
                sources,
            } => citations.push(Citation {
                citation_id: citation_id.clone(),
                offset: boundary.start,
                length: boundary.end - boundary.start,
                sources: sources.clone(),
                created_at: boundary.at,
                updated_at: boundary.at,
            }),
        }
    }

    for citation_id in open_order {
        defects.push(CitationDefect {
            citation_id: citation_id.to_string(),
            kind: CitationDefectKind::NotEnded,
        });
    }

    citations.sort_by_key(|c| c.offset);
    (citations, defects)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(title: &str) -> CitationSource {
        CitationSource {
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn boundary(marker: CitationMarker, start: usize, end: usize) -> CitationBoundary {
        CitationBoundary {
            marker,
            start,
            end,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_start_end_pair() {
        // "The capital " [start c1] "is Paris" ... [end c1] "."
        let boundaries = vec![
            boundary(
                CitationMarker::Start {
                    citation_id: "c1".to_string(),
                },
                12,
                20,
            ),
            boundary(
                CitationMarker::End {
                    citation_id: "c1".to_string(),
                    sources: vec![source("Atlas")],
                },
                20,
                21,
            ),
        ];

        let (citations, defects) = resolve(&boundaries);
        assert!(defects.is_empty());
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].citation_id, "c1");
        assert_eq!(citations[0].offset, 12);
        assert_eq!(citations[0].length, 9);
        assert_eq!(citations[0].sources, vec![source("Atlas")]);
    }

    #[test]
    fn test_whole_chunk() {
        let boundaries = vec![boundary(
            CitationMarker::Whole {
                citation_id: "w".to_string(),
                sources: vec![source("Doc")],
            },
            3,
            7,
        )];
        let (citations, defects) = resolve(&boundaries);
        assert!(defects.is_empty());
        assert_eq!((citations[0].offset, citations[0].length), (3, 4));
    }

    #[test]
    fn test_defects() {
        let boundaries = vec![
            boundary(
                CitationMarker::Start {
                    citation_id: "open".to_string(),
                },
                0,
                4,
            ),
            boundary(
                CitationMarker::End {
                    citation_id: "orphan".to_string(),
                    sources: vec![],
                },
                4,
                8,
            ),
        ];

        let (citations, defects) = resolve(&boundaries);
        assert!(citations.is_empty());
        assert_eq!(
            defects,
            vec![
                CitationDefect {
                    citation_id: "orphan".to_string(),
                    kind: CitationDefectKind::NotStarted,
                },
                CitationDefect {
                    citation_id: "open".to_string(),
                    kind: CitationDefectKind::NotEnded,
                },
            ]
        );
    }

    #[test]
    fn test_citations_sorted_by_offset() {
        let boundaries = vec![
            boundary(
                CitationMarker::Start {
                    citation_id: "outer".to_string(),
                },
                0,
                2,
            ),
            boundary(
                CitationMarker::Whole {
                    citation_id: "inner".to_string(),
                    sources: vec![],
                },
                2,
                5,
            ),
            boundary(
                CitationMarker::End {
                    citation_id: "outer".to_string(),
                    sources: vec![],
                },
                5,
                6,
            ),
        ];
        let (citations, _) = resolve(&boundaries);
        let ids: Vec<_> = citations.iter().map(|c| c.citation_id.as_str()).collect();
        assert_eq!(ids, vec!["outer", "inner"]);
    }
}
