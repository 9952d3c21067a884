use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Reserved id of the single free-text candidate built from streamed deltas.
pub const STREAM_TEXT_CANDIDATE_ID: &str = "__assist_ask_anything_stream__";

/// Kind of suggestion carried by a candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    Reply,
    Task,
    /// Streaming free-text answer.
    Text,
    Translate,
    FollowUp,
}

/// One normalized assist suggestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssistCandidate {
    /// Stable id; id-less candidates are never merged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: CandidateKind,
    /// Display text.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Raw streamed text behind a sanitized `text`.
    #[serde(skip)]
    pub(crate) stream_source: Option<String>,
}

impl AssistCandidate {
    pub fn new(kind: CandidateKind, text: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            text: text.into(),
            title: None,
            description: None,
            priority: None,
            stream_source: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Trimmed id, if it is non-empty.
    pub fn merge_key(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
}

/// Merge `incoming` into `previous` by id.
///
/// A candidate whose id matches an existing entry replaces it in place,
/// keeping the previous text when its own text is empty. Candidates without
/// an id, or with an unknown id, are appended. With nothing incoming the
/// previous slice is returned borrowed.
pub fn merge_assist_candidates(
    previous: &[AssistCandidate],
    incoming: Vec<AssistCandidate>,
) -> Cow<'_, [AssistCandidate]> {
    if incoming.is_empty() {
        return Cow::Borrowed(previous);
    }

    let mut next = previous.to_vec();
    for candidate in incoming {
        let Some(id) = candidate.merge_key().map(str::to_owned) else {
            next.push(candidate);
            continue;
        };

        let Some(existing) = next
            .iter_mut()
            .find(|item| item.merge_key() == Some(id.as_str()))
        else {
            next.push(candidate);
            continue;
        };

        let text = if candidate.text.is_empty() {
            existing.text.clone()
        } else {
            candidate.text.clone()
        };
        *existing = AssistCandidate {
            id: Some(id),
            text,
            ..candidate
        };
    }

    Cow::Owned(next)
}
