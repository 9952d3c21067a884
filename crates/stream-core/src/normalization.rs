//! Defensive normalization of loosely-typed event payloads.

use serde_json::{Map, Value};

use crate::{
    candidates::{AssistCandidate, CandidateKind},
    events::StreamEventName,
};

/// Decoded `data` field of one event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Missing, blank or the `[DONE]` sentinel.
    Empty,
    Json(Value),
    /// Data that is not JSON (or a JSON string), trimmed.
    Text(String),
}

impl EventPayload {
    /// Decode raw event data. Malformed JSON is kept as text, never an error.
    pub fn parse(data: Option<&str>) -> Self {
        let Some(text) = data.map(str::trim) else {
            return Self::Empty;
        };
        if text.is_empty() || text == "[DONE]" {
            return Self::Empty;
        }

        match serde_json::from_str::<Value>(text) {
            Ok(Value::String(inner)) => Self::Text(inner),
            Ok(value) => Self::Json(value),
            Err(_) => Self::Text(text.to_owned()),
        }
    }

    fn object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Json(Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

/// Recognized payload shape, in detection priority order.
///
/// A payload can satisfy several shapes at once; detection stops at the
/// first match: full replacement, then single upsert, then text delta.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadShape {
    /// Complete candidate set; previous candidates are discarded.
    FullReplacement(Vec<AssistCandidate>),
    /// One candidate to merge by id.
    SingleUpsert(AssistCandidate),
    /// Text to append onto the streaming text candidate.
    TextDelta(String),
    NoMatch,
}

/// Classify `payload` for `event`. `previous_len` seeds synthesized ids of
/// singular candidates.
pub fn detect_payload_shape(
    event: &StreamEventName,
    payload: &EventPayload,
    previous_len: usize,
) -> PayloadShape {
    let empty = Map::new();
    let envelope = payload.object().unwrap_or(&empty);
    let nested = envelope.get("assist_candidates").and_then(Value::as_object);

    let replies = candidate_list(envelope, nested, &["reply_candidates"]);
    let tasks = candidate_list(envelope, nested, &["task_candidates"]);
    let translations = candidate_list(envelope, nested, &["translate_candidates"]);
    let follow_ups = candidate_list(
        envelope,
        nested,
        &["follow_up_candidates", "followup_candidates"],
    );

    if replies.is_some() || tasks.is_some() || translations.is_some() || follow_ups.is_some() {
        let mut candidates = Vec::new();
        candidates.extend(normalize_list(replies, normalize_reply_candidate));
        candidates.extend(normalize_list(tasks, normalize_task_candidate));
        candidates.extend(normalize_list(translations, normalize_translate_candidate));
        candidates.extend(normalize_list(follow_ups, normalize_follow_up_candidate));
        return PayloadShape::FullReplacement(candidates);
    }

    let singles: [(&[&str], Normalizer); 4] = [
        (&["reply_candidate"], normalize_reply_candidate),
        (&["task_candidate"], normalize_task_candidate),
        (&["translate_candidate"], normalize_translate_candidate),
        (
            &["follow_up_candidate", "followup_candidate"],
            normalize_follow_up_candidate,
        ),
    ];
    for (keys, normalize) in singles {
        let value = keys.iter().find_map(|key| non_null(envelope.get(*key)));
        if let Some(candidate) = value.and_then(|value| normalize(value, previous_len)) {
            return PayloadShape::SingleUpsert(candidate);
        }
    }

    let has_delta_text = envelope
        .get("delta")
        .and_then(Value::as_object)
        .and_then(|delta| delta.get("text"))
        .is_some_and(Value::is_string);
    let is_text_stream = !event.is_non_text()
        && (event.looks_like_delta() || *event == StreamEventName::Message || has_delta_text);
    if is_text_stream {
        let text = extract_text_delta(event, payload);
        if !text.is_empty() {
            return PayloadShape::TextDelta(text);
        }
    }

    PayloadShape::NoMatch
}

/// Pull delta text out of a payload; empty when there is none.
pub fn extract_text_delta(event: &StreamEventName, payload: &EventPayload) -> String {
    match payload {
        EventPayload::Empty => String::new(),
        EventPayload::Text(text) => {
            if event.accepts_loose_text() {
                text.clone()
            } else {
                String::new()
            }
        }
        EventPayload::Json(_) => {
            let Some(envelope) = payload.object() else {
                return String::new();
            };
            let delta = envelope.get("delta");
            let nested = delta
                .and_then(Value::as_object)
                .and_then(|delta| raw_text(delta.get("text")));
            if let Some(text) = nested.or_else(|| raw_text(delta)) {
                return text.to_owned();
            }
            if event.accepts_loose_text() {
                for key in ["text", "message", "output_text"] {
                    if let Some(text) = raw_text(envelope.get(key)) {
                        return text.to_owned();
                    }
                }
            }
            String::new()
        }
    }
}

/// Human-readable message of an `error`-named event.
pub fn event_error_message(payload: &EventPayload, fallback: &str) -> String {
    match payload {
        EventPayload::Json(_) => {
            let message = payload.object().and_then(|row| {
                trimmed(row.get("message")).or_else(|| {
                    row.get("error")
                        .and_then(Value::as_object)
                        .and_then(|error| trimmed(error.get("message")))
                })
            });
            message.unwrap_or(fallback).to_owned()
        }
        EventPayload::Text(text) if !text.trim().is_empty() => text.trim().to_owned(),
        _ => fallback.to_owned(),
    }
}

type Normalizer = fn(&Value, usize) -> Option<AssistCandidate>;

/// First array found under `keys`, looking inside the `assist_candidates`
/// envelope before the top level.
fn candidate_list<'a>(
    envelope: &'a Map<String, Value>,
    nested: Option<&'a Map<String, Value>>,
    keys: &[&str],
) -> Option<&'a Vec<Value>> {
    keys.iter()
        .find_map(|key| {
            nested
                .and_then(|node| non_null(node.get(*key)))
                .or_else(|| non_null(envelope.get(*key)))
        })
        .and_then(Value::as_array)
}

fn normalize_list(raw: Option<&Vec<Value>>, normalize: Normalizer) -> Vec<AssistCandidate> {
    raw.map(|items| {
        items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| normalize(item, index))
            .collect()
    })
    .unwrap_or_default()
}

pub fn normalize_reply_candidate(raw: &Value, index: usize) -> Option<AssistCandidate> {
    let row = raw.as_object()?;
    let text = trimmed(row.get("text"))?;
    Some(AssistCandidate::new(CandidateKind::Reply, text).with_id(id_or(row, "reply", index)))
}

pub fn normalize_task_candidate(raw: &Value, index: usize) -> Option<AssistCandidate> {
    let row = raw.as_object()?;
    let title = trimmed(row.get("title"));
    let description = trimmed(row.get("description"));
    let text = join_present(&[title, description], "\n")?;

    Some(AssistCandidate {
        title: title.map(str::to_owned),
        description: description.map(str::to_owned),
        priority: trimmed(row.get("priority")).map(str::to_owned),
        ..AssistCandidate::new(CandidateKind::Task, text).with_id(id_or(row, "task", index))
    })
}

pub fn normalize_translate_candidate(raw: &Value, index: usize) -> Option<AssistCandidate> {
    if let Some(text) = trimmed(Some(raw)) {
        return Some(
            AssistCandidate::new(CandidateKind::Translate, text)
                .with_id(format!("translate_{index}")),
        );
    }
    let row = raw.as_object()?;
    let text = ["text", "translation", "translated_text"]
        .iter()
        .find_map(|key| trimmed(row.get(*key)))?;
    Some(
        AssistCandidate::new(CandidateKind::Translate, text)
            .with_id(id_or(row, "translate", index)),
    )
}

pub fn normalize_follow_up_candidate(raw: &Value, index: usize) -> Option<AssistCandidate> {
    if let Some(text) = trimmed(Some(raw)) {
        return Some(
            AssistCandidate::new(CandidateKind::FollowUp, text)
                .with_id(format!("follow_up_{index}")),
        );
    }
    let row = raw.as_object()?;
    let title = trimmed(row.get("title"));
    let body = ["content", "text", "description"]
        .iter()
        .find_map(|key| trimmed(row.get(*key)));
    let owner = trimmed(row.get("owner")).or_else(|| trimmed(row.get("assignee")));
    let status = trimmed(row.get("status"));
    let text = join_present(&[title, body], "\n")?;

    Some(AssistCandidate {
        title: title.map(str::to_owned),
        description: join_present(&[owner, status], " · "),
        priority: trimmed(row.get("priority")).map(str::to_owned),
        ..AssistCandidate::new(CandidateKind::FollowUp, text)
            .with_id(id_or(row, "follow_up", index))
    })
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|value| !value.is_null())
}

fn trimmed(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn raw_text(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|text| !text.is_empty())
}

fn id_or(row: &Map<String, Value>, prefix: &str, index: usize) -> String {
    trimmed(row.get("id"))
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{prefix}_{index}"))
}

fn join_present(parts: &[Option<&str>], separator: &str) -> Option<String> {
    let present: Vec<&str> = parts.iter().flatten().copied().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.join(separator))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn json_payload(value: Value) -> EventPayload {
        EventPayload::Json(value)
    }

    #[test]
    fn parses_sentinels_json_and_raw_text() {
        assert_eq!(EventPayload::parse(None), EventPayload::Empty);
        assert_eq!(EventPayload::parse(Some("  [DONE] ")), EventPayload::Empty);
        assert_eq!(
            EventPayload::parse(Some("{\"a\":1}")),
            EventPayload::Json(json!({ "a": 1 }))
        );
        assert_eq!(
            EventPayload::parse(Some("\"quoted\"")),
            EventPayload::Text("quoted".into())
        );
        assert_eq!(
            EventPayload::parse(Some(" {not json ")),
            EventPayload::Text("{not json".into())
        );
    }

    #[test]
    fn reply_requires_text_and_synthesizes_id() {
        assert_eq!(normalize_reply_candidate(&json!({ "text": "  " }), 0), None);
        let candidate = normalize_reply_candidate(&json!({ "text": " Sure! " }), 3)
            .expect("reply with text must normalize");
        assert_eq!(candidate.id.as_deref(), Some("reply_3"));
        assert_eq!(candidate.text, "Sure!");
    }

    #[test]
    fn task_combines_title_and_description() {
        let task = normalize_task_candidate(
            &json!({ "id": "t1", "title": "Task 1", "description": "Do it", "priority": "high" }),
            0,
        )
        .expect("task must normalize");
        assert_eq!(task.text, "Task 1\nDo it");
        assert_eq!(task.priority.as_deref(), Some("high"));

        let untitled = normalize_task_candidate(&json!({ "description": "only body" }), 2)
            .expect("description alone is enough");
        assert_eq!(untitled.text, "only body");
        assert_eq!(untitled.id.as_deref(), Some("task_2"));
        assert_eq!(untitled.title, None);

        assert_eq!(normalize_task_candidate(&json!({ "priority": "low" }), 0), None);
    }

    #[test]
    fn translate_and_follow_up_accept_plain_strings() {
        let translation = normalize_translate_candidate(&json!("Bonjour"), 1).expect("string");
        assert_eq!(translation.id.as_deref(), Some("translate_1"));

        let follow_up = normalize_follow_up_candidate(
            &json!({ "title": "Sync", "content": "Check in", "assignee": "Bob", "status": "open" }),
            0,
        )
        .expect("follow-up must normalize");
        assert_eq!(follow_up.text, "Sync\nCheck in");
        assert_eq!(follow_up.description.as_deref(), Some("Bob · open"));
        assert_eq!(follow_up.id.as_deref(), Some("follow_up_0"));
    }

    #[test]
    fn full_replacement_wins_over_other_shapes() {
        let payload = json_payload(json!({
            "assist_candidates": { "reply_candidates": [{ "id": "r1", "text": "Reply 1" }] },
            "reply_candidate": { "id": "r9", "text": "ignored" },
            "delta": { "text": "ignored" },
        }));
        match detect_payload_shape(&StreamEventName::MessageDelta, &payload, 0) {
            PayloadShape::FullReplacement(candidates) => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].id.as_deref(), Some("r1"));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn empty_arrays_still_replace() {
        let payload = json_payload(json!({ "reply_candidates": [] }));
        assert_eq!(
            detect_payload_shape(&StreamEventName::AssistCandidates, &payload, 4),
            PayloadShape::FullReplacement(Vec::new())
        );
    }

    #[test]
    fn single_upsert_uses_previous_length_for_synthesized_id() {
        let payload = json_payload(json!({ "task_candidate": { "title": "Call Ann" } }));
        match detect_payload_shape(&StreamEventName::AssistCandidates, &payload, 2) {
            PayloadShape::SingleUpsert(candidate) => {
                assert_eq!(candidate.id.as_deref(), Some("task_2"));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn delta_text_requires_text_event() {
        let payload = json_payload(json!({ "delta": { "text": "debug payload" } }));
        assert_eq!(
            detect_payload_shape(&StreamEventName::parse("tool_execution_result"), &payload, 0),
            PayloadShape::NoMatch
        );
        assert_eq!(
            detect_payload_shape(&StreamEventName::Trace, &payload, 0),
            PayloadShape::NoMatch
        );
        assert_eq!(
            detect_payload_shape(&StreamEventName::parse("custom_event"), &payload, 0),
            PayloadShape::TextDelta("debug payload".into())
        );
    }

    #[test]
    fn loose_text_fields_only_for_delta_like_names() {
        let payload = json_payload(json!({ "output_text": "hi" }));
        assert_eq!(
            extract_text_delta(&StreamEventName::OutputTextDelta, &payload),
            "hi"
        );
        assert_eq!(extract_text_delta(&StreamEventName::AssistCandidates, &payload), "");

        let raw = EventPayload::Text("plain".into());
        assert_eq!(extract_text_delta(&StreamEventName::Message, &raw), "plain");
        assert_eq!(extract_text_delta(&StreamEventName::MessageEnd, &raw), "");

        let string_delta = json_payload(json!({ "delta": "chunk" }));
        assert_eq!(
            extract_text_delta(&StreamEventName::MessageDelta, &string_delta),
            "chunk"
        );
    }

    #[test]
    fn delta_text_keeps_whitespace() {
        let payload = json_payload(json!({ "delta": { "text": " world" } }));
        assert_eq!(
            extract_text_delta(&StreamEventName::MessageDelta, &payload),
            " world"
        );
    }

    #[test]
    fn error_message_prefers_payload_fields() {
        assert_eq!(
            event_error_message(&json_payload(json!({ "message": "quota" })), "fallback"),
            "quota"
        );
        assert_eq!(
            event_error_message(
                &json_payload(json!({ "error": { "message": "nested" } })),
                "fallback"
            ),
            "nested"
        );
        assert_eq!(
            event_error_message(&EventPayload::Text("raw".into()), "fallback"),
            "raw"
        );
        assert_eq!(event_error_message(&EventPayload::Empty, "fallback"), "fallback");
    }
}
