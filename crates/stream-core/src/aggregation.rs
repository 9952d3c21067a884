//! Folding stream events into assist candidates or plain completion text.

use std::borrow::Cow;

use crate::{
    candidates::{AssistCandidate, CandidateKind, STREAM_TEXT_CANDIDATE_ID, merge_assist_candidates},
    events::StreamEventName,
    normalization::{EventPayload, PayloadShape, detect_payload_shape, event_error_message, extract_text_delta},
};

/// Prefix the backend puts in front of diagnostic output when no model
/// answered.
pub const FALLBACK_MARKER: &str = "[agenttown-fallback]";

const FALLBACK_NOTICE_ZH: &str =
    "当前后端未返回真实模型答案，正在使用回退输出。请检查后端的模型配置";
const FALLBACK_NOTICE_EN: &str = "The backend did not return a real model answer. Showing fallback output. Please check the backend model configuration";
const QUESTION_LABEL: &str = "userquestion:";

/// Reduce one assist event into the next candidate list.
///
/// Returns `Cow::Borrowed(previous)` when the event does not change
/// anything, so callers can skip re-rendering.
pub fn reduce_assist_candidates<'a>(
    event_name: &str,
    payload: &EventPayload,
    previous: &'a [AssistCandidate],
) -> Cow<'a, [AssistCandidate]> {
    let event = StreamEventName::parse(event_name);
    match detect_payload_shape(&event, payload, previous.len()) {
        PayloadShape::FullReplacement(candidates) => Cow::Owned(candidates),
        PayloadShape::SingleUpsert(candidate) => merge_assist_candidates(previous, vec![candidate]),
        PayloadShape::TextDelta(delta) => append_stream_text(previous, &delta),
        PayloadShape::NoMatch => Cow::Borrowed(previous),
    }
}

fn append_stream_text<'a>(
    previous: &'a [AssistCandidate],
    delta: &str,
) -> Cow<'a, [AssistCandidate]> {
    let existing = previous
        .iter()
        .find(|candidate| candidate.id.as_deref() == Some(STREAM_TEXT_CANDIDATE_ID));

    let Some(existing) = existing else {
        let candidate = with_stream_text(
            AssistCandidate::new(CandidateKind::Text, "").with_id(STREAM_TEXT_CANDIDATE_ID),
            delta.to_owned(),
        );
        let mut next = previous.to_vec();
        next.push(candidate);
        return Cow::Owned(next);
    };

    // Sanitize the whole raw accumulation, never the notice that replaced it.
    let source = existing.stream_source.as_deref().unwrap_or(&existing.text);
    let updated = with_stream_text(existing.clone(), format!("{source}{delta}"));
    merge_assist_candidates(previous, vec![updated])
}

fn with_stream_text(candidate: AssistCandidate, accumulated: String) -> AssistCandidate {
    let text = sanitize_stream_text(&accumulated);
    let stream_source = (text != accumulated).then_some(accumulated);
    AssistCandidate {
        text,
        stream_source,
        ..candidate
    }
}

/// Replace backend fallback diagnostics with a readable notice.
///
/// The notice is Chinese when the text contains CJK characters and quotes
/// the `UserQuestion:` line when there is one. Other text passes through.
pub fn sanitize_stream_text(input: &str) -> String {
    let text = input.trim();
    if !text.starts_with(FALLBACK_MARKER) {
        return input.to_owned();
    }

    let question = extract_user_question(text);
    let use_zh = contains_cjk(text);
    match (use_zh, question) {
        (true, Some(question)) => format!("{FALLBACK_NOTICE_ZH}（问题：{question}）"),
        (true, None) => FALLBACK_NOTICE_ZH.to_owned(),
        (false, Some(question)) => format!("{FALLBACK_NOTICE_EN} (Question: {question})"),
        (false, None) => FALLBACK_NOTICE_EN.to_owned(),
    }
}

fn extract_user_question(text: &str) -> Option<&str> {
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let start = text.to_ascii_lowercase().find(QUESTION_LABEL)? + QUESTION_LABEL.len();
    // A blank label line takes the question from the next non-blank line.
    let rest = text[start..].trim_start();
    let line = rest.split('\n').next().unwrap_or_default().trim();
    if line.is_empty() { None } else { Some(line) }
}

fn contains_cjk(text: &str) -> bool {
    text.chars().any(|ch| ('\u{3400}'..='\u{9FFF}').contains(&ch))
}

/// Result of applying one event to an aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateStep {
    Updated,
    Unchanged,
    /// The stream signalled successful completion.
    Finished,
    /// The stream carried an application-level error.
    Failed(String),
}

/// A fold over one stream's events.
pub trait StreamAggregate {
    type Snapshot: ?Sized;

    fn apply(&mut self, event: &StreamEventName, payload: &EventPayload) -> AggregateStep;

    fn snapshot(&self) -> &Self::Snapshot;
}

/// Candidate-list aggregate used by the assist endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistAggregate {
    candidates: Vec<AssistCandidate>,
}

impl AssistAggregate {
    pub fn candidates(&self) -> &[AssistCandidate] {
        &self.candidates
    }

    pub fn into_candidates(self) -> Vec<AssistCandidate> {
        self.candidates
    }
}

impl StreamAggregate for AssistAggregate {
    type Snapshot = [AssistCandidate];

    fn apply(&mut self, event: &StreamEventName, payload: &EventPayload) -> AggregateStep {
        if event.is_done() {
            return AggregateStep::Finished;
        }
        if event.is_protocol_error() {
            return AggregateStep::Failed(event_error_message(payload, "assist stream error"));
        }

        match reduce_assist_candidates(event.as_str(), payload, &self.candidates) {
            Cow::Borrowed(_) => AggregateStep::Unchanged,
            Cow::Owned(next) => {
                self.candidates = next;
                AggregateStep::Updated
            }
        }
    }

    fn snapshot(&self) -> &[AssistCandidate] {
        &self.candidates
    }
}

/// Single-string aggregate used by the completions endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionBuffer {
    text: String,
}

impl CompletionBuffer {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

impl StreamAggregate for CompletionBuffer {
    type Snapshot = str;

    fn apply(&mut self, event: &StreamEventName, payload: &EventPayload) -> AggregateStep {
        if event.is_done() {
            return AggregateStep::Finished;
        }
        if event.is_protocol_error() {
            return AggregateStep::Failed(event_error_message(payload, "completion stream error"));
        }
        if event.is_non_text() {
            return AggregateStep::Unchanged;
        }

        let delta = extract_text_delta(event, payload);
        if delta.is_empty() {
            return AggregateStep::Unchanged;
        }
        self.text.push_str(&delta);
        AggregateStep::Updated
    }

    fn snapshot(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: serde_json::Value) -> EventPayload {
        EventPayload::Json(value)
    }

    fn reply(id: &str, text: &str) -> AssistCandidate {
        AssistCandidate::new(CandidateKind::Reply, text).with_id(id)
    }

    #[test]
    fn replaces_candidates_when_payload_contains_full_arrays() {
        let previous = vec![reply("old", "Old one")];
        let next = reduce_assist_candidates(
            "assist_candidates",
            &payload(json!({
                "assist_candidates": {
                    "reply_candidates": [{ "id": "r1", "text": "Reply 1" }],
                    "task_candidates": [
                        { "id": "t1", "title": "Task 1", "description": "Do it", "priority": "high" }
                    ],
                }
            })),
            &previous,
        );

        assert_eq!(next.len(), 2);
        assert_eq!(next[0], reply("r1", "Reply 1"));
        assert_eq!(next[1].kind, CandidateKind::Task);
        assert_eq!(next[1].text, "Task 1\nDo it");
        assert_eq!(next[1].title.as_deref(), Some("Task 1"));
        assert_eq!(next[1].description.as_deref(), Some("Do it"));
    }

    #[test]
    fn merges_single_candidate_updates_by_id() {
        let previous = vec![reply("r1", "Initial"), reply("r2", "Keep")];
        let next = reduce_assist_candidates(
            "assist_candidates",
            &payload(json!({ "reply_candidate": { "id": "r1", "text": "Updated" } })),
            &previous,
        );

        assert_eq!(&next[..], [reply("r1", "Updated"), reply("r2", "Keep")]);
    }

    #[test]
    fn appends_message_delta_text_into_one_streaming_candidate() {
        let first = reduce_assist_candidates(
            "message_delta",
            &payload(json!({ "delta": { "text": "Hel" } })),
            &[],
        )
        .into_owned();
        let second = reduce_assist_candidates(
            "message_delta",
            &payload(json!({ "delta": { "text": "lo" } })),
            &first,
        );

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind, CandidateKind::Text);
        assert_eq!(second[0].text, "Hello");
        assert_eq!(second[0].id.as_deref(), Some(STREAM_TEXT_CANDIDATE_ID));
    }

    #[test]
    fn stream_text_is_appended_after_existing_suggestions() {
        let previous = vec![reply("r1", "Hi")];
        let next = reduce_assist_candidates("delta", &payload(json!({ "text": "more" })), &previous);
        assert_eq!(next.len(), 2);
        assert_eq!(next[0], reply("r1", "Hi"));
        assert_eq!(next[1].text, "more");
    }

    #[test]
    fn ignores_non_text_events_even_if_payload_contains_delta_text() {
        let next = reduce_assist_candidates(
            "tool_execution_result",
            &payload(json!({ "delta": { "text": "debug payload" } })),
            &[],
        );
        assert!(next.is_empty());
        assert!(matches!(next, Cow::Borrowed(_)));
    }

    #[test]
    fn accepts_unknown_delta_like_event_names() {
        let next = reduce_assist_candidates(
            "response.delta_text",
            &payload(json!({ "delta": { "text": "hello" } })),
            &[],
        );
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].kind, CandidateKind::Text);
        assert_eq!(next[0].text, "hello");
    }

    #[test]
    fn unmatched_payload_borrows_previous() {
        let previous = vec![reply("r1", "Hi")];
        for (name, data) in [
            ("trace", Some("{\"step\":1}")),
            ("assist_candidates", Some("{not json")),
            ("message_start", None),
            ("ping", Some("[DONE]")),
        ] {
            let next = reduce_assist_candidates(name, &EventPayload::parse(data), &previous);
            assert!(matches!(next, Cow::Borrowed(_)), "{name} must not change the list");
        }
    }

    #[test]
    fn reduction_is_deterministic() {
        let previous = vec![reply("r1", "Hi")];
        let event = payload(json!({ "task_candidate": { "title": "Book room" } }));
        let a = reduce_assist_candidates("assist_candidates", &event, &previous);
        let b = reduce_assist_candidates("assist_candidates", &event, &previous);
        assert_eq!(a, b);
    }

    #[test]
    fn sanitizes_fallback_prompt_text() {
        let next = reduce_assist_candidates(
            "message_delta",
            &payload(json!({
                "delta": {
                    "text": "[agenttown-fallback] Assist action: ask_anything\nUserQuestion: 也一样\nSelectedMessageContext: test"
                }
            })),
            &[],
        );

        assert_eq!(next.len(), 1);
        assert!(next[0].text.contains("回退输出"));
        assert!(next[0].text.contains("也一样"));
        assert!(!next[0].text.contains("SelectedMessageContext"));
    }

    #[test]
    fn fallback_split_across_deltas_never_leaks() {
        let first = reduce_assist_candidates(
            "message_delta",
            &payload(json!({ "delta": { "text": "[agenttown-" } })),
            &[],
        )
        .into_owned();
        let second = reduce_assist_candidates(
            "message_delta",
            &payload(json!({ "delta": { "text": "fallback] Assist action: ask_anything" } })),
            &first,
        )
        .into_owned();
        let third = reduce_assist_candidates(
            "message_delta",
            &payload(json!({ "delta": { "text": "\nSelectedMessageContext: secret" } })),
            &second,
        );

        assert_eq!(third.len(), 1);
        assert!(third[0].text.starts_with("The backend did not return"));
        assert!(!third[0].text.contains("SelectedMessageContext"));
    }

    #[test]
    fn notice_follows_question_arriving_in_later_delta() {
        let first = reduce_assist_candidates(
            "message_delta",
            &payload(json!({
                "delta": { "text": "[agenttown-fallback] Assist action: ask_anything\n" }
            })),
            &[],
        )
        .into_owned();
        assert_eq!(first[0].text, FALLBACK_NOTICE_EN);

        let second = reduce_assist_candidates(
            "message_delta",
            &payload(json!({
                "delta": { "text": "UserQuestion: 也一样\nSelectedMessageContext: x" }
            })),
            &first,
        );

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].text, format!("{FALLBACK_NOTICE_ZH}（问题：也一样）"));
        assert_eq!(
            second[0].text,
            sanitize_stream_text(
                "[agenttown-fallback] Assist action: ask_anything\nUserQuestion: 也一样\nSelectedMessageContext: x"
            )
        );
    }

    #[test]
    fn plain_stream_text_keeps_no_shadow_copy() {
        let next = reduce_assist_candidates("delta", &payload(json!({ "text": "plain" })), &[]);
        assert_eq!(next[0].stream_source, None);
        assert_eq!(
            next[0],
            AssistCandidate::new(CandidateKind::Text, "plain").with_id(STREAM_TEXT_CANDIDATE_ID)
        );
    }

    #[test]
    fn blank_question_label_takes_the_next_line() {
        let text = sanitize_stream_text("[agenttown-fallback]\nUserQuestion:\n  next line  \nmore");
        assert!(text.ends_with("(Question: next line)"), "{text}");
        assert_eq!(
            sanitize_stream_text("[agenttown-fallback]\nUserQuestion:   "),
            FALLBACK_NOTICE_EN
        );
    }

    #[test]
    fn english_notice_quotes_question() {
        let text = sanitize_stream_text("[agenttown-fallback]\nuserquestion: what time is it?\n");
        assert!(text.ends_with("(Question: what time is it?)"));
        assert_eq!(sanitize_stream_text("regular answer"), "regular answer");
    }

    #[test]
    fn assist_aggregate_reports_terminal_events() {
        let mut aggregate = AssistAggregate::default();
        assert_eq!(
            aggregate.apply(
                &StreamEventName::MessageDelta,
                &payload(json!({ "delta": { "text": "Hi" } }))
            ),
            AggregateStep::Updated
        );
        assert_eq!(
            aggregate.apply(&StreamEventName::Ping, &EventPayload::Empty),
            AggregateStep::Unchanged
        );
        assert_eq!(
            aggregate.apply(
                &StreamEventName::ResponseError,
                &payload(json!({ "error": { "message": "model offline" } }))
            ),
            AggregateStep::Failed("model offline".into())
        );
        assert_eq!(
            aggregate.apply(&StreamEventName::Done, &payload(json!({ "ok": true }))),
            AggregateStep::Finished
        );
        assert_eq!(aggregate.candidates().len(), 1);
    }

    #[test]
    fn completion_buffer_accumulates_delta_text() {
        let mut buffer = CompletionBuffer::default();
        for (name, data) in [
            ("message_start", "{\"role\":\"assistant\"}"),
            ("message_delta", "{\"delta\":{\"text\":\"Hel\"}}"),
            ("trace", "{\"delta\":{\"text\":\"debug\"}}"),
            ("response.output_text.delta", "{\"delta\":\"lo\"}"),
            ("message", "!"),
        ] {
            buffer.apply(&StreamEventName::parse(name), &EventPayload::parse(Some(data)));
        }
        assert_eq!(buffer.text(), "Hello!");

        assert_eq!(
            buffer.apply(&StreamEventName::Done, &EventPayload::Empty),
            AggregateStep::Finished
        );
        assert_eq!(
            buffer.apply(&StreamEventName::Error, &EventPayload::Empty),
            AggregateStep::Failed("completion stream error".into())
        );
        assert_eq!(buffer.into_text(), "Hello!");
    }
}
