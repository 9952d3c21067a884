//! Endpoint configuration and request bodies for the chat streaming API.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stream_core::{
    ASSIST_EVENTS, COMPLETION_EVENTS, ConnectionDescriptor, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_IDLE_TIMEOUT, ReconnectPolicy, StreamEventName, event_names,
};
use url::Url;

use crate::runner::StreamRunError;

/// Where and how to reach the chat API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    base_url: Url,
    auth_token: Option<String>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl ApiConfig {
    /// Parse an `http(s)` base URL. Trailing slashes are dropped so endpoint
    /// paths join cleanly.
    pub fn new(base_url: &str) -> Result<Self, StreamRunError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let mut url = Url::parse(trimmed)
            .map_err(|err| StreamRunError::InvalidRequest(format!("invalid base url: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StreamRunError::InvalidRequest(format!(
                "unsupported base url scheme `{}`",
                url.scheme()
            )));
        }
        url.path_segments_mut()
            .map_err(|_| StreamRunError::InvalidRequest("base url cannot carry a path".into()))?
            .pop_if_empty();
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            base_url: url,
            auth_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// Bearer token sent as `Authorization`. Blank tokens are ignored.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        let token = token.trim();
        self.auth_token = (!token.is_empty()).then(|| token.to_owned());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Zero disables the idle watchdog.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// `base + /segment/segment...`, each segment percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, StreamRunError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StreamRunError::InvalidRequest("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn chat_assist_url(&self) -> Result<Url, StreamRunError> {
        self.endpoint(&["v1", "chat", "assist"])
    }

    pub fn chat_completions_url(&self) -> Result<Url, StreamRunError> {
        self.endpoint(&["v1", "chat", "completions"])
    }

    pub fn mini_app_completions_url(&self, app_id: &str) -> Result<Url, StreamRunError> {
        let app_id = app_id.trim();
        if app_id.is_empty() {
            return Err(StreamRunError::InvalidRequest(
                "mini app id must not be empty".into(),
            ));
        }
        self.endpoint(&["v1", "mini-apps", app_id, "chat", "completions"])
    }

    /// One-shot POST descriptor: JSON body with `stream: true`, no
    /// reconnects, no background pausing.
    pub fn stream_descriptor<T: Serialize>(
        &self,
        url: &Url,
        request: &T,
        events: &[StreamEventName],
    ) -> Result<ConnectionDescriptor, StreamRunError> {
        let body = streaming_body(request)?;
        let mut descriptor = ConnectionDescriptor::new(url.as_str())
            .with_method("POST")
            .with_header("Content-Type", "application/json")
            .with_header("Accept", "text/event-stream")
            .with_body(body)
            .with_custom_events(event_names(events))
            .with_connect_timeout(self.connect_timeout)
            .with_idle_timeout(self.idle_timeout)
            .with_reconnect(ReconnectPolicy::disabled())
            .with_pause_when_background(false);
        if let Some(token) = &self.auth_token {
            descriptor = descriptor.with_header("Authorization", format!("Bearer {token}"));
        }
        Ok(descriptor)
    }

    pub fn chat_assist_descriptor(
        &self,
        request: &ChatAssistRequest,
    ) -> Result<ConnectionDescriptor, StreamRunError> {
        self.stream_descriptor(&self.chat_assist_url()?, request, ASSIST_EVENTS)
    }

    pub fn chat_completions_descriptor(
        &self,
        request: &ChatCompletionsRequest,
    ) -> Result<ConnectionDescriptor, StreamRunError> {
        self.stream_descriptor(&self.chat_completions_url()?, request, COMPLETION_EVENTS)
    }

    pub fn mini_app_completions_descriptor(
        &self,
        app_id: &str,
        request: &ChatCompletionsRequest,
    ) -> Result<ConnectionDescriptor, StreamRunError> {
        self.stream_descriptor(
            &self.mini_app_completions_url(app_id)?,
            request,
            COMPLETION_EVENTS,
        )
    }
}

fn streaming_body<T: Serialize>(request: &T) -> Result<String, StreamRunError> {
    let mut body = serde_json::to_value(request)?;
    let Value::Object(fields) = &mut body else {
        return Err(StreamRunError::InvalidRequest(
            "request body must be a JSON object".into(),
        ));
    };
    fields.insert("stream".to_owned(), Value::Bool(true));
    Ok(serde_json::to_string(&body)?)
}

/// Kind of assistance requested from `/v1/chat/assist`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatAssistAction {
    #[default]
    AutoReply,
    AddTask,
    AskAnything,
    Translate,
    FollowUp,
}

impl ChatAssistAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "auto_reply" => Some(Self::AutoReply),
            "add_task" => Some(Self::AddTask),
            "ask_anything" => Some(Self::AskAnything),
            "translate" => Some(Self::Translate),
            "follow_up" => Some(Self::FollowUp),
            _ => None,
        }
    }
}

/// Conversation the request is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[serde(rename = "self")]
    SelfChat,
    User,
    Group,
    UserBot,
}

/// Body of an assist request; `stream: true` is added on send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChatAssistRequest {
    pub action: ChatAssistAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TargetType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_message_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatAssistRequest {
    pub fn new(action: ChatAssistAction) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }
}

/// Body of a completions request; `stream: true` is added on send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChatCompletionsRequest {
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TargetType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_owner_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skill_ids: Vec<String>,
}

impl ChatCompletionsRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn trims_trailing_slashes_and_joins_endpoints() {
        let config = ApiConfig::new("https://api.example.com/base//").expect("valid url");
        assert_eq!(
            config.chat_assist_url().expect("endpoint").as_str(),
            "https://api.example.com/base/v1/chat/assist"
        );

        let root = ApiConfig::new(" https://api.example.com/ ").expect("valid url");
        assert_eq!(
            root.chat_completions_url().expect("endpoint").as_str(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn encodes_mini_app_ids() {
        let config = ApiConfig::new("https://api.example.com").expect("valid url");
        assert_eq!(
            config
                .mini_app_completions_url("weather app")
                .expect("endpoint")
                .as_str(),
            "https://api.example.com/v1/mini-apps/weather%20app/chat/completions"
        );
        assert!(config.mini_app_completions_url("  ").is_err());
    }

    #[test]
    fn rejects_non_http_base_urls() {
        assert!(ApiConfig::new("ftp://files.example.com").is_err());
        assert!(ApiConfig::new("not a url").is_err());
    }

    #[test]
    fn builds_one_shot_post_descriptor() {
        let config = ApiConfig::new("https://api.example.com")
            .expect("valid url")
            .with_auth_token("secret")
            .with_idle_timeout(Duration::from_secs(30));
        let mut request = ChatAssistRequest::new(ChatAssistAction::AskAnything);
        request.question = Some("what changed?".into());
        request.target_type = Some(TargetType::SelfChat);

        let descriptor = config
            .chat_assist_descriptor(&request)
            .expect("descriptor");
        assert_eq!(descriptor.method, "POST");
        assert_eq!(descriptor.url, "https://api.example.com/v1/chat/assist");
        assert_eq!(
            descriptor.headers.get("Authorization").map(String::as_str),
            Some("Bearer secret")
        );
        assert_eq!(
            descriptor.headers.get("Accept").map(String::as_str),
            Some("text/event-stream")
        );
        assert!(!descriptor.reconnect.enabled());
        assert!(!descriptor.pause_when_background);
        assert!(descriptor.declares_event("assist_candidates"));
        assert_eq!(descriptor.idle_timeout, Duration::from_secs(30));

        let body: Value =
            serde_json::from_str(descriptor.body.as_deref().expect("body")).expect("json body");
        assert_eq!(
            body,
            json!({
                "action": "ask_anything",
                "question": "what changed?",
                "target_type": "self",
                "stream": true,
            })
        );
    }

    #[test]
    fn blank_token_sends_no_authorization() {
        let config = ApiConfig::new("https://api.example.com")
            .expect("valid url")
            .with_auth_token("   ");
        let descriptor = config
            .chat_completions_descriptor(&ChatCompletionsRequest::new("hi"))
            .expect("descriptor");
        assert!(!descriptor.headers.contains_key("Authorization"));
        assert!(descriptor.declares_event("message_delta"));
    }

    #[test]
    fn parses_action_names() {
        assert_eq!(
            ChatAssistAction::parse("Ask-Anything"),
            Some(ChatAssistAction::AskAnything)
        );
        assert_eq!(ChatAssistAction::parse("summarize"), None);
    }
}
