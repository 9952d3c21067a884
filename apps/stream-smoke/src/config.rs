//! Environment-backed configuration for `stream-smoke`.

use std::{env, error::Error, fmt, time::Duration};

use stream_core::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use stream_runtime::{
    ApiConfig, ChatAssistAction, ChatAssistRequest, ChatCompletionsRequest, StreamRunError,
};

const DEFAULT_INPUT: &str = "hello";

/// Which endpoint the smoke run exercises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeMode {
    Assist(ChatAssistAction),
    Completions,
    MiniApp(String),
}

/// Runtime configuration used by the smoke runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    /// Zero disables the idle watchdog.
    pub idle_timeout: Duration,
    pub mode: SmokeMode,
    pub input: String,
    pub session_id: Option<String>,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let base_url = optional_trimmed_env("STREAM_API_BASE_URL", &mut lookup)
            .ok_or(ConfigError::MissingValue {
                key: "STREAM_API_BASE_URL",
            })?;
        let auth_token = optional_trimmed_env("STREAM_AUTH_TOKEN", &mut lookup);

        let connect_timeout = parse_optional_millis(
            "STREAM_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT,
            &mut lookup,
        )?;
        let idle_timeout =
            parse_optional_millis("STREAM_IDLE_TIMEOUT_MS", DEFAULT_IDLE_TIMEOUT, &mut lookup)?;

        let mode = parse_mode(&mut lookup)?;
        let input = optional_trimmed_env("STREAM_SMOKE_INPUT", &mut lookup)
            .unwrap_or_else(|| DEFAULT_INPUT.to_owned());
        let session_id = optional_trimmed_env("STREAM_SMOKE_SESSION_ID", &mut lookup);

        if connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "STREAM_CONNECT_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            base_url,
            auth_token,
            connect_timeout,
            idle_timeout,
            mode,
            input,
            session_id,
        })
    }

    pub fn api_config(&self) -> Result<ApiConfig, StreamRunError> {
        let mut config = ApiConfig::new(&self.base_url)?
            .with_connect_timeout(self.connect_timeout)
            .with_idle_timeout(self.idle_timeout);
        if let Some(token) = &self.auth_token {
            config = config.with_auth_token(token.as_str());
        }
        Ok(config)
    }

    /// Assist request for `action`: ask-anything sends the input as the
    /// question, every other action as the conversation input.
    pub fn assist_request(&self, action: ChatAssistAction) -> ChatAssistRequest {
        let mut request = ChatAssistRequest::new(action);
        if action == ChatAssistAction::AskAnything {
            request.question = Some(self.input.clone());
        } else {
            request.input = Some(self.input.clone());
        }
        request.session_id = self.session_id.clone();
        request
    }

    pub fn completions_request(&self) -> ChatCompletionsRequest {
        let mut request = ChatCompletionsRequest::new(self.input.clone());
        request.session_id = self.session_id.clone();
        request
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    MissingValue { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingValue { key } => write!(f, "missing required {key}"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn parse_mode<F>(lookup: &mut F) -> Result<SmokeMode, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mode = optional_trimmed_env("STREAM_SMOKE_MODE", lookup)
        .unwrap_or_else(|| "completions".to_owned());
    match mode.to_ascii_lowercase().as_str() {
        "completions" => Ok(SmokeMode::Completions),
        "assist" => {
            let Some(value) = optional_trimmed_env("STREAM_SMOKE_ACTION", lookup) else {
                return Ok(SmokeMode::Assist(ChatAssistAction::AskAnything));
            };
            ChatAssistAction::parse(&value)
                .map(SmokeMode::Assist)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "STREAM_SMOKE_ACTION",
                    value,
                    reason: "expected auto_reply, add_task, ask_anything, translate or follow_up"
                        .to_owned(),
                })
        }
        "mini-app" | "mini_app" => optional_trimmed_env("STREAM_SMOKE_APP_ID", lookup)
            .map(SmokeMode::MiniApp)
            .ok_or(ConfigError::MissingValue {
                key: "STREAM_SMOKE_APP_ID",
            }),
        _ => Err(ConfigError::InvalidValue {
            key: "STREAM_SMOKE_MODE",
            value: mode,
            reason: "expected completions, assist or mini-app".to_owned(),
        }),
    }
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_millis<F>(
    key: &'static str,
    default: Duration,
    lookup: &mut F,
) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_defaults_with_only_base_url() {
        let cfg = config_from_pairs(&[("STREAM_API_BASE_URL", " https://api.example.com/ ")])
            .expect("config should parse");

        assert_eq!(cfg.base_url, "https://api.example.com/");
        assert_eq!(cfg.auth_token, None);
        assert_eq!(cfg.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(cfg.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(cfg.mode, SmokeMode::Completions);
        assert_eq!(cfg.input, DEFAULT_INPUT);
    }

    #[test]
    fn base_url_is_required() {
        assert_eq!(
            config_from_pairs(&[("STREAM_API_BASE_URL", "   ")]),
            Err(ConfigError::MissingValue {
                key: "STREAM_API_BASE_URL"
            })
        );
    }

    #[test]
    fn parses_assist_mode_and_timeouts() {
        let cfg = config_from_pairs(&[
            ("STREAM_API_BASE_URL", "https://api.example.com"),
            ("STREAM_SMOKE_MODE", "Assist"),
            ("STREAM_SMOKE_ACTION", "translate"),
            ("STREAM_CONNECT_TIMEOUT_MS", "2500"),
            ("STREAM_IDLE_TIMEOUT_MS", "0"),
            ("STREAM_SMOKE_INPUT", "bonjour"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.mode, SmokeMode::Assist(ChatAssistAction::Translate));
        assert_eq!(cfg.connect_timeout, Duration::from_millis(2_500));
        assert!(cfg.idle_timeout.is_zero());
        let request = cfg.assist_request(ChatAssistAction::Translate);
        assert_eq!(request.input.as_deref(), Some("bonjour"));
        assert_eq!(request.question, None);
    }

    #[test]
    fn mini_app_mode_requires_app_id() {
        let err = config_from_pairs(&[
            ("STREAM_API_BASE_URL", "https://api.example.com"),
            ("STREAM_SMOKE_MODE", "mini-app"),
        ])
        .expect_err("app id is required");
        assert_eq!(
            err,
            ConfigError::MissingValue {
                key: "STREAM_SMOKE_APP_ID"
            }
        );
    }

    #[test]
    fn rejects_invalid_numbers_and_modes() {
        let err = config_from_pairs(&[
            ("STREAM_API_BASE_URL", "https://api.example.com"),
            ("STREAM_CONNECT_TIMEOUT_MS", "soon"),
        ])
        .expect_err("timeout must be numeric");
        assert!(err.to_string().starts_with("invalid STREAM_CONNECT_TIMEOUT_MS='soon'"));

        let err = config_from_pairs(&[
            ("STREAM_API_BASE_URL", "https://api.example.com"),
            ("STREAM_CONNECT_TIMEOUT_MS", "0"),
        ])
        .expect_err("zero connect timeout is rejected");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "STREAM_CONNECT_TIMEOUT_MS",
                ..
            }
        ));

        assert!(
            config_from_pairs(&[
                ("STREAM_API_BASE_URL", "https://api.example.com"),
                ("STREAM_SMOKE_MODE", "batch"),
            ])
            .is_err()
        );
    }

    #[test]
    fn builds_api_config_with_token() {
        let cfg = config_from_pairs(&[
            ("STREAM_API_BASE_URL", "https://api.example.com/"),
            ("STREAM_AUTH_TOKEN", "secret"),
        ])
        .expect("config should parse");
        let api = cfg.api_config().expect("api config");
        assert_eq!(api.auth_token(), Some("secret"));
        assert_eq!(
            api.chat_completions_url().expect("endpoint").as_str(),
            "https://api.example.com/v1/chat/completions"
        );
    }
}
