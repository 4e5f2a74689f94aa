//! Task execution backends.
//!
//! The coordination core treats execution as one opaque call that either
//! yields content or a categorized failure. It never retries; a failure is
//! recorded on the task and the lease is released.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{BackendConfig, BackendKind};
use crate::error::{self, ExitError};
use crate::subprocess::Tool;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_HTTP_MODEL: &str = "claude-sonnet-4-5";

/// Per-call knobs.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    pub model: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl ExecuteParams {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {0}")]
    Server(String),

    /// Milliseconds allowed before giving up.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn category(&self) -> &'static str {
        match self {
            BackendError::Auth(_) => "auth",
            BackendError::RateLimit(_) => "rate_limit",
            BackendError::Network(_) => "network",
            BackendError::Server(_) => "server",
            BackendError::Timeout(_) => "timeout",
            BackendError::Other(_) => "other",
        }
    }
}

pub trait Backend: Send + Sync {
    fn execute(&self, prompt: &str, params: &ExecuteParams) -> Result<Completion, BackendError>;
}

/// Build the backend selected by config.
pub fn from_config(config: &BackendConfig) -> Result<Box<dyn Backend>, ExitError> {
    match config.kind {
        BackendKind::Command => Ok(Box::new(CommandBackend::new(
            &config.command,
            config.args.clone(),
            config.model_flag.clone(),
        ))),
        BackendKind::Http => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                ExitError::Config(format!(
                    "backend.kind = \"http\" needs an API key in ${}",
                    config.api_key_env
                ))
            })?;
            Ok(Box::new(HttpBackend::new(&config.url, api_key)))
        }
    }
}

/// Classify an error message from a CLI or HTTP body by the usual markers.
fn classify_message(message: &str) -> fn(String) -> BackendError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests") {
        BackendError::RateLimit
    } else if lower.contains("unauthorized")
        || lower.contains("401")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        BackendError::Auth
    } else if lower.contains("overloaded") || lower.contains("internal server error") || lower.contains("503") {
        BackendError::Server
    } else if lower.contains("connection") || lower.contains("dns") || lower.contains("network") {
        BackendError::Network
    } else {
        BackendError::Other
    }
}

/// Runs an agent CLI (`claude -p <prompt>` by default) and returns its stdout.
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    model_flag: Option<String>,
}

impl CommandBackend {
    pub fn new(program: &str, args: Vec<String>, model_flag: Option<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
            model_flag,
        }
    }
}

impl Backend for CommandBackend {
    fn execute(&self, prompt: &str, params: &ExecuteParams) -> Result<Completion, BackendError> {
        let mut tool = Tool::new(&self.program).args(&self.args);
        if let (Some(flag), Some(model)) = (&self.model_flag, &params.model) {
            tool = tool.arg(flag).arg(model);
        }
        let output = tool
            .arg(prompt)
            .timeout(params.timeout)
            .run()
            .map_err(|e| match e.downcast_ref::<ExitError>() {
                Some(ExitError::Timeout { timeout_ms, .. }) => BackendError::Timeout(*timeout_ms),
                Some(other) => BackendError::Other(other.to_string()),
                None => BackendError::Other(format!("{e:#}")),
            })?;

        if !output.success() {
            let message = format!(
                "{} exited with code {}: {}",
                self.program,
                output.exit_code,
                output.stderr.trim()
            );
            return Err(classify_message(&output.stderr)(message));
        }

        Ok(Completion {
            content: output.stdout,
            usage: Usage::default(),
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [RequestMessage<'a>; 1],
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Anthropic Messages API client over `ureq`.
pub struct HttpBackend {
    agent: ureq::Agent,
    url: String,
    api_key: String,
}

impl HttpBackend {
    pub fn new(url: &str, api_key: String) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            url: url.to_string(),
            api_key,
        }
    }
}

/// Map an HTTP status to an error category.
fn classify_status(status: u16, body: &str) -> BackendError {
    let message = format!("HTTP {status}: {}", body.trim());
    match status {
        401 | 403 => BackendError::Auth(message),
        429 => BackendError::RateLimit(message),
        500..=599 => BackendError::Server(message),
        _ => BackendError::Other(message),
    }
}

fn parse_messages_response(body: &str) -> Result<Completion, BackendError> {
    let parsed: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::Other(format!("unexpected response body: {e}")))?;
    let content = parsed
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .map(|b| b.text)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Completion {
        content,
        usage: parsed.usage,
    })
}

impl Backend for HttpBackend {
    fn execute(&self, prompt: &str, params: &ExecuteParams) -> Result<Completion, BackendError> {
        let request = MessagesRequest {
            model: params.model.as_deref().unwrap_or(DEFAULT_HTTP_MODEL),
            max_tokens: params.max_tokens,
            messages: [RequestMessage {
                role: "user",
                content: prompt,
            }],
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| BackendError::Other(format!("encoding request: {e}")))?;

        let response = self
            .agent
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .config()
            .timeout_global(Some(params.timeout))
            .build()
            .send(body.as_str())
            .map_err(|e| match e {
                ureq::Error::Timeout(_) => BackendError::Timeout(error::millis(params.timeout)),
                other => BackendError::Network(other.to_string()),
            })?;

        let status = response.status().as_u16();
        let text = response
            .into_body()
            .read_to_string()
            .map_err(|e| BackendError::Network(format!("reading response: {e}")))?;

        if !(200..300).contains(&status) {
            return Err(classify_status(status, &text));
        }
        parse_messages_response(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ExecuteParams {
        ExecuteParams {
            model: None,
            max_tokens: 64,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn command_backend_returns_stdout() {
        let backend = CommandBackend::new("echo", vec!["answer:".into()], None);
        let completion = backend.execute("hello", &params()).unwrap();
        assert_eq!(completion.content.trim(), "answer: hello");
        assert_eq!(completion.usage, Usage::default());
    }

    #[test]
    fn command_backend_passes_model_flag() {
        let backend = CommandBackend::new("echo", vec![], Some("--model".into()));
        let mut p = params();
        p.model = Some("haiku".into());
        let completion = backend.execute("go", &p).unwrap();
        assert_eq!(completion.content.trim(), "--model haiku go");
    }

    #[test]
    fn command_backend_categorizes_failures() {
        let backend = CommandBackend::new(
            "sh",
            vec!["-c".into(), "echo 'Error: 429 Too Many Requests' >&2; exit 1".into(), "sh".into()],
            None,
        );
        let err = backend.execute("x", &params()).unwrap_err();
        assert_eq!(err.category(), "rate_limit");

        let missing = CommandBackend::new("nonexistent-agent-xyz", vec![], None);
        assert_eq!(missing.execute("x", &params()).unwrap_err().category(), "other");
    }

    #[test]
    fn command_backend_times_out() {
        let backend = CommandBackend::new("sleep", vec![], None);
        let mut p = params();
        p.timeout = Duration::from_millis(200);
        let err = backend.execute("5", &p).unwrap_err();
        assert!(matches!(err, BackendError::Timeout(200)));
        assert_eq!(err.to_string(), "timed out after 200ms");
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(401, "").category(), "auth");
        assert_eq!(classify_status(403, "").category(), "auth");
        assert_eq!(classify_status(429, "").category(), "rate_limit");
        assert_eq!(classify_status(529, "overloaded").category(), "server");
        assert_eq!(classify_status(400, "bad").category(), "other");
    }

    #[test]
    fn message_classification() {
        assert_eq!(classify_message("Invalid API key")("m".into()).category(), "auth");
        assert_eq!(classify_message("API Error: Overloaded")("m".into()).category(), "server");
        assert_eq!(classify_message("connection reset")("m".into()).category(), "network");
        assert_eq!(classify_message("something odd")("m".into()).category(), "other");
    }

    #[test]
    fn parses_messages_response() {
        let body = r#"{
            "content": [
                {"type": "text", "text": "first"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "second"}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 34}
        }"#;
        let completion = parse_messages_response(body).unwrap();
        assert_eq!(completion.content, "first\nsecond");
        assert_eq!(completion.usage.input_tokens, 12);
        assert_eq!(completion.usage.output_tokens, 34);
        assert!(parse_messages_response("<html>").is_err());
    }

    #[test]
    fn http_backend_requires_key() {
        let config = BackendConfig {
            kind: BackendKind::Http,
            ..BackendConfig::default()
        };
        assert!(matches!(from_config(&config), Err(ExitError::Config(_))));
    }
}
