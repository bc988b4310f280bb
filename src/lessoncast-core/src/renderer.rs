//! Script rendering: deduplicated lesson text in, two-speaker dialogue out.
//!
//! The renderer is an injected dependency. Production uses an
//! OpenAI-compatible chat model; tests and `--script` runs use a fixed script.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{LessoncastError, Result};
use crate::script::{DialogueScript, Speaker};

/// Turns lesson text into a dialogue between the two given speakers.
#[async_trait]
pub trait ScriptRenderer: Send + Sync {
    async fn render(
        &self,
        title: &str,
        content: &str,
        speakers: &[Speaker; 2],
    ) -> Result<DialogueScript>;
}

/// Fill a prompt template's `{host}`, `{guest}`, `{title}` and `{content}`.
pub fn fill_prompt(template: &str, speakers: &[Speaker; 2], title: &str, content: &str) -> String {
    template
        .replace("{host}", &speakers[0].name)
        .replace("{guest}", &speakers[1].name)
        .replace("{title}", title)
        .replace("{content}", content)
}

/// Renderer backed by an OpenAI-compatible chat completion endpoint.
pub struct OpenAiScriptRenderer {
    client: Client<OpenAIConfig>,
    config: LlmConfig,
}

impl OpenAiScriptRenderer {
    pub fn new(config: LlmConfig, api_key: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LessoncastError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&config.api_base);

        Ok(Self {
            client: Client::with_config(openai_config).with_http_client(http_client),
            config,
        })
    }

    /// One completion, retried with exponential backoff on transient errors.
    async fn get_completion(&self, prompt: &str) -> Result<String> {
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: "You write natural, accurate two-person podcast scripts.".into(),
                name: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: prompt.to_string().into(),
                name: None,
            }),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.config.model)
            .max_completion_tokens(self.config.max_tokens)
            .messages(messages)
            .build()?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                // 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << attempt.min(6));
                tokio::time::sleep(delay).await;
            }

            match self.client.chat().create(request.clone()).await {
                Ok(response) => {
                    return Ok(response
                        .choices
                        .first()
                        .and_then(|c| c.message.content.clone())
                        .unwrap_or_default());
                }
                Err(e) if is_permanent(&e) => {
                    warn!(attempt = attempt + 1, error = %e, "script completion rejected");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, max_attempts, error = %e, "script completion failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map(LessoncastError::from).unwrap_or_else(|| {
            LessoncastError::Config("Unknown API error after retries".to_string())
        }))
    }
}

/// API error types and codes that no amount of retrying will fix.
const PERMANENT_API_ERRORS: &[&str] = &[
    "invalid_request_error",
    "authentication_error",
    "permission_error",
    "not_found_error",
    "insufficient_quota",
    "invalid_api_key",
    "model_not_found",
    "context_length_exceeded",
];

/// Whether a completion error would fail the same way on every attempt.
///
/// Transport failures and server errors (which carry no error type) are
/// worth retrying; rejected requests, bad credentials and malformed
/// responses are not.
fn is_permanent(error: &OpenAIError) -> bool {
    match error {
        OpenAIError::ApiError(api) => [&api.r#type, &api.code]
            .into_iter()
            .flatten()
            .any(|kind| PERMANENT_API_ERRORS.contains(&kind.as_str())),
        OpenAIError::JSONDeserialize(..)
        | OpenAIError::InvalidArgument(_)
        | OpenAIError::FileSaveError(_)
        | OpenAIError::FileReadError(_) => true,
        _ => false,
    }
}

#[async_trait]
impl ScriptRenderer for OpenAiScriptRenderer {
    async fn render(
        &self,
        title: &str,
        content: &str,
        speakers: &[Speaker; 2],
    ) -> Result<DialogueScript> {
        let prompt = fill_prompt(&self.config.prompt, speakers, title, content);

        // Empty completions happen with some providers under load.
        let max_empty_retries = 3;
        let mut sanitized = String::new();

        for attempt in 0..max_empty_retries {
            let response = self.get_completion(&prompt).await?;
            sanitized = sanitize_response(&response);
            if sanitized.trim().len() > 10 {
                break;
            }
            if attempt < max_empty_retries - 1 {
                warn!(
                    document = title,
                    attempt = attempt + 1,
                    "empty script completion, retrying"
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }

        if sanitized.trim().len() <= 10 {
            return Err(LessoncastError::ScriptRender {
                id: title.to_string(),
                message: format!("empty response after {} attempts", max_empty_retries),
            });
        }

        debug!(document = title, chars = sanitized.len(), "script rendered");
        DialogueScript::parse(speakers.clone(), &sanitized).map_err(|e| {
            LessoncastError::ScriptRender {
                id: title.to_string(),
                message: e.to_string(),
            }
        })
    }
}

/// Renderer returning a pre-written transcript, parsed against the speakers.
#[derive(Debug, Clone)]
pub struct StaticScriptRenderer {
    transcript: String,
}

impl StaticScriptRenderer {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
        }
    }
}

#[async_trait]
impl ScriptRenderer for StaticScriptRenderer {
    async fn render(
        &self,
        _title: &str,
        _content: &str,
        speakers: &[Speaker; 2],
    ) -> Result<DialogueScript> {
        DialogueScript::parse(speakers.clone(), &self.transcript)
    }
}

/// Reasoning/internal tags stripped together with their content.
const TAGS_TO_STRIP: [&str; 10] = [
    "thinking",
    "think",
    "reflection",
    "reasoning",
    "thought",
    "scratchpad",
    "plan",
    "analysis",
    "internal",
    "deliberation",
];

static TAG_BLOCK_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    TAGS_TO_STRIP
        .iter()
        .filter_map(|tag| Regex::new(&format!(r"(?is)<{tag}[^>]*>.*?</{tag}>", tag = tag)).ok())
        .collect()
});
static ORPHAN_TAG_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"</?[A-Za-z][\w-]*[^>]*>").ok());
static INLINE_WS_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[ \t]+").ok());

/// Strip reasoning tags, markup and stray whitespace from a completion while
/// keeping its line structure (one speaker turn per line).
pub fn sanitize_response(response: &str) -> String {
    let mut result = response.to_string();

    for re in TAG_BLOCK_RES.iter() {
        result = re.replace_all(&result, "").to_string();
    }
    if let Some(re) = ORPHAN_TAG_RE.as_ref() {
        result = re.replace_all(&result, "").to_string();
    }

    result = result.replace('*', "");

    if let Some(re) = INLINE_WS_RE.as_ref() {
        result = re.replace_all(&result, " ").to_string();
    }

    result
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoicesConfig;
    use crate::script::speakers_from_config;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_sanitize_response_thinking_tags() {
        let input = "<thinking>Let me plan the episode...</thinking>Alex: Welcome back.";
        assert_eq!(sanitize_response(input), "Alex: Welcome back.");
    }

    #[test]
    fn test_sanitize_response_keeps_lines() {
        let input = "**Alex:**   Hello   there.\n\n\n**Sam:** Hi!\n";
        assert_eq!(sanitize_response(input), "Alex: Hello there.\nSam: Hi!");
    }

    #[test]
    fn test_sanitize_response_multiline_tags() {
        let input = "<reasoning>\nstep one\nstep two\n</reasoning>\nAlex: Ready.";
        assert_eq!(sanitize_response(input), "Alex: Ready.");
    }

    #[test]
    fn test_sanitize_response_orphan_tags() {
        let input = "Alex: Start <think>nested <inner>tags</inner> content</think> end";
        let output = sanitize_response(input);
        assert!(!output.contains('<'));
        assert!(!output.contains('>'));
    }

    fn api_error(r#type: Option<&str>, code: Option<&str>) -> OpenAIError {
        OpenAIError::ApiError(async_openai::error::ApiError {
            message: "failed".to_string(),
            r#type: r#type.map(str::to_string),
            param: None,
            code: code.map(str::to_string),
        })
    }

    #[test]
    fn test_permanent_errors_are_classified() {
        assert!(is_permanent(&api_error(Some("invalid_request_error"), Some("invalid_api_key"))));
        assert!(is_permanent(&api_error(None, Some("model_not_found"))));
        assert!(is_permanent(&api_error(Some("insufficient_quota"), None)));
        assert!(is_permanent(&OpenAIError::InvalidArgument("no model".to_string())));

        // Server errors arrive with no type or code; rate limits are transient.
        assert!(!is_permanent(&api_error(None, None)));
        assert!(!is_permanent(&api_error(Some("rate_limit_exceeded"), None)));
    }

    /// Answers every connection with `status` and a JSON `body`, counting
    /// the requests it saw.
    async fn stub_server(status: &'static str, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                while !request_complete(&request) {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);

                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}/v1"), hits)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_not_retried() {
        let (api_base, hits) = stub_server(
            "401 Unauthorized",
            r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","param":null,"code":"invalid_api_key"}}"#,
        )
        .await;
        let config = LlmConfig {
            api_base,
            max_attempts: 3,
            request_timeout_secs: 10,
            ..LlmConfig::default()
        };
        let renderer = OpenAiScriptRenderer::new(config, "sk-wrong").unwrap();
        let speakers = speakers_from_config(&VoicesConfig::default());

        let started = std::time::Instant::now();
        let err = renderer.render("Intro", "Some lesson.", &speakers).await.unwrap_err();

        assert!(matches!(err, LessoncastError::OpenAI(OpenAIError::ApiError(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_fill_prompt() {
        let speakers = speakers_from_config(&VoicesConfig::default());
        let prompt = fill_prompt("{host} & {guest} on {title}: {content}", &speakers, "T", "C");
        assert_eq!(prompt, "Alex & Sam on T: C");
    }

    #[tokio::test]
    async fn test_static_renderer_parses_transcript() {
        let speakers = speakers_from_config(&VoicesConfig::default());
        let renderer = StaticScriptRenderer::new("Alex: Hello.\nSam: Hi.");
        let script = renderer.render("t", "ignored", &speakers).await.unwrap();
        assert_eq!(script.len(), 2);
    }

    #[tokio::test]
    async fn test_static_renderer_rejects_garbage() {
        let speakers = speakers_from_config(&VoicesConfig::default());
        let renderer = StaticScriptRenderer::new("");
        assert!(renderer.render("t", "c", &speakers).await.is_err());
    }
}
