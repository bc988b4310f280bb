//! Text-to-speech orchestration.
//!
//! Every chunk goes through a token preflight, a synthesis call wrapped in
//! exponential backoff, and response validation. Chunks may run with
//! bounded concurrency; results always come back in chunk order, and the
//! first terminal failure abandons every request still in flight.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chunker::Chunk;
use crate::config::SynthesisConfig;
use crate::error::{EngineError, LessoncastError, Result};
use crate::script::Speaker;

/// One speaker turn inside a synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerTurn {
    pub speaker: String,
    pub text: String,
}

/// Everything the engine needs to voice one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub chunk_index: usize,
    pub turns: Vec<SpeakerTurn>,
    /// Both declared speakers with their voice profiles.
    pub speakers: [Speaker; 2],
}

impl SynthesisRequest {
    pub fn from_chunk(chunk: &Chunk, speakers: &[Speaker; 2]) -> Self {
        let turns = chunk
            .utterances
            .iter()
            .map(|u| SpeakerTurn {
                speaker: speakers
                    .get(u.speaker)
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                text: u.text.clone(),
            })
            .collect();

        Self {
            chunk_index: chunk.index,
            turns,
            speakers: speakers.clone(),
        }
    }

    /// `Name: text` lines.
    pub fn transcript(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("{}: {}", t.speaker, t.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Raw engine output for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisResponse {
    /// Little-endian PCM samples, no container.
    pub pcm: Vec<u8>,
    /// Tokens billed for the call.
    pub tokens: u32,
}

/// Validated audio for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisResult {
    pub chunk_index: usize,
    pub pcm: Vec<u8>,
    pub tokens: u32,
    /// Synthesis attempts it took, including the successful one.
    pub attempts: u32,
}

/// External text-to-speech service.
#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    /// Token count of the request as the engine's tokenizer sees it.
    async fn count_tokens(&self, request: &SynthesisRequest) -> std::result::Result<u32, EngineError>;

    /// Voice the request with both speakers bound to their voice profiles.
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
    ) -> std::result::Result<SynthesisResponse, EngineError>;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retry number `retry` (1-based): base, 2x base, 4x base...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run
    /// out. Returns the value or the last error, with the attempts used.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        mut operation: F,
    ) -> std::result::Result<(T, u32), (EngineError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, EngineError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if !e.is_retryable() => {
                    warn!(operation = label, attempt, error = %e, "permanent failure, not retrying");
                    return Err((e, attempt));
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(operation = label, attempt, error = %e, "retries exhausted");
                    return Err((e, attempt));
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Drives an engine over a document's chunks.
pub struct SynthesisOrchestrator {
    engine: Arc<dyn SynthesisEngine>,
    speakers: [Speaker; 2],
    retry: RetryPolicy,
    token_budget: u32,
    concurrency: usize,
}

impl SynthesisOrchestrator {
    pub fn new(engine: Arc<dyn SynthesisEngine>, speakers: [Speaker; 2], config: &SynthesisConfig) -> Self {
        Self {
            engine,
            speakers,
            retry: RetryPolicy::new(config.max_attempts, config.base_delay()),
            token_budget: config.token_budget(),
            concurrency: config.concurrency.max(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn token_budget(&self) -> u32 {
        self.token_budget
    }

    /// Preflight, synthesize and validate a single chunk.
    pub async fn synthesize_chunk(&self, chunk: &Chunk) -> Result<SynthesisResult> {
        let request = &SynthesisRequest::from_chunk(chunk, &self.speakers);
        let engine = &self.engine;

        let (tokens, _) = self
            .retry
            .run("count_tokens", move || engine.count_tokens(request))
            .await
            .map_err(|(source, attempts)| LessoncastError::Synthesis {
                chunk: chunk.index,
                attempts,
                source,
            })?;

        if tokens > self.token_budget {
            return Err(LessoncastError::ChunkTooLarge {
                chunk: chunk.index,
                tokens,
                budget: self.token_budget,
            });
        }
        debug!(chunk = chunk.index, tokens, budget = self.token_budget, "token preflight passed");

        let (response, attempts) = self
            .retry
            .run("synthesize", move || engine.synthesize(request))
            .await
            .map_err(|(source, attempts)| LessoncastError::Synthesis {
                chunk: chunk.index,
                attempts,
                source,
            })?;

        if response.pcm.is_empty() {
            return Err(LessoncastError::EmptyAudio { chunk: chunk.index });
        }

        info!(
            chunk = chunk.index,
            bytes = response.pcm.len(),
            tokens = response.tokens,
            attempts,
            "chunk synthesized"
        );

        Ok(SynthesisResult {
            chunk_index: chunk.index,
            pcm: response.pcm,
            tokens: response.tokens,
            attempts,
        })
    }

    /// Synthesize every chunk, at most `concurrency` at a time.
    ///
    /// `progress` sees results as they complete; the returned vector is in
    /// chunk order. The first failure, whichever chunk it comes from, drops
    /// every request still in flight and is returned; no partial result set
    /// escapes.
    pub async fn synthesize_all<P>(&self, chunks: &[Chunk], mut progress: P) -> Result<Vec<SynthesisResult>>
    where
        P: FnMut(&SynthesisResult),
    {
        let mut pending = stream::iter(chunks)
            .map(move |chunk| self.synthesize_chunk(chunk))
            .buffer_unordered(self.concurrency);

        let mut results = Vec::with_capacity(chunks.len());
        while let Some(outcome) = pending.next().await {
            let result = outcome?;
            progress(&result);
            results.push(result);
        }

        results.sort_by_key(|r| r.chunk_index);
        Ok(results)
    }
}

pub mod gemini {
    //! Gemini-style multi-speaker TTS over HTTP.

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    use super::{SynthesisEngine, SynthesisRequest, SynthesisResponse};
    use crate::config::SynthesisConfig;
    use crate::error::{EngineError, LessoncastError, Result};

    pub struct GeminiSynthesisEngine {
        client: reqwest::Client,
        api_base: String,
        model: String,
        api_key: String,
    }

    impl GeminiSynthesisEngine {
        pub fn new(config: &SynthesisConfig, api_key: impl Into<String>) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_secs))
                .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                .build()
                .map_err(|e| LessoncastError::Config(format!("Failed to create HTTP client: {}", e)))?;

            Ok(Self {
                client,
                api_base: config.api_base.trim_end_matches('/').to_string(),
                model: config.model.clone(),
                api_key: api_key.into(),
            })
        }

        fn endpoint(&self, method: &str) -> String {
            format!("{}/models/{}:{}", self.api_base, self.model, method)
        }

        async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
            &self,
            method: &str,
            body: &B,
        ) -> std::result::Result<R, EngineError> {
            let response = self
                .client
                .post(self.endpoint(method))
                .header("x-goog-api-key", &self.api_key)
                .json(body)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(EngineError::Status {
                    code: status.as_u16(),
                    message: body.chars().take(300).collect(),
                });
            }

            response
                .json::<R>()
                .await
                .map_err(|e| EngineError::InvalidResponse(format!("undecodable body: {}", e)))
        }
    }

    fn transport_error(e: reqwest::Error) -> EngineError {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            EngineError::Transport {
                message: e.to_string(),
                timeout: e.is_timeout(),
            }
        } else {
            EngineError::Other(e.to_string())
        }
    }

    #[derive(Debug, Serialize)]
    pub(crate) struct Content {
        parts: Vec<Part>,
    }

    #[derive(Debug, Serialize)]
    pub(crate) struct Part {
        text: String,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct CountTokensBody {
        contents: Vec<Content>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct GenerateBody {
        contents: Vec<Content>,
        generation_config: GenerationConfig,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct GenerationConfig {
        response_modalities: Vec<String>,
        speech_config: SpeechConfig,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct SpeechConfig {
        multi_speaker_voice_config: MultiSpeakerVoiceConfig,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct MultiSpeakerVoiceConfig {
        speaker_voice_configs: Vec<SpeakerVoiceConfig>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct SpeakerVoiceConfig {
        speaker: String,
        voice_config: VoiceConfig,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct VoiceConfig {
        prebuilt_voice_config: PrebuiltVoiceConfig,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct PrebuiltVoiceConfig {
        voice_name: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct CountTokensResponse {
        total_tokens: u32,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct GenerateResponse {
        #[serde(default)]
        candidates: Vec<Candidate>,
        usage_metadata: Option<UsageMetadata>,
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct Candidate {
        content: Option<CandidateContent>,
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct CandidateContent {
        #[serde(default)]
        parts: Vec<CandidatePart>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct CandidatePart {
        inline_data: Option<InlineData>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct InlineData {
        #[serde(default)]
        mime_type: String,
        data: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct UsageMetadata {
        #[serde(default)]
        total_token_count: u32,
    }

    fn prompt_contents(request: &SynthesisRequest) -> Vec<Content> {
        let text = format!(
            "TTS the following conversation between {} and {}:\n{}",
            request.speakers[0].name,
            request.speakers[1].name,
            request.transcript()
        );
        vec![Content {
            parts: vec![Part { text }],
        }]
    }

    pub(crate) fn generate_body(request: &SynthesisRequest) -> GenerateBody {
        GenerateBody {
            contents: prompt_contents(request),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    multi_speaker_voice_config: MultiSpeakerVoiceConfig {
                        speaker_voice_configs: request
                            .speakers
                            .iter()
                            .map(|s| SpeakerVoiceConfig {
                                speaker: s.name.clone(),
                                voice_config: VoiceConfig {
                                    prebuilt_voice_config: PrebuiltVoiceConfig {
                                        voice_name: s.voice.clone(),
                                    },
                                },
                            })
                            .collect(),
                    },
                },
            },
        }
    }

    /// Concatenate every inline audio part. A response without audio decodes
    /// to empty PCM, which the orchestrator rejects.
    pub(crate) fn decode_generate_response(
        response: GenerateResponse,
    ) -> std::result::Result<SynthesisResponse, EngineError> {
        let mut pcm = Vec::new();
        let parts = response
            .candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.inline_data.as_ref());

        for inline in parts {
            if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/") {
                continue;
            }
            let bytes = STANDARD
                .decode(inline.data.as_bytes())
                .map_err(|e| EngineError::InvalidResponse(format!("bad base64 audio: {}", e)))?;
            pcm.extend_from_slice(&bytes);
        }

        Ok(SynthesisResponse {
            pcm,
            tokens: response
                .usage_metadata
                .map(|u| u.total_token_count)
                .unwrap_or(0),
        })
    }

    #[async_trait::async_trait]
    impl SynthesisEngine for GeminiSynthesisEngine {
        async fn count_tokens(
            &self,
            request: &SynthesisRequest,
        ) -> std::result::Result<u32, EngineError> {
            let body = CountTokensBody {
                contents: prompt_contents(request),
            };
            let response: CountTokensResponse = self.post("countTokens", &body).await?;
            Ok(response.total_tokens)
        }

        async fn synthesize(
            &self,
            request: &SynthesisRequest,
        ) -> std::result::Result<SynthesisResponse, EngineError> {
            let response: GenerateResponse =
                self.post("generateContent", &generate_body(request)).await?;
            decode_generate_response(response)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::VoicesConfig;
        use crate::script::speakers_from_config;

        fn request() -> SynthesisRequest {
            SynthesisRequest {
                chunk_index: 0,
                turns: vec![super::super::SpeakerTurn {
                    speaker: "Alex".to_string(),
                    text: "Hello.".to_string(),
                }],
                speakers: speakers_from_config(&VoicesConfig::default()),
            }
        }

        #[test]
        fn test_generate_body_shape() {
            let body = serde_json::to_value(generate_body(&request())).unwrap();
            assert_eq!(body["generationConfig"]["responseModalities"][0], "AUDIO");
            let voices = &body["generationConfig"]["speechConfig"]["multiSpeakerVoiceConfig"]
                ["speakerVoiceConfigs"];
            assert_eq!(voices[0]["speaker"], "Alex");
            assert_eq!(voices[0]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"], "Kore");
            assert_eq!(voices[1]["speaker"], "Sam");
            let text = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
            assert!(text.ends_with("Alex: Hello."));
        }

        #[test]
        fn test_decode_inline_audio() {
            let json = serde_json::json!({
                "candidates": [{"content": {"parts": [
                    {"inlineData": {"mimeType": "audio/L16;rate=24000", "data": STANDARD.encode([1u8, 2, 3, 4])}}
                ]}}],
                "usageMetadata": {"totalTokenCount": 321}
            });
            let response: GenerateResponse = serde_json::from_value(json).unwrap();
            let decoded = decode_generate_response(response).unwrap();
            assert_eq!(decoded.pcm, vec![1, 2, 3, 4]);
            assert_eq!(decoded.tokens, 321);
        }

        #[test]
        fn test_decode_without_audio_is_empty() {
            let response: GenerateResponse =
                serde_json::from_value(serde_json::json!({"candidates": []})).unwrap();
            assert!(decode_generate_response(response).unwrap().pcm.is_empty());
        }

        #[test]
        fn test_decode_bad_base64_is_permanent() {
            let json = serde_json::json!({
                "candidates": [{"content": {"parts": [{"inlineData": {"data": "%%%"}}]}}]
            });
            let response: GenerateResponse = serde_json::from_value(json).unwrap();
            let err = decode_generate_response(response).unwrap_err();
            assert!(!err.is_retryable());
        }
    }
}
