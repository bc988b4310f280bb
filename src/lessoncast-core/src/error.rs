//! Error types for the lesson-to-audio pipeline.

use thiserror::Error;

/// Failure reported by a synthesis engine for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Connection reset, DNS failure, timeout and friends.
    #[error("transport error{}: {message}", timeout_suffix(.timeout))]
    Transport { message: String, timeout: bool },

    /// Non-success HTTP status from the engine.
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    /// The call succeeded but the payload broke the response contract.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

fn timeout_suffix(timeout: &bool) -> &'static str {
    if *timeout { " (timeout)" } else { "" }
}

impl EngineError {
    /// Whether another attempt may succeed.
    ///
    /// 429 and 5xx gateway/availability codes are transient, 400/401/403/404
    /// are permanent. Unknown statuses and unclassified errors are retried
    /// until attempts run out.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { .. } => true,
            EngineError::Status { code, .. } => !matches!(code, 400 | 401 | 403 | 404),
            EngineError::InvalidResponse(_) => false,
            EngineError::Other(_) => true,
        }
    }
}

#[derive(Error, Debug)]
pub enum LessoncastError {
    #[error("Document '{id}' is too short to narrate: {chars} chars (minimum {min})")]
    InputTooShort { id: String, chars: usize, min: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("OpenAI API error: {0}")]
    OpenAI(#[from] async_openai::error::OpenAIError),

    #[error("Script rendering failed for '{id}': {message}")]
    ScriptRender { id: String, message: String },

    #[error("Invalid dialogue script: {0}")]
    InvalidScript(String),

    #[error("Chunk {chunk} is too large: {tokens} tokens exceeds budget of {budget}")]
    ChunkTooLarge { chunk: usize, tokens: u32, budget: u32 },

    #[error("Synthesis of chunk {chunk} failed after {attempts} attempt(s): {source}")]
    Synthesis {
        chunk: usize,
        attempts: u32,
        #[source]
        source: EngineError,
    },

    #[error("Synthesis of chunk {chunk} returned no audio data")]
    EmptyAudio { chunk: usize },

    #[error("Audio assembly invariant violated: {0}")]
    Assembly(String),

    #[error("Transcoding failed: {0}")]
    Transcode(String),

    #[error("Manifest error: {0}")]
    Manifest(String),
}

impl LessoncastError {
    /// Only transient engine failures are worth retrying at a higher level.
    pub fn is_retryable(&self) -> bool {
        match self {
            LessoncastError::Synthesis { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LessoncastError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> EngineError {
        EngineError::Status {
            code,
            message: String::new(),
        }
    }

    #[test]
    fn test_transient_statuses_are_retryable() {
        for code in [429, 500, 503, 504] {
            assert!(status(code).is_retryable(), "{code} should be retryable");
        }
    }

    #[test]
    fn test_client_errors_are_permanent() {
        for code in [400, 401, 403, 404] {
            assert!(!status(code).is_retryable(), "{code} should be permanent");
        }
    }

    #[test]
    fn test_unknown_errors_are_retryable() {
        assert!(status(502).is_retryable());
        assert!(EngineError::Other("boom".into()).is_retryable());
        assert!(
            EngineError::Transport {
                message: "reset".into(),
                timeout: true
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_invalid_response_is_permanent() {
        assert!(!EngineError::InvalidResponse("no audio".into()).is_retryable());
    }

    #[test]
    fn test_transport_display_mentions_timeout() {
        let err = EngineError::Transport {
            message: "deadline elapsed".into(),
            timeout: true,
        };
        assert_eq!(err.to_string(), "transport error (timeout): deadline elapsed");
    }

    #[test]
    fn test_chunk_too_large_display() {
        let err = LessoncastError::ChunkTooLarge {
            chunk: 3,
            tokens: 9000,
            budget: 7680,
        };
        assert_eq!(
            err.to_string(),
            "Chunk 3 is too large: 9000 tokens exceeds budget of 7680"
        );
        assert!(!err.is_retryable());
    }
}
