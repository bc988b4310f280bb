//! Configuration module for loading TOML config files.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working configuration and a partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::LessoncastError;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dedup: DedupConfig,
    pub chunking: ChunkingConfig,
    pub synthesis: SynthesisConfig,
    pub voices: VoicesConfig,
    pub audio: AudioConfig,
    pub llm: LlmConfig,
    pub output: OutputConfig,
}

/// Side-note deduplication thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Overlap at or above which a side-note is removed.
    pub high_threshold: f64,
    /// Per-admonition overrides of `high_threshold`.
    pub label_thresholds: BTreeMap<String, f64>,
    /// Overlap below which a side-note is kept verbatim.
    pub low_threshold: f64,
    /// Sentence-level cutoff used when condensing.
    pub sentence_threshold: f64,
    /// Condensed side-notes shorter than this are removed instead.
    pub min_condensed_chars: usize,
    /// Main blocks considered on each side of a side-note.
    pub context_window: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.75,
            label_thresholds: BTreeMap::from([("tip".to_string(), 0.70), ("info".to_string(), 0.70)]),
            low_threshold: 0.40,
            sentence_threshold: 0.15,
            min_condensed_chars: 40,
            context_window: 2,
        }
    }
}

impl DedupConfig {
    /// Removal threshold for a side-note with the given admonition label.
    pub fn high_for(&self, label: &str) -> f64 {
        self.label_thresholds
            .get(label)
            .copied()
            .unwrap_or(self.high_threshold)
    }
}

/// Dialogue chunking limits, all in seconds of estimated speech.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chars_per_minute: f64,
    pub target_seconds: f64,
    pub max_seconds: f64,
    pub min_seconds: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chars_per_minute: 900.0,
            target_seconds: 300.0,
            max_seconds: 360.0,
            min_seconds: 60.0,
        }
    }
}

/// Text-to-speech engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub api_base: String,
    pub model: String,
    /// Engine-side token ceiling per request.
    pub hard_token_limit: u32,
    /// Headroom kept below `hard_token_limit` at preflight.
    pub safety_margin: u32,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Chunks synthesized at the same time.
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash-preview-tts".to_string(),
            hard_token_limit: 8192,
            safety_margin: 512,
            max_attempts: 5,
            base_delay_ms: 1000,
            concurrency: 1,
            request_timeout_secs: 300,
            connect_timeout_secs: 30,
        }
    }
}

impl SynthesisConfig {
    /// Largest token count a chunk may have at preflight.
    pub fn token_budget(&self) -> u32 {
        self.hard_token_limit.saturating_sub(self.safety_margin)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// A named speaker bound to an engine voice profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerConfig {
    pub name: String,
    pub voice: String,
}

/// The two podcast voices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicesConfig {
    pub host: SpeakerConfig,
    pub guest: SpeakerConfig,
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            host: SpeakerConfig {
                name: "Alex".to_string(),
                voice: "Kore".to_string(),
            },
            guest: SpeakerConfig {
                name: "Sam".to_string(),
                voice: "Charon".to_string(),
            },
        }
    }
}

/// PCM format produced by the engine and written to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

/// Script renderer (chat completion) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub model: String,
    pub max_tokens: u32,
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
    /// Prompt with `{host}`, `{guest}`, `{title}` and `{content}` placeholders.
    pub prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 8000,
            max_attempts: 3,
            request_timeout_secs: 180,
            prompt: DEFAULT_SCRIPT_PROMPT.to_string(),
        }
    }
}

/// Where artifacts and the manifest go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub manifest: PathBuf,
    /// Prefix used for the manifest `url` field, e.g. `/audio`.
    pub url_prefix: Option<String>,
    /// Transcode WAV to MP3 with ffmpeg after assembly.
    pub transcode: bool,
    pub mp3_bitrate: String,
    /// ffmpeg executable used when `transcode` is on.
    pub ffmpeg: PathBuf,
    /// Documents with less deduplicated text than this are rejected.
    pub min_document_chars: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("static/audio"),
            manifest: PathBuf::from("static/audio/manifest.json"),
            url_prefix: Some("/audio".to_string()),
            transcode: false,
            mp3_bitrate: "128k".to_string(),
            ffmpeg: PathBuf::from("ffmpeg"),
            min_document_chars: 200,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LessoncastError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            LessoncastError::Config(format!(
                "Failed to read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, LessoncastError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String, LessoncastError> {
        toml::to_string_pretty(self)
            .map_err(|e| LessoncastError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), LessoncastError> {
        let d = &self.dedup;
        let highs = std::iter::once(d.high_threshold).chain(d.label_thresholds.values().copied());
        for high in highs {
            if !(0.0..=1.0).contains(&high) || high < d.low_threshold {
                return Err(LessoncastError::Config(format!(
                    "dedup high threshold {} must be within [low_threshold, 1.0]",
                    high
                )));
            }
        }
        if !(0.0..=1.0).contains(&d.low_threshold) {
            return Err(LessoncastError::Config(format!(
                "dedup low_threshold {} must be within [0, 1]",
                d.low_threshold
            )));
        }
        if !(0.0..=1.0).contains(&d.sentence_threshold) {
            return Err(LessoncastError::Config(format!(
                "dedup sentence_threshold {} must be within [0, 1]",
                d.sentence_threshold
            )));
        }

        let c = &self.chunking;
        if !(c.chars_per_minute.is_finite() && c.chars_per_minute > 0.0) {
            return Err(LessoncastError::Config(
                "chunking chars_per_minute must be a positive finite number".to_string(),
            ));
        }
        if !(0.0 < c.min_seconds
            && c.min_seconds <= c.target_seconds
            && c.target_seconds <= c.max_seconds
            && c.max_seconds.is_finite())
        {
            return Err(LessoncastError::Config(format!(
                "chunking limits must satisfy 0 < min ({}) <= target ({}) <= max ({})",
                c.min_seconds, c.target_seconds, c.max_seconds
            )));
        }

        let s = &self.synthesis;
        if s.max_attempts == 0 {
            return Err(LessoncastError::Config(
                "synthesis max_attempts must be at least 1".to_string(),
            ));
        }
        if s.concurrency == 0 {
            return Err(LessoncastError::Config(
                "synthesis concurrency must be at least 1".to_string(),
            ));
        }
        if s.safety_margin >= s.hard_token_limit {
            return Err(LessoncastError::Config(format!(
                "synthesis safety_margin {} leaves no room under hard_token_limit {}",
                s.safety_margin, s.hard_token_limit
            )));
        }

        let v = &self.voices;
        if v.host.name.trim().is_empty() || v.guest.name.trim().is_empty() {
            return Err(LessoncastError::Config("speaker names cannot be empty".to_string()));
        }
        if v.host.name.eq_ignore_ascii_case(&v.guest.name) {
            return Err(LessoncastError::Config(format!(
                "host and guest must be distinct speakers, both are '{}'",
                v.host.name
            )));
        }

        let a = &self.audio;
        if a.sample_rate == 0 || a.channels == 0 || a.bits_per_sample == 0 || a.bits_per_sample % 8 != 0 {
            return Err(LessoncastError::Config(format!(
                "unsupported audio format: {} Hz, {} channel(s), {} bits",
                a.sample_rate, a.channels, a.bits_per_sample
            )));
        }

        Ok(())
    }
}

/// Default configuration embedded in the binary.
pub fn default_config() -> Config {
    Config::default()
}

const DEFAULT_SCRIPT_PROMPT: &str = r#"You are writing the script for a two-person educational podcast episode.

HOSTS:
- {host}: the lead presenter who walks through the lesson
- {guest}: a curious co-host who asks clarifying questions and adds practical examples

LESSON TITLE: {title}

LESSON CONTENT:
{content}

SCRIPT RULES:
- Cover every concept in the lesson content, in order
- Passages marked [NEW INFO] are asides that add information not in the main text; weave them in naturally
- Do not repeat the same point twice
- Keep turns short and conversational, usually one to four sentences
- Do not invent facts that are not in the lesson content

CRITICAL OUTPUT RULES:
- Output ONLY dialogue lines in the form "Name: spoken words"
- Use only the names {host} and {guest}
- Do NOT include scene directions, sound effects, or stage actions
- Do NOT include any text in parentheses or brackets
- Do NOT include asterisks for emphasis or any markdown formatting
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(default_config().validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.chunking.target_seconds, 300.0);
        assert_eq!(config.audio.sample_rate, 24_000);
        assert_eq!(config.voices.host.name, "Alex");
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_str(
            r#"
            [chunking]
            target_seconds = 120.0
            max_seconds = 150.0

            [voices.guest]
            name = "Riley"
            voice = "Puck"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.target_seconds, 120.0);
        assert_eq!(config.chunking.min_seconds, 60.0);
        assert_eq!(config.voices.guest.name, "Riley");
        assert_eq!(config.voices.host.voice, "Kore");
    }

    #[test]
    fn test_rejects_inverted_chunk_limits() {
        let result = Config::from_str("[chunking]\ntarget_seconds = 500.0\n");
        assert!(matches!(result, Err(LessoncastError::Config(_))));
    }

    #[test]
    fn test_rejects_non_finite_chunking_values() {
        for toml in [
            "[chunking]\nmax_seconds = inf\n",
            "[chunking]\nmin_seconds = nan\n",
            "[chunking]\nchars_per_minute = inf\n",
            "[chunking]\nchars_per_minute = nan\n",
        ] {
            let result = Config::from_str(toml);
            assert!(matches!(result, Err(LessoncastError::Config(_))), "{toml}");
        }
    }

    #[test]
    fn test_rejects_sentence_threshold_out_of_range() {
        let result = Config::from_str("[dedup]\nsentence_threshold = 1.5\n");
        assert!(matches!(result, Err(LessoncastError::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_speakers() {
        let result = Config::from_str("[voices.guest]\nname = \"alex\"\nvoice = \"Puck\"\n");
        assert!(matches!(result, Err(LessoncastError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let result = Config::from_str("[synthesis]\nmax_attempts = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_dedup_defaults() {
        let dedup = DedupConfig::default();
        assert_eq!(dedup.high_threshold, 0.75);
        assert_eq!(dedup.low_threshold, 0.40);
        assert_eq!(dedup.sentence_threshold, 0.15);
        assert_eq!(dedup.min_condensed_chars, 40);
        assert_eq!(dedup.context_window, 2);
    }

    #[test]
    fn test_label_threshold_override() {
        let config = default_config();
        assert_eq!(config.dedup.high_for("tip"), 0.70);
        assert_eq!(config.dedup.high_for("warning"), 0.75);
    }

    #[test]
    fn test_token_budget() {
        let config = default_config();
        assert_eq!(config.synthesis.token_budget(), 8192 - 512);
    }

    #[test]
    fn test_toml_round_trip_preserves_values() {
        let config = default_config();
        let text = config.to_toml().unwrap();
        let parsed = Config::from_str(&text).unwrap();
        assert_eq!(parsed.synthesis.model, config.synthesis.model);
        assert_eq!(parsed.dedup.label_thresholds, config.dedup.label_thresholds);
    }
}
