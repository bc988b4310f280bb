//! Lessoncast Core Library
//!
//! Turns lesson text into a two-speaker audio episode: redundant side-notes
//! are deduplicated, the lesson is rendered into a dialogue script, the
//! script is chunked and synthesized, and the audio is assembled into a WAV
//! artifact recorded in a manifest.

pub mod chunker;
pub mod config;
pub mod container;
pub mod dedup;
pub mod document;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod renderer;
pub mod script;
pub mod similarity;
pub mod synthesis;

pub use chunker::{CharRateEstimator, Chunk, ChunkLimits, DialogueChunker, DurationEstimator};
pub use config::Config;
pub use container::{AudioArtifact, AudioFormat, Transcoder, WavHeader, assemble_wav, write_artifact};
pub use dedup::{DedupDecision, DedupOutcome, DedupStats, Deduplicator};
pub use document::{Block, BlockKind, Document};
pub use error::{EngineError, LessoncastError, Result};
pub use manifest::{JsonManifestStore, Manifest, ManifestEntry, ManifestStore, MemoryManifestStore};
pub use pipeline::{
    DocumentFailure, Pipeline, PipelineCallback, PipelineEvent, RunReport, output_filename,
};
pub use renderer::{OpenAiScriptRenderer, ScriptRenderer, StaticScriptRenderer};
pub use script::{DialogueScript, Speaker, Utterance};
pub use synthesis::gemini::GeminiSynthesisEngine;
pub use synthesis::{
    RetryPolicy, SynthesisEngine, SynthesisOrchestrator, SynthesisRequest, SynthesisResponse,
    SynthesisResult,
};
