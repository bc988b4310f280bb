//! End-to-end document processing: dedup, render, chunk, synthesize,
//! assemble, write, record.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::chunker::{DialogueChunker, total_duration};
use crate::config::Config;
use crate::container::{AudioFormat, Transcoder, assemble_wav, write_artifact};
use crate::dedup::{DedupStats, Deduplicator, render_for_prompt};
use crate::document::Document;
use crate::error::{LessoncastError, Result};
use crate::manifest::{Manifest, ManifestEntry, ManifestStore, public_url};
use crate::renderer::ScriptRenderer;
use crate::script::{Speaker, speakers_from_config};
use crate::synthesis::{RetryPolicy, SynthesisEngine, SynthesisOrchestrator};

/// Callback for pipeline events.
pub type PipelineCallback = Box<dyn Fn(PipelineEvent) + Send + Sync>;

/// Progress reported while documents are processed.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Processing of a document begins.
    DocumentStart { id: String, chars: usize },
    /// Redundant side-notes were removed or condensed.
    DedupComplete { id: String, stats: DedupStats },
    /// The dialogue script is ready.
    ScriptRendered { id: String, utterances: usize },
    /// The script was split for synthesis.
    ChunksPlanned {
        id: String,
        chunks: usize,
        total_duration: Duration,
    },
    /// One chunk's audio arrived.
    ChunkSynthesized {
        id: String,
        index: usize,
        tokens: u32,
        attempts: u32,
    },
    /// The final artifact is on disk.
    ArtifactWritten { id: String, path: PathBuf, size: u64 },
    /// The document was abandoned; nothing was written for it.
    DocumentFailed { id: String, error: String },
}

/// A document that could not be generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Entries produced by this run, also merged into the store.
    pub generated: Manifest,
    pub failed: Vec<DocumentFailure>,
    /// How many generated documents already had a manifest entry.
    pub replaced: usize,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// File name for a document's artifact: unsafe characters become `_`.
pub fn output_filename(document_id: &str) -> String {
    let sanitized: String = document_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let truncated: String = sanitized.trim_matches('_').chars().take(80).collect();
    if truncated.is_empty() {
        "lesson.wav".to_string()
    } else {
        format!("{}.wav", truncated)
    }
}

/// Runs documents through every stage with injected renderer and engine.
pub struct Pipeline {
    config: Config,
    speakers: [Speaker; 2],
    deduplicator: Deduplicator,
    chunker: DialogueChunker,
    renderer: Arc<dyn ScriptRenderer>,
    engine: Arc<dyn SynthesisEngine>,
    retry: Option<RetryPolicy>,
    callback: Option<PipelineCallback>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        renderer: Arc<dyn ScriptRenderer>,
        engine: Arc<dyn SynthesisEngine>,
    ) -> Self {
        Self {
            speakers: speakers_from_config(&config.voices),
            deduplicator: Deduplicator::new(config.dedup.clone()),
            chunker: DialogueChunker::from_config(&config.chunking),
            config,
            renderer,
            engine,
            retry: None,
            callback: None,
        }
    }

    /// Set a callback for pipeline events.
    pub fn with_callback(mut self, callback: PipelineCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Override the retry policy derived from `[synthesis]`.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn emit_event(&self, event: PipelineEvent) {
        if let Some(ref callback) = self.callback {
            callback(event);
        }
    }

    fn orchestrator(&self) -> SynthesisOrchestrator {
        let orchestrator = SynthesisOrchestrator::new(
            Arc::clone(&self.engine),
            self.speakers.clone(),
            &self.config.synthesis,
        );
        match self.retry {
            Some(retry) => orchestrator.with_retry(retry),
            None => orchestrator,
        }
    }

    /// Produce the artifact for one document and describe it.
    ///
    /// Either a complete artifact is written or nothing is.
    pub async fn run_document(&self, document: &Document) -> Result<ManifestEntry> {
        let id = document.id.clone();
        let min = self.config.output.min_document_chars;

        self.emit_event(PipelineEvent::DocumentStart {
            id: id.clone(),
            chars: document.char_count(),
        });

        if document.is_empty() {
            return Err(LessoncastError::InputTooShort { id, chars: 0, min });
        }

        let outcome = self.deduplicator.run(document);
        self.emit_event(PipelineEvent::DedupComplete {
            id: id.clone(),
            stats: outcome.stats.clone(),
        });

        let chars = outcome.document.char_count();
        if chars < min {
            return Err(LessoncastError::InputTooShort { id, chars, min });
        }

        let content = render_for_prompt(&outcome.document);
        let script = self.renderer.render(&id, &content, &self.speakers).await?;
        self.emit_event(PipelineEvent::ScriptRendered {
            id: id.clone(),
            utterances: script.len(),
        });

        let chunks = self.chunker.chunk(&script);
        self.emit_event(PipelineEvent::ChunksPlanned {
            id: id.clone(),
            chunks: chunks.len(),
            total_duration: total_duration(&chunks),
        });

        let results = self
            .orchestrator()
            .synthesize_all(&chunks, |result| {
                self.emit_event(PipelineEvent::ChunkSynthesized {
                    id: id.clone(),
                    index: result.chunk_index,
                    tokens: result.tokens,
                    attempts: result.attempts,
                })
            })
            .await?;

        let artifact = assemble_wav(AudioFormat::from(self.config.audio), &results)?;
        let mut path = self.config.output.directory.join(output_filename(&id));
        let mut size = write_artifact(&path, &artifact.bytes)?;

        if self.config.output.transcode {
            let transcoder = Transcoder::new(&self.config.output.mp3_bitrate)
                .with_program(&self.config.output.ffmpeg);
            match transcoder.transcode(&path).await {
                Ok(mp3) => path = mp3,
                Err(e) => {
                    // A document either yields its final artifact or nothing.
                    if let Err(cleanup) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %cleanup, "cannot remove WAV");
                    }
                    return Err(e);
                }
            }
            size = fs::metadata(&path)?.len();
        }

        self.emit_event(PipelineEvent::ArtifactWritten {
            id: id.clone(),
            path: path.clone(),
            size,
        });

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(ManifestEntry {
            output_path: path.display().to_string(),
            url: self
                .config
                .output
                .url_prefix
                .as_deref()
                .map(|prefix| public_url(prefix, &file_name)),
            size_bytes: size,
            token_count: results.iter().map(|r| u64::from(r.tokens)).sum(),
            chunk_count: results.len(),
            duration_seconds: artifact.duration().as_secs_f64(),
            generated_at: Utc::now(),
        })
    }

    /// Process documents one after another and merge the successes into
    /// `store`. A failed document is reported and skipped.
    pub async fn run(&self, documents: &[Document], store: &dyn ManifestStore) -> Result<RunReport> {
        // Fail before spending any synthesis quota if the manifest is unreadable.
        let existing = store.load()?;
        let mut report = RunReport::default();

        for document in documents {
            match self.run_document(document).await {
                Ok(entry) => {
                    info!(document = %document.id, path = %entry.output_path, "document generated");
                    if existing.contains_key(&document.id) {
                        report.replaced += 1;
                    }
                    report.generated.insert(document.id.clone(), entry);
                }
                Err(e) => {
                    error!(document = %document.id, error = %e, "document failed");
                    self.emit_event(PipelineEvent::DocumentFailed {
                        id: document.id.clone(),
                        error: e.to_string(),
                    });
                    report.failed.push(DocumentFailure {
                        id: document.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.generated.is_empty() {
            store.merge(&report.generated)?;
        }

        Ok(report)
    }
}
