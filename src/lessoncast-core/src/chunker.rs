//! Splits a dialogue into synthesis-sized chunks.
//!
//! Chunk sizes are driven by an estimated speaking duration. Boundaries only
//! fall between utterances and prefer speaker changes, so no synthesis call
//! has to pick up a voice in the middle of its turn.

use std::time::Duration;
use tracing::debug;

use crate::config::ChunkingConfig;
use crate::script::{DialogueScript, Speaker, Utterance, transcript};

/// Estimates how long an utterance takes to speak.
pub trait DurationEstimator: Send + Sync {
    fn estimate(&self, utterance: &Utterance) -> Duration;
}

/// Duration proportional to character count at a fixed speaking rate.
#[derive(Debug, Clone, Copy)]
pub struct CharRateEstimator {
    chars_per_minute: f64,
}

impl CharRateEstimator {
    pub fn new(chars_per_minute: f64) -> Self {
        Self { chars_per_minute }
    }
}

impl Default for CharRateEstimator {
    fn default() -> Self {
        Self::new(ChunkingConfig::default().chars_per_minute)
    }
}

impl DurationEstimator for CharRateEstimator {
    fn estimate(&self, utterance: &Utterance) -> Duration {
        if self.chars_per_minute.is_nan() || self.chars_per_minute <= 0.0 {
            return Duration::ZERO;
        }
        seconds(utterance.char_count() as f64 * 60.0 / self.chars_per_minute)
    }
}

/// `Duration` from fractional seconds, saturating instead of panicking on
/// values it cannot represent. NaN and negatives become zero.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(if value > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

/// Duration bounds for chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    /// Preferred size; exceeded only to reach a speaker change.
    pub target: Duration,
    /// Hard ceiling; a split is forced before it is crossed.
    pub max: Duration,
    /// A final chunk shorter than this is merged backward when it fits.
    pub min: Duration,
}

impl From<&ChunkingConfig> for ChunkLimits {
    fn from(config: &ChunkingConfig) -> Self {
        Self {
            target: seconds(config.target_seconds),
            max: seconds(config.max_seconds),
            min: seconds(config.min_seconds),
        }
    }
}

/// A contiguous run of utterances sent to the engine in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub utterances: Vec<Utterance>,
    pub estimated_duration: Duration,
}

impl Chunk {
    pub fn char_count(&self) -> usize {
        self.utterances.iter().map(Utterance::char_count).sum()
    }

    /// `Name: text` lines for this chunk.
    pub fn transcript(&self, speakers: &[Speaker; 2]) -> String {
        transcript(speakers, &self.utterances)
    }
}

pub struct DialogueChunker {
    estimator: Box<dyn DurationEstimator>,
    limits: ChunkLimits,
}

impl DialogueChunker {
    pub fn new(estimator: Box<dyn DurationEstimator>, limits: ChunkLimits) -> Self {
        Self { estimator, limits }
    }

    /// Character-rate chunker from configuration.
    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(
            Box::new(CharRateEstimator::new(config.chars_per_minute)),
            ChunkLimits::from(config),
        )
    }

    pub fn limits(&self) -> ChunkLimits {
        self.limits
    }

    pub fn estimate(&self, utterance: &Utterance) -> Duration {
        self.estimator.estimate(utterance)
    }

    /// Partition the script into chunks.
    pub fn chunk(&self, script: &DialogueScript) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current: Vec<Utterance> = Vec::new();
        let mut current_duration = Duration::ZERO;
        let mut last_speaker: Option<usize> = None;

        for utterance in script.utterances() {
            let duration = self.estimator.estimate(utterance);

            if !current.is_empty() {
                let projected = current_duration + duration;
                let new_turn = last_speaker != Some(utterance.speaker);

                let split = if projected > self.limits.target && new_turn {
                    true
                } else if projected > self.limits.max {
                    debug!(
                        chunk = chunks.len(),
                        seconds = current_duration.as_secs_f64(),
                        "no speaker change before hard limit, forcing split"
                    );
                    true
                } else {
                    false
                };

                if split {
                    push_chunk(&mut chunks, std::mem::take(&mut current), current_duration);
                    current_duration = Duration::ZERO;
                }
            }

            current.push(utterance.clone());
            current_duration += duration;
            last_speaker = Some(utterance.speaker);
        }

        if !current.is_empty() {
            push_chunk(&mut chunks, current, current_duration);
        }

        self.merge_trailing(&mut chunks);
        chunks
    }

    /// Fold an undersized final chunk into its predecessor if the result
    /// stays within the hard limit.
    fn merge_trailing(&self, chunks: &mut Vec<Chunk>) {
        if chunks.len() < 2 {
            return;
        }
        let last_duration = chunks[chunks.len() - 1].estimated_duration;
        if last_duration >= self.limits.min {
            return;
        }
        let previous_duration = chunks[chunks.len() - 2].estimated_duration;
        if previous_duration + last_duration > self.limits.max {
            debug!(
                seconds = last_duration.as_secs_f64(),
                "short final chunk left unmerged, merge would exceed hard limit"
            );
            return;
        }

        if let Some(last) = chunks.pop() {
            if let Some(previous) = chunks.last_mut() {
                previous.utterances.extend(last.utterances);
                previous.estimated_duration += last.estimated_duration;
            }
        }
    }
}

fn push_chunk(chunks: &mut Vec<Chunk>, utterances: Vec<Utterance>, estimated_duration: Duration) {
    chunks.push(Chunk {
        index: chunks.len(),
        utterances,
        estimated_duration,
    });
}

/// Sum of the estimated durations of all chunks.
pub fn total_duration(chunks: &[Chunk]) -> Duration {
    chunks.iter().map(|c| c.estimated_duration).sum()
}
