//! Side-note deduplication against surrounding main content.
//!
//! Lessons repeat themselves on purpose: a tip restates the paragraph above
//! it, a warning echoes the one below. Spoken aloud that repetition is
//! tedious, so each side-note is scored against a bounded window of nearby
//! main content and removed, condensed to its unique sentences, or kept.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DedupConfig;
use crate::document::{Block, BlockKind, Document};
use crate::similarity::{extract_unique, score};

/// Outcome for a single side-note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DedupDecision {
    /// The surrounding content already says it.
    Remove,
    /// Partially redundant; only these sentences are new.
    Condense(String),
    /// Mostly new information.
    Keep,
}

/// A decision together with the evidence behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub position: usize,
    pub label: String,
    pub score: f64,
    pub decision: DedupDecision,
}

/// Counters for a deduplication pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub removed: usize,
    pub condensed: usize,
    pub kept: usize,
    pub chars_before: usize,
    pub chars_after: usize,
}

/// Result of [`Deduplicator::run`].
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub document: Document,
    pub decisions: Vec<DecisionRecord>,
    pub stats: DedupStats,
}

/// Applies the remove / condense / keep policy to every side-note.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Decide what to do with `side_note` given its local `context`.
    ///
    /// Returns the decision and the overlap score it was based on.
    pub fn decide(&self, label: &str, side_note: &str, context: &str) -> (DedupDecision, f64) {
        let overlap = score(side_note, context);

        let decision = if overlap >= self.config.high_for(label) {
            DedupDecision::Remove
        } else if overlap >= self.config.low_threshold {
            let unique = extract_unique(context, side_note, self.config.sentence_threshold);
            if unique.chars().count() < self.config.min_condensed_chars {
                DedupDecision::Remove
            } else if unique == side_note.trim() {
                DedupDecision::Keep
            } else {
                DedupDecision::Condense(unique)
            }
        } else {
            DedupDecision::Keep
        };

        (decision, overlap)
    }

    /// Main-content text within `context_window` main blocks of `index`.
    pub fn local_context(&self, document: &Document, index: usize) -> String {
        let window = self.config.context_window;

        let before = document.blocks[..index]
            .iter()
            .rev()
            .filter(|b| !b.is_side_note())
            .take(window)
            .collect::<Vec<_>>();
        let after = document.blocks[index + 1..]
            .iter()
            .filter(|b| !b.is_side_note())
            .take(window);

        before
            .into_iter()
            .rev()
            .chain(after)
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Produce the reduced document.
    ///
    /// Main blocks pass through untouched. Side-notes that already carry the
    /// `unique` tag from an earlier pass are not re-evaluated.
    pub fn run(&self, document: &Document) -> DedupOutcome {
        let mut output = Document::new(document.id.clone());
        let mut decisions = Vec::new();
        let mut stats = DedupStats {
            chars_before: document.char_count(),
            ..DedupStats::default()
        };

        for (index, block) in document.blocks.iter().enumerate() {
            let BlockKind::SideNote { label } = &block.kind else {
                output.blocks.push(block.clone());
                continue;
            };
            if block.unique {
                output.blocks.push(block.clone());
                continue;
            }

            let context = self.local_context(document, index);
            let (decision, overlap) = self.decide(label, &block.text, &context);
            debug!(
                document = %document.id,
                position = block.position,
                label = %label,
                score = overlap,
                decision = ?decision,
                "side-note evaluated"
            );

            match &decision {
                DedupDecision::Remove => stats.removed += 1,
                DedupDecision::Condense(text) => {
                    stats.condensed += 1;
                    output.blocks.push(Block {
                        text: text.clone(),
                        unique: true,
                        ..block.clone()
                    });
                }
                DedupDecision::Keep => {
                    stats.kept += 1;
                    output.blocks.push(Block {
                        unique: true,
                        ..block.clone()
                    });
                }
            }

            decisions.push(DecisionRecord {
                position: block.position,
                label: label.clone(),
                score: overlap,
                decision,
            });
        }

        stats.chars_after = output.char_count();
        DedupOutcome {
            document: output,
            decisions,
            stats,
        }
    }
}

/// Flatten a deduplicated document into renderer input.
///
/// Surviving side-notes are prefixed with `[NEW INFO]` so the prompt can
/// tell asides apart from the main narrative.
pub fn render_for_prompt(document: &Document) -> String {
    document
        .blocks
        .iter()
        .filter(|b| !b.text.trim().is_empty())
        .map(|b| {
            if b.is_side_note() {
                format!("[NEW INFO] {}", b.text)
            } else {
                b.text.clone()
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
