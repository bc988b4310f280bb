//! Token-set similarity between text spans.
//!
//! Text is lowercased, punctuation becomes whitespace, and tokens of three
//! characters or fewer are dropped before building the sets compared with
//! the Jaccard index.

use std::collections::HashSet;
use std::ops::Range;

/// Tokens this short carry no topical signal ("the", "and", "is").
const MIN_TOKEN_CHARS: usize = 4;

/// Sentence fragments shorter than this are not worth keeping on their own.
pub const MIN_SENTENCE_CHARS: usize = 20;

/// Normalized bag-of-words token set of `text`.
pub fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect()
}

/// Jaccard overlap of two token sets, `0.0` when either is empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Similarity score of two text spans in `[0, 1]`.
pub fn score(a: &str, b: &str) -> f64 {
    jaccard(&tokens(a), &tokens(b))
}

/// Whether `a` and `b` overlap by at least `threshold`.
pub fn similar(a: &str, b: &str, threshold: f64) -> bool {
    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    jaccard(&a, &b) >= threshold
}

/// Split text into sentences on `.`, `!` and `?`, dropping short fragments.
pub fn split_sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| sentence.chars().count() >= MIN_SENTENCE_CHARS)
        .collect()
}

/// Byte ranges of the sentences in `text`, each including its terminator
/// and trimmed of surrounding whitespace.
fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    for piece in text.split_inclusive(['.', '!', '?']) {
        let end = start + piece.len();
        let lead = piece.len() - piece.trim_start().len();
        let trail = piece.len() - piece.trim_end().len();
        if lead + trail < piece.len() {
            spans.push(start + lead..end - trail);
        }
        start = end;
    }
    spans
}

/// Keep only the sentences of `candidate` that `reference` does not already say.
///
/// Every sentence is scored against the whole reference text; those scoring
/// below `threshold` survive. Survivors are sliced out of `candidate` with
/// their own terminators. Neighbouring survivors keep the whitespace between
/// them and a gap left by a dropped sentence collapses to one space, so the
/// result is never longer than the trimmed candidate.
pub fn extract_unique(reference: &str, candidate: &str, threshold: f64) -> String {
    let reference = tokens(reference);

    let survivors = sentence_spans(candidate).into_iter().filter(|span| {
        let sentence = candidate[span.clone()]
            .trim_end_matches(['.', '!', '?'])
            .trim();
        sentence.chars().count() >= MIN_SENTENCE_CHARS
            && jaccard(&tokens(sentence), &reference) < threshold
    });

    let mut unique = String::new();
    let mut previous_end: Option<usize> = None;
    for span in survivors {
        if let Some(end) = previous_end {
            let gap = &candidate[end..span.start];
            if gap.trim().is_empty() {
                unique.push_str(gap);
            } else {
                unique.push(' ');
            }
        }
        unique.push_str(&candidate[span.clone()]);
        previous_end = Some(span.end);
    }
    unique
}
