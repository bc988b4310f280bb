//! Two-speaker dialogue scripts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::config::{SpeakerConfig, VoicesConfig};
use crate::error::{LessoncastError, Result};

/// A declared speaker and the voice profile it is synthesized with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaker {
    pub name: String,
    pub voice: String,
}

impl From<&SpeakerConfig> for Speaker {
    fn from(config: &SpeakerConfig) -> Self {
        Self {
            name: config.name.clone(),
            voice: config.voice.clone(),
        }
    }
}

/// The fixed pair of speakers of every script.
pub fn speakers_from_config(voices: &VoicesConfig) -> [Speaker; 2] {
    [Speaker::from(&voices.host), Speaker::from(&voices.guest)]
}

/// One spoken line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    /// Index into the script's speaker pair.
    pub speaker: usize,
    pub text: String,
}

impl Utterance {
    pub fn new(speaker: usize, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// A non-empty sequence of utterances by two declared speakers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueScript {
    speakers: [Speaker; 2],
    utterances: Vec<Utterance>,
}

/// `Name: text`, tolerating markdown emphasis around the name.
static SPEAKER_LINE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[*_]*([^:*_]{1,40}?)[*_]*\s*:[*_]*\s*(.*)$").ok());

impl DialogueScript {
    /// Build a script, rejecting empty input and undeclared speakers.
    pub fn new(speakers: [Speaker; 2], utterances: Vec<Utterance>) -> Result<Self> {
        if utterances.is_empty() {
            return Err(LessoncastError::InvalidScript(
                "script has no utterances".to_string(),
            ));
        }
        if let Some(bad) = utterances.iter().find(|u| u.speaker >= speakers.len()) {
            return Err(LessoncastError::InvalidScript(format!(
                "utterance refers to undeclared speaker #{}",
                bad.speaker
            )));
        }
        if let Some(empty) = utterances.iter().position(|u| u.text.trim().is_empty()) {
            return Err(LessoncastError::InvalidScript(format!(
                "utterance {} is empty",
                empty
            )));
        }

        Ok(Self {
            speakers,
            utterances,
        })
    }

    /// Parse `Name: text` transcript lines.
    ///
    /// Lines without a speaker prefix continue the previous utterance, and
    /// anything before the first speaker line is ignored. A prefix that looks
    /// like a speaker label but names neither declared speaker is an error.
    pub fn parse(speakers: [Speaker; 2], text: &str) -> Result<Self> {
        let mut utterances: Vec<Utterance> = Vec::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let labelled = SPEAKER_LINE_RE
                .as_ref()
                .and_then(|re| re.captures(line))
                .map(|caps| (caps[1].trim().to_string(), caps[2].trim().to_string()));

            if let Some((name, spoken)) = labelled {
                if let Some(index) = speakers
                    .iter()
                    .position(|s| s.name.eq_ignore_ascii_case(&name))
                {
                    // The text may start on the following line.
                    utterances.push(Utterance::new(index, spoken));
                    continue;
                }
                if looks_like_speaker_label(&name) && !utterances.is_empty() {
                    return Err(LessoncastError::InvalidScript(format!(
                        "unknown speaker '{}' (expected '{}' or '{}')",
                        name, speakers[0].name, speakers[1].name
                    )));
                }
            }

            if let Some(last) = utterances.last_mut() {
                if !last.text.is_empty() {
                    last.text.push(' ');
                }
                last.text.push_str(line);
            }
        }

        utterances.retain(|u| !u.text.trim().is_empty());
        Self::new(speakers, utterances)
    }

    pub fn speakers(&self) -> &[Speaker; 2] {
        &self.speakers
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn char_count(&self) -> usize {
        self.utterances.iter().map(Utterance::char_count).sum()
    }

    pub fn speaker_name(&self, index: usize) -> &str {
        self.speakers
            .get(index)
            .map(|s| s.name.as_str())
            .unwrap_or("Unknown")
    }

    /// Render back to `Name: text` lines.
    pub fn to_transcript(&self) -> String {
        transcript(&self.speakers, &self.utterances)
    }
}

/// `Name: text` lines for any run of utterances.
pub fn transcript(speakers: &[Speaker; 2], utterances: &[Utterance]) -> String {
    utterances
        .iter()
        .map(|u| {
            let name = speakers
                .get(u.speaker)
                .map(|s| s.name.as_str())
                .unwrap_or("Unknown");
            format!("{}: {}", name, u.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Short capitalised prefixes ("Narrator", "Host 2") read as speaker labels;
/// longer ones are ordinary sentences that happen to contain a colon.
fn looks_like_speaker_label(name: &str) -> bool {
    name.split_whitespace().count() <= 2 && name.chars().next().is_some_and(char::is_uppercase)
}
