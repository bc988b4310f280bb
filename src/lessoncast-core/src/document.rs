//! Lesson documents: ordered main-content blocks and side-notes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Kind of a document block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Lesson body, always kept.
    Main,
    /// Admonition-style aside (`note`, `tip`, `warning`, ...), a candidate
    /// for deduplication against nearby main content.
    SideNote { label: String },
}

/// A single block of text within a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
    /// Position in the source document, in order of appearance.
    pub position: usize,
    /// Set on side-notes that survived deduplication and carry new information.
    #[serde(default)]
    pub unique: bool,
}

impl Block {
    pub fn is_side_note(&self) -> bool {
        matches!(self.kind, BlockKind::SideNote { .. })
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// A lesson as an ordered sequence of blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Identity of the source, used as the manifest key.
    pub id: String,
    pub blocks: Vec<Block>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            blocks: Vec::new(),
        }
    }

    /// Append a main-content block.
    pub fn push_main(&mut self, text: impl Into<String>) {
        let position = self.blocks.len();
        self.blocks.push(Block {
            kind: BlockKind::Main,
            text: text.into(),
            position,
            unique: false,
        });
    }

    /// Append a side-note block with the given admonition label.
    pub fn push_side_note(&mut self, label: impl Into<String>, text: impl Into<String>) {
        let position = self.blocks.len();
        self.blocks.push(Block {
            kind: BlockKind::SideNote {
                label: label.into(),
            },
            text: text.into(),
            position,
            unique: false,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| b.text.trim().is_empty())
    }

    /// Total characters across all blocks.
    pub fn char_count(&self) -> usize {
        self.blocks.iter().map(Block::char_count).sum()
    }

    /// Main-content text joined with blank lines.
    pub fn main_text(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| !b.is_side_note())
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn side_note_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_side_note()).count()
    }

    /// Parse lesson Markdown/MDX into blocks.
    ///
    /// Docusaurus admonitions (`:::tip` ... `:::`) become side-notes; every
    /// other paragraph or heading becomes a main block. Front matter, code
    /// fences, import/export statements and standalone JSX tags are dropped.
    pub fn from_markdown(id: impl Into<String>, source: &str) -> Self {
        let mut document = Document::new(id);
        let mut paragraph: Vec<String> = Vec::new();
        let mut admonition: Option<(String, Vec<String>)> = None;
        let mut in_fence = false;

        for raw in skip_front_matter(source).lines() {
            let line = raw.trim();

            if line.starts_with("```") || line.starts_with("~~~") {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }

            if let Some(rest) = line.strip_prefix(":::") {
                let rest = rest.trim_start_matches(':').trim();
                if rest.is_empty() {
                    if let Some((label, body)) = admonition.take() {
                        let text = join_clean(&body);
                        if !text.is_empty() {
                            document.push_side_note(label, text);
                        }
                    }
                } else if admonition.is_none() {
                    flush_main(&mut document, &mut paragraph);
                    let label = rest
                        .split(|c: char| c.is_whitespace() || c == '[' || c == '{')
                        .next()
                        .unwrap_or("note")
                        .to_lowercase();
                    admonition = Some((label, Vec::new()));
                }
                continue;
            }

            if let Some((_, body)) = admonition.as_mut() {
                if !is_skippable(line) {
                    body.push(line.to_string());
                }
                continue;
            }

            if line.is_empty() {
                flush_main(&mut document, &mut paragraph);
                continue;
            }
            if is_skippable(line) {
                continue;
            }
            if line.starts_with('#') {
                flush_main(&mut document, &mut paragraph);
                paragraph.push(line.to_string());
                flush_main(&mut document, &mut paragraph);
                continue;
            }

            paragraph.push(line.to_string());
        }

        // An unterminated admonition still counts as a side-note.
        if let Some((label, body)) = admonition.take() {
            let text = join_clean(&body);
            if !text.is_empty() {
                document.push_side_note(label, text);
            }
        }
        flush_main(&mut document, &mut paragraph);

        document
    }
}

fn skip_front_matter(source: &str) -> &str {
    let trimmed = source.trim_start();
    let Some(rest) = trimmed.strip_prefix("---") else {
        return source;
    };
    match rest.find("\n---") {
        Some(end) => {
            let after = &rest[end + 4..];
            after.split_once('\n').map(|(_, body)| body).unwrap_or("")
        }
        None => source,
    }
}

fn is_skippable(line: &str) -> bool {
    line.starts_with("import ")
        || line.starts_with("export ")
        || (line.starts_with('<') && line.ends_with('>'))
}

fn flush_main(document: &mut Document, paragraph: &mut Vec<String>) {
    if paragraph.is_empty() {
        return;
    }
    let text = join_clean(paragraph);
    paragraph.clear();
    if !text.is_empty() {
        document.push_main(text);
    }
}

fn join_clean(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| strip_markup(line))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inline markup rewrites applied in order: images dropped, links reduced
/// to their text, list markers and inline tags removed.
static MARKUP_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"^(?:[-*+]|\d+[.)])\s+", ""),
        (r"!\[[^\]]*\]\([^)]*\)", ""),
        (r"\[([^\]]*)\]\([^)]*\)", "$1"),
        (r"</?[A-Za-z][^>]*>", ""),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Strip Markdown markup from one line, keeping the readable words.
fn strip_markup(line: &str) -> String {
    let mut line = line
        .trim_start_matches('#')
        .trim_start_matches('>')
        .trim()
        .to_string();
    for (re, replacement) in MARKUP_RULES.iter() {
        line = re.replace_all(&line, *replacement).to_string();
    }
    line.replace(['`', '*'], "")
        .replace("__", "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LESSON: &str = r#"---
title: Context Windows
sidebar_position: 2
---

import Tabs from '@theme/Tabs';

# Context Windows

The **context window** is the amount of text a model can see at once.
It includes your prompt and the [conversation history](./history.md).

:::tip Keep it short
Trim irrelevant files from the context before asking for changes.
:::

```bash
echo "not narrated"
```

- Large files consume tokens quickly.
- Summaries help.
"#;

    #[test]
    fn test_from_markdown_blocks() {
        let doc = Document::from_markdown("lesson-2", LESSON);
        assert_eq!(doc.id, "lesson-2");
        assert_eq!(doc.blocks.len(), 4);

        assert_eq!(doc.blocks[0].kind, BlockKind::Main);
        assert_eq!(doc.blocks[0].text, "Context Windows");

        assert_eq!(
            doc.blocks[1].text,
            "The context window is the amount of text a model can see at once. \
             It includes your prompt and the conversation history."
        );

        assert_eq!(
            doc.blocks[2].kind,
            BlockKind::SideNote {
                label: "tip".to_string()
            }
        );
        assert_eq!(
            doc.blocks[2].text,
            "Trim irrelevant files from the context before asking for changes."
        );

        assert_eq!(
            doc.blocks[3].text,
            "Large files consume tokens quickly. Summaries help."
        );
    }

    #[test]
    fn test_positions_are_sequential() {
        let doc = Document::from_markdown("x", LESSON);
        for (i, block) in doc.blocks.iter().enumerate() {
            assert_eq!(block.position, i);
        }
    }

    #[test]
    fn test_code_fence_is_dropped() {
        let doc = Document::from_markdown("x", LESSON);
        assert!(doc.blocks.iter().all(|b| !b.text.contains("not narrated")));
    }

    #[test]
    fn test_empty_source() {
        let doc = Document::from_markdown("empty", "");
        assert!(doc.is_empty());
        assert_eq!(doc.char_count(), 0);
    }

    #[test]
    fn test_main_text_excludes_side_notes() {
        let mut doc = Document::new("d");
        doc.push_main("First paragraph.");
        doc.push_side_note("note", "An aside.");
        doc.push_main("Second paragraph.");
        assert_eq!(doc.main_text(), "First paragraph.\n\nSecond paragraph.");
        assert_eq!(doc.side_note_count(), 1);
    }

    #[test]
    fn test_unterminated_admonition() {
        let doc = Document::from_markdown("d", ":::warning\nNever commit secrets to git.");
        assert_eq!(doc.blocks.len(), 1);
        assert!(doc.blocks[0].is_side_note());
    }
}
