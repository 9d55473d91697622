//! Sentence-window chunking of prose.
//!
//! Text is split into sentences at `.`, `!` or `?` followed by whitespace and a
//! capital letter. Sentences are then accumulated greedily into windows of at most
//! `target_words` words, and each new window is seeded with the trailing sentences
//! of the previous one (up to `overlap_words` words) so that context carries across
//! chunk boundaries.
//!
//! When the text has no recognizable sentence punctuation at all the chunker falls
//! back to fixed word windows that advance by `target_words - overlap_words`.
//!
//! # Example
//!
//! ```
//! use sift_context::text::{Chunker, ChunkingConfig};
//!
//! let chunker = Chunker::new(
//!     ChunkingConfig::default()
//!         .with_target_words(6)
//!         .with_overlap_words(2),
//! );
//! let units = chunker.chunk(
//!     "Sentence one. Sentence two. Sentence three. Sentence four.",
//!     "notes.txt",
//! );
//! assert_eq!(units.len(), 2);
//! assert!(units[1].text.starts_with("Sentence three."));
//! ```
//!
//! A single sentence longer than `target_words` is emitted whole rather than cut
//! mid-sentence, so a chunk can exceed the target by at most the length of the
//! longest sentence.

use crate::unit::{Attributes, ContentCategory, ContentUnit, Scalar};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Sentence-ending punctuation followed by whitespace and an uppercase letter.
static SENTENCE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([.!?]+)\s+\p{Lu}").expect("boundary pattern is valid"));

const TERMINAL_PUNCTUATION: [char; 3] = ['.', '!', '?'];

/// Chunk sizing, in words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Upper bound on words per chunk (exceeded only by a single long sentence)
    pub target_words: usize,
    /// Words carried from the end of one chunk into the next
    pub overlap_words: usize,
    /// Sentences with fewer words are treated as noise
    pub min_sentence_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_words: 800,
            overlap_words: 100,
            min_sentence_words: 2,
        }
    }
}

impl ChunkingConfig {
    pub fn with_target_words(mut self, words: usize) -> Self {
        self.target_words = words;
        self
    }

    pub fn with_overlap_words(mut self, words: usize) -> Self {
        self.overlap_words = words;
        self
    }

    pub fn with_min_sentence_words(mut self, words: usize) -> Self {
        self.min_sentence_words = words;
        self
    }

    /// Checks `0 < overlap_words < target_words` style constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.target_words == 0 {
            return Err("target_words must be greater than zero".to_string());
        }
        if self.overlap_words >= self.target_words {
            return Err(format!(
                "overlap_words ({}) must be smaller than target_words ({})",
                self.overlap_words, self.target_words
            ));
        }
        Ok(())
    }
}

/// How a chunk was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    Sentence,
    WordWindow,
}

impl ChunkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkMode::Sentence => "sentence",
            ChunkMode::WordWindow => "word_window",
        }
    }
}

/// Splits prose into overlapping [`ContentUnit`]s of category `prose_chunk`.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    /// Creates a chunker. An overlap that is not smaller than the target is
    /// clamped so that every window advances.
    pub fn new(mut config: ChunkingConfig) -> Self {
        config.target_words = config.target_words.max(1);
        if config.overlap_words >= config.target_words {
            config.overlap_words = config.target_words - 1;
        }
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunks `text`. Empty or whitespace-only input yields no units.
    pub fn chunk(&self, text: &str, source_file: &str) -> Vec<ContentUnit> {
        let normalized = WHITESPACE.replace_all(text.trim(), " ");
        if normalized.is_empty() {
            return Vec::new();
        }

        let windows = match self.usable_sentences(&normalized) {
            Some(sentences) => self
                .sentence_windows(&sentences)
                .into_iter()
                .map(|(text, sentence_count)| (text, sentence_count, ChunkMode::Sentence))
                .collect::<Vec<_>>(),
            None => self
                .word_windows(&normalized)
                .into_iter()
                .map(|text| (text, 0, ChunkMode::WordWindow))
                .collect(),
        };

        windows
            .into_iter()
            .enumerate()
            .map(|(sequence_index, (text, sentence_count, mode))| {
                let mut attributes = Attributes::new();
                attributes.insert("word_count".into(), Scalar::from(word_count(&text)));
                attributes.insert("char_count".into(), Scalar::from(text.chars().count()));
                attributes.insert("sentence_count".into(), Scalar::from(sentence_count));
                attributes.insert("chunk_mode".into(), Scalar::from(mode.as_str()));
                ContentUnit::new(
                    text,
                    ContentCategory::ProseChunk,
                    source_file,
                    sequence_index,
                    attributes,
                )
            })
            .collect()
    }

    /// Splits whitespace-normalized text into candidate sentences.
    pub fn split_sentences<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut sentences = Vec::new();
        let mut start = 0;
        for captures in SENTENCE_BOUNDARY.captures_iter(text) {
            let Some(punctuation) = captures.get(1) else {
                continue;
            };
            let sentence = text[start..punctuation.end()].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = punctuation.end();
        }
        let rest = text[start..].trim();
        if !rest.is_empty() {
            sentences.push(rest);
        }
        sentences
    }

    /// Sentences kept for windowing, or `None` when the text has no sentence punctuation.
    ///
    /// Scripts that end sentences with other marks (e.g. `。`) land in the word-window
    /// fallback.
    fn usable_sentences<'a>(&self, text: &'a str) -> Option<Vec<&'a str>> {
        let candidates = self.split_sentences(text);
        if !candidates
            .iter()
            .any(|s| s.ends_with(TERMINAL_PUNCTUATION))
        {
            return None;
        }

        let kept: Vec<&str> = candidates
            .iter()
            .copied()
            .filter(|s| word_count(s) >= self.config.min_sentence_words)
            .collect();
        if kept.is_empty() {
            Some(candidates)
        } else {
            Some(kept)
        }
    }

    /// Greedy sentence windows; returns each window's text and sentence count.
    fn sentence_windows(&self, sentences: &[&str]) -> Vec<(String, usize)> {
        let target = self.config.target_words;
        let overlap = self.config.overlap_words;

        let mut windows = Vec::new();
        let mut window: Vec<&str> = Vec::new();
        let mut window_words = 0;
        // Leading sentences of `window` carried over from the previous chunk
        let mut seeded = 0;

        for sentence in sentences {
            let words = word_count(sentence);
            if window.len() > seeded && window_words + words > target {
                windows.push((window.join(" "), window.len()));

                // Carry trailing sentences, never the whole window
                let mut carry = Vec::new();
                let mut carry_words = 0;
                for previous in window.iter().skip(1).rev() {
                    let previous_words = word_count(previous);
                    if carry_words + previous_words > overlap {
                        break;
                    }
                    carry.push(*previous);
                    carry_words += previous_words;
                }
                carry.reverse();

                seeded = carry.len();
                window = carry;
                window_words = carry_words;
            }
            window.push(sentence);
            window_words += words;
        }

        if window.len() > seeded {
            windows.push((window.join(" "), window.len()));
        }
        windows
    }

    /// Fixed word windows advancing by `target - overlap` words.
    fn word_windows(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split(' ').filter(|w| !w.is_empty()).collect();
        let step = self.config.target_words - self.config.overlap_words;

        let mut windows = Vec::new();
        let mut start = 0;
        while start < words.len() {
            let end = (start + self.config.target_words).min(words.len());
            windows.push(words[start..end].join(" "));
            if end == words.len() {
                break;
            }
            start += step;
        }
        windows
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
