//! Sentence segmentation of the streamed assistant answer, and final-answer cleanup.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?。]+").expect("valid sentence pattern"));
static LINE_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\r\n]+").expect("valid line-break pattern"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Sentences shorter than this (after trimming) are never emitted on their own.
const MIN_SENTENCE_CHARS: usize = 10;

/// Tracks which complete sentences of the accumulated answer were already emitted.
#[derive(Debug, Default)]
pub struct SentenceTracker {
    sent: HashSet<String>,
    counter: u64,
}

impl SentenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete sentences of `text` not emitted before, each with a fresh id (starting at 1).
    /// The trailing unterminated remainder is ignored until it is terminated.
    pub fn take_new(&mut self, text: &str) -> Vec<(u64, String)> {
        let mut fresh = Vec::new();
        let mut start = 0;
        for boundary in SENTENCE_END.find_iter(text) {
            let sentence = text[start..boundary.end()].trim();
            start = boundary.end();
            if sentence.chars().count() <= MIN_SENTENCE_CHARS || !sentence.chars().any(char::is_alphanumeric) {
                continue;
            }
            if self.sent.insert(sentence.to_string()) {
                self.counter += 1;
                fresh.push((self.counter, sentence.to_string()));
            }
        }
        fresh
    }

    pub fn reset(&mut self) {
        self.sent.clear();
        self.counter = 0;
    }
}

/// Collapse newlines (including literal `\n` escapes) and runs of whitespace to single spaces.
pub fn normalize_answer(text: &str) -> String {
    let text = text.replace("\\n", " ");
    let text = LINE_BREAKS.replace_all(&text, " ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growing_text_emits_each_sentence_once() {
        let mut tracker = SentenceTracker::new();
        assert_eq!(tracker.take_new("Hello there."), vec![(1, "Hello there.".to_string())]);
        assert_eq!(
            tracker.take_new("Hello there. How are you?"),
            vec![(2, "How are you?".to_string())]
        );
        assert!(tracker.take_new("Hello there. How are you? I am").is_empty());
    }

    #[test]
    fn short_or_symbol_only_sentences_are_skipped() {
        let mut tracker = SentenceTracker::new();
        assert!(tracker.take_new("Ok. Sure!").is_empty());
        assert!(tracker.take_new("... --- ***!!! ").is_empty());
    }

    #[test]
    fn reset_restarts_ids() {
        let mut tracker = SentenceTracker::new();
        tracker.take_new("This is one sentence.");
        tracker.reset();
        assert_eq!(tracker.take_new("This is one sentence."), vec![(1, "This is one sentence.".to_string())]);
    }

    #[test]
    fn normalize_collapses_whitespace_and_escaped_newlines() {
        assert_eq!(normalize_answer("Hi!\r\n\nHow\\nare   you?\t"), "Hi! How are you?");
    }
}
