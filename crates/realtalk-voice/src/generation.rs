//! One in-flight assistant response.
//!
//! Written by the LLM worker (text) and the synthesis worker (audio), read by the
//! session and the dispatcher. Once abortion has started the record only drains to nothing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct AnswerText {
    quick: String,
    final_part: String,
    quick_provided: bool,
}

#[derive(Debug)]
pub struct GenerationRecord {
    id: u64,
    request_id: String,
    prompt: String,
    quick_min_chars: usize,
    text: Mutex<AnswerText>,
    audio: Mutex<VecDeque<Vec<u8>>>,
    first_chunk_ready: AtomicBool,
    audio_quick_finished: AtomicBool,
    audio_final_finished: AtomicBool,
    llm_finished: AtomicBool,
    abortion_started: AtomicBool,
    tts_quick_allowed: AtomicBool,
    changes: watch::Sender<u64>,
}

impl GenerationRecord {
    pub fn new(id: u64, request_id: impl Into<String>, prompt: impl Into<String>, quick_min_chars: usize) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            id,
            request_id: request_id.into(),
            prompt: prompt.into(),
            quick_min_chars,
            text: Mutex::new(AnswerText::default()),
            audio: Mutex::new(VecDeque::new()),
            first_chunk_ready: AtomicBool::new(false),
            audio_quick_finished: AtomicBool::new(false),
            audio_final_finished: AtomicBool::new(false),
            llm_finished: AtomicBool::new(false),
            abortion_started: AtomicBool::new(false),
            tts_quick_allowed: AtomicBool::new(false),
            changes,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Recognized text the generation was started from.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    fn text(&self) -> MutexGuard<'_, AnswerText> {
        self.text.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn audio(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.audio.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Append a streamed fragment. Text goes to the quick answer until it reaches a
    /// sentence boundary, then everything else goes to the final answer.
    pub fn append_text(&self, fragment: &str) {
        if self.is_aborting() || fragment.is_empty() {
            return;
        }
        {
            let mut text = self.text();
            if text.quick_provided {
                text.final_part.push_str(fragment);
            } else {
                text.quick.push_str(fragment);
                if let Some(split) = quick_split_point(&text.quick, self.quick_min_chars) {
                    let rest = text.quick.split_off(split);
                    text.final_part.push_str(&rest);
                    text.quick_provided = true;
                }
            }
        }
        self.notify();
    }

    pub fn quick_answer(&self) -> String {
        self.text().quick.clone()
    }

    pub fn final_answer(&self) -> String {
        self.text().final_part.clone()
    }

    /// Quick and final text joined.
    pub fn full_answer(&self) -> String {
        let text = self.text();
        format!("{}{}", text.quick, text.final_part)
    }

    /// The quick answer ended at a sentence boundary before the stream finished.
    pub fn quick_answer_provided(&self) -> bool {
        self.text().quick_provided
    }

    /// A final segment exists and must be voiced after the quick answer.
    pub fn final_expected(&self) -> bool {
        let text = self.text();
        text.quick_provided && !text.final_part.trim().is_empty()
    }

    /// Queue synthesized audio. Refused once abortion has started.
    pub fn push_audio(&self, chunk: Vec<u8>) -> bool {
        {
            let mut audio = self.audio();
            if self.is_aborting() {
                return false;
            }
            audio.push_back(chunk);
        }
        self.first_chunk_ready.store(true, Ordering::SeqCst);
        self.notify();
        true
    }

    pub fn try_pop_audio(&self) -> Option<Vec<u8>> {
        let mut audio = self.audio();
        if self.is_aborting() {
            return None;
        }
        audio.pop_front()
    }

    pub fn pending_audio(&self) -> usize {
        self.audio().len()
    }

    /// Mark abortion started and drop queued audio. Returns `true` on the first call only.
    pub fn start_abort(&self) -> bool {
        let first = {
            let mut audio = self.audio();
            let first = !self.abortion_started.swap(true, Ordering::SeqCst);
            audio.clear();
            first
        };
        self.notify();
        first
    }

    pub fn is_aborting(&self) -> bool {
        self.abortion_started.load(Ordering::SeqCst)
    }

    /// Open the gate that lets synthesis begin.
    pub fn allow_quick_tts(&self) {
        if !self.tts_quick_allowed.swap(true, Ordering::SeqCst) {
            self.notify();
        }
    }

    pub fn is_quick_tts_allowed(&self) -> bool {
        self.tts_quick_allowed.load(Ordering::SeqCst)
    }

    pub fn first_chunk_ready(&self) -> bool {
        self.first_chunk_ready.load(Ordering::SeqCst)
    }

    pub fn mark_llm_finished(&self) {
        self.set(&self.llm_finished);
    }

    pub fn is_llm_finished(&self) -> bool {
        self.llm_finished.load(Ordering::SeqCst)
    }

    pub fn mark_audio_quick_finished(&self) {
        self.set(&self.audio_quick_finished);
    }

    pub fn is_audio_quick_finished(&self) -> bool {
        self.audio_quick_finished.load(Ordering::SeqCst)
    }

    pub fn mark_audio_final_finished(&self) {
        self.set(&self.audio_final_finished);
    }

    pub fn is_audio_final_finished(&self) -> bool {
        self.audio_final_finished.load(Ordering::SeqCst)
    }

    fn set(&self, flag: &AtomicBool) {
        if !flag.swap(true, Ordering::SeqCst) {
            self.notify();
        }
    }

    /// Wait until `ready` holds. Re-evaluated after every change to the record.
    pub async fn wait_for(&self, mut ready: impl FnMut(&Self) -> bool) {
        let mut changes = self.changes.subscribe();
        loop {
            if ready(self) {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。')
}

/// Byte offset just past the first terminator run that follows at least `min_chars`
/// characters and is itself followed by whitespace.
fn quick_split_point(text: &str, min_chars: usize) -> Option<usize> {
    let mut chars = text.char_indices().enumerate().peekable();
    while let Some((count, (_, c))) = chars.next() {
        if !is_terminator(c) || count < min_chars {
            continue;
        }
        let mut end = text.len();
        while let Some(&(_, (i, next))) = chars.peek() {
            if is_terminator(next) {
                chars.next();
                continue;
            }
            end = i;
            break;
        }
        if end == text.len() {
            return None;
        }
        if text[end..].starts_with(char::is_whitespace) || c == '。' {
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> GenerationRecord {
        GenerationRecord::new(1, "req-1", "hi", 12)
    }

    #[test]
    fn quick_answer_splits_at_first_sentence_boundary() {
        let r = record();
        r.append_text("Absolutely, here it is");
        assert!(!r.quick_answer_provided());
        r.append_text(".");
        assert!(!r.quick_answer_provided(), "boundary at end of buffer is not yet final");
        r.append_text(" And then some more.");
        assert!(r.quick_answer_provided());
        assert_eq!(r.quick_answer(), "Absolutely, here it is.");
        assert_eq!(r.final_answer(), " And then some more.");
        assert!(r.final_expected());
        assert_eq!(r.full_answer(), "Absolutely, here it is. And then some more.");
    }

    #[test]
    fn short_openers_and_decimals_do_not_split() {
        let r = record();
        r.append_text("Yes. It costs 3.50 dollars today! ");
        assert_eq!(r.quick_answer(), "Yes. It costs 3.50 dollars today!");
        assert_eq!(r.final_answer(), " ");
        assert!(!r.final_expected());
    }

    #[test]
    fn unterminated_answer_stays_quick() {
        let r = record();
        r.append_text("Hello");
        r.append_text(" world");
        r.mark_llm_finished();
        assert_eq!(r.quick_answer(), "Hello world");
        assert!(!r.final_expected());
    }

    #[test]
    fn abort_drains_and_refuses_audio() {
        let r = record();
        assert!(r.push_audio(vec![1, 2]));
        assert!(r.first_chunk_ready());
        assert!(r.start_abort());
        assert!(!r.start_abort());
        assert_eq!(r.pending_audio(), 0);
        assert!(!r.push_audio(vec![3, 4]));
        assert_eq!(r.try_pop_audio(), None);
        r.append_text("ignored");
        assert_eq!(r.full_answer(), "");
    }

    #[tokio::test]
    async fn wait_for_wakes_on_gate() {
        let r = std::sync::Arc::new(record());
        let waiter = {
            let r = r.clone();
            tokio::spawn(async move { r.wait_for(|r| r.is_quick_tts_allowed()).await })
        };
        tokio::task::yield_now().await;
        r.allow_quick_tts();
        waiter.await.unwrap();
    }
}
