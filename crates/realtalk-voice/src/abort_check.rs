//! Background abort check for speculative generations.
//!
//! The session publishes each partial transcription into a single-slot `watch` channel;
//! the worker wakes on change, skips repeats, and asks the pipeline whether the running
//! generation still matches what the user is saying.

use crate::pipeline::PipelineManager;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Run until the sending side is dropped.
pub fn spawn_abort_check(mut latest: watch::Receiver<String>, pipeline: Arc<PipelineManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_checked = String::new();
        while latest.changed().await.is_ok() {
            let text = latest.borrow_and_update().clone();
            if text.is_empty() || text == last_checked {
                continue;
            }
            debug!(target: "realtalk::session", "Abort check triggered by partial: '{}'", text);
            pipeline.check_abort(&text, "partial transcription drifted");
            last_checked = text;
        }
    })
}
