use crate::error::ProviderFault;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

/// Stream of text fragments for a single provider attempt.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderFault>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// The user's utterance for this turn.
    pub text: String,
    pub session_id: String,
    /// Caller-chosen id; a UUID is assigned when absent.
    pub request_id: Option<String>,
    /// Prior turns, oldest first, excluding `text`.
    pub history: Vec<ChatTurn>,
    pub system_prompt: Option<String>,
}

impl GenerationRequest {
    pub fn new(text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// System prompt, history and the current utterance in provider order.
    pub fn messages(&self) -> Vec<ChatTurn> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = self.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(ChatTurn {
                role: Role::System,
                content: system.to_string(),
            });
        }
        messages.extend(self.history.iter().cloned());
        messages.push(ChatTurn::user(self.text.clone()));
        messages
    }
}

/// One provider attempt. Retries, cancellation and registry bookkeeping live in the client.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn open_stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderFault>;
}

/// Offline backend: answers every request with a fixed reply, word by word.
#[derive(Debug, Clone)]
pub struct PlaceholderBackend {
    reply: String,
}

impl Default for PlaceholderBackend {
    fn default() -> Self {
        Self::new("I can hear you, but no language model is configured yet. Set an API key to talk to me properly.")
    }
}

impl PlaceholderBackend {
    pub fn new(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }
}

#[async_trait]
impl LlmBackend for PlaceholderBackend {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn open_stream(&self, _request: &GenerationRequest) -> Result<FragmentStream, ProviderFault> {
        let mut fragments = Vec::new();
        for (i, word) in self.reply.split_whitespace().enumerate() {
            if i == 0 {
                fragments.push(Ok(word.to_string()));
            } else {
                fragments.push(Ok(format!(" {word}")));
            }
        }
        Ok(stream::iter(fragments).boxed())
    }
}
