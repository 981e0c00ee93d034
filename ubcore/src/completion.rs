//! Contract with the language-model side of the assistant.

use crate::conversation::{ContinuationRef, HistoryEntry};
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use thiserror::Error;

/// A generated reply plus whatever the provider wants back on the next turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub continuation: Option<ContinuationRef>,
}

/// Expected provider failures. None of these is shown to the remote chat;
/// the caller answers with a fallback text instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("completion provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("completion provider is rate limiting requests")]
    RateLimited,
    #[error("completion provider returned an empty response")]
    EmptyResponse,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn generate_reply(&self, history: &[HistoryEntry]) -> Result<Completion, CompletionError>;
}

const DEFAULT_FALLBACK_REPLIES: &[&str] = &[
    "Can't talk right now.",
    "Busy, later.",
    "Not now.",
    "Give me a minute.",
    "Let's pick this up later.",
];

/// Canned replies used whenever a completion fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackTable {
    replies: Vec<String>,
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self {
            replies: DEFAULT_FALLBACK_REPLIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FallbackTable {
    /// Blank entries are dropped; an empty table falls back to the defaults.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies: Vec<String> = replies
            .into_iter()
            .map(Into::into)
            .filter(|r| !r.trim().is_empty())
            .collect();
        if replies.is_empty() {
            Self::default()
        } else {
            Self { replies }
        }
    }

    pub fn pick(&self) -> &str {
        self.replies
            .choose(&mut rand::rng())
            .map(String::as_str)
            .unwrap_or(DEFAULT_FALLBACK_REPLIES[0])
    }

    pub fn contains(&self, text: &str) -> bool {
        self.replies.iter().any(|r| r == text)
    }

    /// The text to send for a completion result: the generated reply, or a
    /// fallback when the provider failed or produced only whitespace.
    pub fn resolve(&self, result: &Result<Completion, CompletionError>) -> String {
        match result {
            Ok(completion) if !completion.text.trim().is_empty() => completion.text.clone(),
            _ => self.pick().to_string(),
        }
    }
}
