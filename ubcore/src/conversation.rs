//! Bounded per-chat conversational memory.
//!
//! Each chat the assistant has seen gets a [`ConversationState`]: an `active`
//! flag, an ordered history and the continuation reference returned by the
//! last completion. History behaves as a FIFO ring with one pinned slot: when
//! a system entry leads the history it survives every eviction.
//!
//! This module only stores state. Deciding *who* may arm or disarm a chat is
//! the listener's job.

use crate::types::ChatKey;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque token a completion provider hands back to keep its reasoning
/// context across turns.
pub type ContinuationRef = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationRef>,
}

impl HistoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            continuation: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Upper bound on history length, pinned system entry included.
    pub max_history: usize,
    /// Fixed leading system entry for every chat.
    pub system_prompt: Option<String>,
    /// Whether `reset` keeps the leading system entry.
    pub reset_keeps_system: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history: 11,
            system_prompt: None,
            reset_keeps_system: true,
        }
    }
}

impl MemoryConfig {
    /// The effective ceiling. Two slots is the floor: a pinned entry plus the
    /// message that was just appended.
    pub fn ceiling(&self) -> usize {
        self.max_history.max(2)
    }

    fn seed_history(&self) -> Vec<HistoryEntry> {
        self.system_prompt
            .as_ref()
            .map(|prompt| vec![HistoryEntry::system(prompt.clone())])
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub chat: ChatKey,
    pub active: bool,
    pub history: Vec<HistoryEntry>,
    pub continuation: Option<ContinuationRef>,
    pub last_activity: DateTime<Utc>,
}

impl ConversationState {
    fn new(chat: ChatKey, config: &MemoryConfig) -> Self {
        Self {
            chat,
            active: false,
            history: config.seed_history(),
            continuation: None,
            last_activity: Utc::now(),
        }
    }

    /// True when index 0 holds a system entry that eviction must skip.
    pub fn has_pinned_entry(&self) -> bool {
        has_pinned_entry(&self.history)
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

fn has_pinned_entry(history: &[HistoryEntry]) -> bool {
    matches!(history.first(), Some(entry) if entry.role == Role::System)
}

/// Evicts the oldest non-pinned entries until `history.len() <= ceiling`.
pub fn bound_history(history: &mut Vec<HistoryEntry>, ceiling: usize) {
    let keep_from = usize::from(has_pinned_entry(history));
    let excess = history.len().saturating_sub(ceiling);
    let evictable = history.len().saturating_sub(keep_from);
    let evict = excess.min(evictable);
    if evict > 0 {
        history.drain(keep_from..keep_from + evict);
    }
}

/// All conversation state for one account.
#[derive(Debug, Default)]
pub struct ConversationStore {
    config: MemoryConfig,
    chats: HashMap<ChatKey, ConversationState>,
}

impl ConversationStore {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            chats: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Returns the chat's state, creating it on first sight.
    pub fn observe(&mut self, chat: ChatKey) -> &mut ConversationState {
        let config = &self.config;
        self.chats
            .entry(chat)
            .or_insert_with(|| ConversationState::new(chat, config))
    }

    pub fn get(&self, chat: ChatKey) -> Option<&ConversationState> {
        self.chats.get(&chat)
    }

    pub fn is_active(&self, chat: ChatKey) -> bool {
        self.chats.get(&chat).is_some_and(|state| state.active)
    }

    /// Arms the assistant for `chat` and starts it from a clean history.
    ///
    /// Returns `false` when the chat was already armed; nothing changes then.
    pub fn arm(&mut self, chat: ChatKey) -> bool {
        if self.is_active(chat) {
            return false;
        }
        self.reset(chat);
        let state = self.observe(chat);
        state.active = true;
        state.touch();
        true
    }

    /// Returns `false` when the chat was not armed.
    pub fn disarm(&mut self, chat: ChatKey) -> bool {
        let state = self.observe(chat);
        if !state.active {
            return false;
        }
        state.active = false;
        state.touch();
        true
    }

    /// Clears history and the continuation reference. `active` is untouched.
    pub fn reset(&mut self, chat: ChatKey) {
        let keep_system = self.config.reset_keeps_system;
        let state = self.observe(chat);
        if keep_system && state.has_pinned_entry() {
            state.history.truncate(1);
        } else {
            state.history.clear();
        }
        state.continuation = None;
        state.touch();
    }

    /// Appends an entry, then evicts from the front (skipping a pinned system
    /// entry) until the ceiling holds.
    ///
    /// An assistant entry carries the completion's result, so its
    /// `continuation` replaces the stored reference, clearing it when `None`.
    /// Other roles leave the stored reference alone.
    pub fn append_and_bound(
        &mut self,
        chat: ChatKey,
        role: Role,
        content: impl Into<String>,
        continuation: Option<ContinuationRef>,
    ) {
        let ceiling = self.config.ceiling();
        let state = self.observe(chat);
        state.history.push(HistoryEntry::new(role, content));
        if role == Role::Assistant {
            state.continuation = continuation;
        }
        let before = state.history.len();
        bound_history(&mut state.history, ceiling);
        if state.history.len() < before {
            debug!(
                target: "Conversation",
                "Chat {chat}: evicted {} oldest entries",
                before - state.history.len()
            );
        }
        state.touch();
    }

    /// A copy of the history for an outgoing request. The stored continuation
    /// reference is attached to the last entry when that entry is the
    /// assistant's. The stored reference itself is not modified.
    pub fn snapshot_for_request(&self, chat: ChatKey) -> Vec<HistoryEntry> {
        let Some(state) = self.chats.get(&chat) else {
            return self.config.seed_history();
        };
        let mut snapshot = state.history.clone();
        if let (Some(last), Some(continuation)) = (snapshot.last_mut(), &state.continuation) {
            if last.role == Role::Assistant {
                last.continuation = Some(continuation.clone());
            }
        }
        snapshot
    }

    /// Records an inbound message and returns the history to send with it.
    ///
    /// The snapshot is taken before the message is stored, so the previous
    /// assistant turn still carries the continuation reference; the message
    /// then goes both into the store and onto the request, which is bounded
    /// with the same rule as the stored history.
    pub fn prepare_request(&mut self, chat: ChatKey, content: &str) -> Vec<HistoryEntry> {
        let mut request = self.snapshot_for_request(chat);
        self.append_and_bound(chat, Role::User, content, None);
        request.push(HistoryEntry::user(content));
        bound_history(&mut request, self.config.ceiling());
        request
    }

    pub fn active_count(&self) -> usize {
        self.chats.values().filter(|state| state.active).count()
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }
}
