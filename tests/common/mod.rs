#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use userbot_rust::ControlPlane;
use userbot_rust::provider::loopback::{LoopbackAccount, LoopbackProvider, SentReply};
use userbot_rust::session::AccountSession;
use userbot_rust::store::InMemoryCredentialStore;
use userbot_rust::ubcore::completion::{Completion, CompletionError, CompletionProvider};
use userbot_rust::ubcore::conversation::HistoryEntry;
use userbot_rust::ubcore::{AccountCredential, AccountKey, AppCredentials, ChatKey, IncomingMessage};

pub const PHONE: &str = "+15550000000";
pub const CODE: &str = "12345";
pub const PASSWORD: &str = "p@ss";

const POLL: Duration = Duration::from_millis(10);
const POLL_ROUNDS: usize = 500;

/// Answers every request with a fixed text and records what it was asked.
pub struct RecordingCompletion {
    reply: String,
    requests: Mutex<Vec<Vec<HistoryEntry>>>,
}

impl RecordingCompletion {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Vec<HistoryEntry>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for RecordingCompletion {
    async fn generate_reply(&self, history: &[HistoryEntry]) -> Result<Completion, CompletionError> {
        self.requests.lock().unwrap().push(history.to_vec());
        Ok(Completion {
            text: self.reply.clone(),
            continuation: None,
        })
    }
}

pub struct Harness {
    pub provider: LoopbackProvider,
    pub store: InMemoryCredentialStore,
    pub completion: Arc<RecordingCompletion>,
    pub plane: ControlPlane,
}

pub fn demo_provider() -> LoopbackProvider {
    let provider = LoopbackProvider::new();
    provider.register(LoopbackAccount::new(PHONE, CODE, "Alice").with_password(PASSWORD));
    provider.register(LoopbackAccount::new("+15550000001", "54321", "Bob"));
    provider
}

pub async fn harness_with(provider: LoopbackProvider, store: InMemoryCredentialStore) -> Harness {
    let completion = RecordingCompletion::replying("hi there");
    let plane = ControlPlane::builder()
        .with_connection_factory(Arc::new(provider.clone()))
        .with_credential_store(Arc::new(store.clone()))
        .with_completion_provider(completion.clone())
        .build()
        .await
        .unwrap();
    Harness {
        provider,
        store,
        completion,
        plane,
    }
}

pub async fn harness() -> Harness {
    harness_with(demo_provider(), InMemoryCredentialStore::new()).await
}

pub fn app() -> AppCredentials {
    AppCredentials::new(12345, "0123456789abcdef")
}

/// A credential for a registered account whose connection session already
/// exists on the provider.
pub fn seeded_credential(provider: &LoopbackProvider, phone: &str) -> AccountCredential {
    let account_key = AccountKey::from_phone(phone);
    provider.seed_session(account_key.as_str(), &account_key);
    AccountCredential {
        account_key: account_key.clone(),
        app_id: 12345,
        app_secret: "0123456789abcdef".to_string(),
        phone_number: phone.to_string(),
        connection_handle_ref: account_key.as_str().to_string(),
    }
}

pub fn message(chat: i64, id: i64, from_owner: bool, text: &str) -> IncomingMessage {
    IncomingMessage {
        chat: ChatKey(chat),
        message_id: id,
        is_self_authored: from_owner,
        is_private: true,
        text: text.to_string(),
    }
}

pub async fn wait_for_replies(provider: &LoopbackProvider, count: usize) -> Vec<SentReply> {
    for _ in 0..POLL_ROUNDS {
        let replies = provider.sent_replies();
        if replies.len() >= count {
            return replies;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("expected {count} replies, got {:?}", provider.sent_replies());
}

pub async fn wait_for_active(session: &AccountSession, chat: i64, active: bool) {
    for _ in 0..POLL_ROUNDS {
        if session.is_chat_active(ChatKey(chat)).await == active {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("chat {chat} never became active={active}");
}

pub async fn wait_for_history(session: &AccountSession, chat: i64, len: usize) {
    for _ in 0..POLL_ROUNDS {
        if session.history_len(ChatKey(chat)).await == Some(len) {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!(
        "chat {chat} history is {:?}, expected {len}",
        session.history_len(ChatKey(chat)).await
    );
}
