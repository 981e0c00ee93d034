//! Incoming-message handling for one account.
//!
//! The listener owns the account's subscription and fans messages out to one
//! worker per chat, so a chat's messages are handled strictly in arrival
//! order while different chats proceed independently.

use crate::provider::{ProviderError, SharedConnection};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use ubcore::command::ControlToken;
use ubcore::completion::{CompletionProvider, FallbackTable};
use ubcore::conversation::{ConversationStore, Role};
use ubcore::{AccountKey, ChatKey, IncomingMessage};

pub const ACK_ARMED: &str = "Assistant is on for this chat.";
pub const ACK_ALREADY_ARMED: &str = "Assistant is already on.";
pub const ACK_DISARMED: &str = "Assistant is off for this chat.";
pub const ACK_ALREADY_DISARMED: &str = "Assistant is already off.";
pub const ACK_RESET: &str = "Conversation history cleared.";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Reply to owner commands in the chat they were issued in.
    pub acknowledge_commands: bool,
    /// Ignore everything that is not a one-to-one conversation.
    pub private_only: bool,
    /// Upper bound on a provider-requested send pause.
    pub max_flood_wait_secs: u64,
    /// How often workers of quiet, unarmed chats are released.
    pub idle_sweep_secs: u64,
}

impl ListenerConfig {
    pub fn idle_sweep(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_secs.max(1))
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            acknowledge_commands: true,
            private_only: true,
            max_flood_wait_secs: 300,
            idle_sweep_secs: 60,
        }
    }
}

/// Everything a chat worker needs; shared by all of an account's workers.
pub struct ChatHandler {
    account: AccountKey,
    connection: Arc<SharedConnection>,
    conversations: Arc<Mutex<ConversationStore>>,
    completion: Arc<dyn CompletionProvider>,
    fallback: Arc<FallbackTable>,
    config: ListenerConfig,
    cancel: watch::Receiver<bool>,
}

impl ChatHandler {
    pub fn new(
        account: AccountKey,
        connection: Arc<SharedConnection>,
        conversations: Arc<Mutex<ConversationStore>>,
        completion: Arc<dyn CompletionProvider>,
        fallback: Arc<FallbackTable>,
        config: ListenerConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            account,
            connection,
            conversations,
            completion,
            fallback,
            config,
            cancel,
        }
    }

    async fn run_chat(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<IncomingMessage>,
        pending: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
    ) {
        let _live = scopeguard::guard(live, |live| {
            live.fetch_sub(1, Ordering::SeqCst);
        });
        while let Some(message) = queue.recv().await {
            self.handle(message).await;
            pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Handles one message: control tokens from the owner toggle the chat,
    /// peer text in an armed chat gets a generated reply.
    pub async fn handle(&self, message: IncomingMessage) {
        let chat = message.chat;
        let token = ControlToken::parse(&message.text);

        if token.is_command() {
            if !message.is_self_authored {
                info!(
                    target: "Session/Listener",
                    "[{}] Ignoring {token:?} from the remote party in chat {chat}",
                    self.account
                );
                self.conversations.lock().await.observe(chat);
                return;
            }
            self.apply_command(&message, token).await;
            return;
        }

        if message.is_self_authored {
            self.conversations.lock().await.observe(chat);
            return;
        }
        let text = message.text.trim();
        if text.is_empty() {
            return;
        }

        let request = {
            let mut conversations = self.conversations.lock().await;
            if !conversations.is_active(chat) {
                conversations.observe(chat);
                return;
            }
            conversations.prepare_request(chat, text)
        };
        debug!(
            target: "Session/Listener",
            "[{}] Chat {chat}: generating reply from {} entries",
            self.account,
            request.len()
        );

        if let Err(e) = self.connection.send_typing(chat).await {
            debug!(target: "Session/Listener", "[{}] Typing indicator failed: {e}", self.account);
        }

        let result = self.completion.generate_reply(&request).await;
        let reply = self.fallback.resolve(&result);
        match result {
            Ok(completion) if !completion.text.trim().is_empty() => {
                self.conversations.lock().await.append_and_bound(
                    chat,
                    Role::Assistant,
                    completion.text,
                    completion.continuation,
                );
            }
            Ok(_) => {
                warn!(target: "Session/Listener", "[{}] Blank completion, sending a fallback", self.account);
            }
            Err(e) => {
                warn!(target: "Session/Listener", "[{}] {e}, sending a fallback", self.account);
            }
        }

        self.send(chat, Some(message.message_id), &reply).await;
    }

    async fn apply_command(&self, message: &IncomingMessage, token: ControlToken) {
        let chat = message.chat;
        let ack = {
            let mut conversations = self.conversations.lock().await;
            match token {
                ControlToken::Arm => {
                    if conversations.arm(chat) {
                        info!(target: "Session/Listener", "[{}] Assistant armed in chat {chat}", self.account);
                        ACK_ARMED
                    } else {
                        ACK_ALREADY_ARMED
                    }
                }
                ControlToken::Disarm => {
                    if conversations.disarm(chat) {
                        info!(target: "Session/Listener", "[{}] Assistant disarmed in chat {chat}", self.account);
                        ACK_DISARMED
                    } else {
                        ACK_ALREADY_DISARMED
                    }
                }
                ControlToken::Reset => {
                    conversations.reset(chat);
                    info!(target: "Session/Listener", "[{}] History reset in chat {chat}", self.account);
                    ACK_RESET
                }
                ControlToken::None => return,
            }
        };
        if self.config.acknowledge_commands {
            self.send(chat, Some(message.message_id), ack).await;
        }
    }

    /// Sends a reply. A flood wait pauses this worker and retries once.
    async fn send(&self, chat: ChatKey, reply_to: Option<i64>, text: &str) {
        let seconds = match self.connection.send_reply(chat, reply_to, text).await {
            Ok(()) => return,
            Err(ProviderError::FloodWait { seconds }) => seconds,
            Err(e) => {
                warn!(target: "Session/Listener", "[{}] Failed to reply in chat {chat}: {e}", self.account);
                return;
            }
        };

        let pause = Duration::from_secs(seconds.min(self.config.max_flood_wait_secs));
        warn!(
            target: "Session/Listener",
            "[{}] Flood wait in chat {chat}, pausing {}s",
            self.account,
            pause.as_secs()
        );
        if !self.pause(pause).await {
            warn!(target: "Session/Listener", "[{}] Stopped during flood wait, reply to chat {chat} dropped", self.account);
            return;
        }
        if let Err(e) = self.connection.send_reply(chat, reply_to, text).await {
            warn!(target: "Session/Listener", "[{}] Retry in chat {chat} failed: {e}", self.account);
        }
    }

    /// Sleeps for `duration` unless the session stops first.
    async fn pause(&self, duration: Duration) -> bool {
        let mut cancel = self.cancel.clone();
        if *cancel.borrow_and_update() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            changed = cancel.changed() => changed.is_ok() && !*cancel.borrow(),
        }
    }
}

/// Sender side of one chat worker. `pending` counts messages dispatched to
/// it and not yet handled.
struct ChatQueue {
    tx: mpsc::UnboundedSender<IncomingMessage>,
    pending: Arc<AtomicUsize>,
}

pub struct MessageListener {
    handler: Arc<ChatHandler>,
    cancel: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
}

impl MessageListener {
    pub fn new(handler: ChatHandler) -> Self {
        let cancel = handler.cancel.clone();
        Self {
            handler: Arc::new(handler),
            cancel,
            live: Arc::default(),
        }
    }

    /// Gauge of chat workers currently alive.
    pub fn live_workers(&self) -> Arc<AtomicUsize> {
        self.live.clone()
    }

    /// Dispatches until cancelled or until the subscription ends. Messages
    /// already handed to a chat worker are still handled before this returns.
    pub async fn run(mut self, mut incoming: mpsc::Receiver<IncomingMessage>) {
        let account = self.handler.account.clone();
        let mut queues: HashMap<ChatKey, ChatQueue> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut sweep = tokio::time::interval(self.handler.config.idle_sweep());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "Session/Listener", "[{account}] Listening for messages");

        loop {
            tokio::select! {
                biased;
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        break;
                    }
                }
                event = incoming.recv() => match event {
                    Some(message) => self.dispatch(message, &mut queues, &mut workers),
                    None => {
                        warn!(target: "Session/Listener", "[{account}] Subscription closed, connection lost");
                        break;
                    }
                },
                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = result {
                        warn!(target: "Session/Listener", "[{account}] Chat worker failed: {e}");
                    }
                }
                _ = sweep.tick() => self.release_idle(&mut queues).await,
            }
        }

        incoming.close();
        drop(queues);
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(target: "Session/Listener", "[{account}] Chat worker failed: {e}");
            }
        }
        info!(target: "Session/Listener", "[{account}] Listener stopped");
    }

    fn dispatch(
        &self,
        message: IncomingMessage,
        queues: &mut HashMap<ChatKey, ChatQueue>,
        workers: &mut JoinSet<()>,
    ) {
        if self.handler.config.private_only && !message.is_private {
            debug!(
                target: "Session/Listener",
                "[{}] Skipping message in non-private chat {}",
                self.handler.account,
                message.chat
            );
            return;
        }
        let queue = queues.entry(message.chat).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let pending = Arc::new(AtomicUsize::new(0));
            self.live.fetch_add(1, Ordering::SeqCst);
            workers.spawn(
                self.handler
                    .clone()
                    .run_chat(rx, pending.clone(), self.live.clone()),
            );
            ChatQueue { tx, pending }
        });
        queue.pending.fetch_add(1, Ordering::SeqCst);
        if queue.tx.send(message).is_err() {
            queue.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(target: "Session/Listener", "[{}] Chat worker is gone, message dropped", self.handler.account);
        }
    }

    /// Drops the queues of chats that are unarmed and have nothing pending;
    /// their workers finish on their own. Only this task dispatches, so a
    /// zero count cannot race a new message.
    async fn release_idle(&self, queues: &mut HashMap<ChatKey, ChatQueue>) {
        let idle: Vec<ChatKey> = queues
            .iter()
            .filter(|(_, queue)| queue.pending.load(Ordering::SeqCst) == 0)
            .map(|(chat, _)| *chat)
            .collect();
        if idle.is_empty() {
            return;
        }
        let conversations = self.handler.conversations.lock().await;
        let before = queues.len();
        for chat in idle {
            if !conversations.is_active(chat) {
                queues.remove(&chat);
            }
        }
        let released = before - queues.len();
        if released > 0 {
            debug!(
                target: "Session/Listener",
                "[{}] Released {released} idle chat workers",
                self.handler.account
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ConnectionFactory;
    use crate::provider::loopback::{LoopbackAccount, LoopbackProvider};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Semaphore;
    use ubcore::AppCredentials;
    use ubcore::completion::{Completion, CompletionError};
    use ubcore::conversation::{HistoryEntry, MemoryConfig};

    #[derive(Default)]
    struct RecordingCompletion {
        requests: StdMutex<Vec<Vec<HistoryEntry>>>,
        fail: bool,
        /// When set, each reply waits for a permit.
        gate: Option<Semaphore>,
    }

    #[async_trait]
    impl CompletionProvider for RecordingCompletion {
        async fn generate_reply(
            &self,
            history: &[HistoryEntry],
        ) -> Result<Completion, CompletionError> {
            let turn = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(history.to_vec());
                requests.len()
            };
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.fail {
                return Err(CompletionError::RateLimited);
            }
            Ok(Completion {
                text: format!("reply {turn}"),
                continuation: Some(json!({"turn": turn})),
            })
        }
    }

    fn texts(requests: &[Vec<HistoryEntry>]) -> Vec<String> {
        requests
            .iter()
            .filter_map(|request| request.last().map(|entry| entry.content.clone()))
            .collect()
    }

    struct Fixture {
        provider: LoopbackProvider,
        handler: ChatHandler,
        completion: Arc<RecordingCompletion>,
        conversations: Arc<Mutex<ConversationStore>>,
        _cancel: watch::Sender<bool>,
    }

    async fn fixture(completion: RecordingCompletion) -> Fixture {
        let provider = LoopbackProvider::new();
        provider.register(LoopbackAccount::new("+15550000000", "12345", "Alice"));
        let key = AccountKey::from_phone("+15550000000");
        provider.seed_session("15550000000", &key);
        let conn = provider
            .open(&AppCredentials::new(1, "secret"), "15550000000")
            .await
            .unwrap();
        conn.connect().await.unwrap();

        let completion = Arc::new(completion);
        let conversations = Arc::new(Mutex::new(ConversationStore::new(MemoryConfig::default())));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handler = ChatHandler::new(
            key,
            Arc::new(SharedConnection::new(conn)),
            conversations.clone(),
            completion.clone(),
            Arc::new(FallbackTable::new(["fallback"])),
            ListenerConfig::default(),
            cancel_rx,
        );
        Fixture {
            provider,
            handler,
            completion,
            conversations,
            _cancel: cancel_tx,
        }
    }

    fn message(id: i64, self_authored: bool, text: &str) -> IncomingMessage {
        IncomingMessage {
            chat: ChatKey(42),
            message_id: id,
            is_self_authored: self_authored,
            is_private: true,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn peer_commands_never_toggle_the_chat() {
        let f = fixture(RecordingCompletion::default()).await;
        f.handler.handle(message(1, false, ".start")).await;
        assert!(!f.conversations.lock().await.is_active(ChatKey(42)));

        f.handler.handle(message(2, true, ".start")).await;
        f.handler.handle(message(3, false, ".STOP")).await;
        assert!(f.conversations.lock().await.is_active(ChatKey(42)));
        assert_eq!(f.provider.sent_replies().len(), 1);
        assert_eq!(f.provider.sent_replies()[0].text, ACK_ARMED);
    }

    #[tokio::test]
    async fn disarmed_chat_is_not_rearmed_by_owner_text() {
        let f = fixture(RecordingCompletion::default()).await;
        f.handler.handle(message(1, true, ".start")).await;
        f.handler.handle(message(2, true, ".stop")).await;
        f.handler.handle(message(3, true, "start please")).await;
        f.handler.handle(message(4, false, "hello?")).await;

        assert!(!f.conversations.lock().await.is_active(ChatKey(42)));
        assert!(f.completion.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn armed_chat_replies_and_carries_continuation() {
        let f = fixture(RecordingCompletion::default()).await;
        f.handler.handle(message(1, true, ".старт")).await;
        f.handler.handle(message(2, false, "hello")).await;
        f.handler.handle(message(3, false, "how are you")).await;

        let requests = f.completion.requests.lock().unwrap().clone();
        assert_eq!(requests[0], vec![HistoryEntry::user("hello")]);
        assert_eq!(requests[1].len(), 3);
        assert_eq!(requests[1][1].continuation, Some(json!({"turn": 1})));

        let replies = f.provider.sent_replies();
        assert_eq!(replies.last().unwrap().text, "reply 2");
        assert_eq!(replies.last().unwrap().reply_to, Some(3));
        let store = f.conversations.lock().await;
        assert_eq!(store.get(ChatKey(42)).unwrap().history.len(), 4);
        assert_eq!(f.provider.typing_indicators(), 2);
    }

    #[tokio::test]
    async fn failed_completion_sends_fallback_without_storing_it() {
        let f = fixture(RecordingCompletion {
            fail: true,
            ..Default::default()
        })
        .await;
        f.handler.handle(message(1, true, ".start")).await;
        f.handler.handle(message(2, false, "hello")).await;

        assert_eq!(f.provider.sent_replies().last().unwrap().text, "fallback");
        let store = f.conversations.lock().await;
        assert_eq!(
            store.get(ChatKey(42)).unwrap().history,
            vec![HistoryEntry::user("hello")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_pauses_then_retries_once() {
        let f = fixture(RecordingCompletion::default()).await;
        f.handler.handle(message(1, true, ".start")).await;
        f.provider.flood_wait_next_send(30);

        let started = tokio::time::Instant::now();
        f.handler.handle(message(2, false, "hello")).await;
        assert!(tokio::time::Instant::now() - started >= Duration::from_secs(30));
        assert_eq!(f.provider.sent_replies().last().unwrap().text, "reply 1");
    }

    #[tokio::test]
    async fn listener_keeps_per_chat_order_and_skips_groups() {
        let f = fixture(RecordingCompletion::default()).await;
        f.conversations.lock().await.arm(ChatKey(42));
        let (tx, rx) = mpsc::channel(16);
        let cancel = f._cancel;
        let listener = MessageListener::new(f.handler);
        let task = tokio::spawn(listener.run(rx));

        for i in 1..=3 {
            tx.send(message(i, false, &format!("m{i}"))).await.unwrap();
        }
        let mut group = message(9, false, "group text");
        group.is_private = false;
        tx.send(group).await.unwrap();

        while f.provider.sent_replies().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.send_replace(true);
        task.await.unwrap();

        let reply_to: Vec<_> = f.provider.sent_replies().iter().map(|r| r.reply_to).collect();
        assert_eq!(reply_to, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(f.completion.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stop_finishes_dispatched_messages_and_takes_no_more() {
        let f = fixture(RecordingCompletion {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        })
        .await;
        f.conversations.lock().await.arm(ChatKey(42));
        let (tx, rx) = mpsc::channel(16);
        let cancel = f._cancel;
        let completion = f.completion.clone();
        let listener = MessageListener::new(f.handler);
        let task = tokio::spawn(listener.run(rx));

        for i in 1..=3 {
            tx.send(message(i, false, &format!("m{i}"))).await.unwrap();
        }
        // The first reply is held, so m2 and m3 sit in the chat queue.
        while completion.requests.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(f.provider.sent_replies().is_empty());

        cancel.send_replace(true);
        let _ = tx.send(message(4, false, "after stop")).await;
        completion.gate.as_ref().unwrap().add_permits(3);
        task.await.unwrap();

        let reply_to: Vec<_> = f.provider.sent_replies().iter().map(|r| r.reply_to).collect();
        assert_eq!(reply_to, vec![Some(1), Some(2), Some(3)]);
        let asked = texts(&completion.requests.lock().unwrap());
        assert_eq!(asked, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_of_unarmed_chats_are_released() {
        let f = fixture(RecordingCompletion::default()).await;
        f.conversations.lock().await.arm(ChatKey(42));
        let (tx, rx) = mpsc::channel(16);
        let cancel = f._cancel;
        let conversations = f.conversations.clone();
        let listener = MessageListener::new(f.handler);
        let live = listener.live_workers();
        let task = tokio::spawn(listener.run(rx));

        let mut quiet = message(2, false, "hi");
        quiet.chat = ChatKey(7);
        tx.send(message(1, false, "hello")).await.unwrap();
        tx.send(quiet).await.unwrap();
        while f.provider.sent_replies().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(live.load(Ordering::SeqCst), 2);

        tokio::time::sleep(ListenerConfig::default().idle_sweep() * 2).await;
        assert_eq!(live.load(Ordering::SeqCst), 1);

        // The released chat gets a fresh worker on its next message.
        conversations.lock().await.arm(ChatKey(7));
        let mut again = message(3, false, "again");
        again.chat = ChatKey(7);
        tx.send(again).await.unwrap();
        while f.provider.sent_replies().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let last = f.provider.sent_replies().pop().unwrap();
        assert_eq!((last.chat, last.reply_to), (ChatKey(7), Some(3)));
        assert_eq!(live.load(Ordering::SeqCst), 2);

        cancel.send_replace(true);
        task.await.unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
