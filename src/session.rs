//! Running account sessions and the registry that owns them.

use crate::listener::{ChatHandler, ListenerConfig, MessageListener};
use crate::presence::{PresenceConfig, PresenceScheduler};
use crate::provider::{Connection, ConnectionFactory, ProviderError, SharedConnection};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{info, warn};
use scopeguard::ScopeGuard;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use ubcore::completion::{CompletionProvider, FallbackTable};
use ubcore::conversation::{ConversationStore, MemoryConfig};
use ubcore::store::{CredentialStore, StoreError};
use ubcore::{AccountCredential, AccountKey, AccountProfile, ChatKey};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("account {0} is not authorized, onboard it again")]
    NotAuthorized(AccountKey),
    #[error("no stored credential for account {0}")]
    UnknownAccount(AccountKey),
    #[error("account {0} has no running session")]
    NoSession(AccountKey),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { display_name: String },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub running: bool,
    pub account_display_name: Option<String>,
    pub active_chats: usize,
    pub total_chats: usize,
    pub started_at: Option<DateTime<Utc>>,
}

/// Settings shared by every session the registry spawns.
#[derive(Clone, Default)]
pub struct SessionSettings {
    pub presence: PresenceConfig,
    pub listener: ListenerConfig,
    pub memory: MemoryConfig,
    pub fallback: Arc<FallbackTable>,
}

/// One authorized account with its presence and listener tasks running.
pub struct AccountSession {
    account_key: AccountKey,
    credential: AccountCredential,
    profile: AccountProfile,
    connection: Arc<SharedConnection>,
    conversations: Arc<Mutex<ConversationStore>>,
    cancel: watch::Sender<bool>,
    presence_task: Mutex<Option<JoinHandle<()>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl AccountSession {
    async fn spawn(
        credential: AccountCredential,
        connection: Arc<dyn Connection>,
        profile: AccountProfile,
        completion: Arc<dyn CompletionProvider>,
        settings: &SessionSettings,
    ) -> Result<Arc<Self>, SessionError> {
        let account_key = credential.account_key.clone();
        let connection = Arc::new(SharedConnection::new(connection));
        let incoming = match connection.subscribe_incoming().await {
            Ok(incoming) => incoming,
            Err(e) => {
                connection.disconnect().await;
                return Err(e.into());
            }
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let conversations = Arc::new(Mutex::new(ConversationStore::new(settings.memory.clone())));

        let presence = PresenceScheduler::new(
            account_key.clone(),
            connection.clone(),
            settings.presence.clone(),
            cancel_rx.clone(),
        );
        let listener = MessageListener::new(ChatHandler::new(
            account_key.clone(),
            connection.clone(),
            conversations.clone(),
            completion,
            settings.fallback.clone(),
            settings.listener.clone(),
            cancel_rx,
        ));

        Ok(Arc::new(Self {
            account_key,
            credential,
            profile,
            connection,
            conversations,
            cancel,
            presence_task: Mutex::new(Some(tokio::spawn(presence.run()))),
            listener_task: Mutex::new(Some(tokio::spawn(listener.run(incoming)))),
            started_at: Utc::now(),
        }))
    }

    pub fn account_key(&self) -> &AccountKey {
        &self.account_key
    }

    pub fn credential(&self) -> &AccountCredential {
        &self.credential
    }

    pub fn profile(&self) -> &AccountProfile {
        &self.profile
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_running(&self) -> bool {
        !*self.cancel.borrow()
    }

    pub async fn arm_chat(&self, chat: ChatKey) -> bool {
        self.conversations.lock().await.arm(chat)
    }

    pub async fn disarm_chat(&self, chat: ChatKey) -> bool {
        self.conversations.lock().await.disarm(chat)
    }

    pub async fn reset_chat(&self, chat: ChatKey) {
        self.conversations.lock().await.reset(chat)
    }

    pub async fn is_chat_active(&self, chat: ChatKey) -> bool {
        self.conversations.lock().await.is_active(chat)
    }

    /// Length of the stored history for `chat`, if the chat has been seen.
    pub async fn history_len(&self, chat: ChatKey) -> Option<usize> {
        let conversations = self.conversations.lock().await;
        conversations.get(chat).map(|state| state.history.len())
    }

    pub async fn status(&self) -> SessionStatus {
        let conversations = self.conversations.lock().await;
        SessionStatus {
            running: self.is_running(),
            account_display_name: Some(self.profile.display_name.clone()),
            active_chats: conversations.active_count(),
            total_chats: conversations.len(),
            started_at: Some(self.started_at),
        }
    }

    /// Cancels both tasks, waits for them, then disconnects.
    async fn shutdown(&self) {
        self.cancel.send_replace(true);
        let presence = self.presence_task.lock().await.take();
        let listener = self.listener_task.lock().await.take();
        for task in [presence, listener].into_iter().flatten() {
            if let Err(e) = task.await {
                warn!(target: "Session/Registry", "[{}] Session task failed: {e}", self.account_key);
            }
        }
        self.connection.disconnect().await;
    }
}

enum SessionSlot {
    Starting,
    Running(Arc<AccountSession>),
    /// Closed when the stop finishes.
    Stopping(watch::Receiver<()>),
}

/// Process-wide table of account sessions. At most one entry per account;
/// every check-and-insert goes through the map's entry API.
pub struct SessionRegistry {
    sessions: DashMap<AccountKey, SessionSlot>,
    factory: Arc<dyn ConnectionFactory>,
    store: Arc<dyn CredentialStore>,
    completion: Arc<dyn CompletionProvider>,
    settings: SessionSettings,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        store: Arc<dyn CredentialStore>,
        completion: Arc<dyn CompletionProvider>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            store,
            completion,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Claims the slot for `account_key`. `false` when any session, starting,
    /// running or stopping, already holds it.
    fn reserve(&self, account_key: &AccountKey) -> bool {
        match self.sessions.entry(account_key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(SessionSlot::Starting);
                true
            }
        }
    }

    fn release(&self, account_key: &AccountKey) {
        self.sessions
            .remove_if(account_key, |_, slot| matches!(slot, SessionSlot::Starting));
    }

    /// Connects with a stored credential and starts the session, unless one
    /// is already running for the account.
    pub async fn start_or_attach(
        &self,
        credential: &AccountCredential,
    ) -> Result<StartOutcome, SessionError> {
        let account_key = &credential.account_key;
        if !self.reserve(account_key) {
            info!(target: "Session/Registry", "[{account_key}] Session already running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        let reservation = scopeguard::guard(account_key.clone(), |key| self.release(&key));

        let connection = self.factory.open(&credential.app(), &credential.connection_handle_ref).await?;
        let profile = match Self::verify(account_key, connection.as_ref()).await {
            Ok(profile) => profile,
            Err(e) => {
                connection.disconnect().await;
                return Err(e);
            }
        };

        let outcome = self.launch(credential.clone(), connection, profile).await?;
        ScopeGuard::into_inner(reservation);
        Ok(outcome)
    }

    /// Starts a session on a connection that is already authorized, as
    /// handed over by a finished onboarding. The connection is disconnected
    /// when the account is already running.
    pub async fn attach(
        &self,
        credential: AccountCredential,
        connection: Arc<dyn Connection>,
        profile: AccountProfile,
    ) -> Result<StartOutcome, SessionError> {
        let account_key = credential.account_key.clone();
        if !self.reserve(&account_key) {
            info!(target: "Session/Registry", "[{account_key}] Session already running, dropping new connection");
            connection.disconnect().await;
            return Ok(StartOutcome::AlreadyRunning);
        }
        let reservation = scopeguard::guard(account_key, |key| self.release(&key));

        let outcome = self.launch(credential, connection, profile).await?;
        ScopeGuard::into_inner(reservation);
        Ok(outcome)
    }

    /// Loads the stored credential for `account_key` and starts it.
    pub async fn start_stored(&self, account_key: &AccountKey) -> Result<StartOutcome, SessionError> {
        if self.is_running(account_key) {
            return Ok(StartOutcome::AlreadyRunning);
        }
        let credential = self
            .store
            .load(account_key)
            .await?
            .ok_or_else(|| SessionError::UnknownAccount(account_key.clone()))?;
        self.start_or_attach(&credential).await
    }

    /// Starts every stored account. One account failing does not stop the
    /// others; each result is reported.
    pub async fn restore_all(
        &self,
    ) -> Result<Vec<(AccountKey, Result<StartOutcome, SessionError>)>, SessionError> {
        let keys = self.store.list().await?;
        info!(target: "Session/Registry", "Restoring {} stored accounts", keys.len());
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let result = self.start_stored(&key).await;
            if let Err(e) = &result {
                warn!(target: "Session/Registry", "[{key}] Restore failed: {e}");
            }
            results.push((key, result));
        }
        Ok(results)
    }

    async fn verify(
        account_key: &AccountKey,
        connection: &dyn Connection,
    ) -> Result<AccountProfile, SessionError> {
        connection.connect().await?;
        if !connection.is_authorized().await? {
            return Err(SessionError::NotAuthorized(account_key.clone()));
        }
        Ok(connection.me().await?)
    }

    /// Spawns the session into a slot reserved by the caller.
    async fn launch(
        &self,
        credential: AccountCredential,
        connection: Arc<dyn Connection>,
        profile: AccountProfile,
    ) -> Result<StartOutcome, SessionError> {
        let account_key = credential.account_key.clone();
        let display_name = profile.display_name.clone();
        let session = AccountSession::spawn(
            credential,
            connection,
            profile,
            self.completion.clone(),
            &self.settings,
        )
        .await?;
        self.sessions
            .insert(account_key.clone(), SessionSlot::Running(session));
        info!(target: "Session/Registry", "[{account_key}] Session started as {display_name}");
        Ok(StartOutcome::Started { display_name })
    }

    /// Stops the account's session. Idempotent: a second caller racing an
    /// in-flight stop waits for it and gets `NotRunning`.
    pub async fn stop(&self, account_key: &AccountKey) -> Result<StopOutcome, SessionError> {
        let (done, done_rx) = watch::channel(());
        let session = {
            let Some(mut slot) = self.sessions.get_mut(account_key) else {
                return Ok(StopOutcome::NotRunning);
            };
            match std::mem::replace(&mut *slot, SessionSlot::Stopping(done_rx)) {
                SessionSlot::Running(session) => session,
                SessionSlot::Stopping(in_flight) => {
                    let mut in_flight_rx = in_flight.clone();
                    *slot = SessionSlot::Stopping(in_flight);
                    drop(slot);
                    // Resolves once the stopping caller drops its sender.
                    let _ = in_flight_rx.changed().await;
                    return Ok(StopOutcome::NotRunning);
                }
                SessionSlot::Starting => {
                    *slot = SessionSlot::Starting;
                    info!(target: "Session/Registry", "[{account_key}] Stop requested while starting, nothing to stop yet");
                    return Ok(StopOutcome::NotRunning);
                }
            }
        };

        session.shutdown().await;
        self.sessions.remove(account_key);
        drop(done);
        info!(target: "Session/Registry", "[{account_key}] Session stopped");
        Ok(StopOutcome::Stopped)
    }

    pub async fn stop_all(&self) {
        for account_key in self.running_accounts() {
            if let Err(e) = self.stop(&account_key).await {
                warn!(target: "Session/Registry", "[{account_key}] Stop failed: {e}");
            }
        }
    }

    pub fn get(&self, account_key: &AccountKey) -> Option<Arc<AccountSession>> {
        self.sessions
            .get(account_key)
            .and_then(|slot| match slot.value() {
                SessionSlot::Running(session) => Some(session.clone()),
                _ => None,
            })
    }

    pub fn is_running(&self, account_key: &AccountKey) -> bool {
        self.get(account_key).is_some()
    }

    pub fn running_accounts(&self) -> Vec<AccountKey> {
        let mut keys: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| matches!(entry.value(), SessionSlot::Running(_)))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub async fn status(&self, account_key: &AccountKey) -> SessionStatus {
        match self.get(account_key) {
            Some(session) => session.status().await,
            None => SessionStatus::default(),
        }
    }
}
