//! An in-process messaging network.
//!
//! Accounts are registered up front with their verification code and
//! optional second-factor password. Verification hashes are issued as
//! `h1`, `h2`, ... in order. Everything a connection does is recorded so
//! callers can inspect it afterwards. Used by the `repl` command and by the
//! tests.
//!
//! A persistent network also keeps saved sessions as one file per handle, so
//! a later process finds the accounts it authorized.

use super::{Connection, ConnectionFactory, ProviderError, SignInError};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::Instant;
use ubcore::auth::VerificationHash;
use ubcore::{AccountKey, AccountProfile, AppCredentials, ChatKey, IncomingMessage};

const SUBSCRIPTION_CAPACITY: usize = 64;
const SESSION_EXTENSION: &str = "session";

#[derive(Debug, Clone)]
pub struct LoopbackAccount {
    pub phone: String,
    pub code: String,
    pub password: Option<String>,
    pub profile: AccountProfile,
}

impl LoopbackAccount {
    pub fn new(phone: &str, code: &str, display_name: &str) -> Self {
        let key = AccountKey::from_phone(phone);
        Self {
            phone: key.as_str().to_string(),
            code: code.to_string(),
            password: None,
            profile: AccountProfile {
                id: key.as_str().parse().unwrap_or_default(),
                display_name: display_name.to_string(),
                username: None,
            },
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReply {
    pub account: AccountKey,
    pub chat: ChatKey,
    pub reply_to: Option<i64>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub online: bool,
    pub at: Instant,
}

#[derive(Default)]
struct ConnectionState {
    handle_ref: String,
    connected: bool,
    account: Option<String>,
    awaiting_password: Option<String>,
}

#[derive(Default)]
struct Network {
    accounts: HashMap<String, LoopbackAccount>,
    sessions: HashMap<String, String>,
    issued_hashes: HashMap<String, String>,
    hash_counter: u64,
    connection_counter: u64,
    connections: HashMap<u64, ConnectionState>,
    open_connections: usize,
    subscribers: HashMap<String, Vec<(u64, mpsc::Sender<IncomingMessage>)>>,
    presence: HashMap<String, Vec<PresenceChange>>,
    sent: Vec<SentReply>,
    typing: usize,
    pending_flood_wait: Option<u64>,
    presence_failure: bool,
}

impl Network {
    fn connection(&mut self, id: u64) -> Result<&mut ConnectionState, ProviderError> {
        match self.connections.get_mut(&id) {
            Some(state) if state.connected => Ok(state),
            _ => Err(ProviderError::NotConnected),
        }
    }

    fn authorized_account(&mut self, id: u64) -> Result<String, ProviderError> {
        self.connection(id)?
            .account
            .clone()
            .ok_or(ProviderError::Unauthorized)
    }

    fn profile(&self, phone: &str) -> Result<AccountProfile, ProviderError> {
        self.accounts
            .get(phone)
            .map(|account| account.profile.clone())
            .ok_or(ProviderError::Unauthorized)
    }
}

/// Shared handle to one simulated network. Clones observe the same state.
#[derive(Clone, Default)]
pub struct LoopbackProvider {
    network: Arc<Mutex<Network>>,
    sessions_dir: Option<PathBuf>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network that mirrors saved sessions into `dir` and starts with the
    /// sessions already found there.
    pub async fn persistent(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let mut sessions = HashMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_EXTENSION) {
                continue;
            }
            let Some(handle_ref) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let account = fs::read_to_string(&path).await?;
            sessions.insert(handle_ref.to_string(), account.trim().to_string());
        }
        debug!(target: "Store/File", "Loaded {} saved sessions from {}", sessions.len(), dir.display());

        let provider = Self {
            network: Arc::default(),
            sessions_dir: Some(dir),
        };
        provider.network().sessions = sessions;
        Ok(provider)
    }

    fn session_path(&self, handle_ref: &str) -> Option<PathBuf> {
        let name = handle_ref.replace(|c: char| !c.is_alphanumeric() && c != '-' && c != '_', "_");
        self.sessions_dir
            .as_ref()
            .map(|dir| dir.join(format!("{name}.{SESSION_EXTENSION}")))
    }

    async fn write_session_file(&self, handle_ref: &str, account: &str) -> Result<(), ProviderError> {
        let Some(path) = self.session_path(handle_ref) else {
            return Ok(());
        };
        fs::write(&path, account)
            .await
            .map_err(|e| ProviderError::Other(format!("saving session {handle_ref}: {e}")))
    }

    async fn remove_session_file(&self, handle_ref: &str) -> Result<(), ProviderError> {
        let Some(path) = self.session_path(handle_ref) else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::Other(format!(
                "removing session {handle_ref}: {e}"
            ))),
        }
    }

    fn network(&self) -> MutexGuard<'_, Network> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, account: LoopbackAccount) {
        self.network().accounts.insert(account.phone.clone(), account);
    }

    /// Pushes `message` to every live subscription of `account`. Returns how
    /// many subscriptions took it.
    pub async fn deliver(&self, account: &AccountKey, message: IncomingMessage) -> usize {
        let senders: Vec<_> = self
            .network()
            .subscribers
            .get(account.as_str())
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for tx in senders {
            if tx.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn sent_replies(&self) -> Vec<SentReply> {
        self.network().sent.clone()
    }

    pub fn presence_changes(&self, account: &AccountKey) -> Vec<PresenceChange> {
        self.network()
            .presence
            .get(account.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn typing_indicators(&self) -> usize {
        self.network().typing
    }

    /// Connections that were connected and not yet disconnected.
    pub fn open_connections(&self) -> usize {
        self.network().open_connections
    }

    pub fn subscriber_count(&self, account: &AccountKey) -> usize {
        self.network()
            .subscribers
            .get(account.as_str())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Stores an authorized session for a registered account under
    /// `handle_ref`, as if it had been onboarded earlier.
    pub fn seed_session(&self, handle_ref: &str, account: &AccountKey) {
        self.network()
            .sessions
            .insert(handle_ref.to_string(), account.as_str().to_string());
    }

    pub fn has_session(&self, handle_ref: &str) -> bool {
        self.network().sessions.contains_key(handle_ref)
    }

    /// Invalidates a saved session, as if the account was logged out remotely.
    pub fn revoke_session(&self, handle_ref: &str) {
        self.network().sessions.remove(handle_ref);
    }

    /// Makes the next `send_reply` on any connection fail with a flood wait.
    pub fn flood_wait_next_send(&self, seconds: u64) {
        self.network().pending_flood_wait = Some(seconds);
    }

    pub fn fail_presence(&self, fail: bool) {
        self.network().presence_failure = fail;
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackProvider {
    async fn open(
        &self,
        app: &AppCredentials,
        handle_ref: &str,
    ) -> Result<Arc<dyn Connection>, ProviderError> {
        if app.app_id <= 0 || app.app_secret.is_empty() {
            return Err(ProviderError::Other(
                "application credentials rejected".to_string(),
            ));
        }
        let mut network = self.network();
        network.connection_counter += 1;
        let id = network.connection_counter;
        network.connections.insert(
            id,
            ConnectionState {
                handle_ref: handle_ref.to_string(),
                ..Default::default()
            },
        );
        Ok(Arc::new(LoopbackConnection {
            id,
            provider: self.clone(),
        }))
    }

    async fn discard(&self, handle_ref: &str) -> Result<(), ProviderError> {
        self.network().sessions.remove(handle_ref);
        self.remove_session_file(handle_ref).await
    }
}

struct LoopbackConnection {
    id: u64,
    provider: LoopbackProvider,
}

impl LoopbackConnection {
    fn network(&self) -> MutexGuard<'_, Network> {
        self.provider.network()
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn connect(&self) -> Result<(), ProviderError> {
        let mut network = self.network();
        let handle_ref = match network.connections.get(&self.id) {
            Some(state) if state.connected => return Ok(()),
            Some(state) => state.handle_ref.clone(),
            None => return Err(ProviderError::NotConnected),
        };
        let account = network.sessions.get(&handle_ref).cloned();
        network.open_connections += 1;
        if let Some(state) = network.connections.get_mut(&self.id) {
            state.connected = true;
            state.account = account;
        }
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool, ProviderError> {
        Ok(self.network().connection(self.id)?.account.is_some())
    }

    async fn request_verification_code(
        &self,
        phone: &str,
    ) -> Result<VerificationHash, ProviderError> {
        let mut network = self.network();
        network.connection(self.id)?;
        let digits = AccountKey::from_phone(phone);
        if !network.accounts.contains_key(digits.as_str()) {
            return Err(ProviderError::PhoneUnregistered);
        }
        network.hash_counter += 1;
        let hash = format!("h{}", network.hash_counter);
        network
            .issued_hashes
            .insert(hash.clone(), digits.as_str().to_string());
        Ok(VerificationHash::new(hash))
    }

    async fn sign_in(
        &self,
        phone: &str,
        code: &str,
        hash: &VerificationHash,
    ) -> Result<AccountProfile, SignInError> {
        let mut network = self.network();
        network.connection(self.id)?;
        let digits = AccountKey::from_phone(phone).as_str().to_string();
        match network.issued_hashes.get(hash.as_str()) {
            Some(issued_for) if *issued_for == digits => {}
            Some(_) => return Err(SignInError::PhoneRejected),
            None => return Err(SignInError::CodeExpired),
        }
        let account = network
            .accounts
            .get(&digits)
            .cloned()
            .ok_or(SignInError::PhoneRejected)?;
        if account.code != code {
            return Err(SignInError::InvalidCode);
        }
        network.issued_hashes.remove(hash.as_str());

        let state = network.connection(self.id)?;
        if account.password.is_some() {
            state.awaiting_password = Some(digits);
            return Err(SignInError::PasswordRequired);
        }
        state.account = Some(digits);
        Ok(account.profile)
    }

    async fn sign_in_with_password(&self, password: &str) -> Result<AccountProfile, SignInError> {
        let mut network = self.network();
        let digits = network
            .connection(self.id)?
            .awaiting_password
            .clone()
            .ok_or(ProviderError::Unauthorized)?;
        let account = network
            .accounts
            .get(&digits)
            .cloned()
            .ok_or(SignInError::PhoneRejected)?;
        if account.password.as_deref() != Some(password) {
            return Err(SignInError::InvalidPassword);
        }
        let state = network.connection(self.id)?;
        state.awaiting_password = None;
        state.account = Some(digits);
        Ok(account.profile)
    }

    async fn me(&self) -> Result<AccountProfile, ProviderError> {
        let mut network = self.network();
        let phone = network.authorized_account(self.id)?;
        network.profile(&phone)
    }

    async fn set_presence(&self, online: bool) -> Result<(), ProviderError> {
        let mut network = self.network();
        let phone = network.authorized_account(self.id)?;
        if network.presence_failure {
            return Err(ProviderError::ConnectionLost(
                "presence update dropped".to_string(),
            ));
        }
        network
            .presence
            .entry(phone)
            .or_default()
            .push(PresenceChange {
                online,
                at: Instant::now(),
            });
        Ok(())
    }

    async fn subscribe_incoming(&self) -> Result<mpsc::Receiver<IncomingMessage>, ProviderError> {
        let mut network = self.network();
        let phone = network.authorized_account(self.id)?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        network
            .subscribers
            .entry(phone)
            .or_default()
            .push((self.id, tx));
        Ok(rx)
    }

    async fn send_reply(
        &self,
        chat: ChatKey,
        reply_to: Option<i64>,
        text: &str,
    ) -> Result<(), ProviderError> {
        let mut network = self.network();
        let phone = network.authorized_account(self.id)?;
        if let Some(seconds) = network.pending_flood_wait.take() {
            return Err(ProviderError::FloodWait { seconds });
        }
        network.sent.push(SentReply {
            account: AccountKey::from_phone(&phone),
            chat,
            reply_to,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_typing(&self, _chat: ChatKey) -> Result<(), ProviderError> {
        let mut network = self.network();
        network.authorized_account(self.id)?;
        network.typing += 1;
        Ok(())
    }

    async fn save_session(&self, handle_ref: &str) -> Result<(), ProviderError> {
        let phone = {
            let mut network = self.network();
            let phone = network.authorized_account(self.id)?;
            network.sessions.insert(handle_ref.to_string(), phone.clone());
            phone
        };
        self.provider.write_session_file(handle_ref, &phone).await
    }

    async fn disconnect(&self) {
        let mut network = self.network();
        let was_connected = match network.connections.get_mut(&self.id) {
            Some(state) => std::mem::replace(&mut state.connected, false),
            None => false,
        };
        if was_connected {
            network.open_connections -= 1;
        }
        for subs in network.subscribers.values_mut() {
            subs.retain(|(id, _)| *id != self.id);
        }
    }
}
