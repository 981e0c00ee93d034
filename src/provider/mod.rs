//! The messaging-network side of a session.
//!
//! A [`ConnectionFactory`] opens [`Connection`]s bound to a session handle;
//! everything the rest of the crate needs from the network goes through
//! these two traits.

pub mod loopback;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use ubcore::auth::VerificationHash;
use ubcore::{AccountProfile, AppCredentials, ChatKey, IncomingMessage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("connection is not established")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("phone number is not registered")]
    PhoneUnregistered,
    #[error("verification code expired")]
    CodeExpired,
    #[error("flood wait requested for {seconds}s")]
    FloodWait { seconds: u64 },
    #[error("connection is not authorized")]
    Unauthorized,
    #[error("{0}")]
    Other(String),
}

/// Outcomes of a sign-in step that are not plain success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignInError {
    #[error("account requires its second-factor password")]
    PasswordRequired,
    #[error("verification code is invalid")]
    InvalidCode,
    #[error("verification code expired")]
    CodeExpired,
    #[error("phone number was rejected")]
    PhoneRejected,
    #[error("second-factor password is invalid")]
    InvalidPassword,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// One connection to the messaging network, bound to a session handle.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self) -> Result<(), ProviderError>;

    async fn is_authorized(&self) -> Result<bool, ProviderError>;

    /// Asks the network to deliver a verification code to `phone`.
    async fn request_verification_code(
        &self,
        phone: &str,
    ) -> Result<VerificationHash, ProviderError>;

    async fn sign_in(
        &self,
        phone: &str,
        code: &str,
        hash: &VerificationHash,
    ) -> Result<AccountProfile, SignInError>;

    async fn sign_in_with_password(&self, password: &str) -> Result<AccountProfile, SignInError>;

    async fn me(&self) -> Result<AccountProfile, ProviderError>;

    async fn set_presence(&self, online: bool) -> Result<(), ProviderError>;

    /// Every message seen by this connection from now on. The stream ends
    /// when the connection goes away.
    async fn subscribe_incoming(&self) -> Result<mpsc::Receiver<IncomingMessage>, ProviderError>;

    /// Sends `text` into `chat`, quoting `reply_to` when given.
    async fn send_reply(
        &self,
        chat: ChatKey,
        reply_to: Option<i64>,
        text: &str,
    ) -> Result<(), ProviderError>;

    async fn send_typing(&self, _chat: ChatKey) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Persists the authorized session under `handle_ref` so that a later
    /// [`ConnectionFactory::open`] with the same handle comes up authorized.
    async fn save_session(&self, handle_ref: &str) -> Result<(), ProviderError>;

    async fn disconnect(&self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Creates a connection for `handle_ref`. The connection is not yet
    /// connected.
    async fn open(
        &self,
        app: &AppCredentials,
        handle_ref: &str,
    ) -> Result<Arc<dyn Connection>, ProviderError>;

    /// Drops whatever session data is stored under `handle_ref`.
    async fn discard(&self, handle_ref: &str) -> Result<(), ProviderError>;
}

/// A session's connection shared by its presence and listener tasks.
///
/// Calls are funneled one at a time; the underlying client is not assumed
/// to tolerate concurrent use.
pub struct SharedConnection {
    inner: Arc<dyn Connection>,
    gate: Mutex<()>,
}

impl SharedConnection {
    pub fn new(inner: Arc<dyn Connection>) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }

    pub async fn set_presence(&self, online: bool) -> Result<(), ProviderError> {
        let _gate = self.gate.lock().await;
        self.inner.set_presence(online).await
    }

    pub async fn subscribe_incoming(
        &self,
    ) -> Result<mpsc::Receiver<IncomingMessage>, ProviderError> {
        let _gate = self.gate.lock().await;
        self.inner.subscribe_incoming().await
    }

    pub async fn send_reply(
        &self,
        chat: ChatKey,
        reply_to: Option<i64>,
        text: &str,
    ) -> Result<(), ProviderError> {
        let _gate = self.gate.lock().await;
        self.inner.send_reply(chat, reply_to, text).await
    }

    pub async fn send_typing(&self, chat: ChatKey) -> Result<(), ProviderError> {
        let _gate = self.gate.lock().await;
        self.inner.send_typing(chat).await
    }

    pub async fn disconnect(&self) {
        let _gate = self.gate.lock().await;
        self.inner.disconnect().await
    }
}
