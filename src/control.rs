//! The control-plane surface: onboarding, session lifecycle and per-chat
//! overlay commands behind one object.

use crate::auth::{AuthError, AuthManager, AuthProgress};
use crate::completion::OpenRouterClient;
use crate::config::Config;
use crate::http::UreqHttpClient;
use crate::provider::ConnectionFactory;
use crate::session::{
    AccountSession, SessionError, SessionRegistry, SessionSettings, SessionStatus, StartOutcome,
    StopOutcome,
};
use crate::store::FileCredentialStore;
use anyhow::Context;
use log::{debug, info, warn};
use std::sync::Arc;
use ubcore::auth::AuthState;
use ubcore::completion::{CompletionProvider, FallbackTable};
use ubcore::crypto::{AesGcmSealer, PlainSealer, Sealer};
use ubcore::net::HttpClient;
use ubcore::store::{CredentialStore, StoreError};
use ubcore::{AccountKey, AppCredentials, ChatKey, RequesterKey};

pub struct ControlPlane {
    auth: AuthManager,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn ConnectionFactory>,
}

impl ControlPlane {
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder::new()
    }

    pub async fn begin_onboarding(&self, requester: RequesterKey) -> Result<AuthState, AuthError> {
        self.auth.begin_onboarding(requester).await
    }

    pub async fn begin_onboarding_with(
        &self,
        requester: RequesterKey,
        app: AppCredentials,
    ) -> Result<AuthState, AuthError> {
        self.auth.begin_onboarding_with(requester, app).await
    }

    pub async fn submit_phone(
        &self,
        requester: RequesterKey,
        phone: &str,
    ) -> Result<AuthProgress, AuthError> {
        self.auth.submit_phone(requester, phone).await
    }

    pub async fn submit_code(
        &self,
        requester: RequesterKey,
        code: &str,
    ) -> Result<AuthProgress, AuthError> {
        self.auth.submit_code(requester, code).await
    }

    pub async fn submit_password(
        &self,
        requester: RequesterKey,
        password: &str,
    ) -> Result<AuthProgress, AuthError> {
        self.auth.submit_password(requester, password).await
    }

    pub async fn cancel_onboarding(&self, requester: RequesterKey) -> Result<(), AuthError> {
        self.auth.cancel(requester).await
    }

    pub async fn onboarding_state(&self, requester: RequesterKey) -> AuthState {
        self.auth.state(requester).await
    }

    pub async fn start_session(&self, account: &AccountKey) -> Result<StartOutcome, SessionError> {
        self.registry.start_stored(account).await
    }

    pub async fn stop_session(&self, account: &AccountKey) -> Result<StopOutcome, SessionError> {
        self.registry.stop(account).await
    }

    pub async fn session_status(&self, account: &AccountKey) -> SessionStatus {
        self.registry.status(account).await
    }

    pub fn session(&self, account: &AccountKey) -> Option<Arc<AccountSession>> {
        self.registry.get(account)
    }

    pub fn running_accounts(&self) -> Vec<AccountKey> {
        self.registry.running_accounts()
    }

    /// Turns the assistant on for `chat`. `false` when it already was.
    pub async fn arm_chat(&self, account: &AccountKey, chat: ChatKey) -> Result<bool, SessionError> {
        let armed = self.running(account)?.arm_chat(chat).await;
        if armed {
            info!(target: "Session/Listener", "[{account}] Chat {chat} armed from control plane");
        }
        Ok(armed)
    }

    pub async fn disarm_chat(
        &self,
        account: &AccountKey,
        chat: ChatKey,
    ) -> Result<bool, SessionError> {
        let disarmed = self.running(account)?.disarm_chat(chat).await;
        if disarmed {
            info!(target: "Session/Listener", "[{account}] Chat {chat} disarmed from control plane");
        }
        Ok(disarmed)
    }

    pub async fn reset_chat(&self, account: &AccountKey, chat: ChatKey) -> Result<(), SessionError> {
        self.running(account)?.reset_chat(chat).await;
        Ok(())
    }

    pub async fn list_accounts(&self) -> Result<Vec<AccountKey>, StoreError> {
        self.registry.store().list().await
    }

    pub async fn restore_all(
        &self,
    ) -> Result<Vec<(AccountKey, Result<StartOutcome, SessionError>)>, SessionError> {
        self.registry.restore_all().await
    }

    /// Stops the account's session, deletes its credential and drops its
    /// durable connection session. Returns whether a credential existed.
    pub async fn forget_account(&self, account: &AccountKey) -> Result<bool, SessionError> {
        self.registry.stop(account).await?;
        let store = self.registry.store();
        let credential = store.load(account).await?;
        let handle_ref = credential
            .as_ref()
            .map(|c| c.connection_handle_ref.clone())
            .unwrap_or_else(|| account.as_str().to_string());
        store.delete(account).await?;
        if let Err(e) = self.factory.discard(&handle_ref).await {
            warn!(target: "Session/Registry", "[{account}] Session handle not discarded: {e}");
        }
        info!(target: "Session/Registry", "[{account}] Account forgotten");
        Ok(credential.is_some())
    }

    /// Cancels pending onboardings and stops every session.
    pub async fn shutdown(&self) {
        debug!(target: "Session/Registry", "Shutting down control plane");
        self.auth.cancel_all().await;
        self.registry.stop_all().await;
    }

    fn running(&self, account: &AccountKey) -> Result<Arc<AccountSession>, SessionError> {
        self.registry
            .get(account)
            .ok_or_else(|| SessionError::NoSession(account.clone()))
    }
}

#[derive(Default)]
pub struct ControlPlaneBuilder {
    config: Option<Config>,
    factory: Option<Arc<dyn ConnectionFactory>>,
    store: Option<Arc<dyn CredentialStore>>,
    completion: Option<Arc<dyn CompletionProvider>>,
    http: Option<Arc<dyn HttpClient>>,
}

impl ControlPlaneBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use a custom credential store instead of the sealed file store under
    /// the configured data directory.
    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom completion provider instead of the OpenRouter client.
    pub fn with_completion_provider(mut self, completion: Arc<dyn CompletionProvider>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// HTTP client for the default completion provider.
    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub async fn build(self) -> anyhow::Result<ControlPlane> {
        let config = self.config.unwrap_or_default();
        let factory = self
            .factory
            .ok_or_else(|| anyhow::anyhow!("a connection factory is required"))?;

        let store: Arc<dyn CredentialStore> = match self.store {
            Some(store) => store,
            None => Arc::new(open_file_store(&config).await?),
        };

        let completion: Arc<dyn CompletionProvider> = match self.completion {
            Some(completion) => completion,
            None => {
                if config.completion.api_key.is_none() {
                    warn!(target: "Completion", "No API key configured, armed chats get fallback replies");
                }
                let http: Arc<dyn HttpClient> = match self.http {
                    Some(http) => http,
                    None => Arc::new(UreqHttpClient::new()),
                };
                Arc::new(OpenRouterClient::new(http, config.completion.clone()))
            }
        };

        let settings = SessionSettings {
            presence: config.presence.clone(),
            listener: config.listener.clone(),
            memory: config.memory.clone(),
            fallback: Arc::new(FallbackTable::new(config.completion.fallback_replies.clone())),
        };
        let registry = Arc::new(SessionRegistry::new(
            factory.clone(),
            store,
            completion,
            settings,
        ));
        let auth = AuthManager::new(
            factory.clone(),
            registry.clone(),
            config.auth.clone(),
            config.default_app.clone(),
        );

        Ok(ControlPlane {
            auth,
            registry,
            factory,
        })
    }
}

async fn open_file_store(config: &Config) -> anyhow::Result<FileCredentialStore> {
    let sealer: Arc<dyn Sealer> = match config.store_secret.as_deref() {
        Some(secret) => Arc::new(
            AesGcmSealer::from_secret(secret.as_bytes(), None).context("deriving the seal key")?,
        ),
        None => {
            warn!(target: "Store/File", "No store secret configured, credentials are stored unsealed");
            Arc::new(PlainSealer)
        }
    };
    tokio::fs::create_dir_all(config.sessions_dir())
        .await
        .with_context(|| format!("creating {}", config.sessions_dir().display()))?;
    let dir = config.credentials_dir();
    FileCredentialStore::new(&dir, sealer)
        .await
        .with_context(|| format!("opening credential store at {}", dir.display()))
}
