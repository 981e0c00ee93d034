//! Per-requester onboarding: phone, verification code, optional second
//! factor, then promotion of the signed-in connection into a session.

use crate::provider::{Connection, ConnectionFactory, ProviderError, SignInError};
use crate::session::{SessionError, SessionRegistry, StartOutcome};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use ubcore::auth::{
    AuthState, ValidationError, VerificationHash, normalize_code, normalize_phone,
    validate_app_credentials, validate_password,
};
use ubcore::store::StoreError;
use ubcore::{AccountCredential, AccountKey, AccountProfile, AppCredentials, RequesterKey, mask_phone};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub code_length: usize,
    /// Invalid codes accepted against one verification hash before a new
    /// code has to be requested.
    pub max_code_attempts: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            code_length: 5,
            max_code_attempts: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no onboarding in progress")]
    NoAttempt,
    #[error("expected state {expected}, onboarding is in {actual}")]
    WrongState {
        expected: AuthState,
        actual: AuthState,
    },
    #[error("application credentials are required to onboard")]
    MissingAppCredentials,
    #[error("phone number was rejected by the provider")]
    PhoneRejected,
    #[error("invalid code, {remaining} attempts left")]
    InvalidCode { remaining: u32 },
    #[error("too many invalid codes, enter the phone number again")]
    CodeRetriesExhausted,
    #[error("verification code expired, enter the phone number again")]
    CodeExpired,
    #[error("invalid password, onboarding cancelled")]
    InvalidPassword,
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// What a successful onboarding step led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthProgress {
    /// A code was sent; submit it next.
    CodeSent,
    /// The account has a second factor; submit the password next.
    PasswordRequired,
    Authorized(Authorized),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorized {
    pub account_key: AccountKey,
    pub profile: AccountProfile,
    pub session: StartOutcome,
}

struct AuthAttempt {
    requester: RequesterKey,
    state: AuthState,
    app: AppCredentials,
    phone_number: Option<String>,
    verification_hash: Option<VerificationHash>,
    transient: Option<Arc<dyn Connection>>,
    password_required: bool,
    invalid_codes: u32,
}

impl AuthAttempt {
    fn new(requester: RequesterKey, app: AppCredentials) -> Self {
        Self {
            requester,
            state: AuthState::WaitingPhone,
            app,
            phone_number: None,
            verification_hash: None,
            transient: None,
            password_required: false,
            invalid_codes: 0,
        }
    }

    fn require(&self, expected: AuthState) -> Result<(), AuthError> {
        match self.state {
            AuthState::Idle => Err(AuthError::NoAttempt),
            actual if actual == expected => Ok(()),
            actual => Err(AuthError::WrongState { expected, actual }),
        }
    }

    fn transient_handle(&self) -> String {
        transient_handle(self.requester)
    }
}

fn transient_handle(requester: RequesterKey) -> String {
    format!("temp_{requester}")
}

/// All in-flight onboarding attempts, at most one per requester.
pub struct AuthManager {
    attempts: DashMap<RequesterKey, Arc<Mutex<AuthAttempt>>>,
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<SessionRegistry>,
    config: AuthConfig,
    default_app: Option<AppCredentials>,
}

impl AuthManager {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<SessionRegistry>,
        config: AuthConfig,
        default_app: Option<AppCredentials>,
    ) -> Self {
        Self {
            attempts: DashMap::new(),
            factory,
            registry,
            config,
            default_app,
        }
    }

    /// Starts onboarding with the configured application credentials.
    pub async fn begin_onboarding(&self, requester: RequesterKey) -> Result<AuthState, AuthError> {
        let app = self
            .default_app
            .clone()
            .ok_or(AuthError::MissingAppCredentials)?;
        self.begin_onboarding_with(requester, app).await
    }

    /// Starts onboarding with requester-supplied application credentials.
    /// A pending attempt of the same requester is torn down first.
    pub async fn begin_onboarding_with(
        &self,
        requester: RequesterKey,
        app: AppCredentials,
    ) -> Result<AuthState, AuthError> {
        validate_app_credentials(app.app_id, &app.app_secret)?;

        if let Some((_, previous)) = self.attempts.remove(&requester) {
            let mut previous = previous.lock().await;
            info!(target: "Auth", "Requester {requester}: replacing pending onboarding");
            self.teardown(&mut previous).await;
            previous.state = AuthState::Idle;
        }

        let attempt = Arc::new(Mutex::new(AuthAttempt::new(requester, app)));
        if let Some(displaced) = self.attempts.insert(requester, attempt) {
            let mut displaced = displaced.lock().await;
            self.teardown(&mut displaced).await;
            displaced.state = AuthState::Idle;
        }
        info!(target: "Auth", "Requester {requester}: onboarding started");
        Ok(AuthState::WaitingPhone)
    }

    pub async fn submit_phone(
        &self,
        requester: RequesterKey,
        raw_phone: &str,
    ) -> Result<AuthProgress, AuthError> {
        let handle = self.attempt(requester)?;
        let mut attempt = handle.lock().await;
        attempt.require(AuthState::WaitingPhone)?;
        let phone = normalize_phone(raw_phone)?;

        // A rejected number leaves the attempt here with its connection gone.
        self.teardown(&mut attempt).await;

        let connection = self
            .factory
            .open(&attempt.app, &attempt.transient_handle())
            .await;
        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                self.abandon(&handle, &mut attempt).await;
                return Err(e.into());
            }
        };
        attempt.transient = Some(connection.clone());

        let requested = match connection.connect().await {
            Ok(()) => connection.request_verification_code(&phone).await,
            Err(e) => Err(e),
        };
        match requested {
            Ok(hash) => {
                attempt.phone_number = Some(phone.clone());
                attempt.verification_hash = Some(hash);
                attempt.invalid_codes = 0;
                attempt.state = AuthState::WaitingCode;
                info!(target: "Auth", "Requester {requester}: code sent to {}", mask_phone(&phone));
                Ok(AuthProgress::CodeSent)
            }
            Err(ProviderError::PhoneUnregistered) => {
                self.teardown(&mut attempt).await;
                info!(target: "Auth", "Requester {requester}: {} is not registered", mask_phone(&phone));
                Err(AuthError::PhoneRejected)
            }
            Err(e) => {
                warn!(target: "Auth", "Requester {requester}: code request failed: {e}");
                self.abandon(&handle, &mut attempt).await;
                Err(e.into())
            }
        }
    }

    pub async fn submit_code(
        &self,
        requester: RequesterKey,
        raw_code: &str,
    ) -> Result<AuthProgress, AuthError> {
        let handle = self.attempt(requester)?;
        let mut attempt = handle.lock().await;
        attempt.require(AuthState::WaitingCode)?;
        let code = normalize_code(raw_code, self.config.code_length)?;

        let (Some(connection), Some(phone), Some(hash)) = (
            attempt.transient.clone(),
            attempt.phone_number.clone(),
            attempt.verification_hash.clone(),
        ) else {
            self.restart_from_phone(&mut attempt).await;
            return Err(AuthError::CodeExpired);
        };

        match connection.sign_in(&phone, &code, &hash).await {
            Ok(profile) => self.complete(&handle, &mut attempt, profile).await,
            Err(SignInError::PasswordRequired) => {
                attempt.verification_hash = None;
                attempt.password_required = true;
                attempt.state = AuthState::WaitingPassword;
                info!(target: "Auth", "Requester {requester}: second factor required");
                Ok(AuthProgress::PasswordRequired)
            }
            Err(SignInError::InvalidCode) => {
                attempt.invalid_codes += 1;
                let remaining = self
                    .config
                    .max_code_attempts
                    .saturating_sub(attempt.invalid_codes);
                debug!(target: "Auth", "Requester {requester}: invalid code, {remaining} attempts left");
                if remaining == 0 {
                    self.restart_from_phone(&mut attempt).await;
                    Err(AuthError::CodeRetriesExhausted)
                } else {
                    Err(AuthError::InvalidCode { remaining })
                }
            }
            Err(SignInError::CodeExpired) => {
                self.restart_from_phone(&mut attempt).await;
                Err(AuthError::CodeExpired)
            }
            Err(SignInError::PhoneRejected) => {
                self.restart_from_phone(&mut attempt).await;
                Err(AuthError::PhoneRejected)
            }
            Err(SignInError::InvalidPassword) => {
                self.abandon(&handle, &mut attempt).await;
                Err(AuthError::InvalidPassword)
            }
            Err(SignInError::Provider(e)) => {
                warn!(target: "Auth", "Requester {requester}: sign-in failed: {e}");
                self.abandon(&handle, &mut attempt).await;
                Err(e.into())
            }
        }
    }

    pub async fn submit_password(
        &self,
        requester: RequesterKey,
        password: &str,
    ) -> Result<AuthProgress, AuthError> {
        let handle = self.attempt(requester)?;
        let mut attempt = handle.lock().await;
        attempt.require(AuthState::WaitingPassword)?;
        let password = validate_password(password)?;

        let Some(connection) = attempt.transient.clone() else {
            self.abandon(&handle, &mut attempt).await;
            return Err(AuthError::NoAttempt);
        };

        match connection.sign_in_with_password(password).await {
            Ok(profile) => self.complete(&handle, &mut attempt, profile).await,
            Err(e) => {
                info!(target: "Auth", "Requester {requester}: second factor rejected");
                self.abandon(&handle, &mut attempt).await;
                match e {
                    SignInError::Provider(e) => Err(e.into()),
                    _ => Err(AuthError::InvalidPassword),
                }
            }
        }
    }

    pub async fn cancel(&self, requester: RequesterKey) -> Result<(), AuthError> {
        let Some((_, handle)) = self.attempts.remove(&requester) else {
            return Err(AuthError::NoAttempt);
        };
        let mut attempt = handle.lock().await;
        let stage = if attempt.password_required {
            "second factor"
        } else {
            attempt.state.as_str()
        };
        self.teardown(&mut attempt).await;
        attempt.state = AuthState::Idle;
        info!(target: "Auth", "Requester {requester}: onboarding cancelled at {stage}");
        Ok(())
    }

    /// Tears down every pending attempt.
    pub async fn cancel_all(&self) {
        let requesters: Vec<RequesterKey> = self.attempts.iter().map(|entry| *entry.key()).collect();
        for requester in requesters {
            // Already finished or replaced concurrently.
            let _ = self.cancel(requester).await;
        }
    }

    pub async fn state(&self, requester: RequesterKey) -> AuthState {
        match self.attempt(requester) {
            Ok(handle) => handle.lock().await.state,
            Err(_) => AuthState::Idle,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.attempts.len()
    }

    fn attempt(&self, requester: RequesterKey) -> Result<Arc<Mutex<AuthAttempt>>, AuthError> {
        self.attempts
            .get(&requester)
            .map(|entry| entry.value().clone())
            .ok_or(AuthError::NoAttempt)
    }

    /// Persists the account, promotes the transient connection and hands it
    /// to the registry. The attempt is finished either way.
    async fn complete(
        &self,
        handle: &Arc<Mutex<AuthAttempt>>,
        attempt: &mut AuthAttempt,
        profile: AccountProfile,
    ) -> Result<AuthProgress, AuthError> {
        let requester = attempt.requester;
        let (Some(connection), Some(phone)) = (attempt.transient.take(), attempt.phone_number.clone())
        else {
            self.abandon(handle, attempt).await;
            return Err(AuthError::NoAttempt);
        };
        let account_key = AccountKey::from_phone(&phone);
        let durable_handle = account_key.as_str().to_string();

        let credential = AccountCredential {
            account_key: account_key.clone(),
            app_id: attempt.app.app_id,
            app_secret: attempt.app.app_secret.clone(),
            phone_number: phone,
            connection_handle_ref: durable_handle.clone(),
        };
        let persisted = match connection.save_session(&durable_handle).await {
            Ok(()) => self
                .registry
                .store()
                .save(&account_key, &credential)
                .await
                .map_err(AuthError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = persisted {
            warn!(target: "Auth", "Requester {requester}: could not persist {account_key}: {e}");
            attempt.transient = Some(connection);
            self.abandon(handle, attempt).await;
            return Err(e);
        }

        if let Err(e) = self.factory.discard(&attempt.transient_handle()).await {
            debug!(target: "Auth", "Requester {requester}: transient session not discarded: {e}");
        }
        attempt.verification_hash = None;
        attempt.state = AuthState::Authorized;
        self.attempts
            .remove_if(&requester, |_, current| Arc::ptr_eq(current, handle));
        info!(target: "Auth", "Requester {requester}: authorized as {account_key}");

        let session = self
            .registry
            .attach(credential, connection, profile.clone())
            .await?;
        Ok(AuthProgress::Authorized(Authorized {
            account_key,
            profile,
            session,
        }))
    }

    /// Drops the transient connection and its session data.
    async fn teardown(&self, attempt: &mut AuthAttempt) {
        attempt.verification_hash = None;
        if let Some(connection) = attempt.transient.take() {
            connection.disconnect().await;
            if let Err(e) = self.factory.discard(&attempt.transient_handle()).await {
                debug!(target: "Auth", "Requester {}: transient session not discarded: {e}", attempt.requester);
            }
        }
    }

    async fn restart_from_phone(&self, attempt: &mut AuthAttempt) {
        self.teardown(attempt).await;
        attempt.phone_number = None;
        attempt.password_required = false;
        attempt.invalid_codes = 0;
        attempt.state = AuthState::WaitingPhone;
    }

    /// Ends the attempt after an unrecoverable error.
    async fn abandon(&self, handle: &Arc<Mutex<AuthAttempt>>, attempt: &mut AuthAttempt) {
        self.teardown(attempt).await;
        attempt.state = AuthState::Idle;
        self.attempts
            .remove_if(&attempt.requester, |_, current| Arc::ptr_eq(current, handle));
    }
}
