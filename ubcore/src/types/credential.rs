use super::keys::AccountKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Application credentials the provider issues to a client application.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCredentials {
    pub app_id: i32,
    pub app_secret: String,
}

impl AppCredentials {
    pub fn new(app_id: i32, app_secret: impl Into<String>) -> Self {
        Self {
            app_id,
            app_secret: app_secret.into(),
        }
    }
}

impl fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredentials")
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .finish()
    }
}

/// The durable record of one onboarded account.
///
/// Written once when authentication succeeds. Only `connection_handle_ref`
/// changes afterwards, when a transient connection is promoted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCredential {
    pub account_key: AccountKey,
    pub app_id: i32,
    pub app_secret: String,
    pub phone_number: String,
    pub connection_handle_ref: String,
}

impl AccountCredential {
    pub fn app(&self) -> AppCredentials {
        AppCredentials::new(self.app_id, self.app_secret.clone())
    }

    pub fn with_connection_handle(mut self, handle_ref: impl Into<String>) -> Self {
        self.connection_handle_ref = handle_ref.into();
        self
    }
}

impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("account_key", &self.account_key.to_string())
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field("phone_number", &super::keys::mask_phone(&self.phone_number))
            .field(
                "connection_handle_ref",
                &super::keys::mask_phone(&self.connection_handle_ref),
            )
            .finish()
    }
}
