use super::error::Result;
use crate::types::{AccountCredential, AccountKey};
use async_trait::async_trait;

/// Persistence for onboarded accounts. One record per account key.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Inserts or replaces the record for `account_key`.
    async fn save(&self, account_key: &AccountKey, credential: &AccountCredential) -> Result<()>;

    async fn load(&self, account_key: &AccountKey) -> Result<Option<AccountCredential>>;

    /// Deleting a missing record is not an error.
    async fn delete(&self, account_key: &AccountKey) -> Result<()>;

    async fn list(&self) -> Result<Vec<AccountKey>>;
}
