use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use ubcore::store::{CredentialStore, Result};
use ubcore::{AccountCredential, AccountKey};

/// Keeps records in memory only. Clones share the same records.
#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    records: Arc<RwLock<BTreeMap<AccountKey, AccountCredential>>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn save(&self, account_key: &AccountKey, credential: &AccountCredential) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(account_key.clone(), credential.clone());
        Ok(())
    }

    async fn load(&self, account_key: &AccountKey) -> Result<Option<AccountCredential>> {
        let records = self.records.read().await;
        Ok(records.get(account_key).cloned())
    }

    async fn delete(&self, account_key: &AccountKey) -> Result<()> {
        let mut records = self.records.write().await;
        records.remove(account_key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AccountKey>> {
        let records = self.records.read().await;
        Ok(records.keys().cloned().collect())
    }
}
