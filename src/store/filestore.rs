use async_trait::async_trait;
use log::debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use ubcore::crypto::Sealer;
use ubcore::store::{CredentialStore, Result, StoreError};
use ubcore::{AccountCredential, AccountKey};

const RECORD_EXTENSION: &str = "cred";

/// One sealed JSON file per account under `base_path`.
pub struct FileCredentialStore {
    base_path: PathBuf,
    sealer: Arc<dyn Sealer>,
}

impl FileCredentialStore {
    pub async fn new(path: impl Into<PathBuf>, sealer: Arc<dyn Sealer>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path, sealer })
    }

    fn sanitize_filename(key: &str) -> String {
        key.replace(|c: char| !c.is_alphanumeric() && c != '-', "_")
    }

    fn path_for(&self, account_key: &AccountKey) -> PathBuf {
        self.base_path.join(format!(
            "{}.{RECORD_EXTENSION}",
            Self::sanitize_filename(account_key.as_str())
        ))
    }

    async fn read_sealed(&self, path: &Path) -> Result<Option<AccountCredential>> {
        match fs::read(path).await {
            Ok(data) => {
                let plain = self.sealer.unseal(&data)?;
                serde_json::from_slice(&plain)
                    .map(Some)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Writes next to the target and renames over it so a crash never
    /// leaves a half-written record behind.
    async fn write_sealed(&self, path: &Path, credential: &AccountCredential) -> Result<()> {
        let data = serde_json::to_vec(credential)?;
        let sealed = self.sealer.seal(&data)?;
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        fs::write(&tmp, sealed).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn save(&self, account_key: &AccountKey, credential: &AccountCredential) -> Result<()> {
        self.write_sealed(&self.path_for(account_key), credential)
            .await?;
        debug!(target: "Store/File", "Saved credential for {account_key}");
        Ok(())
    }

    async fn load(&self, account_key: &AccountKey) -> Result<Option<AccountCredential>> {
        self.read_sealed(&self.path_for(account_key)).await
    }

    async fn delete(&self, account_key: &AccountKey) -> Result<()> {
        fs::remove_file(self.path_for(account_key))
            .await
            .or_else(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(StoreError::from)
    }

    async fn list(&self) -> Result<Vec<AccountKey>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(AccountKey::from_phone(stem));
            }
        }
        keys.sort();
        Ok(keys)
    }
}
