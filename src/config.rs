use crate::auth::AuthConfig;
use crate::completion::CompletionConfig;
use crate::listener::ListenerConfig;
use crate::presence::PresenceConfig;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use ubcore::AppCredentials;
use ubcore::conversation::MemoryConfig;

pub const ENV_DATA_DIR: &str = "USERBOT_DATA_DIR";
pub const ENV_STORE_SECRET: &str = "USERBOT_STORE_SECRET";
pub const ENV_API_KEY: &str = "OPENROUTER_API_KEY";
pub const ENV_MODEL: &str = "USERBOT_MODEL";

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Key material for sealing credential records. Records are stored
    /// unsealed when absent.
    pub store_secret: Option<String>,
    pub default_app: Option<AppCredentials>,
    pub auth: AuthConfig,
    pub presence: PresenceConfig,
    pub memory: MemoryConfig,
    pub listener: ListenerConfig,
    pub completion: CompletionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./userbot-data"),
            store_secret: None,
            default_app: None,
            auth: AuthConfig::default(),
            presence: PresenceConfig::default(),
            memory: MemoryConfig::default(),
            listener: ListenerConfig::default(),
            completion: CompletionConfig::default(),
        }
    }
}

impl Config {
    /// Reads `path` when given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(secret) = lookup(ENV_STORE_SECRET) {
            self.store_secret = Some(secret);
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.completion.api_key = Some(key);
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.completion.model = model;
        }
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir.join("credentials")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}
