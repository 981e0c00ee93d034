use super::keys::ChatKey;
use serde::{Deserialize, Serialize};

/// A message observed on an account's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub chat: ChatKey,
    pub message_id: i64,
    /// Set when the account owner wrote the message themselves, from any of
    /// their devices.
    pub is_self_authored: bool,
    /// Set for one-to-one conversations.
    pub is_private: bool,
    pub text: String,
}

/// Who the provider says an authorized connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: i64,
    pub display_name: String,
    pub username: Option<String>,
}
