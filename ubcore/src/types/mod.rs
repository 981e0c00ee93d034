pub mod credential;
pub mod keys;
pub mod message;

pub use credential::{AccountCredential, AppCredentials};
pub use keys::{AccountKey, ChatKey, RequesterKey, mask_phone};
pub use message::{AccountProfile, IncomingMessage};
