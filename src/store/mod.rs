pub mod filestore;
pub mod memory;

pub use filestore::FileCredentialStore;
pub use memory::InMemoryCredentialStore;
pub use ubcore::store::{CredentialStore, StoreError};
