//! Sealing of records at rest.
//!
//! Sealed layout: `nonce (12 bytes) || AES-256-GCM ciphertext+tag`. The key is
//! derived from an operator secret with HKDF-SHA256.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const KEY_INFO: &[u8] = b"userbot credential seal v1";
const SEAL_AAD: &[u8] = b"userbot/credential";

#[derive(Debug, Error)]
pub enum SealError {
    #[error("seal key material is empty or has an invalid size")]
    InvalidKey,
    #[error("sealed data is truncated")]
    Truncated,
    #[error("AES-GCM cipher operation failed")]
    CipherError,
}

pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError>;
    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError>;
}

pub struct AesGcmSealer {
    cipher: Aes256Gcm,
}

impl AesGcmSealer {
    pub fn from_secret(secret: &[u8], salt: Option<&[u8]>) -> Result<Self, SealError> {
        if secret.is_empty() {
            return Err(SealError::InvalidKey);
        }
        let hk = Hkdf::<Sha256>::new(salt, secret);
        let mut key = [0u8; KEY_LEN];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|_| SealError::InvalidKey)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SealError::InvalidKey)?;
        Ok(Self { cipher })
    }
}

impl fmt::Debug for AesGcmSealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesGcmSealer(<key>)")
    }
}

impl Sealer for AesGcmSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                aes_gcm::Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| SealError::CipherError)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        if sealed.len() <= NONCE_LEN {
            return Err(SealError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                aes_gcm::Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| SealError::CipherError)
    }
}

/// Stores records as-is. For tests and for running without a configured secret.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSealer;

impl Sealer for PlainSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        Ok(plaintext.to_vec())
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        Ok(sealed.to_vec())
    }
}
