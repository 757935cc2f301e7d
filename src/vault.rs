// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Symmetric encryption of stored remote-server tokens.
//!
//! Tokens are sealed with AES-256-GCM under one process-wide key. The
//! stored form is URL-safe base64 of `nonce (12 bytes) || ciphertext || tag`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

use crate::error::VaultError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Holds the read-only key used to seal and open server tokens
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("has_key", &self.cipher.is_some())
            .finish()
    }
}

impl CredentialVault {
    /// Build a vault from a base64-encoded 32 byte key.
    ///
    /// `None` yields a vault without a key; every decrypt then fails with
    /// [`VaultError::MissingKey`].
    pub fn new(encoded_key: Option<&str>) -> Result<Self, VaultError> {
        let Some(encoded_key) = encoded_key.map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(Self { cipher: None });
        };

        let key = STANDARD
            .decode(encoded_key)
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| VaultError::InvalidKey(format!("expected 32 bytes, got {}", key.len())))?;

        Ok(Self {
            cipher: Some(cipher),
        })
    }

    /// Generate a fresh random key, base64 encoded
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        STANDARD.encode(key)
    }

    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let cipher = self.cipher.as_ref().ok_or(VaultError::MissingKey)?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut token = Vec::with_capacity(NONCE_LEN + sealed.len());
        token.extend_from_slice(nonce.as_slice());
        token.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let cipher = self.cipher.as_ref().ok_or(VaultError::MissingKey)?;

        let raw = URL_SAFE_NO_PAD
            .decode(ciphertext.trim())
            .map_err(|e| VaultError::MalformedCiphertext(e.to_string()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::MalformedCiphertext(format!(
                "{} bytes is shorter than nonce and tag",
                raw.len()
            )));
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::DecryptionFailed)?;

        String::from_utf8(plaintext)
            .map_err(|_| VaultError::MalformedCiphertext("plaintext is not UTF-8".to_string()))
    }
}
