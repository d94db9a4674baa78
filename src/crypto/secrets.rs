// ABOUTME: AES-256-GCM cipher for client secrets and refresh tokens at rest
// ABOUTME: Key derived as SHA-256 of a configured secret string, nonce prepended to ciphertext
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

use std::sync::OnceLock;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::errors::{OAuthError, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Symmetric cipher for secrets persisted outside the process.
///
/// The key is the SHA-256 digest of the configured secret string, so any
/// process holding the same configuration can decrypt without a key
/// exchange. Each encryption draws a fresh random 96-bit nonce and
/// prepends it to the ciphertext; the wire format is the urlsafe base64
/// encoding of `nonce || ciphertext || tag`.
pub struct SecretCipher {
    key: [u8; 32],
    cipher: OnceLock<Aes256Gcm>,
}

impl SecretCipher {
    /// Derive a cipher from the configured secret string.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self {
            key,
            cipher: OnceLock::new(),
        }
    }

    fn cipher(&self) -> &Aes256Gcm {
        self.cipher
            .get_or_init(|| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key)))
    }

    /// Encrypt a secret for storage.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Encryption`] if AES-GCM encryption fails.
    pub fn encrypt_secret(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| OAuthError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(combined))
    }

    /// Decrypt a stored secret.
    ///
    /// Returns `None` for anything that is not a valid ciphertext under
    /// this key: bad base64, truncated input, or an authentication-tag
    /// mismatch. Decryption never errors so callers can treat the input
    /// as plaintext when it does not decrypt.
    #[must_use]
    pub fn decrypt_secret(&self, encoded: &str) -> Option<String> {
        let combined = URL_SAFE.decode(encoded).ok()?;
        if combined.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }

    /// Heuristic check for whether a stored value looks like our
    /// ciphertext format. A decodable value shorter than a nonce plus an
    /// authentication tag cannot be one of ours; an empty plaintext still
    /// encrypts to exactly that floor, so the bound is inclusive.
    #[must_use]
    pub fn looks_encrypted(value: &str) -> bool {
        match URL_SAFE.decode(value) {
            Ok(decoded) => decoded.len() >= NONCE_LEN + TAG_LEN,
            Err(_) => false,
        }
    }
}

impl Drop for SecretCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}
