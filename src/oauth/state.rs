// ABOUTME: HMAC-signed authorization state for the interactive authorization-code flow
// ABOUTME: Compact JSON payload with an appended SHA-256 HMAC tag, urlsafe base64 encoded
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TAG_LEN: usize = 32;

/// The claims carried inside a signed authorization state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePayload {
    /// Gateway the authorization was initiated for.
    pub gateway_id: String,
    /// Application user on whose behalf tokens will be stored.
    pub app_user_email: String,
    /// Random nonce making each state value unique.
    pub nonce: String,
    /// Issue time, bounds the state's validity window at consume time.
    pub timestamp: DateTime<Utc>,
}

impl StatePayload {
    #[must_use]
    pub fn new(gateway_id: &str, app_user_email: &str) -> Self {
        Self {
            gateway_id: gateway_id.to_owned(),
            app_user_email: app_user_email.to_owned(),
            nonce: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Signs and verifies authorization state values.
///
/// A state is the urlsafe base64 encoding of the compact JSON payload
/// followed by a 32-byte HMAC-SHA256 tag over those JSON bytes. The key
/// is the configured encryption secret, so signing and verification can
/// happen in different processes. Verification is constant-time in the
/// tag comparison.
pub struct StateSigner {
    key: hmac::Key,
}

impl StateSigner {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    /// Produce a signed state for the given payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    pub fn sign(&self, payload: &StatePayload) -> crate::errors::Result<String> {
        let json = serde_json::to_vec(payload)?;
        let tag = hmac::sign(&self.key, &json);

        let mut combined = Vec::with_capacity(json.len() + TAG_LEN);
        combined.extend_from_slice(&json);
        combined.extend_from_slice(tag.as_ref());
        Ok(URL_SAFE.encode(combined))
    }

    /// Verify a state's signature and return its payload.
    ///
    /// Returns `None` for malformed encodings, truncated input, tag
    /// mismatch, or an unparseable payload. This says nothing about
    /// whether the state has already been consumed.
    #[must_use]
    pub fn verify(&self, state: &str) -> Option<StatePayload> {
        let combined = URL_SAFE.decode(state).ok()?;
        if combined.len() <= TAG_LEN {
            return None;
        }
        let (json, tag) = combined.split_at(combined.len() - TAG_LEN);
        hmac::verify(&self.key, json, tag).ok()?;
        serde_json::from_slice(json).ok()
    }

    /// Verify a state and check it was issued for the expected gateway.
    #[must_use]
    pub fn verify_for_gateway(&self, state: &str, gateway_id: &str) -> Option<StatePayload> {
        self.verify(state)
            .filter(|payload| payload.gateway_id == gateway_id)
    }
}

impl std::fmt::Debug for StateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let signer = StateSigner::new("signing-secret");
        let payload = StatePayload::new("gateway-1", "user@example.com");
        let state = signer.sign(&payload).unwrap();

        let verified = signer.verify(&state).unwrap();
        assert_eq!(verified.gateway_id, "gateway-1");
        assert_eq!(verified.app_user_email, "user@example.com");
        assert_eq!(verified.nonce, payload.nonce);
    }

    #[test]
    fn tampered_state_fails() {
        let signer = StateSigner::new("signing-secret");
        let payload = StatePayload::new("gateway-1", "user@example.com");
        let state = signer.sign(&payload).unwrap();

        let mut bytes = URL_SAFE.decode(&state).unwrap();
        bytes[0] ^= 0x01;
        let tampered = URL_SAFE.encode(bytes);
        assert!(signer.verify(&tampered).is_none());
    }

    #[test]
    fn wrong_key_fails() {
        let signer = StateSigner::new("signing-secret");
        let other = StateSigner::new("different-secret");
        let state = signer.sign(&StatePayload::new("g", "u@e")).unwrap();
        assert!(other.verify(&state).is_none());
    }

    #[test]
    fn gateway_mismatch_fails() {
        let signer = StateSigner::new("signing-secret");
        let state = signer
            .sign(&StatePayload::new("gateway-1", "user@example.com"))
            .unwrap();
        assert!(signer.verify_for_gateway(&state, "gateway-1").is_some());
        assert!(signer.verify_for_gateway(&state, "gateway-2").is_none());
    }

    #[test]
    fn garbage_input_fails() {
        let signer = StateSigner::new("signing-secret");
        assert!(signer.verify("not a state").is_none());
        assert!(signer.verify("").is_none());
        assert!(signer.verify(&URL_SAFE.encode(b"short")).is_none());
    }

    #[test]
    fn states_are_unique_per_issue() {
        let signer = StateSigner::new("signing-secret");
        let a = signer.sign(&StatePayload::new("g", "u@e")).unwrap();
        let b = signer.sign(&StatePayload::new("g", "u@e")).unwrap();
        assert_ne!(a, b);
    }
}
