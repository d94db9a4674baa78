// ABOUTME: Row types for persisted OAuth tokens, pending auth states, and gateway configs
// ABOUTME: Token expiry decisions live on the record so the store and its callers agree
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A persisted token record for one (gateway, user) pair.
///
/// Token fields hold the stored form: ciphertext when a cipher is
/// configured, plaintext in the degraded mode without one. Decryption
/// happens at the store boundary, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub gateway_id: String,
    pub user_id: String,
    pub app_user_email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Whether the token is expired or will expire within the threshold.
    /// A record without an expiry is always treated as expired.
    #[must_use]
    pub fn is_expired(&self, threshold_seconds: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now() + Duration::seconds(threshold_seconds),
            None => true,
        }
    }
}

/// Non-secret metadata view of a token record, for diagnostics. Never
/// carries the token values, encrypted or otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub user_id: String,
    pub app_user_email: String,
    pub token_type: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_expired: bool,
}

/// A pending authorization state consumed from the store. Consumption
/// deleted the row, so this is the only copy of the bound verifier.
#[derive(Debug, Clone)]
pub struct ConsumedAuthState {
    pub gateway_id: String,
    pub app_user_email: String,
    pub code_verifier: String,
}
