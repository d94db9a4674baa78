// ABOUTME: Environment-backed runtime settings for OAuth flows and token encryption
// ABOUTME: Missing values degrade with a warning rather than aborting startup
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

use tracing::warn;

/// Default token-endpoint request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default retry budget for transient token-endpoint failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Runtime settings resolved from the process environment.
///
/// `from_env` never fails: absent or malformed values fall back to
/// defaults, and a missing encryption secret degrades secret handling to
/// plaintext pass-through with a logged warning.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Secret string used to derive the AES-256-GCM key for secrets at
    /// rest and the HMAC key for signed authorization state.
    pub encryption_secret: Option<String>,
    /// Per-request timeout for token-endpoint calls, in seconds.
    pub request_timeout_secs: u64,
    /// Retry budget for transient token-endpoint failures.
    pub max_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            encryption_secret: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Settings {
    /// Resolve settings from `AUTH_ENCRYPTION_SECRET`,
    /// `OAUTH_REQUEST_TIMEOUT_SECS`, and `OAUTH_MAX_RETRIES`.
    #[must_use]
    pub fn from_env() -> Self {
        let encryption_secret = std::env::var("AUTH_ENCRYPTION_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        if encryption_secret.is_none() {
            warn!(
                "AUTH_ENCRYPTION_SECRET not set; client secrets will be stored in plaintext \
                 and signed authorization state is unavailable"
            );
        }

        let request_timeout_secs = std::env::var("OAUTH_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        let max_retries = std::env::var("OAUTH_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);

        Self {
            encryption_secret,
            request_timeout_secs,
            max_retries,
        }
    }
}
