// ABOUTME: Unified error type for the OAuth client and token-storage subsystem
// ABOUTME: Distinguishes configuration, transient, protocol, authorization, and storage failures
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

//! Error handling for OAuth flows and token storage.
//!
//! The variants follow the failure classes the subsystem cares about:
//! configuration errors fail fast and are never retried, transient
//! network/HTTP failures are retried with backoff until exhaustion,
//! protocol errors (well-formed but unusable responses) fail immediately,
//! authorization-state errors are security failures, and storage errors
//! separate advisory reads (swallowed by callers) from token writes
//! (always surfaced).

use thiserror::Error;

/// Errors produced by OAuth flows, state validation, and token storage.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// The credential set is unusable as configured (e.g. password grant
    /// without username/password). Never retried.
    #[error("{0}")]
    InvalidConfig(String),

    /// The credential set names a grant type this subsystem does not
    /// implement. Raised before any network call.
    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// A token-endpoint exchange failed after exhausting its retry budget,
    /// or the authorization-code direct fallback was rejected.
    #[error("{0}")]
    TokenExchange(String),

    /// The token endpoint answered 2xx but the body carried no usable
    /// access token. Not retried.
    #[error("{0}")]
    Protocol(String),

    /// The authorization server rejected a refresh-token exchange,
    /// typically 400 `invalid_grant`. The stored record cannot self-heal.
    #[error("Refresh token invalid or expired: {0}")]
    RefreshTokenInvalid(String),

    /// Signed-state validation failed: tampered payload, gateway mismatch,
    /// replay of an already-consumed state, or missing signing secret.
    #[error("{0}")]
    AuthorizationState(String),

    /// A token write could not be persisted. Surfaced to the caller after
    /// rollback; writing a token is not advisory.
    #[error("Token storage failed: {0}")]
    TokenStorage(String),

    /// Secret encryption failed. Decryption failures never surface here;
    /// they degrade to `None` at the cipher boundary.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Transport-level HTTP failure (connect, timeout, TLS).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Database failure below the storage contract.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Credential set or token response (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OAuthError>;
