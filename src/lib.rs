// ABOUTME: OAuth 2.0 client and token-management subsystem for gateway services
// ABOUTME: Grant flows, PKCE, signed state, at-rest secret encryption, and token lifecycle
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

//! OAuth 2.0 client subsystem for gateway services.
//!
//! Three pieces cooperate:
//!
//! - [`oauth::OAuthManager`] executes grant flows against external
//!   authorization servers: client credentials, resource-owner password,
//!   the interactive authorization-code flow with PKCE and signed state,
//!   and refresh-token exchange. Token-endpoint calls retry transient
//!   failures with exponential backoff and accept both JSON and
//!   form-encoded responses.
//! - [`store::TokenStore`] persists token records per (gateway, user),
//!   decides expiry, refreshes silently through the manager, and
//!   garbage-collects stale records.
//! - [`crypto::SecretCipher`] provides authenticated encryption for
//!   client secrets and tokens at rest, keyed from one configured
//!   secret string shared across processes.
//!
//! ```no_run
//! use forge_oauth::oauth::{GrantType, OAuthCredentials, OAuthManager};
//!
//! # async fn example() -> forge_oauth::Result<()> {
//! let manager = OAuthManager::new();
//! let credentials = OAuthCredentials {
//!     grant_type: GrantType::ClientCredentials,
//!     client_id: "my-client".into(),
//!     client_secret: Some("my-secret".into()),
//!     token_url: "https://auth.example.com/token".into(),
//!     authorization_url: None,
//!     redirect_uri: None,
//!     scopes: vec!["read".into()],
//!     username: None,
//!     password: None,
//! };
//! let token = manager.get_access_token(&credentials).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod errors;
pub mod oauth;
pub mod store;

pub use config::Settings;
pub use errors::{OAuthError, Result};
pub use oauth::{OAuthCredentials, OAuthManager};
pub use store::TokenStore;
