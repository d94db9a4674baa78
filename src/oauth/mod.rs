// ABOUTME: OAuth 2.0 client flows: credentials, PKCE, signed state, and grant execution
// ABOUTME: Supports client_credentials, password, authorization_code, and refresh_token grants
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

pub mod credentials;
pub mod manager;
pub mod pkce;
pub mod response;
pub mod state;

pub use credentials::{GrantType, OAuthCredentials};
pub use manager::{AuthorizationCompletion, OAuthManager};
pub use pkce::PkcePair;
pub use response::TokenResponse;
pub use state::{StatePayload, StateSigner};
