// ABOUTME: Grant-flow orchestration: dispatch, retry with backoff, and the interactive code flow
// ABOUTME: Owns the HTTP token client, secret resolution, and signed-state issuance/consumption
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::config::Settings;
use crate::crypto::SecretCipher;
use crate::errors::{OAuthError, Result};
use crate::oauth::credentials::{GrantType, OAuthCredentials};
use crate::oauth::pkce::PkcePair;
use crate::oauth::response::{extract_user_id, parse_token_body, TokenResponse};
use crate::oauth::state::{StatePayload, StateSigner};
use crate::store::TokenStore;

/// Validity window for a pending authorization state, in seconds.
pub const STATE_TTL_SECS: i64 = 600;

/// Client secrets longer than this are speculatively treated as
/// ciphertext and decryption is attempted before raw use.
const ENCRYPTED_SECRET_LENGTH_HINT: usize = 50;

/// Result of starting an interactive authorization-code flow.
#[derive(Debug, Clone)]
pub struct AuthorizationFlowStart {
    pub authorization_url: String,
    pub state: String,
    pub gateway_id: String,
}

/// Result of completing an interactive authorization-code flow.
#[derive(Debug, Clone)]
pub struct AuthorizationCompletion {
    pub success: bool,
    pub user_id: String,
    /// Absolute token expiry; `None` when no token store is attached
    /// since expiry bookkeeping belongs to the store.
    pub expires_at: Option<DateTime<Utc>>,
}

/// A simple authorization URL plus its anti-forgery state.
#[derive(Debug, Clone)]
pub struct AuthorizationUrl {
    pub authorization_url: String,
    pub state: String,
}

/// Pending authorization kept in process when no token store is attached.
struct PendingAuthorization {
    gateway_id: String,
    app_user_email: String,
    code_verifier: String,
    expires_at: DateTime<Utc>,
}

/// Which exchange a retry loop is serving, for exhaustion messages.
#[derive(Clone, Copy)]
enum ExchangeKind {
    AccessToken,
    CodeExchange,
}

impl ExchangeKind {
    fn exhausted(self, attempts: u32) -> String {
        match self {
            Self::AccessToken => format!("Failed to obtain access token after {attempts} attempts"),
            Self::CodeExchange => {
                format!("Failed to exchange code for token after {attempts} attempts")
            }
        }
    }

    fn exhausted_all(self) -> String {
        match self {
            Self::AccessToken => "Failed to obtain access token after all retry attempts".into(),
            Self::CodeExchange => {
                "Failed to exchange code for token after all retry attempts".into()
            }
        }
    }
}

/// Executes OAuth 2.0 grant flows against external authorization servers.
///
/// Stateless between calls except for pending authorization states, which
/// live in the attached [`TokenStore`] when one is configured and in an
/// in-process map otherwise. Each token exchange is a bounded-timeout
/// POST with retry and exponential backoff for transient failures.
pub struct OAuthManager {
    client: Client,
    request_timeout: Duration,
    max_retries: u32,
    token_store: Option<Arc<TokenStore>>,
    cipher: Option<SecretCipher>,
    signer: Option<StateSigner>,
    local_states: DashMap<String, PendingAuthorization>,
}

impl Default for OAuthManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuthManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            request_timeout: Duration::from_secs(crate::config::DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            token_store: None,
            cipher: None,
            signer: None,
            local_states: DashMap::new(),
        }
    }

    /// Build a manager from resolved settings, wiring the cipher and
    /// state signer when an encryption secret is configured.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let mut manager = Self::new()
            .with_request_timeout(Duration::from_secs(settings.request_timeout_secs))
            .with_max_retries(settings.max_retries);
        if let Some(secret) = &settings.encryption_secret {
            manager = manager.with_encryption_secret(secret);
        }
        manager
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enable secret decryption and signed state using this secret.
    #[must_use]
    pub fn with_encryption_secret(mut self, secret: &str) -> Self {
        self.cipher = Some(SecretCipher::new(secret));
        self.signer = Some(StateSigner::new(secret));
        self
    }

    /// Attach a token store for persistence and durable state tracking.
    #[must_use]
    pub fn with_token_store(mut self, store: Arc<TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Obtain a bare access token for the credential set's grant type.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unusable credential sets, a
    /// token-exchange error once retries are exhausted, and a protocol
    /// error for well-formed responses without an access token.
    pub async fn get_access_token(&self, credentials: &OAuthCredentials) -> Result<String> {
        debug!(grant_type = %credentials.grant_type, "requesting access token");
        match &credentials.grant_type {
            GrantType::ClientCredentials => self.client_credentials_flow(credentials).await,
            GrantType::Password => self.password_flow(credentials).await,
            GrantType::AuthorizationCode => self.authorization_code_fallback(credentials).await,
            GrantType::Other(name) => Err(OAuthError::UnsupportedGrantType(name.clone())),
        }
    }

    async fn client_credentials_flow(&self, credentials: &OAuthCredentials) -> Result<String> {
        let form = self.client_credentials_form(credentials);
        let response = self
            .fetch_token(&credentials.token_url, &form, ExchangeKind::AccessToken)
            .await?;
        Ok(response.access_token)
    }

    async fn password_flow(&self, credentials: &OAuthCredentials) -> Result<String> {
        let (username, password) = match (&credentials.username, &credentials.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (u.clone(), p.clone()),
            _ => {
                return Err(OAuthError::InvalidConfig(
                    "Username and password are required for password grant type".into(),
                ))
            }
        };

        let mut form = vec![
            ("grant_type".to_owned(), "password".to_owned()),
            ("username".to_owned(), username),
            ("password".to_owned(), password),
            ("client_id".to_owned(), credentials.client_id.clone()),
        ];
        if let Some(secret) = self.resolve_client_secret(credentials) {
            form.push(("client_secret".to_owned(), secret));
        }
        if let Some(scope) = credentials.scope_param() {
            form.push(("scope".to_owned(), scope));
        }

        let response = self
            .fetch_token(&credentials.token_url, &form, ExchangeKind::AccessToken)
            .await?;
        Ok(response.access_token)
    }

    /// One-shot non-interactive attempt for credential sets configured
    /// for the authorization-code grant. Some servers accept a
    /// client-credentials-shaped request in this configuration; when the
    /// endpoint rejects it, the caller is pointed at the interactive
    /// two-step flow instead.
    async fn authorization_code_fallback(&self, credentials: &OAuthCredentials) -> Result<String> {
        let form = self.client_credentials_form(credentials);
        match self
            .fetch_token(&credentials.token_url, &form, ExchangeKind::AccessToken)
            .await
        {
            Ok(response) => Ok(response.access_token),
            Err(e) => Err(OAuthError::TokenExchange(format!(
                "Authorization code flow cannot be used for direct token acquisition; \
                 complete the interactive authorization flow instead: {e}"
            ))),
        }
    }

    fn client_credentials_form(&self, credentials: &OAuthCredentials) -> Vec<(String, String)> {
        let mut form = vec![
            ("grant_type".to_owned(), "client_credentials".to_owned()),
            ("client_id".to_owned(), credentials.client_id.clone()),
        ];
        if let Some(secret) = self.resolve_client_secret(credentials) {
            form.push(("client_secret".to_owned(), secret));
        }
        if let Some(scope) = credentials.scope_param() {
            form.push(("scope".to_owned(), scope));
        }
        form
    }

    /// Resolve the client secret for wire use. Secrets longer than the
    /// length hint may be ciphertext from storage; attempt decryption and
    /// fall back to the raw value when it does not decrypt.
    fn resolve_client_secret(&self, credentials: &OAuthCredentials) -> Option<String> {
        let secret = credentials.client_secret.clone()?;
        if secret.len() > ENCRYPTED_SECRET_LENGTH_HINT {
            if let Some(cipher) = &self.cipher {
                if let Some(decrypted) = cipher.decrypt_secret(&secret) {
                    return Some(decrypted);
                }
            }
        }
        Some(secret)
    }

    /// POST a token request with retry and exponential backoff.
    ///
    /// Transport failures and non-2xx statuses are transient and retried
    /// with `2^attempt` second sleeps between attempts. A 2xx body
    /// without an access token is a protocol error and returned
    /// immediately. `max_retries` of zero still makes one attempt.
    async fn fetch_token(
        &self,
        token_url: &str,
        form: &[(String, String)],
        kind: ExchangeKind,
    ) -> Result<TokenResponse> {
        let attempts = self.max_retries.max(1);
        for attempt in 0..attempts {
            match self.post_form(token_url, form).await {
                Ok(body) => {
                    return parse_token_body(&body);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "token request failed");
                    if attempt + 1 >= attempts {
                        return Err(OAuthError::TokenExchange(kind.exhausted(attempts)));
                    }
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }
        // Unreachable with attempts >= 1, kept so no low-level error
        // class can escape the loop unconverted.
        Err(OAuthError::TokenExchange(kind.exhausted_all()))
    }

    /// Single POST attempt. Returns the body text on 2xx, an error
    /// otherwise.
    async fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<String> {
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .form(form)
            .send()
            .await?;
        let response = response.error_for_status()?;
        Ok(response.text().await?)
    }

    /// Build an authorization URL with a random anti-forgery state.
    ///
    /// This is the non-PKCE convenience surface; the interactive flow
    /// with PKCE and signed state is [`Self::initiate_authorization_code_flow`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the credential set has no
    /// authorization endpoint or redirect URI, or the endpoint is not a
    /// valid URL.
    pub fn get_authorization_url(&self, credentials: &OAuthCredentials) -> Result<AuthorizationUrl> {
        let state = Uuid::new_v4().to_string();
        let authorization_url = self.build_authorization_url(credentials, &state, None)?;
        Ok(AuthorizationUrl {
            authorization_url,
            state,
        })
    }

    /// Start the interactive authorization-code flow for a gateway.
    ///
    /// Generates a PKCE pair and a signed state binding the gateway and
    /// application user, records the pending authorization (single-use),
    /// and returns the URL to redirect the user to.
    ///
    /// # Errors
    ///
    /// Returns an authorization-state error when no signing secret is
    /// configured, and a configuration error for incomplete credential
    /// sets.
    pub async fn initiate_authorization_code_flow(
        &self,
        gateway_id: &str,
        credentials: &OAuthCredentials,
        app_user_email: &str,
    ) -> Result<AuthorizationFlowStart> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            OAuthError::AuthorizationState(
                "Signed authorization state unavailable: encryption secret not configured".into(),
            )
        })?;

        let pkce = PkcePair::generate();
        let payload = StatePayload::new(gateway_id, app_user_email);
        let state = signer.sign(&payload)?;
        let expires_at = Utc::now() + chrono::Duration::seconds(STATE_TTL_SECS);

        if let Some(store) = &self.token_store {
            store
                .store_auth_state(
                    &state,
                    gateway_id,
                    app_user_email,
                    &pkce.code_verifier,
                    expires_at,
                )
                .await?;
        } else {
            self.local_states.insert(
                state.clone(),
                PendingAuthorization {
                    gateway_id: gateway_id.to_owned(),
                    app_user_email: app_user_email.to_owned(),
                    code_verifier: pkce.code_verifier.clone(),
                    expires_at,
                },
            );
        }

        let authorization_url = self.build_authorization_url(credentials, &state, Some(&pkce))?;
        debug!(gateway_id, "authorization flow initiated");
        Ok(AuthorizationFlowStart {
            authorization_url,
            state,
            gateway_id: gateway_id.to_owned(),
        })
    }

    /// Complete the interactive flow with the callback's code and state.
    ///
    /// Validates the state signature and gateway binding, consumes the
    /// pending authorization atomically (a second completion with the
    /// same state fails), exchanges the code with the bound PKCE
    /// verifier, and persists the tokens when a store is attached.
    ///
    /// # Errors
    ///
    /// Returns an authorization-state error for tampered, mismatched,
    /// replayed, or expired states, a token-exchange error when the
    /// upstream rejects the code, and a storage error if persisting the
    /// tokens fails.
    pub async fn complete_authorization_code_flow(
        &self,
        gateway_id: &str,
        code: &str,
        state: &str,
        credentials: &OAuthCredentials,
    ) -> Result<AuthorizationCompletion> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            OAuthError::AuthorizationState(
                "Signed authorization state unavailable: encryption secret not configured".into(),
            )
        })?;
        let payload = signer.verify_for_gateway(state, gateway_id).ok_or_else(|| {
            OAuthError::AuthorizationState(
                "Invalid authorization state: signature or gateway mismatch".into(),
            )
        })?;

        let code_verifier = self.consume_state(state, gateway_id).await?;

        let mut form = vec![
            ("grant_type".to_owned(), "authorization_code".to_owned()),
            ("code".to_owned(), code.to_owned()),
            ("client_id".to_owned(), credentials.client_id.clone()),
            ("code_verifier".to_owned(), code_verifier),
        ];
        if let Some(redirect_uri) = &credentials.redirect_uri {
            form.push(("redirect_uri".to_owned(), redirect_uri.clone()));
        }
        if let Some(secret) = self.resolve_client_secret(credentials) {
            form.push(("client_secret".to_owned(), secret));
        }

        let response = self
            .fetch_token(&credentials.token_url, &form, ExchangeKind::CodeExchange)
            .await?;
        let user_id = extract_user_id(&response, credentials);

        let expires_at = if let Some(store) = &self.token_store {
            let record = store
                .store_tokens(
                    gateway_id,
                    &user_id,
                    &payload.app_user_email,
                    &response.access_token,
                    response.refresh_token.as_deref(),
                    response.expires_in,
                    &response.scopes(),
                )
                .await?;
            record.expires_at
        } else {
            None
        };

        debug!(gateway_id, %user_id, "authorization flow completed");
        Ok(AuthorizationCompletion {
            success: true,
            user_id,
            expires_at,
        })
    }

    /// Atomically consume a pending authorization state, returning its
    /// bound code verifier. The store path and the in-process path both
    /// enforce single use under concurrent completion attempts.
    async fn consume_state(&self, state: &str, gateway_id: &str) -> Result<String> {
        let replay_error = || {
            OAuthError::AuthorizationState(
                "Authorization state not found, expired, or already used".into(),
            )
        };

        if let Some(store) = &self.token_store {
            let consumed = store.consume_auth_state(state, gateway_id).await?;
            return consumed.map(|s| s.code_verifier).ok_or_else(replay_error);
        }

        let now = Utc::now();
        let removed = self.local_states.remove_if(state, |_, pending| {
            pending.gateway_id == gateway_id && pending.expires_at > now
        });
        removed
            .map(|(_, pending)| pending.code_verifier)
            .ok_or_else(replay_error)
    }

    /// Exchange an authorization code directly for a bare access token,
    /// without state tracking or PKCE. Used by callers that manage their
    /// own authorization handshake.
    ///
    /// # Errors
    ///
    /// Returns a token-exchange error once retries are exhausted, or a
    /// protocol error for a response without an access token.
    pub async fn exchange_code_for_token(
        &self,
        credentials: &OAuthCredentials,
        code: &str,
    ) -> Result<String> {
        let mut form = vec![
            ("grant_type".to_owned(), "authorization_code".to_owned()),
            ("code".to_owned(), code.to_owned()),
            ("client_id".to_owned(), credentials.client_id.clone()),
        ];
        if let Some(redirect_uri) = &credentials.redirect_uri {
            form.push(("redirect_uri".to_owned(), redirect_uri.clone()));
        }
        if let Some(secret) = self.resolve_client_secret(credentials) {
            form.push(("client_secret".to_owned(), secret));
        }

        let response = self
            .fetch_token(&credentials.token_url, &form, ExchangeKind::CodeExchange)
            .await?;
        Ok(response.access_token)
    }

    /// Exchange a refresh token for a new token set.
    ///
    /// A single attempt, no retry: the common rejection is 400
    /// `invalid_grant`, which retrying cannot fix.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::RefreshTokenInvalid`] when the server
    /// rejects the refresh token, [`OAuthError::Http`] for transport
    /// failures (the token may still be valid), and a protocol error
    /// when a 2xx response carries no access token.
    pub async fn refresh_token(
        &self,
        credentials: &OAuthCredentials,
        refresh_token: &str,
    ) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type".to_owned(), "refresh_token".to_owned()),
            ("refresh_token".to_owned(), refresh_token.to_owned()),
            ("client_id".to_owned(), credentials.client_id.clone()),
        ];
        if let Some(secret) = self.resolve_client_secret(credentials) {
            form.push(("client_secret".to_owned(), secret));
        }

        // Transport failures stay OAuthError::Http: they say nothing
        // about the refresh token itself.
        let response = self
            .client
            .post(&credentials.token_url)
            .timeout(self.request_timeout)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::RefreshTokenInvalid(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let body = response.text().await?;
        parse_token_body(&body).map_err(|e| match e {
            OAuthError::Protocol(_) => {
                OAuthError::Protocol("No access_token in refresh response".into())
            }
            other => other,
        })
    }

    /// Fetch the current access token for a user of a gateway via the
    /// attached token store, refreshing silently when near expiry.
    /// Returns `None` when no store is attached or no usable token
    /// exists.
    pub async fn get_access_token_for_user(
        &self,
        gateway_id: &str,
        app_user_email: &str,
    ) -> Option<String> {
        let store = self.token_store.as_ref()?;
        store.get_user_token(gateway_id, app_user_email, 0).await
    }

    fn build_authorization_url(
        &self,
        credentials: &OAuthCredentials,
        state: &str,
        pkce: Option<&PkcePair>,
    ) -> Result<String> {
        let authorization_url = credentials.authorization_url.as_deref().ok_or_else(|| {
            OAuthError::InvalidConfig("authorization_url is required for authorization code flow".into())
        })?;
        let redirect_uri = credentials.redirect_uri.as_deref().ok_or_else(|| {
            OAuthError::InvalidConfig("redirect_uri is required for authorization code flow".into())
        })?;

        let mut url = Url::parse(authorization_url)
            .map_err(|e| OAuthError::InvalidConfig(format!("invalid authorization_url: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &credentials.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("response_type", "code");
            if let Some(scope) = credentials.scope_param() {
                query.append_pair("scope", &scope);
            }
            query.append_pair("state", state);
            if let Some(pkce) = pkce {
                query
                    .append_pair("code_challenge", &pkce.code_challenge)
                    .append_pair("code_challenge_method", &pkce.code_challenge_method);
            }
        }
        Ok(url.to_string())
    }
}

impl std::fmt::Debug for OAuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthManager")
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .field("has_token_store", &self.token_store.is_some())
            .field("has_cipher", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}
