// ABOUTME: Token-endpoint response parsing for JSON and form-encoded bodies
// ABOUTME: One response type regardless of wire format, plus user identity extraction
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::{OAuthError, Result};
use crate::oauth::credentials::OAuthCredentials;

/// A successful token-endpoint response.
///
/// Servers disagree on the wire format: most answer JSON, some answer
/// `application/x-www-form-urlencoded`, and `expires_in` arrives as a
/// number or a numeric string depending on the vendor. Both paths land
/// in this one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// Vendor extension fields (`sub`, `user_id`, `id`, and anything else).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenResponse {
    /// Scope string split on whitespace where present.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default()
    }
}

/// Accept `expires_in` as an integer, a float, or a numeric string.
fn lenient_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Parse a token-endpoint response body.
///
/// Tries JSON first, then falls back to form decoding. Either way the
/// body must yield a non-empty `access_token`.
///
/// # Errors
///
/// Returns [`OAuthError::Protocol`] when no access token can be
/// extracted from the body.
pub fn parse_token_body(body: &str) -> Result<TokenResponse> {
    if let Ok(response) = serde_json::from_str::<TokenResponse>(body) {
        if !response.access_token.is_empty() {
            return Ok(response);
        }
    }

    let mut access_token = None;
    let mut token_type = None;
    let mut expires_in = None;
    let mut refresh_token = None;
    let mut scope = None;
    let mut extra = Map::new();
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        match key.as_ref() {
            "access_token" => access_token = Some(value.into_owned()),
            "token_type" => token_type = Some(value.into_owned()),
            "expires_in" => expires_in = value.parse().ok(),
            "refresh_token" => refresh_token = Some(value.into_owned()),
            "scope" => scope = Some(value.into_owned()),
            other => {
                extra.insert(other.to_owned(), Value::String(value.into_owned()));
            }
        }
    }

    match access_token {
        Some(token) if !token.is_empty() => Ok(TokenResponse {
            access_token: token,
            token_type,
            expires_in,
            refresh_token,
            scope,
            extra,
        }),
        _ => Err(OAuthError::Protocol("No access_token in response".into())),
    }
}

/// Decide which user identity a token response belongs to.
///
/// Priority is the `sub` claim, then `user_id`, then `id`, then the
/// configured client id, and finally a fixed placeholder.
#[must_use]
pub fn extract_user_id(response: &TokenResponse, credentials: &OAuthCredentials) -> String {
    for key in ["sub", "user_id", "id"] {
        if let Some(value) = response.extra.get(key) {
            match value {
                Value::String(s) if !s.is_empty() => return s.clone(),
                Value::Number(n) => return n.to_string(),
                _ => {}
            }
        }
    }
    if !credentials.client_id.is_empty() {
        return credentials.client_id.clone();
    }
    "unknown_user".into()
}
