// ABOUTME: OAuth credential set describing how to reach a token endpoint
// ABOUTME: Grant type selection plus the endpoint, client, and scope configuration per gateway
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

use serde::{Deserialize, Serialize};

/// The grant this credential set authorizes.
///
/// Unknown values deserialize into `Other` so a stored configuration with
/// a grant this subsystem does not implement is rejected at execution
/// time with the grant name intact, not at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    ClientCredentials,
    Password,
    AuthorizationCode,
    #[serde(untagged)]
    Other(String),
}

impl GrantType {
    /// The wire name sent as the `grant_type` form field.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ClientCredentials => "client_credentials",
            Self::Password => "password",
            Self::AuthorizationCode => "authorization_code",
            Self::Other(name) => name,
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-gateway OAuth configuration.
///
/// Stored as JSON alongside the gateway record. The client secret may be
/// held encrypted at rest; resolution happens at exchange time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub grant_type: GrantType,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub token_url: String,
    /// Authorization endpoint, required only for the interactive
    /// authorization-code flow.
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Resource-owner username, password grant only.
    #[serde(default)]
    pub username: Option<String>,
    /// Resource-owner password, password grant only.
    #[serde(default)]
    pub password: Option<String>,
}

impl OAuthCredentials {
    /// Scopes joined with single spaces, `None` when empty.
    #[must_use]
    pub fn scope_param(&self) -> Option<String> {
        if self.scopes.is_empty() {
            None
        } else {
            Some(self.scopes.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_grants_deserialize_from_snake_case() {
        let g: GrantType = serde_json::from_str("\"client_credentials\"").unwrap();
        assert_eq!(g, GrantType::ClientCredentials);
        let g: GrantType = serde_json::from_str("\"authorization_code\"").unwrap();
        assert_eq!(g, GrantType::AuthorizationCode);
    }

    #[test]
    fn unknown_grant_preserves_name() {
        let g: GrantType = serde_json::from_str("\"device_code\"").unwrap();
        assert_eq!(g, GrantType::Other("device_code".into()));
        assert_eq!(g.as_str(), "device_code");
    }

    #[test]
    fn scope_param_joins_with_spaces() {
        let creds = OAuthCredentials {
            grant_type: GrantType::ClientCredentials,
            client_id: "client".into(),
            client_secret: Some("secret".into()),
            token_url: "https://auth.example.com/token".into(),
            authorization_url: None,
            redirect_uri: None,
            scopes: vec!["read".into(), "write".into()],
            username: None,
            password: None,
        };
        assert_eq!(creds.scope_param().as_deref(), Some("read write"));
    }

    #[test]
    fn optional_fields_default() {
        let creds: OAuthCredentials = serde_json::from_str(
            r#"{"grant_type":"password","client_id":"c","token_url":"https://t"}"#,
        )
        .unwrap();
        assert!(creds.client_secret.is_none());
        assert!(creds.scopes.is_empty());
        assert_eq!(creds.scope_param(), None);
    }
}
