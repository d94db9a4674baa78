// ABOUTME: End-to-end tests for the interactive authorization-code flow with PKCE
// ABOUTME: Covers state single-use, gateway binding, tamper rejection, and token persistence
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use common::{create_test_store, MockTokenServer, ScriptedResponse};
use forge_oauth::oauth::{GrantType, OAuthCredentials, OAuthManager};
use forge_oauth::OAuthError;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use url::Url;

const SECRET: &str = "test-encryption-secret";

fn credentials(token_url: &str) -> OAuthCredentials {
    OAuthCredentials {
        grant_type: GrantType::AuthorizationCode,
        client_id: "test_client".into(),
        client_secret: Some("test_secret".into()),
        token_url: token_url.into(),
        authorization_url: Some("https://oauth.example.com/authorize".into()),
        redirect_uri: Some("https://gateway.example.com/callback".into()),
        scopes: vec!["read".into(), "write".into()],
        username: None,
        password: None,
    }
}

fn query_param(url: &str, key: &str) -> Option<String> {
    Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

#[tokio::test]
async fn initiate_builds_pkce_authorization_url() {
    let manager = OAuthManager::new().with_encryption_secret(SECRET);
    let creds = credentials("https://oauth.example.com/token");

    let start = manager
        .initiate_authorization_code_flow("gw-1", &creds, "user@example.com")
        .await
        .unwrap();

    assert_eq!(start.gateway_id, "gw-1");
    assert!(start.authorization_url.starts_with("https://oauth.example.com/authorize?"));
    assert_eq!(query_param(&start.authorization_url, "client_id").as_deref(), Some("test_client"));
    assert_eq!(query_param(&start.authorization_url, "response_type").as_deref(), Some("code"));
    assert_eq!(query_param(&start.authorization_url, "scope").as_deref(), Some("read write"));
    assert_eq!(
        query_param(&start.authorization_url, "state").as_deref(),
        Some(start.state.as_str())
    );
    assert_eq!(
        query_param(&start.authorization_url, "code_challenge_method").as_deref(),
        Some("S256")
    );
    assert!(query_param(&start.authorization_url, "code_challenge").is_some());
}

#[tokio::test]
async fn complete_flow_succeeds_exactly_once() {
    let server = MockTokenServer::always(ScriptedResponse::json_ok(
        r#"{"access_token":"code_token","refresh_token":"code_refresh","expires_in":3600,"sub":"alice"}"#,
    ))
    .await;

    let store = create_test_store().await.unwrap();
    let manager = OAuthManager::new()
        .with_encryption_secret(SECRET)
        .with_token_store(Arc::clone(&store));
    let creds = credentials(&server.token_url);

    let start = manager
        .initiate_authorization_code_flow("gw-1", &creds, "user@example.com")
        .await
        .unwrap();
    let completion = manager
        .complete_authorization_code_flow("gw-1", "auth_code_123", &start.state, &creds)
        .await
        .unwrap();

    assert!(completion.success);
    assert_eq!(completion.user_id, "alice");
    assert!(completion.expires_at.is_some());

    // The exchange carried the code and the PKCE verifier matching the
    // challenge from the authorization URL.
    assert_eq!(server.last_param("grant_type").as_deref(), Some("authorization_code"));
    assert_eq!(server.last_param("code").as_deref(), Some("auth_code_123"));
    let verifier = server.last_param("code_verifier").unwrap();
    let challenge = query_param(&start.authorization_url, "code_challenge").unwrap();
    assert_eq!(URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())), challenge);

    // Tokens were persisted under the derived user id.
    assert_eq!(
        store.get_user_token("gw-1", "user@example.com", 0).await.as_deref(),
        Some("code_token")
    );

    // Replaying the same state must fail.
    let err = manager
        .complete_authorization_code_flow("gw-1", "auth_code_123", &start.state, &creds)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::AuthorizationState(_)));
}

#[tokio::test]
async fn complete_rejects_wrong_gateway() {
    let server = MockTokenServer::always(ScriptedResponse::json_ok(
        r#"{"access_token":"never_exchanged"}"#,
    ))
    .await;

    let store = create_test_store().await.unwrap();
    let manager = OAuthManager::new()
        .with_encryption_secret(SECRET)
        .with_token_store(store);
    let creds = credentials(&server.token_url);

    let start = manager
        .initiate_authorization_code_flow("gw-1", &creds, "user@example.com")
        .await
        .unwrap();
    let err = manager
        .complete_authorization_code_flow("gw-2", "code", &start.state, &creds)
        .await
        .unwrap_err();

    assert!(matches!(err, OAuthError::AuthorizationState(_)));
    assert_eq!(server.hits(), 0, "no exchange may happen for a mismatched gateway");
}

#[tokio::test]
async fn complete_rejects_tampered_state() {
    let server = MockTokenServer::always(ScriptedResponse::json_ok(
        r#"{"access_token":"never_exchanged"}"#,
    ))
    .await;

    let manager = OAuthManager::new().with_encryption_secret(SECRET);
    let creds = credentials(&server.token_url);

    let start = manager
        .initiate_authorization_code_flow("gw-1", &creds, "user@example.com")
        .await
        .unwrap();

    let mut bytes = URL_SAFE.decode(&start.state).unwrap();
    bytes[0] ^= 0x01;
    let tampered = URL_SAFE.encode(bytes);

    let err = manager
        .complete_authorization_code_flow("gw-1", "code", &tampered, &creds)
        .await
        .unwrap_err();
    assert!(matches!(err, OAuthError::AuthorizationState(_)));
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn user_id_falls_back_to_client_id() {
    let server = MockTokenServer::always(ScriptedResponse::json_ok(
        r#"{"access_token":"anonymous_token","expires_in":3600}"#,
    ))
    .await;

    let manager = OAuthManager::new().with_encryption_secret(SECRET);
    let creds = credentials(&server.token_url);

    let start = manager
        .initiate_authorization_code_flow("gw-1", &creds, "user@example.com")
        .await
        .unwrap();
    let completion = manager
        .complete_authorization_code_flow("gw-1", "code", &start.state, &creds)
        .await
        .unwrap();

    assert_eq!(completion.user_id, "test_client");
    // No store attached, so expiry bookkeeping is not this flow's job.
    assert!(completion.expires_at.is_none());
}

#[tokio::test]
async fn upstream_rejection_is_a_token_exchange_error() {
    let server = MockTokenServer::always(ScriptedResponse::error(400)).await;

    let manager = OAuthManager::new()
        .with_encryption_secret(SECRET)
        .with_max_retries(1);
    let creds = credentials(&server.token_url);

    let start = manager
        .initiate_authorization_code_flow("gw-1", &creds, "user@example.com")
        .await
        .unwrap();
    let err = manager
        .complete_authorization_code_flow("gw-1", "bad_code", &start.state, &creds)
        .await
        .unwrap_err();

    assert!(err
        .to_string()
        .contains("Failed to exchange code for token after 1 attempts"));
}
