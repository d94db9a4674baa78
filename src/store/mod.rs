// ABOUTME: Token lifecycle persistence: upsert, expiry-aware retrieval, silent refresh, cleanup
// ABOUTME: Also owns durable gateway OAuth configs and single-use pending authorization states
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.

mod records;

pub use records::{ConsumedAuthState, TokenInfo, TokenRecord};

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::crypto::SecretCipher;
use crate::errors::{OAuthError, Result};
use crate::oauth::credentials::OAuthCredentials;
use crate::oauth::manager::OAuthManager;

/// Persists OAuth token records keyed by (gateway, user) and the
/// supporting tables for gateway credential configs and pending
/// authorization states.
///
/// Reads on the request path are advisory: any storage failure degrades
/// to "no token" with a logged warning. Writes are not: `store_tokens`
/// surfaces failures after rollback.
pub struct TokenStore {
    pool: SqlitePool,
    cipher: Option<SecretCipher>,
    /// Retained so silent refresh can build an orchestrator with the
    /// same secret material.
    encryption_secret: Option<String>,
    request_timeout_secs: u64,
    max_retries: u32,
}

impl TokenStore {
    /// Open a store on the given database URL and create the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // A single connection keeps in-memory SQLite databases coherent;
        // file-backed stores serialize writes anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        let store = Self {
            pool,
            cipher: None,
            encryption_secret: None,
            request_timeout_secs: crate::config::DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Open a store configured from resolved settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or migration fails.
    pub async fn from_settings(database_url: &str, settings: &Settings) -> Result<Self> {
        let mut store = Self::connect(database_url).await?;
        if let Some(secret) = &settings.encryption_secret {
            store = store.with_encryption_secret(secret);
        }
        store.request_timeout_secs = settings.request_timeout_secs;
        store.max_retries = settings.max_retries;
        Ok(store)
    }

    /// Enable at-rest encryption of stored tokens. Without this the
    /// store runs in an explicit plaintext mode.
    #[must_use]
    pub fn with_encryption_secret(mut self, secret: &str) -> Self {
        self.cipher = Some(SecretCipher::new(secret));
        self.encryption_secret = Some(secret.to_owned());
        self
    }

    /// The underlying pool, for diagnostics and test setup.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS oauth_tokens (
                gateway_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                app_user_email TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                token_type TEXT,
                expires_at DATETIME,
                scopes TEXT NOT NULL DEFAULT '[]',
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (gateway_id, user_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_oauth_tokens_gateway_email \
             ON oauth_tokens(gateway_id, app_user_email)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS oauth_auth_states (
                state TEXT PRIMARY KEY,
                gateway_id TEXT NOT NULL,
                app_user_email TEXT NOT NULL,
                code_verifier TEXT NOT NULL,
                expires_at DATETIME NOT NULL,
                created_at DATETIME NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS gateways (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                oauth_config TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist a token set for a (gateway, user) pair, inserting or
    /// updating in place. Tokens are encrypted when a cipher is
    /// configured. The whole write is one transaction; on failure it is
    /// rolled back and surfaced.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::TokenStorage`] when the write cannot be
    /// committed.
    #[allow(clippy::too_many_arguments)]
    pub async fn store_tokens(
        &self,
        gateway_id: &str,
        user_id: &str,
        app_user_email: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in: Option<i64>,
        scopes: &[String],
    ) -> Result<TokenRecord> {
        let now = Utc::now();
        let expires_at = expires_in.map(|secs| now + Duration::seconds(secs));
        let stored_access = self.seal(access_token)?;
        let stored_refresh = refresh_token.map(|t| self.seal(t)).transpose()?;
        let scopes_json = serde_json::to_string(scopes)?;

        let result: std::result::Result<TokenRecord, sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r"
                INSERT INTO oauth_tokens (
                    gateway_id, user_id, app_user_email, access_token, refresh_token,
                    token_type, expires_at, scopes, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (gateway_id, user_id)
                DO UPDATE SET
                    app_user_email = EXCLUDED.app_user_email,
                    access_token = EXCLUDED.access_token,
                    refresh_token = EXCLUDED.refresh_token,
                    token_type = EXCLUDED.token_type,
                    expires_at = EXCLUDED.expires_at,
                    scopes = EXCLUDED.scopes,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(gateway_id)
            .bind(user_id)
            .bind(app_user_email)
            .bind(&stored_access)
            .bind(&stored_refresh)
            .bind("Bearer")
            .bind(expires_at)
            .bind(&scopes_json)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let row = sqlx::query(
                "SELECT gateway_id, user_id, app_user_email, access_token, refresh_token, \
                 token_type, expires_at, scopes, created_at, updated_at \
                 FROM oauth_tokens WHERE gateway_id = $1 AND user_id = $2",
            )
            .bind(gateway_id)
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row_to_token_record(&row))
        }
        .await;

        match result {
            Ok(record) => {
                debug!(gateway_id, user_id, "stored oauth tokens");
                Ok(record)
            }
            // The transaction rolls back when dropped without commit.
            Err(e) => Err(OAuthError::TokenStorage(e.to_string())),
        }
    }

    /// Fetch a usable access token for an application user of a gateway.
    ///
    /// Returns the decrypted token when current, attempts a silent
    /// refresh when expired or expiring within `threshold_seconds`, and
    /// returns `None` when nothing usable exists. Storage failures on
    /// this path degrade to `None`.
    pub async fn get_user_token(
        &self,
        gateway_id: &str,
        app_user_email: &str,
        threshold_seconds: i64,
    ) -> Option<String> {
        let record = match self.find_record(gateway_id, app_user_email).await {
            Ok(record) => record?,
            Err(e) => {
                warn!(gateway_id, app_user_email, error = %e, "token lookup failed");
                return None;
            }
        };

        if record.is_expired(threshold_seconds) {
            debug!(gateway_id, app_user_email, "token expired, attempting silent refresh");
            return self.refresh_access_token(&record).await;
        }
        Some(self.unseal(&record.access_token))
    }

    /// Non-secret metadata for a user's token, or `None` when absent.
    /// Storage failures degrade to `None`.
    pub async fn get_token_info(
        &self,
        gateway_id: &str,
        app_user_email: &str,
    ) -> Option<TokenInfo> {
        match self.find_record(gateway_id, app_user_email).await {
            Ok(Some(record)) => Some(TokenInfo {
                user_id: record.user_id.clone(),
                app_user_email: record.app_user_email.clone(),
                token_type: record.token_type.clone(),
                expires_at: record.expires_at,
                scopes: record.scopes.clone(),
                created_at: record.created_at,
                updated_at: record.updated_at,
                is_expired: record.is_expired(0),
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(gateway_id, app_user_email, error = %e, "token info lookup failed");
                None
            }
        }
    }

    /// Delete a user's token record. Returns whether anything was
    /// deleted; storage failures degrade to `false`.
    pub async fn revoke_user_tokens(&self, gateway_id: &str, user_id: &str) -> bool {
        let result = sqlx::query("DELETE FROM oauth_tokens WHERE gateway_id = $1 AND user_id = $2")
            .bind(gateway_id)
            .bind(user_id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(done) => {
                let revoked = done.rows_affected() > 0;
                if revoked {
                    info!(gateway_id, user_id, "revoked oauth tokens");
                }
                revoked
            }
            Err(e) => {
                warn!(gateway_id, user_id, error = %e, "token revocation failed");
                false
            }
        }
    }

    /// Delete token records not updated within the retention window.
    /// Returns the number deleted; storage failures degrade to `0`.
    pub async fn cleanup_expired_tokens(&self, max_age_days: i64) -> u64 {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let result = sqlx::query("DELETE FROM oauth_tokens WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await;
        match result {
            Ok(done) => {
                let count = done.rows_affected();
                if count > 0 {
                    info!(count, max_age_days, "cleaned up stale oauth tokens");
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "token cleanup failed");
                0
            }
        }
    }

    /// Register or update a gateway and its OAuth credential config.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn upsert_gateway(
        &self,
        gateway_id: &str,
        name: &str,
        oauth_config: Option<&OAuthCredentials>,
    ) -> Result<()> {
        let config_json = oauth_config.map(serde_json::to_string).transpose()?;
        sqlx::query(
            r"
            INSERT INTO gateways (id, name, oauth_config) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, oauth_config = EXCLUDED.oauth_config
            ",
        )
        .bind(gateway_id)
        .bind(name)
        .bind(config_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a gateway's stored OAuth credential config.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored config does not
    /// parse.
    pub async fn get_gateway_oauth_config(
        &self,
        gateway_id: &str,
    ) -> Result<Option<OAuthCredentials>> {
        let row = sqlx::query("SELECT oauth_config FROM gateways WHERE id = $1")
            .bind(gateway_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let config: Option<String> = row.get("oauth_config");
        config
            .map(|json| serde_json::from_str(&json).map_err(OAuthError::from))
            .transpose()
    }

    /// Record a pending authorization state bound to its PKCE verifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn store_auth_state(
        &self,
        state: &str,
        gateway_id: &str,
        app_user_email: &str,
        code_verifier: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO oauth_auth_states (state, gateway_id, app_user_email, code_verifier, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(state)
        .bind(gateway_id)
        .bind(app_user_email)
        .bind(code_verifier)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically consume a pending authorization state. The delete and
    /// the read are one statement, so concurrent completion attempts
    /// with the same state see it at most once.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn consume_auth_state(
        &self,
        state: &str,
        gateway_id: &str,
    ) -> Result<Option<ConsumedAuthState>> {
        let row = sqlx::query(
            r"
            DELETE FROM oauth_auth_states
            WHERE state = $1 AND gateway_id = $2 AND expires_at > $3
            RETURNING gateway_id, app_user_email, code_verifier
            ",
        )
        .bind(state)
        .bind(gateway_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ConsumedAuthState {
            gateway_id: row.get("gateway_id"),
            app_user_email: row.get("app_user_email"),
            code_verifier: row.get("code_verifier"),
        }))
    }

    /// Silent refresh: exchange the record's refresh token for a new
    /// token set and update the record in place. Returns the new access
    /// token, or `None` when no refresh is possible. An upstream
    /// rejection deletes the record since it cannot self-heal.
    async fn refresh_access_token(&self, record: &TokenRecord) -> Option<String> {
        let stored_refresh = record.refresh_token.as_deref()?;
        let refresh_token = self.unseal(stored_refresh);

        let credentials = match self.get_gateway_oauth_config(&record.gateway_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!(gateway_id = %record.gateway_id, "no gateway config, cannot refresh");
                return None;
            }
            Err(e) => {
                warn!(gateway_id = %record.gateway_id, error = %e, "gateway config lookup failed");
                return None;
            }
        };

        let mut manager = OAuthManager::new()
            .with_request_timeout(StdDuration::from_secs(self.request_timeout_secs))
            .with_max_retries(self.max_retries);
        if let Some(secret) = &self.encryption_secret {
            manager = manager.with_encryption_secret(secret);
        }

        match manager.refresh_token(&credentials, &refresh_token).await {
            Ok(response) => {
                let new_refresh = response
                    .refresh_token
                    .as_deref()
                    .unwrap_or(refresh_token.as_str());
                // A refresh response without a scope field keeps the
                // original grant's scopes.
                let mut scopes = response.scopes();
                if scopes.is_empty() {
                    scopes.clone_from(&record.scopes);
                }
                match self
                    .store_tokens(
                        &record.gateway_id,
                        &record.user_id,
                        &record.app_user_email,
                        &response.access_token,
                        Some(new_refresh),
                        response.expires_in,
                        &scopes,
                    )
                    .await
                {
                    Ok(_) => {
                        info!(gateway_id = %record.gateway_id, user_id = %record.user_id, "silently refreshed oauth token");
                        Some(response.access_token)
                    }
                    Err(e) => {
                        warn!(gateway_id = %record.gateway_id, error = %e, "failed to persist refreshed token");
                        None
                    }
                }
            }
            // Only an upstream rejection proves the refresh token dead.
            Err(e @ OAuthError::RefreshTokenInvalid(_)) => {
                warn!(gateway_id = %record.gateway_id, user_id = %record.user_id, error = %e,
                    "refresh rejected, deleting token record");
                let _ = self
                    .revoke_user_tokens(&record.gateway_id, &record.user_id)
                    .await;
                None
            }
            // Transport and other transient failures keep the record;
            // the refresh token may still work on the next read.
            Err(e) => {
                warn!(gateway_id = %record.gateway_id, user_id = %record.user_id, error = %e,
                    "refresh attempt failed, keeping token record");
                None
            }
        }
    }

    /// Most recently updated record for a (gateway, app user) pair.
    async fn find_record(
        &self,
        gateway_id: &str,
        app_user_email: &str,
    ) -> Result<Option<TokenRecord>> {
        let row = sqlx::query(
            "SELECT gateway_id, user_id, app_user_email, access_token, refresh_token, \
             token_type, expires_at, scopes, created_at, updated_at \
             FROM oauth_tokens WHERE gateway_id = $1 AND app_user_email = $2 \
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(gateway_id)
        .bind(app_user_email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row_to_token_record(&row)))
    }

    /// Stored form of a token: ciphertext with a cipher, plaintext
    /// without one.
    fn seal(&self, token: &str) -> Result<String> {
        match &self.cipher {
            Some(cipher) => cipher.encrypt_secret(token),
            None => Ok(token.to_owned()),
        }
    }

    /// Reverse of [`Self::seal`]. A value that does not decrypt is
    /// returned as-is; it predates encryption being enabled.
    fn unseal(&self, stored: &str) -> String {
        match &self.cipher {
            Some(cipher) => cipher
                .decrypt_secret(stored)
                .unwrap_or_else(|| stored.to_owned()),
            None => stored.to_owned(),
        }
    }
}

fn row_to_token_record(row: &SqliteRow) -> TokenRecord {
    let scopes_json: String = row.get("scopes");
    TokenRecord {
        gateway_id: row.get("gateway_id"),
        user_id: row.get("user_id"),
        app_user_email: row.get("app_user_email"),
        access_token: row.get("access_token"),
        refresh_token: row.get("refresh_token"),
        token_type: row.get("token_type"),
        expires_at: row.get("expires_at"),
        scopes: serde_json::from_str(&scopes_json).unwrap_or_default(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("encrypted_at_rest", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}
