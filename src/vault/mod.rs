//! Credential Vault (C3): encrypted-at-rest storage of OAuth tokens and
//! direct-bank secrets, with ephemeral decrypt-on-access and
//! refresh-before-expiry semantics.
//!
//! AEAD via `aes-gcm`/`chacha20poly1305`: fresh nonce per write,
//! ciphertext+nonce+tag persisted together, key held in process memory
//! only. Only field-level secret encryption is needed here — there is no
//! page-level transparent-data-encryption layer underneath it.

use crate::common::ConnectionId;
use crate::error::{OrchestratorError, Result};
use crate::providers::{Credentials, ProviderAdapter, Tokens};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Threshold at which `access_token` proactively refreshes rather than
/// returning a token that is about to expire.
const REFRESH_THRESHOLD_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedField {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderToken {
    pub id: Uuid,
    pub connection_id: ConnectionId,
    pub provider_id: String,
    pub access_token: EncryptedField,
    pub refresh_token: Option<EncryptedField>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub status: TokenStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankingProviderCredential {
    pub id: Uuid,
    pub connection_id: ConnectionId,
    pub provider_id: String,
    pub environment: String,
    pub encrypted_fields: HashMap<String, EncryptedField>,
    pub notes: Option<String>,
}

/// The AEAD wrapper. A fresh random nonce is generated per write; the key
/// is held only in memory and is never serialized.
struct Cipher {
    cipher: Aes256Gcm,
}

impl Cipher {
    fn new(key_bytes: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    fn encrypt(&self, plaintext: &str) -> EncryptedField {
        let mut nonce_bytes = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .expect("AES-256-GCM encryption over a bounded plaintext does not fail");
        EncryptedField {
            ciphertext,
            nonce: nonce_bytes.to_vec(),
        }
    }

    fn decrypt(&self, field: &EncryptedField) -> Result<String> {
        let nonce = Nonce::from_slice(&field.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, field.ciphertext.as_slice())
            .map_err(|_| {
                OrchestratorError::Internal("AEAD tag mismatch decrypting stored secret".into())
            })?;
        String::from_utf8(plaintext)
            .map_err(|_| OrchestratorError::Internal("decrypted secret was not valid UTF-8".into()))
    }
}

pub struct CredentialVault {
    cipher: Cipher,
    tokens: DashMap<ConnectionId, ProviderToken>,
    direct_credentials: DashMap<ConnectionId, BankingProviderCredential>,
}

impl CredentialVault {
    pub fn new(encryption_key: [u8; 32]) -> Self {
        Self {
            cipher: Cipher::new(&encryption_key),
            tokens: DashMap::new(),
            direct_credentials: DashMap::new(),
        }
    }

    /// Stores a `Tokens` bundle, atomically replacing any existing active
    /// token for the connection (testable property #2: at most one active
    /// token per connection).
    pub fn store_token(&self, connection_id: ConnectionId, provider_id: &str, tokens: &Tokens) {
        let encrypted = ProviderToken {
            id: Uuid::new_v4(),
            connection_id,
            provider_id: provider_id.to_string(),
            access_token: self.cipher.encrypt(&tokens.access_token),
            refresh_token: tokens.refresh_token.as_deref().map(|rt| self.cipher.encrypt(rt)),
            token_type: tokens.token_type.clone(),
            expires_at: tokens.expires_at,
            scopes: tokens.scopes.clone(),
            status: TokenStatus::Active,
        };
        self.tokens.insert(connection_id, encrypted);
    }

    pub fn revoke(&self, connection_id: ConnectionId) -> Result<()> {
        let mut entry = self.tokens.get_mut(&connection_id).ok_or_else(|| {
            OrchestratorError::Internal(format!("no token stored for connection {connection_id}"))
        })?;
        entry.status = TokenStatus::Revoked;
        Ok(())
    }

    /// accessToken(connection): decrypts, and if the token is expired or
    /// within `REFRESH_THRESHOLD_SECS` of expiring, refreshes via the
    /// adapter first and re-persists atomically.
    pub async fn access_token(
        &self,
        connection_id: ConnectionId,
        adapter: &dyn ProviderAdapter,
    ) -> Result<Tokens> {
        let stored = self
            .tokens
            .get(&connection_id)
            .ok_or_else(|| OrchestratorError::AuthFailure("no token on file".into()))?
            .clone();

        if stored.status == TokenStatus::Revoked {
            return Err(OrchestratorError::AuthFailure("token revoked".into()));
        }

        let needs_refresh = stored
            .expires_at
            .map(|exp| (exp - crate::common::now_utc()).num_seconds() <= REFRESH_THRESHOLD_SECS)
            .unwrap_or(false);

        if needs_refresh {
            let refresh_token = stored
                .refresh_token
                .as_ref()
                .ok_or_else(|| OrchestratorError::AuthFailure("no refresh token on file".into()))?;
            let refresh_plain = self.cipher.decrypt(refresh_token)?;
            let refreshed = adapter
                .refresh_access_token(&refresh_plain)
                .await
                .map_err(|_| OrchestratorError::AuthFailure("token refresh failed".into()))?;
            self.store_token(connection_id, &stored.provider_id, &refreshed);
            return Ok(refreshed);
        }

        let access_plain = self.cipher.decrypt(&stored.access_token)?;
        let refresh_plain = match &stored.refresh_token {
            Some(rt) => Some(self.cipher.decrypt(rt)?),
            None => None,
        };
        Ok(Tokens {
            access_token: access_plain,
            refresh_token: refresh_plain,
            expires_at: stored.expires_at,
            token_type: stored.token_type,
            scopes: stored.scopes,
        })
    }

    /// Stores direct-bank credentials after adapter-driven field
    /// validation; fails before write if required fields are missing.
    pub fn store_direct_credentials(
        &self,
        connection_id: ConnectionId,
        provider_id: &str,
        environment: &str,
        fields: &HashMap<String, String>,
        adapter: &crate::providers::adapters::direct_bank::DirectBankAdapter,
        notes: Option<String>,
    ) -> Result<()> {
        adapter.validate_fields(fields)?;
        let encrypted_fields = fields
            .iter()
            .map(|(k, v)| (k.clone(), self.cipher.encrypt(v)))
            .collect();
        self.direct_credentials.insert(
            connection_id,
            BankingProviderCredential {
                id: Uuid::new_v4(),
                connection_id,
                provider_id: provider_id.to_string(),
                environment: environment.to_string(),
                encrypted_fields,
                notes,
            },
        );
        Ok(())
    }

    pub fn access_direct_credentials(&self, connection_id: ConnectionId) -> Result<Credentials> {
        let stored = self.direct_credentials.get(&connection_id).ok_or_else(|| {
            OrchestratorError::AuthFailure("no direct-bank credentials on file".into())
        })?;
        let mut plain = HashMap::new();
        for (key, field) in stored.encrypted_fields.iter() {
            plain.insert(key.clone(), self.cipher.decrypt(field)?);
        }
        Ok(Credentials::DirectFields(plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::adapters::cursor_aggregator::CursorAggregatorAdapter;

    fn vault() -> CredentialVault {
        CredentialVault::new([7u8; 32])
    }

    #[test]
    fn round_trips_access_token_through_encryption() {
        let vault = vault();
        let connection_id = Uuid::new_v4();
        let tokens = Tokens {
            access_token: "secret-access".into(),
            refresh_token: Some("secret-refresh".into()),
            expires_at: Some(crate::common::now_utc() + chrono::Duration::hours(1)),
            token_type: "bearer".into(),
            scopes: vec!["accounts".into()],
        };
        vault.store_token(connection_id, "plaid-like", &tokens);
        let stored = vault.tokens.get(&connection_id).unwrap();
        assert_ne!(stored.access_token.ciphertext, tokens.access_token.as_bytes());
    }

    #[tokio::test]
    async fn revoked_token_fails_closed_on_access() {
        let vault = vault();
        let connection_id = Uuid::new_v4();
        let adapter = CursorAggregatorAdapter::new("plaid-like");
        vault.store_token(
            connection_id,
            "plaid-like",
            &Tokens {
                access_token: "a".into(),
                refresh_token: None,
                expires_at: Some(crate::common::now_utc() + chrono::Duration::hours(1)),
                token_type: "bearer".into(),
                scopes: vec![],
            },
        );
        vault.revoke(connection_id).unwrap();
        let err = vault.access_token(connection_id, &adapter).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AuthFailure(_)));
    }

    #[tokio::test]
    async fn access_token_refreshes_when_near_expiry() {
        let vault = vault();
        let connection_id = Uuid::new_v4();
        let adapter = CursorAggregatorAdapter::new("plaid-like");
        vault.store_token(
            connection_id,
            "plaid-like",
            &Tokens {
                access_token: "about-to-expire".into(),
                refresh_token: Some("refresh-me".into()),
                expires_at: Some(crate::common::now_utc() + chrono::Duration::seconds(30)),
                token_type: "bearer".into(),
                scopes: vec![],
            },
        );
        let refreshed = vault.access_token(connection_id, &adapter).await.unwrap();
        assert!(refreshed.access_token.starts_with("refreshed-"));
    }
}
