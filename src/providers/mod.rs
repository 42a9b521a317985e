//! Provider Registry & Adapters (C2): a uniform capability descriptor plus
//! adapter trait that every concrete provider implements, and a registry
//! that resolves a provider_id string to an adapter at process start.
//!
//! Components are registered by string id and resolved through a uniform
//! trait object. The engine (C4) and vault (C3) hold zero provider
//! conditionals; all per-provider behavior lives behind this trait.

pub mod adapters;

use crate::common::{IntegrationType, Metadata};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub provider_id: String,
    pub display_name: String,
    pub integration_type: IntegrationType,
    pub supported_countries: Vec<String>,
    pub supports_accounts: bool,
    pub supports_transactions: bool,
    pub supports_balances: bool,
    pub sandbox_available: bool,
    pub production_available: bool,
    /// True when a single call returns transactions for every account on
    /// the connection (the connection-level fast path); false routes the
    /// engine to one call per `ProviderAccount`.
    pub connection_level_transactions: bool,
}

/// Ephemeral plaintext token bundle. Never persisted directly — the vault
/// is the only component that encrypts/decrypts; this type only ever lives
/// on a stack or in a short-lived `Result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUserInfo {
    pub provider_user_id: String,
    pub display_name: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAccountFields {
    pub external_account_id: String,
    pub account_type: String,
    pub currency: String,
    pub balance: f64,
    pub iban: Option<String>,
    pub status: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstitutionFingerprint {
    pub institution_id: String,
    pub institution_display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAccountsResult {
    pub accounts: Vec<RawAccountFields>,
    pub institution: InstitutionFingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransactionFields {
    pub external_transaction_id: String,
    pub external_account_id: String,
    pub date: DateTime<Utc>,
    pub value_date: Option<DateTime<Utc>>,
    /// Signed amount; sign indicates credit (positive) vs debit (negative).
    pub amount: f64,
    pub currency: String,
    pub description: String,
    pub merchant_name: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    pub booking_status_pending: bool,
    pub transaction_type_code: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncActionKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDelta {
    pub action: SyncActionKind,
    pub fields: RawTransactionFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsPage {
    pub deltas: Vec<TransactionDelta>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Plaintext credentials handed to an adapter for a single call. For
/// OAuth-style providers this is the decrypted `Tokens`; for direct-bank
/// providers it is the decrypted field map. Kept as one enum so the engine
/// can stay credential-shape-agnostic.
#[derive(Debug, Clone)]
pub enum Credentials {
    OAuth(Tokens),
    DirectFields(std::collections::HashMap<String, String>),
}

/// The uniform adapter interface every provider implements. Methods
/// not meaningful for a given `integration_type` return
/// `PermanentProviderError` rather than panicking, so the engine can call
/// through the trait object uniformly.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn descriptor(&self) -> &CapabilityDescriptor;

    fn get_authorization_url(&self, state: &str, redirect_uri: &str) -> Result<String> {
        let _ = (state, redirect_uri);
        Err(OrchestratorError::PermanentProviderError(format!(
            "{} does not support oauth_redirect",
            self.descriptor().provider_id
        )))
    }

    async fn create_link_token(&self, user_id: &str) -> Result<String> {
        let _ = user_id;
        Err(OrchestratorError::PermanentProviderError(format!(
            "{} does not support link_token_exchange",
            self.descriptor().provider_id
        )))
    }

    async fn exchange_code_for_token(&self, code: &str) -> Result<Tokens>;

    async fn fetch_user_info(&self, credentials: &Credentials) -> Result<ProviderUserInfo>;

    async fn fetch_raw_accounts(&self, credentials: &Credentials) -> Result<RawAccountsResult>;

    async fn sync_transactions(
        &self,
        credentials: &Credentials,
        cursor: Option<&str>,
        account_external_id: Option<&str>,
    ) -> Result<TransactionsPage>;

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<Tokens>;
}

/// Resolves provider_id strings to adapters, populated at process start
/// from configuration.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: Arc<DashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            adapters: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.descriptor().provider_id.clone(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(provider_id)
            .map(|a| a.clone())
            .ok_or_else(|| OrchestratorError::ProviderNotFound(provider_id.to_string()))
    }

    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.adapters.iter().map(|a| a.descriptor().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::adapters::cursor_aggregator::CursorAggregatorAdapter;

    #[test]
    fn unknown_provider_fails_with_provider_not_found() {
        let registry = ProviderRegistry::new();
        let err = registry.get("does-not-exist").unwrap_err();
        assert!(matches!(err, OrchestratorError::ProviderNotFound(_)));
    }

    #[test]
    fn registered_provider_is_resolvable_by_id() {
        let registry = ProviderRegistry::new();
        let adapter = Arc::new(CursorAggregatorAdapter::new("plaid-like"));
        registry.register(adapter);
        assert!(registry.get("plaid-like").is_ok());
    }
}
