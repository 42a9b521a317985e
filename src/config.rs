//! Process-wide configuration, loaded once at startup and held behind an
//! `Arc` thereafter: no ambient mutable config, components take it as an
//! explicit parameter.
//!
//! A flat struct with environment-variable overrides rather than a
//! config-crate hierarchy.

use crate::error::{OrchestratorError, Result};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProviderCredentialConfig {
    pub client_id: String,
    pub client_secret: String,
    pub environment: String,
    pub redirect_uri: String,
    pub webhook_secret: Option<String>,
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base64 or hex-encoded AEAD key material for the credential vault.
    /// Fixed length per the AEAD primitive (32 bytes for AES-256-GCM /
    /// ChaCha20-Poly1305); rejected at startup if the wrong length.
    pub encryption_key: [u8; 32],

    /// Shared secret the external tick source presents as a bearer token.
    pub tick_shared_secret: String,

    /// Bounded worker pool size for concurrent sync runs.
    pub worker_pool_size: usize,

    /// Dispatcher-level deadline bounding one tick's total runtime.
    pub tick_deadline: Duration,

    /// Deadline bounding a single connection's sync run.
    pub run_deadline: Duration,

    /// Timeout for a single vault token-refresh call.
    pub token_refresh_timeout: Duration,

    /// Wall-clock expiry for an acquired connection lease.
    pub lease_expiry: Duration,

    /// Per-provider client credentials and environment tags, keyed by
    /// provider_id.
    pub providers: HashMap<String, ProviderCredentialConfig>,

    /// Batch size per schedule bucket for a single tick (defaults: hourly=20,
    /// daily=50).
    pub batch_size: HashMap<String, usize>,

    pub log_level: String,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, failing fast
    /// (`ConfigurationError`) on malformed required values instead of
    /// silently substituting a default.
    pub fn from_env() -> Result<Self> {
        let encryption_key = decode_encryption_key(
            &std::env::var("ORCHESTRATOR_ENCRYPTION_KEY").map_err(|_| {
                OrchestratorError::ConfigurationError(
                    "ORCHESTRATOR_ENCRYPTION_KEY is required".into(),
                )
            })?,
        )?;

        let tick_shared_secret = std::env::var("ORCHESTRATOR_TICK_SECRET").map_err(|_| {
            OrchestratorError::ConfigurationError("ORCHESTRATOR_TICK_SECRET is required".into())
        })?;

        let worker_pool_size = env_usize("ORCHESTRATOR_WORKER_POOL_SIZE", num_cpus::get().max(4));

        let mut batch_size = HashMap::new();
        batch_size.insert("hourly".to_string(), 20);
        batch_size.insert("every_4h".to_string(), 30);
        batch_size.insert("every_12h".to_string(), 40);
        batch_size.insert("daily".to_string(), 50);
        batch_size.insert("weekly".to_string(), 50);

        Ok(Self {
            encryption_key,
            tick_shared_secret,
            worker_pool_size,
            tick_deadline: Duration::from_secs(env_u64("ORCHESTRATOR_TICK_DEADLINE_SECS", 300)),
            run_deadline: Duration::from_secs(env_u64("ORCHESTRATOR_RUN_DEADLINE_SECS", 180)),
            token_refresh_timeout: Duration::from_secs(env_u64(
                "ORCHESTRATOR_TOKEN_REFRESH_TIMEOUT_SECS",
                20,
            )),
            lease_expiry: Duration::from_secs(env_u64("ORCHESTRATOR_LEASE_EXPIRY_SECS", 600)),
            providers: load_providers_from_env()?,
            batch_size,
            log_level: std::env::var("ORCHESTRATOR_LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        })
    }

    /// Registers a provider's credentials after startup validation; kept
    /// separate from `from_env` so tests can construct a config without
    /// environment-variable plumbing per provider.
    pub fn with_provider(mut self, provider_id: &str, cfg: ProviderCredentialConfig) -> Self {
        self.providers.insert(provider_id.to_string(), cfg);
        self
    }

    pub fn batch_size_for(&self, bucket: &str) -> usize {
        self.batch_size.get(bucket).copied().unwrap_or(20)
    }
}

/// Hydrates the per-provider credential map from `ORCHESTRATOR_PROVIDERS`
/// (a comma-delimited list of provider ids) plus, for each id,
/// `ORCHESTRATOR_PROVIDER_<ID>_{CLIENT_ID,CLIENT_SECRET,ENVIRONMENT,
/// REDIRECT_URI,WEBHOOK_SECRET,RATE_LIMIT_PER_MINUTE}`. An id with no
/// credentials set is rejected at startup rather than silently skipped.
fn load_providers_from_env() -> Result<HashMap<String, ProviderCredentialConfig>> {
    let mut providers = HashMap::new();
    let ids = std::env::var("ORCHESTRATOR_PROVIDERS").unwrap_or_default();
    for provider_id in ids.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let prefix = format!("ORCHESTRATOR_PROVIDER_{}_", provider_id.to_uppercase());
        let client_id = std::env::var(format!("{prefix}CLIENT_ID")).map_err(|_| {
            OrchestratorError::ConfigurationError(format!("{prefix}CLIENT_ID is required for provider '{provider_id}'"))
        })?;
        let client_secret = std::env::var(format!("{prefix}CLIENT_SECRET")).map_err(|_| {
            OrchestratorError::ConfigurationError(format!(
                "{prefix}CLIENT_SECRET is required for provider '{provider_id}'"
            ))
        })?;
        let redirect_uri = std::env::var(format!("{prefix}REDIRECT_URI")).map_err(|_| {
            OrchestratorError::ConfigurationError(format!(
                "{prefix}REDIRECT_URI is required for provider '{provider_id}'"
            ))
        })?;
        let environment = std::env::var(format!("{prefix}ENVIRONMENT")).unwrap_or_else(|_| "sandbox".to_string());
        let webhook_secret = std::env::var(format!("{prefix}WEBHOOK_SECRET")).ok();
        let rate_limit_per_minute = env_u64(&format!("{prefix}RATE_LIMIT_PER_MINUTE"), 60) as u32;
        providers.insert(
            provider_id.to_string(),
            ProviderCredentialConfig {
                client_id,
                client_secret,
                environment,
                redirect_uri,
                webhook_secret,
                rate_limit_per_minute,
            },
        );
    }
    Ok(providers)
}

fn decode_encryption_key(raw: &str) -> Result<[u8; 32]> {
    use base64::Engine;
    let bytes = if let Ok(b) = hex::decode(raw) {
        b
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|_| {
                OrchestratorError::ConfigurationError(
                    "ORCHESTRATOR_ENCRYPTION_KEY is neither valid hex nor base64".into(),
                )
            })?
    };
    if bytes.len() != 32 {
        return Err(OrchestratorError::ConfigurationError(format!(
            "encryption key must decode to 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_encryption_key() {
        let err = decode_encryption_key("dGVzdA==").unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigurationError(_)));
    }

    #[test]
    fn accepts_32_byte_hex_key() {
        let hex_key = "00".repeat(32);
        let key = decode_encryption_key(&hex_key).unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn batch_size_falls_back_for_unknown_bucket() {
        let cfg = OrchestratorConfig {
            encryption_key: [0u8; 32],
            tick_shared_secret: "s".into(),
            worker_pool_size: 4,
            tick_deadline: Duration::from_secs(300),
            run_deadline: Duration::from_secs(180),
            token_refresh_timeout: Duration::from_secs(20),
            lease_expiry: Duration::from_secs(600),
            providers: HashMap::new(),
            batch_size: HashMap::new(),
            log_level: "info".into(),
        };
        assert_eq!(cfg.batch_size_for("hourly"), 20);
    }
}
