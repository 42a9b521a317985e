// # Banking Data Ingestion Orchestrator
//
// Process entry point: loads configuration, wires the canonical store,
// credential vault, provider registry, sync engine and scheduler together,
// registers the provider adapters, and serves the tick/oauth-callback/admin
// API until shutdown.

use ingestion_orchestrator::api::{AppState, RestApiServer};
use ingestion_orchestrator::config::OrchestratorConfig;
use ingestion_orchestrator::ledger::Ledger;
use ingestion_orchestrator::providers::adapters::cursor_aggregator::CursorAggregatorAdapter;
use ingestion_orchestrator::providers::adapters::direct_bank::DirectBankAdapter;
use ingestion_orchestrator::providers::adapters::oauth_redirect_aggregator::OauthRedirectAggregatorAdapter;
use ingestion_orchestrator::providers::ProviderRegistry;
use ingestion_orchestrator::scheduler::Scheduler;
use ingestion_orchestrator::store::CanonicalStore;
use ingestion_orchestrator::sync::{StagingArea, SyncEngine};
use ingestion_orchestrator::vault::CredentialVault;
use ingestion_orchestrator::Result;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let config = OrchestratorConfig::from_env()?;
    info!("Configuration loaded: worker_pool_size={}", config.worker_pool_size);

    let store = Arc::new(CanonicalStore::new());
    let vault = Arc::new(CredentialVault::new(config.encryption_key));
    let ledger = Arc::new(Ledger::new());
    let staging = Arc::new(StagingArea::new());

    let registry = Arc::new(ProviderRegistry::new());
    register_provider_adapters(&registry, &config);

    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        Arc::clone(&vault),
        Arc::clone(&ledger),
        Arc::clone(&staging),
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&engine),
        Arc::clone(&registry),
        Arc::clone(&ledger),
        config.worker_pool_size,
        config.lease_expiry,
        config.tick_deadline,
        config.run_deadline,
        config.batch_size.clone(),
    ));

    print_enabled_modules();

    let cors_origins: Vec<String> = std::env::var("ORCHESTRATOR_CORS_ALLOWED_ORIGINS")
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let state = AppState {
        config: Arc::new(config),
        store,
        vault,
        registry,
        ledger,
        scheduler,
        engine,
    };

    let bind_addr = std::env::var("ORCHESTRATOR_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let server = RestApiServer::new(state, cors_origins);

    println!();
    println!("╭─────────────────────────────────────────────────────────╮");
    println!("│  Ingestion orchestrator is ready                         │");
    println!("│  Tick endpoint:   POST /tick/{{bucket}}                    │");
    println!("│  OAuth callback:  POST /oauth/{{provider_id}}/callback      │");
    println!("│  Admin console:   POST /admin/...                        │");
    println!("│  Listening on:    {bind_addr:<38} │");
    println!("╰─────────────────────────────────────────────────────────╯");
    println!();

    info!("Starting API server on {}", bind_addr);
    if let Err(e) = server.run(&bind_addr).await {
        error!("API server error: {}", e);
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Registers one adapter per configured provider. Provider kind
/// (cursor-native aggregator, OAuth-redirect aggregator, or direct-bank) is
/// selected by a `ORCHESTRATOR_PROVIDER_KIND_<id>` env var since the
/// registry has no other way to learn it before the adapter itself reports
/// a `CapabilityDescriptor`.
fn register_provider_adapters(registry: &ProviderRegistry, config: &OrchestratorConfig) {
    for (provider_id, provider_config) in &config.providers {
        let kind_var = format!("ORCHESTRATOR_PROVIDER_KIND_{}", provider_id.to_uppercase());
        let kind = std::env::var(&kind_var).unwrap_or_else(|_| "cursor_aggregator".to_string());
        match kind.as_str() {
            "oauth_redirect_aggregator" => {
                registry.register(Arc::new(OauthRedirectAggregatorAdapter::new(
                    provider_id,
                    &provider_config.redirect_uri,
                )));
            }
            "direct_bank" => {
                registry.register(Arc::new(DirectBankAdapter::new(provider_id)));
            }
            _ => {
                registry.register(Arc::new(CursorAggregatorAdapter::new(provider_id)));
            }
        }
        info!("Registered provider adapter: {} ({})", provider_id, kind);
    }
}

fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║     Banking Data Ingestion Orchestrator                    ║");
    println!("║     Multi-tenant treasury aggregation platform             ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}

fn print_enabled_modules() {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ COMPONENTS                                                  │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│   [✓] store          - Canonical multi-tenant data store    │");
    println!("│   [✓] providers      - Provider registry & adapters         │");
    println!("│   [✓] vault          - Credential vault (AEAD-encrypted)    │");
    println!("│   [✓] sync           - Cursor-based incremental sync engine │");
    println!("│   [✓] reconnection   - Post-OAuth reconnection matcher      │");
    println!("│   [✓] scheduler      - Lease-based tick dispatcher          │");
    println!("│   [✓] health         - Connection health scoring            │");
    println!("│   [✓] ledger         - Sync outcome & admin audit ledger    │");
    println!("│   [✓] api            - Tick / OAuth-callback / admin REST   │");
    println!("└─────────────────────────────────────────────────────────────┘");
    println!();
}
