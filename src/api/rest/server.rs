//! REST server assembly: the narrow router, its middleware stack, and the
//! tick/oauth-callback/admin handlers.
//!
//! Constructor-injected state, `build_router`, `run(addr)`, a
//! `TraceLayer`/`TimeoutLayer`/`RequestBodyLimitLayer` stack, reduced to
//! the three route families this crate actually exposes.

use super::cors::build_cors_layer;
use super::middleware::{admin_auth_middleware, request_logger_middleware, tick_auth_middleware};
use super::types::{
    AdminPrincipal, AppState, BulkUpdateSchedulesRequest, FleetHealthResponse, OauthCallbackRequest,
    OauthCallbackResponse, RecentJobsQuery, TickResponse, TriggerSyncRequest, UpdateScheduleRequest,
    live_health_entry,
};
use crate::common::ScheduleBucket;
use crate::error::{OrchestratorError, Result};
use crate::providers::{Credentials, InstitutionFingerprint};
use crate::reconnection::{self, Confidence, NewAuthorizationAccount};
use crate::sync::SyncRunRequest;
use axum::extract::{Extension, Path, Query, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::limit::RequestBodyLimitLayer;
use tower::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub struct RestApiServer {
    state: AppState,
    cors_origins: Vec<String>,
}

impl RestApiServer {
    pub fn new(state: AppState, cors_origins: Vec<String>) -> Self {
        Self { state, cors_origins }
    }

    pub fn build_router(&self) -> Router {
        let tick_routes = Router::new()
            .route("/tick/{bucket}", post(tick_handler))
            .layer(axum::middleware::from_fn_with_state(self.state.clone(), tick_auth_middleware));

        let oauth_routes = Router::new().route("/oauth/{provider_id}/callback", post(oauth_callback_handler));

        let admin_routes = Router::new()
            .route("/admin/connections/list", post(list_connections_handler))
            .route("/admin/connections/trigger-sync", post(trigger_sync_handler))
            .route("/admin/connections/schedule", post(update_schedule_handler))
            .route("/admin/connections/schedule/bulk", post(bulk_update_schedules_handler))
            .route("/admin/fleet-health", post(fleet_health_handler))
            .route("/admin/jobs/recent", post(recent_jobs_handler))
            .layer(axum::middleware::from_fn(admin_auth_middleware));

        Router::new()
            .merge(tick_routes)
            .merge(oauth_routes)
            .merge(admin_routes)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(request_logger_middleware))
            .layer(TimeoutLayer::new(Duration::from_secs(30)))
            .layer(RequestBodyLimitLayer::new(1024 * 1024))
            .layer(build_cors_layer(&self.cors_origins))
    }

    pub async fn run(&self, addr: &str) -> Result<()> {
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("failed to bind {addr}: {e}")))?;
        tracing::info!(%addr, "ingestion orchestrator API listening");
        axum::serve(listener, router)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("server error: {e}")))?;
        Ok(())
    }
}

async fn tick_handler(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Json<TickResponse>> {
    let bucket = ScheduleBucket::parse(&bucket)
        .ok_or_else(|| OrchestratorError::ConfigurationError(format!("unknown schedule bucket '{bucket}'")))?;
    let report = state.scheduler.tick(bucket).await;
    Ok(Json(report.into()))
}

/// Implements the five-step OAuth callback contract: validate state,
/// exchange the code, persist the token, run the reconnection detector,
/// trigger the first sync.
async fn oauth_callback_handler(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Json(body): Json<OauthCallbackRequest>,
) -> Result<Json<OauthCallbackResponse>> {
    if let Some(err) = body.error {
        return Err(OrchestratorError::AuthFailure(format!("provider returned error: {err}")));
    }
    let code = body
        .code
        .ok_or_else(|| OrchestratorError::AuthFailure("missing authorization_code".into()))?;

    let connection = state
        .store
        .find_connection_by_oauth_state(&body.state)
        .ok_or_else(|| OrchestratorError::AuthFailure("state does not match any pending connection".into()))?;

    let adapter = state.registry.get(&provider_id)?;
    let tokens = adapter.exchange_code_for_token(&code).await?;
    state.vault.store_token(connection.id, &provider_id, &tokens);

    let raw_accounts = adapter.fetch_raw_accounts(&Credentials::OAuth(tokens)).await?;
    let candidates: Vec<NewAuthorizationAccount> = raw_accounts
        .accounts
        .iter()
        .map(|a| NewAuthorizationAccount {
            external_account_id: a.external_account_id.clone(),
            account_number_last4: None,
            iban: a.iban.clone(),
        })
        .collect();
    let institution = InstitutionFingerprint {
        institution_id: raw_accounts.institution.institution_id.clone(),
        institution_display_name: raw_accounts.institution.institution_display_name.clone(),
    };
    let detection = reconnection::detect(&state.store, connection.tenant_id, &provider_id, &institution, &candidates);

    let mut resume_from = None;
    let mut reconnected_from = None;
    match detection.confidence {
        Confidence::High => {
            reconnection::apply_high_confidence_link(&state.store, &state.ledger, connection.id, &provider_id, &detection)?;
            resume_from = detection.resume_from;
            reconnected_from = detection.matched_accounts.first().and_then(|m| m.account.connection_id);
        }
        Confidence::Medium => {
            reconnection::propose_medium_confidence_link(&state.ledger, connection.id, &detection);
        }
        Confidence::Low => {}
    }

    let _ = state.store.update_connection(connection.id, |c| {
        c.status = crate::common::ConnectionStatus::Active;
        c.oauth_state = None;
        c.reconnection_confidence = Some(format!("{:?}", detection.confidence));
        if let Some(previous_connection_id) = reconnected_from {
            c.is_reconnection = true;
            c.reconnected_from = Some(previous_connection_id);
        }
    });

    let run = state
        .engine
        .run(
            SyncRunRequest {
                connection_id: connection.id,
                tenant_id: connection.tenant_id,
                provider_id: provider_id.clone(),
                force_full: resume_from.is_none(),
                resume_from,
            },
            adapter.as_ref(),
        )
        .await?;

    Ok(Json(OauthCallbackResponse {
        connection_id: connection.id,
        status: "active",
        reconnection_confidence: Some(format!("{:?}", detection.confidence)),
        first_sync_status: run.status,
        records_imported: run.records_imported,
    }))
}

async fn list_connections_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<AdminPrincipal>,
) -> Json<serde_json::Value> {
    let connections = state.store.list_connections_fleet_wide();
    state.ledger.record_admin_action(
        principal.actor_user_id,
        "list_connections_fleet_wide",
        "Connection",
        None,
        json!({ "count": connections.len() }),
    );
    Json(json!({ "connections": connections.iter().map(|c| c.id).collect::<Vec<Uuid>>() }))
}

async fn trigger_sync_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<AdminPrincipal>,
    Json(body): Json<TriggerSyncRequest>,
) -> Result<Json<serde_json::Value>> {
    let connection = state
        .store
        .get_connection(body.connection_id)
        .ok_or_else(|| OrchestratorError::Store(crate::error::StoreError::NotFound {
            entity: "Connection",
            id: body.connection_id.to_string(),
        }))?;
    let adapter = state.registry.get(&connection.provider_id)?;
    let report = state
        .engine
        .run(
            SyncRunRequest {
                connection_id: connection.id,
                tenant_id: connection.tenant_id,
                provider_id: connection.provider_id.clone(),
                force_full: false,
                resume_from: None,
            },
            adapter.as_ref(),
        )
        .await?;
    state.ledger.record_admin_action(
        principal.actor_user_id,
        "trigger_sync",
        "Connection",
        Some(connection.id.to_string()),
        json!({ "job_id": report.job_id, "status": report.status }),
    );
    Ok(Json(json!({ "job_id": report.job_id, "status": report.status })))
}

async fn update_schedule_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<AdminPrincipal>,
    Json(body): Json<UpdateScheduleRequest>,
) -> Result<Json<serde_json::Value>> {
    apply_schedule_update(&state, &body)?;
    state.ledger.record_admin_action(
        principal.actor_user_id,
        "update_schedule",
        "Connection",
        Some(body.connection_id.to_string()),
        json!({ "bucket": body.bucket, "enabled": body.enabled }),
    );
    Ok(Json(json!({ "updated": true })))
}

async fn bulk_update_schedules_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<AdminPrincipal>,
    Json(body): Json<BulkUpdateSchedulesRequest>,
) -> Result<Json<serde_json::Value>> {
    let mut updated = 0usize;
    for update in &body.updates {
        apply_schedule_update(&state, update)?;
        updated += 1;
    }
    state.ledger.record_admin_action(
        principal.actor_user_id,
        "bulk_update_schedules",
        "Connection",
        None,
        json!({ "updated": updated }),
    );
    Ok(Json(json!({ "updated": updated })))
}

fn apply_schedule_update(state: &AppState, update: &UpdateScheduleRequest) -> Result<()> {
    let bucket = ScheduleBucket::parse(&update.bucket)
        .ok_or_else(|| OrchestratorError::ConfigurationError(format!("unknown schedule bucket '{}'", update.bucket)))?;
    state.store.update_connection(update.connection_id, |c| {
        c.sync_schedule = bucket;
        c.sync_enabled = update.enabled;
    })
}

async fn fleet_health_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<AdminPrincipal>,
) -> Json<FleetHealthResponse> {
    let connections = state.store.list_connections_fleet_wide();
    let entries = connections
        .iter()
        .map(|c| live_health_entry(&state.ledger, c))
        .collect();
    state.ledger.record_admin_action(
        principal.actor_user_id,
        "fleet_health",
        "Connection",
        None,
        serde_json::Value::Null,
    );
    Json(FleetHealthResponse { connections: entries })
}

async fn recent_jobs_handler(
    State(state): State<AppState>,
    Extension(principal): Extension<AdminPrincipal>,
    Query(query): Query<RecentJobsQuery>,
) -> Json<serde_json::Value> {
    let jobs = state.ledger.recent_jobs(query.limit.unwrap_or(50), query.connection_id);
    state.ledger.record_admin_action(
        principal.actor_user_id,
        "recent_jobs",
        "IngestionJob",
        None,
        json!({ "returned": jobs.len() }),
    );
    Json(json!({ "jobs": jobs }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::ledger::Ledger;
    use crate::providers::ProviderRegistry;
    use crate::scheduler::Scheduler;
    use crate::sync::{LeaseRegistry, StagingArea, SyncEngine};
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    fn test_state() -> AppState {
        let config = Arc::new(OrchestratorConfig {
            encryption_key: [3u8; 32],
            tick_shared_secret: "test-secret".into(),
            worker_pool_size: 2,
            tick_deadline: StdDuration::from_secs(5),
            run_deadline: StdDuration::from_secs(5),
            token_refresh_timeout: StdDuration::from_secs(5),
            lease_expiry: StdDuration::from_secs(600),
            providers: HashMap::new(),
            batch_size: HashMap::new(),
            log_level: "info".into(),
        });
        let store = Arc::new(crate::store::CanonicalStore::new());
        let vault = Arc::new(crate::vault::CredentialVault::new(config.encryption_key));
        let registry = Arc::new(ProviderRegistry::new());
        let ledger = Arc::new(Ledger::new());
        let staging = Arc::new(StagingArea::new());
        let engine = Arc::new(SyncEngine::new(store.clone(), vault.clone(), ledger.clone(), staging));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            engine.clone(),
            registry.clone(),
            ledger.clone(),
            config.worker_pool_size,
            config.lease_expiry,
            config.tick_deadline,
            config.run_deadline,
            config.batch_size.clone(),
        ));
        let _ = LeaseRegistry::new(StdDuration::from_secs(1));
        AppState { config, store, vault, registry, ledger, scheduler, engine }
    }

    #[test]
    fn router_builds_without_panicking() {
        let server = RestApiServer::new(test_state(), vec!["https://admin.example.com".into()]);
        let _router = server.build_router();
    }
}
