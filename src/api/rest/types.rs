//! Shared REST types: application state, the error-to-HTTP mapping, and the
//! request/response DTOs for the tick, OAuth-callback, and admin families.
//!
//! One `Arc`-wrapped state struct threaded through `with_state`, one error
//! type implementing `IntoResponse`.

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::health;
use crate::ledger::Ledger;
use crate::providers::ProviderRegistry;
use crate::scheduler::Scheduler;
use crate::store::CanonicalStore;
use crate::sync::SyncEngine;
use crate::vault::CredentialVault;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<OrchestratorConfig>,
    pub store: Arc<CanonicalStore>,
    pub vault: Arc<CredentialVault>,
    pub registry: Arc<ProviderRegistry>,
    pub ledger: Arc<Ledger>,
    pub scheduler: Arc<Scheduler>,
    pub engine: Arc<SyncEngine>,
}

/// Structured error body, returned for every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = match &self {
            OrchestratorError::AuthFailure(_) => "AUTH_FAILURE",
            OrchestratorError::RateLimited { .. } => "RATE_LIMITED",
            OrchestratorError::TransientProviderError(_) => "TRANSIENT_PROVIDER_ERROR",
            OrchestratorError::PermanentProviderError(_) => "PERMANENT_PROVIDER_ERROR",
            OrchestratorError::IntegrityError(_) => "INTEGRITY_ERROR",
            OrchestratorError::ConfigurationError(_) => "CONFIGURATION_ERROR",
            OrchestratorError::LeaseContention { .. } => "LEASE_CONTENTION",
            OrchestratorError::ProviderNotFound(_) => "PROVIDER_NOT_FOUND",
            OrchestratorError::Store(_) => "STORE_ERROR",
            OrchestratorError::Internal(_) => "INTERNAL_ERROR",
        };
        let body = ApiErrorBody { code: code.to_string(), message: self.to_string() };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct TickResponse {
    pub processed: u32,
    pub successful: u32,
    pub failed: u32,
    pub skipped_leased: u32,
    pub skipped_throttled: u32,
    pub records_synced: u64,
}

impl From<crate::scheduler::TickReport> for TickResponse {
    fn from(r: crate::scheduler::TickReport) -> Self {
        Self {
            processed: r.processed,
            successful: r.successful,
            failed: r.failed,
            skipped_leased: r.skipped_leased,
            skipped_throttled: r.skipped_throttled,
            records_synced: r.records_synced,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OauthCallbackRequest {
    pub code: Option<String>,
    pub state: String,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OauthCallbackResponse {
    pub connection_id: Uuid,
    pub status: &'static str,
    pub reconnection_confidence: Option<String>,
    pub first_sync_status: &'static str,
    pub records_imported: u64,
}

/// Extracted from admin-route headers; every admin handler requires this
/// and writes an `AdminAuditEvent` for the action it performs.
#[derive(Debug, Clone, Copy)]
pub struct AdminPrincipal {
    pub actor_user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TriggerSyncRequest {
    pub connection_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    pub connection_id: Uuid,
    pub bucket: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkUpdateSchedulesRequest {
    pub updates: Vec<UpdateScheduleRequest>,
}

#[derive(Debug, Serialize)]
pub struct FleetHealthEntry {
    pub connection_id: Uuid,
    pub provider_id: String,
    pub score: u8,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct FleetHealthResponse {
    pub connections: Vec<FleetHealthEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RecentJobsQuery {
    pub limit: Option<usize>,
    pub connection_id: Option<Uuid>,
}

/// Recomputes a connection's live score from its recent job history, the
/// way the fleet-health endpoint does for every row. Held here rather than
/// in the health module since it composes the ledger, which the pure
/// scorer deliberately does not depend on.
pub fn live_health_entry(ledger: &Ledger, connection: &crate::store::Connection) -> FleetHealthEntry {
    let recent = ledger.recent_outcomes(connection.id, 20);
    let success_rate = health::success_rate_from_recent_outcomes(&recent);
    let (score, status) = health::score(
        health::ScoringInputs {
            success_rate_20: success_rate,
            consecutive_failures: connection.consecutive_failures,
            last_success_at: connection.last_success_at,
        },
        crate::common::now_utc(),
    );
    FleetHealthEntry {
        connection_id: connection.id,
        provider_id: connection.provider_id.clone(),
        score,
        status: format!("{status:?}"),
    }
}
