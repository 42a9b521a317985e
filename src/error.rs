//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds in the ingestion orchestrator's error-handling
//! design: auth failures, provider rate limiting, transient/permanent
//! provider errors, canonical-store integrity violations, startup
//! configuration errors, and lease contention. A narrower `StoreError`
//! covers the canonical store's own access-predicate and referential
//! integrity failures and converts into the top-level error at the
//! boundary via `#[from]`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    #[error("rate limited by provider, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("transient provider error: {0}")]
    TransientProviderError(String),

    #[error("permanent provider error: {0}")]
    PermanentProviderError(String),

    #[error("integrity violation: {0}")]
    IntegrityError(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("lease contention on connection {connection_id}")]
    LeaseContention { connection_id: String },

    #[error("unknown provider: {0}")]
    ProviderNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised at the canonical store boundary (C1). Distinct from the
/// provider/sync taxonomy because they describe violations of the store's
/// own invariants rather than anything an external API did.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("principal is not a member of tenant {tenant_id}")]
    PermissionDenied { tenant_id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("cannot delete {entity} {id}: referenced by {blocking_count} row(s)")]
    DeleteBlocked {
        entity: &'static str,
        id: String,
        blocking_count: usize,
    },
}

impl OrchestratorError {
    /// Maps this error onto an HTTP status code at the REST edge.
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            OrchestratorError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            OrchestratorError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            OrchestratorError::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::LeaseContention { .. } => StatusCode::CONFLICT,
            OrchestratorError::IntegrityError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::TransientProviderError(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::PermanentProviderError(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Store(store_err) => match store_err {
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                StoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                StoreError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
                StoreError::Conflict(_) => StatusCode::CONFLICT,
                StoreError::AlreadyExists { .. } => StatusCode::CONFLICT,
                StoreError::DeleteBlocked { .. } => StatusCode::CONFLICT,
            },
        }
    }
}
