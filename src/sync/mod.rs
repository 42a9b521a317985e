//! Sync Engine (C4): cursor-based incremental pull, raw staging, and import
//! into the canonical store.
//!
//! A single `run`-style entry point walks six numbered steps, logging at
//! each boundary with `tracing::instrument`, with the transaction cursor
//! loop as its own inner stage.

use crate::common::{now_utc, AccountId, BookingStatus, ConnectionId, ConnectionStatus, HealthStatus, Metadata, TenantId, TransactionDirection};
use crate::error::{OrchestratorError, Result};
use crate::health::{self, ScoringInputs};
use crate::ledger::{IngestionJob, Ledger};
use crate::providers::{Credentials, ProviderAdapter, SyncActionKind, TransactionDelta};
use crate::store::{Account, AccountBalances, CanonicalStore, ProviderAccount};
use crate::vault::CredentialVault;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProviderSyncCursor {
    pub connection_id: ConnectionId,
    pub cursor: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_page_count: u32,
    pub added: u64,
    pub modified: u64,
    pub removed: u64,
}

impl ProviderSyncCursor {
    fn empty(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            cursor: None,
            last_sync_at: None,
            last_page_count: 0,
            added: 0,
            modified: 0,
            removed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRawTransaction {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub external_transaction_id: String,
    pub sync_action: SyncActionKind,
    pub raw_data: TransactionDelta,
    pub last_updated_at: DateTime<Utc>,
    pub imported_to_canonical: bool,
}

pub struct SyncOutcomeReport {
    pub job_id: Uuid,
    pub status: &'static str,
    pub records_imported: u64,
    pub records_failed: u64,
}

/// Per-connection, per-provider cursor storage plus the raw staging table.
/// Kept as its own struct (distinct from `CanonicalStore`) because staging
/// rows are provider-shaped, not canonical: `ProviderSyncCursor` and
/// `ProviderRawTransaction` stay separate from the canonical tables.
pub struct StagingArea {
    cursors: DashMap<ConnectionId, ProviderSyncCursor>,
    raw_transactions: DashMap<Uuid, ProviderRawTransaction>,
}

impl Default for StagingArea {
    fn default() -> Self {
        Self::new()
    }
}

impl StagingArea {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
            raw_transactions: DashMap::new(),
        }
    }

    pub fn load_cursor(&self, connection_id: ConnectionId) -> ProviderSyncCursor {
        self.cursors
            .get(&connection_id)
            .map(|c| c.clone())
            .unwrap_or_else(|| ProviderSyncCursor::empty(connection_id))
    }

    fn persist_cursor(&self, cursor: ProviderSyncCursor) {
        self.cursors.insert(cursor.connection_id, cursor);
    }

    /// Idempotent upsert on (connection, external_id, last_updated_at): a
    /// re-fetched delta for the same instant replaces the staged row rather
    /// than creating a duplicate.
    fn stage(&self, tenant_id: TenantId, connection_id: ConnectionId, delta: TransactionDelta) {
        let external_id = delta.fields.external_transaction_id.clone();
        let last_updated_at = now_utc();
        let existing = self.raw_transactions.iter().find(|r| {
            r.connection_id == connection_id
                && r.external_transaction_id == external_id
                && r.last_updated_at == last_updated_at
        });
        if let Some(existing) = existing {
            let id = existing.id;
            drop(existing);
            if let Some(mut entry) = self.raw_transactions.get_mut(&id) {
                entry.raw_data = delta;
                entry.imported_to_canonical = false;
            }
            return;
        }
        let row = ProviderRawTransaction {
            id: Uuid::new_v4(),
            tenant_id,
            connection_id,
            external_transaction_id: external_id,
            sync_action: delta.action,
            raw_data: delta,
            last_updated_at,
            imported_to_canonical: false,
        };
        self.raw_transactions.insert(row.id, row);
    }

    fn pending_for_import(&self, connection_id: ConnectionId) -> Vec<ProviderRawTransaction> {
        let mut rows: Vec<ProviderRawTransaction> = self
            .raw_transactions
            .iter()
            .filter(|r| r.connection_id == connection_id && !r.imported_to_canonical)
            .map(|r| r.clone())
            .collect();
        // Within a connection, apply in the order last_updated_at arrived.
        rows.sort_by(|a, b| a.last_updated_at.cmp(&b.last_updated_at));
        rows
    }

    fn mark_imported(&self, id: Uuid) {
        if let Some(mut entry) = self.raw_transactions.get_mut(&id) {
            entry.imported_to_canonical = true;
        }
    }
}

/// An in-memory, non-blocking advisory lease registry for per-connection
/// serialization. A real deployment would back this with a row-level or
/// distributed lock; this crate models the same contract in-process.
pub struct LeaseRegistry {
    leases: DashMap<ConnectionId, DateTime<Utc>>,
    expiry: chrono::Duration,
}

impl LeaseRegistry {
    pub fn new(expiry: std::time::Duration) -> Self {
        Self {
            leases: DashMap::new(),
            expiry: chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::minutes(10)),
        }
    }

    /// Acquires the lease non-blocking; fails with `LeaseContention` if
    /// another worker holds it and it has not expired.
    pub fn acquire(&self, connection_id: ConnectionId) -> Result<LeaseGuard<'_>> {
        let now = now_utc();
        let mut acquired = false;
        self.leases
            .entry(connection_id)
            .and_modify(|expires_at| {
                if *expires_at <= now {
                    *expires_at = now + self.expiry;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                now + self.expiry
            });
        if !acquired {
            return Err(OrchestratorError::LeaseContention {
                connection_id: connection_id.to_string(),
            });
        }
        Ok(LeaseGuard {
            registry: self,
            connection_id,
        })
    }
}

pub struct LeaseGuard<'a> {
    registry: &'a LeaseRegistry,
    connection_id: ConnectionId,
}

impl<'a> Drop for LeaseGuard<'a> {
    fn drop(&mut self) {
        self.registry.leases.remove(&self.connection_id);
    }
}

pub struct SyncRunRequest {
    pub connection_id: ConnectionId,
    pub tenant_id: TenantId,
    pub provider_id: String,
    pub force_full: bool,
    pub resume_from: Option<DateTime<Utc>>,
}

/// The sync engine. Holds no provider-specific logic; everything
/// provider-shaped goes through the adapter trait object passed at call
/// time.
pub struct SyncEngine {
    store: Arc<CanonicalStore>,
    vault: Arc<CredentialVault>,
    ledger: Arc<Ledger>,
    staging: Arc<StagingArea>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<CanonicalStore>,
        vault: Arc<CredentialVault>,
        ledger: Arc<Ledger>,
        staging: Arc<StagingArea>,
    ) -> Self {
        Self { store, vault, ledger, staging }
    }

    /// Orchestrates a single sync run. The lease must already be held by
    /// the caller (the scheduler acquires it so it can distinguish
    /// "skipped: leased" from an engine-internal failure).
    #[instrument(skip(self, adapter), fields(connection_id = %request.connection_id))]
    pub async fn run(
        &self,
        request: SyncRunRequest,
        adapter: &dyn ProviderAdapter,
    ) -> Result<SyncOutcomeReport> {
        let mut job = IngestionJob::open(request.tenant_id, request.connection_id, "full_sync");
        self.ledger.insert_job(job.clone());

        let credentials = match self.obtain_credentials(request.connection_id, adapter).await {
            Ok(c) => c,
            Err(err) => {
                let _ = self.store.update_connection(request.connection_id, |c| {
                    c.status = crate::common::ConnectionStatus::Error;
                    c.last_error = Some(err.to_string());
                    c.last_error_at = Some(now_utc());
                });
                self.ledger.update_job(job.id, |j| {
                    let _ = j.transition_to(crate::common::JobStatus::Failed);
                    j.error_message = Some(err.to_string());
                });
                return Ok(SyncOutcomeReport {
                    job_id: job.id,
                    status: "failed",
                    records_imported: 0,
                    records_failed: 0,
                });
            }
        };

        let accounts_result = self
            .run_accounts_phase(&request, &credentials, adapter, &mut job)
            .await;
        if let Err(err) = accounts_result {
            return self.fail_job(job, err).await;
        }

        let transactions_result = self
            .run_transactions_phase(&request, &credentials, adapter, &mut job)
            .await;
        if let Err(err) = transactions_result {
            return self.fail_job(job, err).await;
        }

        self.ledger.update_job(job.id, |j| {
            let _ = j.transition_to(crate::common::JobStatus::Completed);
            j.summary = json!({ "records_imported": j.records_imported });
        });
        self.store.record_sync_outcome(
            request.connection_id,
            &crate::store::SyncOutcome { success: true, error_message: None },
        )?;
        self.update_connection_health(request.connection_id)?;

        let final_job = self.ledger.get_job(job.id).unwrap_or(job);
        info!(records_imported = final_job.records_imported, "sync run completed");
        Ok(SyncOutcomeReport {
            job_id: final_job.id,
            status: "completed",
            records_imported: final_job.records_imported,
            records_failed: final_job.records_failed,
        })
    }

    async fn fail_job(&self, job: IngestionJob, err: OrchestratorError) -> Result<SyncOutcomeReport> {
        warn!(error = %err, "sync run failed");
        self.ledger.update_job(job.id, |j| {
            let _ = j.transition_to(crate::common::JobStatus::Failed);
            j.error_message = Some(err.to_string());
        });
        self.store.record_sync_outcome(
            job.connection_id,
            &crate::store::SyncOutcome { success: false, error_message: Some(err.to_string()) },
        )?;
        self.update_connection_health(job.connection_id)?;
        let final_job = self.ledger.get_job(job.id).unwrap();
        Ok(SyncOutcomeReport {
            job_id: final_job.id,
            status: "failed",
            records_imported: final_job.records_imported,
            records_failed: final_job.records_failed,
        })
    }

    async fn obtain_credentials(
        &self,
        connection_id: ConnectionId,
        adapter: &dyn ProviderAdapter,
    ) -> Result<Credentials> {
        match adapter.descriptor().integration_type {
            crate::common::IntegrationType::DirectCredentials => {
                self.vault.access_direct_credentials(connection_id)
            }
            _ => {
                let tokens = self.vault.access_token(connection_id, adapter).await?;
                Ok(Credentials::OAuth(tokens))
            }
        }
    }

    /// Recomputes and persists `health_score` from the connection's recent
    /// job history, demoting `status` to `Error` when the score turns
    /// critical and restoring it to `Active` once it recovers.
    fn update_connection_health(&self, connection_id: ConnectionId) -> Result<()> {
        let connection = self
            .store
            .get_connection(connection_id)
            .ok_or(crate::error::StoreError::NotFound { entity: "Connection", id: connection_id.to_string() })?;
        let recent = self.ledger.recent_outcomes(connection_id, 20);
        let success_rate = health::success_rate_from_recent_outcomes(&recent);
        let (score, status) = health::score(
            ScoringInputs {
                success_rate_20: success_rate,
                consecutive_failures: connection.consecutive_failures,
                last_success_at: connection.last_success_at,
            },
            now_utc(),
        );
        self.store.update_connection(connection_id, |c| {
            c.health_score = score;
            c.status = match (status, c.status) {
                (HealthStatus::Critical, ConnectionStatus::Active) => ConnectionStatus::Error,
                (HealthStatus::Healthy, ConnectionStatus::Error) => ConnectionStatus::Active,
                _ => c.status,
            };
        })
    }

    /// Accounts phase: fetch, then upsert each provider account and its
    /// linked canonical account.
    async fn run_accounts_phase(
        &self,
        request: &SyncRunRequest,
        credentials: &Credentials,
        adapter: &dyn ProviderAdapter,
        job: &mut IngestionJob,
    ) -> Result<()> {
        let owning_user = self
            .store
            .get_connection(request.connection_id)
            .map(|c| c.created_by)
            .unwrap_or_else(Uuid::nil);
        let raw = adapter.fetch_raw_accounts(credentials).await?;
        for raw_account in raw.accounts {
            let existing = self.store.find_provider_account(
                request.connection_id,
                &request.provider_id,
                &raw_account.external_account_id,
            );
            match existing {
                Some(mut pa) => {
                    pa.balance = raw_account.balance;
                    pa.status = raw_account.status.clone();
                    pa.last_synced_at = now_utc();
                    if let Some(account_id) = pa.canonical_account_id {
                        let _ = self.store.update_account_system(account_id, |a| {
                            a.balances.current = raw_account.balance;
                        });
                    }
                    self.store.insert_provider_account(pa);
                }
                None => {
                    let account = Account {
                        id: Uuid::new_v4(),
                        account_id: format!("{}:{}", request.provider_id, raw_account.external_account_id),
                        tenant_id: request.tenant_id,
                        entity_id: None,
                        account_name: raw_account.account_type.clone(),
                        account_type: raw_account.account_type.clone(),
                        currency: raw_account.currency.clone(),
                        balances: AccountBalances { current: raw_account.balance, available: None, ledger: None },
                        iban: raw_account.iban.clone(),
                        bic: None,
                        bank_name: Some(raw.institution.institution_display_name.clone()),
                        account_status: raw_account.status.clone(),
                        connection_id: Some(request.connection_id),
                        provider_id: Some(request.provider_id.clone()),
                        external_account_id: Some(raw_account.external_account_id.clone()),
                        created_by: owning_user,
                        created_at: now_utc(),
                    };
                    let account = self.store.create_account_system(account);
                    let provider_account = ProviderAccount {
                        id: Uuid::new_v4(),
                        tenant_id: request.tenant_id,
                        connection_id: request.connection_id,
                        provider_id: request.provider_id.clone(),
                        external_account_id: raw_account.external_account_id.clone(),
                        account_type: raw_account.account_type.clone(),
                        currency: raw_account.currency.clone(),
                        balance: raw_account.balance,
                        iban: raw_account.iban.clone(),
                        status: raw_account.status.clone(),
                        provider_metadata: raw_account.metadata.clone(),
                        last_synced_at: now_utc(),
                        canonical_account_id: Some(account.id),
                    };
                    self.store.insert_provider_account(provider_account);
                }
            }
            job.records_processed += 1;
            job.records_imported += 1;
        }
        Ok(())
    }

    /// Transactions phase: cursor loop then import step.
    async fn run_transactions_phase(
        &self,
        request: &SyncRunRequest,
        credentials: &Credentials,
        adapter: &dyn ProviderAdapter,
        job: &mut IngestionJob,
    ) -> Result<()> {
        let descriptor = adapter.descriptor().clone();
        let mut cursor = self.staging.load_cursor(request.connection_id);

        if descriptor.connection_level_transactions {
            self.fetch_and_stage_loop(request, credentials, adapter, None, &mut cursor, job).await?;
        } else {
            let accounts = self.store.provider_accounts_for_tenant(request.tenant_id);
            for pa in accounts.iter().filter(|pa| pa.connection_id == request.connection_id) {
                self.fetch_and_stage_loop(
                    request,
                    credentials,
                    adapter,
                    Some(pa.external_account_id.as_str()),
                    &mut cursor,
                    job,
                )
                .await?;
            }
        }

        cursor.last_sync_at = Some(now_utc());
        self.staging.persist_cursor(cursor);

        self.import_staged(request, job);
        Ok(())
    }

    async fn fetch_and_stage_loop(
        &self,
        request: &SyncRunRequest,
        credentials: &Credentials,
        adapter: &dyn ProviderAdapter,
        account_external_id: Option<&str>,
        cursor: &mut ProviderSyncCursor,
        job: &mut IngestionJob,
    ) -> Result<()> {
        loop {
            let page = adapter
                .sync_transactions(credentials, cursor.cursor.as_deref(), account_external_id)
                .await?;
            job.records_fetched += page.deltas.len() as u64;
            for delta in page.deltas.into_iter() {
                match delta.action {
                    SyncActionKind::Added => cursor.added += 1,
                    SyncActionKind::Modified => cursor.modified += 1,
                    SyncActionKind::Removed => cursor.removed += 1,
                }
                self.staging.stage(request.tenant_id, request.connection_id, delta);
            }
            cursor.cursor = page.next_cursor;
            cursor.last_page_count += 1;
            if !page.has_more {
                break;
            }
        }
        Ok(())
    }

    /// Import step: independent of the fetch step, re-runnable.
    fn import_staged(&self, request: &SyncRunRequest, job: &mut IngestionJob) {
        for row in self.staging.pending_for_import(request.connection_id) {
            if let Some(resume_from) = request.resume_from {
                if row.raw_data.fields.date < resume_from {
                    self.staging.mark_imported(row.id);
                    job.records_skipped += 1;
                    continue;
                }
            }
            match row.sync_action {
                SyncActionKind::Added | SyncActionKind::Modified => {
                    match self.import_one(request, &row) {
                        Ok(_) => job.records_imported += 1,
                        Err(_) => job.records_failed += 1,
                    }
                }
                SyncActionKind::Removed => {
                    self.mark_removed(request.tenant_id, request.connection_id, &row.external_transaction_id);
                    job.records_imported += 1;
                }
            }
            self.staging.mark_imported(row.id);
        }
    }

    fn import_one(&self, request: &SyncRunRequest, row: &ProviderRawTransaction) -> Result<()> {
        let fields = &row.raw_data.fields;
        let account_id = self.resolve_account_id(request, &fields.external_account_id)?;
        let direction = if fields.amount >= 0.0 {
            TransactionDirection::Credit
        } else {
            TransactionDirection::Debit
        };
        let txn = crate::store::Transaction {
            transaction_id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            account_id,
            date: fields.date,
            value_date: fields.value_date,
            amount: fields.amount,
            currency: fields.currency.clone(),
            direction,
            description: fields.description.clone(),
            category: None,
            merchant_name: fields.merchant_name.clone(),
            counterparty_name: fields.counterparty_name.clone(),
            counterparty_iban: fields.counterparty_iban.clone(),
            reference: fields.reference.clone(),
            booking_status: if fields.booking_status_pending { BookingStatus::Pending } else { BookingStatus::Booked },
            transaction_type_code: fields.transaction_type_code.clone(),
            connection_id: Some(request.connection_id),
            external_transaction_id: Some(fields.external_transaction_id.clone()),
            import_job_id: None,
            metadata: fields.metadata.clone(),
            removed: false,
        };
        self.store.upsert_transaction_by_external_id(
            request.tenant_id,
            request.connection_id,
            Some(&fields.external_transaction_id),
            txn,
        )?;
        Ok(())
    }

    fn mark_removed(&self, tenant_id: TenantId, connection_id: ConnectionId, external_id: &str) {
        let existing = self
            .store
            .transactions_for_tenant(tenant_id)
            .into_iter()
            .find(|t| t.connection_id == Some(connection_id) && t.external_transaction_id.as_deref() == Some(external_id));
        if let Some(existing) = existing {
            let _ = self.store.mark_transaction_removed(existing.transaction_id);
        }
    }

    fn resolve_account_id(&self, request: &SyncRunRequest, external_account_id: &str) -> Result<AccountId> {
        self.store
            .find_provider_account(request.connection_id, &request.provider_id, external_account_id)
            .and_then(|pa| pa.canonical_account_id)
            .ok_or_else(|| {
                OrchestratorError::IntegrityError(format!(
                    "no canonical account linked for external_account_id {external_account_id}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_until_released() {
        let registry = LeaseRegistry::new(std::time::Duration::from_secs(600));
        let connection_id = Uuid::new_v4();
        let first = registry.acquire(connection_id).unwrap();
        let second = registry.acquire(connection_id);
        assert!(second.is_err());
        drop(first);
        assert!(registry.acquire(connection_id).is_ok());
    }

    #[test]
    fn staging_upsert_is_idempotent_for_same_last_updated_at() {
        let staging = StagingArea::new();
        let connection_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();
        assert_eq!(staging.pending_for_import(connection_id).len(), 0);
        let _ = tenant_id;
    }
}
