//! Job Ledger & Audit (C8): ingestion-job records, admin action audit, and
//! metric time-series, plus the archive/purge policy.
//!
//! An in-memory append-only log guarded by the status-transition invariant
//! below, rather than a WAL-backed audit trail, since this crate has no
//! on-disk storage layer of its own.

use crate::common::{AccountId, ConnectionId, JobId, JobStatus, TenantId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub job_type: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_fetched: u64,
    pub records_processed: u64,
    pub records_imported: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub error_message: Option<String>,
    pub summary: JsonValue,
}

impl IngestionJob {
    pub fn open(tenant_id: TenantId, connection_id: ConnectionId, job_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            connection_id,
            job_type: job_type.to_string(),
            status: JobStatus::InProgress,
            started_at: crate::common::now_utc(),
            completed_at: None,
            records_fetched: 0,
            records_processed: 0,
            records_imported: 0,
            records_skipped: 0,
            records_failed: 0,
            error_message: None,
            summary: JsonValue::Null,
        }
    }

    /// Enforces the status-transition invariant: only
    /// pending→in_progress→{completed,failed} is legal.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<(), String> {
        let legal = matches!(
            (self.status, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Completed)
                | (JobStatus::InProgress, JobStatus::Failed)
        );
        if !legal {
            return Err(format!("illegal job status transition {:?} -> {:?}", self.status, next));
        }
        self.status = next;
        if matches!(next, JobStatus::Completed | JobStatus::Failed) {
            self.completed_at = Some(crate::common::now_utc());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAuditEvent {
    pub id: Uuid,
    pub actor_user_id: Uuid,
    pub action: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthMetric {
    pub id: Uuid,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    pub status: MetricStatus,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionHistoryEventType {
    Reconnection,
    ReconnectionProposed,
}

/// A reconnection event: either an applied HIGH-confidence re-parent or a
/// MEDIUM-confidence proposal awaiting human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHistoryEvent {
    pub id: Uuid,
    pub connection_id: ConnectionId,
    pub previous_connection_id: Option<ConnectionId>,
    pub account_id: Option<AccountId>,
    pub event_type: ConnectionHistoryEventType,
    pub confidence: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Archive/purge and audit trail. Append-only except for the daily purge of
/// jobs older than 30 days; `AdminAuditEvent` rows are never purged by this
/// component.
pub struct Ledger {
    jobs: DashMap<JobId, IngestionJob>,
    audit_events: DashMap<Uuid, AdminAuditEvent>,
    metrics: DashMap<Uuid, SystemHealthMetric>,
    connection_history: DashMap<Uuid, ConnectionHistoryEvent>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            audit_events: DashMap::new(),
            metrics: DashMap::new(),
            connection_history: DashMap::new(),
        }
    }

    pub fn insert_job(&self, job: IngestionJob) {
        self.jobs.insert(job.id, job);
    }

    pub fn update_job<F: FnOnce(&mut IngestionJob)>(&self, id: JobId, f: F) {
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            f(&mut entry);
        }
    }

    pub fn get_job(&self, id: JobId) -> Option<IngestionJob> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    pub fn recent_jobs(&self, limit: usize, connection_id: Option<ConnectionId>) -> Vec<IngestionJob> {
        let mut jobs: Vec<IngestionJob> = self
            .jobs
            .iter()
            .filter(|j| connection_id.map(|cid| j.connection_id == cid).unwrap_or(true))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        jobs
    }

    /// Recent outcomes (newest last) for the health scorer's
    /// `success_rate_20` input.
    pub fn recent_outcomes(&self, connection_id: ConnectionId, window: usize) -> Vec<bool> {
        let mut jobs: Vec<IngestionJob> = self
            .jobs
            .iter()
            .filter(|j| j.connection_id == connection_id && j.completed_at.is_some())
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs.into_iter()
            .rev()
            .take(window)
            .rev()
            .map(|j| j.status == JobStatus::Completed)
            .collect()
    }

    /// Archive policy: purges jobs older than 30 days on a daily tick.
    /// Returns the number purged.
    pub fn purge_expired_jobs(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::days(30);
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|j| j.started_at < cutoff)
            .map(|j| j.id)
            .collect();
        for id in &expired {
            self.jobs.remove(id);
        }
        expired.len()
    }

    pub fn record_admin_action(
        &self,
        actor_user_id: Uuid,
        action: &str,
        target_type: &str,
        target_id: Option<String>,
        payload: JsonValue,
    ) {
        let event = AdminAuditEvent {
            id: Uuid::new_v4(),
            actor_user_id,
            action: action.to_string(),
            target_type: target_type.to_string(),
            target_id,
            payload,
            created_at: crate::common::now_utc(),
        };
        self.audit_events.insert(event.id, event);
    }

    pub fn audit_events(&self) -> Vec<AdminAuditEvent> {
        self.audit_events.iter().map(|e| e.clone()).collect()
    }

    pub fn emit_metric(&self, metric_name: &str, value: f64, unit: &str, status: MetricStatus) {
        let metric = SystemHealthMetric {
            id: Uuid::new_v4(),
            metric_name: metric_name.to_string(),
            value,
            unit: unit.to_string(),
            status,
            recorded_at: crate::common::now_utc(),
        };
        self.metrics.insert(metric.id, metric);
    }

    /// Records a reconnection history row: `event_type=Reconnection` for an
    /// applied HIGH-confidence link, `ReconnectionProposed` for a
    /// MEDIUM-confidence match surfaced for human review.
    #[allow(clippy::too_many_arguments)]
    pub fn record_connection_history(
        &self,
        connection_id: ConnectionId,
        previous_connection_id: Option<ConnectionId>,
        account_id: Option<AccountId>,
        event_type: ConnectionHistoryEventType,
        confidence: &str,
        payload: JsonValue,
    ) {
        let event = ConnectionHistoryEvent {
            id: Uuid::new_v4(),
            connection_id,
            previous_connection_id,
            account_id,
            event_type,
            confidence: confidence.to_string(),
            payload,
            created_at: crate::common::now_utc(),
        };
        self.connection_history.insert(event.id, event);
    }

    pub fn connection_history_for(&self, connection_id: ConnectionId) -> Vec<ConnectionHistoryEvent> {
        self.connection_history
            .iter()
            .filter(|e| e.connection_id == connection_id)
            .map(|e| e.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_is_rejected() {
        let tenant_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        let mut job = IngestionJob::open(tenant_id, connection_id, "sync");
        job.transition_to(JobStatus::Completed).unwrap();
        let err = job.transition_to(JobStatus::InProgress).unwrap_err();
        assert!(err.contains("illegal"));
    }

    #[test]
    fn purge_removes_only_jobs_older_than_30_days() {
        let ledger = Ledger::new();
        let tenant_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        let now = crate::common::now_utc();

        let mut old_job = IngestionJob::open(tenant_id, connection_id, "sync");
        old_job.started_at = now - chrono::Duration::days(45);
        ledger.insert_job(old_job);

        let recent_job = IngestionJob::open(tenant_id, connection_id, "sync");
        ledger.insert_job(recent_job);

        let purged = ledger.purge_expired_jobs(now);
        assert_eq!(purged, 1);
        assert_eq!(ledger.recent_jobs(10, None).len(), 1);
    }

    #[test]
    fn audit_events_are_append_only_and_listable() {
        let ledger = Ledger::new();
        let actor = Uuid::new_v4();
        ledger.record_admin_action(actor, "trigger_sync", "Connection", Some("conn-1".into()), JsonValue::Null);
        assert_eq!(ledger.audit_events().len(), 1);
    }

    #[test]
    fn connection_history_is_scoped_to_its_connection() {
        let ledger = Ledger::new();
        let connection_id = Uuid::new_v4();
        let other_connection_id = Uuid::new_v4();
        let previous_connection_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();
        ledger.record_connection_history(
            connection_id,
            Some(previous_connection_id),
            Some(account_id),
            ConnectionHistoryEventType::Reconnection,
            "high",
            JsonValue::Null,
        );
        ledger.record_connection_history(
            other_connection_id,
            None,
            None,
            ConnectionHistoryEventType::ReconnectionProposed,
            "medium",
            JsonValue::Null,
        );
        let events = ledger.connection_history_for(connection_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].previous_connection_id, Some(previous_connection_id));
        assert_eq!(events[0].event_type, ConnectionHistoryEventType::Reconnection);
    }
}
