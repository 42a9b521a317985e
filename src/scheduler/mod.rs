//! Scheduler & Dispatcher (C6): selects due connections per schedule
//! bucket, leases them, bounds concurrency, and dispatches each into the
//! sync engine.
//!
//! A tick-driven dispatcher: a bounded worker pool
//! (`tokio::sync::Semaphore` sized by the configured pool size) applying
//! per-connection leases and the throttle/backoff rules below.

use crate::common::{ConnectionId, ScheduleBucket};
use crate::ledger::{Ledger, MetricStatus};
use crate::providers::ProviderRegistry;
use crate::store::CanonicalStore;
use crate::sync::{LeaseRegistry, StagingArea, SyncEngine, SyncRunRequest};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub processed: u32,
    pub successful: u32,
    pub failed: u32,
    pub skipped_leased: u32,
    pub skipped_throttled: u32,
    pub records_synced: u64,
}

pub struct Scheduler {
    store: Arc<CanonicalStore>,
    engine: Arc<SyncEngine>,
    registry: Arc<ProviderRegistry>,
    ledger: Arc<Ledger>,
    leases: Arc<LeaseRegistry>,
    worker_pool_size: usize,
    tick_deadline: StdDuration,
    run_deadline: StdDuration,
    batch_size: std::collections::HashMap<String, usize>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CanonicalStore>,
        engine: Arc<SyncEngine>,
        registry: Arc<ProviderRegistry>,
        ledger: Arc<Ledger>,
        worker_pool_size: usize,
        lease_expiry: StdDuration,
        tick_deadline: StdDuration,
        run_deadline: StdDuration,
        batch_size: std::collections::HashMap<String, usize>,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
            ledger,
            leases: Arc::new(LeaseRegistry::new(lease_expiry)),
            worker_pool_size,
            tick_deadline,
            run_deadline,
            batch_size,
        }
    }

    /// Entry point invoked by the `/tick/:bucket` handler. Selects the
    /// ready set for `bucket`, bounds it to the bucket's batch size,
    /// dispatches each connection through a bounded semaphore, and returns
    /// once every dispatched unit finishes or the tick deadline elapses.
    pub async fn tick(&self, bucket: ScheduleBucket) -> TickReport {
        let now = crate::common::now_utc();
        let mut ready = self.store.list_ready_connections(bucket, now);
        let batch_size = self.batch_size.get(bucket.as_str()).copied().unwrap_or(ready.len().max(1));
        ready.truncate(batch_size);

        let semaphore = Arc::new(Semaphore::new(self.worker_pool_size.max(1)));
        let mut handles = Vec::with_capacity(ready.len());

        for connection in ready {
            let semaphore = semaphore.clone();
            let scheduler = self.clone_handles();
            let run_deadline = self.run_deadline;
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                scheduler.dispatch_one(connection.id, connection.tenant_id, connection.provider_id, run_deadline).await
            }));
        }

        let mut report = TickReport::default();
        let tick_future = async {
            for handle in handles {
                match handle.await {
                    Ok(DispatchOutcome::Success { records }) => {
                        report.processed += 1;
                        report.successful += 1;
                        report.records_synced += records;
                    }
                    Ok(DispatchOutcome::Failed) => {
                        report.processed += 1;
                        report.failed += 1;
                    }
                    Ok(DispatchOutcome::SkippedLeased) => report.skipped_leased += 1,
                    Ok(DispatchOutcome::SkippedThrottled) => report.skipped_throttled += 1,
                    Err(join_err) => {
                        warn!(error = %join_err, "dispatch task panicked");
                        report.processed += 1;
                        report.failed += 1;
                    }
                }
            }
        };

        if timeout(self.tick_deadline, tick_future).await.is_err() {
            warn!(bucket = bucket.as_str(), "tick deadline exceeded; remaining work continues in background");
        }

        info!(
            bucket = bucket.as_str(),
            processed = report.processed,
            successful = report.successful,
            failed = report.failed,
            "tick completed"
        );
        self.emit_tick_metric(bucket, &report);
        report
    }

    /// Emits the tenant-aggregate `SystemHealthMetric` for this bucket's
    /// tick: the share of dispatched connections that completed
    /// successfully, classified the same way `HealthStatus` is.
    fn emit_tick_metric(&self, bucket: ScheduleBucket, report: &TickReport) {
        let success_rate = if report.processed > 0 {
            (report.successful as f64 / report.processed as f64) * 100.0
        } else {
            100.0
        };
        let status = if success_rate >= 80.0 {
            MetricStatus::Healthy
        } else if success_rate >= 50.0 {
            MetricStatus::Warning
        } else {
            MetricStatus::Critical
        };
        self.ledger.emit_metric(
            &format!("tick_success_rate:{}", bucket.as_str()),
            success_rate,
            "percent",
            status,
        );
    }

    fn clone_handles(&self) -> DispatchHandles {
        DispatchHandles {
            store: self.store.clone(),
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            leases: self.leases.clone(),
        }
    }
}

enum DispatchOutcome {
    Success { records: u64 },
    Failed,
    SkippedLeased,
    SkippedThrottled,
}

#[derive(Clone)]
struct DispatchHandles {
    store: Arc<CanonicalStore>,
    engine: Arc<SyncEngine>,
    registry: Arc<ProviderRegistry>,
    leases: Arc<LeaseRegistry>,
}

impl DispatchHandles {
    async fn dispatch_one(
        &self,
        connection_id: ConnectionId,
        tenant_id: crate::common::TenantId,
        provider_id: String,
        run_deadline: StdDuration,
    ) -> DispatchOutcome {
        let _lease = match self.leases.acquire(connection_id) {
            Ok(lease) => lease,
            Err(_) => return DispatchOutcome::SkippedLeased,
        };

        let connection = match self.store.get_connection(connection_id) {
            Some(c) => c,
            None => return DispatchOutcome::Failed,
        };

        if is_throttled(&connection) {
            return DispatchOutcome::SkippedThrottled;
        }

        let adapter = match self.registry.get(&provider_id) {
            Ok(a) => a,
            Err(_) => return DispatchOutcome::Failed,
        };

        let request = SyncRunRequest {
            connection_id,
            tenant_id,
            provider_id,
            force_full: false,
            resume_from: None,
        };

        let run = timeout(run_deadline, self.engine.run(request, adapter.as_ref())).await;
        match run {
            Ok(Ok(report)) => {
                let next_sync_at = compute_next_sync_at(&connection, true);
                let _ = self.store.update_connection(connection_id, |c| {
                    c.next_sync_at = Some(next_sync_at);
                });
                if report.status == "completed" {
                    DispatchOutcome::Success { records: report.records_imported }
                } else {
                    DispatchOutcome::Failed
                }
            }
            Ok(Err(_)) => {
                let next_sync_at = compute_next_sync_at(&connection, false);
                let _ = self.store.update_connection(connection_id, |c| {
                    c.next_sync_at = Some(next_sync_at);
                });
                DispatchOutcome::Failed
            }
            Err(_) => DispatchOutcome::Failed,
        }
    }
}

/// Throttle guard: a connection whose last sync is younger than its
/// bucket's nominal interval is skipped without counting as a failure.
fn is_throttled(connection: &crate::store::Connection) -> bool {
    match connection.last_sync_at {
        Some(last) => {
            let elapsed = crate::common::now_utc() - last;
            elapsed < connection.sync_schedule.interval()
        }
        None => false,
    }
}

/// `next_sync_at = now + interval + backoff(consecutive_failures)`, backoff
/// capped at interval × 8.
fn compute_next_sync_at(connection: &crate::store::Connection, succeeded: bool) -> chrono::DateTime<chrono::Utc> {
    let interval = connection.sync_schedule.interval();
    let now = crate::common::now_utc();
    if succeeded {
        return now + interval;
    }
    let failures = connection.consecutive_failures + 1;
    let backoff_multiplier = 2u32.saturating_pow(failures.min(3)).min(8);
    now + interval * backoff_multiplier as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ConnectionStatus;

    fn sample_connection(last_sync_at: Option<chrono::DateTime<chrono::Utc>>, failures: u32) -> crate::store::Connection {
        crate::store::Connection {
            id: uuid::Uuid::new_v4(),
            tenant_id: uuid::Uuid::new_v4(),
            provider_id: "plaid-like".into(),
            display_name: "Test Bank".into(),
            status: ConnectionStatus::Active,
            integration_type: crate::common::IntegrationType::LinkTokenExchange,
            sync_schedule: ScheduleBucket::Hourly,
            sync_enabled: true,
            last_sync_at,
            next_sync_at: None,
            last_success_at: None,
            last_error: None,
            last_error_at: None,
            consecutive_failures: failures,
            health_score: 100,
            oauth_state: None,
            is_reconnection: false,
            reconnected_from: None,
            reconnection_confidence: None,
            created_by: uuid::Uuid::new_v4(),
            created_at: crate::common::now_utc(),
        }
    }

    #[test]
    fn recently_synced_connection_is_throttled() {
        let connection = sample_connection(Some(crate::common::now_utc()), 0);
        assert!(is_throttled(&connection));
    }

    #[test]
    fn stale_connection_is_not_throttled() {
        let connection = sample_connection(Some(crate::common::now_utc() - chrono::Duration::hours(2)), 0);
        assert!(!is_throttled(&connection));
    }

    #[test]
    fn backoff_is_capped_at_eight_times_interval() {
        let connection = sample_connection(None, 10);
        let next = compute_next_sync_at(&connection, false);
        let now = crate::common::now_utc();
        let max_allowed = now + connection.sync_schedule.interval() * 8;
        assert!(next <= max_allowed + chrono::Duration::seconds(1));
    }

    #[test]
    fn successful_run_schedules_at_plain_interval() {
        let connection = sample_connection(None, 3);
        let next = compute_next_sync_at(&connection, true);
        let now = crate::common::now_utc();
        let expected = now + connection.sync_schedule.interval();
        assert!((next - expected).num_seconds().abs() < 2);
    }
}
