//! Shared identifiers, enums, and small value types used across every
//! component — the foundation every other module imports.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type TenantId = Uuid;
pub type UserId = Uuid;
pub type ConnectionId = Uuid;
pub type AccountId = Uuid;
pub type TransactionId = Uuid;
pub type JobId = Uuid;

/// An opaque JSON bag for provider fields with no typed column, per the
/// design note that dynamic record maps are replaced by explicit columns
/// everywhere except this one escape hatch.
pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    Admin,
    Editor,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Pending,
    Active,
    Error,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationType {
    OauthRedirect,
    LinkTokenExchange,
    DirectCredentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleBucket {
    Manual,
    Hourly,
    Every4h,
    Every12h,
    Daily,
    Weekly,
}

impl ScheduleBucket {
    /// Nominal cadence for this bucket, used to compute `next_sync_at` and
    /// the throttling minimum interval.
    pub fn interval(&self) -> chrono::Duration {
        match self {
            ScheduleBucket::Manual => chrono::Duration::days(3650),
            ScheduleBucket::Hourly => chrono::Duration::hours(1),
            ScheduleBucket::Every4h => chrono::Duration::hours(4),
            ScheduleBucket::Every12h => chrono::Duration::hours(12),
            ScheduleBucket::Daily => chrono::Duration::days(1),
            ScheduleBucket::Weekly => chrono::Duration::weeks(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleBucket::Manual => "manual",
            ScheduleBucket::Hourly => "hourly",
            ScheduleBucket::Every4h => "every_4h",
            ScheduleBucket::Every12h => "every_12h",
            ScheduleBucket::Daily => "daily",
            ScheduleBucket::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(ScheduleBucket::Manual),
            "hourly" => Some(ScheduleBucket::Hourly),
            "every_4h" => Some(ScheduleBucket::Every4h),
            "every_12h" => Some(ScheduleBucket::Every12h),
            "daily" => Some(ScheduleBucket::Daily),
            "weekly" => Some(ScheduleBucket::Weekly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionDirection {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Booked,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn classify(score: u8) -> Self {
        if score >= 80 {
            HealthStatus::Healthy
        } else if score >= 50 {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        }
    }
}

/// Current wall-clock timestamp, factored out so tests can see one call
/// site if a fixed clock is ever substituted.
pub fn now_utc() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_bucket_roundtrips_through_str() {
        for bucket in [
            ScheduleBucket::Manual,
            ScheduleBucket::Hourly,
            ScheduleBucket::Every4h,
            ScheduleBucket::Every12h,
            ScheduleBucket::Daily,
            ScheduleBucket::Weekly,
        ] {
            assert_eq!(ScheduleBucket::parse(bucket.as_str()), Some(bucket));
        }
    }

    #[test]
    fn health_status_thresholds_match_classification() {
        assert_eq!(HealthStatus::classify(100), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(80), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(79), HealthStatus::Warning);
        assert_eq!(HealthStatus::classify(50), HealthStatus::Warning);
        assert_eq!(HealthStatus::classify(49), HealthStatus::Critical);
        assert_eq!(HealthStatus::classify(0), HealthStatus::Critical);
    }
}
