//! Health Scorer (C7): per-connection 0–100 score driven by success ratio,
//! consecutive failures, and staleness, with automatic status
//! classification.

use crate::common::HealthStatus;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy)]
pub struct ScoringInputs {
    /// successes / total over the last 20 jobs; 100 if there is no history.
    pub success_rate_20: f64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Computes `score` and `status` from a weighted blend of recent success
/// rate, consecutive failures, and staleness since the last success. Kept
/// as a free function (not a method on `Connection`) so it can be unit
/// tested in isolation from the store.
pub fn score(inputs: ScoringInputs, now: DateTime<Utc>) -> (u8, HealthStatus) {
    let success_component = 0.4 * inputs.success_rate_20;

    let failure_component = if inputs.consecutive_failures == 0 {
        0.4 * 100.0
    } else {
        0.4 * (100.0 - 15.0 * inputs.consecutive_failures as f64).max(0.0)
    };

    let staleness_component = match inputs.last_success_at {
        Some(last_success) => {
            let hours_since = (now - last_success).num_seconds() as f64 / 3600.0;
            if hours_since <= 24.0 {
                0.2 * 100.0
            } else {
                0.2 * (100.0 - (hours_since / 24.0) * 10.0).max(0.0)
            }
        }
        None => 0.2 * 100.0,
    };

    let raw = success_component + failure_component + staleness_component;
    let clamped = raw.round().clamp(0.0, 100.0) as u8;
    (clamped, HealthStatus::classify(clamped))
}

/// Computes `success_rate_20` from a window of recent job outcomes
/// (newest last), defaulting to 100 when there is no history.
pub fn success_rate_from_recent_outcomes(recent_successes: &[bool]) -> f64 {
    let window: Vec<&bool> = recent_successes.iter().rev().take(20).collect();
    if window.is_empty() {
        return 100.0;
    }
    let successes = window.iter().filter(|ok| ***ok).count();
    successes as f64 / window.len() as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_history_yields_max_score() {
        let now = chrono::Utc::now();
        let (score, status) = score(
            ScoringInputs {
                success_rate_20: 100.0,
                consecutive_failures: 0,
                last_success_at: Some(now),
            },
            now,
        );
        assert_eq!(score, 100);
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn score_is_always_within_bounds() {
        let now = chrono::Utc::now();
        for failures in 0..50u32 {
            for rate in [0.0, 25.0, 50.0, 75.0, 100.0] {
                let (score, _) = score(
                    ScoringInputs {
                        success_rate_20: rate,
                        consecutive_failures: failures,
                        last_success_at: Some(now - chrono::Duration::days(10)),
                    },
                    now,
                );
                assert!(score <= 100);
            }
        }
    }

    #[test]
    fn status_thresholds_match_classification_boundaries() {
        assert_eq!(HealthStatus::classify(80), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(50), HealthStatus::Warning);
        assert_eq!(HealthStatus::classify(49), HealthStatus::Critical);
    }

    #[test]
    fn consecutive_failures_depress_score() {
        let now = chrono::Utc::now();
        let (healthy_score, _) = score(
            ScoringInputs { success_rate_20: 100.0, consecutive_failures: 0, last_success_at: Some(now) },
            now,
        );
        let (degraded_score, _) = score(
            ScoringInputs { success_rate_20: 100.0, consecutive_failures: 3, last_success_at: Some(now) },
            now,
        );
        assert!(degraded_score < healthy_score);
    }

    #[test]
    fn success_rate_defaults_to_100_with_no_history() {
        assert_eq!(success_rate_from_recent_outcomes(&[]), 100.0);
    }
}
