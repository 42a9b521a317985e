//! Reconnection Detector (C5): fingerprint-based matching of a newly
//! authorized connection against prior accounts for the same tenant, with
//! confidence scoring and a smart resume date.
//!
//! Implemented as a polymorphic matcher over {external_id_match,
//! institution_id_match, iban_match, name_match} variants with an
//! aggregate confidence. Each matcher is a small pure function over the
//! store's existing rows; `detect` aggregates them into one verdict.

use crate::common::{AccountId, ConnectionId, TenantId};
use crate::error::Result;
use crate::ledger::{ConnectionHistoryEventType, Ledger};
use crate::providers::InstitutionFingerprint;
use crate::store::{Account, CanonicalStore};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone)]
pub struct NewAuthorizationAccount {
    pub external_account_id: String,
    pub account_number_last4: Option<String>,
    pub iban: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MatchedAccount {
    pub account: Account,
    pub reason: MatchReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    ExternalIdMatch,
    InstitutionIdMatch,
    IbanMatch,
    NameMatch,
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub confidence: Confidence,
    pub matched_accounts: Vec<MatchedAccount>,
    pub resume_from: Option<DateTime<Utc>>,
}

/// Runs the matcher cascade against every existing `ProviderAccount` +
/// `Account` pair for the tenant and picks the strongest aggregate
/// confidence.
pub fn detect(
    store: &CanonicalStore,
    tenant_id: TenantId,
    provider_id: &str,
    institution: &InstitutionFingerprint,
    candidates: &[NewAuthorizationAccount],
) -> DetectionResult {
    let existing_provider_accounts = store.provider_accounts_for_tenant(tenant_id);
    let existing_accounts = store.accounts_for_tenant(tenant_id);

    let mut matched: Vec<MatchedAccount> = Vec::new();
    let mut best_confidence = Confidence::Low;

    for candidate in candidates {
        if let Some(pa) = existing_provider_accounts
            .iter()
            .find(|pa| pa.provider_id == provider_id && pa.external_account_id == candidate.external_account_id)
        {
            if let Some(account_id) = pa.canonical_account_id {
                if let Some(account) = existing_accounts.iter().find(|a| a.id == account_id) {
                    matched.push(MatchedAccount {
                        account: account.clone(),
                        reason: MatchReason::ExternalIdMatch,
                    });
                    best_confidence = Confidence::High;
                    continue;
                }
            }
        }

        if let Some(iban) = &candidate.iban {
            if let Some(account) = existing_accounts.iter().find(|a| a.iban.as_deref() == Some(iban.as_str())) {
                matched.push(MatchedAccount {
                    account: account.clone(),
                    reason: MatchReason::IbanMatch,
                });
                best_confidence = Confidence::High;
                continue;
            }
        }

        if let Some(last4) = &candidate.account_number_last4 {
            let institution_match = existing_provider_accounts.iter().any(|pa| {
                pa.provider_metadata
                    .get("institution_id")
                    .and_then(|v| v.as_str())
                    .map(|id| id == institution.institution_id)
                    .unwrap_or(false)
            });
            if institution_match {
                if let Some(account) = existing_accounts
                    .iter()
                    .find(|a| a.iban.as_deref().map(|iban| iban.ends_with(last4.as_str())).unwrap_or(false))
                {
                    matched.push(MatchedAccount {
                        account: account.clone(),
                        reason: MatchReason::InstitutionIdMatch,
                    });
                    best_confidence = Confidence::High;
                    continue;
                }
            }
        }
    }

    if matched.is_empty() {
        let normalized_institution = normalize_name(&institution.institution_display_name);
        let name_matched_accounts: Vec<&Account> = existing_accounts
            .iter()
            .filter(|a| {
                a.bank_name
                    .as_deref()
                    .map(|n| normalize_name(n) == normalized_institution)
                    .unwrap_or(false)
            })
            .collect();
        let partial_number_overlap = candidates.iter().any(|c| {
            c.account_number_last4.as_ref().map(|last4| {
                name_matched_accounts
                    .iter()
                    .any(|a| a.iban.as_deref().map(|iban| iban.contains(last4.as_str())).unwrap_or(false))
            }).unwrap_or(false)
        });
        if !name_matched_accounts.is_empty() && partial_number_overlap {
            best_confidence = Confidence::Medium;
            for account in name_matched_accounts {
                matched.push(MatchedAccount {
                    account: account.clone(),
                    reason: MatchReason::NameMatch,
                });
            }
        }
    }

    let resume_from = if best_confidence == Confidence::High {
        matched
            .iter()
            .flat_map(|m| store.transactions_for_account(m.account.id))
            .map(|t| t.date)
            .max()
    } else {
        None
    };

    DetectionResult {
        confidence: best_confidence,
        matched_accounts: matched,
        resume_from,
    }
}

/// HIGH-confidence outcome: re-parents matched accounts and their history
/// onto the new connection, writes a `Reconnection` history event per
/// account, and returns the accounts actually re-parented. An account whose
/// patch fails is skipped and logged rather than reported as relinked.
pub fn apply_high_confidence_link(
    store: &CanonicalStore,
    ledger: &Ledger,
    new_connection_id: ConnectionId,
    provider_id: &str,
    result: &DetectionResult,
) -> Result<Vec<AccountId>> {
    let mut relinked = Vec::new();
    for matched in &result.matched_accounts {
        let previous_connection_id = matched.account.connection_id;
        if let Err(err) = store.update_account(matched.account.created_by, matched.account.id, |a| {
            a.connection_id = Some(new_connection_id);
            a.provider_id = Some(provider_id.to_string());
        }) {
            warn!(account_id = %matched.account.id, error = %err, "failed to relink account during reconnection");
            continue;
        }
        store.reparent_transactions(matched.account.id, new_connection_id);
        ledger.record_connection_history(
            new_connection_id,
            previous_connection_id,
            Some(matched.account.id),
            ConnectionHistoryEventType::Reconnection,
            "high",
            json!({ "reason": format!("{:?}", matched.reason) }),
        );
        relinked.push(matched.account.id);
    }
    Ok(relinked)
}

/// MEDIUM-confidence outcome: no automatic re-parenting, only a
/// `ReconnectionProposed` history event per candidate match surfaced for
/// human review.
pub fn propose_medium_confidence_link(ledger: &Ledger, new_connection_id: ConnectionId, result: &DetectionResult) {
    for matched in &result.matched_accounts {
        ledger.record_connection_history(
            new_connection_id,
            matched.account.connection_id,
            Some(matched.account.id),
            ConnectionHistoryEventType::ReconnectionProposed,
            "medium",
            json!({ "reason": format!("{:?}", matched.reason) }),
        );
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{now_utc, BookingStatus, Metadata, Role, TransactionDirection};
    use crate::store::{AccountBalances, TenantSettings, Transaction};
    use uuid::Uuid;

    fn seeded_store() -> (CanonicalStore, TenantId, AccountId) {
        let store = CanonicalStore::new();
        let tenant = store.create_tenant(
            "acme",
            "pro",
            TenantSettings { currency: "EUR".into(), timezone: "UTC".into(), date_format: "Y-m-d".into() },
        );
        let user_id = Uuid::new_v4();
        store.add_membership(user_id, tenant.id, Role::Owner);
        let account = crate::store::Account {
            id: Uuid::new_v4(),
            account_id: "acc-1".into(),
            tenant_id: tenant.id,
            entity_id: None,
            account_name: "Checking".into(),
            account_type: "checking".into(),
            currency: "EUR".into(),
            balances: AccountBalances::default(),
            iban: Some("DE89370400440532013000".into()),
            bic: None,
            bank_name: Some("Big Bank".into()),
            account_status: "active".into(),
            connection_id: None,
            provider_id: None,
            external_account_id: None,
            created_by: user_id,
            created_at: now_utc(),
        };
        let account = store.create_account(user_id, account).unwrap();
        store.upsert_transaction_by_external_id(
            tenant.id,
            Uuid::new_v4(),
            None,
            Transaction {
                transaction_id: Uuid::new_v4(),
                tenant_id: tenant.id,
                account_id: account.id,
                date: now_utc(),
                value_date: None,
                amount: -5.0,
                currency: "EUR".into(),
                direction: TransactionDirection::Debit,
                description: "past txn".into(),
                category: None,
                merchant_name: None,
                counterparty_name: None,
                counterparty_iban: None,
                reference: None,
                booking_status: BookingStatus::Booked,
                transaction_type_code: None,
                connection_id: None,
                external_transaction_id: None,
                import_job_id: None,
                metadata: Metadata::new(),
                removed: false,
            },
        ).unwrap();
        (store, tenant.id, account.id)
    }

    #[test]
    fn iban_match_yields_high_confidence_with_resume_date() {
        let (store, tenant_id, _account_id) = seeded_store();
        let institution = InstitutionFingerprint {
            institution_id: "big-bank".into(),
            institution_display_name: "Big Bank".into(),
        };
        let candidates = vec![NewAuthorizationAccount {
            external_account_id: "new-ext-1".into(),
            account_number_last4: Some("3000".into()),
            iban: Some("DE89370400440532013000".into()),
        }];
        let result = detect(&store, tenant_id, "plaid-like", &institution, &candidates);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.matched_accounts.len(), 1);
        assert!(result.resume_from.is_some());
    }

    #[test]
    fn high_confidence_link_reparents_and_records_history() {
        let (store, tenant_id, account_id) = seeded_store();
        let ledger = Ledger::new();
        let institution = InstitutionFingerprint {
            institution_id: "big-bank".into(),
            institution_display_name: "Big Bank".into(),
        };
        let candidates = vec![NewAuthorizationAccount {
            external_account_id: "new-ext-1".into(),
            account_number_last4: Some("3000".into()),
            iban: Some("DE89370400440532013000".into()),
        }];
        let result = detect(&store, tenant_id, "plaid-like", &institution, &candidates);
        let new_connection_id = Uuid::new_v4();
        let relinked = apply_high_confidence_link(&store, &ledger, new_connection_id, "plaid-like", &result).unwrap();
        assert_eq!(relinked, vec![account_id]);
        let history = ledger.connection_history_for(new_connection_id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, ConnectionHistoryEventType::Reconnection);
        assert_eq!(history[0].account_id, Some(account_id));
    }

    #[test]
    fn no_match_yields_low_confidence() {
        let (store, tenant_id, _account_id) = seeded_store();
        let institution = InstitutionFingerprint {
            institution_id: "other-bank".into(),
            institution_display_name: "Other Bank".into(),
        };
        let candidates = vec![NewAuthorizationAccount {
            external_account_id: "brand-new".into(),
            account_number_last4: None,
            iban: None,
        }];
        let result = detect(&store, tenant_id, "plaid-like", &institution, &candidates);
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.matched_accounts.is_empty());
    }
}
