//! Canonical Store (C1): tenant-scoped persistence for tenants, memberships,
//! connections, accounts, and transactions, plus the row-level access
//! predicates every other component goes through.
//!
//! Every table is a `DashMap` keyed by surrogate id, with membership rows
//! enforcing the tenant-isolation predicate on each call. This crate has no
//! backing SQL engine — the "store" is the in-process source of truth a
//! persistence layer would sit behind; nothing here precludes swapping in a
//! real database later, which is why the operation surface is spelled out
//! as a trait-free inherent API rather than ad hoc field access.

use crate::common::{
    AccountId, BookingStatus, ConnectionId, ConnectionStatus, IntegrationType, JobId, Metadata,
    Role, ScheduleBucket, TenantId, TransactionDirection, TransactionId, UserId,
};
use crate::error::{OrchestratorError, Result, StoreError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSettings {
    pub currency: String,
    pub timezone: String,
    pub date_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub slug: String,
    pub plan: String,
    pub settings: TenantSettings,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub tenant_id: TenantId,
    pub provider_id: String,
    pub display_name: String,
    pub status: ConnectionStatus,
    pub integration_type: IntegrationType,
    pub sync_schedule: ScheduleBucket,
    pub sync_enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub health_score: u8,
    pub oauth_state: Option<String>,
    pub is_reconnection: bool,
    pub reconnected_from: Option<ConnectionId>,
    pub reconnection_confidence: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountBalances {
    pub current: f64,
    pub available: Option<f64>,
    pub ledger: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub account_id: String,
    pub tenant_id: TenantId,
    pub entity_id: Option<String>,
    pub account_name: String,
    pub account_type: String,
    pub currency: String,
    pub balances: AccountBalances,
    pub iban: Option<String>,
    pub bic: Option<String>,
    pub bank_name: Option<String>,
    pub account_status: String,
    pub connection_id: Option<ConnectionId>,
    pub provider_id: Option<String>,
    pub external_account_id: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub date: DateTime<Utc>,
    pub value_date: Option<DateTime<Utc>>,
    pub amount: f64,
    pub currency: String,
    pub direction: TransactionDirection,
    pub description: String,
    pub category: Option<String>,
    pub merchant_name: Option<String>,
    pub counterparty_name: Option<String>,
    pub counterparty_iban: Option<String>,
    pub reference: Option<String>,
    pub booking_status: BookingStatus,
    pub transaction_type_code: Option<String>,
    pub connection_id: Option<ConnectionId>,
    pub external_transaction_id: Option<String>,
    pub import_job_id: Option<JobId>,
    pub metadata: Metadata,
    /// Soft-delete flag for provider-signaled removals; see DESIGN.md for
    /// why this stays soft-remove rather than a hard delete.
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    pub provider_id: String,
    pub external_account_id: String,
    pub account_type: String,
    pub currency: String,
    pub balance: f64,
    pub iban: Option<String>,
    pub status: String,
    pub provider_metadata: Metadata,
    pub last_synced_at: DateTime<Utc>,
    pub canonical_account_id: Option<AccountId>,
}

/// A fully enriched account as returned by `getAccounts`: a left-outer join
/// against the owning connection. Manual accounts (no connection) yield
/// nulls in the connection fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedAccount {
    #[serde(flatten)]
    pub account: Account,
    pub connection_provider_id: Option<String>,
    pub connection_name: Option<String>,
    pub connection_status: Option<ConnectionStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct AccountFilters {
    pub account_type: Option<String>,
    pub connection_id: Option<ConnectionId>,
}

pub struct SyncOutcome {
    pub success: bool,
    pub error_message: Option<String>,
}

/// The canonical store. Every table is tenant-indexed; every public method
/// takes the acting principal's tenant memberships and enforces the role
/// membership predicate before touching a row.
pub struct CanonicalStore {
    tenants: DashMap<TenantId, Tenant>,
    memberships: DashMap<(UserId, TenantId), Membership>,
    connections: DashMap<ConnectionId, Connection>,
    accounts: DashMap<AccountId, Account>,
    transactions: DashMap<TransactionId, Transaction>,
    provider_accounts: DashMap<Uuid, ProviderAccount>,
}

impl Default for CanonicalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonicalStore {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
            memberships: DashMap::new(),
            connections: DashMap::new(),
            accounts: DashMap::new(),
            transactions: DashMap::new(),
            provider_accounts: DashMap::new(),
        }
    }

    /// Tenant isolation predicate: a principal may act on a tenant-scoped
    /// row only if a membership row exists for them.
    pub fn assert_member(&self, user_id: UserId, tenant_id: TenantId) -> Result<()> {
        if self.memberships.contains_key(&(user_id, tenant_id)) {
            Ok(())
        } else {
            Err(StoreError::PermissionDenied {
                tenant_id: tenant_id.to_string(),
            }
            .into())
        }
    }

    pub fn create_tenant(&self, slug: &str, plan: &str, settings: TenantSettings) -> Tenant {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            plan: plan.to_string(),
            settings,
            created_at: crate::common::now_utc(),
        };
        self.tenants.insert(tenant.id, tenant.clone());
        tenant
    }

    /// Adds a membership. The ≥1-owner-per-tenant invariant is enforced at
    /// removal time, not here (a tenant starts with its creating owner).
    pub fn add_membership(&self, user_id: UserId, tenant_id: TenantId, role: Role) {
        self.memberships
            .insert((user_id, tenant_id), Membership { user_id, tenant_id, role });
    }

    /// Removes a membership, refusing to drop the tenant's last owner.
    pub fn remove_membership(&self, user_id: UserId, tenant_id: TenantId) -> Result<()> {
        let is_owner = self
            .memberships
            .get(&(user_id, tenant_id))
            .map(|m| m.role == Role::Owner)
            .unwrap_or(false);
        if is_owner {
            let remaining_owners = self
                .memberships
                .iter()
                .filter(|m| m.tenant_id == tenant_id && m.role == Role::Owner && m.user_id != user_id)
                .count();
            if remaining_owners == 0 {
                return Err(StoreError::Validation(
                    "cannot remove the last owner of a tenant".into(),
                )
                .into());
            }
        }
        self.memberships.remove(&(user_id, tenant_id));
        Ok(())
    }

    pub fn insert_connection(&self, connection: Connection) {
        self.connections.insert(connection.id, connection);
    }

    pub fn get_connection(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.get(&id).map(|c| c.clone())
    }

    /// Resolves the pending Connection awaiting an OAuth callback by its
    /// CSRF `oauth_state` token.
    pub fn find_connection_by_oauth_state(&self, state: &str) -> Option<Connection> {
        self.connections
            .iter()
            .find(|c| c.oauth_state.as_deref() == Some(state))
            .map(|c| c.clone())
    }

    pub fn update_connection<F: FnOnce(&mut Connection)>(&self, id: ConnectionId, f: F) -> Result<()> {
        let mut entry = self.connections.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "Connection",
            id: id.to_string(),
        })?;
        f(&mut entry);
        Ok(())
    }

    /// getAccounts(tenant, filters) — left-outer enriched projection.
    pub fn get_accounts(
        &self,
        user_id: UserId,
        tenant_id: TenantId,
        filters: &AccountFilters,
    ) -> Result<Vec<EnrichedAccount>> {
        self.assert_member(user_id, tenant_id)?;
        let mut out = Vec::new();
        for entry in self.accounts.iter() {
            let account = entry.value();
            if account.tenant_id != tenant_id {
                continue;
            }
            if let Some(ref t) = filters.account_type {
                if &account.account_type != t {
                    continue;
                }
            }
            if let Some(cid) = filters.connection_id {
                if account.connection_id != Some(cid) {
                    continue;
                }
            }
            let (provider_id, connection_name, connection_status) = match account.connection_id {
                Some(cid) => match self.connections.get(&cid) {
                    Some(conn) => (
                        Some(conn.provider_id.clone()),
                        Some(conn.display_name.clone()),
                        Some(conn.status),
                    ),
                    None => (None, None, None),
                },
                None => (None, None, None),
            };
            out.push(EnrichedAccount {
                account: account.clone(),
                connection_provider_id: provider_id,
                connection_name,
                connection_status,
            });
        }
        Ok(out)
    }

    pub fn create_account(&self, user_id: UserId, mut account: Account) -> Result<Account> {
        self.assert_member(user_id, account.tenant_id)?;
        if account.entity_id.as_deref() == Some("") {
            account.entity_id = None;
        }
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    /// System-originated account creation, bypassing the membership
    /// predicate: the sync engine (C4) acts on behalf of a connection, not
    /// a logged-in principal, mirroring `list_connections_fleet_wide`'s
    /// bypass for the same reason.
    pub fn create_account_system(&self, account: Account) -> Account {
        self.accounts.insert(account.id, account.clone());
        account
    }

    /// System-originated account patch (see `create_account_system`).
    pub fn update_account_system(
        &self,
        account_id: AccountId,
        mut patch: impl FnMut(&mut Account),
    ) -> Result<Account> {
        let mut entry = self.accounts.get_mut(&account_id).ok_or(StoreError::NotFound {
            entity: "Account",
            id: account_id.to_string(),
        })?;
        patch(&mut entry);
        Ok(entry.clone())
    }

    pub fn update_account(
        &self,
        user_id: UserId,
        account_id: AccountId,
        mut patch: impl FnMut(&mut Account),
    ) -> Result<Account> {
        let tenant_id = self
            .accounts
            .get(&account_id)
            .ok_or(StoreError::NotFound {
                entity: "Account",
                id: account_id.to_string(),
            })?
            .tenant_id;
        self.assert_member(user_id, tenant_id)?;
        let mut entry = self.accounts.get_mut(&account_id).unwrap();
        patch(&mut entry);
        if entry.entity_id.as_deref() == Some("") {
            entry.entity_id = None;
        }
        Ok(entry.clone())
    }

    /// deleteAccount: refused while any Transaction or ProviderAccount
    /// still references the account.
    pub fn delete_account(&self, user_id: UserId, account_id: AccountId) -> Result<()> {
        let tenant_id = self
            .accounts
            .get(&account_id)
            .ok_or(StoreError::NotFound {
                entity: "Account",
                id: account_id.to_string(),
            })?
            .tenant_id;
        self.assert_member(user_id, tenant_id)?;

        let referencing_transactions = self
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .count();
        let referencing_provider_accounts = self
            .provider_accounts
            .iter()
            .filter(|pa| pa.canonical_account_id == Some(account_id))
            .count();
        let blocking_count = referencing_transactions + referencing_provider_accounts;
        if blocking_count > 0 {
            return Err(StoreError::DeleteBlocked {
                entity: "Account",
                id: account_id.to_string(),
                blocking_count,
            }
            .into());
        }
        self.accounts.remove(&account_id);
        Ok(())
    }

    /// upsertTransactionByExternalId: atomic insert-or-update keyed on
    /// (tenant, connection, external_id). When `external_transaction_id` is
    /// `None` this always inserts (no uniqueness is enforced).
    pub fn upsert_transaction_by_external_id(
        &self,
        tenant_id: TenantId,
        connection_id: ConnectionId,
        external_id: Option<&str>,
        fields: Transaction,
    ) -> Result<TransactionId> {
        if fields.tenant_id != tenant_id {
            return Err(OrchestratorError::IntegrityError(
                "transaction tenant_id does not match connection's tenant".into(),
            ));
        }
        if let Some(external_id) = external_id {
            let existing = self.transactions.iter().find(|t| {
                t.tenant_id == tenant_id
                    && t.connection_id == Some(connection_id)
                    && t.external_transaction_id.as_deref() == Some(external_id)
            });
            if let Some(existing) = existing {
                let id = existing.transaction_id;
                drop(existing);
                let mut entry = self.transactions.get_mut(&id).unwrap();
                let mut updated = fields;
                updated.transaction_id = id;
                *entry = updated;
                return Ok(id);
            }
        }
        let id = fields.transaction_id;
        self.transactions.insert(id, fields);
        Ok(id)
    }

    pub fn get_transaction(&self, id: TransactionId) -> Option<Transaction> {
        self.transactions.get(&id).map(|t| t.clone())
    }

    pub fn transactions_for_account(&self, account_id: AccountId) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .map(|t| t.clone())
            .collect()
    }

    pub fn transactions_for_tenant(&self, tenant_id: TenantId) -> Vec<Transaction> {
        self.transactions
            .iter()
            .filter(|t| t.tenant_id == tenant_id)
            .map(|t| t.clone())
            .collect()
    }

    /// Soft-removes a transaction in place for a provider-signaled removal.
    /// Never hard-deletes the row, so audit/history stays intact.
    pub fn mark_transaction_removed(&self, transaction_id: TransactionId) -> Result<()> {
        let mut entry = self.transactions.get_mut(&transaction_id).ok_or(StoreError::NotFound {
            entity: "Transaction",
            id: transaction_id.to_string(),
        })?;
        entry.removed = true;
        Ok(())
    }

    /// Re-parents every transaction previously attached to `from_account`
    /// onto `new_connection_id`, used by the reconnection detector.
    pub fn reparent_transactions(
        &self,
        account_id: AccountId,
        new_connection_id: ConnectionId,
    ) -> usize {
        let mut count = 0;
        for mut entry in self.transactions.iter_mut() {
            if entry.account_id == account_id {
                entry.connection_id = Some(new_connection_id);
                count += 1;
            }
        }
        count
    }

    pub fn insert_provider_account(&self, pa: ProviderAccount) {
        self.provider_accounts.insert(pa.id, pa);
    }

    pub fn find_provider_account(
        &self,
        connection_id: ConnectionId,
        provider_id: &str,
        external_account_id: &str,
    ) -> Option<ProviderAccount> {
        self.provider_accounts
            .iter()
            .find(|pa| {
                pa.connection_id == connection_id
                    && pa.provider_id == provider_id
                    && pa.external_account_id == external_account_id
            })
            .map(|pa| pa.clone())
    }

    pub fn provider_accounts_for_tenant(&self, tenant_id: TenantId) -> Vec<ProviderAccount> {
        self.provider_accounts
            .iter()
            .filter(|pa| pa.tenant_id == tenant_id)
            .map(|pa| pa.clone())
            .collect()
    }

    pub fn accounts_for_tenant(&self, tenant_id: TenantId) -> Vec<Account> {
        self.accounts
            .iter()
            .filter(|a| a.tenant_id == tenant_id)
            .map(|a| a.clone())
            .collect()
    }

    /// listReadyConnections(schedule_bucket, now): sync_enabled, matching
    /// bucket, due, and not currently leased (leasing is enforced by the
    /// scheduler module, which filters this list further).
    pub fn list_ready_connections(
        &self,
        bucket: ScheduleBucket,
        now: DateTime<Utc>,
    ) -> Vec<Connection> {
        let mut ready: Vec<Connection> = self
            .connections
            .iter()
            .filter(|c| {
                c.sync_enabled
                    && c.sync_schedule == bucket
                    && c.next_sync_at.map(|t| t <= now).unwrap_or(true)
            })
            .map(|c| c.clone())
            .collect();
        ready.sort_by(|a, b| {
            a.next_sync_at
                .cmp(&b.next_sync_at)
                .then(a.health_score.cmp(&b.health_score))
        });
        ready
    }

    /// recordSyncOutcome(connection, outcome): resets or increments
    /// `consecutive_failures` and stamps success/error timestamps. Does not
    /// compute `next_sync_at` or `health_score` — those are the
    /// dispatcher's and scorer's responsibilities respectively, applied by
    /// their own callers right after this returns.
    pub fn record_sync_outcome(&self, connection_id: ConnectionId, outcome: &SyncOutcome) -> Result<()> {
        self.update_connection(connection_id, |c| {
            let now = crate::common::now_utc();
            c.last_sync_at = Some(now);
            if outcome.success {
                c.last_success_at = Some(now);
                c.last_error = None;
                c.last_error_at = None;
                c.consecutive_failures = 0;
            } else {
                c.consecutive_failures += 1;
                c.last_error = outcome.error_message.clone();
                c.last_error_at = Some(now);
            }
        })
    }

    /// Fleet-wide read, bypassing tenant isolation, for the super-admin
    /// entry point. Callers are responsible for writing the
    /// AdminAuditEvent (ledger module), kept separate so the store stays
    /// free of the audit module's own dependencies.
    pub fn list_connections_fleet_wide(&self) -> Vec<Connection> {
        self.connections.iter().map(|c| c.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ConnectionStatus, IntegrationType};

    fn store_with_tenant() -> (CanonicalStore, TenantId, UserId) {
        let store = CanonicalStore::new();
        let tenant = store.create_tenant(
            "acme",
            "pro",
            TenantSettings {
                currency: "EUR".into(),
                timezone: "UTC".into(),
                date_format: "YYYY-MM-DD".into(),
            },
        );
        let user_id = Uuid::new_v4();
        store.add_membership(user_id, tenant.id, Role::Owner);
        (store, tenant.id, user_id)
    }

    #[test]
    fn tenant_isolation_blocks_non_members() {
        let (store, tenant_id, _user) = store_with_tenant();
        let stranger = Uuid::new_v4();
        let err = store
            .get_accounts(stranger, tenant_id, &AccountFilters::default())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(StoreError::PermissionDenied { .. })));
    }

    #[test]
    fn delete_refuses_referenced_account() {
        let (store, tenant_id, user_id) = store_with_tenant();
        let account = Account {
            id: Uuid::new_v4(),
            account_id: "acc-1".into(),
            tenant_id,
            entity_id: None,
            account_name: "Checking".into(),
            account_type: "checking".into(),
            currency: "EUR".into(),
            balances: AccountBalances::default(),
            iban: None,
            bic: None,
            bank_name: None,
            account_status: "active".into(),
            connection_id: None,
            provider_id: None,
            external_account_id: None,
            created_by: user_id,
            created_at: crate::common::now_utc(),
        };
        let account = store.create_account(user_id, account).unwrap();

        for _ in 0..3 {
            let txn = Transaction {
                transaction_id: Uuid::new_v4(),
                tenant_id,
                account_id: account.id,
                date: crate::common::now_utc(),
                value_date: None,
                amount: -10.0,
                currency: "EUR".into(),
                direction: TransactionDirection::Debit,
                description: "coffee".into(),
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
            };
            store
                .upsert_transaction_by_external_id(tenant_id, Uuid::new_v4(), None, txn)
                .unwrap();
        }

        let err = store.delete_account(user_id, account.id).unwrap_err();
        match err {
            OrchestratorError::Store(StoreError::DeleteBlocked { blocking_count, .. }) => {
                assert_eq!(blocking_count, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.get_accounts(user_id, tenant_id, &AccountFilters::default()).unwrap().len() == 1);
    }

    #[test]
    fn upsert_transaction_is_idempotent_on_external_id() {
        let (store, tenant_id, user_id) = store_with_tenant();
        let connection_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();
        let make_txn = |amount: f64| Transaction {
            transaction_id: Uuid::new_v4(),
            tenant_id,
            account_id,
            date: crate::common::now_utc(),
            value_date: None,
            amount,
            currency: "EUR".into(),
            direction: TransactionDirection::Debit,
            description: "groceries".into(),
            category: None,
            merchant_name: None,
            counterparty_name: None,
            counterparty_iban: None,
            reference: None,
            booking_status: BookingStatus::Booked,
            transaction_type_code: None,
            connection_id: Some(connection_id),
            external_transaction_id: Some("ext-1".into()),
            import_job_id: None,
            metadata: Metadata::new(),
            removed: false,
        };

        let id1 = store
            .upsert_transaction_by_external_id(tenant_id, connection_id, Some("ext-1"), make_txn(-13.0))
            .unwrap();
        let id2 = store
            .upsert_transaction_by_external_id(tenant_id, connection_id, Some("ext-1"), make_txn(-13.0))
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.transactions_for_account(account_id).len(), 1);
        let _ = user_id;
        let _ = ConnectionStatus::Active;
        let _ = IntegrationType::OauthRedirect;
    }

    #[test]
    fn owner_removal_is_refused_when_last_owner() {
        let (store, tenant_id, user_id) = store_with_tenant();
        let err = store.remove_membership(user_id, tenant_id).unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(StoreError::Validation(_))));
    }
}
