use crate::sync::models::{
    AccountId, AccountStatus, CredentialSet, IntegrationAccount, IntegrationKind, ObjectKind,
    RawExternalObject, SyncCursor,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Shared persistence for accounts, cursors, raw objects, and execution
/// leases. One store backs every account loop; the conditional-write
/// discipline of `upsert_objects` is what makes concurrent writers on the
/// same natural key safe without external locking.
#[async_trait]
pub trait SyncStore: Send + Sync {
    // ── accounts ────────────────────────────────────────────────

    /// Insert a new account. Fails with `Error::Conflict` when
    /// `(integration, external_account_id)` already exists.
    async fn insert_account(&self, account: &IntegrationAccount) -> Result<()>;

    async fn get_account(&self, id: AccountId) -> Result<Option<IntegrationAccount>>;

    async fn find_account(
        &self,
        integration: IntegrationKind,
        external_account_id: &str,
    ) -> Result<Option<IntegrationAccount>>;

    async fn list_accounts(&self) -> Result<Vec<IntegrationAccount>>;

    /// Atomically replace the stored credential set.
    async fn update_account_credentials(
        &self,
        id: AccountId,
        credentials: &CredentialSet,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    // ── cursors ─────────────────────────────────────────────────

    async fn get_cursor(&self, account_id: AccountId, kind: ObjectKind)
        -> Result<Option<SyncCursor>>;

    async fn upsert_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    async fn list_cursors(&self, account_id: AccountId) -> Result<Vec<SyncCursor>>;

    // ── raw objects ─────────────────────────────────────────────

    /// Conflict-resolving batch write keyed on the natural key. An existing
    /// row is overwritten only when the incoming vendor update timestamp is
    /// strictly newer; the comparison is atomic with the write. The batch
    /// applies as a single unit: either all eligible records are durable or
    /// the call fails and the caller must not advance the cursor.
    ///
    /// Returns the number of rows actually written (stale replays are
    /// no-ops and don't count).
    async fn upsert_objects(&self, batch: &[RawExternalObject]) -> Result<u64>;

    async fn get_object(
        &self,
        account_id: AccountId,
        kind: ObjectKind,
        vendor_object_id: &str,
    ) -> Result<Option<RawExternalObject>>;

    async fn count_objects(&self, account_id: AccountId, kind: ObjectKind) -> Result<u64>;

    // ── execution leases ────────────────────────────────────────

    /// Acquire or renew the per-account lease. Succeeds when the lease is
    /// free, expired, or already held by `holder`; returns false when a
    /// different holder's lease is still live.
    async fn try_acquire_lease(
        &self,
        account_id: AccountId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Release the lease if `holder` still owns it.
    async fn release_lease(&self, account_id: AccountId, holder: &str) -> Result<()>;
}
