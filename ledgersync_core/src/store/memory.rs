use crate::store::traits::SyncStore;
use crate::sync::models::{
    AccountId, AccountStatus, CredentialSet, IntegrationAccount, IntegrationKind, ObjectKind,
    RawExternalObject, SyncCursor, SyncLease,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// In-memory SyncStore for local development and unit tests.
///
/// All operations run under one lock, so a batch upsert is atomic by
/// construction.
#[derive(Clone, Default)]
pub struct MemorySyncStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, IntegrationAccount>,
    cursors: HashMap<(AccountId, ObjectKind), SyncCursor>,
    objects: HashMap<(AccountId, ObjectKind, String), RawExternalObject>,
    leases: HashMap<AccountId, SyncLease>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn insert_account(&self, account: &IntegrationAccount) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner.accounts.values().any(|a| {
            a.integration == account.integration
                && a.external_account_id == account.external_account_id
        });
        if duplicate {
            return Err(Error::Conflict(format!(
                "account {}/{} already connected",
                account.integration, account.external_account_id
            )));
        }
        inner.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<IntegrationAccount>> {
        Ok(self.inner.lock().await.accounts.get(&id).cloned())
    }

    async fn find_account(
        &self,
        integration: IntegrationKind,
        external_account_id: &str,
    ) -> Result<Option<IntegrationAccount>> {
        Ok(self
            .inner
            .lock()
            .await
            .accounts
            .values()
            .find(|a| {
                a.integration == integration && a.external_account_id == external_account_id
            })
            .cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<IntegrationAccount>> {
        let inner = self.inner.lock().await;
        let mut accounts: Vec<_> = inner.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(accounts)
    }

    async fn update_account_credentials(
        &self,
        id: AccountId,
        credentials: &CredentialSet,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account '{id}' not found")))?;
        account.update_credentials(credentials.clone(), now);
        Ok(())
    }

    async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account '{id}' not found")))?;
        account.status = status;
        account.updated_at = now;
        Ok(())
    }

    async fn get_cursor(
        &self,
        account_id: AccountId,
        kind: ObjectKind,
    ) -> Result<Option<SyncCursor>> {
        Ok(self
            .inner
            .lock()
            .await
            .cursors
            .get(&(account_id, kind))
            .cloned())
    }

    async fn upsert_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.inner
            .lock()
            .await
            .cursors
            .insert((cursor.account_id, cursor.kind), cursor.clone());
        Ok(())
    }

    async fn list_cursors(&self, account_id: AccountId) -> Result<Vec<SyncCursor>> {
        let inner = self.inner.lock().await;
        let mut cursors: Vec<_> = inner
            .cursors
            .values()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect();
        cursors.sort_by_key(|c| c.kind.as_str());
        Ok(cursors)
    }

    async fn upsert_objects(&self, batch: &[RawExternalObject]) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut written = 0u64;
        for record in batch {
            let key = (
                record.account_id,
                record.kind,
                record.vendor_object_id.clone(),
            );
            match inner.objects.get(&key) {
                Some(existing) if record.vendor_updated_at <= existing.vendor_updated_at => {
                    // Stale replay: newer data stays.
                }
                _ => {
                    inner.objects.insert(key, record.clone());
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn get_object(
        &self,
        account_id: AccountId,
        kind: ObjectKind,
        vendor_object_id: &str,
    ) -> Result<Option<RawExternalObject>> {
        Ok(self
            .inner
            .lock()
            .await
            .objects
            .get(&(account_id, kind, vendor_object_id.to_string()))
            .cloned())
    }

    async fn count_objects(&self, account_id: AccountId, kind: ObjectKind) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .await
            .objects
            .keys()
            .filter(|(a, k, _)| *a == account_id && *k == kind)
            .count() as u64)
    }

    async fn try_acquire_lease(
        &self,
        account_id: AccountId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        match inner.leases.get(&account_id) {
            Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
            _ => {
                inner.leases.insert(
                    account_id,
                    SyncLease {
                        account_id,
                        holder: holder.to_string(),
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, account_id: AccountId, holder: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let owned = inner
            .leases
            .get(&account_id)
            .map(|lease| lease.holder == holder)
            .unwrap_or(false);
        if owned {
            inner.leases.remove(&account_id);
        }
        Ok(())
    }
}
