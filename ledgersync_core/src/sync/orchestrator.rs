use crate::config::SyncConfig;
use crate::error::FailureClass;
use crate::store::traits::SyncStore;
use crate::sync::credential::CredentialPolicy;
use crate::sync::cursor::CursorTracker;
use crate::sync::gateway::PersistenceGateway;
use crate::sync::models::{
    AccountId, AccountStatus, IntegrationAccount, IntegrationKind, ObjectKind, RawExternalObject,
    Watermark,
};
use crate::sync::normalize::normalize;
use crate::sync::traits::{VendorCapability, VendorPage};
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outcome of one kind's sync within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindReport {
    pub kind: ObjectKind,
    /// Records normalized and handed to the persistence gateway.
    pub records: u64,
    /// Malformed records excluded from the batch.
    pub skipped: u64,
    /// True when the kind yielded with backlog remaining.
    pub has_more: bool,
    pub error: Option<String>,
}

/// Outcome of one full cycle for an account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub account_id: AccountId,
    pub kinds: Vec<KindReport>,
}

impl CycleReport {
    /// Work remains; the runner re-enters without the inter-cycle sleep.
    pub fn has_more(&self) -> bool {
        self.kinds.iter().any(|k| k.has_more)
    }
}

/// The durable per-account control loop body.
///
/// One cycle walks `CHECK_CREDENTIALS → SYNC_KIND(k…)`; every page commits
/// its own upsert + cursor-advance pair, so re-running a cycle after a crash
/// re-fetches at most the in-flight page and re-upserts idempotently. Kinds
/// are strictly sequential within an account; parallelism is across
/// accounts, driven by the runner.
pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    vendors: RwLock<HashMap<String, Arc<dyn VendorCapability>>>,
    cursors: CursorTracker,
    gateway: PersistenceGateway,
    policy: CredentialPolicy,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn SyncStore>, config: SyncConfig) -> Self {
        Self {
            cursors: CursorTracker::new(store.clone()),
            gateway: PersistenceGateway::new(store.clone()),
            policy: CredentialPolicy::new(config.credential_lead_time),
            vendors: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    /// Register an in-process vendor capability implementation.
    #[tracing::instrument(level = "debug", skip(self, vendor))]
    pub async fn register_vendor(&self, vendor: Arc<dyn VendorCapability>) -> Result<()> {
        let id = vendor.id().await.to_string();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("vendor id is empty".to_string()));
        }
        let mut vendors = self.vendors.write().await;
        vendors.insert(id, vendor);
        Ok(())
    }

    async fn vendor_for(&self, integration: IntegrationKind) -> Result<Arc<dyn VendorCapability>> {
        let vendors = self.vendors.read().await;
        vendors.get(integration.as_str()).cloned().ok_or_else(|| {
            Error::TerminalConfiguration(format!("vendor '{integration}' not registered"))
        })
    }

    /// Run one sync cycle for an account.
    ///
    /// Transient failures never escape this call; a terminal failure moves
    /// the account to `Error` status and is returned so the caller halts
    /// the loop.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_cycle(&self, account_id: AccountId) -> Result<CycleReport> {
        let mut account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("account '{account_id}' not found")))?;

        if !account.status.is_runnable() {
            return Err(Error::Conflict(format!(
                "account '{account_id}' is {}",
                account.status
            )));
        }

        let vendor = self.vendor_for(account.integration).await?;

        // CHECK_CREDENTIALS (and REFRESH when due).
        if self.policy.needs_refresh(&account.credentials, Utc::now()) {
            self.refresh_credentials(&mut account, &vendor).await?;
        }

        let mut kinds = Vec::new();
        for kind in account.integration.object_kinds() {
            match self.sync_kind(&mut account, &vendor, *kind).await {
                Ok(report) => kinds.push(report),
                Err(e) if e.class() == FailureClass::Terminal => {
                    self.store
                        .set_account_status(account.id, AccountStatus::Error, Utc::now())
                        .await?;
                    tracing::error!(account = %account.id, kind = %kind, error = %e,
                        "terminal failure; halting account");
                    return Err(e);
                }
                Err(e) => {
                    // Skipped for this cycle, cursor unchanged; retried next
                    // cycle. Other kinds still run.
                    tracing::warn!(account = %account.id, kind = %kind, error = %e,
                        "kind sync failed; deferred to next cycle");
                    kinds.push(KindReport {
                        kind: *kind,
                        records: 0,
                        skipped: 0,
                        has_more: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(CycleReport { account_id, kinds })
    }

    /// REFRESH_CREDENTIALS with capped backoff. Exhausting the cap is a
    /// terminal condition: the account needs re-authorization.
    #[tracing::instrument(level = "info", skip(self, account, vendor), fields(account = %account.id))]
    async fn refresh_credentials(
        &self,
        account: &mut IntegrationAccount,
        vendor: &Arc<dyn VendorCapability>,
    ) -> Result<()> {
        let retry = self.config.retry_policy();
        let mut attempt = 0u32;
        loop {
            match vendor.refresh_credentials(&account.credentials).await {
                Ok(fresh) => {
                    // Persist first, then swap in memory; the stored set is
                    // the source of truth on restart.
                    self.store
                        .update_account_credentials(account.id, &fresh, Utc::now())
                        .await?;
                    account.update_credentials(fresh, Utc::now());
                    tracing::info!(account = %account.id, "credentials refreshed");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    let retriable = matches!(
                        e.class(),
                        FailureClass::Transient | FailureClass::RateLimited
                    );
                    if retriable && attempt < self.config.max_refresh_attempts {
                        let wait = e
                            .retry_after()
                            .unwrap_or_else(|| retry.delay_with_jitter(attempt));
                        tracing::warn!(account = %account.id, attempt, error = %e,
                            "credential refresh failed; retrying");
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    self.store
                        .set_account_status(account.id, AccountStatus::Error, Utc::now())
                        .await?;
                    account.mark_error(Utc::now());
                    tracing::error!(account = %account.id, error = %e,
                        "credential refresh exhausted; account requires re-authorization");
                    return Err(match e.class() {
                        FailureClass::Terminal => e,
                        _ => Error::TerminalConfiguration(format!(
                            "credential refresh failed after {attempt} attempts: {e}"
                        )),
                    });
                }
            }
        }
    }

    /// SYNC_KIND: page loop of fetch → normalize → upsert → advance.
    async fn sync_kind(
        &self,
        account: &mut IntegrationAccount,
        vendor: &Arc<dyn VendorCapability>,
        kind: ObjectKind,
    ) -> Result<KindReport> {
        let mut cursor = self.cursors.read(account.id, kind).await?;
        self.cursors.mark_attempt(&mut cursor, Utc::now()).await?;

        let mut records_total = 0u64;
        let mut skipped_total = 0u64;
        let mut pages = 0u32;

        loop {
            let page = match self.fetch_page(account, vendor, kind, &cursor.watermark).await {
                Ok(page) => page,
                Err(e) => {
                    self.cursors
                        .mark_failure(&mut cursor, e.to_string(), Utc::now())
                        .await?;
                    return Err(e);
                }
            };

            let now = Utc::now();
            let mut batch = Vec::with_capacity(page.records.len());
            for record in &page.records {
                match normalize(record, account.id, kind, now) {
                    Ok(obj) => batch.push(obj),
                    Err(e) => {
                        // Partial-success policy: one malformed record must
                        // not block the rest of the batch.
                        skipped_total += 1;
                        tracing::warn!(account = %account.id, kind = %kind, error = %e,
                            "skipping malformed vendor record");
                    }
                }
            }

            match self.persist_page(&batch).await {
                Ok(Some(candidate)) => {
                    let count = batch.len() as u64;
                    if let Err(e) = self
                        .cursors
                        .advance(&mut cursor, candidate, count, Utc::now())
                        .await
                    {
                        if matches!(e, Error::CursorRegression { .. }) {
                            tracing::error!(account = %account.id, kind = %kind, error = %e,
                                "cursor regression; aborting cycle without advancing");
                        }
                        self.cursors
                            .mark_failure(&mut cursor, e.to_string(), Utc::now())
                            .await?;
                        return Err(e);
                    }
                    records_total += count;
                }
                Ok(None) => {
                    if !page.records.is_empty() && page.has_more {
                        // Every record in a non-final page failed to
                        // normalize: the watermark cannot move past them, so
                        // continuing would refetch the same page forever.
                        let e = Error::Normalization(format!(
                            "page of {} {kind} records contained no normalizable records",
                            page.records.len()
                        ));
                        self.cursors
                            .mark_failure(&mut cursor, e.to_string(), Utc::now())
                            .await?;
                        return Err(e);
                    }
                }
                Err(e) => {
                    // Batch and cursor-advance are abandoned together;
                    // retried whole next cycle.
                    self.cursors
                        .mark_failure(&mut cursor, e.to_string(), Utc::now())
                        .await?;
                    return Err(e);
                }
            }

            if !page.has_more {
                break;
            }
            pages += 1;
            if pages >= self.config.max_pages_per_cycle {
                self.cursors.mark_succeeded(&mut cursor, Utc::now()).await?;
                tracing::info!(account = %account.id, kind = %kind, pages,
                    "page budget reached; backlog resumes next cycle");
                return Ok(KindReport {
                    kind,
                    records: records_total,
                    skipped: skipped_total,
                    has_more: true,
                    error: None,
                });
            }
        }

        self.cursors.mark_succeeded(&mut cursor, Utc::now()).await?;
        Ok(KindReport {
            kind,
            records: records_total,
            skipped: skipped_total,
            has_more: false,
            error: None,
        })
    }

    /// Fetch one page with timeout, classified retries, and at most one
    /// mid-cycle credential refresh on an auth failure.
    async fn fetch_page(
        &self,
        account: &mut IntegrationAccount,
        vendor: &Arc<dyn VendorCapability>,
        kind: ObjectKind,
        watermark: &Watermark,
    ) -> Result<VendorPage> {
        let retry = self.config.retry_policy();
        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            let result = match tokio::time::timeout(
                self.config.op_timeout,
                vendor.fetch_since(account, kind, watermark, self.config.page_size),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(Error::TransientNetwork(format!(
                    "{kind} fetch timed out after {:?}",
                    self.config.op_timeout
                ))),
            };

            let err = match result {
                Ok(page) => return Ok(page),
                Err(e) => e,
            };

            match err.class() {
                FailureClass::Transient => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        return Err(err);
                    }
                    let wait = retry.delay_with_jitter(attempt);
                    tracing::warn!(account = %account.id, kind = %kind, attempt, error = %err,
                        "transient fetch failure; backing off");
                    tokio::time::sleep(wait).await;
                }
                FailureClass::RateLimited => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        return Err(err);
                    }
                    let wait = err.retry_after().unwrap_or(self.config.rate_limit_backoff);
                    tracing::warn!(account = %account.id, kind = %kind, wait_ms = wait.as_millis() as u64,
                        "rate limited; honoring vendor wait");
                    tokio::time::sleep(wait).await;
                }
                FailureClass::AuthExpired if !refreshed => {
                    refreshed = true;
                    tracing::info!(account = %account.id, kind = %kind,
                        "auth failure mid-cycle; refreshing credentials");
                    self.refresh_credentials(account, vendor).await?;
                }
                _ => return Err(err),
            }
        }
    }

    /// Persist one page's batch with timeout and transient retries. Storage
    /// unavailability abandons batch and advance together for this attempt.
    async fn persist_page(&self, batch: &[RawExternalObject]) -> Result<Option<Watermark>> {
        let retry = self.config.retry_policy();
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(
                self.config.op_timeout,
                self.gateway.upsert_batch(batch),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(Error::TransientNetwork(format!(
                    "persistence timed out after {:?}",
                    self.config.op_timeout
                ))),
            };

            match result {
                Ok(candidate) => return Ok(candidate),
                Err(e) if e.class() == FailureClass::Transient => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        return Err(e);
                    }
                    tracing::warn!(attempt, error = %e, "persistence failed; retrying batch");
                    tokio::time::sleep(retry.delay_with_jitter(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
