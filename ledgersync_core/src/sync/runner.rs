use crate::config::SyncConfig;
use crate::error::FailureClass;
use crate::store::traits::SyncStore;
use crate::sync::models::{
    AccountId, AccountStatus, CredentialSet, IntegrationAccount, IntegrationKind, SyncCursor,
};
use crate::sync::orchestrator::SyncEngine;
use crate::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Drives one long-lived control loop per account and exposes the
/// account-facing commands and queries consumed by an external API layer.
///
/// Loops for different accounts run fully in parallel with no shared
/// mutable state between them; within one account, cycles are strictly
/// sequential. A store-backed lease (keyed by account id, with expiry)
/// keeps at most one live loop per account even across workers.
pub struct SyncRunner {
    engine: Arc<SyncEngine>,
    store: Arc<dyn SyncStore>,
    config: SyncConfig,
    worker_id: String,
    tasks: Mutex<HashMap<AccountId, JoinHandle<()>>>,
}

impl SyncRunner {
    pub fn new(engine: Arc<SyncEngine>, store: Arc<dyn SyncStore>, config: SyncConfig) -> Self {
        Self {
            engine,
            store,
            config,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// The lease holder identity of this process.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    // ── commands ────────────────────────────────────────────────

    /// Connect a new account from already-exchanged credentials and start
    /// its control loop.
    #[tracing::instrument(level = "info", skip(self, credentials))]
    pub async fn register_account(
        &self,
        integration: IntegrationKind,
        external_account_id: &str,
        credentials: CredentialSet,
    ) -> Result<IntegrationAccount> {
        if self
            .store
            .find_account(integration, external_account_id)
            .await?
            .is_some()
        {
            return Err(Error::Conflict(format!(
                "account {integration}/{external_account_id} already connected"
            )));
        }

        let account =
            IntegrationAccount::new(integration, external_account_id, credentials, None)?;
        self.store.insert_account(&account).await?;
        self.start_account(account.id).await?;
        Ok(account)
    }

    /// Spawn the account's loop. A second start for an already-running
    /// account is a no-op.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn start_account(&self, account_id: AccountId) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.get(&account_id) {
            if !handle.is_finished() {
                tracing::debug!(account = %account_id, "loop already running; start is a no-op");
                return Ok(());
            }
        }

        let engine = self.engine.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let worker_id = self.worker_id.clone();
        let handle = tokio::spawn(async move {
            run_account_loop(engine, store, config, worker_id, account_id).await;
        });
        tasks.insert(account_id, handle);
        Ok(())
    }

    /// Start loops for every runnable account in the store. Returns how
    /// many were started.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn start_all(&self) -> Result<usize> {
        let accounts = self.store.list_accounts().await?;
        let mut started = 0usize;
        for account in accounts {
            if account.status.is_runnable() {
                self.start_account(account.id).await?;
                started += 1;
            }
        }
        Ok(started)
    }

    /// Soft-disable: the loop observes the status at its next IDLE
    /// checkpoint and stops; an in-flight page finishes first.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disable_account(&self, account_id: AccountId) -> Result<()> {
        self.store
            .set_account_status(account_id, AccountStatus::Disabled, Utc::now())
            .await
    }

    /// Abort every loop task (process shutdown). Durable state is safe:
    /// restart resumes from the stored cursors.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (account_id, handle) in tasks.drain() {
            handle.abort();
            tracing::debug!(account = %account_id, "loop aborted for shutdown");
        }
    }

    // ── queries ─────────────────────────────────────────────────

    pub async fn list_accounts(&self) -> Result<Vec<IntegrationAccount>> {
        self.store.list_accounts().await
    }

    pub async fn account_detail(&self, account_id: AccountId) -> Result<IntegrationAccount> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("account '{account_id}' not found")))
    }

    /// Per-kind cursor watermarks and last-advanced timestamps.
    pub async fn sync_status(&self, account_id: AccountId) -> Result<Vec<SyncCursor>> {
        self.store.list_cursors(account_id).await
    }
}

/// The re-entrant loop: IDLE → cycle → RESCHEDULE. Only the cursor/data
/// store is durable; the loop itself holds no state a restart can lose.
async fn run_account_loop(
    engine: Arc<SyncEngine>,
    store: Arc<dyn SyncStore>,
    config: SyncConfig,
    worker_id: String,
    account_id: AccountId,
) {
    tracing::info!(account = %account_id, worker = %worker_id, "account loop started");
    loop {
        // IDLE checkpoint: observe disable/error before doing any work.
        let account = match store.get_account(account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                tracing::warn!(account = %account_id, "account vanished; stopping loop");
                return;
            }
            Err(e) => {
                tracing::warn!(account = %account_id, error = %e,
                    "store unavailable at IDLE; retrying next interval");
                tokio::time::sleep(config.sync_interval).await;
                continue;
            }
        };
        if !account.status.is_runnable() {
            tracing::info!(account = %account_id, status = %account.status, "loop stopping");
            return;
        }

        // At most one live loop per account across workers.
        match store
            .try_acquire_lease(account_id, &worker_id, config.lease_ttl, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(account = %account_id, "lease held elsewhere; standing by");
                tokio::time::sleep(config.sync_interval).await;
                continue;
            }
            Err(e) => {
                tracing::warn!(account = %account_id, error = %e, "lease acquisition failed");
                tokio::time::sleep(config.sync_interval).await;
                continue;
            }
        }

        let outcome = engine.run_cycle(account_id).await;
        if let Err(e) = store.release_lease(account_id, &worker_id).await {
            tracing::warn!(account = %account_id, error = %e, "lease release failed");
        }

        match outcome {
            Ok(report) if report.has_more() => {
                // Backlog remains: re-enter immediately.
                tracing::info!(account = %account_id, "backlog remains; fast resync");
                continue;
            }
            Ok(report) => {
                let records: u64 = report.kinds.iter().map(|k| k.records).sum();
                tracing::info!(account = %account_id, records, "cycle complete");
            }
            Err(e) if e.class() == FailureClass::Terminal => {
                tracing::error!(account = %account_id, error = %e,
                    "terminal failure; loop halted until operator action");
                return;
            }
            Err(e) => {
                tracing::warn!(account = %account_id, error = %e,
                    "cycle failed; retrying next interval");
            }
        }

        // RESCHEDULE: a plain sleep, not recursion — no history to grow.
        tokio::time::sleep(config.sync_interval).await;
    }
}
