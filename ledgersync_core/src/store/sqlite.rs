//! SQLite-backed SyncStore implementation.
//!
//! Persists accounts, sync cursors, raw vendor objects, and execution
//! leases across restarts. Single WAL-mode SQLite file.
//!
//! Usage:
//! ```ignore
//! let store = SqliteSyncStore::new("/path/to/ledgersync.db").await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error as CoreError, Result as CoreResult};
use crate::store::traits::SyncStore;
use crate::sync::models::{
    AccountId, AccountStatus, CredentialSet, CursorState, IntegrationAccount, IntegrationKind,
    ObjectKind, RawExternalObject, SyncCursor, Watermark,
};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// A durable, file-backed SyncStore backed by a single SQLite file (WAL
/// mode). Suitable for single-node deployments and local development.
#[derive(Clone)]
pub struct SqliteSyncStore {
    pool: SqlitePool,
}

impl SqliteSyncStore {
    /// Create (or open) a SQLite SyncStore at the given file path.
    ///
    /// Creates the file and parent directories if they don't exist.
    /// Runs the internal schema migration on startup.
    pub async fn new(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::backend("sqlite_sync_store", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| CoreError::backend("sqlite_sync_store", e))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| CoreError::backend("sqlite_sync_store", e))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| CoreError::backend("sqlite_sync_store_migration", e))?;

        Ok(Self { pool })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    account_id TEXT PRIMARY KEY,
    integration TEXT NOT NULL,
    external_account_id TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (integration, external_account_id)
);

CREATE TABLE IF NOT EXISTS sync_cursors (
    account_id TEXT NOT NULL,
    object_kind TEXT NOT NULL,
    watermark_updated_at TEXT NOT NULL,
    watermark_object_id TEXT NOT NULL,
    state TEXT NOT NULL,
    last_error TEXT,
    records_synced INTEGER NOT NULL,
    last_attempt_at TEXT,
    last_advanced_at TEXT,
    PRIMARY KEY (account_id, object_kind)
);

CREATE TABLE IF NOT EXISTS raw_objects (
    account_id TEXT NOT NULL,
    object_kind TEXT NOT NULL,
    vendor_object_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    vendor_updated_at TEXT NOT NULL,
    ingested_at TEXT NOT NULL,
    PRIMARY KEY (account_id, object_kind, vendor_object_id)
);

CREATE INDEX IF NOT EXISTS raw_objects_updated_idx
  ON raw_objects(account_id, object_kind, vendor_updated_at);

CREATE TABLE IF NOT EXISTS sync_leases (
    account_id TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::backend("sqlite_sync_store", e)
}

// Fixed-width RFC 3339 (microseconds, Z) so lexicographic comparison in SQL
// matches chronological order.
fn ts_str(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now())
}

fn parse_account_id(s: &str) -> AccountId {
    AccountId(Uuid::parse_str(s).unwrap_or(Uuid::nil()))
}

fn row_to_account(r: &sqlx::sqlite::SqliteRow) -> IntegrationAccount {
    let account_id_str: String = r.get("account_id");
    let integration_str: String = r.get("integration");
    let external_account_id: String = r.get("external_account_id");
    let access_token: String = r.get("access_token");
    let refresh_token: String = r.get("refresh_token");
    let expires_at_str: String = r.get("expires_at");
    let status_str: String = r.get("status");
    let created_at_str: String = r.get("created_at");
    let updated_at_str: String = r.get("updated_at");

    IntegrationAccount {
        id: parse_account_id(&account_id_str),
        integration: IntegrationKind::parse_str(&integration_str)
            .unwrap_or(IntegrationKind::Quickbooks),
        external_account_id,
        credentials: CredentialSet {
            access_token,
            refresh_token,
            expires_at: parse_dt(&expires_at_str),
        },
        status: AccountStatus::parse_str(&status_str).unwrap_or(AccountStatus::Error),
        created_at: parse_dt(&created_at_str),
        updated_at: parse_dt(&updated_at_str),
    }
}

fn row_to_cursor(r: &sqlx::sqlite::SqliteRow) -> SyncCursor {
    let account_id_str: String = r.get("account_id");
    let kind_str: String = r.get("object_kind");
    let wm_updated_at_str: String = r.get("watermark_updated_at");
    let wm_object_id: String = r.get("watermark_object_id");
    let state_str: String = r.get("state");
    let last_error: Option<String> = r.get("last_error");
    let records_synced: i64 = r.get("records_synced");
    let last_attempt_at_str: Option<String> = r.get("last_attempt_at");
    let last_advanced_at_str: Option<String> = r.get("last_advanced_at");

    SyncCursor {
        account_id: parse_account_id(&account_id_str),
        kind: ObjectKind::parse_str(&kind_str).unwrap_or(ObjectKind::Customer),
        watermark: Watermark::new(parse_dt(&wm_updated_at_str), wm_object_id),
        state: CursorState::parse_str(&state_str).unwrap_or(CursorState::Idle),
        last_error,
        records_synced: records_synced.max(0) as u64,
        last_attempt_at: last_attempt_at_str.as_deref().map(parse_dt),
        last_advanced_at: last_advanced_at_str.as_deref().map(parse_dt),
    }
}

fn row_to_object(r: &sqlx::sqlite::SqliteRow) -> RawExternalObject {
    let account_id_str: String = r.get("account_id");
    let kind_str: String = r.get("object_kind");
    let vendor_object_id: String = r.get("vendor_object_id");
    let payload_str: String = r.get("payload");
    let vendor_updated_at_str: String = r.get("vendor_updated_at");
    let ingested_at_str: String = r.get("ingested_at");

    RawExternalObject {
        account_id: parse_account_id(&account_id_str),
        kind: ObjectKind::parse_str(&kind_str).unwrap_or(ObjectKind::Customer),
        vendor_object_id,
        payload: serde_json::from_str(&payload_str).unwrap_or_default(),
        vendor_updated_at: parse_dt(&vendor_updated_at_str),
        ingested_at: parse_dt(&ingested_at_str),
    }
}

#[async_trait]
impl SyncStore for SqliteSyncStore {
    async fn insert_account(&self, account: &IntegrationAccount) -> CoreResult<()> {
        let res = sqlx::query(
            "INSERT INTO accounts
               (account_id, integration, external_account_id, access_token, refresh_token,
                expires_at, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(account.id.to_string())
        .bind(account.integration.as_str())
        .bind(&account.external_account_id)
        .bind(&account.credentials.access_token)
        .bind(&account.credentials.refresh_token)
        .bind(ts_str(&account.credentials.expires_at))
        .bind(account.status.as_str())
        .bind(ts_str(&account.created_at))
        .bind(ts_str(&account.updated_at))
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) => {
                let unique = e
                    .as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false);
                if unique {
                    Err(CoreError::Conflict(format!(
                        "account {}/{} already connected",
                        account.integration, account.external_account_id
                    )))
                } else {
                    Err(db_err(e))
                }
            }
        }
    }

    async fn get_account(&self, id: AccountId) -> CoreResult<Option<IntegrationAccount>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE account_id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| row_to_account(&r)))
    }

    async fn find_account(
        &self,
        integration: IntegrationKind,
        external_account_id: &str,
    ) -> CoreResult<Option<IntegrationAccount>> {
        let row = sqlx::query(
            "SELECT * FROM accounts WHERE integration = ?1 AND external_account_id = ?2",
        )
        .bind(integration.as_str())
        .bind(external_account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| row_to_account(&r)))
    }

    async fn list_accounts(&self) -> CoreResult<Vec<IntegrationAccount>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_account).collect())
    }

    async fn update_account_credentials(
        &self,
        id: AccountId,
        credentials: &CredentialSet,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut account = self
            .get_account(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("account '{id}' not found")))?;
        account.update_credentials(credentials.clone(), now);

        sqlx::query(
            "UPDATE accounts
             SET access_token = ?1, refresh_token = ?2, expires_at = ?3,
                 status = ?4, updated_at = ?5
             WHERE account_id = ?6",
        )
        .bind(&account.credentials.access_token)
        .bind(&account.credentials.refresh_token)
        .bind(ts_str(&account.credentials.expires_at))
        .bind(account.status.as_str())
        .bind(ts_str(&account.updated_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let res = sqlx::query(
            "UPDATE accounts SET status = ?1, updated_at = ?2 WHERE account_id = ?3",
        )
        .bind(status.as_str())
        .bind(ts_str(&now))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("account '{id}' not found")));
        }
        Ok(())
    }

    async fn get_cursor(
        &self,
        account_id: AccountId,
        kind: ObjectKind,
    ) -> CoreResult<Option<SyncCursor>> {
        let row = sqlx::query(
            "SELECT * FROM sync_cursors WHERE account_id = ?1 AND object_kind = ?2",
        )
        .bind(account_id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| row_to_cursor(&r)))
    }

    async fn upsert_cursor(&self, cursor: &SyncCursor) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO sync_cursors
               (account_id, object_kind, watermark_updated_at, watermark_object_id,
                state, last_error, records_synced, last_attempt_at, last_advanced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(account_id, object_kind) DO UPDATE SET
               watermark_updated_at = excluded.watermark_updated_at,
               watermark_object_id = excluded.watermark_object_id,
               state = excluded.state,
               last_error = excluded.last_error,
               records_synced = excluded.records_synced,
               last_attempt_at = excluded.last_attempt_at,
               last_advanced_at = excluded.last_advanced_at",
        )
        .bind(cursor.account_id.to_string())
        .bind(cursor.kind.as_str())
        .bind(ts_str(&cursor.watermark.updated_at))
        .bind(&cursor.watermark.object_id)
        .bind(cursor.state.as_str())
        .bind(&cursor.last_error)
        .bind(cursor.records_synced as i64)
        .bind(cursor.last_attempt_at.as_ref().map(ts_str))
        .bind(cursor.last_advanced_at.as_ref().map(ts_str))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_cursors(&self, account_id: AccountId) -> CoreResult<Vec<SyncCursor>> {
        let rows =
            sqlx::query("SELECT * FROM sync_cursors WHERE account_id = ?1 ORDER BY object_kind")
                .bind(account_id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(rows.iter().map(row_to_cursor).collect())
    }

    async fn upsert_objects(&self, batch: &[RawExternalObject]) -> CoreResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        // One transaction per batch: all eligible rows land or none do.
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut written = 0u64;
        for record in batch {
            let payload = serde_json::to_string(&record.payload)
                .map_err(|e| CoreError::backend("serialize raw object payload", e))?;
            // Newer-wins guard is part of the statement, atomic with the write.
            let res = sqlx::query(
                "INSERT INTO raw_objects
                   (account_id, object_kind, vendor_object_id, payload,
                    vendor_updated_at, ingested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(account_id, object_kind, vendor_object_id) DO UPDATE SET
                   payload = excluded.payload,
                   vendor_updated_at = excluded.vendor_updated_at,
                   ingested_at = excluded.ingested_at
                 WHERE excluded.vendor_updated_at > raw_objects.vendor_updated_at",
            )
            .bind(record.account_id.to_string())
            .bind(record.kind.as_str())
            .bind(&record.vendor_object_id)
            .bind(payload)
            .bind(ts_str(&record.vendor_updated_at))
            .bind(ts_str(&record.ingested_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            written += res.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(written)
    }

    async fn get_object(
        &self,
        account_id: AccountId,
        kind: ObjectKind,
        vendor_object_id: &str,
    ) -> CoreResult<Option<RawExternalObject>> {
        let row = sqlx::query(
            "SELECT * FROM raw_objects
             WHERE account_id = ?1 AND object_kind = ?2 AND vendor_object_id = ?3",
        )
        .bind(account_id.to_string())
        .bind(kind.as_str())
        .bind(vendor_object_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| row_to_object(&r)))
    }

    async fn count_objects(&self, account_id: AccountId, kind: ObjectKind) -> CoreResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM raw_objects WHERE account_id = ?1 AND object_kind = ?2",
        )
        .bind(account_id.to_string())
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as u64)
    }

    async fn try_acquire_lease(
        &self,
        account_id: AccountId,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        // Single conditional upsert: succeeds when the lease is free, ours,
        // or expired. Atomic, so two workers cannot both win.
        let res = sqlx::query(
            "INSERT INTO sync_leases (account_id, holder, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id) DO UPDATE SET
               holder = excluded.holder,
               expires_at = excluded.expires_at
             WHERE sync_leases.holder = excluded.holder
                OR sync_leases.expires_at <= ?4",
        )
        .bind(account_id.to_string())
        .bind(holder)
        .bind(ts_str(&expires_at))
        .bind(ts_str(&now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn release_lease(&self, account_id: AccountId, holder: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM sync_leases WHERE account_id = ?1 AND holder = ?2")
            .bind(account_id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn open_store(dir: &tempfile::TempDir) -> SqliteSyncStore {
        SqliteSyncStore::new(dir.path().join("ledgersync.db"))
            .await
            .expect("open sqlite store")
    }

    fn account() -> IntegrationAccount {
        IntegrationAccount::new(
            IntegrationKind::Quickbooks,
            "realm-9",
            CredentialSet::new("at-1", "rt-1", ts(50_000)).unwrap(),
            Some(ts(100)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn account_round_trip_and_uniqueness() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let acct = account();
        store.insert_account(&acct).await.unwrap();

        let loaded = store.get_account(acct.id).await.unwrap().unwrap();
        assert_eq!(loaded, acct);

        let found = store
            .find_account(IntegrationKind::Quickbooks, "realm-9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, acct.id);

        // Same (integration, external id) under a fresh uuid still conflicts.
        let dup = IntegrationAccount::new(
            IntegrationKind::Quickbooks,
            "realm-9",
            CredentialSet::new("at-2", "rt-2", ts(60_000)).unwrap(),
            Some(ts(200)),
        )
        .unwrap();
        let err = store.insert_account(&dup).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn credential_update_is_atomic_and_recomputes_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let acct = account();
        store.insert_account(&acct).await.unwrap();

        let fresh = CredentialSet::new("at-new", "rt-new", ts(90_000)).unwrap();
        store
            .update_account_credentials(acct.id, &fresh, ts(1_000))
            .await
            .unwrap();

        let loaded = store.get_account(acct.id).await.unwrap().unwrap();
        assert_eq!(loaded.credentials, fresh);
        assert_eq!(loaded.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn cursor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let acct = account();
        store.insert_account(&acct).await.unwrap();

        assert!(store
            .get_cursor(acct.id, ObjectKind::Customer)
            .await
            .unwrap()
            .is_none());

        let mut cursor = SyncCursor::initial(acct.id, ObjectKind::Customer);
        cursor.mark_attempt(ts(500));
        cursor
            .advance(Watermark::new(ts(400), "17"), 4, ts(500))
            .unwrap();
        cursor.mark_succeeded(ts(501));
        store.upsert_cursor(&cursor).await.unwrap();

        let loaded = store
            .get_cursor(acct.id, ObjectKind::Customer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, cursor);

        let all = store.list_cursors(acct.id).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn conditional_upsert_keeps_newer_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let acct = account();
        store.insert_account(&acct).await.unwrap();

        let make = |id: &str, updated: i64, name: &str| {
            RawExternalObject::new(
                acct.id,
                ObjectKind::Invoice,
                id,
                serde_json::json!({ "DocNumber": name }),
                ts(updated),
                ts(updated + 1),
            )
            .unwrap()
        };

        let batch = vec![make("a", 100, "v1"), make("b", 110, "v1")];
        assert_eq!(store.upsert_objects(&batch).await.unwrap(), 2);

        // Identical replay is a no-op.
        assert_eq!(store.upsert_objects(&batch).await.unwrap(), 0);

        // Newer wins; stale loses.
        assert_eq!(
            store.upsert_objects(&[make("a", 200, "v2")]).await.unwrap(),
            1
        );
        assert_eq!(
            store.upsert_objects(&[make("a", 150, "old")]).await.unwrap(),
            0
        );

        let stored = store
            .get_object(acct.id, ObjectKind::Invoice, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload["DocNumber"], "v2");
        assert_eq!(stored.vendor_updated_at, ts(200));
        assert_eq!(store.count_objects(acct.id, ObjectKind::Invoice).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lease_contention_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let id = AccountId(Uuid::new_v4());
        let ttl = Duration::from_secs(300);

        assert!(store.try_acquire_lease(id, "w1", ttl, ts(0)).await.unwrap());
        assert!(!store.try_acquire_lease(id, "w2", ttl, ts(100)).await.unwrap());
        assert!(store.try_acquire_lease(id, "w1", ttl, ts(100)).await.unwrap());
        assert!(store.try_acquire_lease(id, "w2", ttl, ts(400)).await.unwrap());

        store.release_lease(id, "w2").await.unwrap();
        assert!(store.try_acquire_lease(id, "w3", ttl, ts(401)).await.unwrap());
    }
}
