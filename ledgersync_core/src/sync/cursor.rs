use crate::store::traits::SyncStore;
use crate::sync::models::{AccountId, ObjectKind, SyncCursor, Watermark};
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Owns per-(account, kind) watermark state and enforces monotonicity.
///
/// `advance` is only ever called after the corresponding persistence batch
/// is confirmed durable. If the process dies between persistence and
/// advancement, the next run re-fetches the same window and re-upserts,
/// which is safe because upserts are idempotent — but the cursor never
/// moves past unpersisted data.
pub struct CursorTracker {
    store: Arc<dyn SyncStore>,
}

impl CursorTracker {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Read the cursor, creating it lazily at the vendor minimum.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn read(&self, account_id: AccountId, kind: ObjectKind) -> Result<SyncCursor> {
        Ok(self
            .store
            .get_cursor(account_id, kind)
            .await?
            .unwrap_or_else(|| SyncCursor::initial(account_id, kind)))
    }

    /// Advance past a committed batch. A candidate behind the stored
    /// watermark fails with `CursorRegression` before anything is written.
    #[tracing::instrument(level = "debug", skip(self, cursor))]
    pub async fn advance(
        &self,
        cursor: &mut SyncCursor,
        candidate: Watermark,
        records: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        cursor.advance(candidate, records, now)?;
        self.store.upsert_cursor(cursor).await
    }

    pub async fn mark_attempt(&self, cursor: &mut SyncCursor, now: DateTime<Utc>) -> Result<()> {
        cursor.mark_attempt(now);
        self.store.upsert_cursor(cursor).await
    }

    pub async fn mark_failure(
        &self,
        cursor: &mut SyncCursor,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        cursor.mark_failure(message, now);
        self.store.upsert_cursor(cursor).await
    }

    pub async fn mark_succeeded(&self, cursor: &mut SyncCursor, now: DateTime<Utc>) -> Result<()> {
        cursor.mark_succeeded(now);
        self.store.upsert_cursor(cursor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemorySyncStore;
    use crate::Error;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn read_defaults_to_the_vendor_minimum() {
        let tracker = CursorTracker::new(Arc::new(MemorySyncStore::new()));
        let cursor = tracker
            .read(AccountId(Uuid::new_v4()), ObjectKind::Customer)
            .await
            .unwrap();
        assert_eq!(cursor.watermark, Watermark::origin());
        assert_eq!(cursor.records_synced, 0);
    }

    #[tokio::test]
    async fn regression_leaves_the_stored_watermark_unchanged() {
        let store = Arc::new(MemorySyncStore::new());
        let tracker = CursorTracker::new(store.clone());
        let account_id = AccountId(Uuid::new_v4());

        let mut cursor = tracker.read(account_id, ObjectKind::Invoice).await.unwrap();
        tracker
            .advance(&mut cursor, Watermark::new(ts(500), "3"), 2, ts(501))
            .await
            .unwrap();

        let err = tracker
            .advance(&mut cursor, Watermark::new(ts(400), "9"), 1, ts(502))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CursorRegression { .. }));

        let stored = store
            .get_cursor(account_id, ObjectKind::Invoice)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.watermark, Watermark::new(ts(500), "3"));
        assert_eq!(stored.records_synced, 2);
    }

    #[tokio::test]
    async fn watermarks_observed_over_time_are_non_decreasing() {
        let store = Arc::new(MemorySyncStore::new());
        let tracker = CursorTracker::new(store.clone());
        let account_id = AccountId(Uuid::new_v4());

        let mut cursor = tracker.read(account_id, ObjectKind::Customer).await.unwrap();
        let mut last = cursor.watermark.clone();
        for (secs, id) in [(100, "a"), (100, "b"), (250, "a"), (250, "a")] {
            tracker
                .advance(&mut cursor, Watermark::new(ts(secs), id), 1, ts(secs))
                .await
                .unwrap();
            let stored = store
                .get_cursor(account_id, ObjectKind::Customer)
                .await
                .unwrap()
                .unwrap();
            assert!(stored.watermark >= last);
            last = stored.watermark;
        }
    }
}
