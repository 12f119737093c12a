use crate::store::traits::SyncStore;
use crate::sync::models::{RawExternalObject, Watermark};
use crate::Result;
use std::sync::Arc;

/// Idempotent write path for canonical envelopes.
///
/// Delegates the conditional last-write-wins upsert to the store and turns
/// the batch into a watermark candidate for cursor advancement.
pub struct PersistenceGateway {
    store: Arc<dyn SyncStore>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Upsert the batch as a single unit and return the maximum watermark
    /// observed among its records. `None` for an empty batch — the caller
    /// keeps its prior watermark.
    #[tracing::instrument(level = "debug", skip(self, batch), fields(batch_len = batch.len()))]
    pub async fn upsert_batch(&self, batch: &[RawExternalObject]) -> Result<Option<Watermark>> {
        if batch.is_empty() {
            return Ok(None);
        }
        let written = self.store.upsert_objects(batch).await?;
        tracing::debug!(written, total = batch.len(), "raw object batch persisted");
        Ok(batch.iter().map(RawExternalObject::watermark).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemorySyncStore;
    use crate::sync::models::{AccountId, ObjectKind};
    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn object(account_id: AccountId, id: &str, updated: i64) -> RawExternalObject {
        RawExternalObject::new(
            account_id,
            ObjectKind::Customer,
            id,
            serde_json::json!({ "Id": id }),
            ts(updated),
            ts(updated),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_batch_yields_no_candidate() {
        let gateway = PersistenceGateway::new(Arc::new(MemorySyncStore::new()));
        assert_eq!(gateway.upsert_batch(&[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn candidate_is_the_max_compound_watermark() {
        let store = Arc::new(MemorySyncStore::new());
        let gateway = PersistenceGateway::new(store.clone());
        let account_id = AccountId(Uuid::new_v4());

        let batch = vec![
            object(account_id, "b", 100),
            object(account_id, "c", 300),
            object(account_id, "a", 300),
            object(account_id, "d", 200),
        ];
        let candidate = gateway.upsert_batch(&batch).await.unwrap().unwrap();
        // Equal timestamps break ties on vendor id.
        assert_eq!(candidate, Watermark::new(ts(300), "c"));
        assert_eq!(
            store.count_objects(account_id, ObjectKind::Customer).await.unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn replaying_a_batch_leaves_the_store_observably_unchanged() {
        let store = Arc::new(MemorySyncStore::new());
        let gateway = PersistenceGateway::new(store.clone());
        let account_id = AccountId(Uuid::new_v4());

        let batch = vec![object(account_id, "x", 10), object(account_id, "y", 20)];
        gateway.upsert_batch(&batch).await.unwrap();
        let before = store.get_object(account_id, ObjectKind::Customer, "y").await.unwrap();

        // Same batch again, plus an older duplicate of "y".
        let mut replay = batch.clone();
        replay.push(object(account_id, "y", 15));
        let candidate = gateway.upsert_batch(&replay).await.unwrap().unwrap();
        assert_eq!(candidate, Watermark::new(ts(20), "y"));

        let after = store.get_object(account_id, ObjectKind::Customer, "y").await.unwrap();
        assert_eq!(before, after);
        assert_eq!(
            store.count_objects(account_id, ObjectKind::Customer).await.unwrap(),
            2
        );
    }
}
