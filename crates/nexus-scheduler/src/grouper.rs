//! Batch grouper: selects due work per owner and claims it into batches.
//!
//! One batch per owner per tick, at most `batch_size` items, oldest first.
//! Claiming goes through the store's conditional update, so a row another
//! scheduler got to first simply drops out of the batch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nexus_core::error::Result;
use nexus_core::traits::RecordStore;
use nexus_core::types::BatchDescriptor;

pub struct BatchGrouper {
    store: Arc<dyn RecordStore>,
    batch_size: usize,
    dispatch_limit: usize,
}

impl BatchGrouper {
    pub fn new(store: Arc<dyn RecordStore>, batch_size: usize, dispatch_limit: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            dispatch_limit: dispatch_limit.max(1),
        }
    }

    /// Select and claim due work. Batches claimed before a store failure are
    /// still returned so they reach the queue; the failure ends this round.
    pub async fn claim_batches(&self, now: DateTime<Utc>) -> Result<Vec<BatchDescriptor>> {
        let owners = self.store.eligible_owners(now, self.dispatch_limit).await?;
        let mut batches = Vec::new();
        let mut remaining = self.dispatch_limit;

        for owner_key in owners {
            if remaining == 0 {
                break;
            }
            match self.claim_for_owner(&owner_key, now, self.batch_size.min(remaining)).await {
                Ok(Some(batch)) => {
                    remaining -= batch.item_ids.len();
                    batches.push(batch);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("⚠️ Claim for owner '{owner_key}' failed, ending round: {e}");
                    break;
                }
            }
        }
        Ok(batches)
    }

    async fn claim_for_owner(
        &self,
        owner_key: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Option<BatchDescriptor>> {
        let selected = self.store.select_eligible(owner_key, now, limit).await?;
        if selected.is_empty() {
            return Ok(None);
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let claimed = self
            .store
            .conditional_claim(&selected, &batch_id, now)
            .await?;
        if claimed.len() < selected.len() {
            tracing::debug!(
                "Lost claim race for {} of {} item(s) of owner '{}'",
                selected.len() - claimed.len(),
                selected.len(),
                owner_key
            );
        }
        if claimed.is_empty() {
            return Ok(None);
        }

        Ok(Some(BatchDescriptor {
            batch_id,
            owner_key: owner_key.to_string(),
            item_ids: claimed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MailDb;
    use crate::testing::{FailingStore, StoreOp};
    use chrono::Duration;
    use nexus_core::types::{ItemStatus, NewWorkItem};
    use std::path::PathBuf;

    fn temp_store() -> Arc<MailDb> {
        Arc::new(MailDb::open(&PathBuf::from(":memory:")).unwrap())
    }

    async fn seed_many(store: &MailDb, owner: &str, n: usize, at: DateTime<Utc>) -> Vec<String> {
        let mut ids = Vec::new();
        for i in 0..n {
            let item = NewWorkItem::new(owner, &format!("user{i}@example.com"), "Hi", "<p>x</p>")
                .scheduled_at(at + Duration::milliseconds(i as i64));
            ids.push(store.insert(&item, at).await.unwrap().id);
        }
        ids
    }

    #[tokio::test]
    async fn test_one_bounded_batch_per_owner() {
        let store = temp_store();
        let now = Utc::now();
        let acme = seed_many(&store, "acme", 5, now - Duration::seconds(10)).await;
        let globex = seed_many(&store, "globex", 1, now - Duration::seconds(5)).await;

        let grouper = BatchGrouper::new(store.clone(), 3, 1000);
        let batches = grouper.claim_batches(now).await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].owner_key, "acme");
        assert_eq!(batches[0].item_ids, acme[..3].to_vec());
        assert_eq!(batches[1].owner_key, "globex");
        assert_eq!(batches[1].item_ids, globex);
        assert_ne!(batches[0].batch_id, batches[1].batch_id);

        for id in &acme[..3] {
            let item = store.get(id).await.unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Dispatched);
            assert_eq!(item.batch_id.as_deref(), Some(batches[0].batch_id.as_str()));
        }
        let leftover = store.get(&acme[3]).await.unwrap().unwrap();
        assert_eq!(leftover.status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_dispatch_limit_caps_round() {
        let store = temp_store();
        let now = Utc::now();
        seed_many(&store, "acme", 4, now - Duration::seconds(10)).await;
        seed_many(&store, "globex", 4, now - Duration::seconds(5)).await;

        let grouper = BatchGrouper::new(store.clone(), 3, 4);
        let batches = grouper.claim_batches(now).await.unwrap();
        let total: usize = batches.iter().map(|b| b.item_ids.len()).sum();
        assert_eq!(total, 4);
        assert_eq!(batches[1].item_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_due() {
        let store = temp_store();
        let now = Utc::now();
        seed_many(&store, "acme", 2, now + Duration::seconds(60)).await;
        let grouper = BatchGrouper::new(store, 50, 1000);
        assert!(grouper.claim_batches(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_round_claims_nothing_twice() {
        let store = temp_store();
        let now = Utc::now();
        seed_many(&store, "acme", 2, now - Duration::seconds(1)).await;
        let grouper = BatchGrouper::new(store, 50, 1000);
        assert_eq!(grouper.claim_batches(now).await.unwrap().len(), 1);
        assert!(grouper.claim_batches(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_failure_keeps_earlier_batches() {
        let store = temp_store();
        let now = Utc::now();
        let acme = seed_many(&store, "acme", 2, now - Duration::seconds(10)).await;
        let globex = seed_many(&store, "globex", 2, now - Duration::seconds(5)).await;
        let flaky = Arc::new(FailingStore::new(store.clone()));
        flaky.fail_after(StoreOp::Claim, 1, 1);

        let batches = BatchGrouper::new(flaky, 50, 1000).claim_batches(now).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].item_ids, acme);
        for id in &globex {
            assert_eq!(store.get(id).await.unwrap().unwrap().status, ItemStatus::Pending);
        }
    }
}
