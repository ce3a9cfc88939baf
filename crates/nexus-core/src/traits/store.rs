//! Record store trait: durable table of work items.
//!
//! Every method that touches `status` or `batch_id` must be a single-statement
//! conditional update. Implementations never read a row and write it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{ItemStatus, NewWorkItem, TerminalUpdate, WorkItem};

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a `pending` item.
    async fn insert(&self, item: &NewWorkItem, now: DateTime<Utc>) -> Result<WorkItem>;

    async fn get(&self, id: &str) -> Result<Option<WorkItem>>;

    /// `pending`/`rate_limited` items whose hold expired at or before `now` go back
    /// to `pending` with hold and claim cleared. Returns rows affected.
    async fn release_expired_holds(&self, now: DateTime<Utc>) -> Result<usize>;

    /// `dispatched`/`sending` items claimed before `cutoff` go back to `pending`.
    async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Owners with at least one eligible item, oldest due work first.
    async fn eligible_owners(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>>;

    /// Eligible item ids for one owner, oldest `scheduled_at` first.
    async fn select_eligible(
        &self,
        owner_key: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// `pending` → `dispatched` for the given ids, predicated on the row still being
    /// pending. Returns the ids this call actually claimed.
    async fn conditional_claim(
        &self,
        ids: &[String],
        batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Return still-unprocessed (`dispatched`/`sending`) items of `batch_id` to `pending`.
    async fn conditional_release(&self, ids: &[String], batch_id: &str) -> Result<usize>;

    /// `dispatched` → `sending` if the item still belongs to `batch_id`.
    async fn mark_sending(&self, id: &str, batch_id: &str) -> Result<bool>;

    /// `sending` → terminal / held, if the item still belongs to `batch_id`.
    async fn update_terminal(
        &self,
        id: &str,
        batch_id: &str,
        update: TerminalUpdate,
    ) -> Result<bool>;

    async fn status_counts(&self) -> Result<Vec<(ItemStatus, u64)>>;
}
