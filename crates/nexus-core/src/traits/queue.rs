//! Work queue trait: carries claimed batches from the scheduler to the sender pool.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::BatchDescriptor;

/// Delivers each enqueued batch to one worker, eventually. At-least-once is
/// fine: senders skip items that are no longer `dispatched` for the batch.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, batch: BatchDescriptor) -> Result<()>;
}
