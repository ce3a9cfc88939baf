//! In-process work queue and the bounded worker pool that drains it.
//!
//! The queue is an unbounded tokio channel: the scheduler already bounds how
//! much it claims per tick, so backpressure lives in the store, not here.
//! The pool caps in-flight batches with a semaphore; sends inside a batch stay
//! sequential, concurrency only happens across batches.

use std::sync::Arc;

use async_trait::async_trait;
use nexus_core::error::{NexusError, Result};
use nexus_core::traits::WorkQueue;
use nexus_core::types::BatchDescriptor;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::sender::BatchSender;

/// Sending half of the in-process queue.
#[derive(Clone)]
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<BatchDescriptor>,
}

impl MemoryQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BatchDescriptor>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, batch: BatchDescriptor) -> Result<()> {
        tracing::debug!(
            "📥 Enqueue batch {} ({} item(s), owner '{}')",
            batch.batch_id,
            batch.item_ids.len(),
            batch.owner_key
        );
        self.tx
            .send(batch)
            .map_err(|e| NexusError::Queue(format!("queue closed, batch {} dropped", e.0.batch_id)))
    }
}

/// Runs one `BatchSender::process` per dequeued batch, at most `pool_size` at a time.
pub struct WorkerPool {
    sender: Arc<BatchSender>,
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl WorkerPool {
    pub fn new(sender: Arc<BatchSender>, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            sender,
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }
    }

    /// Batches currently being processed.
    pub fn active(&self) -> usize {
        self.pool_size - self.permits.available_permits()
    }

    /// Drain the queue until every sender half is dropped, then wait for
    /// in-flight batches to finish.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<BatchDescriptor>) {
        tracing::info!("👷 Worker pool started ({} concurrent batch(es))", self.pool_size);
        let mut workers = JoinSet::new();

        while let Some(batch) = rx.recv().await {
            // Waiting here leaves the rest of the queue untouched until a slot frees up.
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let sender = self.sender.clone();
            workers.spawn(async move {
                let report = sender.process(&batch).await;
                drop(permit);
                report
            });

            // Reap finished workers so the set does not grow without bound.
            while let Some(done) = workers.try_join_next() {
                if let Err(e) = done {
                    tracing::error!("Batch worker panicked: {e}");
                }
            }
        }

        while let Some(done) = workers.join_next().await {
            if let Err(e) = done {
                tracing::error!("Batch worker panicked: {e}");
            }
        }
        tracing::info!("👷 Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MailDb;
    use crate::testing::{ScriptedTransport, StaticResolver};
    use chrono::Utc;
    use nexus_core::config::NexusConfig;
    use nexus_core::traits::RecordStore;
    use nexus_core::types::{ItemStatus, NewWorkItem};
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let (queue, rx) = MemoryQueue::new();
        drop(rx);
        let batch = BatchDescriptor {
            batch_id: "b1".into(),
            owner_key: "acme".into(),
            item_ids: vec!["x".into()],
        };
        assert!(matches!(queue.enqueue(batch).await, Err(NexusError::Queue(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_processes_every_batch() {
        let store = Arc::new(MailDb::open(&PathBuf::from(":memory:")).unwrap());
        let transport = Arc::new(ScriptedTransport::new());
        let mut config = NexusConfig::default();
        config.sender.inter_item_delay_ms = 1000;
        let sender = Arc::new(BatchSender::new(
            store.clone(),
            Arc::new(StaticResolver::default()),
            transport.clone(),
            &config,
        ));

        let (queue, rx) = MemoryQueue::new();
        let now = Utc::now();
        let mut all_ids = Vec::new();
        for (n, owner) in ["acme", "globex", "initech"].iter().enumerate() {
            let mut ids = Vec::new();
            for _ in 0..2 {
                let item = NewWorkItem::new(owner, "to@example.com", "Hi", "x").scheduled_at(now);
                ids.push(store.insert(&item, now).await.unwrap().id);
            }
            let batch_id = format!("batch-{n}");
            store.conditional_claim(&ids, &batch_id, now).await.unwrap();
            queue
                .enqueue(BatchDescriptor {
                    batch_id,
                    owner_key: owner.to_string(),
                    item_ids: ids.clone(),
                })
                .await
                .unwrap();
            all_ids.extend(ids);
        }
        drop(queue);

        let pool = WorkerPool::new(sender, 2);
        pool.run(rx).await;
        assert_eq!(pool.active(), 0);

        for id in all_ids {
            assert_eq!(store.get(&id).await.unwrap().unwrap().status, ItemStatus::Sent);
        }
        assert_eq!(transport.opened(), 3);
        assert_eq!(transport.closed(), 3);
    }
}
