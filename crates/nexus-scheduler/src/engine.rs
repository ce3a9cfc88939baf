//! Dispatch scheduler: the periodic driver.
//! Uses tokio::interval; sleeps between ticks, never busy-waits.
//!
//! Each tick: release expired rate-limit holds, reclaim stuck claims, claim
//! due work into batches, enqueue them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nexus_core::config::NexusConfig;
use nexus_core::error::Result;
use nexus_core::traits::{RecordStore, WorkQueue};
use nexus_core::types::{Clock, system_clock};
use serde::Serialize;

use crate::grouper::BatchGrouper;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub holds_released: usize,
    pub stuck_reclaimed: usize,
    pub batches: usize,
    pub items_claimed: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

pub struct DispatchScheduler {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn WorkQueue>,
    grouper: BatchGrouper,
    stuck_threshold: Duration,
    tick_interval: Duration,
    clock: Clock,
}

impl DispatchScheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn WorkQueue>,
        config: &NexusConfig,
    ) -> Self {
        Self {
            grouper: BatchGrouper::new(
                store.clone(),
                config.dispatch.batch_size,
                config.dispatch.dispatch_limit,
            ),
            store,
            queue,
            stuck_threshold: config.dispatch.stuck_threshold(),
            tick_interval: config.dispatch.tick_interval(),
            clock: system_clock(),
        }
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Tick at the clock's current time.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = (self.clock)();
        self.tick_at(now).await
    }

    /// Run one scheduling round as of `now`. A store error aborts the round;
    /// every step is per-row atomic, so nothing is left half done.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport {
            holds_released: self.store.release_expired_holds(now).await?,
            ..TickReport::default()
        };

        // A threshold reaching past the representable range means nothing is stuck yet.
        let cutoff = chrono::Duration::from_std(self.stuck_threshold)
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold));
        match cutoff {
            Some(cutoff) => {
                report.stuck_reclaimed = self.store.reclaim_stuck(cutoff).await?;
                if report.stuck_reclaimed > 0 {
                    tracing::warn!(
                        "♻️ Reclaimed {} stuck item(s) claimed before {}",
                        report.stuck_reclaimed,
                        cutoff.format("%H:%M:%S UTC")
                    );
                }
            }
            None => tracing::debug!(
                "Stuck threshold of {}s out of range, reclaim skipped",
                self.stuck_threshold.as_secs()
            ),
        }

        for batch in self.grouper.claim_batches(now).await? {
            let size = batch.item_ids.len();
            let (batch_id, ids) = (batch.batch_id.clone(), batch.item_ids.clone());
            match self.queue.enqueue(batch).await {
                Ok(()) => {
                    report.batches += 1;
                    report.items_claimed += size;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Enqueue of batch {batch_id} failed, releasing claim: {e}");
                    if let Err(e) = self.store.conditional_release(&ids, &batch_id).await {
                        tracing::error!(
                            "Release of batch {batch_id} failed, left for stuck reclaim: {e}"
                        );
                    }
                }
            }
        }

        if !report.is_idle() {
            tracing::info!(
                "📬 Tick: {} batch(es), {} item(s) claimed, {} hold(s) released, {} stuck reclaimed",
                report.batches,
                report.items_claimed,
                report.holds_released,
                report.stuck_reclaimed
            );
        }
        Ok(report)
    }
}

/// Spawn-able scheduler loop. Store outages skip the tick; the next one retries.
pub async fn spawn_scheduler(scheduler: Arc<DispatchScheduler>) {
    tracing::info!(
        "⏰ Dispatch scheduler started (tick every {}s)",
        scheduler.tick_interval().as_secs()
    );

    let mut interval = tokio::time::interval(scheduler.tick_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match scheduler.tick().await {
            Ok(_) => {}
            Err(e) if e.is_recoverable() => tracing::warn!("⚠️ Scheduler tick skipped: {e}"),
            Err(e) => tracing::error!("Scheduler tick failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MailDb;
    use crate::queue::MemoryQueue;
    use crate::testing::{FailingStore, StoreOp};
    use chrono::Duration as ChronoDuration;
    use nexus_core::error::NexusError;
    use nexus_core::types::{BatchDescriptor, ItemStatus, NewWorkItem, TerminalUpdate};
    use std::collections::HashSet;
    use tokio::sync::mpsc::UnboundedReceiver;
    use std::path::PathBuf;

    type Setup = (Arc<MailDb>, Arc<MemoryQueue>, UnboundedReceiver<BatchDescriptor>, NexusConfig);

    fn setup(batch_size: usize) -> Setup {
        let store = Arc::new(MailDb::open(&PathBuf::from(":memory:")).unwrap());
        let (queue, rx) = MemoryQueue::new();
        let mut config = NexusConfig::default();
        config.dispatch.batch_size = batch_size;
        (store, Arc::new(queue), rx, config)
    }

    async fn seed(store: &MailDb, owner: &str, at: DateTime<Utc>) -> String {
        let item = NewWorkItem::new(owner, "to@example.com", "Hi", "<p>x</p>").scheduled_at(at);
        store.insert(&item, at).await.unwrap().id
    }

    #[tokio::test]
    async fn test_tick_enqueues_claimed_batch() {
        let (store, queue, mut rx, config) = setup(2);
        let t0 = Utc::now();
        let a = seed(&store, "acme", t0).await;
        let b = seed(&store, "acme", t0).await;

        let scheduler = DispatchScheduler::new(store.clone(), queue, &config);
        let report = scheduler.tick_at(t0 + ChronoDuration::seconds(1)).await.unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(report.items_claimed, 2);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.owner_key, "acme");
        assert_eq!(batch.item_ids, vec![a, b]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_idle_tick() {
        let (store, queue, mut rx, config) = setup(2);
        let scheduler = DispatchScheduler::new(store, queue, &config);
        let report = scheduler.tick_at(Utc::now()).await.unwrap();
        assert!(report.is_idle());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_schedulers_never_double_claim() {
        let (store, queue, mut rx, config) = setup(3);
        let t0 = Utc::now();
        for owner in ["acme", "globex", "initech"] {
            for _ in 0..7 {
                seed(&store, owner, t0).await;
            }
        }

        let first = Arc::new(DispatchScheduler::new(store.clone(), queue.clone(), &config));
        let second = Arc::new(DispatchScheduler::new(store.clone(), queue.clone(), &config));
        let now = t0 + ChronoDuration::seconds(1);
        for _ in 0..4 {
            let (a, b) = tokio::join!(first.tick_at(now), second.tick_at(now));
            a.unwrap();
            b.unwrap();
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        while let Ok(batch) = rx.try_recv() {
            assert!(batch.item_ids.len() <= 3);
            for id in batch.item_ids {
                assert!(seen.insert(id), "item claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 21);
    }

    #[tokio::test]
    async fn test_tick_releases_holds_and_reclaims_stuck() {
        let (store, queue, mut rx, mut config) = setup(5);
        config.dispatch.stuck_threshold_secs = 600;
        let t0 = Utc::now();
        let held = seed(&store, "acme", t0).await;
        let stuck = seed(&store, "acme", t0).await;

        store.conditional_claim(&[held.clone()], "b-held", t0).await.unwrap();
        store.mark_sending(&held, "b-held").await.unwrap();
        store
            .update_terminal(
                &held,
                "b-held",
                TerminalUpdate::RateLimited {
                    retry_at: t0 + ChronoDuration::seconds(30),
                    consecutive_failures: 1,
                },
            )
            .await
            .unwrap();
        store.conditional_claim(&[stuck.clone()], "b-dead", t0).await.unwrap();

        let scheduler = DispatchScheduler::new(store.clone(), queue, &config);

        // Before the cooldown and the stuck threshold, nothing moves.
        let report = scheduler.tick_at(t0 + ChronoDuration::seconds(20)).await.unwrap();
        assert!(report.is_idle());

        let report = scheduler.tick_at(t0 + ChronoDuration::seconds(601)).await.unwrap();
        assert_eq!(report.holds_released, 1);
        assert_eq!(report.stuck_reclaimed, 1);
        assert_eq!(report.items_claimed, 2);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.item_ids.len(), 2);
        let item = store.get(&stuck).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Dispatched);
        assert_eq!(item.batch_id.as_deref(), Some(batch.batch_id.as_str()));
    }

    #[tokio::test]
    async fn test_closed_queue_releases_claim() {
        let (store, queue, rx, config) = setup(5);
        drop(rx);
        let t0 = Utc::now();
        let id = seed(&store, "acme", t0).await;

        let scheduler = DispatchScheduler::new(store.clone(), queue, &config);
        let report = scheduler.tick_at(t0).await.unwrap();
        assert_eq!(report.batches, 0);
        let item = store.get(&id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.batch_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_on_interval() {
        let (store, queue, mut rx, mut config) = setup(5);
        config.dispatch.tick_interval_secs = 10;
        let scheduler = Arc::new(DispatchScheduler::new(store.clone(), queue, &config));
        let handle = tokio::spawn(spawn_scheduler(scheduler));

        // First interval tick fires immediately; nothing is due yet.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        seed(&store, "acme", Utc::now() - ChronoDuration::seconds(1)).await;
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_ok());
        handle.abort();
    }

    #[tokio::test]
    async fn test_out_of_range_stuck_threshold_reclaims_nothing() {
        for threshold in [u64::MAX, (i64::MAX / 1000) as u64] {
            let (store, queue, mut rx, mut config) = setup(5);
            config.dispatch.stuck_threshold_secs = threshold;
            let t0 = Utc::now();
            let id = seed(&store, "acme", t0).await;

            let scheduler = DispatchScheduler::new(store.clone(), queue, &config);
            assert_eq!(scheduler.tick_at(t0).await.unwrap().items_claimed, 1);
            let report = scheduler.tick_at(t0 + ChronoDuration::seconds(10)).await.unwrap();
            assert!(report.is_idle(), "threshold {threshold}: {report:?}");

            assert!(rx.try_recv().is_ok());
            assert!(rx.try_recv().is_err());
            let item = store.get(&id).await.unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Dispatched);
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_tick_without_claiming() {
        let (store, queue, mut rx, config) = setup(5);
        let t0 = Utc::now();
        let id = seed(&store, "acme", t0).await;
        let flaky = Arc::new(FailingStore::new(store.clone()));
        flaky.fail(StoreOp::EligibleOwners, 1);

        let scheduler = DispatchScheduler::new(flaky, queue, &config);
        assert!(matches!(
            scheduler.tick_at(t0).await,
            Err(NexusError::StoreUnavailable(_))
        ));
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, ItemStatus::Pending);
        assert!(rx.try_recv().is_err());

        assert_eq!(scheduler.tick_at(t0).await.unwrap().items_claimed, 1);
        assert_eq!(rx.try_recv().unwrap().item_ids, vec![id]);
    }

    #[tokio::test]
    async fn test_failed_release_does_not_abort_tick() {
        let (store, queue, rx, config) = setup(5);
        drop(rx);
        let t0 = Utc::now();
        let acme = seed(&store, "acme", t0).await;
        let globex = seed(&store, "globex", t0).await;
        let flaky = Arc::new(FailingStore::new(store.clone()));
        flaky.fail(StoreOp::Release, 1);

        let scheduler = DispatchScheduler::new(flaky, queue, &config);
        let report = scheduler.tick_at(t0).await.unwrap();
        assert_eq!(report.batches, 0);

        // The first release failed and waits for stuck reclaim; the second went through.
        assert_eq!(store.get(&acme).await.unwrap().unwrap().status, ItemStatus::Dispatched);
        assert_eq!(store.get(&globex).await.unwrap().unwrap().status, ItemStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_store_outage() {
        let (store, queue, mut rx, mut config) = setup(5);
        config.dispatch.tick_interval_secs = 10;
        seed(&store, "acme", Utc::now() - ChronoDuration::seconds(1)).await;
        let flaky = Arc::new(FailingStore::new(store.clone()));
        flaky.fail(StoreOp::ReleaseExpiredHolds, 1);

        let scheduler = Arc::new(DispatchScheduler::new(flaky, queue, &config));
        let handle = tokio::spawn(spawn_scheduler(scheduler));

        // The immediate first tick hits the outage.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv().unwrap().owner_key, "acme");
        handle.abort();
    }
}
