//! Batch sender: delivers one claimed batch over a single connection.
//!
//! Items go out strictly one at a time, in claim order, with a fixed pause
//! between attempts. Every status change is conditional on this batch still
//! owning the item, so a batch that was reclaimed behind our back can no
//! longer touch it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nexus_core::config::{MAX_WAIT_SECS, NexusConfig};
use nexus_core::error::{NexusError, Result};
use nexus_core::traits::{RecordStore, Transport, TransportHandle, TransportResolver};
use nexus_core::types::{
    BatchDescriptor, Clock, ItemStatus, SendOutcome, TerminalUpdate, WorkItem, system_clock,
};
use serde::Serialize;

use crate::classifier::{FailureTiers, RetryDecision, classify};

/// Per-batch outcome counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub sent: usize,
    pub failed: usize,
    pub rate_limited: usize,
    /// Items this batch no longer owned when it reached them.
    pub skipped: usize,
    /// Items handed back to `pending` without an attempt.
    pub released: usize,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.sent + self.failed + self.rate_limited
    }
}

pub struct BatchSender {
    store: Arc<dyn RecordStore>,
    resolver: Arc<dyn TransportResolver>,
    transport: Arc<dyn Transport>,
    tiers: FailureTiers,
    inter_item_delay: Duration,
    reconnect_every: usize,
    clock: Clock,
}

impl BatchSender {
    pub fn new(
        store: Arc<dyn RecordStore>,
        resolver: Arc<dyn TransportResolver>,
        transport: Arc<dyn Transport>,
        config: &NexusConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            transport,
            tiers: FailureTiers::from_config(&config.rate_limit),
            inter_item_delay: config.sender.inter_item_delay(),
            reconnect_every: config.sender.reconnect_every,
            clock: system_clock(),
        }
    }

    /// Replace the wall clock used for timestamps and retry times.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Deliver a batch. Never fails as a whole: anything not attempted is
    /// released back to `pending` for a later tick.
    pub async fn process(&self, batch: &BatchDescriptor) -> BatchReport {
        let mut report = BatchReport::default();
        tracing::debug!(
            "📤 Batch {} for '{}': {} item(s)",
            batch.batch_id,
            batch.owner_key,
            batch.item_ids.len()
        );

        let settings = match self.resolver.resolve(&batch.owner_key).await {
            Ok(settings) => settings,
            Err(e) => {
                setup_failed(batch, "resolve", &e);
                report.released = self.release(batch, &batch.item_ids).await;
                return report;
            }
        };

        let mut handle = match self.transport.open(&settings).await {
            Ok(handle) => handle,
            Err(e) => {
                setup_failed(batch, self.transport.name(), &e);
                report.released = self.release(batch, &batch.item_ids).await;
                return report;
            }
        };

        let mut attempts = 0usize;
        for (idx, id) in batch.item_ids.iter().enumerate() {
            let item = match self.store.get(id).await {
                Ok(Some(item)) if owned_by(&item, batch) => item,
                Ok(_) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Batch {}: store read failed: {e}", batch.batch_id);
                    report.released += self.release(batch, &batch.item_ids[idx..]).await;
                    break;
                }
            };

            if attempts > 0 {
                tokio::time::sleep(self.inter_item_delay).await;
                if self.reconnect_every > 0 && attempts % self.reconnect_every == 0 {
                    handle.close().await;
                    match self.transport.open(&settings).await {
                        Ok(fresh) => handle = fresh,
                        Err(e) => {
                            tracing::warn!(
                                "⚠️ Batch {}: reconnect failed after {attempts} send(s): {e}",
                                batch.batch_id
                            );
                            report.released += self.release(batch, &batch.item_ids[idx..]).await;
                            return report;
                        }
                    }
                }
            }

            match self.store.mark_sending(id, &batch.batch_id).await {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Batch {}: mark sending failed: {e}", batch.batch_id);
                    report.released += self.release(batch, &batch.item_ids[idx..]).await;
                    break;
                }
            }
            attempts += 1;

            match self.deliver(handle.as_mut(), &item, batch).await {
                Ok(status) => match status {
                    ItemStatus::Sent => report.sent += 1,
                    ItemStatus::Failed => report.failed += 1,
                    ItemStatus::RateLimited => report.rate_limited += 1,
                    _ => report.skipped += 1,
                },
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Batch {}: connection lost at item {}: {e}",
                        batch.batch_id,
                        item.id
                    );
                    report.released += self.release(batch, &batch.item_ids[idx..]).await;
                    break;
                }
            }
        }

        handle.close().await;
        tracing::info!(
            "📨 Batch {} ('{}'): {} sent, {} failed, {} rate-limited, {} skipped, {} released",
            batch.batch_id,
            batch.owner_key,
            report.sent,
            report.failed,
            report.rate_limited,
            report.skipped,
            report.released
        );
        report
    }

    /// Send one item and record its terminal state. Returns the status that was
    /// written, or `Pending` when the batch lost the item before the write.
    async fn deliver(
        &self,
        handle: &mut dyn TransportHandle,
        item: &WorkItem,
        batch: &BatchDescriptor,
    ) -> Result<ItemStatus> {
        let outcome = handle.send(item).await?;
        let now = (self.clock)();

        let update = match outcome {
            SendOutcome::Delivered => TerminalUpdate::Sent { at: now },
            SendOutcome::Rejected(signal) => {
                let failures = item.consecutive_rate_limit_failures.saturating_add(1);
                match classify(&signal, failures, &self.tiers) {
                    RetryDecision::Permanent => {
                        tracing::warn!("✉️ {} rejected permanently: {signal}", item.recipient);
                        TerminalUpdate::Failed { at: now }
                    }
                    RetryDecision::RetryAfter(delay) => {
                        let retry_at = hold_until(now, delay);
                        tracing::info!(
                            "⏳ {} rate-limited ({signal}), failure #{failures}, retry at {}",
                            item.recipient,
                            retry_at.format("%H:%M:%S UTC")
                        );
                        TerminalUpdate::RateLimited {
                            retry_at,
                            consecutive_failures: failures,
                        }
                    }
                }
            }
        };

        let status = update.status();
        match self.store.update_terminal(&item.id, &batch.batch_id, update).await {
            Ok(true) => Ok(status),
            Ok(false) => {
                tracing::warn!(
                    "Batch {} lost item {} before recording {status}",
                    batch.batch_id,
                    item.id
                );
                Ok(ItemStatus::Pending)
            }
            // The item stays `sending` and is picked up again by stuck reclaim.
            Err(e) => {
                tracing::error!("Recording {status} for item {} failed: {e}", item.id);
                Ok(ItemStatus::Pending)
            }
        }
    }

    async fn release(&self, batch: &BatchDescriptor, ids: &[String]) -> usize {
        match self.store.conditional_release(ids, &batch.batch_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(
                    "Release of {} item(s) from batch {} failed, left for stuck reclaim: {e}",
                    ids.len(),
                    batch.batch_id
                );
                0
            }
        }
    }
}

/// `now + delay`, the delay capped at the longest configurable wait.
fn hold_until(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay.min(Duration::from_secs(MAX_WAIT_SECS)))
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Owner misconfiguration needs an operator; outages clear up by themselves.
fn setup_failed(batch: &BatchDescriptor, stage: &str, e: &NexusError) {
    if e.is_recoverable() {
        tracing::warn!(
            "⚠️ Batch {}: {stage} failed, released for a later tick: {e}",
            batch.batch_id
        );
    } else {
        tracing::error!(
            "Batch {} for '{}' cannot go out until fixed ({stage}): {e}",
            batch.batch_id,
            batch.owner_key
        );
    }
}

fn owned_by(item: &WorkItem, batch: &BatchDescriptor) -> bool {
    item.status == ItemStatus::Dispatched && item.batch_id.as_deref() == Some(&batch.batch_id)
}
