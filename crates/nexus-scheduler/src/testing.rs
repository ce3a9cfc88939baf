//! In-memory doubles for exercising the dispatcher without a mail server.
//!
//! `ScriptedTransport` plays back per-recipient outcomes and records every
//! attempt with its (tokio) instant, so pacing can be asserted under paused time.
//! `FailingStore` wraps a real store and makes chosen operations fail.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nexus_core::error::{NexusError, Result};
use nexus_core::traits::{RecordStore, Transport, TransportHandle, TransportResolver};
use nexus_core::types::{
    Clock, ErrorSignal, ItemStatus, NewWorkItem, SendOutcome, SmtpSettings, TerminalUpdate,
    WorkItem,
};
use tokio::time::Instant;

/// What the scripted provider does with one send.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Deliver,
    Reject(ErrorSignal),
    /// The connection dies mid-send.
    Disconnect(String),
}

#[derive(Default)]
struct ScriptState {
    scripts: HashMap<String, VecDeque<ScriptedOutcome>>,
    sends: Vec<(String, Instant)>,
    opened: usize,
    closed: usize,
    fail_next_opens: usize,
    fail_opens_after: Option<usize>,
}

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport whose outcomes are queued per recipient. Unscripted sends deliver.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for a later send to `recipient`.
    pub fn script(&self, recipient: &str, outcome: ScriptedOutcome) {
        lock(&self.state)
            .scripts
            .entry(recipient.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Fail the next `n` calls to `open`.
    pub fn fail_next_opens(&self, n: usize) {
        lock(&self.state).fail_next_opens = n;
    }

    /// Let `n` more opens succeed, then fail every open after that.
    pub fn fail_opens_after(&self, n: usize) {
        let mut state = lock(&self.state);
        let limit = state.opened + n;
        state.fail_opens_after = Some(limit);
    }

    pub fn opened(&self) -> usize {
        lock(&self.state).opened
    }

    pub fn closed(&self) -> usize {
        lock(&self.state).closed
    }

    /// Every attempted send, in order: recipient and when it happened.
    pub fn sends(&self) -> Vec<(String, Instant)> {
        lock(&self.state).sends.clone()
    }

    pub fn sent_to(&self) -> Vec<String> {
        lock(&self.state).sends.iter().map(|(to, _)| to.clone()).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, settings: &SmtpSettings) -> Result<Box<dyn TransportHandle>> {
        let mut state = lock(&self.state);
        if state.fail_next_opens > 0 {
            state.fail_next_opens -= 1;
            return Err(NexusError::TransportUnavailable(format!(
                "{}:{} refused connection",
                settings.host, settings.port
            )));
        }
        if state.fail_opens_after.is_some_and(|limit| state.opened >= limit) {
            return Err(NexusError::TransportUnavailable(format!(
                "{}:{} unreachable",
                settings.host, settings.port
            )));
        }
        state.opened += 1;
        Ok(Box::new(ScriptedHandle {
            state: self.state.clone(),
        }))
    }
}

struct ScriptedHandle {
    state: Arc<Mutex<ScriptState>>,
}

#[async_trait]
impl TransportHandle for ScriptedHandle {
    async fn send(&mut self, item: &WorkItem) -> Result<SendOutcome> {
        let mut state = lock(&self.state);
        state.sends.push((item.recipient.clone(), Instant::now()));
        let next = state
            .scripts
            .get_mut(&item.recipient)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedOutcome::Deliver);
        match next {
            ScriptedOutcome::Deliver => Ok(SendOutcome::Delivered),
            ScriptedOutcome::Reject(signal) => Ok(SendOutcome::Rejected(signal)),
            ScriptedOutcome::Disconnect(reason) => Err(NexusError::TransportUnavailable(reason)),
        }
    }

    async fn close(self: Box<Self>) {
        lock(&self.state).closed += 1;
    }
}

/// Record store operations `FailingStore` can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ReleaseExpiredHolds,
    ReclaimStuck,
    EligibleOwners,
    SelectEligible,
    Claim,
    Release,
    Get,
    MarkSending,
    UpdateTerminal,
}

#[derive(Debug, Default, Clone, Copy)]
struct Injection {
    pass: usize,
    fail: usize,
}

/// Delegates to a real store, answering `StoreUnavailable` where told to.
pub struct FailingStore {
    inner: Arc<dyn RecordStore>,
    injections: Mutex<HashMap<StoreOp, Injection>>,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self {
            inner,
            injections: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `n` calls of `op`.
    pub fn fail(&self, op: StoreOp, n: usize) {
        self.fail_after(op, 0, n);
    }

    /// Let `pass` calls of `op` through, then fail the `n` after them.
    pub fn fail_after(&self, op: StoreOp, pass: usize, n: usize) {
        lock(&self.injections).insert(op, Injection { pass, fail: n });
    }

    fn check(&self, op: StoreOp) -> Result<()> {
        let mut injections = lock(&self.injections);
        let Some(injection) = injections.get_mut(&op) else {
            return Ok(());
        };
        if injection.pass > 0 {
            injection.pass -= 1;
        } else if injection.fail > 0 {
            injection.fail -= 1;
            return Err(NexusError::StoreUnavailable(format!("{op:?}: database is locked")));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn insert(&self, item: &NewWorkItem, now: DateTime<Utc>) -> Result<WorkItem> {
        self.inner.insert(item, now).await
    }

    async fn get(&self, id: &str) -> Result<Option<WorkItem>> {
        self.check(StoreOp::Get)?;
        self.inner.get(id).await
    }

    async fn release_expired_holds(&self, now: DateTime<Utc>) -> Result<usize> {
        self.check(StoreOp::ReleaseExpiredHolds)?;
        self.inner.release_expired_holds(now).await
    }

    async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.check(StoreOp::ReclaimStuck)?;
        self.inner.reclaim_stuck(cutoff).await
    }

    async fn eligible_owners(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        self.check(StoreOp::EligibleOwners)?;
        self.inner.eligible_owners(now, limit).await
    }

    async fn select_eligible(
        &self,
        owner_key: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.check(StoreOp::SelectEligible)?;
        self.inner.select_eligible(owner_key, now, limit).await
    }

    async fn conditional_claim(
        &self,
        ids: &[String],
        batch_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.check(StoreOp::Claim)?;
        self.inner.conditional_claim(ids, batch_id, now).await
    }

    async fn conditional_release(&self, ids: &[String], batch_id: &str) -> Result<usize> {
        self.check(StoreOp::Release)?;
        self.inner.conditional_release(ids, batch_id).await
    }

    async fn mark_sending(&self, id: &str, batch_id: &str) -> Result<bool> {
        self.check(StoreOp::MarkSending)?;
        self.inner.mark_sending(id, batch_id).await
    }

    async fn update_terminal(
        &self,
        id: &str,
        batch_id: &str,
        update: TerminalUpdate,
    ) -> Result<bool> {
        self.check(StoreOp::UpdateTerminal)?;
        self.inner.update_terminal(id, batch_id, update).await
    }

    async fn status_counts(&self) -> Result<Vec<(ItemStatus, u64)>> {
        self.inner.status_counts().await
    }
}

/// A dispatched item that never touched a store.
pub fn sample_item(owner_key: &str, recipient: &str) -> WorkItem {
    let now = Utc::now();
    WorkItem {
        id: uuid::Uuid::new_v4().to_string(),
        owner_key: owner_key.to_string(),
        campaign_key: None,
        recipient: recipient.to_string(),
        subject: "Hello".into(),
        body: "<p>Hi</p>".into(),
        status: ItemStatus::Dispatched,
        scheduled_at: now,
        batch_id: Some("sample".into()),
        dispatched_at: Some(now),
        rate_limit_retry_at: None,
        consecutive_rate_limit_failures: 0,
        terminal_at: None,
        opened_at: None,
        created_at: now,
    }
}

/// Resolves every owner to the same settings, or to none.
pub struct StaticResolver {
    settings: Option<SmtpSettings>,
}

impl StaticResolver {
    pub fn new(settings: SmtpSettings) -> Self {
        Self {
            settings: Some(settings),
        }
    }

    /// Every owner is unconfigured.
    pub fn missing() -> Self {
        Self { settings: None }
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new(SmtpSettings {
            host: "smtp.test".into(),
            from_email: "noreply@example.com".into(),
            ..SmtpSettings::default()
        })
    }
}

#[async_trait]
impl TransportResolver for StaticResolver {
    async fn resolve(&self, owner_key: &str) -> Result<SmtpSettings> {
        self.settings
            .clone()
            .ok_or_else(|| NexusError::NotConfigured(owner_key.to_string()))
    }
}

/// Hand-driven wall clock. Starts truncated to whole milliseconds, the
/// store's resolution, so round-tripped timestamps compare equal.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let start = DateTime::from_timestamp_millis(start.timestamp_millis()).unwrap_or(start);
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    /// A `Clock` reading this instance.
    pub fn clock(&self) -> Clock {
        let now = self.now.clone();
        Arc::new(move || *now.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A `Clock` that follows tokio's clock from `base`, so paused-time tests
/// move the wall clock together with timers.
pub fn tokio_clock(base: DateTime<Utc>) -> Clock {
    let start = Instant::now();
    Arc::new(move || {
        base + chrono::Duration::from_std(start.elapsed()).unwrap_or(chrono::Duration::zero())
    })
}
