//! # Nexus Scheduler
//!
//! Periodic email dispatch over a shared SQLite record store.
//!
//! ## Design
//! - The store is the only coordination point: claims are conditional
//!   updates, so several schedulers may run against one database file
//! - Tokio timers only, sleeping between ticks
//! - Bounded worker pool, strictly sequential sends inside a batch
//! - Rate-limit holds live on the item and survive restarts
//!
//! ## Architecture
//! ```text
//! DispatchScheduler (tokio interval)
//!   ├── release expired rate-limit holds
//!   ├── reclaim stuck claims (dispatched_at older than threshold)
//!   └── BatchGrouper → one batch per owner → MemoryQueue
//!
//! WorkerPool (semaphore, pool_size)
//!   └── BatchSender: resolve → open → [pause → send → classify → record]* → close
//! ```

pub mod classifier;
pub mod engine;
pub mod grouper;
pub mod persistence;
pub mod queue;
pub mod sender;
pub mod testing;

pub use classifier::{FailureTiers, RetryDecision};
pub use engine::{DispatchScheduler, TickReport, spawn_scheduler};
pub use grouper::BatchGrouper;
pub use persistence::MailDb;
pub use queue::{MemoryQueue, WorkerPool};
pub use sender::{BatchReport, BatchSender};
