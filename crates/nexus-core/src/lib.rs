//! # Nexus Core
//!
//! Shared vocabulary for the Nexus mail dispatcher: the work-item data model,
//! configuration, error type, and the traits the scheduler uses to talk to its
//! collaborators (record store, transport, work queue).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::NexusConfig;
pub use error::{NexusError, Result};
pub use types::{
    BatchDescriptor, Clock, ErrorSignal, ItemStatus, NewWorkItem, SendOutcome, SmtpSettings,
    TerminalUpdate, WorkItem, system_clock,
};
