//! Transport traits: resolving per-owner settings and delivering over one connection.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{SendOutcome, SmtpSettings, WorkItem};

/// Looks up outbound connection settings for an owner.
#[async_trait]
pub trait TransportResolver: Send + Sync {
    /// Fails with `NexusError::NotConfigured` when the owner has no settings.
    async fn resolve(&self, owner_key: &str) -> Result<SmtpSettings>;
}

/// Opens connections to the outbound provider.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, settings: &SmtpSettings) -> Result<Box<dyn TransportHandle>>;
}

/// One open connection, exclusively owned by a single batch.
#[async_trait]
pub trait TransportHandle: Send {
    /// `Err` means the connection itself is unusable; a provider refusal is
    /// `Ok(SendOutcome::Rejected(..))`.
    async fn send(&mut self, item: &WorkItem) -> Result<SendOutcome>;

    async fn close(self: Box<Self>);
}
