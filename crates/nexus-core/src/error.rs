//! Error types shared by every Nexus crate.
//!
//! Delivery outcomes (a provider rejecting a message) are not errors: they are
//! carried as `SendOutcome` / `RetryDecision` and end up in the item's status.
//! The variants here are infrastructure failures that callers recover from
//! locally, usually by skipping a tick or releasing a claim.

use thiserror::Error;

/// Result alias using [`NexusError`].
pub type Result<T> = std::result::Result<T, NexusError>;

#[derive(Error, Debug)]
pub enum NexusError {
    /// The record store could not be reached or rejected a statement.
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),

    /// The outbound transport could not be opened or broke mid-batch.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No transport settings exist for the owner.
    #[error("Transport not configured for owner '{0}'")]
    NotConfigured(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The work queue is closed or refused the batch.
    #[error("Work queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NexusError {
    /// Whether the failure is expected to clear up on its own (next tick, next batch).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NexusError::StoreUnavailable(_)
                | NexusError::TransportUnavailable(_)
                | NexusError::Queue(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_variants() {
        assert!(NexusError::StoreUnavailable("locked".into()).is_recoverable());
        assert!(NexusError::TransportUnavailable("refused".into()).is_recoverable());
        assert!(!NexusError::NotConfigured("acme".into()).is_recoverable());
        assert!(!NexusError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn test_display() {
        let e = NexusError::NotConfigured("acme".into());
        assert_eq!(e.to_string(), "Transport not configured for owner 'acme'");
    }
}
