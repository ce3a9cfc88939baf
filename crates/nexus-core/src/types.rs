//! Data model: work items, batches, transport settings and send outcomes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source of "now" for the scheduler and sender. Tests swap in a manual clock.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed into a batch, not yet picked up by a sender.
    Dispatched,
    /// A sender is delivering it right now.
    Sending,
    Sent,
    Failed,
    /// Throttled by the provider; held until `rate_limit_retry_at`.
    RateLimited,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 6] = [
        ItemStatus::Pending,
        ItemStatus::Dispatched,
        ItemStatus::Sending,
        ItemStatus::Sent,
        ItemStatus::Failed,
        ItemStatus::RateLimited,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Dispatched => "dispatched",
            ItemStatus::Sending => "sending",
            ItemStatus::Sent => "sent",
            ItemStatus::Failed => "failed",
            ItemStatus::RateLimited => "rate_limited",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// `sent` and `failed` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Sent | ItemStatus::Failed)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deliverable email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Partitions batches and selects transport settings.
    pub owner_key: String,
    /// Informational only.
    pub campaign_key: Option<String>,
    pub recipient: String,
    pub subject: String,
    /// HTML body.
    pub body: String,
    pub status: ItemStatus,
    /// Earliest instant the item may be claimed.
    pub scheduled_at: DateTime<Utc>,
    pub batch_id: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub rate_limit_retry_at: Option<DateTime<Utc>>,
    pub consecutive_rate_limit_failures: u32,
    pub terminal_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// What a producer hands to the store to create a `pending` item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub owner_key: String,
    #[serde(default)]
    pub campaign_key: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub scheduled_at: DateTime<Utc>,
}

impl NewWorkItem {
    pub fn new(owner_key: &str, recipient: &str, subject: &str, body: &str) -> Self {
        Self {
            owner_key: owner_key.to_string(),
            campaign_key: None,
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            scheduled_at: Utc::now(),
        }
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    pub fn campaign(mut self, campaign_key: &str) -> Self {
        self.campaign_key = Some(campaign_key.to_string());
        self
    }
}

/// Queue message: one claimed batch for a single owner, in send order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub batch_id: String,
    pub owner_key: String,
    pub item_ids: Vec<String>,
}

/// Connection parameters for one owner's outbound SMTP relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Upgrade the connection with STARTTLS.
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from_email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// HTML appended to every body.
    #[serde(default)]
    pub signature: String,
    /// Connect and command timeout for this relay. Unset means the
    /// dispatcher's `[sender].connect_timeout_secs`, which also caps it.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_smtp_port() -> u16 {
    587
}
fn default_true() -> bool {
    true
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".into(),
            port: 587,
            use_tls: true,
            username: None,
            password: None,
            from_email: String::new(),
            display_name: None,
            signature: String::new(),
            timeout_secs: None,
        }
    }
}

/// What the provider said when it refused a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignal {
    /// SMTP reply code, when there was one.
    pub code: Option<u16>,
    pub message: String,
    /// The transport's own view: a 4xx reply or equivalent.
    pub transient: bool,
}

impl ErrorSignal {
    pub fn transient(code: u16, message: &str) -> Self {
        Self {
            code: Some(code),
            message: message.to_string(),
            transient: true,
        }
    }

    pub fn permanent(code: u16, message: &str) -> Self {
        Self {
            code: Some(code),
            message: message.to_string(),
            transient: false,
        }
    }
}

impl std::fmt::Display for ErrorSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{code} {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Result of one delivery attempt over an open handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The provider refused the message; the classifier decides whether it is
    /// a capacity rejection or a permanent one.
    Rejected(ErrorSignal),
}

/// Terminal (or hold) transition written by the batch sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalUpdate {
    Sent { at: DateTime<Utc> },
    Failed { at: DateTime<Utc> },
    RateLimited {
        retry_at: DateTime<Utc>,
        consecutive_failures: u32,
    },
}

impl TerminalUpdate {
    pub fn status(&self) -> ItemStatus {
        match self {
            TerminalUpdate::Sent { .. } => ItemStatus::Sent,
            TerminalUpdate::Failed { .. } => ItemStatus::Failed,
            TerminalUpdate::RateLimited { .. } => ItemStatus::RateLimited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in ItemStatus::ALL {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::parse("queued"), None);
        assert_eq!(ItemStatus::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ItemStatus::Sent.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::RateLimited.is_terminal());
        assert!(!ItemStatus::Dispatched.is_terminal());
    }

    #[test]
    fn test_smtp_settings_defaults_from_toml() {
        let s: SmtpSettings =
            toml::from_str("host = \"mail.example.com\"\nfrom_email = \"a@example.com\"").unwrap();
        assert_eq!(s.port, 587);
        assert!(s.use_tls);
        assert_eq!(s.timeout_secs, None);
        assert!(s.signature.is_empty());
    }

    #[test]
    fn test_error_signal_display() {
        assert_eq!(
            ErrorSignal::transient(421, "try again later").to_string(),
            "421 try again later"
        );
    }
}
