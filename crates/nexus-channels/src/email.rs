//! SMTP transport: delivers work items through an owner's relay via async lettre.
//!
//! One `SmtpHandle` wraps a single-connection lettre pool, so consecutive sends
//! reuse the same session until the batch closes or reopens the handle.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::{self, PoolConfig};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use nexus_core::error::{NexusError, Result};
use nexus_core::traits::{Transport, TransportHandle};
use nexus_core::types::{ErrorSignal, SendOutcome, SmtpSettings, WorkItem};

type Mailer = AsyncSmtpTransport<Tokio1Executor>;

/// Opens SMTP sessions from per-owner settings.
pub struct SmtpTransport {
    connect_timeout: Duration,
}

impl SmtpTransport {
    /// `connect_timeout` applies when the owner's settings carry none, and
    /// caps the ones they do carry.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Effective timeout for one relay. An owner may shorten it, never lengthen it.
    pub fn timeout_for(&self, settings: &SmtpSettings) -> Duration {
        settings
            .timeout_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
            .map_or(self.connect_timeout, |own| own.min(self.connect_timeout))
    }
}

impl Default for SmtpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn open(&self, settings: &SmtpSettings) -> Result<Box<dyn TransportHandle>> {
        let timeout = self.timeout_for(settings);
        let handle = SmtpHandle::new(settings, timeout)?;

        let reachable = tokio::time::timeout(timeout, handle.mailer.test_connection())
            .await
            .map_err(|_| {
                NexusError::TransportUnavailable(format!(
                    "SMTP connect to {}:{} timed out after {}s",
                    settings.host,
                    settings.port,
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| NexusError::TransportUnavailable(format!("SMTP connect: {e}")))?;
        if !reachable {
            return Err(NexusError::TransportUnavailable(format!(
                "SMTP server {}:{} did not accept the session",
                settings.host, settings.port
            )));
        }

        tracing::debug!("🔌 SMTP session open: {}:{}", settings.host, settings.port);
        Ok(Box::new(handle))
    }
}

/// One open SMTP session plus the sender identity used for every message.
pub struct SmtpHandle {
    mailer: Mailer,
    from: Mailbox,
    signature: String,
}

impl SmtpHandle {
    /// Build the mailer without connecting.
    pub fn new(settings: &SmtpSettings, timeout: Duration) -> Result<Self> {
        let address: Address = settings
            .from_email
            .parse()
            .map_err(|e| NexusError::Config(format!("Invalid from address: {e}")))?;
        let from = Mailbox::new(settings.display_name.clone(), address);

        let builder = if settings.use_tls {
            Mailer::starttls_relay(&settings.host)
                .map_err(|e| NexusError::TransportUnavailable(format!("SMTP relay: {e}")))?
        } else {
            Mailer::builder_dangerous(&settings.host)
        };
        let mut builder = builder
            .port(settings.port)
            .timeout(Some(timeout))
            .pool_config(PoolConfig::new().max_size(1));
        if let Some(username) = &settings.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                settings.password.clone().unwrap_or_default(),
            ));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            signature: settings.signature.clone(),
        })
    }
}

#[async_trait]
impl TransportHandle for SmtpHandle {
    async fn send(&mut self, item: &WorkItem) -> Result<SendOutcome> {
        let to: Mailbox = match item.recipient.parse() {
            Ok(to) => to,
            Err(e) => {
                return Ok(SendOutcome::Rejected(ErrorSignal {
                    code: None,
                    message: format!("Invalid recipient '{}': {e}", item.recipient),
                    transient: false,
                }));
            }
        };
        let message = compose_message(self.from.clone(), to, item, &self.signature)?;

        match self.mailer.send(message).await {
            Ok(_) => {
                tracing::debug!("📤 Email sent to: {}", item.recipient);
                Ok(SendOutcome::Delivered)
            }
            Err(e) => match rejection_signal(&e) {
                Some(signal) => Ok(SendOutcome::Rejected(signal)),
                None => Err(NexusError::TransportUnavailable(format!("SMTP send: {e}"))),
            },
        }
    }

    async fn close(self: Box<Self>) {
        // Dropping the mailer quits the pooled session.
        drop(self);
    }
}

/// HTML body with the owner's signature appended.
pub fn with_signature(body: &str, signature: &str) -> String {
    if signature.trim().is_empty() {
        body.to_string()
    } else {
        format!("{body}<br><br>{signature}")
    }
}

/// Build the outgoing HTML message for one item.
pub fn compose_message(
    from: Mailbox,
    to: Mailbox,
    item: &WorkItem,
    signature: &str,
) -> Result<Message> {
    Message::builder()
        .from(from)
        .to(to)
        .subject(item.subject.as_str())
        .header(ContentType::TEXT_HTML)
        .body(with_signature(&item.body, signature))
        .map_err(|e| NexusError::Config(format!("Build email: {e}")))
}

/// A server reply that refuses the message. `None` means the session itself
/// broke (network, TLS, timeout) and nothing is known about the message.
fn rejection_signal(e: &smtp::Error) -> Option<ErrorSignal> {
    if !e.is_transient() && !e.is_permanent() {
        return None;
    }
    let code = e.status().and_then(|c| c.to_string().parse::<u16>().ok());
    Some(ErrorSignal {
        code,
        message: e.to_string(),
        transient: e.is_transient(),
    })
}
