//! # Nexus Channels
//! Outbound delivery transports.
//!
//! Only SMTP today; anything implementing `nexus_core::traits::Transport`
//! can be handed to the batch sender.

pub mod email;

pub use email::{SmtpHandle, SmtpTransport};
