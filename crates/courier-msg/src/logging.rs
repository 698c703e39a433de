//! ---
//! courier_section: "02-envelope-model"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Endpoint addressing and envelope data model."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use tracing::debug;

use crate::envelope::Envelope;

/// Direction of the envelope movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope handed to a router.
    Outbound,
    /// Envelope raised by a router's transport.
    Inbound,
    /// Envelope looped back inside the local process.
    Loopback,
}

impl MessageDirection {
    /// Label used as a structured field value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Outbound => "outbound",
            MessageDirection::Inbound => "inbound",
            MessageDirection::Loopback => "loopback",
        }
    }
}

/// Emit a structured log entry for envelope activity on a router.
pub fn log_envelope(direction: MessageDirection, router: &str, envelope: &Envelope) {
    debug!(
        message_id = %envelope.id,
        reply_to = ?envelope.reply_to_id.map(|id| id.to_string()),
        kind = envelope.kind(),
        content = envelope.content.kind(),
        sender = %envelope.sender,
        recipients = envelope.recipients.len(),
        created_at = %envelope.created_at,
        router,
        direction = direction.as_str(),
        "envelope activity"
    );
}
