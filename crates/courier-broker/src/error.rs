//! ---
//! courier_section: "04-broker-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Broker error taxonomy."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::time::Duration;

use courier_msg::{Endpoint, EnvelopeError, MessageId, RemoteFault};
use courier_router::TransportError;

/// Shared result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Failures of the correlation table itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// A pending entry already exists for this id.
    #[error("request {0} is already awaiting a reply")]
    Duplicate(MessageId),
}

/// Every way a dispatch can fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// No active router accepts the recipients.
    #[error("no active router can reach {}", describe(.recipients))]
    Unroutable {
        /// Recipients left without a router; empty for broadcasts.
        recipients: Vec<Endpoint>,
    },
    /// A router failed while sending.
    #[error("router {router} failed to deliver: {source}")]
    Transport {
        /// Name of the failing router.
        router: String,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },
    /// No reply arrived before the deadline.
    #[error("request {request_id} timed out after {after:?}")]
    Timeout {
        /// Id of the request.
        request_id: MessageId,
        /// Effective timeout.
        after: Duration,
    },
    /// The caller gave up waiting.
    #[error("request {request_id} was cancelled")]
    Cancelled {
        /// Id of the request.
        request_id: MessageId,
    },
    /// The remote processor answered with a fault.
    #[error("remote processing failed: {0}")]
    RemoteProcessing(RemoteFault),
    /// The envelope could not be built or decoded.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),
    /// The correlation table refused the request.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    /// The broker was shut down.
    #[error("broker is shut down")]
    Shutdown,
}

impl BrokerError {
    /// Whether resending the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Timeout { .. } | BrokerError::Transport { .. })
    }

    /// Low-cardinality label used by metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            BrokerError::Unroutable { .. } => "unroutable",
            BrokerError::Transport { .. } => "transport",
            BrokerError::Timeout { .. } => "timeout",
            BrokerError::Cancelled { .. } => "cancelled",
            BrokerError::RemoteProcessing(_) => "remote",
            BrokerError::InvalidEnvelope(_) => "invalid_envelope",
            BrokerError::Correlation(_) => "correlation",
            BrokerError::Shutdown => "shutdown",
        }
    }
}

fn describe(recipients: &[Endpoint]) -> String {
    if recipients.is_empty() {
        return "broadcast".to_owned();
    }
    recipients
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
