//! ---
//! courier_section: "03-routing-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Router abstraction and transport implementations."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Pluggable transport adapters for the Courier broker.
//!
//! A [`Router`] physically delivers envelopes to the endpoints it can reach
//! and raises envelopes received from its transport through the
//! [`InboundSink`] handed to it at initialisation. The broker owns the
//! receiving end of every sink.
#![warn(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use courier_msg::{Endpoint, Envelope, Recipients};
use tokio::sync::mpsc;

pub mod codec;
pub mod in_process;
pub mod pubsub;
pub mod queue;

pub use in_process::InProcessRouter;
pub use pubsub::{MemoryBus, PubSubBackend, PubSubRouter, Subscription};
pub use queue::{MemoryQueues, QueueBackend, QueueRouter};

/// Shared result type for router operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures raised by a router's transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The router was used before `initialize` completed.
    #[error("router {0} is not initialised")]
    NotInitialized(String),
    /// The underlying transport cannot be reached or was shut down.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// Envelope could not be converted to or from the wire format.
    #[error("codec failure: {0}")]
    Codec(String),
    /// The broker stopped consuming inbound envelopes.
    #[error("inbound channel closed")]
    InboundClosed,
    /// The transport refused the envelope or the configuration.
    #[error("transport rejected request: {0}")]
    Rejected(String),
}

/// Outcome of a successful dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingInstruction {
    /// Dispatch fully handled, nothing left to do.
    None,
    /// The router could not accept the recipients.
    Unroutable,
}

/// Envelope raised by a router, tagged with the router that received it.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Name of the delivering router.
    pub router: Arc<str>,
    /// Decoded envelope.
    pub envelope: Envelope,
}

/// Sending half of the broker's inbound channel, bound to one router.
#[derive(Debug, Clone)]
pub struct InboundSink {
    router: Arc<str>,
    tx: mpsc::Sender<InboundEnvelope>,
}

impl InboundSink {
    /// Bind a sink to the named router.
    pub fn new(router: impl Into<Arc<str>>, tx: mpsc::Sender<InboundEnvelope>) -> Self {
        Self {
            router: router.into(),
            tx,
        }
    }

    /// Name of the router this sink is bound to.
    pub fn router(&self) -> &str {
        &self.router
    }

    /// Hand an inbound envelope to the broker.
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(InboundEnvelope {
                router: self.router.clone(),
                envelope,
            })
            .await
            .map_err(|_| TransportError::InboundClosed)
    }

    /// True once the broker dropped the receiving side.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything a router needs from the broker to start.
#[derive(Debug, Clone)]
pub struct RouterContext {
    /// Identity of the local process.
    pub local: Endpoint,
    /// Where to raise inbound envelopes.
    pub inbound: InboundSink,
}

/// Transport adapter able to deliver envelopes to some endpoints.
#[async_trait]
pub trait Router: Send + Sync {
    /// Stable name used for logs, metrics and inbound tagging.
    fn name(&self) -> &str;

    /// Whether this router can reach every endpoint in `recipients`. An empty
    /// set asks whether the router takes part in broadcasts.
    fn can_handle(&self, recipients: &Recipients) -> bool;

    /// Connect the transport. Calling this more than once is a no-op.
    async fn initialize(&self, context: RouterContext) -> Result<()>;

    /// Deliver the envelope to its recipients over this transport.
    async fn dispatch(&self, envelope: Envelope) -> Result<RoutingInstruction>;

    /// Release the transport connection and stop raising inbound envelopes.
    async fn shutdown(&self) -> Result<()>;
}

/// True when `recipient` designates the local process, directly or through
/// one of the channels it listens on.
pub fn reaches(recipient: &Endpoint, local: &Endpoint, channels: &[String]) -> bool {
    recipient.matches(local)
        || channels
            .iter()
            .any(|channel| recipient.matches(&local.clone().with_channel(channel.as_str())))
}

/// True when an inbound envelope is addressed to `local`, either as a
/// broadcast or through at least one matching recipient.
pub fn addressed_to(envelope: &Envelope, local: &Endpoint, channels: &[String]) -> bool {
    envelope.recipients.is_empty()
        || envelope
            .recipients
            .iter()
            .any(|recipient| reaches(recipient, local, channels))
}
