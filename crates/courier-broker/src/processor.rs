//! ---
//! courier_section: "04-broker-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Application hook answering inbound requests."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use async_trait::async_trait;
use courier_msg::{Content, Endpoint, RemoteFault};
use serde_json::Value as JsonValue;

/// Fault code returned when no processor was configured.
pub const NO_PROCESSOR: &str = "no_processor";

/// Handles requests raised by the broker's inbound loop. The returned value,
/// or the fault, becomes the reply content.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Process the innermost content of a request sent by `sender`.
    async fn process(&self, content: Content, sender: &Endpoint) -> Result<JsonValue, RemoteFault>;
}

/// Adapts a plain closure into a [`MessageProcessor`].
pub struct FnProcessor<F>(F);

impl<F> FnProcessor<F>
where
    F: Fn(Content, &Endpoint) -> Result<JsonValue, RemoteFault> + Send + Sync,
{
    /// Wrap `handler`.
    pub fn new(handler: F) -> Self {
        Self(handler)
    }
}

#[async_trait]
impl<F> MessageProcessor for FnProcessor<F>
where
    F: Fn(Content, &Endpoint) -> Result<JsonValue, RemoteFault> + Send + Sync,
{
    async fn process(&self, content: Content, sender: &Endpoint) -> Result<JsonValue, RemoteFault> {
        (self.0)(content, sender)
    }
}

/// Default processor: answers every request with a fault.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectingProcessor;

#[async_trait]
impl MessageProcessor for RejectingProcessor {
    async fn process(&self, _content: Content, _sender: &Endpoint) -> Result<JsonValue, RemoteFault> {
        Err(RemoteFault::new(
            NO_PROCESSOR,
            "this endpoint does not process requests",
        ))
    }
}
