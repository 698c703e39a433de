//! ---
//! courier_section: "03-routing-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Loopback router for same-process delivery."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_msg::{log_envelope, Envelope, MessageDirection, Recipients};
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::{reaches, Result, Router, RouterContext, RoutingInstruction, TransportError};

/// Default name of the loopback router.
pub const IN_PROCESS_ROUTER: &str = "in-process";

/// Delivers envelopes addressed to the local process straight back into its
/// own inbound channel, without serialisation.
#[derive(Debug)]
pub struct InProcessRouter {
    name: String,
    channels: Vec<String>,
    context: OnceCell<RouterContext>,
    closed: AtomicBool,
}

impl Default for InProcessRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessRouter {
    /// Loopback router with the default name.
    pub fn new() -> Self {
        Self::named(IN_PROCESS_ROUTER)
    }

    /// Loopback router with a custom name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: Vec::new(),
            context: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Channels the local process listens on.
    pub fn with_channels(mut self, channels: impl IntoIterator<Item = String>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    fn context(&self) -> Result<&RouterContext> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable(format!(
                "router {} is shut down",
                self.name
            )));
        }
        self.context
            .get()
            .ok_or_else(|| TransportError::NotInitialized(self.name.clone()))
    }
}

#[async_trait]
impl Router for InProcessRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, recipients: &Recipients) -> bool {
        let Some(context) = self.context.get() else {
            return false;
        };
        recipients
            .iter()
            .all(|recipient| reaches(recipient, &context.local, &self.channels))
    }

    async fn initialize(&self, context: RouterContext) -> Result<()> {
        if self.context.set(context).is_ok() {
            debug!(router = %self.name, "loopback router ready");
        }
        Ok(())
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<RoutingInstruction> {
        let context = self.context()?;
        if !self.can_handle(&envelope.recipients) {
            return Ok(RoutingInstruction::Unroutable);
        }
        log_envelope(MessageDirection::Loopback, &self.name, &envelope);
        context.inbound.deliver(envelope).await?;
        Ok(RoutingInstruction::None)
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
