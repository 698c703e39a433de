//! ---
//! courier_section: "04-broker-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Message broker façade and inbound loop."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! The broker turns application calls into envelopes, routes them, and
//! correlates replies.
//!
//! Every router raises inbound traffic through one bounded channel. A single
//! task drains it: replies complete pending requests inline, requests are
//! handed to the [`MessageProcessor`] on their own task so a slow processor
//! never delays correlation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_msg::{Content, Endpoint, Envelope, EnvelopeError, EnvelopeOptions, Recipients, RemoteFault};
use courier_router::{InboundEnvelope, Router, RoutingInstruction};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlation::{Completion, CorrelationEngine};
use crate::error::{BrokerError, Result};
use crate::identity::IdentityProvider;
use crate::metrics::BrokerMetrics;
use crate::processor::{MessageProcessor, RejectingProcessor};
use crate::selector::{Route, RouterSelector};

/// Fault code used when a processor returns no content.
pub const EMPTY_REPLY: &str = "empty_reply";

/// Tunables applied to every dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Reply deadline when the caller gives none.
    pub default_timeout: Duration,
    /// Capacity of the shared inbound channel.
    pub inbound_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            inbound_capacity: 1024,
        }
    }
}

/// Per-call dispatch settings.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    recipients: Recipients,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
    one_way: bool,
}

impl DispatchOptions {
    /// Broadcast request with the default timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a recipient.
    pub fn to(mut self, recipient: Endpoint) -> Self {
        self.recipients.insert(recipient);
        self
    }

    /// Add several recipients.
    pub fn to_all(mut self, recipients: impl IntoIterator<Item = Endpoint>) -> Self {
        self.recipients.extend(recipients);
        self
    }

    /// Reply deadline overriding the broker default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Token the caller can trigger to stop waiting.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Do not wait for a reply.
    pub fn one_way(mut self, one_way: bool) -> Self {
        self.one_way = one_way;
        self
    }
}

/// Collects routers, processor and settings before starting a broker.
pub struct MessageBrokerBuilder {
    identity: Arc<dyn IdentityProvider>,
    routers: Vec<(Arc<dyn Router>, i32)>,
    processor: Arc<dyn MessageProcessor>,
    settings: BrokerSettings,
    metrics: Option<BrokerMetrics>,
}

impl MessageBrokerBuilder {
    /// Register a router with the given selection priority.
    pub fn router(self, router: impl Router + 'static, priority: i32) -> Self {
        self.shared_router(Arc::new(router), priority)
    }

    /// Register a router the caller keeps a handle to.
    pub fn shared_router(mut self, router: Arc<dyn Router>, priority: i32) -> Self {
        self.routers.push((router, priority));
        self
    }

    /// Handler for inbound requests.
    pub fn processor(mut self, processor: impl MessageProcessor + 'static) -> Self {
        self.processor = Arc::new(processor);
        self
    }

    /// Override the default settings.
    pub fn config(mut self, settings: BrokerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Record traffic into `metrics`.
    pub fn metrics(mut self, metrics: BrokerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Initialise the routers and start the inbound loop.
    pub async fn start(self) -> Result<MessageBroker> {
        let local = self.identity.local_endpoint();
        let mut selector = RouterSelector::new();
        for (router, priority) in self.routers {
            selector.register(router, priority);
        }

        let (tx, rx) = mpsc::channel(self.settings.inbound_capacity.max(1));
        let active = selector.initialize_all(&local, &tx).await;
        if active == 0 {
            warn!(endpoint = %local, "no router initialised, every dispatch will be unroutable");
        }

        let inner = Arc::new(BrokerInner {
            identity: self.identity,
            selector,
            engine: CorrelationEngine::new(),
            processor: self.processor,
            settings: self.settings,
            metrics: self.metrics,
            shutdown: CancellationToken::new(),
            inbound_task: Mutex::new(None),
        });
        let task = tokio::spawn(run_inbound(inner.clone(), rx));
        *inner.inbound_task.lock() = Some(task);

        info!(endpoint = %local, routers = ?inner.selector.active_names(), "message broker started");
        Ok(MessageBroker { inner })
    }
}

struct BrokerInner {
    identity: Arc<dyn IdentityProvider>,
    selector: RouterSelector,
    engine: CorrelationEngine,
    processor: Arc<dyn MessageProcessor>,
    settings: BrokerSettings,
    metrics: Option<BrokerMetrics>,
    shutdown: CancellationToken,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point for sending requests and one-way messages. Cloning shares
/// the same broker.
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl MessageBroker {
    /// Start building a broker for the process identified by `identity`.
    pub fn builder(identity: impl IdentityProvider + 'static) -> MessageBrokerBuilder {
        MessageBrokerBuilder {
            identity: Arc::new(identity),
            routers: Vec::new(),
            processor: Arc::new(RejectingProcessor),
            settings: BrokerSettings::default(),
            metrics: None,
        }
    }

    /// Send `content` and, unless one-way, wait for the reply.
    ///
    /// Returns `Ok(None)` for one-way sends and the innermost reply payload
    /// otherwise. A fault in the reply surfaces as
    /// [`BrokerError::RemoteProcessing`].
    pub async fn dispatch(
        &self,
        content: impl Into<Content>,
        options: DispatchOptions,
    ) -> Result<Option<JsonValue>> {
        let outcome = self.inner.dispatch(content.into(), options).await;
        if let Err(err) = &outcome {
            self.inner.record(|m| m.record_failure(err.reason()));
        }
        outcome
    }

    /// Send a request and decode the reply payload into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        content: impl Into<Content>,
        options: DispatchOptions,
    ) -> Result<T> {
        let value = self
            .dispatch(content, options.one_way(false))
            .await?
            .ok_or_else(|| EnvelopeError::Codec("reply carried no payload".into()))?;
        serde_json::from_value(value)
            .map_err(|err| BrokerError::InvalidEnvelope(EnvelopeError::Codec(err.to_string())))
    }

    /// Fire-and-forget send.
    pub async fn send(&self, content: impl Into<Content>, options: DispatchOptions) -> Result<()> {
        self.dispatch(content, options.one_way(true)).await.map(|_| ())
    }

    /// Requests still awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.engine.pending_count()
    }

    /// Endpoint stamped as sender on outgoing envelopes.
    pub fn identity(&self) -> Endpoint {
        self.inner.identity.local_endpoint()
    }

    /// Names of the routers that initialised successfully.
    pub fn active_routers(&self) -> Vec<String> {
        self.inner.selector.active_names()
    }

    /// Whether [`MessageBroker::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel outstanding requests, shut routers down and stop the inbound
    /// loop. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        self.inner.shutdown.cancel();
        let cancelled = self.inner.engine.cancel_all(BrokerError::Shutdown);
        self.inner.record(|m| m.set_pending(0));
        self.inner.selector.shutdown_all().await;

        let task = self.inner.inbound_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "inbound loop ended abnormally");
            }
        }
        info!(endpoint = %self.identity(), cancelled, "message broker stopped");
        Ok(())
    }
}

impl BrokerInner {
    fn record(&self, f: impl FnOnce(&BrokerMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    async fn dispatch(&self, content: Content, options: DispatchOptions) -> Result<Option<JsonValue>> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        let DispatchOptions {
            recipients,
            timeout,
            cancellation,
            one_way,
        } = options;
        let timeout = (!one_way).then(|| timeout.unwrap_or(self.settings.default_timeout));
        let envelope = Envelope::new(
            content,
            self.identity.local_endpoint(),
            EnvelopeOptions::new()
                .to_all(recipients)
                .timeout_opt(timeout)
                .one_way(one_way),
        )?;

        // Routing is decided before anything is registered, so an
        // unroutable request never leaves a pending entry behind.
        let routes = self.selector.select(&envelope.recipients)?;

        if one_way {
            self.send_routes(&routes, &envelope).await?;
            return Ok(None);
        }

        let request_id = envelope.id;
        let started = Instant::now();
        let mut awaiter = self.engine.register(request_id, timeout)?;
        if self.shutdown.is_cancelled() {
            // Shutdown already swept the table; this entry arrived too late.
            self.engine.cancel(request_id, BrokerError::Shutdown);
            return Err(BrokerError::Shutdown);
        }
        self.record(|m| m.set_pending(self.engine.pending_count()));

        if let Err(err) = self.send_routes(&routes, &envelope).await {
            self.engine.cancel(request_id, err.clone());
            self.record(|m| m.set_pending(self.engine.pending_count()));
            return Err(err);
        }

        let outcome = match cancellation {
            Some(token) => {
                let early = tokio::select! {
                    outcome = &mut awaiter => Some(outcome),
                    _ = token.cancelled() => None,
                };
                match early {
                    Some(outcome) => outcome,
                    None => {
                        // A reply may still win the race inside the engine.
                        self.engine
                            .cancel(request_id, BrokerError::Cancelled { request_id });
                        awaiter.await
                    }
                }
            }
            None => awaiter.await,
        };
        self.record(|m| m.set_pending(self.engine.pending_count()));

        let reply = outcome?;
        debug!(
            request_id = %request_id,
            reply_id = %reply.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request resolved"
        );
        match reply.innermost_content() {
            Content::Payload(value) => {
                self.record(|m| m.observe_round_trip(started.elapsed().as_secs_f64()));
                Ok(Some(value.clone()))
            }
            Content::Fault(fault) => Err(BrokerError::RemoteProcessing(fault.clone())),
            Content::Nested(_) => Err(EnvelopeError::Codec("unexpected nested reply".into()).into()),
        }
    }

    async fn send_routes(&self, routes: &[Route], envelope: &Envelope) -> Result<()> {
        for route in routes {
            let narrowed = envelope.narrowed_to(route.recipients.clone());
            self.send_via(route.router.as_ref(), narrowed).await?;
        }
        Ok(())
    }

    async fn send_via(&self, router: &dyn Router, envelope: Envelope) -> Result<()> {
        let kind = envelope.kind();
        let recipients: Vec<Endpoint> = envelope.recipients.iter().cloned().collect();
        match router.dispatch(envelope).await {
            Ok(RoutingInstruction::None) => {
                self.record(|m| m.record_dispatch(router.name(), kind));
                Ok(())
            }
            Ok(RoutingInstruction::Unroutable) => Err(BrokerError::Unroutable { recipients }),
            Err(source) => Err(BrokerError::Transport {
                router: router.name().to_owned(),
                source,
            }),
        }
    }

    fn handle_inbound(self: &Arc<Self>, inbound: InboundEnvelope) {
        let InboundEnvelope { router, envelope } = inbound;
        self.record(|m| m.record_inbound(&router, envelope.kind()));

        if let Some(request_id) = envelope.reply_to_id {
            match self.engine.complete(request_id, envelope) {
                Completion::Resolved => self.record(|m| m.record_resolved()),
                Completion::Unknown => {
                    debug!(request_id = %request_id, router = %router, "dropping reply without pending request");
                    self.record(|m| m.record_unknown());
                }
            }
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move { inner.process_request(router, envelope).await });
    }

    async fn process_request(&self, router: Arc<str>, request: Envelope) {
        let result = self
            .processor
            .process(request.innermost_content().clone(), &request.sender)
            .await;

        if request.is_one_way {
            if let Err(fault) = result {
                debug!(message_id = %request.id, fault = %fault, "one-way message processing failed");
            }
            return;
        }

        let content = match result {
            Ok(JsonValue::Null) => Content::Fault(RemoteFault::new(
                EMPTY_REPLY,
                "processor returned no content",
            )),
            Ok(value) => Content::Payload(value),
            Err(fault) => Content::Fault(fault),
        };
        let reply = match Envelope::reply(&request, self.identity.local_endpoint(), content) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(request_id = %request.id, error = %err, "could not build reply");
                return;
            }
        };

        let delivered = match self.selector.active_router(&router) {
            Some(origin) if origin.can_handle(&reply.recipients) => {
                self.send_via(origin.as_ref(), reply).await
            }
            _ => match self.selector.select(&reply.recipients) {
                Ok(routes) => self.send_routes(&routes, &reply).await,
                Err(err) => Err(err.into()),
            },
        };
        if let Err(err) = delivered {
            warn!(request_id = %request.id, error = %err, "reply could not be delivered");
        }
    }
}

async fn run_inbound(inner: Arc<BrokerInner>, mut rx: mpsc::Receiver<InboundEnvelope>) {
    loop {
        let inbound = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(inbound) => inbound,
                None => break,
            },
        };
        inner.handle_inbound(inbound);
    }
    debug!("inbound loop stopped");
}
