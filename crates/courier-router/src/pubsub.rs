//! ---
//! courier_section: "03-routing-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Topic based router over a publish/subscribe backend."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Pub/sub transport.
//!
//! Every process subscribes to its instance topic, its application topic,
//! one topic per configured channel and the shared broadcast topic.
//! Outbound envelopes are published once per distinct recipient topic.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_msg::{log_envelope, Endpoint, Envelope, MessageDirection, MessageId, Recipients};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    addressed_to, codec, InboundSink, Result, Router, RouterContext, RoutingInstruction,
    TransportError,
};

/// Default name of the pub/sub router.
pub const PUBSUB_ROUTER: &str = "pubsub";
/// Topic every participant listens on for broadcasts.
pub const BROADCAST_TOPIC: &str = "broadcast";

const SUBSCRIPTION_CAPACITY: usize = 256;
const DEDUP_WINDOW: usize = 1024;

/// Stream of raw frames published on one topic.
pub type Subscription = mpsc::Receiver<Bytes>;

/// Minimal publish/subscribe contract a broker transport must offer.
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Publish a frame to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, frame: Bytes) -> Result<()>;

    /// Start receiving frames published on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// In-memory bus shared by every broker in a process. Cloning yields another
/// handle to the same bus.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Debug, Default)]
struct BusInner {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Bytes>>>>,
    closed: AtomicBool,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the bus down: drop every subscription and fail later calls.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.topics.lock().clear();
    }

    /// Whether [`MemoryBus::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Unavailable("memory bus closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubBackend for MemoryBus {
    async fn publish(&self, topic: &str, frame: Bytes) -> Result<()> {
        self.ensure_open()?;
        let subscribers = self
            .inner
            .topics
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default();
        let mut stale = false;
        for subscriber in subscribers {
            if subscriber.send(frame.clone()).await.is_err() {
                stale = true;
            }
        }
        if stale {
            if let Some(subs) = self.inner.topics.lock().get_mut(topic) {
                subs.retain(|tx| !tx.is_closed());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.inner
            .topics
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

/// Topic an envelope for `recipient` is published on. The most specific
/// field wins: instance, then channel, then application.
pub fn topic_for(recipient: &Endpoint) -> String {
    if let Some(instance) = recipient.app_instance_id() {
        format!("instance.{instance}")
    } else if let Some(channel) = recipient.channel_name() {
        format!("channel.{channel}")
    } else if let Some(app) = recipient.app_id() {
        format!("app.{app}")
    } else {
        BROADCAST_TOPIC.to_owned()
    }
}

/// Topics a process with identity `local` listens on.
pub fn topics_for_local(local: &Endpoint, channels: &[String]) -> Vec<String> {
    let mut topics = Vec::new();
    if let Some(instance) = local.app_instance_id() {
        topics.push(format!("instance.{instance}"));
    }
    if let Some(app) = local.app_id() {
        topics.push(format!("app.{app}"));
    }
    topics.extend(channels.iter().map(|channel| format!("channel.{channel}")));
    topics.push(BROADCAST_TOPIC.to_owned());
    topics
}

/// Ids seen recently on any subscription. An envelope addressed through
/// several topics this process listens on is raised once.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl RecentIds {
    fn first_sighting(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > DEDUP_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Router publishing envelopes through a [`PubSubBackend`].
pub struct PubSubRouter {
    name: Arc<str>,
    backend: Arc<dyn PubSubBackend>,
    channels: Vec<String>,
    context: OnceCell<RouterContext>,
    recent: Arc<Mutex<RecentIds>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PubSubRouter {
    /// Router over `backend` with the default name.
    pub fn new(backend: impl PubSubBackend + 'static) -> Self {
        Self {
            name: Arc::from(PUBSUB_ROUTER),
            backend: Arc::new(backend),
            channels: Vec::new(),
            context: OnceCell::new(),
            recent: Arc::new(Mutex::new(RecentIds::default())),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Override the router name.
    pub fn named(mut self, name: impl AsRef<str>) -> Self {
        self.name = Arc::from(name.as_ref());
        self
    }

    /// Channels this process subscribes to.
    pub fn with_channels(mut self, channels: impl IntoIterator<Item = String>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    fn live_context(&self) -> Result<&RouterContext> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable(format!(
                "router {} is shut down",
                self.name
            )));
        }
        self.context
            .get()
            .ok_or_else(|| TransportError::NotInitialized(self.name.to_string()))
    }

    async fn connect(&self, context: RouterContext) -> Result<RouterContext> {
        let topics = topics_for_local(&context.local, &self.channels);
        let mut subscriptions = Vec::with_capacity(topics.len());
        for topic in &topics {
            subscriptions.push(self.backend.subscribe(topic).await?);
        }

        let mut tasks = self.tasks.lock();
        for subscription in subscriptions {
            tasks.push(tokio::spawn(pump(
                self.name.clone(),
                subscription,
                context.local.clone(),
                self.channels.clone(),
                context.inbound.clone(),
                self.recent.clone(),
            )));
        }
        debug!(router = %self.name, topics = ?topics, "pubsub router subscribed");
        Ok(context)
    }
}

async fn pump(
    router: Arc<str>,
    mut subscription: Subscription,
    local: Endpoint,
    channels: Vec<String>,
    sink: InboundSink,
    recent: Arc<Mutex<RecentIds>>,
) {
    while let Some(frame) = subscription.recv().await {
        let envelope = match codec::decode(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(router = %router, error = %err, "dropping undecodable frame");
                continue;
            }
        };
        if envelope.sender == local || !addressed_to(&envelope, &local, &channels) {
            continue;
        }
        if !recent.lock().first_sighting(envelope.id) {
            continue;
        }
        log_envelope(MessageDirection::Inbound, &router, &envelope);
        if sink.deliver(envelope).await.is_err() {
            debug!(router = %router, "inbound channel closed, stopping subscription");
            break;
        }
    }
}

#[async_trait]
impl Router for PubSubRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, _recipients: &Recipients) -> bool {
        self.context.initialized() && !self.closed.load(Ordering::Acquire)
    }

    async fn initialize(&self, context: RouterContext) -> Result<()> {
        self.context
            .get_or_try_init(|| self.connect(context))
            .await?;
        Ok(())
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<RoutingInstruction> {
        self.live_context()?;
        let frame = codec::encode(&envelope)?;
        let topics: BTreeSet<String> = if envelope.recipients.is_empty() {
            BTreeSet::from([BROADCAST_TOPIC.to_owned()])
        } else {
            envelope.recipients.iter().map(topic_for).collect()
        };
        log_envelope(MessageDirection::Outbound, &self.name, &envelope);
        for topic in topics {
            self.backend.publish(&topic, frame.clone()).await?;
        }
        Ok(RoutingInstruction::None)
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}
