//! ---
//! courier_section: "03-routing-transport"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Queue based router with competing consumers."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
//! Work-queue transport.
//!
//! Each application owns a shared queue named after its id, consumed by all
//! of its instances, plus one private queue per instance named
//! `{app}.{instance}`. Only application-qualified recipients are reachable.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_msg::{log_envelope, Endpoint, Envelope, MessageDirection, Recipients};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    addressed_to, codec, InboundSink, Result, Router, RouterContext, RoutingInstruction,
    TransportError,
};

/// Default name of the queue router.
pub const QUEUE_ROUTER: &str = "queue";

/// Durable-queue contract: every frame is consumed by exactly one receiver.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append a frame to `queue`, creating it if needed.
    async fn send(&self, queue: &str, frame: Bytes) -> Result<()>;

    /// Wait for the next frame on `queue`. `None` once the backend closed.
    async fn receive(&self, queue: &str) -> Result<Option<Bytes>>;
}

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Bytes>>>;

/// In-memory queues shared by every broker in a process.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueues {
    inner: Arc<QueuesInner>,
}

#[derive(Debug, Default)]
struct QueuesInner {
    queues: Mutex<HashMap<String, (mpsc::UnboundedSender<Bytes>, SharedReceiver)>>,
    closed: AtomicBool,
}

impl MemoryQueues {
    /// Create an empty set of queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every queue, waking blocked receivers, and fail later calls.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.queues.lock().clear();
    }

    /// Whether [`MemoryQueues::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Unavailable("memory queues closed".into()));
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> (mpsc::UnboundedSender<Bytes>, SharedReceiver) {
        self.inner
            .queues
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Arc::new(AsyncMutex::new(rx)))
            })
            .clone()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueues {
    async fn send(&self, queue: &str, frame: Bytes) -> Result<()> {
        self.ensure_open()?;
        let (tx, _) = self.queue(queue);
        tx.send(frame)
            .map_err(|_| TransportError::Unavailable(format!("queue {queue} dropped")))
    }

    async fn receive(&self, queue: &str) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let (tx, rx) = self.queue(queue);
        drop(tx);
        let mut rx = rx.lock().await;
        Ok(rx.recv().await)
    }
}

/// Queue name for a recipient, if it is reachable over queues.
///
/// Queues carry no channel, so a channel-scoped recipient has no queue even
/// when it names an application.
pub fn queue_for(recipient: &Endpoint) -> Option<String> {
    if recipient.channel_name().is_some() {
        return None;
    }
    let app = recipient.app_id()?;
    Some(match recipient.app_instance_id() {
        Some(instance) => format!("{app}.{instance}"),
        None => app.to_owned(),
    })
}

/// Router sending envelopes through a [`QueueBackend`].
pub struct QueueRouter {
    name: Arc<str>,
    backend: Arc<dyn QueueBackend>,
    context: OnceCell<RouterContext>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl QueueRouter {
    /// Router over `backend` with the default name.
    pub fn new(backend: impl QueueBackend + 'static) -> Self {
        Self {
            name: Arc::from(QUEUE_ROUTER),
            backend: Arc::new(backend),
            context: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Override the router name.
    pub fn named(mut self, name: impl AsRef<str>) -> Self {
        self.name = Arc::from(name.as_ref());
        self
    }

    async fn connect(&self, context: RouterContext) -> Result<RouterContext> {
        let Some(app) = context.local.app_id() else {
            return Err(TransportError::Rejected(
                "queue router needs a local application id".into(),
            ));
        };
        let mut queues = vec![app.to_owned()];
        if let Some(instance) = context.local.app_instance_id() {
            queues.push(format!("{app}.{instance}"));
        }

        let mut tasks = self.tasks.lock();
        for queue in &queues {
            tasks.push(tokio::spawn(consume(
                self.name.clone(),
                self.backend.clone(),
                queue.clone(),
                context.local.clone(),
                context.inbound.clone(),
            )));
        }
        debug!(router = %self.name, queues = ?queues, "queue router consuming");
        Ok(context)
    }
}

async fn consume(
    router: Arc<str>,
    backend: Arc<dyn QueueBackend>,
    queue: String,
    local: Endpoint,
    sink: InboundSink,
) {
    loop {
        let frame = match backend.receive(&queue).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                debug!(router = %router, queue = %queue, error = %err, "queue consumer stopped");
                break;
            }
        };
        let envelope = match codec::decode(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(router = %router, queue = %queue, error = %err, "dropping undecodable frame");
                continue;
            }
        };
        if !addressed_to(&envelope, &local, &[]) {
            continue;
        }
        log_envelope(MessageDirection::Inbound, &router, &envelope);
        if sink.deliver(envelope).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Router for QueueRouter {
    fn name(&self) -> &str {
        &self.name
    }

    /// Queues have no broadcast form and need an application, and no
    /// channel, on every recipient.
    fn can_handle(&self, recipients: &Recipients) -> bool {
        self.context.initialized()
            && !self.closed.load(Ordering::Acquire)
            && !recipients.is_empty()
            && recipients.iter().all(|r| queue_for(r).is_some())
    }

    async fn initialize(&self, context: RouterContext) -> Result<()> {
        self.context
            .get_or_try_init(|| self.connect(context))
            .await?;
        Ok(())
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<RoutingInstruction> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable(format!(
                "router {} is shut down",
                self.name
            )));
        }
        if !self.context.initialized() {
            return Err(TransportError::NotInitialized(self.name.to_string()));
        }
        let queues: Option<BTreeSet<String>> = envelope.recipients.iter().map(queue_for).collect();
        let queues = match queues {
            Some(queues) if !queues.is_empty() => queues,
            _ => return Ok(RoutingInstruction::Unroutable),
        };
        let frame = codec::encode(&envelope)?;
        log_envelope(MessageDirection::Outbound, &self.name, &envelope);
        for queue in queues {
            self.backend.send(&queue, frame.clone()).await?;
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
