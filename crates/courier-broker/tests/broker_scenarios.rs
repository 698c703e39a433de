//! ---
//! courier_section: "04-broker-correlation"
//! courier_subsection: "tests"
//! courier_type: "source"
//! courier_scope: "test"
//! courier_description: "Request/reply scenarios against scripted routers."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use async_trait::async_trait;
use courier_broker::{
    BrokerError, BrokerMetrics, BrokerSettings, CancellationToken, DispatchOptions, FnProcessor,
    MessageBroker, NO_PROCESSOR,
};
use courier_metrics::new_registry;
use courier_msg::{Content, Endpoint, Envelope, Recipients, RemoteFault};
use courier_router::{
    InProcessRouter, Router, RouterContext, RoutingInstruction, TransportError,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

fn remote() -> Endpoint {
    Endpoint::instance("ledger", "l1")
}

fn local() -> Endpoint {
    Endpoint::instance("billing", "b1")
}

/// Router that answers requests before `dispatch` returns.
#[derive(Default)]
struct ScriptedRouter {
    replies_per_request: usize,
    answer_one_way: bool,
    fail: bool,
    dispatched: AtomicUsize,
    context: Mutex<Option<RouterContext>>,
}

impl ScriptedRouter {
    fn replying(replies_per_request: usize) -> Self {
        Self {
            replies_per_request,
            ..Self::default()
        }
    }

    /// Also answers one-way envelopes, which nobody is waiting for.
    fn chatty() -> Self {
        Self {
            replies_per_request: 1,
            answer_one_way: true,
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Router for ScriptedRouter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn can_handle(&self, recipients: &Recipients) -> bool {
        !recipients.is_empty() && recipients.iter().all(|r| r.app_id() == Some("ledger"))
    }

    async fn initialize(&self, context: RouterContext) -> courier_router::Result<()> {
        *self.context.lock() = Some(context);
        Ok(())
    }

    async fn dispatch(&self, envelope: Envelope) -> courier_router::Result<RoutingInstruction> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(TransportError::Unavailable("link down".into()));
        }
        if envelope.is_one_way && !self.answer_one_way {
            return Ok(RoutingInstruction::None);
        }
        let sink = self
            .context
            .lock()
            .as_ref()
            .map(|context| context.inbound.clone())
            .ok_or_else(|| TransportError::NotInitialized("scripted".into()))?;
        for _ in 0..self.replies_per_request {
            let reply = Envelope::reply(&envelope, remote(), json!({"pong": true}))
                .map_err(|err| TransportError::Codec(err.to_string()))?;
            sink.deliver(reply).await?;
        }
        Ok(RoutingInstruction::None)
    }

    async fn shutdown(&self) -> courier_router::Result<()> {
        Ok(())
    }
}

async fn broker_with(router: Arc<ScriptedRouter>) -> MessageBroker {
    MessageBroker::builder(local())
        .shared_router(router, 10)
        .router(InProcessRouter::new(), 100)
        .start()
        .await
        .expect("broker starts")
}

#[tokio::test]
async fn reply_raised_during_dispatch_is_correlated() {
    let broker = broker_with(Arc::new(ScriptedRouter::replying(1))).await;
    let reply = broker
        .dispatch(json!("ping"), DispatchOptions::new().to(remote()))
        .await
        .unwrap();
    assert_eq!(reply, Some(json!({"pong": true})));
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn ping_pong_through_the_local_process() {
    let broker = MessageBroker::builder(local())
        .router(InProcessRouter::new(), 100)
        .processor(FnProcessor::new(|content: Content, _sender: &Endpoint| {
            match content {
                Content::Payload(Value::String(s)) if s == "ping" => Ok(json!("pong")),
                _ => Err(RemoteFault::new("unexpected", "only ping is supported")),
            }
        }))
        .start()
        .await
        .unwrap();

    let pong: String = broker
        .request(json!("ping"), DispatchOptions::new().to(Endpoint::app("billing")))
        .await
        .unwrap();
    assert_eq!(pong, "pong");

    let err = broker
        .dispatch(json!(42), DispatchOptions::new().to(local()))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::RemoteProcessing(ref fault) if fault.code == "unexpected"));
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn default_processor_rejects_requests() {
    let broker = MessageBroker::builder(local())
        .router(InProcessRouter::new(), 0)
        .start()
        .await
        .unwrap();
    let err = broker
        .dispatch(json!("ping"), DispatchOptions::new().to(local()))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::RemoteProcessing(ref fault) if fault.code == NO_PROCESSOR));
}

#[tokio::test]
async fn one_way_returns_after_transport_success() {
    let router = Arc::new(ScriptedRouter::replying(0));
    let broker = broker_with(router.clone()).await;
    let outcome = broker
        .dispatch(json!("fyi"), DispatchOptions::new().to(remote()).one_way(true))
        .await
        .unwrap();
    assert_eq!(outcome, None);
    assert_eq!(router.dispatched.load(Ordering::SeqCst), 1);
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn unroutable_fails_without_registration() {
    let router = Arc::new(ScriptedRouter::replying(1));
    let broker = broker_with(router.clone()).await;
    let err = broker
        .dispatch(json!("ping"), DispatchOptions::new().to(Endpoint::app("crm")))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Unroutable { ref recipients } if recipients == &vec![Endpoint::app("crm")]));
    assert_eq!(router.dispatched.load(Ordering::SeqCst), 0);
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn broker_without_routers_fails_fast() {
    let broker = MessageBroker::builder(local()).start().await.unwrap();
    assert!(broker.active_routers().is_empty());
    let err = broker
        .dispatch(json!("ping"), DispatchOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Unroutable { .. }));
}

#[tokio::test]
async fn silent_peer_times_out_and_leaves_nothing_pending() {
    let metrics = BrokerMetrics::new(new_registry()).unwrap();
    let broker = MessageBroker::builder(local())
        .router(ScriptedRouter::replying(0), 0)
        .metrics(metrics.clone())
        .start()
        .await
        .unwrap();
    let err = broker
        .dispatch(
            json!("ping"),
            DispatchOptions::new()
                .to(remote())
                .timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { after, .. } if after == Duration::from_millis(50)));
    assert!(err.is_retryable());
    assert_eq!(broker.pending_requests(), 0);
    assert_eq!(metrics.failures("timeout"), 1);
}

#[tokio::test(start_paused = true)]
async fn configured_default_timeout_applies() {
    let broker = MessageBroker::builder(local())
        .router(ScriptedRouter::replying(0), 0)
        .config(BrokerSettings {
            default_timeout: Duration::from_secs(2),
            ..BrokerSettings::default()
        })
        .start()
        .await
        .unwrap();
    let err = broker
        .dispatch(json!("ping"), DispatchOptions::new().to(remote()))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { after, .. } if after == Duration::from_secs(2)));
}

#[tokio::test]
async fn duplicate_reply_is_dropped_and_counted() {
    let metrics = BrokerMetrics::new(new_registry()).unwrap();
    let broker = MessageBroker::builder(local())
        .router(ScriptedRouter::replying(2), 0)
        .metrics(metrics.clone())
        .start()
        .await
        .unwrap();
    let reply = broker
        .dispatch(json!("ping"), DispatchOptions::new().to(remote()))
        .await
        .unwrap();
    assert_eq!(reply, Some(json!({"pong": true})));

    for _ in 0..100 {
        if metrics.unknown_correlations() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(metrics.unknown_correlations(), 1);
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn transport_failure_cancels_registration() {
    let broker = MessageBroker::builder(local())
        .router(ScriptedRouter::failing(), 0)
        .start()
        .await
        .unwrap();
    let err = broker
        .dispatch(json!("ping"), DispatchOptions::new().to(remote()))
        .await
        .unwrap_err();
    match err {
        BrokerError::Transport { router, source } => {
            assert_eq!(router, "scripted");
            assert_eq!(source, TransportError::Unavailable("link down".into()));
        }
        other => panic!("expected transport error, got {other:?}"),
    }
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn caller_cancellation_resolves_request() {
    let broker = MessageBroker::builder(local())
        .router(ScriptedRouter::replying(0), 0)
        .start()
        .await
        .unwrap();
    let token = CancellationToken::new();
    let call = {
        let broker = broker.clone();
        let token = token.clone();
        tokio::spawn(async move {
            broker
                .dispatch(
                    json!("ping"),
                    DispatchOptions::new().to(remote()).cancellation(token),
                )
                .await
        })
    };
    while broker.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }
    token.cancel();
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::Cancelled { .. }));
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn shutdown_cancels_outstanding_requests() {
    let broker = MessageBroker::builder(local())
        .router(ScriptedRouter::replying(0), 0)
        .start()
        .await
        .unwrap();
    let call = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .dispatch(json!("ping"), DispatchOptions::new().to(remote()))
                .await
        })
    };
    while broker.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }
    broker.shutdown().await.unwrap();
    assert!(matches!(call.await.unwrap(), Err(BrokerError::Shutdown)));
    assert!(broker.is_shut_down());
    assert!(matches!(
        broker.send(json!("late"), DispatchOptions::new().to(remote())).await,
        Err(BrokerError::Shutdown)
    ));
}

#[tokio::test]
async fn unsolicited_reply_to_one_way_is_unknown() {
    let metrics = BrokerMetrics::new(new_registry()).unwrap();
    let router = Arc::new(ScriptedRouter::chatty());
    let broker = MessageBroker::builder(local())
        .shared_router(router.clone(), 0)
        .metrics(metrics.clone())
        .start()
        .await
        .unwrap();

    let outcome = broker
        .dispatch(json!("fyi"), DispatchOptions::new().to(remote()).one_way(true))
        .await
        .unwrap();
    assert_eq!(outcome, None);
    assert_eq!(router.dispatched.load(Ordering::SeqCst), 1);

    for _ in 0..100 {
        if metrics.unknown_correlations() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(metrics.unknown_correlations(), 1);
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn ping_pong_by_instance_id() {
    let broker = MessageBroker::builder(local())
        .router(InProcessRouter::new(), 100)
        .processor(FnProcessor::new(|content: Content, _sender: &Endpoint| {
            match content {
                Content::Payload(Value::String(s)) if s == "ping" => Ok(json!("pong")),
                _ => Err(RemoteFault::new("unexpected", "only ping is supported")),
            }
        }))
        .start()
        .await
        .unwrap();

    let reply = broker
        .dispatch(
            json!("ping"),
            DispatchOptions::new()
                .to(Endpoint::instance_id("b1"))
                .timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(reply, Some(json!("pong")));
    assert_eq!(broker.pending_requests(), 0);
}

#[tokio::test]
async fn unbounded_timeout_waits_for_cancellation() {
    let broker = MessageBroker::builder(local())
        .router(ScriptedRouter::replying(0), 0)
        .start()
        .await
        .unwrap();
    let token = CancellationToken::new();
    let call = {
        let broker = broker.clone();
        let token = token.clone();
        tokio::spawn(async move {
            broker
                .dispatch(
                    json!("ping"),
                    DispatchOptions::new()
                        .to(remote())
                        .timeout(Duration::MAX)
                        .cancellation(token),
                )
                .await
        })
    };
    while broker.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }
    token.cancel();
    let err = call.await.expect("dispatch task completes").unwrap_err();
    assert!(matches!(err, BrokerError::Cancelled { .. }));
    assert_eq!(broker.pending_requests(), 0);
}

/// Holds the first routing decision until the router is shut down.
struct GatedRouter {
    entered: Mutex<Option<std_mpsc::Sender<()>>>,
    release: Mutex<Option<std_mpsc::Receiver<()>>>,
    release_tx: Mutex<Option<std_mpsc::Sender<()>>>,
}

#[async_trait]
impl Router for GatedRouter {
    fn name(&self) -> &str {
        "gated"
    }

    fn can_handle(&self, _recipients: &Recipients) -> bool {
        if let Some(entered) = self.entered.lock().take() {
            let _ = entered.send(());
            if let Some(release) = self.release.lock().take() {
                let _ = release.recv_timeout(Duration::from_secs(5));
            }
        }
        true
    }

    async fn initialize(&self, _context: RouterContext) -> courier_router::Result<()> {
        Ok(())
    }

    async fn dispatch(&self, _envelope: Envelope) -> courier_router::Result<RoutingInstruction> {
        Ok(RoutingInstruction::None)
    }

    async fn shutdown(&self) -> courier_router::Result<()> {
        if let Some(release) = self.release_tx.lock().take() {
            let _ = release.send(());
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_routing_fails_the_request() {
    let (entered_tx, entered_rx) = std_mpsc::channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let broker = MessageBroker::builder(local())
        .router(
            GatedRouter {
                entered: Mutex::new(Some(entered_tx)),
                release: Mutex::new(Some(release_rx)),
                release_tx: Mutex::new(Some(release_tx)),
            },
            0,
        )
        .start()
        .await
        .unwrap();

    let call = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .dispatch(json!("ping"), DispatchOptions::new().to(remote()))
                .await
        })
    };
    tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("dispatch reached routing");

    broker.shutdown().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("dispatch does not wait for the default timeout")
        .unwrap();
    assert!(matches!(outcome, Err(BrokerError::Shutdown)));
    assert_eq!(broker.pending_requests(), 0);
}
