//! ---
//! courier_section: "15-testing-qa-runbook"
//! courier_subsection: "integration-tests"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Multi-broker request/reply scenarios over in-memory transports."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_broker::{BrokerError, DispatchOptions, FnProcessor, MessageBroker};
use courier_msg::{Content, Endpoint, RemoteFault};
use courier_router::{
    InProcessRouter, MemoryBus, MemoryQueues, PubSubRouter, QueueRouter, TransportError,
};
use serde_json::{json, Value};

/// Processor answering `{"add": [a, b]}` and counting every call.
fn adder(
    calls: Arc<AtomicUsize>,
    name: &'static str,
) -> FnProcessor<impl Fn(Content, &Endpoint) -> Result<Value, RemoteFault> + Send + Sync> {
    FnProcessor::new(move |content: Content, _sender: &Endpoint| {
        calls.fetch_add(1, Ordering::SeqCst);
        let Content::Payload(value) = content else {
            return Err(RemoteFault::new("unsupported", "payload expected"));
        };
        let sum = value["add"]
            .as_array()
            .map(|terms| terms.iter().filter_map(Value::as_i64).sum::<i64>());
        match sum {
            Some(sum) => Ok(json!({ "sum": sum, "by": name })),
            None => Ok(json!({ "ack": name })),
        }
    })
}

async fn pubsub_broker(
    bus: &MemoryBus,
    identity: Endpoint,
    calls: Arc<AtomicUsize>,
    name: &'static str,
) -> MessageBroker {
    MessageBroker::builder(identity)
        .router(InProcessRouter::new(), 100)
        .router(PubSubRouter::new(bus.clone()).with_channels(["alerts".to_owned()]), 50)
        .processor(adder(calls, name))
        .start()
        .await
        .expect("broker starts")
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_reply_across_pubsub() {
    let bus = MemoryBus::new();
    let billing_calls = Arc::new(AtomicUsize::new(0));
    let ledger_calls = Arc::new(AtomicUsize::new(0));
    let billing = pubsub_broker(
        &bus,
        Endpoint::instance("billing", "b1"),
        billing_calls.clone(),
        "billing",
    )
    .await;
    let ledger = pubsub_broker(
        &bus,
        Endpoint::instance("ledger", "l1"),
        ledger_calls.clone(),
        "ledger",
    )
    .await;

    let reply = billing
        .dispatch(
            json!({"add": [2, 3]}),
            DispatchOptions::new()
                .to(Endpoint::app("ledger"))
                .timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    assert_eq!(reply, Some(json!({"sum": 5, "by": "ledger"})));
    assert_eq!(ledger_calls.load(Ordering::SeqCst), 1);
    assert_eq!(billing_calls.load(Ordering::SeqCst), 0);
    assert_eq!(billing.pending_requests(), 0);

    ledger.shutdown().await.unwrap();
    billing.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_reply_across_queues() {
    let queues = MemoryQueues::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for instance in ["l1", "l2"] {
        workers.push(
            MessageBroker::builder(Endpoint::instance("ledger", instance))
                .router(QueueRouter::new(queues.clone()), 0)
                .processor(adder(calls.clone(), "ledger"))
                .start()
                .await
                .unwrap(),
        );
    }
    let client = MessageBroker::builder(Endpoint::instance("billing", "b1"))
        .router(QueueRouter::new(queues.clone()), 0)
        .start()
        .await
        .unwrap();

    for i in 0..6i64 {
        let reply = client
            .dispatch(
                json!({"add": [i, 1]}),
                DispatchOptions::new()
                    .to(Endpoint::app("ledger"))
                    .timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(reply.unwrap()["sum"], json!(i + 1));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 6, "each request handled by exactly one worker");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_reaches_every_participant_once() {
    let bus = MemoryBus::new();
    let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let mut brokers = Vec::new();
    for (i, calls) in counters.iter().enumerate() {
        brokers.push(
            pubsub_broker(
                &bus,
                Endpoint::instance("node", format!("n{i}")),
                calls.clone(),
                "node",
            )
            .await,
        );
    }

    brokers[0]
        .send(json!({"notice": "maintenance"}), DispatchOptions::new())
        .await
        .unwrap();

    assert!(eventually(|| counters.iter().all(|c| c.load(Ordering::SeqCst) == 1)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    for calls in &counters {
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recipients_split_across_routers() {
    let bus = MemoryBus::new();
    let queues = MemoryQueues::new();
    let ledger_calls = Arc::new(AtomicUsize::new(0));
    let watcher_calls = Arc::new(AtomicUsize::new(0));

    let _ledger = MessageBroker::builder(Endpoint::instance("ledger", "l1"))
        .router(QueueRouter::new(queues.clone()), 20)
        .processor(adder(ledger_calls.clone(), "ledger"))
        .start()
        .await
        .unwrap();
    let _watcher = pubsub_broker(
        &bus,
        Endpoint::instance("ops", "w1"),
        watcher_calls.clone(),
        "ops",
    )
    .await;
    let sender = MessageBroker::builder(Endpoint::instance("billing", "b1"))
        .router(QueueRouter::new(queues.clone()), 20)
        .router(PubSubRouter::new(bus.clone()), 10)
        .start()
        .await
        .unwrap();

    sender
        .send(
            json!({"event": "invoice.created"}),
            DispatchOptions::new()
                .to(Endpoint::app("ledger"))
                .to(Endpoint::channel("alerts")),
        )
        .await
        .unwrap();

    assert!(
        eventually(|| {
            ledger_calls.load(Ordering::SeqCst) == 1 && watcher_calls.load(Ordering::SeqCst) == 1
        })
        .await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bus_outage_surfaces_transport_error() {
    let bus = MemoryBus::new();
    let billing = pubsub_broker(
        &bus,
        Endpoint::instance("billing", "b1"),
        Arc::new(AtomicUsize::new(0)),
        "billing",
    )
    .await;
    bus.close();

    let err = billing
        .dispatch(json!("ping"), DispatchOptions::new().to(Endpoint::app("ledger")))
        .await
        .unwrap_err();
    match err {
        BrokerError::Transport { router, source } => {
            assert_eq!(router, "pubsub");
            assert!(matches!(source, TransportError::Unavailable(_)));
        }
        other => panic!("expected transport failure, got {other:?}"),
    }
    assert_eq!(billing.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn absent_peer_times_out_cleanly() {
    let bus = MemoryBus::new();
    let billing = pubsub_broker(
        &bus,
        Endpoint::instance("billing", "b1"),
        Arc::new(AtomicUsize::new(0)),
        "billing",
    )
    .await;

    let err = billing
        .dispatch(
            json!("ping"),
            DispatchOptions::new()
                .to(Endpoint::app("nobody"))
                .timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { .. }));
    assert_eq!(billing.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channel_scoped_application_is_unroutable_over_queues() {
    let queues = MemoryQueues::new();
    let ledger_calls = Arc::new(AtomicUsize::new(0));
    let _ledger = MessageBroker::builder(Endpoint::instance("ledger", "l1"))
        .router(QueueRouter::new(queues.clone()), 0)
        .processor(adder(ledger_calls.clone(), "ledger"))
        .start()
        .await
        .unwrap();
    let billing = MessageBroker::builder(Endpoint::instance("billing", "b1"))
        .router(QueueRouter::new(queues.clone()), 0)
        .start()
        .await
        .unwrap();

    let err = billing
        .dispatch(
            json!({"add": [1, 1]}),
            DispatchOptions::new()
                .to(Endpoint::app("ledger").with_channel("alerts"))
                .timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Unroutable { .. }));
    assert_eq!(billing.pending_requests(), 0);
    assert_eq!(ledger_calls.load(Ordering::SeqCst), 0);
}
