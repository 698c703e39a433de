//! ---
//! courier_section: "04-broker-correlation"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Prometheus instrumentation for broker traffic."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use courier_metrics::SharedRegistry;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts};

/// Counters and gauges describing broker traffic.
#[derive(Clone, Debug)]
pub struct BrokerMetrics {
    registry: SharedRegistry,
    dispatched: IntCounterVec,
    inbound: IntCounterVec,
    replies_resolved: IntCounter,
    unknown_correlations: IntCounter,
    failures: IntCounterVec,
    pending: IntGauge,
    round_trip_seconds: Histogram,
}

impl BrokerMetrics {
    /// Create the collectors and register them with `registry`.
    pub fn new(registry: SharedRegistry) -> prometheus::Result<Self> {
        let dispatched = IntCounterVec::new(
            Opts::new(
                "courier_envelopes_dispatched_total",
                "Envelopes handed to a router, by router and envelope kind",
            ),
            &["router", "kind"],
        )?;
        registry.register(Box::new(dispatched.clone()))?;

        let inbound = IntCounterVec::new(
            Opts::new(
                "courier_envelopes_inbound_total",
                "Envelopes raised by routers, by router and envelope kind",
            ),
            &["router", "kind"],
        )?;
        registry.register(Box::new(inbound.clone()))?;

        let replies_resolved = IntCounter::with_opts(Opts::new(
            "courier_replies_resolved_total",
            "Replies that completed a pending request",
        ))?;
        registry.register(Box::new(replies_resolved.clone()))?;

        let unknown_correlations = IntCounter::with_opts(Opts::new(
            "courier_unknown_correlations_total",
            "Replies dropped because no request was pending",
        ))?;
        registry.register(Box::new(unknown_correlations.clone()))?;

        let failures = IntCounterVec::new(
            Opts::new(
                "courier_request_failures_total",
                "Failed dispatches by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(failures.clone()))?;

        let pending = IntGauge::with_opts(Opts::new(
            "courier_pending_requests",
            "Requests awaiting a reply",
        ))?;
        registry.register(Box::new(pending.clone()))?;

        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 16)?;
        let round_trip_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "courier_request_round_trip_seconds",
                "Time from dispatch to reply for successful requests",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(round_trip_seconds.clone()))?;

        Ok(Self {
            registry,
            dispatched,
            inbound,
            replies_resolved,
            unknown_correlations,
            failures,
            pending,
            round_trip_seconds,
        })
    }

    /// Registry the collectors live in.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub(crate) fn record_dispatch(&self, router: &str, kind: &str) {
        self.dispatched.with_label_values(&[router, kind]).inc();
    }

    pub(crate) fn record_inbound(&self, router: &str, kind: &str) {
        self.inbound.with_label_values(&[router, kind]).inc();
    }

    pub(crate) fn record_resolved(&self) {
        self.replies_resolved.inc();
    }

    pub(crate) fn record_unknown(&self) {
        self.unknown_correlations.inc();
    }

    pub(crate) fn record_failure(&self, reason: &str) {
        self.failures.with_label_values(&[reason]).inc();
    }

    pub(crate) fn set_pending(&self, count: usize) {
        self.pending.set(count as i64);
    }

    pub(crate) fn observe_round_trip(&self, seconds: f64) {
        self.round_trip_seconds.observe(seconds);
    }

    /// Total replies dropped as unknown so far.
    pub fn unknown_correlations(&self) -> u64 {
        self.unknown_correlations.get()
    }

    /// Failures recorded for `reason`.
    pub fn failures(&self, reason: &str) -> u64 {
        self.failures.with_label_values(&[reason]).get()
    }
}
