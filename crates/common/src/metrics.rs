use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Process-wide metrics registry shared by every component.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    region_heartbeat: CounterVec,
    region_heartbeat_latency_seconds: HistogramVec,
    region_heartbeat_handle_seconds: HistogramVec,
    store_heartbeat: CounterVec,
    tso_events: CounterVec,
    tso_handle_seconds: HistogramVec,
    operator_events: CounterVec,
    operators_inflight: GaugeVec,
    scheduler_events: CounterVec,
    forward_events: CounterVec,
    cluster_leader: GaugeVec,
}

impl MetricsRegistry {
    /// Creates a registry with every metric family registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Counts one region heartbeat by reporting store and handling status.
    pub fn inc_region_heartbeat(&self, address: &str, store_id: u64, status: &str) {
        self.inner
            .region_heartbeat
            .with_label_values(&[address, &store_id.to_string(), status])
            .inc();
    }

    /// Records the report-to-receipt latency of one region heartbeat.
    pub fn observe_region_heartbeat_latency(&self, address: &str, store_id: u64, secs: f64) {
        self.inner
            .region_heartbeat_latency_seconds
            .with_label_values(&[address, &store_id.to_string()])
            .observe(secs.max(0.0));
    }

    /// Records the time spent applying one region heartbeat.
    pub fn observe_region_heartbeat_handle(&self, address: &str, store_id: u64, secs: f64) {
        self.inner
            .region_heartbeat_handle_seconds
            .with_label_values(&[address, &store_id.to_string()])
            .observe(secs.max(0.0));
    }

    /// Counts one store heartbeat.
    pub fn inc_store_heartbeat(&self, address: &str, store_id: u64) {
        self.inner
            .store_heartbeat
            .with_label_values(&[address, &store_id.to_string()])
            .inc();
    }

    /// Counts one TSO allocator lifecycle event.
    pub fn inc_tso_event(&self, event: &str) {
        self.inner.tso_events.with_label_values(&[event]).inc();
    }

    /// Records one TSO request handling time by serving path.
    pub fn observe_tso_handle(&self, path: &str, secs: f64) {
        self.inner
            .tso_handle_seconds
            .with_label_values(&[path])
            .observe(secs.max(0.0));
    }

    /// Counts one operator lifecycle event by description.
    pub fn inc_operator_event(&self, desc: &str, event: &str) {
        self.inner
            .operator_events
            .with_label_values(&[desc, event])
            .inc();
    }

    /// Publishes the number of live operators of one kind.
    pub fn set_operators_inflight(&self, kind: &str, count: u64) {
        self.inner
            .operators_inflight
            .with_label_values(&[kind])
            .set(count as f64);
    }

    /// Counts one scheduler tick outcome.
    pub fn inc_scheduler_event(&self, scheduler: &str, event: &str) {
        self.inner
            .scheduler_events
            .with_label_values(&[scheduler, event])
            .inc();
    }

    /// Counts one forwarding-layer event.
    pub fn inc_forward_event(&self, event: &str) {
        self.inner.forward_events.with_label_values(&[event]).inc();
    }

    /// Publishes whether a member currently serves as leader.
    pub fn set_leader(&self, member: &str, is_leader: bool) {
        self.inner
            .cluster_leader
            .with_label_values(&[member])
            .set(if is_leader { 1.0 } else { 0.0 });
    }

    /// Renders every family in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let region_heartbeat = counter_vec(
            &registry,
            "rk_region_heartbeat_total",
            "Region heartbeats by reporting store and handling status",
            &["address", "store", "status"],
        );
        let region_heartbeat_latency_seconds = histogram_vec(
            &registry,
            "rk_region_heartbeat_latency_seconds",
            "Report-to-receipt latency of region heartbeats",
            &["address", "store"],
        );
        let region_heartbeat_handle_seconds = histogram_vec(
            &registry,
            "rk_region_heartbeat_handle_seconds",
            "Time spent applying one region heartbeat",
            &["address", "store"],
        );
        let store_heartbeat = counter_vec(
            &registry,
            "rk_store_heartbeat_total",
            "Store heartbeats received",
            &["address", "store"],
        );
        let tso_events = counter_vec(
            &registry,
            "rk_tso_events_total",
            "TSO allocator lifecycle events",
            &["event"],
        );
        let tso_handle_seconds = histogram_vec(
            &registry,
            "rk_tso_handle_seconds",
            "TSO request handling time by serving path",
            &["path"],
        );
        let operator_events = counter_vec(
            &registry,
            "rk_operator_events_total",
            "Operator lifecycle events by description",
            &["desc", "event"],
        );
        let operators_inflight = gauge_vec(
            &registry,
            "rk_operators_inflight",
            "Currently tracked operators by kind",
            &["kind"],
        );
        let scheduler_events = counter_vec(
            &registry,
            "rk_scheduler_events_total",
            "Scheduler tick outcomes",
            &["scheduler", "event"],
        );
        let forward_events = counter_vec(
            &registry,
            "rk_forward_events_total",
            "Forwarding-layer events",
            &["event"],
        );
        let cluster_leader = gauge_vec(
            &registry,
            "rk_cluster_leader",
            "Whether this member currently serves as leader",
            &["member"],
        );

        Self {
            registry,
            region_heartbeat,
            region_heartbeat_latency_seconds,
            region_heartbeat_handle_seconds,
            store_heartbeat,
            tso_events,
            tso_handle_seconds,
            operator_events,
            operators_inflight,
            scheduler_events,
            forward_events,
            cluster_leader,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// The process-wide registry, created on first use.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
