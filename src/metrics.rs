//! Prometheus instrumentation.
//!
//! The delta FIFO is the only unbounded queue in the engine, so its depth
//! is exported as a gauge; the repository layer counts reconcile outcomes
//! so dashboards can tell real churn from no-op resyncs.

use prometheus::{GaugeVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::OnceLock;

pub struct Metrics {
    registry: Registry,
    /// Delta FIFO depth, labelled by resource kind.
    pub fifo_depth: IntGaugeVec,
    /// Repository outcomes, labelled by kind and outcome
    /// (inserted/updated/unchanged/deleted).
    pub reconcile_total: IntCounterVec,
    /// Template sync queue depth.
    pub sync_queue_depth: IntGauge,
    /// Terminal sync task outcomes, labelled completed/failed.
    pub sync_tasks_total: IntCounterVec,
    /// Aggregate capacity per cluster from the cluster-wide resource
    /// listing, labelled by cluster name and resource (cpu/memory/disk).
    pub cluster_capacity: GaugeVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let fifo_depth = IntGaugeVec::new(
            Opts::new("virtfleet_delta_fifo_depth", "Pending deltas per kind"),
            &["kind"],
        )
        .expect("static metric definition");
        let reconcile_total = IntCounterVec::new(
            Opts::new("virtfleet_reconcile_total", "Repository writes by outcome"),
            &["kind", "outcome"],
        )
        .expect("static metric definition");
        let sync_queue_depth = IntGauge::new(
            "virtfleet_sync_queue_depth",
            "Template sync tasks waiting in the queue",
        )
        .expect("static metric definition");
        let sync_tasks_total = IntCounterVec::new(
            Opts::new("virtfleet_sync_tasks_total", "Terminal sync task outcomes"),
            &["outcome"],
        )
        .expect("static metric definition");
        let cluster_capacity = GaugeVec::new(
            Opts::new("virtfleet_cluster_capacity", "Aggregate cluster capacity"),
            &["cluster", "resource"],
        )
        .expect("static metric definition");

        for collector in [
            Box::new(fifo_depth.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(reconcile_total.clone()),
            Box::new(sync_queue_depth.clone()),
            Box::new(sync_tasks_total.clone()),
            Box::new(cluster_capacity.clone()),
        ] {
            registry
                .register(collector)
                .expect("metrics registered once");
        }

        Self {
            registry,
            fifo_depth,
            reconcile_total,
            sync_queue_depth,
            sync_tasks_total,
            cluster_capacity,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Process-wide metrics handle.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}
