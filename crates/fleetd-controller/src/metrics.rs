//! Process metrics (SPEC_FULL §0: "`prometheus` gauges/counters for
//! per-node connection counts, pending-command counts and forward
//! latencies"), following `kimberlite-server`'s declared `prometheus`
//! dependency.
//!
//! These are sampled by a background tick in `main` rather than threaded
//! through every crate's call sites, keeping the metric surface a thin
//! read-side view over state the rest of the binary already owns
//! (`AgentSessionTable`, `SnapshotCache`, `Forwarder`).

use prometheus::{Gauge, Histogram, HistogramOpts, IntGauge, Registry};

pub struct Metrics {
    registry: Registry,
    pub connected_agents: IntGauge,
    pub open_snapshots: IntGauge,
    pub forward_pool_size: Gauge,
    pub forward_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connected_agents = IntGauge::new("fleetd_connected_agents", "Agents with a live CommandStream").expect("valid metric");
        let open_snapshots = IntGauge::new("fleetd_open_snapshots", "Distinct node-ids currently held in the snapshot cache").expect("valid metric");
        let forward_pool_size = Gauge::new("fleetd_forward_pool_size", "Cached cross-controller forward connections").expect("valid metric");
        let forward_latency_seconds =
            Histogram::with_opts(HistogramOpts::new("fleetd_forward_latency_seconds", "Latency of ForwardCommand calls to peer controllers"))
                .expect("valid metric");

        registry.register(Box::new(connected_agents.clone())).expect("register metric");
        registry.register(Box::new(open_snapshots.clone())).expect("register metric");
        registry.register(Box::new(forward_pool_size.clone())).expect("register metric");
        registry.register(Box::new(forward_latency_seconds.clone())).expect("register metric");

        Self { registry, connected_agents, open_snapshots, forward_pool_size, forward_latency_seconds }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_start_at_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.connected_agents.get(), 0);
        assert_eq!(metrics.open_snapshots.get(), 0);
        assert_eq!(metrics.registry().gather().len(), 4);
    }
}
