use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Broker/script counters scraped by an embedder (ambient observability,
/// not one of spec.md's excluded non-goals — cross-DC replication,
/// registry HA, exactly-once delivery, flow control, and persistence are
/// the things actually out of scope).
pub struct Metrics {
    pub scripts_invoked: IntCounterVec,
    pub rpcs_in_flight: IntGauge,
    pub rpc_timeouts: IntCounter,
    pub recovery_loop_iterations: IntCounter,
    pub workers_active: IntGauge,
    pub health_checks_run: IntCounter,
    pub salvage_signals_received: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        let scripts_invoked = IntCounterVec::new(
            Opts::new("warden_scripts_invoked_total", "Registry scripts evaluated, by script name"),
            &["script"],
        )
        .unwrap();
        let rpcs_in_flight = IntGauge::new("warden_rpcs_in_flight", "Ask RPCs awaiting a response").unwrap();
        let rpc_timeouts = IntCounter::new("warden_rpc_timeouts_total", "Asks that exceeded rpcTimeout").unwrap();
        let recovery_loop_iterations = IntCounter::new(
            "warden_recovery_loop_iterations_total",
            "Iterations of the recovery loop (§4.4.9)",
        )
        .unwrap();
        let workers_active = IntGauge::new("warden_workers_active", "Workers currently owned by this broker").unwrap();
        let health_checks_run =
            IntCounter::new("warden_health_checks_run_total", "healthCheck script invocations").unwrap();
        let salvage_signals_received = IntCounter::new(
            "warden_salvage_signals_received_total",
            "`salvage` pubsub signals handled (§4.4.8)",
        )
        .unwrap();

        for collector in [
            Box::new(scripts_invoked.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(rpcs_in_flight.clone()),
            Box::new(rpc_timeouts.clone()),
            Box::new(recovery_loop_iterations.clone()),
            Box::new(workers_active.clone()),
            Box::new(health_checks_run.clone()),
            Box::new(salvage_signals_received.clone()),
        ] {
            let _ = registry.register(collector);
        }

        Arc::new(Self {
            scripts_invoked,
            rpcs_in_flight,
            rpc_timeouts,
            recovery_loop_iterations,
            workers_active,
            health_checks_run,
            salvage_signals_received,
        })
    }

    #[cfg(test)]
    pub fn for_test() -> Arc<Self> {
        Self::new(&Registry::new())
    }
}
