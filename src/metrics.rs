//! Prometheus metrics
//!
//! The manager owns its registry so several instances (tests, embedded
//! use) never collide on registration. `main` serves it on the metrics
//! listener.

use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "mesh_network_manager";

/// Gauges and counters published by the manager
#[derive(Clone)]
pub struct ManagerMetrics {
    registry: Registry,
    /// Pod bindings known to this replica
    pub pod_bindings: IntGauge,
    /// Pod bindings currently reserved by a pod
    pub pod_bindings_reserved: IntGauge,
    /// Service bindings known to this replica
    pub service_bindings: IntGauge,
    /// Completed batch pre-allocations
    pub batches: IntCounter,
    /// Configuration applies by target and result
    pub applies: IntCounterVec,
}

impl ManagerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let pod_bindings = IntGauge::new("pod_bindings", "Pod bindings in the mesh")?;
        let pod_bindings_reserved =
            IntGauge::new("pod_bindings_reserved", "Pod bindings reserved by a pod")?;
        let service_bindings = IntGauge::new("service_bindings", "Service bindings exposed")?;
        let batches = IntCounter::new(
            "pod_binding_batches_total",
            "Pod binding batches pre-allocated",
        )?;
        let applies = IntCounterVec::new(
            Opts::new("config_applies_total", "Configuration applies"),
            &["target", "result"],
        )?;

        registry.register(Box::new(pod_bindings.clone()))?;
        registry.register(Box::new(pod_bindings_reserved.clone()))?;
        registry.register(Box::new(service_bindings.clone()))?;
        registry.register(Box::new(batches.clone()))?;
        registry.register(Box::new(applies.clone()))?;

        Ok(Self {
            registry,
            pod_bindings,
            pod_bindings_reserved,
            service_bindings,
            batches,
            applies,
        })
    }

    /// Count one apply of `target` ("mesh", "proxy", "address")
    pub fn record_apply(&self, target: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.applies.with_label_values(&[target, result]).inc();
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
