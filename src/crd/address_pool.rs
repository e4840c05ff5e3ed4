//! AddressPool CRD
//!
//! Singleton record holding the monotonic pod and service counters plus
//! the reusable service address free-list.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Well-known name of the singleton pool record
pub const ADDRESS_POOL_NAME: &str = "mesh-address-pool";

/// AddressPool tracks how far the pod and service CIDRs have been handed out.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.billyronks.io",
    version = "v1",
    kind = "AddressPool",
    plural = "addresspools",
    printcolumn = r#"{"name": "Pods", "type": "integer", "jsonPath": ".spec.podCounter"}"#,
    printcolumn = r#"{"name": "Services", "type": "integer", "jsonPath": ".spec.svcCounter"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AddressPoolSpec {
    /// Offset of the last pre-allocated pod address
    #[serde(default)]
    pub pod_counter: u32,

    /// Offset of the last allocated service address
    #[serde(default)]
    pub svc_counter: u32,

    /// Released service addresses, reused before the counter advances
    #[serde(default)]
    pub free_service_addrs: Vec<String>,
}

/// Which counter of the pool an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Pod,
    Service,
}

impl CounterKind {
    /// JSON field name inside the spec
    pub fn field(&self) -> &'static str {
        match self {
            CounterKind::Pod => "podCounter",
            CounterKind::Service => "svcCounter",
        }
    }
}

impl std::fmt::Display for CounterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterKind::Pod => write!(f, "pod"),
            CounterKind::Service => write!(f, "service"),
        }
    }
}

impl AddressPoolSpec {
    pub fn counter(&self, kind: CounterKind) -> u32 {
        match kind {
            CounterKind::Pod => self.pod_counter,
            CounterKind::Service => self.svc_counter,
        }
    }
}

/// Targeted change to the pool; only the named field is sent to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolPatch {
    SetCounter(CounterKind, u32),
    SetFreeList(Vec<String>),
}

impl PoolPatch {
    /// Merge patch body touching only the relevant spec field
    pub fn to_merge_patch(&self, resource_version: &str) -> serde_json::Value {
        let mut spec = serde_json::Map::new();
        match self {
            PoolPatch::SetCounter(kind, value) => {
                spec.insert(kind.field().to_string(), serde_json::json!(value));
            }
            PoolPatch::SetFreeList(addrs) => {
                spec.insert("freeServiceAddrs".to_string(), serde_json::json!(addrs));
            }
        }
        serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "spec": spec,
        })
    }

    /// Apply the patch to an in-memory spec
    pub fn apply_to(&self, spec: &mut AddressPoolSpec) {
        match self {
            PoolPatch::SetCounter(CounterKind::Pod, value) => spec.pod_counter = *value,
            PoolPatch::SetCounter(CounterKind::Service, value) => spec.svc_counter = *value,
            PoolPatch::SetFreeList(addrs) => spec.free_service_addrs = addrs.clone(),
        }
    }
}
