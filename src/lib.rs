//! Mesh Network Manager - Private Networking Control Plane
//!
//! Gives every pod and service in a cluster a globally unique overlay
//! address, keeps a WireGuard gateway and an nginx stream proxy in line
//! with those addresses, and exposes the whole thing through a small
//! registration API.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                     Registration API (axum)                           │
//! │          PUT/DELETE /pod/{ns}/{name}[/{ip}]   /service/{ns}/{name}     │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │                          Manager                                      │
//! │     one lock: registry write -> cache -> render -> apply              │
//! ├──────────────────────┬──────────────────────┬─────────────────────────┤
//! │   Binding Registry   │  Config Generator    │  Runtime Synchronizer   │
//! │  (batches, counter,  │  (wg-quick, client,  │  (wg-quick, wg, ip,     │
//! │   service free-list) │   nginx stream)      │   nginx)                │
//! ├──────────────────────┴──────────────────────┴─────────────────────────┤
//! │                    Durable Store (PodBinding,                         │
//! │                ServiceBinding, AddressPool CRDs)                      │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Manager and registration API
//! - [`ipam`]: Address arithmetic, pool counter and binding registry
//! - [`mesh`]: Key material and config rendering
//! - [`runtime`]: Applying rendered config to the host
//! - [`store`]: Kubernetes and in-memory store adapters
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Ports between the layers
//! - [`config`]: Manager configuration
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod ipam;
pub mod mesh;
pub mod metrics;
pub mod runtime;
pub mod store;

// Re-export commonly used types
pub use config::{ManagerConfig, MeshOptions};

pub use controlplane::{
    ApiServer, ApiServerConfig, Manager, ManagerStatus, PodRegistration, RestRouter,
    WarmupReport,
};

pub use crd::{
    AddressPool, AddressPoolSpec, ObjectRef, PodBinding, PodBindingSpec, Protocol,
    ServiceBinding, ServiceBindingSpec, ServicePort,
};

pub use domain::ports::{
    BindingStore, CommandOutput, CommandRunner, ServiceCatalog, ServiceDescriptor,
};

pub use error::{Error, ErrorAction, Result};

pub use ipam::{BindingRegistry, RegistryConfig};

pub use mesh::{InterfaceSettings, MeshKeyPair};

pub use metrics::ManagerMetrics;

pub use runtime::{ApplyMode, RuntimeSynchronizer, SyncConfig, TokioCommandRunner};

pub use store::{KubeServiceCatalog, KubeStore, MemoryStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
