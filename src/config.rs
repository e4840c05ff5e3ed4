//! Manager configuration
//!
//! Assembled from CLI flags in `main` (or by hand in tests) and validated
//! once before the manager starts.

use crate::error::{Error, Result};
use crate::ipam::{offset_address, RegistryConfig};
use crate::mesh::{InterfaceSettings, MeshKeyPair};
use crate::runtime::SyncConfig;
use ipnetwork::Ipv4Network;
use std::time::Duration;

/// Default WireGuard UDP port
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Everything the manager needs to run
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Allocation parameters
    pub registry: RegistryConfig,
    /// Gateway side of the mesh
    pub interface: InterfaceSettings,
    /// Artifact paths and host tooling
    pub sync: SyncConfig,
    /// Cluster DNS suffix used in proxy upstreams
    pub cluster_domain: String,
    /// Wait between free-binding polls while a batch is created
    pub batch_poll_delay: Duration,
    /// Polls before a reservation gives up with a retryable error
    pub batch_poll_attempts: u32,
    /// Upper bound on startup retries against the store
    pub startup_retry_window: Duration,
}

/// Mesh parameters not derivable from the pool layout
#[derive(Debug, Clone)]
pub struct MeshOptions {
    pub keys: MeshKeyPair,
    pub endpoint: String,
    pub listen_port: u16,
    pub pod_listen_port: u16,
    pub keepalive_secs: u16,
}

impl MeshOptions {
    pub fn new(keys: MeshKeyPair, endpoint: impl Into<String>) -> Self {
        Self {
            keys,
            endpoint: endpoint.into(),
            listen_port: DEFAULT_LISTEN_PORT,
            pod_listen_port: DEFAULT_LISTEN_PORT,
            keepalive_secs: 25,
        }
    }
}

impl ManagerConfig {
    /// Derive the gateway interface from the pool layout.
    ///
    /// The gateway takes the pod address at `pod_offset`, which batch
    /// allocation never hands out.
    pub fn new(registry: RegistryConfig, mesh: MeshOptions, sync: SyncConfig) -> Result<Self> {
        let gateway = offset_address(&registry.pod_cidr, registry.pod_offset)?;
        let address = Ipv4Network::new(gateway, registry.pod_cidr.prefix())
            .map_err(|e| Error::Configuration(e.to_string()))?;

        let interface = InterfaceSettings {
            address,
            listen_port: mesh.listen_port,
            private_key: mesh.keys.private_key,
            public_key: mesh.keys.public_key,
            endpoint: mesh.endpoint,
            pod_listen_port: mesh.pod_listen_port,
            keepalive_secs: mesh.keepalive_secs,
            client_allowed_ips: vec![registry.pod_cidr, registry.service_cidr],
        };

        let config = Self {
            registry,
            interface,
            sync,
            cluster_domain: "cluster.local".to_string(),
            batch_poll_delay: Duration::from_millis(250),
            batch_poll_attempts: 8,
            startup_retry_window: Duration::from_secs(120),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject layouts the allocator cannot serve
    pub fn validate(&self) -> Result<()> {
        let r = &self.registry;

        if r.pod_offset == 0 {
            return Err(Error::Configuration(
                "pod offset must be at least 1 (the gateway address)".into(),
            ));
        }
        if r.batch_size == 0 {
            return Err(Error::Configuration("batch size must be positive".into()));
        }
        if r.page_size == 0 || r.free_search_limit == 0 {
            return Err(Error::Configuration("list limits must be positive".into()));
        }
        if r.pod_cidr.overlaps(r.service_cidr) {
            return Err(Error::Configuration(format!(
                "pod CIDR {} overlaps service CIDR {}",
                r.pod_cidr, r.service_cidr
            )));
        }
        if self.interface.endpoint.trim().is_empty() {
            return Err(Error::Configuration("mesh endpoint must be set".into()));
        }
        if self.batch_poll_attempts == 0 {
            return Err(Error::Configuration("batch poll attempts must be positive".into()));
        }
        if self.cluster_domain.is_empty() {
            return Err(Error::Configuration("cluster domain must be set".into()));
        }

        let derived = MeshKeyPair::from_private_key(&self.interface.private_key)?;
        if derived.public_key != self.interface.public_key {
            return Err(Error::Configuration(
                "gateway public key does not match private key".into(),
            ));
        }

        Ok(())
    }
}
