//! Mesh Manager
//!
//! Runs the registration state machine for pods and services:
//!
//! - Pods: `Free -> Reserved(token) -> Bound(pod, podIP) -> Free`
//! - Services: allocated, bound, then deleted with the address returned
//!   to the free-list
//!
//! Every mutating operation holds one lock across the whole sequence:
//! registry write, cache update, render, apply. The caches only mirror the
//! store and are rebuilt from it by [`Manager::warm`].

use crate::config::ManagerConfig;
use crate::crd::{ObjectRef, PodBinding, ServiceBinding};
use crate::domain::ports::{BindingStore, CommandRunner, ServiceCatalog, ServiceDescriptor};
use crate::error::{Error, Result};
use crate::ipam::BindingRegistry;
use crate::mesh::{
    render_client_config, render_interface, render_peer, render_stream, render_stream_file,
};
use crate::metrics::ManagerMetrics;
use crate::runtime::{ApplyMode, RuntimeSynchronizer};
use backoff::ExponentialBackoff;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

// =============================================================================
// State
// =============================================================================

/// Everything guarded by the manager lock
#[derive(Default)]
struct ManagerState {
    /// Rendered `[Peer]` fragment per pod binding address
    pod_peers: BTreeMap<Ipv4Addr, String>,
    /// Addresses of pod bindings held by a pod
    reserved: BTreeSet<Ipv4Addr>,
    /// Rendered stream rules per service binding address
    service_streams: BTreeMap<Ipv4Addr, String>,
    /// The host is behind the mesh cache
    mesh_stale: bool,
    /// The host is behind the proxy cache
    proxy_stale: bool,
}

/// Snapshot of the manager's view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub ready: bool,
    pub pod_bindings: usize,
    pub reserved_pod_bindings: usize,
    pub service_bindings: usize,
    pub batch_in_flight: bool,
}

/// What [`Manager::warm`] loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupReport {
    pub pod_bindings: usize,
    pub reserved_pod_bindings: usize,
    pub service_bindings: usize,
}

/// Result of a pod registration
#[derive(Debug, Clone)]
pub struct PodRegistration {
    pub binding: PodBinding,
    /// `wg-quick` file the pod brings its side of the tunnel up with
    pub client_config: String,
}

// =============================================================================
// Manager
// =============================================================================

/// Coordinates registry, renderers and the host
pub struct Manager {
    config: ManagerConfig,
    registry: BindingRegistry,
    catalog: Arc<dyn ServiceCatalog>,
    synchronizer: RuntimeSynchronizer,
    metrics: ManagerMetrics,
    state: Mutex<ManagerState>,
    /// At most one batch task runs at a time
    batch_in_flight: AtomicBool,
    /// Set once a batch could not derive a single address
    pod_pool_exhausted: AtomicBool,
    ready: AtomicBool,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn BindingStore>,
        catalog: Arc<dyn ServiceCatalog>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Arc<Self>> {
        let registry = BindingRegistry::new(store, config.registry.clone());
        let synchronizer = RuntimeSynchronizer::new(config.sync.clone(), runner);

        Ok(Arc::new(Self {
            config,
            registry,
            catalog,
            synchronizer,
            metrics: ManagerMetrics::new()?,
            state: Mutex::new(ManagerState::default()),
            batch_in_flight: AtomicBool::new(false),
            pod_pool_exhausted: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    /// Whether [`Manager::warm`] has completed
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> ManagerStatus {
        let state = self.state.lock().await;
        ManagerStatus {
            ready: self.is_ready(),
            pod_bindings: state.pod_peers.len(),
            reserved_pod_bindings: state.reserved.len(),
            service_bindings: state.service_streams.len(),
            batch_in_flight: self.batch_in_flight.load(Ordering::SeqCst),
        }
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Load every binding, rebuild the caches and bring the host in line.
    ///
    /// Must complete before the API listener binds.
    pub async fn warm(&self) -> Result<WarmupReport> {
        info!("Loading bindings from the store");

        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(self.config.startup_retry_window),
            ..Default::default()
        };

        let (mut pods, services) = backoff::future::retry(policy, || async {
            let load = async {
                self.registry.counter().ensure_exists().await?;
                let pods = self.registry.list_all_pod_bindings().await?;
                let services = self.registry.list_all_service_bindings().await?;
                Ok::<_, Error>((pods, services))
            };
            load.await.map_err(|e| {
                if e.is_transient() {
                    warn!(error = %e, "Store not reachable yet, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await?;

        for binding in pods.iter_mut().filter(|b| b.labels_stale()) {
            match self.registry.relabel_pod_binding(binding).await {
                Ok(updated) => *binding = updated,
                Err(e) => {
                    warn!(name = ?binding.metadata.name, error = %e, "Could not relabel pod binding")
                }
            }
        }

        let mut state = self.state.lock().await;
        *state = ManagerState::default();

        for binding in &pods {
            if let Err(e) = self.cache_pod(&mut state, binding) {
                warn!(name = ?binding.metadata.name, error = %e, "Skipping unreadable pod binding");
            }
        }
        for binding in &services {
            if let Err(e) = self.cache_service(&mut state, binding) {
                warn!(name = ?binding.metadata.name, error = %e, "Skipping unreadable service binding");
            }
        }

        self.apply_mesh(&mut state, ApplyMode::Restart).await?;
        self.apply_proxy(&mut state).await?;
        self.refresh_gauges(&state);
        self.ready.store(true, Ordering::SeqCst);

        let report = WarmupReport {
            pod_bindings: state.pod_peers.len(),
            reserved_pod_bindings: state.reserved.len(),
            service_bindings: state.service_streams.len(),
        };
        info!(
            pod_bindings = report.pod_bindings,
            reserved = report.reserved_pod_bindings,
            service_bindings = report.service_bindings,
            "Manager warmed up"
        );
        Ok(report)
    }

    // =========================================================================
    // Pods
    // =========================================================================

    /// Reserve a binding for `pod`, or return the one it already holds.
    ///
    /// With `pod_ip` the binding also records the pod and its address so
    /// the gateway can dial it.
    pub async fn register_pod(
        self: &Arc<Self>,
        pod: ObjectRef,
        pod_ip: Option<Ipv4Addr>,
    ) -> Result<PodRegistration> {
        let token = pod.token();
        let mut state = self.state.lock().await;

        let existing = self.registry.find_pod_binding_by_token(&token).await?;
        let mut changed = existing.is_none();
        let mut binding = match existing {
            Some(binding) => {
                debug!(%pod, global_ip = %binding.spec.global_ip, "Pod already holds a binding");
                binding
            }
            None => self.reserve_free(&token).await?,
        };

        if let Some(ip) = pod_ip {
            let same_ip = binding.pod_ip()? == Some(ip);
            let same_owner = binding.spec.pod_ref.as_ref() == Some(&pod);
            if !(same_ip && same_owner) {
                binding = self.registry.bind_pod_binding(&binding, pod.clone(), ip).await?;
                changed = true;
            }
        }

        let global_ip = self.cache_pod(&mut state, &binding)?;
        if changed || state.mesh_stale {
            self.apply_mesh(&mut state, ApplyMode::SyncPeers).await?;
        }
        self.refresh_gauges(&state);

        info!(%pod, %global_ip, pod_ip = ?pod_ip, "Pod registered");
        let client_config = render_client_config(&binding, &self.config.interface)?;
        Ok(PodRegistration {
            binding,
            client_config,
        })
    }

    /// Return the binding held by `pod` to the free state
    pub async fn deregister_pod(&self, pod: &ObjectRef) -> Result<PodBinding> {
        let token = pod.token();
        let mut state = self.state.lock().await;

        let binding = self
            .registry
            .find_pod_binding_by_token(&token)
            .await?
            .ok_or_else(|| Error::BindingNotFound {
                kind: "pod".into(),
                reference: pod.to_string(),
            })?;

        let released = self.registry.release_pod_binding(&binding).await?;
        let global_ip = self.cache_pod(&mut state, &released)?;
        self.apply_mesh(&mut state, ApplyMode::SyncPeers).await?;
        self.refresh_gauges(&state);

        info!(%pod, %global_ip, "Pod deregistered");
        Ok(released)
    }

    /// Reserve some free binding for `token`, waiting for a batch when
    /// none is left
    async fn reserve_free(self: &Arc<Self>, token: &str) -> Result<PodBinding> {
        let attempts = self.config.batch_poll_attempts;

        for attempt in 1..=attempts {
            if let Some(free) = self.registry.find_free_pod_binding().await? {
                match self.registry.reserve_pod_binding(&free, token).await {
                    Ok(binding) => {
                        debug!(token, global_ip = %binding.spec.global_ip, attempt, "Reserved free pod binding");
                        return Ok(binding);
                    }
                    Err(e @ Error::Conflict { .. }) => {
                        debug!(token, error = %e, "Free binding taken concurrently, searching again");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if self.pod_pool_exhausted.load(Ordering::SeqCst)
                && !self.batch_in_flight.load(Ordering::SeqCst)
            {
                return Err(Error::PoolExhausted {
                    pool: self.config.registry.pod_cidr.to_string(),
                });
            }

            self.spawn_batch();
            if attempt < attempts {
                tokio::time::sleep(self.config.batch_poll_delay).await;
            }
        }

        warn!(token, attempts, "No free pod binding after polling");
        Err(Error::AllocationPending {
            token: token.to_string(),
        })
    }

    /// Start a batch task unless one is already running
    fn spawn_batch(self: &Arc<Self>) {
        if self
            .batch_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_batch().await;
        });
    }

    /// Store work runs without the lock; merging and applying take it
    async fn run_batch(&self) {
        info!("Pre-allocating pod binding batch");
        let result = self.registry.allocate_pod_batch().await;
        self.batch_in_flight.store(false, Ordering::SeqCst);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e @ Error::PoolExhausted { .. }) => {
                error!(error = %e, "Pod address pool exhausted");
                self.pod_pool_exhausted.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                error!(error = %e, "Pod binding batch failed");
                return;
            }
        };
        self.metrics.batches.inc();

        let mut state = self.state.lock().await;
        let mut added = 0usize;
        for binding in &outcome.created {
            let Ok(ip) = binding.global_ip() else {
                continue;
            };
            // a reservation may already have cached a newer version
            if let Entry::Vacant(slot) = state.pod_peers.entry(ip) {
                match render_peer(binding, &self.config.interface) {
                    Ok(fragment) => {
                        slot.insert(fragment);
                        added += 1;
                    }
                    Err(e) => warn!(%ip, error = %e, "Cannot render new pod binding"),
                }
            }
        }

        if added > 0 || state.mesh_stale {
            if let Err(e) = self.apply_mesh(&mut state, ApplyMode::SyncPeers).await {
                error!(error = %e, "Failed to apply mesh after batch");
            }
        }
        self.refresh_gauges(&state);
        debug!(added, "Batch merged into mesh");
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Expose `service` on a global address, or return its existing binding.
    ///
    /// Without a `descriptor` the service is looked up in the catalog.
    pub async fn register_service(
        &self,
        service: ObjectRef,
        descriptor: Option<ServiceDescriptor>,
    ) -> Result<ServiceBinding> {
        let mut state = self.state.lock().await;

        if let Some(existing) = self.registry.find_service_binding(&service).await? {
            let global_ip = existing.global_ip()?;
            let uncached = !state.service_streams.contains_key(&global_ip);
            if uncached {
                self.cache_service(&mut state, &existing)?;
            }
            if uncached || state.mesh_stale || state.proxy_stale {
                self.expose(&mut state, global_ip).await?;
            }
            self.refresh_gauges(&state);
            debug!(%service, %global_ip, "Service already bound");
            return Ok(existing);
        }

        let descriptor = match descriptor {
            Some(descriptor) => descriptor,
            None => self.catalog.describe(&service).await?,
        };

        let global_ip = self.registry.allocate_service_address().await?;
        let binding = match self
            .registry
            .create_service_binding(
                global_ip,
                service.clone(),
                descriptor.service_ip,
                descriptor.ports,
            )
            .await
        {
            Ok(binding) => binding,
            Err(e) => {
                if !e.is_already_exists() {
                    if let Err(push) = self.registry.return_service_address(global_ip).await {
                        warn!(%global_ip, error = %push, "Could not return address to the free-list");
                    }
                }
                return Err(e);
            }
        };

        self.cache_service(&mut state, &binding)?;
        self.expose(&mut state, global_ip).await?;
        self.refresh_gauges(&state);

        info!(%service, %global_ip, service_ip = %descriptor.service_ip, "Service registered");
        Ok(binding)
    }

    /// Delete the binding of `service` and free its address
    pub async fn deregister_service(&self, service: &ObjectRef) -> Result<Ipv4Addr> {
        let mut state = self.state.lock().await;

        let binding = self
            .registry
            .find_service_binding(service)
            .await?
            .ok_or_else(|| Error::BindingNotFound {
                kind: "service".into(),
                reference: service.to_string(),
            })?;

        let global_ip = self.registry.delete_service_binding(&binding).await?;
        state.service_streams.remove(&global_ip);

        // nginx has to let go of the address before it disappears
        self.apply_proxy(&mut state).await?;
        let removed = self.synchronizer.remove_address(global_ip).await;
        self.metrics.record_apply("address", removed.is_ok());
        removed?;
        self.apply_mesh(&mut state, ApplyMode::SyncPeers).await?;
        self.refresh_gauges(&state);

        info!(%service, %global_ip, "Service deregistered");
        Ok(global_ip)
    }

    /// Bring up `global_ip` on the gateway and reload both artifacts
    async fn expose(&self, state: &mut ManagerState, global_ip: Ipv4Addr) -> Result<()> {
        let added = self.synchronizer.add_address(global_ip).await;
        self.metrics.record_apply("address", added.is_ok());
        added?;
        self.apply_mesh(state, ApplyMode::SyncPeers).await?;
        self.apply_proxy(state).await
    }

    // =========================================================================
    // Cache and apply
    // =========================================================================

    fn cache_pod(&self, state: &mut ManagerState, binding: &PodBinding) -> Result<Ipv4Addr> {
        let ip = binding.global_ip()?;
        let fragment = render_peer(binding, &self.config.interface)?;
        state.pod_peers.insert(ip, fragment);
        if binding.is_free() {
            state.reserved.remove(&ip);
        } else {
            state.reserved.insert(ip);
        }
        Ok(ip)
    }

    fn cache_service(&self, state: &mut ManagerState, binding: &ServiceBinding) -> Result<Ipv4Addr> {
        let ip = binding.global_ip()?;
        let fragment = render_stream(binding, &self.config.cluster_domain)?;
        state.service_streams.insert(ip, fragment);
        Ok(ip)
    }

    async fn apply_mesh(&self, state: &mut ManagerState, mode: ApplyMode) -> Result<()> {
        let rendered = render_interface(
            &self.config.interface,
            state.service_streams.keys(),
            state.pod_peers.values(),
        );
        let result = self.synchronizer.apply_mesh(&rendered, mode).await;
        state.mesh_stale = result.is_err();
        self.metrics.record_apply("mesh", result.is_ok());
        result
    }

    async fn apply_proxy(&self, state: &mut ManagerState) -> Result<()> {
        let rendered = render_stream_file(state.service_streams.values());
        let result = self.synchronizer.apply_proxy(&rendered).await;
        state.proxy_stale = result.is_err();
        self.metrics.record_apply("proxy", result.is_ok());
        result
    }

    fn refresh_gauges(&self, state: &ManagerState) {
        self.metrics.pod_bindings.set(state.pod_peers.len() as i64);
        self.metrics
            .pod_bindings_reserved
            .set(state.reserved.len() as i64);
        self.metrics
            .service_bindings
            .set(state.service_streams.len() as i64);
    }
}
