//! Binding Registry
//!
//! Owns the two record families and the allocation policy:
//!
//! - Pod addresses are pre-allocated in batches. The pod counter moves
//!   forward by a whole batch, each derived address gets its own keypair,
//!   and the records are created free (`reservationToken = "false"`).
//! - Service addresses are handed out one at a time, preferring the
//!   free-list over advancing the service counter.
//!
//! Pod bindings are recycled on release; service bindings are deleted and
//! their address returned to the free-list.

use super::addr::{address_offset, offset_address};
use super::bounded;
use super::counter::AddressPoolCounter;
use crate::crd::{
    service_selector, token_hash, CounterKind, ObjectRef, PodBinding, ServiceBinding,
    ServicePort, LABEL_RESERVED, LABEL_TOKEN_HASH,
};
use crate::domain::ports::{BindingStore, ListQuery, Page};
use crate::error::{Error, Result};
use crate::mesh::keys::MeshKeyPair;
use backoff::ExponentialBackoff;
use futures::stream::{self, StreamExt};
use ipnetwork::Ipv4Network;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Allocation parameters of the registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// CIDR pod addresses are carved from
    pub pod_cidr: Ipv4Network,
    /// CIDR service addresses are carved from
    pub service_cidr: Ipv4Network,
    /// Pod offsets below this are not handed out (the gateway sits there)
    pub pod_offset: u32,
    /// Initial service counter
    pub service_reserved: u32,
    /// Pod bindings created per batch
    pub batch_size: u32,
    /// Page size for full listings
    pub page_size: u32,
    /// How many free bindings a single search fetches
    pub free_search_limit: u32,
    /// Bound on every store call
    pub store_timeout: Duration,
    /// Bound on conflict retries when writing the pool record
    pub conflict_retry_window: Duration,
    /// Concurrent record creations within one batch
    pub create_concurrency: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pod_cidr: Ipv4Network::new(Ipv4Addr::new(10, 80, 0, 0), 16)
                .expect("static CIDR is valid"),
            service_cidr: Ipv4Network::new(Ipv4Addr::new(10, 90, 0, 0), 16)
                .expect("static CIDR is valid"),
            pod_offset: 1,
            service_reserved: 10,
            batch_size: 32,
            page_size: 100,
            free_search_limit: 5,
            store_timeout: Duration::from_secs(10),
            conflict_retry_window: Duration::from_secs(5),
            create_concurrency: 8,
        }
    }
}

/// Result of one batch pre-allocation
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Records this call created
    pub created: Vec<PodBinding>,
    /// Addresses another writer had already created
    pub already_present: usize,
    /// Addresses whose creation failed
    pub failed: usize,
}

// =============================================================================
// Binding Registry
// =============================================================================

/// Allocation and lifecycle of pod and service bindings
#[derive(Clone)]
pub struct BindingRegistry {
    store: Arc<dyn BindingStore>,
    counter: AddressPoolCounter,
    config: RegistryConfig,
}

impl BindingRegistry {
    pub fn new(store: Arc<dyn BindingStore>, config: RegistryConfig) -> Self {
        let counter = AddressPoolCounter::new(
            store.clone(),
            config.service_reserved,
            config.store_timeout,
        );
        Self {
            store,
            counter,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn counter(&self) -> &AddressPoolCounter {
        &self.counter
    }

    /// Address for slot `i` (1-based) of a batch starting at `counter`
    pub fn pod_address(&self, counter: u32, i: u32) -> Result<Ipv4Addr> {
        let offset = self
            .config
            .pod_offset
            .checked_add(counter)
            .and_then(|o| o.checked_add(i))
            .ok_or_else(|| Error::PoolExhausted {
                pool: self.config.pod_cidr.to_string(),
            })?;
        offset_address(&self.config.pod_cidr, offset)
    }

    /// Address for service counter value `counter`
    pub fn service_address(&self, counter: u32) -> Result<Ipv4Addr> {
        offset_address(&self.config.service_cidr, counter)
    }

    // =========================================================================
    // Pod bindings
    // =========================================================================

    /// Pre-allocate one batch of free pod bindings
    pub async fn allocate_pod_batch(&self) -> Result<BatchOutcome> {
        let batch = self.config.batch_size;
        let start = self.advance_with_retry(CounterKind::Pod, batch).await?;

        let addresses: Vec<Ipv4Addr> = (1..=batch)
            .map_while(|i| self.pod_address(start, i).ok())
            .collect();
        if addresses.is_empty() {
            return Err(Error::PoolExhausted {
                pool: self.config.pod_cidr.to_string(),
            });
        }
        if addresses.len() < batch as usize {
            warn!(
                requested = batch,
                available = addresses.len(),
                "Pod CIDR nearly exhausted, short batch"
            );
        }

        let results: Vec<(Ipv4Addr, Result<PodBinding>)> = stream::iter(addresses)
            .map(|ip| async move {
                let keys = MeshKeyPair::generate();
                let binding = PodBinding::free(ip, keys.private_key, keys.public_key);
                let created = bounded(
                    self.config.store_timeout,
                    "create pod binding",
                    self.store.create_pod_binding(binding),
                )
                .await;
                (ip, created)
            })
            .buffer_unordered(self.config.create_concurrency.max(1))
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        let mut first_error = None;
        for (ip, result) in results {
            match result {
                Ok(binding) => outcome.created.push(binding),
                Err(e) if e.is_already_exists() => {
                    debug!(%ip, "Pod binding already created by another writer");
                    outcome.already_present += 1;
                }
                Err(e) => {
                    warn!(%ip, error = %e, "Failed to create pod binding");
                    outcome.failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        if outcome.created.is_empty() && outcome.already_present == 0 {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        info!(
            start,
            created = outcome.created.len(),
            already_present = outcome.already_present,
            failed = outcome.failed,
            "Pre-allocated pod binding batch"
        );
        Ok(outcome)
    }

    /// A free pod binding, if one exists
    pub async fn find_free_pod_binding(&self) -> Result<Option<PodBinding>> {
        let query = ListQuery::labels(
            format!("{}=false", LABEL_RESERVED),
            self.config.free_search_limit,
        );
        let page = bounded(
            self.config.store_timeout,
            "list free pod bindings",
            self.store.list_pod_bindings(&query),
        )
        .await?;
        Ok(page.items.into_iter().find(|b| b.is_free()))
    }

    /// The pod binding currently held by `token`.
    ///
    /// Tokens can be longer than a label value, so the selector matches a
    /// digest and the token itself is compared on the returned items.
    pub async fn find_pod_binding_by_token(&self, token: &str) -> Result<Option<PodBinding>> {
        let query = ListQuery::labels(
            format!(
                "{}=true,{}={}",
                LABEL_RESERVED,
                LABEL_TOKEN_HASH,
                token_hash(token)
            ),
            self.config.page_size,
        );
        let mut next = Some(query.clone());

        while let Some(q) = next.take() {
            let page = bounded(
                self.config.store_timeout,
                "list reserved pod bindings",
                self.store.list_pod_bindings(&q),
            )
            .await?;

            if let Some(found) = page
                .items
                .into_iter()
                .find(|b| b.spec.reservation_token == token)
            {
                return Ok(Some(found));
            }
            next = page.continue_token.map(|t| query.continued(t));
        }

        Ok(None)
    }

    /// Mark `binding` as held by `token`
    pub async fn reserve_pod_binding(&self, binding: &PodBinding, token: &str) -> Result<PodBinding> {
        let mut updated = binding.clone();
        updated.reserve(token);
        self.replace_pod(updated, "reserve pod binding").await
    }

    /// Record the owning pod and its real address
    pub async fn bind_pod_binding(
        &self,
        binding: &PodBinding,
        pod: ObjectRef,
        pod_ip: Ipv4Addr,
    ) -> Result<PodBinding> {
        let mut updated = binding.clone();
        updated.bind(pod, pod_ip);
        self.replace_pod(updated, "bind pod binding").await
    }

    /// Return the binding to the free state
    pub async fn release_pod_binding(&self, binding: &PodBinding) -> Result<PodBinding> {
        let mut updated = binding.clone();
        updated.release();
        self.replace_pod(updated, "release pod binding").await
    }

    /// Rewrite the labels of a binding stored by an older manager
    pub async fn relabel_pod_binding(&self, binding: &PodBinding) -> Result<PodBinding> {
        let mut updated = binding.clone();
        updated.sync_labels();
        self.replace_pod(updated, "relabel pod binding").await
    }

    /// Every pod binding in the store, page by page
    pub async fn list_all_pod_bindings(&self) -> Result<Vec<PodBinding>> {
        let query = ListQuery::all(self.config.page_size);
        let mut all = Vec::new();
        let mut next = Some(query.clone());

        while let Some(q) = next.take() {
            let Page {
                items,
                continue_token,
            } = bounded(
                self.config.store_timeout,
                "list pod bindings",
                self.store.list_pod_bindings(&q),
            )
            .await?;
            all.extend(items);
            next = continue_token.map(|t| query.continued(t));
        }

        Ok(all)
    }

    async fn replace_pod(&self, binding: PodBinding, op: &str) -> Result<PodBinding> {
        bounded(
            self.config.store_timeout,
            op,
            self.store.replace_pod_binding(binding),
        )
        .await
    }

    // =========================================================================
    // Service bindings
    // =========================================================================

    /// Binding currently serving `service`
    pub async fn find_service_binding(&self, service: &ObjectRef) -> Result<Option<ServiceBinding>> {
        let query = ListQuery::labels(service_selector(service), 0);
        let page = bounded(
            self.config.store_timeout,
            "find service binding",
            self.store.list_service_bindings(&query),
        )
        .await?;
        Ok(page
            .items
            .into_iter()
            .find(|b| &b.spec.service_ref == service))
    }

    /// Next service address: a released one first, else a fresh offset
    pub async fn allocate_service_address(&self) -> Result<Ipv4Addr> {
        while let Some(addr) = self
            .retry_pool_write("pop service free-list", || {
                self.counter.pop_free_service_addr()
            })
            .await?
        {
            if address_offset(&self.config.service_cidr, addr).is_some() {
                return Ok(addr);
            }
            warn!(%addr, cidr = %self.config.service_cidr, "Dropping free-list address outside service CIDR");
        }

        let previous = self.advance_with_retry(CounterKind::Service, 1).await?;
        self.service_address(previous + 1)
    }

    /// Persist a binding for `service` at `global_ip`
    pub async fn create_service_binding(
        &self,
        global_ip: Ipv4Addr,
        service: ObjectRef,
        service_ip: Ipv4Addr,
        ports: Vec<ServicePort>,
    ) -> Result<ServiceBinding> {
        let binding = ServiceBinding::for_service(global_ip, service, service_ip, ports);
        bounded(
            self.config.store_timeout,
            "create service binding",
            self.store.create_service_binding(binding),
        )
        .await
    }

    /// Delete the binding and hand its address back to the free-list
    pub async fn delete_service_binding(&self, binding: &ServiceBinding) -> Result<Ipv4Addr> {
        let global_ip = binding.global_ip()?;
        let name = binding.metadata.name.clone().unwrap_or_default();

        match bounded(
            self.config.store_timeout,
            "delete service binding",
            self.store.delete_service_binding(&name),
        )
        .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(%name, "Service binding already gone"),
            Err(e) => return Err(e),
        }

        // The record is gone; a lost address must not undo that
        if let Err(e) = self.return_service_address(global_ip).await {
            error!(%global_ip, %name, error = %e, "Service address could not be returned to the free-list");
        }
        Ok(global_ip)
    }

    /// Put an unused service address back on the free-list
    pub async fn return_service_address(&self, addr: Ipv4Addr) -> Result<()> {
        self.retry_pool_write("push service free-list", || {
            self.counter.push_free_service_addr(addr)
        })
        .await
    }

    /// Every service binding in the store, page by page
    pub async fn list_all_service_bindings(&self) -> Result<Vec<ServiceBinding>> {
        let query = ListQuery::all(self.config.page_size);
        let mut all = Vec::new();
        let mut next = Some(query.clone());

        while let Some(q) = next.take() {
            let page = bounded(
                self.config.store_timeout,
                "list service bindings",
                self.store.list_service_bindings(&q),
            )
            .await?;
            all.extend(page.items);
            next = page.continue_token.map(|t| query.continued(t));
        }

        Ok(all)
    }

    // =========================================================================
    // Pool write retries
    // =========================================================================

    async fn advance_with_retry(&self, kind: CounterKind, count: u32) -> Result<u32> {
        self.retry_pool_write("advance counter", || self.counter.advance(kind, count))
            .await
    }

    /// Run a read-then-patch of the pool record, re-reading and retrying
    /// while the store reports stale writes. Batch tasks advance the pod
    /// counter outside the manager lock, so any pool write can race one.
    async fn retry_pool_write<T, F, Fut>(&self, op: &'static str, mut write: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(20),
            max_interval: Duration::from_millis(500),
            max_elapsed_time: Some(self.config.conflict_retry_window),
            ..Default::default()
        };

        backoff::future::retry(policy, || {
            let attempt = write();
            async move {
                attempt.await.map_err(|e| match e {
                    Error::Conflict { .. } | Error::StoreTimeout(..) => {
                        debug!(op, error = %e, "Pool write raced, retrying");
                        backoff::Error::transient(e)
                    }
                    other => backoff::Error::permanent(other),
                })
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::BindingStore;
    use crate::store::memory::tests::FaultyStore;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use std::collections::HashSet;

    async fn faulty_registry(config: RegistryConfig) -> (BindingRegistry, Arc<FaultyStore>) {
        let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let registry = BindingRegistry::new(store.clone(), config);
        registry.counter().ensure_exists().await.unwrap();
        (registry, store)
    }

    fn registry_with(store: Arc<MemoryStore>, config: RegistryConfig) -> BindingRegistry {
        BindingRegistry::new(store, config)
    }

    async fn registry() -> (BindingRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = RegistryConfig {
            batch_size: 4,
            ..Default::default()
        };
        let registry = registry_with(store.clone(), config);
        registry.counter().ensure_exists().await.unwrap();
        (registry, store)
    }

    #[tokio::test]
    async fn test_batch_scenario_from_counter_five() {
        let store = Arc::new(MemoryStore::new());
        let config = RegistryConfig {
            pod_cidr: "10.80.0.0/16".parse().unwrap(),
            batch_size: 3,
            ..Default::default()
        };
        let registry = registry_with(store.clone(), config);
        registry.counter().ensure_exists().await.unwrap();
        registry.counter().advance(CounterKind::Pod, 5).await.unwrap();

        let outcome = registry.allocate_pod_batch().await.unwrap();
        let offset = registry.config().pod_offset as u8;

        let mut ips: Vec<Ipv4Addr> = outcome
            .created
            .iter()
            .map(|b| b.global_ip().unwrap())
            .collect();
        ips.sort();
        assert_eq!(ips[0], Ipv4Addr::new(10, 80, 0, offset + 6));
        assert_eq!(ips.len(), 3);

        let first = outcome
            .created
            .iter()
            .find(|b| b.global_ip().unwrap() == ips[0])
            .unwrap();
        assert!(first.is_free());
        assert_eq!(first.spec.reservation_token, "false");
        assert!(!first.spec.public_key.is_empty());
        assert_eq!(registry.counter().read().await.unwrap().spec.pod_counter, 8);
    }

    #[tokio::test]
    async fn test_batches_never_overlap() {
        let (registry, _store) = registry().await;
        registry.allocate_pod_batch().await.unwrap();
        registry.allocate_pod_batch().await.unwrap();

        let all = registry.list_all_pod_bindings().await.unwrap();
        assert_eq!(all.len(), 8);
        let ips: HashSet<_> = all.iter().map(|b| b.spec.global_ip.clone()).collect();
        assert_eq!(ips.len(), 8);
        let keys: HashSet<_> = all.iter().map(|b| b.spec.public_key.clone()).collect();
        assert_eq!(keys.len(), 8);
    }

    #[tokio::test]
    async fn test_racing_creator_is_benign() {
        let (registry, store) = registry().await;
        let ip = registry.pod_address(0, 2).unwrap();
        store
            .create_pod_binding(PodBinding::free(ip, "p".into(), "k".into()))
            .await
            .unwrap();

        let outcome = registry.allocate_pod_batch().await.unwrap();
        assert_eq!(outcome.created.len(), 3);
        assert_eq!(outcome.already_present, 1);
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let store = Arc::new(MemoryStore::new());
        let config = RegistryConfig {
            pod_cidr: "10.80.0.0/29".parse().unwrap(),
            batch_size: 4,
            ..Default::default()
        };
        let registry = registry_with(store, config);
        registry.counter().ensure_exists().await.unwrap();

        // offsets 2..=5 fit, 6 is the last usable slot
        let first = registry.allocate_pod_batch().await.unwrap();
        assert_eq!(first.created.len(), 4);
        let second = registry.allocate_pod_batch().await.unwrap();
        assert_eq!(second.created.len(), 1);
        let err = registry.allocate_pod_batch().await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn test_token_lookup_and_release() {
        let (registry, _store) = registry().await;
        registry.allocate_pod_batch().await.unwrap();

        let free = registry.find_free_pod_binding().await.unwrap().unwrap();
        let reserved = registry
            .reserve_pod_binding(&free, "default.web-0")
            .await
            .unwrap();

        let found = registry
            .find_pod_binding_by_token("default.web-0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.spec.global_ip, reserved.spec.global_ip);
        assert!(registry
            .find_pod_binding_by_token("default.web-1")
            .await
            .unwrap()
            .is_none());

        let released = registry.release_pod_binding(&found).await.unwrap();
        assert!(released.is_free());
        assert_eq!(released.spec.public_key, reserved.spec.public_key);
    }

    #[tokio::test]
    async fn test_service_address_prefers_free_list() {
        let (registry, _store) = registry().await;
        registry
            .counter()
            .advance(CounterKind::Service, 10)
            .await
            .unwrap();
        registry
            .counter()
            .push_free_service_addr(Ipv4Addr::new(10, 90, 0, 9))
            .await
            .unwrap();

        let addr = registry.allocate_service_address().await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 90, 0, 9));
        assert_eq!(registry.counter().read().await.unwrap().spec.svc_counter, 20);

        let addr = registry.allocate_service_address().await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 90, 0, 21));
        assert_eq!(registry.counter().read().await.unwrap().spec.svc_counter, 21);
    }

    #[tokio::test]
    async fn test_service_binding_delete_returns_address() {
        let (registry, _store) = registry().await;
        let svc = ObjectRef::new("shop", "cart");
        let addr = registry.allocate_service_address().await.unwrap();
        let binding = registry
            .create_service_binding(addr, svc.clone(), Ipv4Addr::new(10, 96, 0, 3), vec![ServicePort::tcp(80)])
            .await
            .unwrap();

        assert!(registry.find_service_binding(&svc).await.unwrap().is_some());

        registry.delete_service_binding(&binding).await.unwrap();
        assert!(registry.find_service_binding(&svc).await.unwrap().is_none());
        assert_eq!(
            registry.counter().read().await.unwrap().spec.free_service_addrs,
            vec![addr.to_string()]
        );
    }

    #[tokio::test]
    async fn test_free_list_writes_survive_counter_races() {
        let (registry, store) = faulty_registry(RegistryConfig::default()).await;
        let svc = ObjectRef::new("shop", "cart");
        let addr = registry.allocate_service_address().await.unwrap();
        let binding = registry
            .create_service_binding(addr, svc, Ipv4Addr::new(10, 96, 0, 3), vec![ServicePort::tcp(80)])
            .await
            .unwrap();

        store.race_free_list_patches(2);
        assert_eq!(registry.delete_service_binding(&binding).await.unwrap(), addr);
        let pool = registry.counter().read().await.unwrap();
        assert_eq!(pool.spec.free_service_addrs, vec![addr.to_string()]);
        assert_eq!(pool.spec.pod_counter, 2);

        store.race_free_list_patches(1);
        assert_eq!(registry.allocate_service_address().await.unwrap(), addr);
        let pool = registry.counter().read().await.unwrap();
        assert!(pool.spec.free_service_addrs.is_empty());
        assert_eq!(pool.spec.pod_counter, 3);
    }

    #[tokio::test]
    async fn test_delete_succeeds_when_free_list_stays_contended() {
        let (registry, store) = faulty_registry(RegistryConfig {
            conflict_retry_window: Duration::from_millis(50),
            ..Default::default()
        })
        .await;
        let svc = ObjectRef::new("shop", "cart");
        let addr = registry.allocate_service_address().await.unwrap();
        let binding = registry
            .create_service_binding(addr, svc.clone(), Ipv4Addr::new(10, 96, 0, 3), vec![])
            .await
            .unwrap();

        store.race_free_list_patches(usize::MAX);
        assert_eq!(registry.delete_service_binding(&binding).await.unwrap(), addr);
        assert!(registry.find_service_binding(&svc).await.unwrap().is_none());

        let err = registry.return_service_address(addr).await.unwrap_err();
        assert_matches!(err, Error::Conflict { .. });
    }

    #[tokio::test]
    async fn test_stalled_store_call_times_out() {
        let (registry, store) = faulty_registry(RegistryConfig {
            batch_size: 2,
            store_timeout: Duration::from_millis(20),
            ..Default::default()
        })
        .await;
        store.stall_pod_creates();

        let err = registry.allocate_pod_batch().await.unwrap_err();
        assert_matches!(err, Error::StoreTimeout(_, ref op) if op == "create pod binding");
    }

    #[tokio::test]
    async fn test_relabel_makes_legacy_binding_findable() {
        let (registry, store) = registry().await;
        let mut legacy = PodBinding::free(Ipv4Addr::new(10, 80, 0, 40), "p".into(), "k".into());
        legacy.spec.reservation_token = "default.web-0".into();
        legacy
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL_RESERVED.into(), "true".into());
        let legacy = store.create_pod_binding(legacy).await.unwrap();

        assert!(registry
            .find_pod_binding_by_token("default.web-0")
            .await
            .unwrap()
            .is_none());

        registry.relabel_pod_binding(&legacy).await.unwrap();
        let found = registry
            .find_pod_binding_by_token("default.web-0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.spec.global_ip, "10.80.0.40");
    }
}
