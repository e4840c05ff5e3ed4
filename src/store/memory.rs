//! In-Memory Binding Store
//!
//! Keeps every record in process memory while enforcing the same contract
//! as the API server: monotonically increasing resource versions, stale
//! write rejection, label selectors and continue-token pagination. Used by
//! `--standalone` mode and tests.

use crate::crd::{AddressPool, ObjectRef, PodBinding, PoolPatch, ServiceBinding, ADDRESS_POOL_NAME};
use crate::domain::ports::{BindingStore, ListQuery, Page, ServiceCatalog, ServiceDescriptor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::Resource;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct MemoryState {
    pool: Option<AddressPool>,
    pods: BTreeMap<String, PodBinding>,
    services: BTreeMap<String, ServiceBinding>,
    catalog: HashMap<ObjectRef, ServiceDescriptor>,
}

/// Process-local store with API-server-like semantics
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    version: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a service resolvable through [`ServiceCatalog`]
    pub fn register_service(&self, service: ObjectRef, descriptor: ServiceDescriptor) {
        self.state.write().catalog.insert(service, descriptor);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn next_version(&self) -> String {
        self.writes.fetch_add(1, Ordering::Relaxed);
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

// =============================================================================
// Generic helpers
// =============================================================================

fn name_of(meta: &ObjectMeta) -> Result<String> {
    meta.name
        .clone()
        .ok_or_else(|| Error::Internal("object without metadata.name".into()))
}

fn matches_selector(meta: &ObjectMeta, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = meta.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term.trim()),
        })
}

fn page<K>(objects: &BTreeMap<String, K>, query: &ListQuery) -> Page<K>
where
    K: Resource + Clone,
{
    let mut items = Vec::new();
    let mut continue_token = None;

    let candidates = objects
        .iter()
        .filter(|(name, _)| match &query.continue_token {
            Some(token) => name.as_str() > token.as_str(),
            None => true,
        })
        .filter(|(_, obj)| matches_selector(obj.meta(), query.label_selector.as_deref()));

    for (name, obj) in candidates {
        if query.limit > 0 && items.len() == query.limit as usize {
            continue_token = items
                .last()
                .and_then(|last: &K| last.meta().name.clone())
                .or_else(|| Some(name.clone()));
            break;
        }
        items.push(obj.clone());
    }

    Page {
        items,
        continue_token,
    }
}

fn check_version(kind: &str, name: &str, stored: &ObjectMeta, incoming: &ObjectMeta) -> Result<()> {
    match &incoming.resource_version {
        Some(version) if stored.resource_version.as_ref() != Some(version) => Err(Error::Conflict {
            kind: kind.into(),
            name: name.into(),
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// BindingStore
// =============================================================================

#[async_trait]
impl BindingStore for MemoryStore {
    async fn get_pool(&self) -> Result<Option<AddressPool>> {
        Ok(self.state.read().pool.clone())
    }

    async fn create_pool(&self, mut pool: AddressPool) -> Result<AddressPool> {
        let mut state = self.state.write();
        if state.pool.is_some() {
            return Err(Error::ResourceExists {
                kind: "AddressPool".into(),
                name: ADDRESS_POOL_NAME.into(),
            });
        }
        pool.metadata.resource_version = Some(self.next_version());
        state.pool = Some(pool.clone());
        Ok(pool)
    }

    async fn patch_pool(&self, resource_version: &str, patch: &PoolPatch) -> Result<AddressPool> {
        let mut state = self.state.write();
        let pool = state.pool.as_mut().ok_or_else(|| Error::ResourceNotFound {
            kind: "AddressPool".into(),
            name: ADDRESS_POOL_NAME.into(),
        })?;

        if pool.metadata.resource_version.as_deref() != Some(resource_version) {
            return Err(Error::Conflict {
                kind: "AddressPool".into(),
                name: ADDRESS_POOL_NAME.into(),
            });
        }

        patch.apply_to(&mut pool.spec);
        pool.metadata.resource_version = Some(self.next_version());
        Ok(pool.clone())
    }

    async fn list_pod_bindings(&self, query: &ListQuery) -> Result<Page<PodBinding>> {
        Ok(page(&self.state.read().pods, query))
    }

    async fn create_pod_binding(&self, mut binding: PodBinding) -> Result<PodBinding> {
        let name = name_of(&binding.metadata)?;
        let mut state = self.state.write();
        if state.pods.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "PodBinding".into(),
                name,
            });
        }
        binding.metadata.resource_version = Some(self.next_version());
        state.pods.insert(name, binding.clone());
        Ok(binding)
    }

    async fn replace_pod_binding(&self, mut binding: PodBinding) -> Result<PodBinding> {
        let name = name_of(&binding.metadata)?;
        let mut state = self.state.write();
        let stored = state.pods.get(&name).ok_or_else(|| Error::ResourceNotFound {
            kind: "PodBinding".into(),
            name: name.clone(),
        })?;
        check_version("PodBinding", &name, &stored.metadata, &binding.metadata)?;

        binding.metadata.resource_version = Some(self.next_version());
        state.pods.insert(name, binding.clone());
        Ok(binding)
    }

    async fn list_service_bindings(&self, query: &ListQuery) -> Result<Page<ServiceBinding>> {
        Ok(page(&self.state.read().services, query))
    }

    async fn create_service_binding(&self, mut binding: ServiceBinding) -> Result<ServiceBinding> {
        let name = name_of(&binding.metadata)?;
        let mut state = self.state.write();
        if state.services.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "ServiceBinding".into(),
                name,
            });
        }
        binding.metadata.resource_version = Some(self.next_version());
        state.services.insert(name, binding.clone());
        Ok(binding)
    }

    async fn delete_service_binding(&self, name: &str) -> Result<()> {
        match self.state.write().services.remove(name) {
            Some(_) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::ResourceNotFound {
                kind: "ServiceBinding".into(),
                name: name.into(),
            }),
        }
    }
}

#[async_trait]
impl ServiceCatalog for MemoryStore {
    async fn describe(&self, service: &ObjectRef) -> Result<ServiceDescriptor> {
        self.state
            .read()
            .catalog
            .get(service)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Service".into(),
                name: service.to_string(),
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::{AddressPoolSpec, CounterKind, LABEL_RESERVED};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    /// Wraps a [`MemoryStore`] and injects the failures a busy cluster produces
    pub(crate) struct FaultyStore {
        pub inner: Arc<MemoryStore>,
        /// Free-list patches that lose a race against a pod counter advance
        free_list_races: AtomicUsize,
        /// Pod binding creations never complete
        stall_pod_creates: AtomicBool,
    }

    impl FaultyStore {
        pub(crate) fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                free_list_races: AtomicUsize::new(0),
                stall_pod_creates: AtomicBool::new(false),
            }
        }

        pub(crate) fn race_free_list_patches(&self, count: usize) {
            self.free_list_races.store(count, Ordering::SeqCst);
        }

        pub(crate) fn stall_pod_creates(&self) {
            self.stall_pod_creates.store(true, Ordering::SeqCst);
        }

        fn take_race(&self) -> bool {
            self.free_list_races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl BindingStore for FaultyStore {
        async fn get_pool(&self) -> Result<Option<AddressPool>> {
            self.inner.get_pool().await
        }

        async fn create_pool(&self, pool: AddressPool) -> Result<AddressPool> {
            self.inner.create_pool(pool).await
        }

        async fn patch_pool(&self, resource_version: &str, patch: &PoolPatch) -> Result<AddressPool> {
            if matches!(patch, PoolPatch::SetFreeList(_)) && self.take_race() {
                // A batch moves the pod counter between our read and write
                if let Some(pool) = self.inner.get_pool().await? {
                    let version = pool.metadata.resource_version.clone().unwrap_or_default();
                    let next = pool.spec.pod_counter + 1;
                    self.inner
                        .patch_pool(&version, &PoolPatch::SetCounter(CounterKind::Pod, next))
                        .await?;
                }
            }
            self.inner.patch_pool(resource_version, patch).await
        }

        async fn list_pod_bindings(&self, query: &ListQuery) -> Result<Page<PodBinding>> {
            self.inner.list_pod_bindings(query).await
        }

        async fn create_pod_binding(&self, binding: PodBinding) -> Result<PodBinding> {
            if self.stall_pod_creates.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.create_pod_binding(binding).await
        }

        async fn replace_pod_binding(&self, binding: PodBinding) -> Result<PodBinding> {
            self.inner.replace_pod_binding(binding).await
        }

        async fn list_service_bindings(&self, query: &ListQuery) -> Result<Page<ServiceBinding>> {
            self.inner.list_service_bindings(query).await
        }

        async fn create_service_binding(&self, binding: ServiceBinding) -> Result<ServiceBinding> {
            self.inner.create_service_binding(binding).await
        }

        async fn delete_service_binding(&self, name: &str) -> Result<()> {
            self.inner.delete_service_binding(name).await
        }
    }

    fn free(last_octet: u8) -> PodBinding {
        PodBinding::free(
            std::net::Ipv4Addr::new(10, 80, 0, last_octet),
            "priv".into(),
            "pub".into(),
        )
    }

    #[tokio::test]
    async fn test_create_conflicts_on_duplicate() {
        let store = MemoryStore::new();
        store.create_pod_binding(free(2)).await.unwrap();

        let err = store.create_pod_binding(free(2)).await.unwrap_err();
        assert_matches!(err, Error::ResourceExists { .. });
    }

    #[tokio::test]
    async fn test_stale_replace_is_rejected() {
        let store = MemoryStore::new();
        let created = store.create_pod_binding(free(2)).await.unwrap();

        let mut first = created.clone();
        first.reserve("default.a");
        store.replace_pod_binding(first).await.unwrap();

        let mut stale = created;
        stale.reserve("default.b");
        let err = store.replace_pod_binding(stale).await.unwrap_err();
        assert_matches!(err, Error::Conflict { .. });
    }

    #[tokio::test]
    async fn test_label_selector_and_pagination() {
        let store = MemoryStore::new();
        for octet in 2..12 {
            let mut b = free(octet);
            if octet % 2 == 0 {
                b.reserve("default.x");
            }
            store.create_pod_binding(b).await.unwrap();
        }

        let free_query = ListQuery::labels(format!("{}=false", LABEL_RESERVED), 3);
        let first = store.list_pod_bindings(&free_query).await.unwrap();
        assert_eq!(first.items.len(), 3);
        assert!(first.items.iter().all(|b| b.is_free()));
        let token = first.continue_token.clone().unwrap();

        let second = store
            .list_pod_bindings(&free_query.continued(token))
            .await
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.continue_token.is_none());
    }

    #[tokio::test]
    async fn test_pool_patch_requires_current_version() {
        let store = MemoryStore::new();
        let pool = store
            .create_pool(AddressPool::new(ADDRESS_POOL_NAME, AddressPoolSpec::default()))
            .await
            .unwrap();
        let version = pool.metadata.resource_version.unwrap();

        let patched = store
            .patch_pool(&version, &PoolPatch::SetCounter(CounterKind::Pod, 32))
            .await
            .unwrap();
        assert_eq!(patched.spec.pod_counter, 32);

        let err = store
            .patch_pool(&version, &PoolPatch::SetCounter(CounterKind::Pod, 64))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Conflict { .. });
    }

    #[tokio::test]
    async fn test_delete_missing_service_binding() {
        let store = MemoryStore::new();
        let err = store.delete_service_binding("10-90-0-9").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
