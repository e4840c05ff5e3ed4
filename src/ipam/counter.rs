//! Address Pool Counter
//!
//! Wraps the singleton [`AddressPool`] record. Every mutation is a merge
//! patch of a single field carrying the `resourceVersion` it was computed
//! from, so a concurrent writer surfaces as [`Error::Conflict`] instead of
//! a lost update. There is no retry loop here; callers re-read and retry.

use super::bounded;
use crate::crd::{AddressPool, AddressPoolSpec, CounterKind, PoolPatch, ADDRESS_POOL_NAME};
use crate::domain::ports::BindingStore;
use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Handle on the singleton pool counter record
#[derive(Clone)]
pub struct AddressPoolCounter {
    store: Arc<dyn BindingStore>,
    /// Initial service counter; offsets below it are kept for system use
    service_reserved: u32,
    timeout: Duration,
}

impl AddressPoolCounter {
    pub fn new(store: Arc<dyn BindingStore>, service_reserved: u32, timeout: Duration) -> Self {
        Self {
            store,
            service_reserved,
            timeout,
        }
    }

    /// Create the pool record if it does not exist yet
    pub async fn ensure_exists(&self) -> Result<AddressPool> {
        if let Some(pool) = bounded(self.timeout, "get pool", self.store.get_pool()).await? {
            return Ok(pool);
        }

        let pool = AddressPool::new(
            ADDRESS_POOL_NAME,
            AddressPoolSpec {
                pod_counter: 0,
                svc_counter: self.service_reserved,
                free_service_addrs: Vec::new(),
            },
        );

        match bounded(self.timeout, "create pool", self.store.create_pool(pool)).await {
            Ok(created) => {
                info!(
                    svc_counter = self.service_reserved,
                    "Created address pool counter"
                );
                Ok(created)
            }
            // Another manager got there first
            Err(e) if e.is_already_exists() => self.read().await,
            Err(e) => Err(e),
        }
    }

    /// Current pool record
    pub async fn read(&self) -> Result<AddressPool> {
        bounded(self.timeout, "get pool", self.store.get_pool())
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "AddressPool".into(),
                name: ADDRESS_POOL_NAME.into(),
            })
    }

    /// Move `kind`'s counter forward by `count`; returns the value before the move
    pub async fn advance(&self, kind: CounterKind, count: u32) -> Result<u32> {
        let pool = self.read().await?;
        let current = pool.spec.counter(kind);
        let next = current.checked_add(count).ok_or_else(|| Error::PoolExhausted {
            pool: format!("{} counter", kind),
        })?;

        self.patch(&pool, PoolPatch::SetCounter(kind, next)).await?;
        debug!(%kind, from = current, to = next, "Advanced address counter");
        Ok(current)
    }

    /// Take the oldest released service address, if any
    pub async fn pop_free_service_addr(&self) -> Result<Option<Ipv4Addr>> {
        let pool = self.read().await?;
        let Some((first, rest)) = pool.spec.free_service_addrs.split_first() else {
            return Ok(None);
        };

        let addr = first
            .parse()
            .map_err(|_| Error::InvalidAddress(first.clone()))?;
        self.patch(&pool, PoolPatch::SetFreeList(rest.to_vec())).await?;
        debug!(%addr, "Reusing released service address");
        Ok(Some(addr))
    }

    /// Return a service address to the free-list
    pub async fn push_free_service_addr(&self, addr: Ipv4Addr) -> Result<()> {
        let pool = self.read().await?;
        let addr = addr.to_string();
        if pool.spec.free_service_addrs.contains(&addr) {
            return Ok(());
        }

        let mut free = pool.spec.free_service_addrs.clone();
        free.push(addr);
        self.patch(&pool, PoolPatch::SetFreeList(free)).await?;
        Ok(())
    }

    async fn patch(&self, pool: &AddressPool, patch: PoolPatch) -> Result<AddressPool> {
        let version = pool.metadata.resource_version.clone().ok_or_else(|| {
            Error::Internal("address pool read without resourceVersion".into())
        })?;
        bounded(
            self.timeout,
            "patch pool",
            self.store.patch_pool(&version, &patch),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn counter(store: Arc<MemoryStore>) -> AddressPoolCounter {
        AddressPoolCounter::new(store, 10, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_ensure_exists_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let counter = counter(store.clone());

        let first = counter.ensure_exists().await.unwrap();
        assert_eq!(first.spec.pod_counter, 0);
        assert_eq!(first.spec.svc_counter, 10);

        counter.advance(CounterKind::Pod, 32).await.unwrap();
        let second = counter.ensure_exists().await.unwrap();
        assert_eq!(second.spec.pod_counter, 32);
    }

    #[tokio::test]
    async fn test_advance_returns_previous_value() {
        let store = Arc::new(MemoryStore::new());
        let counter = counter(store);
        counter.ensure_exists().await.unwrap();

        assert_eq!(counter.advance(CounterKind::Pod, 32).await.unwrap(), 0);
        assert_eq!(counter.advance(CounterKind::Pod, 32).await.unwrap(), 32);
        assert_eq!(counter.advance(CounterKind::Service, 1).await.unwrap(), 10);

        let pool = counter.read().await.unwrap();
        assert_eq!(pool.spec.pod_counter, 64);
        assert_eq!(pool.spec.svc_counter, 11);
    }

    #[tokio::test]
    async fn test_free_list_fifo() {
        let store = Arc::new(MemoryStore::new());
        let counter = counter(store);
        counter.ensure_exists().await.unwrap();

        counter.push_free_service_addr(Ipv4Addr::new(10, 90, 0, 9)).await.unwrap();
        counter.push_free_service_addr(Ipv4Addr::new(10, 90, 0, 4)).await.unwrap();
        counter.push_free_service_addr(Ipv4Addr::new(10, 90, 0, 9)).await.unwrap();

        assert_eq!(
            counter.pop_free_service_addr().await.unwrap(),
            Some(Ipv4Addr::new(10, 90, 0, 9))
        );
        assert_eq!(
            counter.pop_free_service_addr().await.unwrap(),
            Some(Ipv4Addr::new(10, 90, 0, 4))
        );
        assert_eq!(counter.pop_free_service_addr().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_missing_pool() {
        let counter = counter(Arc::new(MemoryStore::new()));
        assert!(counter.read().await.unwrap_err().is_not_found());
    }
}
