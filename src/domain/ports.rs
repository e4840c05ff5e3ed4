//! Domain Ports - Core trait definitions for the network manager
//!
//! These traits define the boundaries between allocation logic and the
//! outside world: the durable resource store, the service catalog and
//! the host command runner. Adapters implement them.

use crate::crd::{
    AddressPool, ObjectRef, PodBinding, PoolPatch, ServiceBinding, ServicePort,
};
use crate::error::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;

// =============================================================================
// Listing
// =============================================================================

/// Label-selected, paginated list request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Equality selector, `k=v[,k=v]`
    pub label_selector: Option<String>,
    /// Page size, 0 = unbounded
    pub limit: u32,
    /// Continue token from a previous page
    pub continue_token: Option<String>,
}

impl ListQuery {
    pub fn all(limit: u32) -> Self {
        Self {
            label_selector: None,
            limit,
            continue_token: None,
        }
    }

    pub fn labels(selector: impl Into<String>, limit: u32) -> Self {
        Self {
            label_selector: Some(selector.into()),
            limit,
            continue_token: None,
        }
    }

    /// Same query, positioned at the next page
    pub fn continued(&self, token: String) -> Self {
        Self {
            continue_token: Some(token),
            ..self.clone()
        }
    }
}

/// One page of list results
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continue_token: Option<String>,
}

// =============================================================================
// Durable Store
// =============================================================================

/// Strongly consistent object store holding every binding.
///
/// Writes carry the `resourceVersion` read earlier; a stale version is
/// rejected with [`crate::Error::Conflict`]. Creating an existing object
/// fails with [`crate::Error::ResourceExists`].
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Read the singleton pool record
    async fn get_pool(&self) -> Result<Option<AddressPool>>;

    /// Create the singleton pool record
    async fn create_pool(&self, pool: AddressPool) -> Result<AddressPool>;

    /// Patch one field of the pool, guarded by `resource_version`
    async fn patch_pool(&self, resource_version: &str, patch: &PoolPatch) -> Result<AddressPool>;

    async fn list_pod_bindings(&self, query: &ListQuery) -> Result<Page<PodBinding>>;

    async fn create_pod_binding(&self, binding: PodBinding) -> Result<PodBinding>;

    /// Replace a pod binding, guarded by its `resourceVersion`
    async fn replace_pod_binding(&self, binding: PodBinding) -> Result<PodBinding>;

    async fn list_service_bindings(&self, query: &ListQuery) -> Result<Page<ServiceBinding>>;

    async fn create_service_binding(&self, binding: ServiceBinding) -> Result<ServiceBinding>;

    async fn delete_service_binding(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Service Catalog
// =============================================================================

/// What the cluster knows about a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service_ip: Ipv4Addr,
    pub ports: Vec<ServicePort>,
}

/// Resolves services when the registration request does not describe them
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn describe(&self, service: &ObjectRef) -> Result<ServiceDescriptor>;
}

// =============================================================================
// Host Commands
// =============================================================================

/// Captured result of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs host tooling (`wg`, `wg-quick`, `ip`, `nginx`)
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}
