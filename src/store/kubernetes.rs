//! Kubernetes Binding Store
//!
//! Persists bindings and the address pool as cluster-scoped custom
//! resources. The API server supplies optimistic concurrency through
//! `resourceVersion`; 404 and 409 responses are mapped onto the store
//! error taxonomy.

use crate::crd::{
    AddressPool, ObjectRef, PodBinding, PoolPatch, Protocol, ServiceBinding, ServicePort,
    ADDRESS_POOL_NAME,
};
use crate::domain::ports::{BindingStore, ListQuery, Page, ServiceCatalog, ServiceDescriptor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

/// How a 409 from the API server should be read
#[derive(Debug, Clone, Copy)]
enum WriteKind {
    Create,
    Update,
}

fn map_kube_error(err: kube::Error, kind: &str, name: &str, write: WriteKind) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        },
        kube::Error::Api(ae) if ae.code == 409 => match write {
            WriteKind::Create => Error::ResourceExists {
                kind: kind.into(),
                name: name.into(),
            },
            WriteKind::Update => Error::Conflict {
                kind: kind.into(),
                name: name.into(),
            },
        },
        _ => Error::Kube(err),
    }
}

fn list_params(query: &ListQuery) -> ListParams {
    let mut params = ListParams::default();
    if let Some(selector) = &query.label_selector {
        params = params.labels(selector);
    }
    if query.limit > 0 {
        params = params.limit(query.limit);
    }
    if let Some(token) = &query.continue_token {
        params = params.continue_token(token);
    }
    params
}

fn into_page<K: Clone>(list: ObjectList<K>) -> Page<K> {
    let continue_token = list.metadata.continue_.filter(|token| !token.is_empty());
    Page {
        items: list.items,
        continue_token,
    }
}

/// Store backed by the cluster API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pools(&self) -> Api<AddressPool> {
        Api::all(self.client.clone())
    }

    fn pod_bindings(&self) -> Api<PodBinding> {
        Api::all(self.client.clone())
    }

    fn service_bindings(&self) -> Api<ServiceBinding> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl BindingStore for KubeStore {
    async fn get_pool(&self) -> Result<Option<AddressPool>> {
        Ok(self.pools().get_opt(ADDRESS_POOL_NAME).await?)
    }

    async fn create_pool(&self, pool: AddressPool) -> Result<AddressPool> {
        self.pools()
            .create(&PostParams::default(), &pool)
            .await
            .map_err(|e| map_kube_error(e, "AddressPool", ADDRESS_POOL_NAME, WriteKind::Create))
    }

    async fn patch_pool(&self, resource_version: &str, patch: &PoolPatch) -> Result<AddressPool> {
        let body = patch.to_merge_patch(resource_version);
        debug!(patch = %body, "Patching address pool");
        self.pools()
            .patch(ADDRESS_POOL_NAME, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_kube_error(e, "AddressPool", ADDRESS_POOL_NAME, WriteKind::Update))
    }

    async fn list_pod_bindings(&self, query: &ListQuery) -> Result<Page<PodBinding>> {
        let list = self.pod_bindings().list(&list_params(query)).await?;
        Ok(into_page(list))
    }

    async fn create_pod_binding(&self, binding: PodBinding) -> Result<PodBinding> {
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.pod_bindings()
            .create(&PostParams::default(), &binding)
            .await
            .map_err(|e| map_kube_error(e, "PodBinding", &name, WriteKind::Create))
    }

    async fn replace_pod_binding(&self, binding: PodBinding) -> Result<PodBinding> {
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.pod_bindings()
            .replace(&name, &PostParams::default(), &binding)
            .await
            .map_err(|e| map_kube_error(e, "PodBinding", &name, WriteKind::Update))
    }

    async fn list_service_bindings(&self, query: &ListQuery) -> Result<Page<ServiceBinding>> {
        let list = self.service_bindings().list(&list_params(query)).await?;
        Ok(into_page(list))
    }

    async fn create_service_binding(&self, binding: ServiceBinding) -> Result<ServiceBinding> {
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.service_bindings()
            .create(&PostParams::default(), &binding)
            .await
            .map_err(|e| map_kube_error(e, "ServiceBinding", &name, WriteKind::Create))
    }

    async fn delete_service_binding(&self, name: &str) -> Result<()> {
        self.service_bindings()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(e, "ServiceBinding", name, WriteKind::Update))?;
        Ok(())
    }
}

// =============================================================================
// Service Catalog
// =============================================================================

/// Reads core/v1 Services to learn cluster IP and ports
#[derive(Clone)]
pub struct KubeServiceCatalog {
    client: Client,
}

impl KubeServiceCatalog {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceCatalog for KubeServiceCatalog {
    async fn describe(&self, service: &ObjectRef) -> Result<ServiceDescriptor> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &service.namespace);
        let svc = api
            .get(&service.name)
            .await
            .map_err(|e| map_kube_error(e, "Service", &service.to_string(), WriteKind::Update))?;
        descriptor_from_service(service, &svc)
    }
}

fn descriptor_from_service(service: &ObjectRef, svc: &Service) -> Result<ServiceDescriptor> {
    let spec = svc
        .spec
        .as_ref()
        .ok_or_else(|| Error::ApiValidation(format!("service {} has no spec", service)))?;

    let cluster_ip = spec.cluster_ip.as_deref().unwrap_or("None");
    let service_ip = cluster_ip.parse().map_err(|_| {
        Error::ApiValidation(format!(
            "service {} has no IPv4 cluster IP ({})",
            service, cluster_ip
        ))
    })?;

    let ports = spec
        .ports
        .iter()
        .flatten()
        .map(|p| {
            let protocol = p
                .protocol
                .as_deref()
                .map(str::parse::<Protocol>)
                .transpose()?
                .unwrap_or_default();
            let port = u16::try_from(p.port)
                .map_err(|_| Error::ApiValidation(format!("port out of range: {}", p.port)))?;
            Ok(ServicePort { port, protocol })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ServiceDescriptor { service_ip, ports })
}
