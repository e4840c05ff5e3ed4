//! REST API Handlers
//!
//! Registration endpoints called by the cluster's pod and service
//! watchers. Every response body is plain text: the client config for
//! pods, the global address for services, the error message otherwise.

use crate::controlplane::Manager;
use crate::crd::{ObjectRef, ServicePort};
use crate::domain::ports::ServiceDescriptor;
use crate::error::Error;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

/// Longest namespace or object name accepted
const MAX_NAME_LEN: usize = 253;

// =============================================================================
// Request Types
// =============================================================================

/// Optional body of a service registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistrationRequest {
    #[serde(rename = "serviceIP")]
    pub service_ip: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl ServiceRegistrationRequest {
    fn into_descriptor(self) -> Result<ServiceDescriptor, Error> {
        let service_ip = parse_ipv4(&self.service_ip)?;
        Ok(ServiceDescriptor {
            service_ip,
            ports: self.ports,
        })
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    manager: Arc<Manager>,
}

impl RestRouter {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            manager: self.manager,
        };

        Router::new()
            // Pod endpoints
            .route("/pod/:namespace/:name", put(reserve_pod).delete(release_pod))
            .route("/pod/:namespace/:name/:ip", put(bind_pod))
            // Service endpoints
            .route(
                "/service/:namespace/:name",
                put(register_service).delete(release_service),
            )
            // Health endpoint
            .route("/healthz", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Reserve a binding for a pod whose address is not known yet
async fn reserve_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let pod = match object_ref(namespace, name) {
        Ok(pod) => pod,
        Err(e) => return error_response(e),
    };

    match state.manager.register_pod(pod, None).await {
        Ok(reg) => (StatusCode::OK, reg.client_config).into_response(),
        Err(e) => error_response(e),
    }
}

/// Reserve (or look up) a binding and record the pod's address
async fn bind_pod(
    State(state): State<AppState>,
    Path((namespace, name, ip)): Path<(String, String, String)>,
) -> Response {
    let request = object_ref(namespace, name).and_then(|pod| parse_ipv4(&ip).map(|ip| (pod, ip)));
    let (pod, pod_ip) = match request {
        Ok(parsed) => parsed,
        Err(e) => return error_response(e),
    };

    match state.manager.register_pod(pod, Some(pod_ip)).await {
        Ok(reg) => (StatusCode::OK, reg.client_config).into_response(),
        Err(e) => error_response(e),
    }
}

/// Return a pod's binding to the free pool
async fn release_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let pod = match object_ref(namespace, name) {
        Ok(pod) => pod,
        Err(e) => return error_response(e),
    };

    match state.manager.deregister_pod(&pod).await {
        Ok(released) => (StatusCode::OK, released.spec.global_ip).into_response(),
        Err(e) => error_response(e),
    }
}

/// Expose a service on a global address
async fn register_service(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let service = match object_ref(namespace, name) {
        Ok(service) => service,
        Err(e) => return error_response(e),
    };

    let descriptor = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let parsed = serde_json::from_slice::<ServiceRegistrationRequest>(&body)
            .map_err(|e| Error::ApiValidation(format!("invalid service body: {}", e)))
            .and_then(ServiceRegistrationRequest::into_descriptor);
        match parsed {
            Ok(descriptor) => Some(descriptor),
            Err(e) => return error_response(e),
        }
    };

    match state.manager.register_service(service, descriptor).await {
        Ok(binding) => (StatusCode::OK, binding.spec.global_ip).into_response(),
        Err(e) => error_response(e),
    }
}

/// Withdraw a service and free its address
async fn release_service(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let service = match object_ref(namespace, name) {
        Ok(service) => service,
        Err(e) => return error_response(e),
    };

    match state.manager.deregister_service(&service).await {
        Ok(global_ip) => (StatusCode::OK, global_ip.to_string()).into_response(),
        Err(e) => error_response(e),
    }
}

/// Liveness
async fn health_check() -> &'static str {
    "ok"
}

// =============================================================================
// Helpers
// =============================================================================

/// HTTP status for a failed operation
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::ApiValidation(_) | Error::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        Error::BindingNotFound { .. } | Error::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
        Error::AllocationPending { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        if err.is_retryable() {
            warn!(error = %err, "Request failed, caller may retry");
        } else {
            error!(error = %err, "Request failed");
        }
    } else {
        debug!(error = %err, %status, "Request rejected");
    }
    (status, err.to_string()).into_response()
}

fn object_ref(namespace: String, name: String) -> Result<ObjectRef, Error> {
    validate_name("namespace", &namespace)?;
    validate_name("name", &name)?;
    Ok(ObjectRef::new(namespace, name))
}

/// DNS-subdomain shaped: lowercase alphanumerics, `-` and `.`, starting
/// and ending alphanumeric
fn validate_name(field: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(Error::ApiValidation(format!(
            "{} must be 1-{} characters",
            field, MAX_NAME_LEN
        )));
    }

    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let valid = value.chars().all(|c| allowed(c) || c == '-' || c == '.')
        && value.starts_with(allowed)
        && value.ends_with(allowed);

    if !valid {
        return Err(Error::ApiValidation(format!(
            "invalid {} {:?}",
            field, value
        )));
    }
    Ok(())
}

fn parse_ipv4(value: &str) -> Result<Ipv4Addr, Error> {
    value
        .parse()
        .map_err(|_| Error::ApiValidation(format!("not an IPv4 address: {:?}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManagerConfig, MeshOptions};
    use crate::ipam::RegistryConfig;
    use crate::mesh::MeshKeyPair;
    use crate::runtime::tests::RecordingRunner;
    use crate::runtime::SyncConfig;
    use crate::store::memory::tests::FaultyStore;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use std::time::Duration;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = ManagerConfig::new(
            RegistryConfig {
                batch_size: 4,
                ..Default::default()
            },
            MeshOptions::new(MeshKeyPair::generate(), "gw.test:51820"),
            SyncConfig {
                local_mode: true,
                ..Default::default()
            },
        )
        .unwrap();
        let manager = Manager::new(
            config,
            store.clone(),
            store.clone(),
            Arc::new(RecordingRunner::ok()),
        )
        .unwrap();
        manager.warm().await.unwrap();
        (RestRouter::new(manager).build(), store)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/healthz", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_pod_lifecycle() {
        let (app, _) = app().await;

        let (status, config) = send(&app, "PUT", "/pod/default/web-0/172.16.0.5", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(config.starts_with("[Interface]"));
        assert!(config.contains("Endpoint = gw.test:51820"));

        let (status, again) = send(&app, "PUT", "/pod/default/web-0", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again, config);

        let (status, _) = send(&app, "DELETE", "/pod/default/web-0", "").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "DELETE", "/pod/default/web-0", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("default/web-0"));
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let (app, _) = app().await;

        let (status, _) = send(&app, "PUT", "/pod/default/web-0/not-an-ip", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "PUT", "/pod/Bad_NS/web-0", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "PUT", "/pod/default/-web", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "PUT", "/service/shop/cart", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "PUT",
            "/service/shop/cart",
            r#"{"serviceIP": "fd00::1", "ports": []}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let (app, store) = app().await;
        let body = r#"{"serviceIP": "10.96.0.7", "ports": [{"port": 80, "protocol": "TCP"}, {"port": 53, "protocol": "UDP"}]}"#;

        let (status, global_ip) = send(&app, "PUT", "/service/shop/cart", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(global_ip, "10.90.0.11");

        // re-registration keeps the address, even without a body
        let (status, again) = send(&app, "PUT", "/service/shop/cart", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again, global_ip);

        let (status, released) = send(&app, "DELETE", "/service/shop/cart", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(released, global_ip);

        store.register_service(
            ObjectRef::new("shop", "search"),
            ServiceDescriptor {
                service_ip: Ipv4Addr::new(10, 96, 0, 8),
                ports: vec![ServicePort::tcp(9200)],
            },
        );
        let (status, reused) = send(&app, "PUT", "/service/shop/search", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reused, global_ip);
    }

    #[tokio::test]
    async fn test_unknown_service_is_404() {
        let (app, _) = app().await;
        let (status, _) = send(&app, "PUT", "/service/shop/missing", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "DELETE", "/service/shop/missing", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pod_reservation_pending_is_503() {
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(FaultyStore::new(memory.clone()));
        let mut config = ManagerConfig::new(
            RegistryConfig::default(),
            MeshOptions::new(MeshKeyPair::generate(), "gw.test:51820"),
            SyncConfig {
                local_mode: true,
                ..Default::default()
            },
        )
        .unwrap();
        config.batch_poll_delay = Duration::from_millis(5);
        config.batch_poll_attempts = 2;
        let manager = Manager::new(config, store.clone(), memory, Arc::new(RecordingRunner::ok()))
            .unwrap();
        manager.warm().await.unwrap();
        store.stall_pod_creates();
        let app = RestRouter::new(manager).build();

        let (status, body) = send(&app, "PUT", "/pod/default/web-0", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("default.web-0"));
    }

    #[test]
    fn test_status_mapping() {
        let pending = Error::AllocationPending {
            token: "default.web-0".into(),
        };
        assert_eq!(status_for(&pending), StatusCode::SERVICE_UNAVAILABLE);

        let failed = Error::CommandFailed {
            command: "nginx -s reload".into(),
            code: Some(1),
            stderr: String::new(),
        };
        assert_eq!(status_for(&failed), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            status_for(&Error::ApiValidation("x".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("name", "web-0").is_ok());
        assert!(validate_name("name", "a.b-c").is_ok());
        assert!(validate_name("name", "").is_err());
        assert!(validate_name("name", "Web").is_err());
        assert!(validate_name("name", "web-").is_err());
        assert!(validate_name("name", &"a".repeat(254)).is_err());
    }
}
