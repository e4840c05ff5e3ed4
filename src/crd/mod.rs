//! Custom Resource Definitions for the Mesh Network Manager
//!
//! This module contains all CRD types:
//! - PodBinding: one overlay address pre-allocated for (and later reserved by) a pod
//! - ServiceBinding: one overlay address bound to a cluster-internal service
//! - AddressPool: singleton allocation counters and the service free-list

pub mod address_pool;
pub mod pod_binding;
pub mod service_binding;

pub use address_pool::*;
pub use pod_binding::*;
pub use service_binding::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// API group shared by every CRD of the manager
pub const API_GROUP: &str = "network.billyronks.io";

/// Label mirroring whether a pod binding is reserved ("true"/"false")
pub const LABEL_RESERVED: &str = "network.billyronks.io/reserved";

/// Label carrying [`token_hash`] of the reservation token of a held pod binding
pub const LABEL_TOKEN_HASH: &str = "network.billyronks.io/token-hash";

/// Label carrying the namespace of the service a binding serves
pub const LABEL_SERVICE_NAMESPACE: &str = "network.billyronks.io/service-namespace";

/// Label carrying the name of the service a binding serves
pub const LABEL_SERVICE_NAME: &str = "network.billyronks.io/service-name";

/// Reservation token of a binding nobody holds
pub const FREE_TOKEN: &str = "false";

/// Turn an overlay address into a valid object name (`10.80.0.6` -> `10-80-0-6`)
pub fn sanitize_address(addr: &std::net::Ipv4Addr) -> String {
    addr.to_string().replace('.', "-")
}

/// Label-safe digest of a reservation token (first 16 bytes of SHA-256, hex)
pub fn token_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..16])
}

/// Reference to a namespaced workload object (pod or service)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reservation token identifying the owner of a binding
    pub fn token(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_address() {
        let addr: std::net::Ipv4Addr = "10.80.0.6".parse().unwrap();
        assert_eq!(sanitize_address(&addr), "10-80-0-6");
    }

    #[test]
    fn test_token_hash_fits_label_value() {
        let long = format!("{}.{}", "n".repeat(63), "p".repeat(253));
        let hash = token_hash(&long);
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, token_hash(&long));
        assert_ne!(token_hash("default.web-0"), token_hash("default.web-1"));
    }

    #[test]
    fn test_object_ref_token() {
        let owner = ObjectRef::new("payments", "api-7d9f");
        assert_eq!(owner.token(), "payments.api-7d9f");
        assert_eq!(owner.to_string(), "payments/api-7d9f");
    }
}
