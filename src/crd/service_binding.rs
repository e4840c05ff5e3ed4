//! ServiceBinding CRD
//!
//! One overlay address fronting a cluster-internal service. Unlike pod
//! bindings these are deleted on release and the address goes back to the
//! pool free-list.

use super::pod_binding::set_label;
use super::{sanitize_address, ObjectRef, LABEL_SERVICE_NAME, LABEL_SERVICE_NAMESPACE};
use crate::error::{Error, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

// =============================================================================
// ServiceBinding CRD
// =============================================================================

/// ServiceBinding exposes a cluster service on a mesh-reachable address.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.billyronks.io",
    version = "v1",
    kind = "ServiceBinding",
    plural = "servicebindings",
    shortname = "sb",
    printcolumn = r#"{"name": "GlobalIP", "type": "string", "jsonPath": ".spec.globalIP"}"#,
    printcolumn = r#"{"name": "ServiceIP", "type": "string", "jsonPath": ".spec.serviceIP"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Overlay address, immutable
    #[serde(rename = "globalIP")]
    pub global_ip: String,

    /// Cluster IP of the service
    #[serde(rename = "serviceIP")]
    pub service_ip: String,

    /// Service being exposed
    pub service_ref: ObjectRef,

    /// Exposed ports, in declaration order
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

/// One exposed port of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServicePort {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl ServicePort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

/// Transport protocol of a service port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            other => Err(Error::ApiValidation(format!("unknown protocol: {}", other))),
        }
    }
}

impl ServiceBinding {
    /// Build a binding for a newly allocated address
    pub fn for_service(
        global_ip: Ipv4Addr,
        service: ObjectRef,
        service_ip: Ipv4Addr,
        ports: Vec<ServicePort>,
    ) -> Self {
        let spec = ServiceBindingSpec {
            global_ip: global_ip.to_string(),
            service_ip: service_ip.to_string(),
            service_ref: service.clone(),
            ports,
        };

        let mut binding = ServiceBinding::new(&sanitize_address(&global_ip), spec);
        set_label(&mut binding.metadata, LABEL_SERVICE_NAMESPACE, &service.namespace);
        set_label(&mut binding.metadata, LABEL_SERVICE_NAME, &service.name);
        binding
    }

    /// Parsed overlay address
    pub fn global_ip(&self) -> Result<Ipv4Addr> {
        self.spec
            .global_ip
            .parse()
            .map_err(|_| Error::InvalidAddress(self.spec.global_ip.clone()))
    }
}

/// Label selector matching the binding of `service`
pub fn service_selector(service: &ObjectRef) -> String {
    format!(
        "{}={},{}={}",
        LABEL_SERVICE_NAMESPACE, service.namespace, LABEL_SERVICE_NAME, service.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_service_labels() {
        let svc = ObjectRef::new("shop", "cart");
        let b = ServiceBinding::for_service(
            "10.90.0.21".parse().unwrap(),
            svc.clone(),
            "10.96.4.2".parse().unwrap(),
            vec![ServicePort::tcp(80)],
        );

        let labels = b.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_SERVICE_NAMESPACE).unwrap(), "shop");
        assert_eq!(labels.get(LABEL_SERVICE_NAME).unwrap(), "cart");
        assert_eq!(b.metadata.name.as_deref(), Some("10-90-0-21"));
        assert_eq!(
            service_selector(&svc),
            "network.billyronks.io/service-namespace=shop,network.billyronks.io/service-name=cart"
        );
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("icmp".parse::<Protocol>().is_err());

        let port: ServicePort = serde_json::from_str(r#"{"port": 53, "protocol": "UDP"}"#).unwrap();
        assert_eq!(port, ServicePort::udp(53));

        let port: ServicePort = serde_json::from_str(r#"{"port": 80}"#).unwrap();
        assert_eq!(port.protocol, Protocol::Tcp);
    }
}
