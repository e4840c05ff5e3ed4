//! PodBinding CRD
//!
//! One overlay address with its own mesh keypair. Bindings are created in
//! free batches, reserved by a pod on demand and released back to free.
//! They are never deleted, so the keypair is reused by the next owner.

use super::{sanitize_address, token_hash, ObjectRef, FREE_TOKEN, LABEL_RESERVED, LABEL_TOKEN_HASH};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

// =============================================================================
// PodBinding CRD
// =============================================================================

/// PodBinding ties one globally-unique overlay address to a pod.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.billyronks.io",
    version = "v1",
    kind = "PodBinding",
    plural = "podbindings",
    shortname = "pb",
    printcolumn = r#"{"name": "GlobalIP", "type": "string", "jsonPath": ".spec.globalIP"}"#,
    printcolumn = r#"{"name": "Token", "type": "string", "jsonPath": ".spec.reservationToken"}"#,
    printcolumn = r#"{"name": "PodIP", "type": "string", "jsonPath": ".spec.podIP"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PodBindingSpec {
    /// Overlay address, immutable
    #[serde(rename = "globalIP")]
    pub global_ip: String,

    /// Base64 mesh private key handed to the owning pod
    pub private_key: String,

    /// Base64 mesh public key used by the gateway peer entry
    pub public_key: String,

    /// Subnets routed to this peer
    #[serde(default)]
    pub allowed_subnets: Vec<String>,

    /// `"false"` while free, `"<namespace>.<name>"` once reserved
    pub reservation_token: String,

    /// Pod that currently owns the binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ref: Option<ObjectRef>,

    /// Real address of the pod, known only after the second phase
    #[serde(rename = "podIP", default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    /// When the binding was last reserved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub reserved_at: Option<DateTime<Utc>>,
}

impl PodBinding {
    /// Build a free binding for a freshly derived address
    pub fn free(global_ip: Ipv4Addr, private_key: String, public_key: String) -> Self {
        let spec = PodBindingSpec {
            global_ip: global_ip.to_string(),
            private_key,
            public_key,
            allowed_subnets: vec![format!("{}/32", global_ip)],
            reservation_token: FREE_TOKEN.to_string(),
            pod_ref: None,
            pod_ip: None,
            reserved_at: None,
        };

        let mut binding = PodBinding::new(&sanitize_address(&global_ip), spec);
        binding.sync_labels();
        binding
    }

    /// Parsed overlay address
    pub fn global_ip(&self) -> Result<Ipv4Addr> {
        self.spec
            .global_ip
            .parse()
            .map_err(|_| Error::InvalidAddress(self.spec.global_ip.clone()))
    }

    /// Parsed pod address, if the second phase has happened
    pub fn pod_ip(&self) -> Result<Option<Ipv4Addr>> {
        self.spec
            .pod_ip
            .as_deref()
            .map(|ip| ip.parse().map_err(|_| Error::InvalidAddress(ip.to_string())))
            .transpose()
    }

    pub fn is_free(&self) -> bool {
        self.spec.reservation_token == FREE_TOKEN
    }

    /// Mark the binding as held by `token`
    pub fn reserve(&mut self, token: &str) {
        self.spec.reservation_token = token.to_string();
        self.spec.reserved_at = Some(Utc::now());
        self.sync_labels();
    }

    /// Record the owning pod and its real address
    pub fn bind(&mut self, pod: ObjectRef, pod_ip: Ipv4Addr) {
        self.spec.pod_ref = Some(pod);
        self.spec.pod_ip = Some(pod_ip.to_string());
    }

    /// Return the binding to the free state, keeping address and keys
    pub fn release(&mut self) {
        self.spec.reservation_token = FREE_TOKEN.to_string();
        self.spec.pod_ref = None;
        self.spec.pod_ip = None;
        self.spec.reserved_at = None;
        self.sync_labels();
    }

    /// Whether the selector labels disagree with the reservation token
    pub fn labels_stale(&self) -> bool {
        let labels = self.metadata.labels.clone().unwrap_or_default();
        let (reserved, hash) = self.expected_labels();
        labels.get(LABEL_RESERVED).map(String::as_str) != Some(reserved)
            || labels.get(LABEL_TOKEN_HASH) != hash.as_ref()
    }

    /// Bring the selector labels in line with the reservation token
    pub fn sync_labels(&mut self) {
        let (reserved, hash) = self.expected_labels();
        set_label(&mut self.metadata, LABEL_RESERVED, reserved);
        match hash {
            Some(hash) => set_label(&mut self.metadata, LABEL_TOKEN_HASH, &hash),
            None => {
                if let Some(labels) = self.metadata.labels.as_mut() {
                    labels.remove(LABEL_TOKEN_HASH);
                }
            }
        }
    }

    fn expected_labels(&self) -> (&'static str, Option<String>) {
        if self.is_free() {
            ("false", None)
        } else {
            ("true", Some(token_hash(&self.spec.reservation_token)))
        }
    }
}

pub(crate) fn set_label(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}
