//! nginx stream rules
//!
//! Each `(service binding, port)` pair becomes one `server` block inside
//! the `stream {}` context, forwarding `globalIP:port` to the service's
//! cluster DNS name on the same port.

use crate::crd::{Protocol, ServiceBinding};
use crate::error::Result;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::warn;

/// One forwarding rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRule {
    pub listen: SocketAddrV4,
    pub upstream: String,
    pub protocol: Protocol,
}

impl StreamRule {
    /// `server` block for this rule
    pub fn render(&self) -> String {
        let listen = match self.protocol {
            Protocol::Udp => format!("{} udp", self.listen),
            _ => self.listen.to_string(),
        };

        let mut out = String::new();
        writeln!(out, "server {{").ok();
        writeln!(out, "    listen {};", listen).ok();
        writeln!(out, "    proxy_pass {};", self.upstream).ok();
        writeln!(out, "}}").ok();
        out
    }
}

/// Cluster DNS name of the service behind `binding`
pub fn service_dns_name(binding: &ServiceBinding, cluster_domain: &str) -> String {
    format!(
        "{}.{}.svc.{}",
        binding.spec.service_ref.name, binding.spec.service_ref.namespace, cluster_domain
    )
}

/// Rules for every forwardable port of `binding`, in declaration order
pub fn rules_for(binding: &ServiceBinding, cluster_domain: &str) -> Result<Vec<StreamRule>> {
    let global_ip: Ipv4Addr = binding.global_ip()?;
    let host = service_dns_name(binding, cluster_domain);

    Ok(binding
        .spec
        .ports
        .iter()
        .filter(|p| {
            if p.protocol == Protocol::Sctp {
                warn!(
                    service = %binding.spec.service_ref,
                    port = p.port,
                    "nginx stream cannot proxy SCTP, skipping port"
                );
                return false;
            }
            true
        })
        .map(|p| StreamRule {
            listen: SocketAddrV4::new(global_ip, p.port),
            upstream: format!("{}:{}", host, p.port),
            protocol: p.protocol,
        })
        .collect())
}

/// Rendered fragment for one service binding
pub fn render_stream(binding: &ServiceBinding, cluster_domain: &str) -> Result<String> {
    Ok(rules_for(binding, cluster_domain)?
        .iter()
        .map(StreamRule::render)
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Full rule file from per-binding fragments
pub fn render_stream_file<'a, I>(fragments: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let mut out = String::from("# Generated by mesh-network-manager, do not edit\n");
    for fragment in fragments {
        if fragment.is_empty() {
            continue;
        }
        out.push('\n');
        out.push_str(fragment);
    }
    out
}
