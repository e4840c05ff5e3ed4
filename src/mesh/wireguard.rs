//! WireGuard configuration rendering
//!
//! Pure functions turning bindings into `wg-quick` configuration text:
//! the gateway interface file (interface stanza plus one peer per pod
//! binding) and the client file handed back to a registering pod.

use crate::crd::PodBinding;
use crate::error::{Error, Result};
use ipnetwork::Ipv4Network;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

/// Gateway side of the mesh
#[derive(Debug, Clone)]
pub struct InterfaceSettings {
    /// Gateway overlay address with the pod CIDR prefix
    pub address: Ipv4Network,
    /// UDP port the gateway listens on
    pub listen_port: u16,
    /// Gateway private key (base64)
    pub private_key: String,
    /// Gateway public key (base64), handed to clients
    pub public_key: String,
    /// Externally reachable `host:port` clients dial
    pub endpoint: String,
    /// UDP port pods listen on once their real address is known
    pub pod_listen_port: u16,
    /// Keep-alive interval for peers with a known endpoint
    pub keepalive_secs: u16,
    /// Subnets a client routes through the gateway
    pub client_allowed_ips: Vec<Ipv4Network>,
}

/// Peer section recovered from a rendered file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerEntry {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<String>,
}

/// `[Peer]` fragment for one pod binding.
///
/// The endpoint and keep-alive appear only once the pod's real address is
/// known; until then the pod has to dial in.
pub fn render_peer(binding: &PodBinding, settings: &InterfaceSettings) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "[Peer]").ok();
    writeln!(out, "PublicKey = {}", binding.spec.public_key).ok();

    let allowed = if binding.spec.allowed_subnets.is_empty() {
        format!("{}/32", binding.global_ip()?)
    } else {
        binding.spec.allowed_subnets.join(", ")
    };
    writeln!(out, "AllowedIPs = {}", allowed).ok();

    if let Some(pod_ip) = binding.pod_ip()? {
        writeln!(out, "Endpoint = {}:{}", pod_ip, settings.pod_listen_port).ok();
        writeln!(out, "PersistentKeepalive = {}", settings.keepalive_secs).ok();
    }

    Ok(out)
}

/// Full gateway interface file
pub fn render_interface<'a, S, P>(settings: &InterfaceSettings, service_addrs: S, peers: P) -> String
where
    S: IntoIterator<Item = &'a Ipv4Addr>,
    P: IntoIterator<Item = &'a String>,
{
    let mut out = String::new();
    writeln!(out, "[Interface]").ok();
    writeln!(out, "Address = {}", settings.address).ok();
    writeln!(out, "ListenPort = {}", settings.listen_port).ok();
    writeln!(out, "PrivateKey = {}", settings.private_key).ok();

    // The gateway answers on every service address too
    for addr in service_addrs {
        writeln!(out, "PostUp = ip address add {}/32 dev %i", addr).ok();
        writeln!(out, "PostDown = ip address del {}/32 dev %i", addr).ok();
    }

    for peer in peers {
        out.push('\n');
        out.push_str(peer);
    }

    out
}

/// Client file returned to the pod owning `binding`
pub fn render_client_config(binding: &PodBinding, settings: &InterfaceSettings) -> Result<String> {
    let allowed = settings
        .client_allowed_ips
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = String::new();
    writeln!(out, "[Interface]").ok();
    writeln!(out, "Address = {}/32", binding.global_ip()?).ok();
    writeln!(out, "ListenPort = {}", settings.pod_listen_port).ok();
    writeln!(out, "PrivateKey = {}", binding.spec.private_key).ok();
    writeln!(out).ok();
    writeln!(out, "[Peer]").ok();
    writeln!(out, "PublicKey = {}", settings.public_key).ok();
    writeln!(out, "Endpoint = {}", settings.endpoint).ok();
    writeln!(out, "AllowedIPs = {}", allowed).ok();
    writeln!(out, "PersistentKeepalive = {}", settings.keepalive_secs).ok();
    Ok(out)
}

/// Recover the peer sections of a rendered file
pub fn parse_peers(text: &str) -> Result<Vec<PeerEntry>> {
    let mut peers = Vec::new();
    let mut current: Option<PeerEntry> = None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') {
            if let Some(peer) = current.take() {
                peers.push(finish_peer(peer, lineno)?);
            }
            if line.eq_ignore_ascii_case("[peer]") {
                current = Some(PeerEntry {
                    public_key: String::new(),
                    allowed_ips: Vec::new(),
                    endpoint: None,
                });
            }
            continue;
        }

        let Some(peer) = current.as_mut() else {
            continue;
        };
        let (key, value) = line.split_once('=').ok_or_else(|| {
            Error::Internal(format!("line {}: expected `key = value`", lineno + 1))
        })?;

        match key.trim() {
            "PublicKey" => peer.public_key = value.trim().to_string(),
            "AllowedIPs" => peer.allowed_ips.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            ),
            "Endpoint" => peer.endpoint = Some(value.trim().to_string()),
            _ => {}
        }
    }

    if let Some(peer) = current.take() {
        peers.push(finish_peer(peer, text.lines().count())?);
    }
    Ok(peers)
}

fn finish_peer(peer: PeerEntry, lineno: usize) -> Result<PeerEntry> {
    if peer.public_key.is_empty() {
        return Err(Error::Internal(format!(
            "peer section ending at line {} has no PublicKey",
            lineno
        )));
    }
    Ok(peer)
}
