//! Runtime Synchronizer
//!
//! Writes rendered artifacts to their well-known paths and makes the host
//! pick them up: `wg-quick` / `wg syncconf` for the mesh interface, `ip
//! address` for service addresses and an nginx reload for stream rules.
//!
//! Exit statuses that only say "already there" or "already gone" are
//! treated as success so teardown stays idempotent. In local mode nothing
//! touches the host; every operation is logged and succeeds.

pub mod runner;

pub use runner::*;

use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Where artifacts live and which tools apply them
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Mesh interface name
    pub interface: String,
    /// Rendered WireGuard file
    pub mesh_config_path: PathBuf,
    /// Rendered nginx stream rules
    pub proxy_config_path: PathBuf,
    pub wg_quick_bin: String,
    pub wg_bin: String,
    pub ip_bin: String,
    pub nginx_bin: String,
    /// Skip all host side effects
    pub local_mode: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            mesh_config_path: PathBuf::from("/etc/wireguard/wg0.conf"),
            proxy_config_path: PathBuf::from("/etc/nginx/stream.d/mesh.conf"),
            wg_quick_bin: "wg-quick".to_string(),
            wg_bin: "wg".to_string(),
            ip_bin: "ip".to_string(),
            nginx_bin: "nginx".to_string(),
            local_mode: false,
        }
    }
}

/// How a new mesh file is brought live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Tear the interface down and up again (own address or port changed)
    Restart,
    /// Swap the peer set in place without dropping sessions
    SyncPeers,
}

/// Failure outcome that means the desired state already holds
#[derive(Debug, Clone, Copy)]
struct Benign {
    code: i32,
    marker: &'static str,
}

const WG_DOWN_BENIGN: &[Benign] = &[
    Benign {
        code: 1,
        marker: "is not a WireGuard interface",
    },
    Benign {
        code: 1,
        marker: "does not exist",
    },
];

const ADDR_ADD_BENIGN: &[Benign] = &[Benign {
    code: 2,
    marker: "File exists",
}];

const ADDR_DEL_BENIGN: &[Benign] = &[
    Benign {
        code: 2,
        marker: "Cannot assign requested address",
    },
    Benign {
        code: 1,
        marker: "Cannot find device",
    },
];

fn is_benign(output: &CommandOutput, benign: &[Benign]) -> bool {
    benign
        .iter()
        .any(|b| output.code == Some(b.code) && output.stderr.contains(b.marker))
}

// =============================================================================
// Runtime Synchronizer
// =============================================================================

/// Applies rendered configuration to the local host
pub struct RuntimeSynchronizer {
    config: SyncConfig,
    runner: Arc<dyn CommandRunner>,
}

impl RuntimeSynchronizer {
    pub fn new(config: SyncConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Write the mesh file and bring it live
    pub async fn apply_mesh(&self, rendered: &str, mode: ApplyMode) -> Result<()> {
        if self.config.local_mode {
            info!(?mode, bytes = rendered.len(), "Local mode: skipping mesh apply");
            return Ok(());
        }

        write_artifact(&self.config.mesh_config_path, rendered).await?;
        let path = self.config.mesh_config_path.display().to_string();

        match mode {
            ApplyMode::Restart => {
                self.run(&self.config.wg_quick_bin, &["down".into(), path.clone()], WG_DOWN_BENIGN)
                    .await?;
                self.run(&self.config.wg_quick_bin, &["up".into(), path], &[])
                    .await?;
            }
            ApplyMode::SyncPeers => {
                let stripped = self
                    .run(&self.config.wg_quick_bin, &["strip".into(), path], &[])
                    .await?;
                let stripped_path = self.config.mesh_config_path.with_extension("stripped");
                write_artifact(&stripped_path, &stripped.stdout).await?;
                self.run(
                    &self.config.wg_bin,
                    &[
                        "syncconf".into(),
                        self.config.interface.clone(),
                        stripped_path.display().to_string(),
                    ],
                    &[],
                )
                .await?;
            }
        }

        info!(?mode, interface = %self.config.interface, "Mesh configuration applied");
        Ok(())
    }

    /// Make the gateway answer on a service address
    pub async fn add_address(&self, addr: Ipv4Addr) -> Result<()> {
        if self.config.local_mode {
            info!(%addr, "Local mode: skipping address add");
            return Ok(());
        }
        self.run(&self.config.ip_bin, &self.address_args("add", addr), ADDR_ADD_BENIGN)
            .await?;
        Ok(())
    }

    /// Stop answering on a service address
    pub async fn remove_address(&self, addr: Ipv4Addr) -> Result<()> {
        if self.config.local_mode {
            info!(%addr, "Local mode: skipping address removal");
            return Ok(());
        }
        self.run(&self.config.ip_bin, &self.address_args("del", addr), ADDR_DEL_BENIGN)
            .await?;
        Ok(())
    }

    /// Write the stream rule file and reload nginx
    pub async fn apply_proxy(&self, rendered: &str) -> Result<()> {
        if self.config.local_mode {
            info!(bytes = rendered.len(), "Local mode: skipping proxy reload");
            return Ok(());
        }

        write_artifact(&self.config.proxy_config_path, rendered).await?;
        self.run(&self.config.nginx_bin, &["-s".into(), "reload".into()], &[])
            .await?;
        info!("Proxy configuration reloaded");
        Ok(())
    }

    fn address_args(&self, verb: &str, addr: Ipv4Addr) -> Vec<String> {
        vec![
            "address".into(),
            verb.into(),
            format!("{}/32", addr),
            "dev".into(),
            self.config.interface.clone(),
        ]
    }

    async fn run(&self, program: &str, args: &[String], benign: &[Benign]) -> Result<CommandOutput> {
        let output = self.runner.run(program, args).await?;
        if output.success() {
            return Ok(output);
        }

        let command = format!("{} {}", program, args.join(" "));
        if is_benign(&output, benign) {
            debug!(%command, code = ?output.code, "Treating command failure as already converged");
            return Ok(output);
        }

        warn!(%command, code = ?output.code, stderr = %output.stderr.trim(), "Host command failed");
        Err(Error::CommandFailed {
            command,
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

async fn write_artifact(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    debug!(path = %path.display(), bytes = contents.len(), "Wrote artifact");
    Ok(())
}
