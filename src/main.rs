//! Mesh Network Manager
//!
//! Allocates overlay addresses for pods and services, keeps the WireGuard
//! gateway and the nginx stream proxy on this host in sync, and serves the
//! registration API.
//!
//! Startup order matters: the store is read and the host configured
//! before the API listener binds.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

use mesh_network_manager::{
    ipam::parse_cidr, ApiServer, ApiServerConfig, BindingStore, Error, KubeServiceCatalog,
    KubeStore, Manager, ManagerConfig, ManagerMetrics, MemoryStore, MeshKeyPair, MeshOptions,
    RegistryConfig, Result, ServiceCatalog, SyncConfig, TokioCommandRunner,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Mesh Network Manager - overlay addresses, WireGuard mesh and stream proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// CIDR pod addresses are allocated from
    #[arg(long, env = "POD_CIDR", default_value = "10.80.0.0/16")]
    pod_cidr: String,

    /// CIDR service addresses are allocated from
    #[arg(long, env = "SERVICE_CIDR", default_value = "10.90.0.0/16")]
    service_cidr: String,

    /// Pod offsets up to this one are never handed out
    #[arg(long, env = "POD_OFFSET", default_value = "1")]
    pod_offset: u32,

    /// Initial service counter
    #[arg(long, env = "SERVICE_RESERVED", default_value = "10")]
    service_reserved: u32,

    /// Pod bindings pre-allocated per batch
    #[arg(long, env = "BATCH_SIZE", default_value = "32")]
    batch_size: u32,

    /// Wait between free-binding polls while a batch runs, in milliseconds
    #[arg(long, env = "BATCH_POLL_DELAY_MS", default_value = "250")]
    batch_poll_delay_ms: u64,

    /// Polls before a reservation answers 503
    #[arg(long, env = "BATCH_POLL_ATTEMPTS", default_value = "8")]
    batch_poll_attempts: u32,

    /// Bound on every store call, in seconds
    #[arg(long, env = "STORE_TIMEOUT", default_value = "10")]
    store_timeout_secs: u64,

    /// Bound on startup retries against the store, in seconds
    #[arg(long, env = "STARTUP_RETRY", default_value = "120")]
    startup_retry_secs: u64,

    /// WireGuard interface name
    #[arg(long, env = "MESH_INTERFACE", default_value = "wg0")]
    interface: String,

    /// UDP port the gateway listens on
    #[arg(long, env = "MESH_LISTEN_PORT", default_value = "51820")]
    listen_port: u16,

    /// UDP port pods listen on
    #[arg(long, env = "MESH_POD_LISTEN_PORT", default_value = "51820")]
    pod_listen_port: u16,

    /// Keep-alive interval for peers, in seconds
    #[arg(long, env = "MESH_KEEPALIVE", default_value = "25")]
    keepalive_secs: u16,

    /// Externally reachable host:port pods dial
    #[arg(long, env = "MESH_ENDPOINT")]
    endpoint: String,

    /// Gateway private key (base64); generated when absent
    #[arg(long, env = "MESH_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Rendered WireGuard file
    #[arg(long, env = "MESH_CONFIG_PATH", default_value = "/etc/wireguard/wg0.conf")]
    mesh_config_path: PathBuf,

    /// Rendered nginx stream rules
    #[arg(long, env = "PROXY_CONFIG_PATH", default_value = "/etc/nginx/stream.d/mesh.conf")]
    proxy_config_path: PathBuf,

    /// Cluster DNS suffix
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    cluster_domain: String,

    /// Log instead of touching the host
    #[arg(long, env = "LOCAL_MODE")]
    local_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (in-memory store, no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Mesh Network Manager");
    info!("  Version: {}", mesh_network_manager::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Pod CIDR: {}", args.pod_cidr);
    info!("  Service CIDR: {}", args.service_cidr);
    info!("  Local mode: {}", args.local_mode);
    info!("  Standalone mode: {}", args.standalone);

    let config = build_config(&args)?;

    let (store, catalog): (Arc<dyn BindingStore>, Arc<dyn ServiceCatalog>) = if args.standalone {
        let store = Arc::new(MemoryStore::new());
        let catalog: Arc<dyn ServiceCatalog> = store.clone();
        (store as Arc<dyn BindingStore>, catalog)
    } else {
        let client = kube::Client::try_default().await?;
        (
            Arc::new(KubeStore::new(client.clone())),
            Arc::new(KubeServiceCatalog::new(client)),
        )
    };

    let manager = Manager::new(config, store, catalog, Arc::new(TokioCommandRunner))?;
    manager.warm().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    // Start metrics server
    let metrics_addr = parse_addr("metrics", &args.metrics_addr)?;
    let metrics = manager.metrics().clone();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: parse_addr("REST API", &args.api_addr)?,
    };
    ApiServer::new(api_config, manager).run(shutdown).await?;

    info!("Manager shutdown complete");
    Ok(())
}

fn build_config(args: &Args) -> Result<ManagerConfig> {
    let registry = RegistryConfig {
        pod_cidr: parse_cidr(&args.pod_cidr)?,
        service_cidr: parse_cidr(&args.service_cidr)?,
        pod_offset: args.pod_offset,
        service_reserved: args.service_reserved,
        batch_size: args.batch_size,
        store_timeout: Duration::from_secs(args.store_timeout_secs),
        ..Default::default()
    };

    let keys = match &args.private_key {
        Some(key) => MeshKeyPair::from_private_key(key)?,
        None => {
            warn!("No gateway private key configured, generating one; peers will need new configs after a restart");
            MeshKeyPair::generate()
        }
    };
    info!("  Gateway public key: {}", keys.public_key);

    let mesh = MeshOptions {
        listen_port: args.listen_port,
        pod_listen_port: args.pod_listen_port,
        keepalive_secs: args.keepalive_secs,
        ..MeshOptions::new(keys, args.endpoint.clone())
    };

    let sync = SyncConfig {
        interface: args.interface.clone(),
        mesh_config_path: args.mesh_config_path.clone(),
        proxy_config_path: args.proxy_config_path.clone(),
        local_mode: args.local_mode,
        ..Default::default()
    };

    let mut config = ManagerConfig::new(registry, mesh, sync)?;
    config.cluster_domain = args.cluster_domain.clone();
    config.batch_poll_delay = Duration::from_millis(args.batch_poll_delay_ms);
    config.batch_poll_attempts = args.batch_poll_attempts;
    config.startup_retry_window = Duration::from_secs(args.startup_retry_secs);
    config.validate()?;
    Ok(config)
}

fn parse_addr(what: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address: {}", what, e)))
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = ["hyper=warn", "kube=info", "tower=warn", "axum=info"]
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    metrics: ManagerMetrics,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", content_type)
                                .body(Body::from(buffer)),
                            Err(e) => Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body(Body::from(e.to_string())),
                        },
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found")),
                    };
                    Ok::<_, std::convert::Infallible>(
                        response.unwrap_or_else(|_| Response::new(Body::empty())),
                    )
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    server
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
