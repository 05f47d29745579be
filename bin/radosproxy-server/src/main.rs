//! RadosProxy server
//!
//! Accepts client storage requests on the messenger ports, routes them
//! through the server adaptor's per-object queues and executes them on the
//! proxy's cluster connection. Prometheus metrics and a health probe are
//! served over HTTP.

mod backend;
mod handler;
mod metrics;

use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use clap::Parser;
use radosproxy_adaptor::{AdaptorConfig, Messenger, ServerAdaptor};
use radosproxy_common::{PoolId, ProxyConfig};
use radosproxy_core::Proxy;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::backend::BackendFile;
use crate::handler::ProxyOpHandler;
use crate::metrics::MetricsState;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "radosproxy-server", about = "RadosProxy storage request server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/radosproxy/server.toml")]
    config: PathBuf,

    /// Messenger listen address (overrides messenger.listen_ip)
    #[arg(long)]
    listen: Option<String>,

    /// Messenger ports, comma separated (overrides messenger.listen_ports)
    #[arg(long, value_delimiter = ',')]
    ports: Vec<String>,

    /// Adaptor queue count (overrides messenger.queue_amount)
    #[arg(long)]
    queues: Option<usize>,

    /// Adaptor queue capacity (overrides messenger.queue_max_capacity)
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Log level (overrides logging.level)
    #[arg(long, env = "RADOSPROXY_LOG")]
    log_level: Option<String>,

    /// Log to stderr instead of logging.log_file
    #[arg(long)]
    log_stderr: bool,

    /// Metrics and health HTTP port, 0 to disable
    #[arg(long, default_value_t = 9480)]
    metrics_port: u16,
}

// ── Configuration ─────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<(ProxyConfig, BackendFile, bool)> {
    if !path.exists() {
        return Ok((ProxyConfig::default(), BackendFile::default(), false));
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config = ProxyConfig::from_toml(&text).context("parse proxy sections")?;
    let backend = BackendFile::from_toml(&text).context("parse backend section")?;
    Ok((config, backend, true))
}

fn apply_overrides(config: &mut ProxyConfig, args: &Args) {
    if let Some(ip) = &args.listen {
        config.messenger.listen_ip.clone_from(ip);
    }
    if !args.ports.is_empty() {
        config.messenger.listen_ports.clone_from(&args.ports);
    }
    if let Some(n) = args.queues {
        config.messenger.queue_amount = n;
    }
    if let Some(n) = args.queue_capacity {
        config.messenger.queue_max_capacity = n;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if args.log_stderr {
        config.logging.log_file = None;
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// `RUST_LOG` when set and valid, else the configured level, else `info`
fn log_filter(env: Option<&str>, level: &str) -> EnvFilter {
    env.and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns the log file error, if the
/// configured file could not be opened and stderr is used instead.
fn init_tracing(config: &ProxyConfig) -> Option<String> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = log_filter(env.as_deref(), &config.logging.level);
    let (file, file_err) = match &config.logging.log_file {
        Some(path) => match open_log_file(path) {
            Ok(f) => (Some(f), None),
            Err(e) => (None, Some(format!("{}: {e}", path.display()))),
        },
        None => (None, None),
    };
    let stderr_layer = file.is_none().then(fmt::layer);
    let file_layer = file.map(|f| fmt::layer().with_ansi(false).with_writer(Mutex::new(f)));
    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    file_err
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, backend_file, found) = load_config(&args.config)?;
    apply_overrides(&mut config, &args);
    let log_err = init_tracing(&config);

    info!("Starting RadosProxy server");
    if !found {
        warn!("Config file {} not found, using defaults", args.config.display());
    }
    if let Some(e) = log_err {
        warn!("Cannot open log file {}, logging to stderr", e);
    }

    // ── Cluster backend ───────────────────────────────────────────────────────
    let client = backend::build(&backend_file.backend).context("build cluster backend")?;

    // ── Proxy ─────────────────────────────────────────────────────────────────
    let proxy = tokio::task::spawn_blocking({
        let config = config.clone();
        move || Proxy::init(&config, client)
    })
    .await
    .context("proxy init task")?
    .context("proxy init")?;

    if config.monitor.enabled {
        let weak: Weak<Proxy> = Arc::downgrade(&proxy);
        let warm = move |pool: PoolId| -> i32 {
            let Some(proxy) = weak.upgrade() else {
                return 0;
            };
            match proxy.ioctx_by_id(pool) {
                Ok(_) => {
                    info!("New pool {} ready", pool);
                    0
                }
                Err(e) => {
                    warn!("Open new pool {} failed: {}", pool, e);
                    e.errno()
                }
            }
        };
        proxy
            .register_pool_new_notify(Arc::new(warm))
            .context("register pool observer")?;
        proxy
            .register_pool_del_notify(Arc::new(|pool: PoolId| -> i32 {
                info!("Pool {} deleted", pool);
                0
            }))
            .context("register pool observer")?;
    }

    // ── Server adaptor ────────────────────────────────────────────────────────
    let adaptor_config = AdaptorConfig::from_sections(&config.messenger, &config.worker);
    let adaptor = Arc::new(
        ServerAdaptor::start(
            &adaptor_config,
            Arc::new(ProxyOpHandler::new(Arc::clone(&proxy))),
        )
        .context("start server adaptor")?,
    );

    // ── Messenger ─────────────────────────────────────────────────────────────
    let mut messenger = Messenger::bind(
        &config.messenger.listen_ip,
        &config.messenger.listen_ports,
        Arc::clone(&adaptor),
    )
    .await
    .context("bind messenger")?;
    for addr in messenger.local_addrs() {
        info!("Serving requests on {}", addr);
    }

    // ── Metrics ───────────────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let metrics_task = if args.metrics_port == 0 {
        None
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind metrics on {addr}"))?;
        info!("Metrics on http://{}/metrics", addr);
        let app = metrics::router(MetricsState {
            proxy: Arc::clone(&proxy),
            adaptor: Arc::clone(&adaptor),
        });
        Some(tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    stop_rx.await.ok();
                })
                .await
        }))
    };

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("Shutting down");

    // ── Shutdown ──────────────────────────────────────────────────────────────
    messenger.shutdown().await;
    tokio::task::spawn_blocking({
        let adaptor = Arc::clone(&adaptor);
        let proxy = Arc::clone(&proxy);
        move || {
            adaptor.stop();
            proxy.shutdown();
        }
    })
    .await
    .context("shutdown task")?;

    let _ = stop_tx.send(());
    if let Some(task) = metrics_task {
        task.await.context("metrics task")?.context("metrics server")?;
    }
    info!("RadosProxy server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, backend, found) = load_config(&dir.path().join("none.toml")).unwrap();
        assert!(!found);
        assert_eq!(config.messenger.listen_ports, vec!["1234".to_string()]);
        assert_eq!(backend.backend.kind, "memory");
    }

    #[test]
    fn test_one_file_feeds_both_parsers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [messenger]
            listen_ip = "127.0.0.1"
            queue_amount = 4

            [backend]
            capacity_gib = 2

            [[backend.pools]]
            name = "rbd"
            "#
        )
        .unwrap();
        let (config, backend, found) = load_config(file.path()).unwrap();
        assert!(found);
        assert_eq!(config.messenger.queue_amount, 4);
        assert_eq!(backend.backend.capacity_gib, 2);
        assert_eq!(backend.backend.pools[0].name, "rbd");
    }

    #[test]
    fn test_rust_log_wins_over_configured_level() {
        assert_eq!(log_filter(Some("debug"), "warn").to_string(), "debug");
        assert_eq!(log_filter(None, "warn").to_string(), "warn");
        assert_eq!(log_filter(Some("radosproxy=[bad"), "error").to_string(), "error");
        assert_eq!(log_filter(None, "radosproxy=[bad").to_string(), "info");
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "radosproxy-server",
            "--listen",
            "0.0.0.0",
            "--ports",
            "7000,7001",
            "--queues",
            "3",
            "--log-stderr",
        ]);
        let mut config = ProxyConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.messenger.listen_ip, "0.0.0.0");
        assert_eq!(config.messenger.listen_ports, vec!["7000", "7001"]);
        assert_eq!(config.messenger.queue_amount, 3);
        assert!(config.logging.log_file.is_none());
    }
}
