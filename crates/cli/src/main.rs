use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use keel_apply::DecodeLimits;
use keel_controller::{Controller, ControllerConfig};
use keel_core::parse_ignored_resources;
use keel_kubehub::KubeCluster;
use keel_store::QueueConfig;

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "Keel GitOps reconciliation controller")]
struct Cli {
    /// Only manage tracking objects and groups in this namespace (default: all)
    #[arg(long, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    /// Stamp children with a controller owner reference to their tracking object
    #[arg(long, env = "KEEL_CREATE_OWNER_REFERENCE", action = ArgAction::Set, default_value_t = true)]
    create_owner_reference: bool,

    /// Resource never applied or watched, as <resource>.<group>/<version> (e.g. jobs.batch/v1, configmaps./v1)
    #[arg(long = "ignore-resource", env = "KEEL_IGNORE_RESOURCES", value_delimiter = ',')]
    ignore_resources: Vec<String>,

    /// Reconcile workers
    #[arg(long, env = "KEEL_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Work queue capacity; the oldest key is dropped when full
    #[arg(long, env = "KEEL_QUEUE_CAPACITY", default_value_t = 4096)]
    queue_capacity: usize,

    /// Upper bound on per-key retry backoff
    #[arg(long, env = "KEEL_MAX_BACKOFF_SECS", default_value_t = 300)]
    max_backoff_secs: u64,

    /// Full relist period; 0 disables
    #[arg(long, env = "KEEL_RESYNC_SECS", default_value_t = 600)]
    resync_secs: u64,

    /// Prometheus listener, host:port
    #[arg(long, env = "KEEL_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

impl Cli {
    fn controller_config(&self) -> Result<ControllerConfig> {
        let ignored = parse_ignored_resources(&self.ignore_resources).context("invalid --ignore-resource")?;
        let defaults = ControllerConfig::default();
        Ok(ControllerConfig {
            namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            create_owner_reference: self.create_owner_reference,
            ignored,
            workers: self.workers.max(1),
            queue: QueueConfig {
                capacity: self.queue_capacity,
                max_delay: Duration::from_secs(self.max_backoff_secs),
                ..QueueConfig::default()
            },
            resync: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            decode_limits: DecodeLimits::from_env(),
            ..defaults
        })
    }
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());
    let cfg = cli.controller_config()?;
    info!(
        ns = ?cfg.namespace,
        workers = cfg.workers,
        ignored = cfg.ignored.len(),
        owner_refs = cfg.create_owner_reference,
        "starting keel controller"
    );

    let client = kube::Client::try_default().await.context("building kubernetes client")?;
    let shutdown = CancellationToken::new();
    let cluster = Arc::new(KubeCluster::new(client, cfg.namespace.as_deref(), shutdown.clone()));
    let controller = Controller::new(cluster, cfg, &shutdown);

    let stop = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                stop.cancel();
            }
            Err(e) => error!(error = %e, "unable to listen for shutdown signal"),
        }
    });

    controller.run(shutdown).await.context("controller failed")?;
    Ok(())
}
