use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use carctl_controller::{
    Controller, ControllerBuilder, ControllerConfig, DefaultStatusPolicy, LogRecorder,
};
use carctl_core::{add_to_scheme, CarSpec, EventRecorder, ObjectKey, ObjectStore, Scheme};
use carctl_kubehub::{kube_client, KubeRecorder, KubeStore};
use carctl_store::memory::MemoryStore;
use carctl_store::Informer;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "car-controller", version, about = "Reconciles samplecrd.k8s.io/v1 Car objects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile Cars in a cluster
    Run {
        /// Path to a kubeconfig. Only required if out-of-cluster.
        #[arg(long, env = "KUBECONFIG")]
        kubeconfig: Option<PathBuf>,
        /// API server address. Overrides any value in kubeconfig.
        #[arg(long, env = "CARCTL_MASTER")]
        master: Option<String>,
        /// Restrict to one namespace (default: all)
        #[arg(long = "namespace", short = 'n', env = "CARCTL_NAMESPACE")]
        namespace: Option<String>,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Run against an in-memory store with simulated edits
    Demo {
        /// Number of cars to seed
        #[arg(long, default_value_t = 5)]
        cars: usize,
        /// Stop after this many seconds (0 = until interrupted)
        #[arg(long = "duration-secs", default_value_t = 10)]
        duration_secs: u64,
        /// Interval between simulated edits in milliseconds
        #[arg(long = "edit-interval-ms", default_value_t = 500)]
        edit_interval_ms: u64,
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(Args, Debug)]
struct Tuning {
    /// Number of workers
    #[arg(long, env = "CARCTL_WORKERS", default_value_t = 2)]
    workers: usize,
    /// Informer resync period in seconds (0 disables)
    #[arg(long = "resync-secs", env = "CARCTL_RESYNC_SECS", default_value_t = 30)]
    resync_secs: u64,
    /// Fail if the initial list has not completed after this many seconds
    #[arg(long = "cache-sync-timeout-secs", env = "CARCTL_CACHE_SYNC_TIMEOUT_SECS")]
    cache_sync_timeout_secs: Option<u64>,
}

impl Tuning {
    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            resync_period: Some(Duration::from_secs(self.resync_secs)).filter(|d| !d.is_zero()),
            cache_sync_timeout: self.cache_sync_timeout_secs.map(Duration::from_secs),
            ..ControllerConfig::from_env()
        }
    }
}

fn init_tracing() {
    let env = std::env::var("CARCTL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CARCTL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CARCTL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on the first SIGINT/SIGTERM; exit on the second.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received; draining");
        token.cancel();
        shutdown_signal().await;
        warn!("second signal received; exiting");
        std::process::exit(1);
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() { let _ = tokio::signal::ctrl_c().await; }

fn scheme() -> Scheme {
    let mut scheme = Scheme::new();
    add_to_scheme(&mut scheme);
    scheme
}

/// Start the informer, run the controller until `cancel` fires, then stop the informer.
async fn serve<S: ObjectStore, R: EventRecorder>(
    informer: Informer<S>,
    controller: Controller<S, R>,
    cancel: CancellationToken,
) -> Result<()> {
    let informer_cancel = cancel.child_token();
    let informer_task = tokio::spawn(informer.run(informer_cancel.clone()));
    let res = controller.run(cancel).await;
    informer_cancel.cancel();
    if let Err(e) = informer_task.await {
        error!(error = %e, "informer task failed");
    }
    res.context("running controller")
}

async fn run(kubeconfig: Option<PathBuf>, master: Option<String>, namespace: Option<String>, tuning: Tuning) -> Result<()> {
    let config = tuning.config();
    let scheme = scheme();
    let client = kube_client(kubeconfig.as_deref(), master.as_deref()).await?;
    let store = Arc::new(KubeStore::new(client.clone(), namespace.clone()));
    let recorder = Arc::new(KubeRecorder::new(client, &scheme)?);
    let informer = Informer::new(Arc::clone(&store)).with_resync(config.resync_period);
    let controller = Controller::new(store, recorder, &informer, &scheme, config)?;
    info!(namespace = namespace.as_deref().unwrap_or("<all>"), "controller ready");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    serve(informer, controller, cancel).await
}

/// Seed `cars` objects (every other one without a status) and keep editing them.
async fn demo(cars: usize, duration_secs: u64, edit_interval_ms: u64, tuning: Tuning) -> Result<()> {
    let config = tuning.config();
    let scheme = scheme();
    let seed = (0..cars).map(|i| {
        let spec = if i % 2 == 0 { CarSpec::with_status("idle") } else { CarSpec::default() };
        (ObjectKey::namespaced("default", format!("car{}", i)), spec)
    });
    let store = Arc::new(MemoryStore::with_objects(seed));
    let informer = Informer::new(Arc::clone(&store)).with_resync(config.resync_period);
    let controller = ControllerBuilder::new(Arc::clone(&store), Arc::new(LogRecorder))
        .config(config)
        .policy(DefaultStatusPolicy::default())
        .build(&informer, &scheme)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    if duration_secs > 0 {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration_secs)).await;
            info!(duration_secs, "demo duration elapsed");
            token.cancel();
        });
    }
    if cars > 0 && edit_interval_ms > 0 {
        tokio::spawn(simulate_edits(Arc::clone(&store), cars, Duration::from_millis(edit_interval_ms), cancel.clone()));
    }

    serve(informer, controller, cancel).await?;
    info!(writes = store.actions().len(), "demo finished");
    Ok(())
}

async fn simulate_edits(store: Arc<MemoryStore>, cars: usize, every: Duration, cancel: CancellationToken) {
    const STATUSES: [&str; 3] = ["moving", "parked", ""];
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    for n in 0usize.. {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let key = ObjectKey::namespaced("default", format!("car{}", n % cars));
        if n % 7 == 6 {
            info!(key = %key, "demo: deleting");
            store.delete(&key);
        } else {
            let status = STATUSES[n % STATUSES.len()];
            info!(key = %key, status, "demo: editing");
            store.upsert(key, CarSpec::with_status(status));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { kubeconfig, master, namespace, tuning } => run(kubeconfig, master, namespace, tuning).await,
        Commands::Demo { cars, duration_secs, edit_interval_ms, tuning } => {
            demo(cars, duration_secs, edit_interval_ms, tuning).await
        }
    }
}
