use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};

use drover_core::ManagedResource;
use drover_driver::{DriverConfig, LifecycleDriver};
use drover_events::KubeEvents;
use drover_store::KubeStore;

#[derive(Parser, Debug)]
#[command(name = "droverctl", version, about = "Drive a managed resource through create, scale and delete")]
struct Cli {
    /// Path to the resource manifest (YAML or JSON)
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// GVK key of the managed kind, e.g. "machinelearning.seldon.io/v1/SeldonDeployment"
    #[arg(long = "gvk", default_value = drover_store::DEFAULT_GVK_KEY)]
    gvk: String,

    /// Kubernetes namespace (default: the manifest's, then "default")
    #[arg(long = "ns")]
    namespace: Option<String>,

    /// Replica count applied by the scale step
    #[arg(long = "replicas", default_value_t = 2)]
    replicas: i32,

    /// Budget for each convergence wait, in seconds
    #[arg(long = "timeout-secs", default_value_t = 1800)]
    timeout_secs: u64,

    /// Sleep between status reads while waiting, in seconds
    #[arg(long = "poll-secs", default_value_t = 5)]
    poll_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("DROVER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DROVER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DROVER_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_manifest(raw: &str) -> Result<ManagedResource> {
    let manifest: ManagedResource = serde_yaml::from_str(raw).context("parsing manifest")?;
    if manifest.metadata.name.is_empty() {
        bail!("manifest missing metadata.name");
    }
    Ok(manifest)
}

fn load_manifest(path: &Path) -> Result<ManagedResource> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    parse_manifest(&raw).with_context(|| format!("loading manifest {}", path.display()))
}

async fn run(cli: Cli) -> Result<()> {
    if cli.poll_secs >= cli.timeout_secs {
        bail!("--poll-secs must be smaller than --timeout-secs");
    }

    info!(path = %cli.file.display(), "manifest path");
    let mut manifest = load_manifest(&cli.file)?;
    if let Some(ns) = cli.namespace {
        manifest.metadata.namespace = ns;
    }

    let store = KubeStore::connect(&cli.gvk).await?;
    let cfg = DriverConfig {
        timeout: Duration::from_secs(cli.timeout_secs),
        poll_interval: Duration::from_secs(cli.poll_secs),
        target_replicas: cli.replicas,
    };
    LifecycleDriver::new(store, cfg)
        .with_events(Arc::new(KubeEvents::new()))
        .run(manifest)
        .await
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = ?e, "lifecycle workflow failed");
        eprintln!("droverctl error: {:#}", e);
        std::process::exit(1);
    }
}
