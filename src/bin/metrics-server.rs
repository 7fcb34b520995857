use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use sidekiq_cluster::exporter::{self, ExporterOptions};
use sidekiq_cluster::logging::{init_tracing, LogFormat};
use sidekiq_cluster::metrics_server::METRICS_TARGET;

/// Serves liveness, readiness and Prometheus metrics for a Sidekiq cluster.
#[derive(Debug, Parser)]
#[command(name = "metrics-server", version = env!("SIDEKIQ_CLUSTER_BUILD_VERSION"))]
struct Args {
    #[arg(long, env = "METRICS_SERVER_TARGET", default_value = METRICS_TARGET)]
    target: String,
    #[arg(
        long = "metrics-dir",
        env = "prometheus_multiproc_dir",
        default_value = "tmp/prometheus_multiproc_dir/sidekiq"
    )]
    metrics_dir: PathBuf,
    #[arg(long, default_value = "localhost")]
    address: String,
    #[arg(long)]
    port: u16,
    /// Remove stale metric files before serving (`1` to enable).
    #[arg(long = "wipe-metrics-dir", env = "WIPE_METRICS_DIR", default_value = "0")]
    wipe_metrics_dir: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing(LogFormat::from_env());

    let args = Args::parse();
    exporter::run(ExporterOptions {
        target: args.target,
        metrics_dir: args.metrics_dir,
        address: args.address,
        port: args.port,
        wipe_metrics_dir: matches!(args.wipe_metrics_dir.trim(), "1" | "true"),
    })
    .await
}
