use std::path::PathBuf;

use anyhow::Result;
use nix::sys::signal::Signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;
use tracing::{debug, error, info};

use crate::catalog::QueueCatalog;
use crate::cli::Cli;
use crate::cluster;
use crate::config::{ClusterConfig, RuntimeEnv, TIMEOUT_GRACE_PERIOD_SECONDS};
use crate::errors::CommandError;
use crate::metrics_server::{
    cleanup_metrics_dir, metrics_server_enabled, MetricsLauncher, MetricsServer,
};
use crate::process_management::{signal_processes, write_pid};
use crate::queues::{resolve_queue_groups, QueueGroup, ResolveOptions};
use crate::settings::MonitoringSettings;
use crate::signals::{self, trapped_signals, FORWARD_SIGNALS, TERMINATE_SIGNALS};
use crate::supervisor::{
    OsProcessControl, ProcessControl, SidekiqProcessSupervisor, SupervisorOptions,
};

#[derive(Debug)]
pub enum Plan {
    ListQueues(Vec<QueueGroup>),
    Start(StartPlan),
}

#[derive(Debug)]
pub struct StartPlan {
    pub groups: Vec<QueueGroup>,
    pub config: ClusterConfig,
    pub pidfile: Option<PathBuf>,
    pub interval: Duration,
    pub metrics_server: Option<MetricsServer>,
}

pub async fn run(cli: Cli, runtime: RuntimeEnv) -> Result<()> {
    match plan(&cli, &runtime)? {
        Plan::ListQueues(groups) => {
            for line in list_queues_output(&groups) {
                println!("{line}");
            }
            Ok(())
        }
        Plan::Start(plan) => start_and_supervise(plan, &runtime).await,
    }
}

pub fn plan(cli: &Cli, runtime: &RuntimeEnv) -> Result<Plan> {
    if cli.queues.is_empty() {
        return Err(
            CommandError::new("You must specify at least one queue to start a worker for").into(),
        );
    }
    if cli.dryrun && cli.list_queues {
        return Err(CommandError::new(
            "The --dryrun and --list-queues options are mutually exclusive",
        )
        .into());
    }

    let config = ClusterConfig {
        env: cli
            .environment
            .clone()
            .unwrap_or_else(|| runtime.rails_env.clone()),
        directory: cli
            .rails_path
            .clone()
            .unwrap_or_else(|| runtime.working_dir.clone()),
        max_concurrency: cli.max_concurrency,
        min_concurrency: cli.min_concurrency,
        dryrun: cli.dryrun,
        timeout: cli.timeout,
    };
    config.validate()?;

    let catalog = QueueCatalog::load(&config.directory)?;
    let groups = resolve_queue_groups(
        &cli.queues,
        &catalog,
        ResolveOptions {
            queue_selector: cli.queue_selector,
            negate: cli.negate,
        },
    )?;

    if cli.list_queues {
        return Ok(Plan::ListQueues(groups));
    }

    let settings_path = runtime.settings_path_for(&config.directory);
    let settings = MonitoringSettings::load(&settings_path, &config.env)?;
    let metrics_server = match settings.sidekiq_exporter.port {
        Some(port) if metrics_server_enabled(&settings, config.dryrun) => Some(MetricsServer {
            binary: runtime.metrics_server_binary.clone(),
            metrics_dir: runtime.metrics_dir.clone(),
            address: settings.sidekiq_exporter.address_or_default().to_string(),
            port,
            reset_signals: trapped_signals(),
        }),
        _ => None,
    };

    Ok(Plan::Start(StartPlan {
        groups,
        config,
        pidfile: cli.pidfile.clone(),
        interval: Duration::from_secs(cli.interval),
        metrics_server,
    }))
}

pub fn list_queues_output(groups: &[QueueGroup]) -> Vec<String> {
    groups.iter().map(|group| group.sorted().join(",")).collect()
}

async fn start_and_supervise(plan: StartPlan, runtime: &RuntimeEnv) -> Result<()> {
    if plan.config.dryrun {
        cluster::start(&plan.groups, &plan.config, &runtime.worker_command)?;
        return Ok(());
    }

    launch_cluster(&mut OsClusterOps { runtime }, OsProcessControl, plan).await
}

pub trait ClusterOps {
    fn cleanup_metrics_dir(&mut self) -> Result<()>;
    fn listen(&mut self) -> Result<UnboundedReceiver<Signal>>;
    fn start_workers(
        &mut self,
        groups: &[QueueGroup],
        config: &ClusterConfig,
    ) -> Result<Vec<u32>>;
    fn stop_workers(&mut self, pids: &[u32]);
    fn metrics_launcher(&mut self, server: MetricsServer) -> Box<dyn MetricsLauncher>;
}

pub struct OsClusterOps<'a> {
    runtime: &'a RuntimeEnv,
}

impl ClusterOps for OsClusterOps<'_> {
    fn cleanup_metrics_dir(&mut self) -> Result<()> {
        cleanup_metrics_dir(&self.runtime.metrics_dir).map(|_| ())
    }

    fn listen(&mut self) -> Result<UnboundedReceiver<Signal>> {
        signals::listen(&trapped_signals())
    }

    fn start_workers(
        &mut self,
        groups: &[QueueGroup],
        config: &ClusterConfig,
    ) -> Result<Vec<u32>> {
        cluster::start(groups, config, &self.runtime.worker_command)
    }

    fn stop_workers(&mut self, pids: &[u32]) {
        signal_processes(pids, Signal::SIGTERM);
    }

    fn metrics_launcher(&mut self, server: MetricsServer) -> Box<dyn MetricsLauncher> {
        Box::new(server)
    }
}

/// Cleans the metrics directory, traps signals, starts the workers, then
/// the metrics server, and supervises until the cluster stops.
pub async fn launch_cluster<O, C>(ops: &mut O, control: C, plan: StartPlan) -> Result<()>
where
    O: ClusterOps,
    C: ProcessControl,
{
    info!("Starting cluster with {} processes", plan.groups.len());
    ops.cleanup_metrics_dir()?;

    let signal_queue = ops.listen()?;
    let workers = ops.start_workers(&plan.groups, &plan.config)?;

    if let Some(path) = &plan.pidfile {
        write_pid(path)?;
    }

    let options = SupervisorOptions {
        health_check_interval: plan.interval,
        terminate_timeout: Duration::from_secs(
            plan.config.timeout.saturating_add(TIMEOUT_GRACE_PERIOD_SECONDS),
        ),
        term_signals: TERMINATE_SIGNALS.to_vec(),
        forwarded_signals: FORWARD_SIGNALS.to_vec(),
    };
    let mut supervisor = SidekiqProcessSupervisor::new(control, options, workers.clone());

    if let Some(server) = plan.metrics_server {
        let mut launcher = ops.metrics_launcher(server);
        match launcher.launch() {
            Ok(pid) => supervisor = supervisor.with_metrics_server(pid, launcher),
            Err(err) => {
                error!("failed to start metrics server, stopping workers: {err:#}");
                ops.stop_workers(&workers);
                return Err(err);
            }
        }
    }

    supervisor
        .supervise(signal_queue, |alive| debug!(alive = ?alive, "health check"))
        .await
}
