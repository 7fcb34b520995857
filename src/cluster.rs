use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::process_management::{signal_processes, spawn_detached};
use crate::queues::QueueGroup;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: PathBuf,
}

impl WorkerCommand {
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }

    fn into_command(self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env)
            .current_dir(self.current_dir);
        command
    }
}

/// A spawn failure aborts the whole start and terminates the workers that
/// already started.
pub fn start(
    groups: &[QueueGroup],
    config: &ClusterConfig,
    command_prefix: &[String],
) -> Result<Vec<u32>> {
    let commands: Vec<WorkerCommand> = groups
        .iter()
        .enumerate()
        .map(|(index, group)| worker_command(index, group, config, command_prefix))
        .collect::<Result<_>>()?;

    if config.dryrun {
        for command in &commands {
            println!("{}", command.display());
        }
        return Ok(Vec::new());
    }

    spawn_all(commands, groups, |command, label| {
        spawn_detached(command.into_command(), label)
    })
}

fn spawn_all<F>(
    commands: Vec<WorkerCommand>,
    groups: &[QueueGroup],
    mut spawn: F,
) -> Result<Vec<u32>>
where
    F: FnMut(WorkerCommand, &str) -> Result<u32>,
{
    let mut pids = Vec::with_capacity(commands.len());
    for (index, command) in commands.into_iter().enumerate() {
        let label = format!("sidekiq worker {index}");
        debug!("starting {label}: {}", command.display());
        match spawn(command, &label) {
            Ok(pid) => {
                info!(
                    pid,
                    worker_id = index,
                    queues = %groups[index],
                    "started sidekiq worker"
                );
                pids.push(pid);
            }
            Err(err) => {
                if !pids.is_empty() {
                    warn!(started = ?pids, "stopping workers after a failed start");
                    signal_processes(&pids, Signal::SIGTERM);
                }
                return Err(err);
            }
        }
    }

    Ok(pids)
}

/// Builds the invocation for the worker at `index`:
/// `<prefix> -c<N> -e<env> -t<timeout> -gqueues:<list> -r<dir> -q<queue>,1 ...`.
pub fn worker_command(
    index: usize,
    group: &QueueGroup,
    config: &ClusterConfig,
    command_prefix: &[String],
) -> Result<WorkerCommand> {
    let (program, prefix_args) = command_prefix
        .split_first()
        .context("worker command cannot be empty")?;

    let queue_count = u32::try_from(group.len()).unwrap_or(u32::MAX);
    let threads = concurrency(queue_count, config.min_concurrency, config.max_concurrency);

    let mut args = prefix_args.to_vec();
    args.push(format!("-c{threads}"));
    args.push(format!("-e{}", config.env));
    args.push(format!("-t{}", config.timeout));
    args.push(format!("-gqueues:{group}"));
    args.push(format!("-r{}", config.directory.display()));
    args.extend(group.queues().iter().map(|queue| format!("-q{queue},1")));

    Ok(WorkerCommand {
        program: program.clone(),
        args,
        env: vec![
            ("ENABLE_SIDEKIQ_CLUSTER".to_string(), "1".to_string()),
            ("SIDEKIQ_WORKER_ID".to_string(), index.to_string()),
        ],
        current_dir: working_dir(&config.directory),
    })
}

/// Threads for a worker serving `queue_count` queues: one per queue plus
/// one, clamped to `[min, max]`. A `max` of zero means unbounded.
pub fn concurrency(queue_count: u32, min_concurrency: u32, max_concurrency: u32) -> u32 {
    let from_queues = queue_count.saturating_add(1);
    let max = if max_concurrency > 0 {
        max_concurrency
    } else {
        from_queues
    };
    let min = min_concurrency.min(max);
    from_queues.clamp(min, max)
}

fn working_dir(directory: &Path) -> PathBuf {
    if directory.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        directory.to_path_buf()
    }
}
