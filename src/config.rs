use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::errors::CommandError;

pub const DEFAULT_MAX_CONCURRENCY: u32 = 50;
pub const DEFAULT_MIN_CONCURRENCY: u32 = 0;
pub const DEFAULT_SOFT_TIMEOUT_SECONDS: u64 = 25;
/// Extra time on top of the soft timeout before stuck children are killed.
pub const TIMEOUT_GRACE_PERIOD_SECONDS: u64 = 5;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS: u64 = 5;

const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_WORKER_COMMAND: &str = "bundle exec sidekiq";
const DEFAULT_METRICS_DIR: &str = "tmp/prometheus_multiproc_dir/sidekiq";
const METRICS_SERVER_BINARY_NAME: &str = "metrics-server";
const SETTINGS_RELATIVE_PATH: &str = "config/gitlab.yml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub env: String,
    pub directory: PathBuf,
    /// `0` disables the upper bound.
    pub max_concurrency: u32,
    pub min_concurrency: u32,
    pub dryrun: bool,
    pub timeout: u64,
}

impl ClusterConfig {
    pub fn validate(&self) -> std::result::Result<(), CommandError> {
        if self.max_concurrency > 0 && self.min_concurrency > self.max_concurrency {
            return Err(CommandError::new(format!(
                "--min-concurrency ({}) cannot exceed --max-concurrency ({})",
                self.min_concurrency, self.max_concurrency
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv {
    pub rails_env: String,
    pub working_dir: PathBuf,
    pub metrics_dir: PathBuf,
    pub settings_path: Option<PathBuf>,
    pub worker_command: Vec<String>,
    pub metrics_server_binary: PathBuf,
}

impl RuntimeEnv {
    pub fn load() -> Result<Self> {
        let working_dir = env::current_dir().context("failed to resolve working directory")?;

        let rails_env = env_string("RAILS_ENV").unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());
        let metrics_dir = env_string("prometheus_multiproc_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| working_dir.join(DEFAULT_METRICS_DIR));
        let settings_path = env_string("GITLAB_CONFIG").map(PathBuf::from);

        let raw_command = env_string("SIDEKIQ_CLUSTER_WORKER_COMMAND")
            .unwrap_or_else(|| DEFAULT_WORKER_COMMAND.to_string());
        let worker_command = shell_words::split(&raw_command)
            .with_context(|| format!("invalid SIDEKIQ_CLUSTER_WORKER_COMMAND {raw_command:?}"))?;
        if worker_command.is_empty() {
            anyhow::bail!("SIDEKIQ_CLUSTER_WORKER_COMMAND cannot be empty");
        }

        let metrics_server_binary = match env_string("METRICS_SERVER_BINARY") {
            Some(path) => PathBuf::from(path),
            None => sibling_binary(METRICS_SERVER_BINARY_NAME)?,
        };

        Ok(Self {
            rails_env,
            working_dir,
            metrics_dir,
            settings_path,
            worker_command,
            metrics_server_binary,
        })
    }

    pub fn settings_path_for(&self, directory: &Path) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(|| directory.join(SETTINGS_RELATIVE_PATH))
    }
}

fn sibling_binary(name: &str) -> Result<PathBuf> {
    let executable = env::current_exe().context("failed to locate current executable")?;
    Ok(executable.with_file_name(name))
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
