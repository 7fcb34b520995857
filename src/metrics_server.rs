use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use tokio::process::Command;
use tracing::{debug, info};

use crate::process_management::spawn_detached;
use crate::settings::MonitoringSettings;

pub const METRICS_TARGET: &str = "sidekiq";

const METRICS_FILE_EXTENSIONS: [&str; 2] = ["db", "prom"];

/// Whether the cluster needs its own exporter process: never during a dry
/// run, and otherwise only when the exporter is enabled and listens on a
/// port distinct from the health checks.
pub fn metrics_server_enabled(settings: &MonitoringSettings, dryrun: bool) -> bool {
    if dryrun || !settings.sidekiq_exporter.enabled {
        return false;
    }

    match (
        settings.sidekiq_exporter.port,
        settings.sidekiq_health_checks.port,
    ) {
        (Some(exporter), Some(health_checks)) => exporter != health_checks,
        _ => false,
    }
}

pub fn cleanup_metrics_dir(dir: &Path) -> Result<usize> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create metrics dir {}", dir.display()))?;

    let mut removed = 0;
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read metrics dir {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let stale = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| METRICS_FILE_EXTENSIONS.contains(&ext));
        if !stale {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    }

    debug!("removed {removed} stale metric file(s) from {}", dir.display());
    Ok(removed)
}

pub trait MetricsLauncher {
    fn launch(&mut self) -> Result<u32>;
}

#[derive(Debug, Clone)]
pub struct MetricsServer {
    pub binary: PathBuf,
    pub metrics_dir: PathBuf,
    pub address: String,
    pub port: u16,
    /// Signals restored to their default disposition in the child.
    pub reset_signals: Vec<Signal>,
}

impl MetricsServer {
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--target")
            .arg(METRICS_TARGET)
            .arg("--metrics-dir")
            .arg(&self.metrics_dir)
            .arg("--address")
            .arg(&self.address)
            .arg("--port")
            .arg(self.port.to_string())
            .env("METRICS_SERVER_TARGET", METRICS_TARGET)
            .env("WIPE_METRICS_DIR", "0")
            .env("prometheus_multiproc_dir", &self.metrics_dir);

        let reset = self.reset_signals.clone();
        let restore_defaults = move || -> io::Result<()> {
            for trapped in &reset {
                unsafe { signal(*trapped, SigHandler::SigDfl) }.map_err(io::Error::from)?;
            }
            Ok(())
        };
        unsafe {
            command.pre_exec(restore_defaults);
        }
        command
    }
}

impl MetricsLauncher for MetricsServer {
    fn launch(&mut self) -> Result<u32> {
        info!(
            address = %self.address,
            port = self.port,
            "starting metrics server"
        );
        spawn_detached(self.command(), "metrics server")
    }
}
