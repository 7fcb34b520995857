use std::fs;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, error, warn};

pub fn write_pid(path: &Path) -> Result<()> {
    fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

pub fn signal(pid: u32, signal: Signal) -> Result<()> {
    match kill(os_pid(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(anyhow::anyhow!("failed to send {signal} to {pid}: {err}")),
    }
}

pub fn signal_processes(pids: &[u32], signal_kind: Signal) {
    for pid in pids {
        if let Err(err) = signal(*pid, signal_kind) {
            warn!("{err}");
        }
    }
}

/// Sends `signal` to the process group led by `pid`, falling back to the
/// PID itself when no such group exists.
pub fn signal_group(pid: u32, signal_kind: Signal) -> Result<()> {
    match killpg(os_pid(pid), signal_kind) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => signal(pid, signal_kind),
        Err(err) => {
            warn!("failed to send {signal_kind} to process group {pid}: {err}");
            signal(pid, signal_kind)
        }
    }
}

/// Liveness check using the null signal. `EPERM` means the process exists
/// but belongs to someone else.
pub fn process_alive(pid: u32) -> Result<bool> {
    match kill(os_pid(pid), None::<Signal>) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(anyhow::anyhow!("failed to check pid {pid}: {err}")),
    }
}

/// Spawns `command` in its own process group without waiting for it and
/// returns the PID. A background task reaps the child so that liveness
/// checks stop reporting it once it exits. Must run inside a Tokio runtime.
pub fn spawn_detached(mut command: Command, label: &str) -> Result<u32> {
    unsafe {
        command.pre_exec(|| {
            if nix::libc::setpgid(0, 0) == 0 {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        });
    }
    command.stdin(Stdio::null());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {label}"))?;
    let pid = child.id().context("spawned child has no pid")?;

    let label = label.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("{label} (pid {pid}) exited with {status}"),
            Err(err) => error!("wait for {label} (pid {pid}) failed: {err}"),
        }
    });

    Ok(pid)
}

fn os_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as i32)
}
