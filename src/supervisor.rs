use anyhow::Result;
use nix::sys::signal::Signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::metrics_server::MetricsLauncher;
use crate::process_management;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const MAX_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    ShuttingDown,
    Stopped,
}

pub trait ProcessControl {
    fn is_alive(&self, pid: u32) -> Result<bool>;
    fn signal(&self, pid: u32, signal: Signal);
    fn kill_group(&self, pid: u32);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn is_alive(&self, pid: u32) -> Result<bool> {
        process_management::process_alive(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) {
        if let Err(err) = process_management::signal(pid, signal) {
            warn!("{err}");
        }
    }

    fn kill_group(&self, pid: u32) {
        if let Err(err) = process_management::signal_group(pid, Signal::SIGKILL) {
            warn!("{err}");
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub health_check_interval: Duration,
    /// Time children get after a terminate request before they are killed.
    pub terminate_timeout: Duration,
    pub term_signals: Vec<Signal>,
    pub forwarded_signals: Vec<Signal>,
}

/// Watches the worker fleet and the optional metrics server.
///
/// Any worker exit takes the whole fleet down; the metrics server is
/// respawned for as long as the supervisor is running. Signals are queued
/// by [`crate::signals::listen`] and handled between ticks.
pub struct SidekiqProcessSupervisor<C: ProcessControl> {
    control: C,
    options: SupervisorOptions,
    state: SupervisorState,
    workers: Vec<u32>,
    metrics_pid: Option<u32>,
    metrics_launcher: Option<Box<dyn MetricsLauncher>>,
    metrics_restart_pending: bool,
    shutdown_deadline: Option<Instant>,
    escalated: bool,
}

impl<C: ProcessControl> SidekiqProcessSupervisor<C> {
    pub fn new(control: C, options: SupervisorOptions, workers: Vec<u32>) -> Self {
        Self {
            control,
            options,
            state: SupervisorState::Running,
            workers,
            metrics_pid: None,
            metrics_launcher: None,
            metrics_restart_pending: false,
            shutdown_deadline: None,
            escalated: false,
        }
    }

    pub fn with_metrics_server(mut self, pid: u32, launcher: Box<dyn MetricsLauncher>) -> Self {
        self.metrics_pid = Some(pid);
        self.metrics_launcher = Some(launcher);
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn alive(&self) -> bool {
        self.state == SupervisorState::Running
    }

    pub fn metrics_pid(&self) -> Option<u32> {
        self.metrics_pid
    }

    pub fn tracked(&self) -> Vec<u32> {
        self.workers.iter().copied().chain(self.metrics_pid).collect()
    }

    pub async fn supervise<F>(
        &mut self,
        mut signals: UnboundedReceiver<Signal>,
        mut on_tick: F,
    ) -> Result<()>
    where
        F: FnMut(&[u32]),
    {
        let period = self
            .options
            .health_check_interval
            .clamp(MIN_HEALTH_CHECK_INTERVAL, MAX_HEALTH_CHECK_INTERVAL);
        let mut ticker = ticker(period);
        let mut shutdown_polling = false;

        info!(
            workers = self.workers.len(),
            metrics_server = self.metrics_pid.is_some(),
            "supervising cluster"
        );

        while self.state != SupervisorState::Stopped {
            tokio::select! {
                Some(received) = signals.recv() => {
                    self.handle_signal(received, Instant::now());
                }
                _ = ticker.tick() => {
                    let alive = self.check(Instant::now())?;
                    on_tick(&alive);
                }
            }

            if self.state == SupervisorState::ShuttingDown && !shutdown_polling {
                ticker = ticker_now(SHUTDOWN_POLL_INTERVAL.min(period));
                shutdown_polling = true;
            }
        }

        info!("cluster stopped");
        Ok(())
    }

    pub fn handle_signal(&mut self, received: Signal, now: Instant) {
        if self.options.term_signals.contains(&received) {
            info!("received {received}, shutting down the cluster");
            self.signal_tracked(received);
            self.begin_shutdown(now);
        } else if self.options.forwarded_signals.contains(&received) {
            info!("forwarding {received} to the cluster");
            self.signal_tracked(received);
        } else {
            debug!("ignoring {received}");
        }
    }

    pub fn check(&mut self, now: Instant) -> Result<Vec<u32>> {
        let mut dead_workers = Vec::new();
        let mut live_workers = Vec::with_capacity(self.workers.len());
        for pid in &self.workers {
            if self.control.is_alive(*pid)? {
                live_workers.push(*pid);
            } else {
                dead_workers.push(*pid);
            }
        }
        self.workers = live_workers;

        let mut metrics_died = false;
        if let Some(pid) = self.metrics_pid {
            if !self.control.is_alive(pid)? {
                self.metrics_pid = None;
                metrics_died = true;
            }
        }

        if self.state == SupervisorState::Running {
            if !dead_workers.is_empty() {
                info!(
                    dead = ?dead_workers,
                    "a worker terminated, shutting down the cluster"
                );
                self.signal_tracked(Signal::SIGTERM);
                self.begin_shutdown(now);
            } else if metrics_died || self.metrics_restart_pending {
                if metrics_died {
                    info!("metrics server terminated, restarting");
                }
                self.restart_metrics_server();
            }
        }

        if self.state == SupervisorState::ShuttingDown {
            if self.workers.is_empty() && self.metrics_pid.is_none() {
                self.state = SupervisorState::Stopped;
            } else if !self.escalated
                && self
                    .shutdown_deadline
                    .is_some_and(|deadline| now >= deadline)
            {
                let remaining = self.tracked();
                warn!(
                    remaining = ?remaining,
                    "children still running after {}s, sending SIGKILL",
                    self.options.terminate_timeout.as_secs()
                );
                for pid in remaining {
                    self.control.kill_group(pid);
                }
                self.escalated = true;
            }
        }

        Ok(self.tracked())
    }

    fn begin_shutdown(&mut self, now: Instant) {
        if self.state == SupervisorState::Running {
            self.state = SupervisorState::ShuttingDown;
            self.metrics_restart_pending = false;
            // A timeout past the end of representable time never escalates.
            self.shutdown_deadline = now.checked_add(self.options.terminate_timeout);
        }
    }

    fn restart_metrics_server(&mut self) {
        let Some(launcher) = self.metrics_launcher.as_mut() else {
            self.metrics_restart_pending = false;
            return;
        };

        match launcher.launch() {
            Ok(pid) => {
                self.metrics_pid = Some(pid);
                self.metrics_restart_pending = false;
            }
            Err(err) => {
                error!("failed to restart metrics server, retrying on next check: {err:#}");
                self.metrics_restart_pending = true;
            }
        }
    }

    fn signal_tracked(&self, signal: Signal) {
        for pid in self.tracked() {
            self.control.signal(pid, signal);
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

fn ticker_now(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
