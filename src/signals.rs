use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::debug;

pub const TERMINATE_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

pub const FORWARD_SIGNALS: [Signal; 4] = [
    Signal::SIGTTIN,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGHUP,
];

/// Every signal the supervisor traps. Children launched by the supervisor
/// get these restored to their default disposition.
pub fn trapped_signals() -> Vec<Signal> {
    TERMINATE_SIGNALS
        .iter()
        .chain(FORWARD_SIGNALS.iter())
        .copied()
        .collect()
}

/// The handlers only record which signal arrived; the supervisor loop
/// drains the queue and does the actual work. Handlers are in place when
/// this returns. Must run inside a Tokio runtime.
pub fn listen(signals: &[Signal]) -> Result<UnboundedReceiver<Signal>> {
    let (tx, rx) = mpsc::unbounded_channel();

    for &trapped in signals {
        let mut stream = signal(SignalKind::from_raw(trapped as i32))
            .with_context(|| format!("failed to install handler for {trapped}"))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                debug!("received {trapped}");
                if tx.send(trapped).is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::sys::signal::{raise, Signal};
    use tokio::time::timeout;

    use super::{listen, trapped_signals, FORWARD_SIGNALS, TERMINATE_SIGNALS};

    #[test]
    fn trapped_signals_cover_both_classes() {
        let trapped = trapped_signals();
        assert_eq!(trapped.len(), TERMINATE_SIGNALS.len() + FORWARD_SIGNALS.len());
        assert!(trapped.contains(&Signal::SIGTERM));
        assert!(trapped.contains(&Signal::SIGTTIN));
    }

    #[tokio::test]
    async fn delivered_signals_are_queued() {
        let mut queue = listen(&[Signal::SIGUSR2]).expect("expected handler install");

        raise(Signal::SIGUSR2).expect("expected raise to succeed");

        let received = timeout(Duration::from_secs(5), queue.recv())
            .await
            .expect("signal should be queued in time");
        assert_eq!(received, Some(Signal::SIGUSR2));
    }
}
