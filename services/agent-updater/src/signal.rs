//! Shared cancellation and host signal handling.
//!
//! A single [`Shutdown`] token is threaded through every blocking step of an
//! update. It is backed by a `watch` channel, the same shape the node agent
//! uses for its worker shutdown.

use std::io;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Receiving side of the cancellation signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Firing side of the cancellation signal. Cloneable; fires at most once.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create a linked trigger and token.
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
    }

    /// A token that never fires. Used for steps that must not be skipped,
    /// such as restarting a stopped service.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Shutdown { rx }
    }

    /// Whether cancellation has fired.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation fires. Pends forever for [`Shutdown::never`].
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl ShutdownTrigger {
    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    /// A new token observing this trigger.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Converts host termination signals into a single cancellation.
pub struct SignalWatcher {
    task: JoinHandle<()>,
}

impl SignalWatcher {
    /// Subscribe to termination signals and fire `trigger` on the first one.
    ///
    /// Handlers are installed before this returns, so a signal delivered
    /// right after the call is not lost.
    #[cfg(unix)]
    pub fn spawn(trigger: ShutdownTrigger) -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        let task = tokio::spawn(async move {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = sighup.recv() => "SIGHUP",
            };
            if trigger.trigger() {
                info!(signal = name, "Termination signal received, cancelling update");
            }
        });

        Ok(Self { task })
    }

    #[cfg(not(unix))]
    pub fn spawn(trigger: ShutdownTrigger) -> io::Result<Self> {
        let task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && trigger.trigger() {
                info!(signal = "ctrl_c", "Termination signal received, cancelling update");
            }
        });

        Ok(Self { task })
    }

    /// Unsubscribe from signals.
    pub fn stop(self) {
        debug!("Stopping signal watcher");
        // Drop aborts the task, which drops the signal streams.
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_trigger_fires_once() {
        let (trigger, shutdown) = Shutdown::channel();
        assert!(!shutdown.is_triggered());

        assert!(trigger.trigger());
        assert!(!trigger.trigger());
        assert!(shutdown.is_triggered());
        assert!(trigger.subscribe().is_triggered());
    }

    #[tokio::test]
    async fn test_triggered_resolves() {
        let (trigger, shutdown) = Shutdown::channel();

        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.triggered().await }
        });
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_does_not_resolve() {
        let shutdown = Shutdown::never();
        assert!(!shutdown.is_triggered());

        let result = tokio::time::timeout(Duration::from_millis(20), shutdown.triggered()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_signal_watcher_stop_leaves_token_untouched() {
        let (trigger, shutdown) = Shutdown::channel();

        let watcher = SignalWatcher::spawn(trigger).unwrap();
        watcher.stop();

        tokio::task::yield_now().await;
        assert!(!shutdown.is_triggered());
    }
}
