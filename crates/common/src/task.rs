//! Critical-task spawning with shutdown propagation.
//!
//! Each subsystem runs as a long-lived task. A failure or panic in any
//! critical task triggers a node-wide shutdown through the shared
//! cancellation token, mirroring how the node binary supervises its
//! services.

use std::{future::Future, sync::Arc};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Report sent when a critical task exits.
#[derive(Debug)]
struct TaskExit {
    name: &'static str,
    error: Option<anyhow::Error>,
}

/// Owns the shutdown token and collects critical-task exits.
#[derive(Debug)]
pub struct TaskManager {
    shutdown: CancellationToken,
    exit_tx: mpsc::UnboundedSender<TaskExit>,
    exit_rx: mpsc::UnboundedReceiver<TaskExit>,
}

impl TaskManager {
    pub fn new() -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            shutdown: CancellationToken::new(),
            exit_tx,
            exit_rx,
        }
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor {
            shutdown: self.shutdown.clone(),
            exit_tx: self.exit_tx.clone(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Blocks until ctrl-c or the first critical task failure, then cancels
    /// the shutdown token so every subsystem unwinds.
    pub async fn monitor(&mut self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
            }
            Some(exit) = self.exit_rx.recv() => {
                match exit.error {
                    Some(e) => error!(task = exit.name, %e, "critical task failed"),
                    None => info!(task = exit.name, "critical task finished"),
                }
            }
        }
        self.shutdown.cancel();
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle used to spawn critical tasks.
#[derive(Clone, Debug)]
pub struct TaskExecutor {
    shutdown: CancellationToken,
    exit_tx: mpsc::UnboundedSender<TaskExit>,
}

impl TaskExecutor {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns a task whose exit (clean or failed) is reported to the
    /// manager. A failed critical task takes the node down.
    pub fn spawn_critical<F>(&self, name: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let error = fut.await.err();
            let _ = exit_tx.send(TaskExit { name, error });
        })
    }

    /// Spawns a fire-and-forget task that stops when the shutdown token is
    /// cancelled.
    pub fn spawn_with_shutdown<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = fut => {}
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_critical_failure_triggers_shutdown() {
        let mut manager = TaskManager::new();
        let executor = manager.executor();
        let token = manager.shutdown_token();

        executor.spawn_critical("boom", async { Err(anyhow::anyhow!("boom")) });

        manager.monitor().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_spawn_with_shutdown_stops_on_cancel() {
        let manager = TaskManager::new();
        let executor = manager.executor();

        let handle = executor.spawn_with_shutdown(async {
            std::future::pending::<()>().await;
        });

        manager.shutdown_token().cancel();
        handle.await.unwrap();
    }
}
