//! Isolated plugin execution.
//!
//! Each plugin runs in its own worker thread, talked to exclusively
//! through a command channel. The bytecode execution itself happens
//! behind the [`PluginExecutor`] seam; the worker owns state bookkeeping,
//! resource-cap wiring and crash containment.

use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    errors::PluginError,
    hooks::HookEvent,
    metadata::ThreadingPermissions,
    registry::PluginRecord,
};

/// Context handed to a plugin when it is loaded.
#[derive(Clone, Debug)]
pub struct PluginLoadContext {
    pub plugin_id: String,
    pub network: String,
    pub chain_id: u64,
    /// Plugin-specific configuration document.
    pub config_json: String,
}

/// Executes plugin bytecode inside the worker thread. The OP_NET VM
/// provides the production implementation; tests script their own.
pub trait PluginExecutor: Send + 'static {
    fn on_load(&mut self, ctx: &PluginLoadContext) -> Result<(), String>;

    fn on_hook(&mut self, event: &HookEvent) -> Result<(), String>;
}

/// Executor that accepts everything; used when a plugin has no native
/// handlers for an event.
#[derive(Debug, Default)]
pub struct NoopExecutor;

impl PluginExecutor for NoopExecutor {
    fn on_load(&mut self, _ctx: &PluginLoadContext) -> Result<(), String> {
        Ok(())
    }

    fn on_hook(&mut self, _event: &HookEvent) -> Result<(), String> {
        Ok(())
    }
}

/// Handle to one plugin's isolated execution unit.
#[async_trait]
pub trait PluginWorker: Send + Sync {
    async fn load(&self, ctx: PluginLoadContext) -> Result<(), PluginError>;

    async fn enable(&self) -> Result<(), PluginError>;

    async fn disable(&self) -> Result<(), PluginError>;

    async fn unload(&self) -> Result<(), PluginError>;

    async fn dispatch_hook(&self, event: &HookEvent) -> Result<(), PluginError>;

    /// Highest block the plugin has fully processed.
    async fn last_synced_block(&self) -> Result<Option<u64>, PluginError>;

    async fn set_last_synced_block(&self, height: u64) -> Result<(), PluginError>;
}

/// Creates workers for freshly loaded plugins.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, record: &PluginRecord) -> Result<Arc<dyn PluginWorker>, PluginError>;
}

enum WorkerOp {
    Load(PluginLoadContext),
    Enable,
    Disable,
    Unload,
    Hook(HookEvent),
    GetLastSynced,
    SetLastSynced(u64),
}

struct WorkerCommand {
    op: WorkerOp,
    reply: oneshot::Sender<Result<Option<u64>, String>>,
}

/// Worker backed by a dedicated OS thread. A panic inside the executor
/// kills the thread; subsequent commands fail, which the manager treats
/// as a crash.
#[derive(Debug)]
pub struct ThreadWorker {
    plugin_id: String,
    tx: mpsc::Sender<WorkerCommand>,
}

impl ThreadWorker {
    pub fn start(
        plugin_id: String,
        caps: ThreadingPermissions,
        mut executor: Box<dyn PluginExecutor>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<WorkerCommand>(64);
        let thread_id = plugin_id.clone();

        let _worker_thread = thread::Builder::new()
            .name(format!("plugin-{plugin_id}"))
            .spawn(move || {
                debug!(
                    plugin = %thread_id,
                    cpu_limit = caps.cpu_limit_percent,
                    memory_limit_mb = caps.memory_limit_mb,
                    "plugin worker started"
                );
                let mut last_synced: Option<u64> = None;

                while let Some(command) = rx.blocking_recv() {
                    let result: Result<Option<u64>, String> = match command.op {
                        WorkerOp::Load(ctx) => executor.on_load(&ctx).map(|_| None),
                        WorkerOp::Enable | WorkerOp::Disable => Ok(None),
                        WorkerOp::Hook(event) => executor.on_hook(&event).map(|_| None),
                        WorkerOp::GetLastSynced => Ok(last_synced),
                        WorkerOp::SetLastSynced(height) => {
                            last_synced = Some(height);
                            Ok(None)
                        }
                        WorkerOp::Unload => {
                            let _ = command.reply.send(Ok(None));
                            break;
                        }
                    };
                    let _ = command.reply.send(result);
                }
                debug!(plugin = %thread_id, "plugin worker stopped");
            })
            .expect("spawning a worker thread");

        Self { plugin_id, tx }
    }

    async fn call(&self, op: WorkerOp) -> Result<Option<u64>, PluginError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand { op, reply })
            .await
            .map_err(|_| PluginError::Crashed(self.plugin_id.clone()))?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(PluginError::Worker(reason)),
            // Reply dropped: the worker thread died mid-command.
            Err(_) => Err(PluginError::Crashed(self.plugin_id.clone())),
        }
    }
}

#[async_trait]
impl PluginWorker for ThreadWorker {
    async fn load(&self, ctx: PluginLoadContext) -> Result<(), PluginError> {
        self.call(WorkerOp::Load(ctx)).await.map(|_| ())
    }

    async fn enable(&self) -> Result<(), PluginError> {
        self.call(WorkerOp::Enable).await.map(|_| ())
    }

    async fn disable(&self) -> Result<(), PluginError> {
        self.call(WorkerOp::Disable).await.map(|_| ())
    }

    async fn unload(&self) -> Result<(), PluginError> {
        self.call(WorkerOp::Unload).await.map(|_| ())
    }

    async fn dispatch_hook(&self, event: &HookEvent) -> Result<(), PluginError> {
        self.call(WorkerOp::Hook(event.clone())).await.map(|_| ())
    }

    async fn last_synced_block(&self) -> Result<Option<u64>, PluginError> {
        self.call(WorkerOp::GetLastSynced).await
    }

    async fn set_last_synced_block(&self, height: u64) -> Result<(), PluginError> {
        self.call(WorkerOp::SetLastSynced(height)).await.map(|_| ())
    }
}

/// Default spawner: one thread per plugin, noop executor (the embedding
/// binary installs the VM-backed executor factory).
pub struct ThreadWorkerSpawner {
    executor_factory: Arc<dyn Fn(&PluginRecord) -> Box<dyn PluginExecutor> + Send + Sync>,
}

impl std::fmt::Debug for ThreadWorkerSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadWorkerSpawner").finish_non_exhaustive()
    }
}

impl ThreadWorkerSpawner {
    pub fn new(
        executor_factory: Arc<dyn Fn(&PluginRecord) -> Box<dyn PluginExecutor> + Send + Sync>,
    ) -> Self {
        Self { executor_factory }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(|_| Box::new(NoopExecutor)))
    }
}

impl WorkerSpawner for ThreadWorkerSpawner {
    fn spawn(&self, record: &PluginRecord) -> Result<Arc<dyn PluginWorker>, PluginError> {
        let caps = record.metadata.permissions.threading.clone();
        if caps.memory_limit_mb == 0 {
            warn!(plugin = %record.id, "no memory cap declared, using worker defaults");
        }
        let executor = (self.executor_factory)(record);
        Ok(Arc::new(ThreadWorker::start(
            record.id.clone(),
            caps,
            executor,
        )))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn load_ctx(id: &str) -> PluginLoadContext {
        PluginLoadContext {
            plugin_id: id.into(),
            network: "regtest".into(),
            chain_id: 0,
            config_json: "{}".into(),
        }
    }

    #[tokio::test]
    async fn test_thread_worker_lifecycle() {
        let worker = ThreadWorker::start(
            "demo".into(),
            ThreadingPermissions::default(),
            Box::new(NoopExecutor),
        );

        worker.load(load_ctx("demo")).await.unwrap();
        worker.enable().await.unwrap();
        worker.set_last_synced_block(42).await.unwrap();
        assert_eq!(worker.last_synced_block().await.unwrap(), Some(42));
        worker.disable().await.unwrap();
        worker.unload().await.unwrap();

        // The thread is gone; further commands surface as a crash.
        let err = worker.enable().await.unwrap_err();
        assert!(matches!(err, PluginError::Crashed(_)));
    }

    #[tokio::test]
    async fn test_executor_failure_propagates() {
        struct FailingExecutor;
        impl PluginExecutor for FailingExecutor {
            fn on_load(&mut self, _ctx: &PluginLoadContext) -> Result<(), String> {
                Err("bad bytecode".into())
            }
            fn on_hook(&mut self, _event: &HookEvent) -> Result<(), String> {
                Ok(())
            }
        }

        let worker = ThreadWorker::start(
            "demo".into(),
            ThreadingPermissions::default(),
            Box::new(FailingExecutor),
        );
        let err = worker.load(load_ctx("demo")).await.unwrap_err();
        assert!(matches!(err, PluginError::Worker(reason) if reason == "bad bytecode"));
        worker.unload().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_executor_reads_as_crash() {
        struct PanickingExecutor;
        impl PluginExecutor for PanickingExecutor {
            fn on_load(&mut self, _ctx: &PluginLoadContext) -> Result<(), String> {
                panic!("boom");
            }
            fn on_hook(&mut self, _event: &HookEvent) -> Result<(), String> {
                Ok(())
            }
        }

        let worker = ThreadWorker::start(
            "demo".into(),
            ThreadingPermissions::default(),
            Box::new(PanickingExecutor),
        );
        let err = worker.load(load_ctx("demo")).await.unwrap_err();
        assert!(matches!(err, PluginError::Crashed(_)));
    }
}
