//! Plugin lifecycle orchestration: discovery, validation, dependency-
//! ordered loading, crash handling, reindex coordination and hot reload.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{error, info, warn};

use crate::{
    errors::PluginError,
    format::{PluginFile, PluginSignatureVerifier},
    hooks::{HookDispatcher, HookEvent, HookType},
    metadata::PluginMetadata,
    registry::{PluginRecord, PluginRegistry},
    state::PluginState,
    watcher::WatchEvent,
    worker::{PluginLoadContext, PluginWorker, WorkerSpawner},
};

pub use crate::hooks::ReindexAction;

/// Manager configuration.
#[derive(Clone, Debug)]
pub struct PluginManagerConfig {
    pub plugins_dir: PathBuf,
    pub network: String,
    pub chain_id: u64,
    /// When set, the startup reindex protocol runs against this height.
    pub reindex_from_block: Option<u64>,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Decides the reindex step for one plugin given its sync position.
pub fn reindex_action(last_synced: u64, reindex_from: u64) -> ReindexAction {
    use std::cmp::Ordering::*;
    match last_synced.cmp(&reindex_from) {
        Equal => ReindexAction::None,
        Greater => ReindexAction::Purge {
            purge_to_block: reindex_from,
        },
        Less => ReindexAction::Sync {
            sync_from: last_synced,
            sync_to: reindex_from,
        },
    }
}

/// Owns the registry and one worker per running plugin.
pub struct PluginManager {
    config: PluginManagerConfig,
    registry: PluginRegistry,
    workers: HashMap<String, Arc<dyn PluginWorker>>,
    spawner: Arc<dyn WorkerSpawner>,
    verifier: Arc<dyn PluginSignatureVerifier>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    pub fn new(
        config: PluginManagerConfig,
        spawner: Arc<dyn WorkerSpawner>,
        verifier: Arc<dyn PluginSignatureVerifier>,
    ) -> Self {
        Self {
            config,
            registry: PluginRegistry::new(),
            workers: HashMap::new(),
            spawner,
            verifier,
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn state_of(&self, id: &str) -> Option<PluginState> {
        self.registry.get(id).map(|r| r.state)
    }

    /// Full startup: discover, validate, load in dependency order, enable,
    /// then run the reindex protocol if configured. A reindex refusal
    /// aborts node startup.
    pub async fn startup(&mut self) -> Result<(), PluginError> {
        self.discover()?;

        let order = self.registry.resolve_dependencies()?;
        info!(count = order.len(), "loading plugins");

        for id in &order {
            if let Err(e) = self.load_and_enable(id).await {
                error!(plugin = %id, %e, "plugin failed to start");
                self.mark_error(id, &e.to_string());
                // Dependents cannot run without it.
                for dependent in self.registry.transitive_dependents(id) {
                    self.mark_error(&dependent, &format!("dependency '{id}' failed"));
                }
            }
        }

        if let Some(reindex_from) = self.config.reindex_from_block {
            self.run_reindex(reindex_from).await?;
        }

        Ok(())
    }

    /// Scans the plugin directory for `*.opnet` files. Files that fail
    /// parsing, signature or metadata validation are skipped with an
    /// error log; they never reach the registry.
    pub fn discover(&mut self) -> Result<(), PluginError> {
        let dir = &self.config.plugins_dir;
        if !dir.exists() {
            warn!(dir = %dir.display(), "plugin directory does not exist");
            return Ok(());
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("opnet") {
                continue;
            }
            match self.validate_file(&path) {
                Ok(record) => {
                    info!(plugin = %record.id, path = %path.display(), "discovered plugin");
                    let id = record.id.clone();
                    self.registry.register(record);
                    self.registry.transition(&id, PluginState::Validated)?;
                }
                Err(e) => {
                    error!(path = %path.display(), %e, "rejecting plugin file");
                }
            }
        }
        Ok(())
    }

    /// Parses and fully validates one plugin file.
    fn validate_file(&self, path: &Path) -> Result<PluginRecord, PluginError> {
        let bytes = std::fs::read(path)?;
        let file = PluginFile::parse(&bytes)?;
        file.verify_signature(self.verifier.as_ref())?;
        let metadata = PluginMetadata::parse(&file.metadata_utf8)?;
        Ok(PluginRecord::new(path.to_path_buf(), metadata, file))
    }

    async fn load_and_enable(&mut self, id: &str) -> Result<(), PluginError> {
        self.load_plugin(id).await?;
        self.enable_plugin(id).await
    }

    /// Validated -> Loading -> Loaded, spawning the worker.
    async fn load_plugin(&mut self, id: &str) -> Result<(), PluginError> {
        self.registry.transition(id, PluginState::Loading)?;

        let record = self
            .registry
            .get(id)
            .ok_or_else(|| PluginError::UnknownPlugin(id.to_string()))?;
        let worker = self.spawner.spawn(record)?;

        let ctx = PluginLoadContext {
            plugin_id: id.to_string(),
            network: self.config.network.clone(),
            chain_id: self.config.chain_id,
            config_json: "{}".to_string(),
        };

        if let Err(e) = worker.load(ctx).await {
            self.registry.transition(id, PluginState::Error)?;
            return Err(e);
        }

        self.workers.insert(id.to_string(), worker);
        self.registry.transition(id, PluginState::Loaded)?;
        if let Some(record) = self.registry.get_mut(id) {
            record.loaded_at = Some(unix_millis());
        }
        Ok(())
    }

    pub async fn enable_plugin(&mut self, id: &str) -> Result<(), PluginError> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| PluginError::UnknownPlugin(id.to_string()))?
            .clone();
        worker.enable().await?;
        self.registry.transition(id, PluginState::Enabled)?;
        if let Some(record) = self.registry.get_mut(id) {
            record.enabled_at = Some(unix_millis());
        }
        Ok(())
    }

    pub async fn disable_plugin(&mut self, id: &str) -> Result<(), PluginError> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| PluginError::UnknownPlugin(id.to_string()))?
            .clone();
        worker.disable().await?;
        self.registry.transition(id, PluginState::Disabled)
    }

    /// Disables (if needed) and unloads, tearing the worker down.
    pub async fn unload_plugin(&mut self, id: &str) -> Result<(), PluginError> {
        if self.state_of(id) == Some(PluginState::Enabled) {
            self.disable_plugin(id).await?;
        }
        self.registry.transition(id, PluginState::Unloading)?;
        if let Some(worker) = self.workers.remove(id) {
            if let Err(e) = worker.unload().await {
                warn!(plugin = %id, %e, "worker unload failed");
            }
        }
        Ok(())
    }

    fn mark_error(&mut self, id: &str, reason: &str) {
        let _ = self.registry.transition(id, PluginState::Error);
        if let Some(record) = self.registry.get_mut(id) {
            record.error_info = Some(reason.to_string());
        }
        self.workers.remove(id);
    }

    /// Enabled plugins that declared the given hook, as dispatch targets.
    fn hook_targets(&self, hook: HookType) -> Vec<(String, Arc<dyn PluginWorker>)> {
        self.registry
            .records()
            .filter(|r| r.state == PluginState::Enabled && r.metadata.has_hook(hook.as_str()))
            .filter_map(|r| {
                self.workers
                    .get(&r.id)
                    .map(|w| (r.id.clone(), w.clone()))
            })
            .collect()
    }

    /// Dispatches a hook to every enabled plugin that declared it.
    ///
    /// Worker crashes are absorbed into the crash handler; for blocking
    /// hooks any failure (crash included) aborts the calling operation.
    pub async fn dispatch_hook(&mut self, event: &HookEvent) -> Result<(), PluginError> {
        let hook = event.hook_type();
        let targets = self.hook_targets(hook);
        let results = HookDispatcher::dispatch_collect(&targets, event).await;

        let mut first_failure = None;
        for (id, result) in results {
            match result {
                Ok(()) => {}
                Err(PluginError::Crashed(_)) => {
                    self.handle_crash(&id);
                    first_failure.get_or_insert(PluginError::HookFailed {
                        plugin: id,
                        reason: "worker crashed".into(),
                    });
                }
                Err(e) => {
                    warn!(plugin = %id, hook = hook.as_str(), %e, "hook failed");
                    first_failure.get_or_insert(PluginError::HookFailed {
                        plugin: id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        match first_failure {
            Some(failure) if hook.is_blocking() => Err(failure),
            _ => Ok(()),
        }
    }

    /// Marks a plugin crashed and takes its dependents out of rotation
    /// until it recovers.
    pub fn handle_crash(&mut self, id: &str) {
        error!(plugin = %id, "plugin worker crashed");
        if self.registry.transition(id, PluginState::Crashed).is_err() {
            return;
        }
        self.workers.remove(id);

        for dependent in self.registry.transitive_dependents(id) {
            if self.state_of(&dependent) == Some(PluginState::Enabled) {
                warn!(plugin = %dependent, "disabling dependent of crashed plugin");
                if let Some(record) = self.registry.get_mut(&dependent) {
                    record.state = PluginState::Disabled;
                    record.error_info = Some(format!("dependency '{id}' crashed"));
                }
            }
        }
    }

    /// Recovers a crashed plugin: fresh worker, reload, straight back to
    /// enabled, then re-enables dependents that were parked.
    pub async fn recover_crashed(&mut self, id: &str) -> Result<(), PluginError> {
        if self.state_of(id) != Some(PluginState::Crashed) {
            return Err(PluginError::UnknownPlugin(id.to_string()));
        }

        let record = self
            .registry
            .get(id)
            .ok_or_else(|| PluginError::UnknownPlugin(id.to_string()))?;
        let worker = self.spawner.spawn(record)?;
        worker
            .load(PluginLoadContext {
                plugin_id: id.to_string(),
                network: self.config.network.clone(),
                chain_id: self.config.chain_id,
                config_json: "{}".to_string(),
            })
            .await?;
        worker.enable().await?;
        self.workers.insert(id.to_string(), worker);
        self.registry.transition(id, PluginState::Enabled)?;

        for dependent in self.registry.transitive_dependents(id) {
            if self.state_of(&dependent) == Some(PluginState::Disabled) {
                self.enable_plugin(&dependent).await?;
            }
        }
        Ok(())
    }

    /// Startup reindex protocol. Every enabled plugin is brought to the
    /// reindex height; any refusal aborts startup.
    async fn run_reindex(&mut self, reindex_from: u64) -> Result<(), PluginError> {
        let ids: Vec<String> = self
            .registry
            .records()
            .filter(|r| r.state == PluginState::Enabled)
            .map(|r| r.id.clone())
            .collect();

        for id in ids {
            let worker = self.workers.get(&id).cloned().ok_or_else(|| {
                PluginError::UnknownPlugin(id.clone())
            })?;
            let last_synced = worker.last_synced_block().await?.unwrap_or(0);

            match reindex_action(last_synced, reindex_from) {
                ReindexAction::None => {}
                action @ ReindexAction::Purge { purge_to_block } => {
                    info!(plugin = %id, purge_to_block, "purging plugin state for reindex");
                    worker
                        .dispatch_hook(&HookEvent::ReindexRequired { action })
                        .await
                        .map_err(|_| PluginError::ReindexRefused(id.clone()))?;
                    worker
                        .dispatch_hook(&HookEvent::PurgeBlocks {
                            from: reindex_from,
                            to: None,
                        })
                        .await
                        .map_err(|_| PluginError::ReindexRefused(id.clone()))?;
                    worker.set_last_synced_block(reindex_from).await?;
                }
                action @ ReindexAction::Sync { .. } => {
                    info!(plugin = %id, ?action, "plugin behind reindex point");
                    worker
                        .dispatch_hook(&HookEvent::ReindexRequired { action })
                        .await
                        .map_err(|_| PluginError::ReindexRefused(id.clone()))?;
                }
            }
        }
        Ok(())
    }

    /// Applies a filesystem watch event.
    pub async fn handle_watch_event(&mut self, event: WatchEvent) {
        let result = match &event {
            WatchEvent::Added(path) => self.handle_added(path.clone()).await,
            WatchEvent::Modified(path) => self.handle_modified(path.clone()).await,
            WatchEvent::Removed(path) => self.handle_removed(path).await,
        };
        if let Err(e) = result {
            error!(?event, %e, "watch event handling failed");
        }
    }

    async fn handle_added(&mut self, path: PathBuf) -> Result<(), PluginError> {
        let record = self.validate_file(&path)?;
        let id = record.id.clone();
        if self.registry.contains(&id) {
            // A copy-then-rename can surface as add; treat as modify.
            return self.handle_modified(path).await;
        }
        self.registry.register(record);
        self.registry.transition(&id, PluginState::Validated)?;
        self.load_and_enable(&id).await
    }

    /// Full validate-then-reload of the plugin and its dependents,
    /// restoring each one's prior enabled/disabled state. If the new
    /// version fails validation the running version is left untouched.
    async fn handle_modified(&mut self, path: PathBuf) -> Result<(), PluginError> {
        // Validate the replacement before touching anything.
        let new_record = match self.validate_file(&path) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %path.display(), %e, "new plugin version invalid, keeping old");
                return Ok(());
            }
        };
        let id = new_record.id.clone();

        if !self.registry.contains(&id) {
            self.registry.register(new_record);
            self.registry.transition(&id, PluginState::Validated)?;
            return self.load_and_enable(&id).await;
        }

        // Remember prior states of the plugin and its dependents.
        let dependents = self.registry.transitive_dependents(&id);
        let mut prior: HashMap<String, PluginState> = HashMap::new();
        prior.insert(id.clone(), self.state_of(&id).unwrap_or(PluginState::Error));
        for dependent in &dependents {
            prior.insert(
                dependent.clone(),
                self.state_of(dependent).unwrap_or(PluginState::Error),
            );
        }

        // Tear down dependents first, then the plugin itself.
        for dependent in &dependents {
            if self.state_of(dependent).is_some_and(|s| s.is_running()) {
                self.unload_plugin(dependent).await?;
            }
        }
        if self.state_of(&id).is_some_and(|s| s.is_running()) {
            self.unload_plugin(&id).await?;
        }

        // Re-register the new version and bring everything back to its
        // prior state.
        self.registry.register(new_record);
        self.registry.transition(&id, PluginState::Validated)?;
        self.restore(&id, prior[&id]).await?;

        for dependent in dependents.iter().rev() {
            let mut record = self
                .registry
                .get(dependent)
                .ok_or_else(|| PluginError::UnknownPlugin(dependent.clone()))?
                .clone();
            record.state = PluginState::Discovered;
            record.loaded_at = None;
            record.enabled_at = None;
            self.registry.register(record);
            self.registry.transition(dependent, PluginState::Validated)?;
            self.restore(dependent, prior[dependent]).await?;
        }

        info!(plugin = %id, "hot reload complete");
        Ok(())
    }

    /// Loads a re-registered plugin and applies its remembered state.
    async fn restore(&mut self, id: &str, prior: PluginState) -> Result<(), PluginError> {
        self.load_plugin(id).await?;
        if prior == PluginState::Enabled {
            self.enable_plugin(id).await?;
        }
        Ok(())
    }

    async fn handle_removed(&mut self, path: &Path) -> Result<(), PluginError> {
        let id = self
            .registry
            .records()
            .find(|r| r.file_path == path)
            .map(|r| r.id.clone());
        let Some(id) = id else {
            return Ok(());
        };

        // Dependents first.
        for dependent in self.registry.transitive_dependents(&id) {
            if self.state_of(&dependent).is_some_and(|s| s.is_running()) {
                self.unload_plugin(&dependent).await?;
            }
            self.mark_error(&dependent, &format!("dependency '{id}' was removed"));
        }
        if self.state_of(&id).is_some_and(|s| s.is_running()) {
            self.unload_plugin(&id).await?;
        }
        self.registry.remove(&id);
        info!(plugin = %id, "plugin removed");
        Ok(())
    }
}
