//! Sandboxed filesystem access for plugins.
//!
//! Each plugin owns exactly two roots, `{base}/{id}/config` and
//! `{base}/{id}/temp`. Paths are resolved lexically; anything escaping
//! the roots is refused.

use std::path::{Component, Path, PathBuf};

use crate::errors::PluginApiError;

/// Filesystem facade for one plugin.
#[derive(Debug, Clone)]
pub struct PluginFsApi {
    config_root: PathBuf,
    temp_root: PathBuf,
}

impl PluginFsApi {
    pub fn new(base: &Path, plugin_id: &str) -> Self {
        Self {
            config_root: base.join(plugin_id).join("config"),
            temp_root: base.join(plugin_id).join("temp"),
        }
    }

    /// Creates both roots.
    pub fn ensure_roots(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_root)?;
        std::fs::create_dir_all(&self.temp_root)
    }

    /// Maps a plugin-visible path (`config/...` or `temp/...`) to a real
    /// path inside the owning root. Absolute paths and any `..`
    /// component are refused.
    fn resolve(&self, logical: &str) -> Result<PathBuf, PluginApiError> {
        let path = Path::new(logical);
        if path.is_absolute() {
            return Err(PluginApiError::AccessDenied);
        }

        let mut components = path.components();
        let root = match components.next() {
            Some(Component::Normal(first)) if first == "config" => &self.config_root,
            Some(Component::Normal(first)) if first == "temp" => &self.temp_root,
            _ => return Err(PluginApiError::AccessDenied),
        };

        let mut resolved = root.clone();
        for component in components {
            match component {
                Component::Normal(part) => resolved.push(part),
                // Any traversal attempt is refused outright, even ones
                // that would lexically stay inside.
                _ => return Err(PluginApiError::AccessDenied),
            }
        }
        Ok(resolved)
    }

    pub fn write(&self, logical: &str, contents: &[u8]) -> Result<(), PluginApiError> {
        let path = self.resolve(logical)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|_| PluginApiError::AccessDenied)?;
        }
        std::fs::write(path, contents).map_err(|_| PluginApiError::AccessDenied)
    }

    pub fn read(&self, logical: &str) -> Result<Vec<u8>, PluginApiError> {
        let path = self.resolve(logical)?;
        std::fs::read(path).map_err(|_| PluginApiError::AccessDenied)
    }

    pub fn remove(&self, logical: &str) -> Result<(), PluginApiError> {
        let path = self.resolve(logical)?;
        std::fs::remove_file(path).map_err(|_| PluginApiError::AccessDenied)
    }
}
