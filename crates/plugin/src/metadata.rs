//! Plugin metadata: the JSON document embedded in the container.

use std::collections::HashMap;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::errors::PluginError;

/// Longest allowed plugin name.
pub const MAX_NAME_LEN: usize = 64;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Standalone,
    Library,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockchainPermissions {
    pub read_blocks: bool,
    pub read_transactions: bool,
    pub read_contracts: bool,
    pub read_utxos: bool,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingPermissions {
    /// CPU share cap, percent of one core.
    pub cpu_limit_percent: u32,
    pub memory_limit_mb: u32,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginPermissions {
    pub blockchain: BlockchainPermissions,
    /// Hook names the plugin subscribes to.
    pub hooks: Vec<String>,
    /// Database collections the plugin may touch (un-namespaced names).
    pub collections: Vec<String>,
    pub filesystem: bool,
    pub threading: ThreadingPermissions,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginLifecycle {
    /// Lower loads earlier among otherwise-unordered plugins.
    #[serde(rename = "loadPriority")]
    pub load_priority: i32,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PluginAuthor {
    pub name: String,
}

/// The metadata document. Field names mirror the on-disk JSON.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: Version,
    /// Node versions the plugin supports.
    #[serde(rename = "opnetVersion")]
    pub opnet_version: VersionReq,
    pub main: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// `sha256:<hex>` over the plugin bytecode.
    pub checksum: String,
    pub author: PluginAuthor,
    #[serde(rename = "pluginType")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub permissions: PluginPermissions,
    #[serde(default)]
    pub lifecycle: Option<PluginLifecycle>,
    /// Dependency name to required version range.
    #[serde(default)]
    pub dependencies: Option<HashMap<String, VersionReq>>,
}

impl PluginMetadata {
    /// Parses and validates a metadata document.
    pub fn parse(json: &str) -> Result<Self, PluginError> {
        let metadata: Self = serde_json::from_str(json)
            .map_err(|e| PluginError::InvalidMetadata(e.to_string()))?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(PluginError::InvalidMetadata(format!(
                "name must be 1..={MAX_NAME_LEN} characters"
            )));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(PluginError::InvalidMetadata(
                "name must match ^[a-z0-9-]+$".into(),
            ));
        }
        if !self.checksum.starts_with("sha256:") {
            return Err(PluginError::InvalidMetadata(
                "checksum must start with 'sha256:'".into(),
            ));
        }
        if self.author.name.trim().is_empty() {
            return Err(PluginError::InvalidMetadata("author name is empty".into()));
        }
        Ok(())
    }

    pub fn load_priority(&self) -> i32 {
        self.lifecycle.as_ref().map(|l| l.load_priority).unwrap_or(0)
    }

    pub fn dependencies(&self) -> impl Iterator<Item = (&String, &VersionReq)> {
        self.dependencies.iter().flatten()
    }

    /// Whether the plugin declared a hook subscription.
    pub fn has_hook(&self, hook: &str) -> bool {
        self.permissions.hooks.iter().any(|h| h == hook)
    }
}


#[cfg(test)]
mod tests {
    use super::{test_utils::make_metadata, *};

    #[test]
    fn test_parse_valid_document() {
        let json = r#"{
            "name": "my-indexer",
            "version": "1.2.3",
            "opnetVersion": ">=0.1.0",
            "main": "main.wasm",
            "target": "wasm32",
            "type": "indexer",
            "checksum": "sha256:abcd",
            "author": {"name": "dev"},
            "pluginType": "standalone",
            "permissions": {"hooks": ["BLOCK_CHANGE"], "filesystem": true},
            "lifecycle": {"loadPriority": -5},
            "dependencies": {"base-lib": "^1.0"}
        }"#;

        let metadata = PluginMetadata::parse(json).unwrap();
        assert_eq!(metadata.name, "my-indexer");
        assert_eq!(metadata.load_priority(), -5);
        assert!(metadata.has_hook("BLOCK_CHANGE"));
        assert!(!metadata.has_hook("REORG"));
        assert_eq!(metadata.dependencies().count(), 1);
    }

    #[test]
    fn test_name_shape_enforced() {
        for bad in ["", "Has-Upper", "under_score", "spaced name"] {
            let mut metadata = make_metadata("ok", "1.0.0");
            metadata.name = bad.to_string();
            assert!(metadata.validate().is_err(), "accepted {bad:?}");
        }

        let long = "x".repeat(65);
        let mut metadata = make_metadata("ok", "1.0.0");
        metadata.name = long;
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_checksum_prefix_enforced() {
        let mut metadata = make_metadata("ok", "1.0.0");
        metadata.checksum = "md5:123".into();
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_author_name_required() {
        let mut metadata = make_metadata("ok", "1.0.0");
        metadata.author.name = "  ".into();
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_bad_semver_rejected() {
        let json = r#"{
            "name": "p", "version": "not-a-version", "opnetVersion": ">=0.1.0",
            "main": "m", "target": "t", "type": "indexer",
            "checksum": "sha256:00", "author": {"name": "a"},
            "pluginType": "standalone"
        }"#;
        assert!(matches!(
            PluginMetadata::parse(json),
            Err(PluginError::InvalidMetadata(_))
        ));
    }
}
