//! TOML configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use opnet_primitives::{NetworkId, Params};

use crate::args::Args;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct ClientSection {
    pub(crate) rpc_host: String,
    pub(crate) rpc_port: u16,
    pub(crate) ws_host: String,
    pub(crate) ws_port: u16,
    pub(crate) p2p_host: String,
    pub(crate) p2p_port: u16,
    /// Static peer addresses to dial at startup.
    pub(crate) bootstrap_peers: Vec<String>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            rpc_host: "127.0.0.1".into(),
            rpc_port: 9001,
            ws_host: "127.0.0.1".into(),
            ws_port: 9002,
            p2p_host: "0.0.0.0".into(),
            p2p_port: 9003,
            bootstrap_peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct SyncSection {
    pub(crate) worker_count: usize,
    pub(crate) batch_size: u64,
    pub(crate) checkpoint_interval_blocks: u64,
    pub(crate) checkpoint_interval_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 250,
            checkpoint_interval_blocks: 1000,
            checkpoint_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct PluginsSection {
    pub(crate) dir: PathBuf,
    pub(crate) reindex_from_block: Option<u64>,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("plugins"),
            reindex_from_block: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct ParamsSection {
    pub(crate) network: NetworkId,
    pub(crate) chain_id: u64,
    pub(crate) blocks_per_epoch: u64,
    pub(crate) min_witnesses: usize,
    pub(crate) min_trusted_keys: usize,
    pub(crate) max_keys_per_entity: usize,
    pub(crate) min_entities: usize,
    pub(crate) authority_version: u16,
}

impl Default for ParamsSection {
    fn default() -> Self {
        Self {
            network: NetworkId::Regtest,
            chain_id: 0,
            blocks_per_epoch: opnet_primitives::DEFAULT_BLOCKS_PER_EPOCH,
            min_witnesses: opnet_primitives::DEFAULT_MIN_WITNESSES,
            min_trusted_keys: 3,
            max_keys_per_entity: 2,
            min_entities: 2,
            authority_version: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ClientConfig {
    pub(crate) client: ClientSection,
    pub(crate) sync: SyncSection,
    pub(crate) plugins: PluginsSection,
    pub(crate) params: ParamsSection,
}

impl ClientConfig {
    pub(crate) fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.sync.worker_count == 0 {
            self.sync.worker_count = 1;
        }
        if self.sync.batch_size == 0 {
            self.sync.batch_size = 1;
        }
    }

    pub(crate) fn apply_overrides(&mut self, args: &Args) {
        if let Some(port) = args.rpc_port {
            self.client.rpc_port = port;
        }
        if let Some(port) = args.ws_port {
            self.client.ws_port = port;
        }
        if let Some(port) = args.p2p_port {
            self.client.p2p_port = port;
        }
        if args.reindex_from_block.is_some() {
            self.plugins.reindex_from_block = args.reindex_from_block;
        }
    }

    pub(crate) fn make_params(&self) -> Params {
        Params::new(
            self.params.network,
            self.params.chain_id,
            self.params.blocks_per_epoch,
            self.params.min_witnesses,
            self.params.min_trusted_keys,
            self.params.max_keys_per_entity,
            self.params.min_entities,
            self.params.authority_version,
        )
    }
}
