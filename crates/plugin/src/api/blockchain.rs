//! Read-only chain access for plugins, gated per permission area.

use std::sync::Arc;

use opnet_db::{
    ContractDatabase, ContractRecord, HeaderDatabase, HeaderRecord, TransactionDatabase,
    TransactionRecord, UtxoRecord,
};
use opnet_primitives::{Buf32, L1BlockCommitment};
use opnet_status::StatusChannel;

use crate::{errors::PluginApiError, metadata::BlockchainPermissions};

/// Hard cap on `get_block_range`.
pub const MAX_BLOCK_RANGE: u64 = 100;

/// One instance per plugin, carrying that plugin's permission bits.
pub struct PluginBlockchainApi<D> {
    db: Arc<D>,
    status: StatusChannel,
    permissions: BlockchainPermissions,
}

impl<D> std::fmt::Debug for PluginBlockchainApi<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginBlockchainApi")
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

impl<D> PluginBlockchainApi<D>
where
    D: HeaderDatabase + TransactionDatabase + ContractDatabase,
{
    pub fn new(db: Arc<D>, status: StatusChannel, permissions: BlockchainPermissions) -> Self {
        Self {
            db,
            status,
            permissions,
        }
    }

    fn require_blocks(&self) -> Result<(), PluginApiError> {
        self.permissions
            .read_blocks
            .then_some(())
            .ok_or(PluginApiError::BlockchainNotPermitted { area: "BLOCKS" })
    }

    fn require_transactions(&self) -> Result<(), PluginApiError> {
        self.permissions
            .read_transactions
            .then_some(())
            .ok_or(PluginApiError::BlockchainNotPermitted {
                area: "TRANSACTIONS",
            })
    }

    fn require_contracts(&self) -> Result<(), PluginApiError> {
        self.permissions
            .read_contracts
            .then_some(())
            .ok_or(PluginApiError::BlockchainNotPermitted { area: "CONTRACTS" })
    }

    fn require_utxos(&self) -> Result<(), PluginApiError> {
        self.permissions
            .read_utxos
            .then_some(())
            .ok_or(PluginApiError::BlockchainNotPermitted { area: "UTXOS" })
    }

    fn db_err(e: opnet_db::DbError) -> PluginApiError {
        PluginApiError::Db(e.to_string())
    }

    pub async fn get_block(&self, height: u64) -> Result<Option<HeaderRecord>, PluginApiError> {
        self.require_blocks()?;
        self.db.header_at(height).await.map_err(Self::db_err)
    }

    pub async fn get_block_by_hash(
        &self,
        hash: Buf32,
    ) -> Result<Option<HeaderRecord>, PluginApiError> {
        self.require_blocks()?;
        self.db.header_by_hash(hash).await.map_err(Self::db_err)
    }

    pub async fn get_block_with_transactions(
        &self,
        height: u64,
    ) -> Result<Option<(HeaderRecord, Vec<TransactionRecord>)>, PluginApiError> {
        self.require_blocks()?;
        self.require_transactions()?;
        let Some(header) = self.db.header_at(height).await.map_err(Self::db_err)? else {
            return Ok(None);
        };
        let txs = self
            .db
            .transactions_by_block(height)
            .await
            .map_err(Self::db_err)?;
        Ok(Some((header, txs)))
    }

    pub async fn get_transaction(
        &self,
        txid: Buf32,
    ) -> Result<Option<TransactionRecord>, PluginApiError> {
        self.require_transactions()?;
        self.db.transaction(txid).await.map_err(Self::db_err)
    }

    pub async fn get_transactions_by_block(
        &self,
        height: u64,
    ) -> Result<Vec<TransactionRecord>, PluginApiError> {
        self.require_transactions()?;
        self.db
            .transactions_by_block(height)
            .await
            .map_err(Self::db_err)
    }

    pub async fn get_contract(
        &self,
        address: Buf32,
    ) -> Result<Option<ContractRecord>, PluginApiError> {
        self.require_contracts()?;
        self.db.contract(address).await.map_err(Self::db_err)
    }

    pub async fn get_contract_storage(
        &self,
        address: Buf32,
        pointer: Buf32,
    ) -> Result<Option<Buf32>, PluginApiError> {
        self.require_contracts()?;
        self.db
            .contract_storage(address, pointer)
            .await
            .map_err(Self::db_err)
    }

    /// Declared but not implemented; callers get the explicit signal, not
    /// a silently empty list.
    pub async fn get_contract_events(
        &self,
        _address: Buf32,
    ) -> Result<Vec<Vec<u8>>, PluginApiError> {
        self.require_contracts()?;
        Err(PluginApiError::NotImplemented("getContractEvents"))
    }

    pub async fn get_utxos(
        &self,
        script_pubkey: Vec<u8>,
    ) -> Result<Vec<UtxoRecord>, PluginApiError> {
        self.require_utxos()?;
        self.db
            .utxos_by_script(script_pubkey)
            .await
            .map_err(Self::db_err)
    }

    pub fn get_chain_tip(&self) -> Result<Option<L1BlockCommitment>, PluginApiError> {
        self.require_blocks()?;
        Ok(self.status.chain_status().tip)
    }

    /// Headers for `[from, to]`, capped at [`MAX_BLOCK_RANGE`] entries.
    pub async fn get_block_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<HeaderRecord>, PluginApiError> {
        self.require_blocks()?;
        let capped_to = to.min(from.saturating_add(MAX_BLOCK_RANGE - 1));
        self.db
            .header_range(from, capped_to)
            .await
            .map_err(Self::db_err)
    }

    pub async fn has_block(&self, height: u64) -> Result<bool, PluginApiError> {
        self.require_blocks()?;
        Ok(self
            .db
            .header_at(height)
            .await
            .map_err(Self::db_err)?
            .is_some())
    }
}
