//! In-memory database used by tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use opnet_primitives::{Buf32, L1BlockCommitment};
use parking_lot::RwLock;

use crate::{
    errors::DbError,
    traits::{
        ContractDatabase, EpochDatabase, HeaderDatabase, ProgressDatabase, TransactionDatabase,
        WitnessDatabase,
    },
    types::{
        ChecksumUpdate, ContractRecord, EpochRecord, HeaderRecord, IbdProgress,
        TransactionRecord, UtxoRecord, WitnessRecord,
    },
};

/// Everything lives in maps behind `RwLock`s. Write operations bump a
/// counter so tests can assert idempotence (a completed pipeline re-run
/// must produce zero additional writes).
#[derive(Debug, Default)]
pub struct MemDb {
    headers: RwLock<BTreeMap<u64, HeaderRecord>>,
    hash_index: RwLock<HashMap<Buf32, u64>>,
    witnesses: RwLock<BTreeMap<u64, Vec<WitnessRecord>>>,
    epochs: RwLock<BTreeMap<u64, EpochRecord>>,
    progress: RwLock<Option<IbdProgress>>,
    transactions: RwLock<HashMap<Buf32, TransactionRecord>>,
    contracts: RwLock<HashMap<Buf32, ContractRecord>>,
    contract_storage: RwLock<HashMap<(Buf32, Buf32), Buf32>>,
    utxos: RwLock<Vec<UtxoRecord>>,
    write_ops: AtomicU64,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total mutating operations performed.
    pub fn write_count(&self) -> u64 {
        self.write_ops.load(Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
    }

    /// Test helper: seed a contract with optional storage slots.
    pub fn insert_contract(&self, contract: ContractRecord, slots: Vec<(Buf32, Buf32)>) {
        let address = contract.address;
        self.contracts.write().insert(address, contract);
        let mut storage = self.contract_storage.write();
        for (pointer, value) in slots {
            storage.insert((address, pointer), value);
        }
    }

    /// Test helper: seed a UTXO.
    pub fn insert_utxo(&self, utxo: UtxoRecord) {
        self.utxos.write().push(utxo);
    }
}

#[async_trait]
impl HeaderDatabase for MemDb {
    async fn header_range(&self, start: u64, end: u64) -> Result<Vec<HeaderRecord>, DbError> {
        let headers = self.headers.read();
        Ok(headers.range(start..=end).map(|(_, h)| h.clone()).collect())
    }

    async fn header_at(&self, height: u64) -> Result<Option<HeaderRecord>, DbError> {
        Ok(self.headers.read().get(&height).cloned())
    }

    async fn header_by_hash(&self, hash: Buf32) -> Result<Option<HeaderRecord>, DbError> {
        let height = match self.hash_index.read().get(&hash) {
            Some(h) => *h,
            None => return Ok(None),
        };
        Ok(self.headers.read().get(&height).cloned())
    }

    async fn put_headers(&self, new: Vec<HeaderRecord>) -> Result<(), DbError> {
        if new.is_empty() {
            return Ok(());
        }
        self.record_write();
        let mut headers = self.headers.write();
        let mut index = self.hash_index.write();
        for header in new {
            index.insert(header.hash, header.height);
            headers.insert(header.height, header);
        }
        Ok(())
    }

    async fn apply_checksum_updates(&self, updates: Vec<ChecksumUpdate>) -> Result<(), DbError> {
        if updates.is_empty() {
            return Ok(());
        }
        self.record_write();
        let mut headers = self.headers.write();
        for update in updates {
            let header = headers
                .get_mut(&update.height)
                .ok_or(DbError::MissingHeader(update.height))?;
            header.checksum_root = Some(update.checksum_root);
            header.checksum_proofs = update.checksum_proofs;
            header.prev_checksum = Some(update.prev_checksum);
            header.storage_root = Some(update.storage_root);
            header.receipt_root = Some(update.receipt_root);
        }
        Ok(())
    }

    async fn chain_tip(&self) -> Result<Option<L1BlockCommitment>, DbError> {
        Ok(self
            .headers
            .read()
            .iter()
            .next_back()
            .map(|(_, h)| h.commitment()))
    }

    async fn rewind_to(&self, height: u64) -> Result<(), DbError> {
        self.record_write();
        let mut headers = self.headers.write();
        let mut index = self.hash_index.write();
        let doomed: Vec<u64> = headers.range(height + 1..).map(|(h, _)| *h).collect();
        for h in doomed {
            if let Some(header) = headers.remove(&h) {
                index.remove(&header.hash);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WitnessDatabase for MemDb {
    async fn insert_witness(&self, witness: WitnessRecord) -> Result<bool, DbError> {
        let mut witnesses = self.witnesses.write();
        let entry = witnesses.entry(witness.block_number).or_default();
        if entry.iter().any(|w| w.identity == witness.identity) {
            return Ok(false);
        }
        self.record_write();
        entry.push(witness);
        Ok(true)
    }

    async fn witnesses_at(&self, block_number: u64) -> Result<Vec<WitnessRecord>, DbError> {
        Ok(self
            .witnesses
            .read()
            .get(&block_number)
            .cloned()
            .unwrap_or_default())
    }

    async fn trusted_identity_count(&self, block_number: u64) -> Result<usize, DbError> {
        Ok(self
            .witnesses
            .read()
            .get(&block_number)
            .map(|ws| ws.iter().filter(|w| w.trusted).count())
            .unwrap_or(0))
    }
}

#[async_trait]
impl EpochDatabase for MemDb {
    async fn put_epoch(&self, epoch: EpochRecord) -> Result<(), DbError> {
        self.record_write();
        self.epochs.write().insert(epoch.epoch_number, epoch);
        Ok(())
    }

    async fn epoch(&self, number: u64) -> Result<Option<EpochRecord>, DbError> {
        Ok(self.epochs.read().get(&number).cloned())
    }

    async fn latest_finalized_epoch(&self) -> Result<Option<EpochRecord>, DbError> {
        Ok(self
            .epochs
            .read()
            .values()
            .rev()
            .find(|e| e.finalized)
            .cloned())
    }
}

#[async_trait]
impl ProgressDatabase for MemDb {
    async fn load_progress(&self) -> Result<Option<IbdProgress>, DbError> {
        Ok(*self.progress.read())
    }

    async fn store_progress(&self, progress: IbdProgress) -> Result<(), DbError> {
        self.record_write();
        *self.progress.write() = Some(progress);
        Ok(())
    }
}

#[async_trait]
impl TransactionDatabase for MemDb {
    async fn transaction(&self, txid: Buf32) -> Result<Option<TransactionRecord>, DbError> {
        Ok(self.transactions.read().get(&txid).cloned())
    }

    async fn transactions_by_block(
        &self,
        block_height: u64,
    ) -> Result<Vec<TransactionRecord>, DbError> {
        let mut txs: Vec<TransactionRecord> = self
            .transactions
            .read()
            .values()
            .filter(|t| t.block_height == block_height)
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.index_in_block);
        Ok(txs)
    }

    async fn put_transactions(&self, txs: Vec<TransactionRecord>) -> Result<(), DbError> {
        if txs.is_empty() {
            return Ok(());
        }
        self.record_write();
        let mut map = self.transactions.write();
        for tx in txs {
            map.insert(tx.txid, tx);
        }
        Ok(())
    }
}

#[async_trait]
impl ContractDatabase for MemDb {
    async fn contract(&self, address: Buf32) -> Result<Option<ContractRecord>, DbError> {
        Ok(self.contracts.read().get(&address).cloned())
    }

    async fn contract_storage(
        &self,
        address: Buf32,
        pointer: Buf32,
    ) -> Result<Option<Buf32>, DbError> {
        Ok(self.contract_storage.read().get(&(address, pointer)).copied())
    }

    async fn utxos_by_script(&self, script_pubkey: Vec<u8>) -> Result<Vec<UtxoRecord>, DbError> {
        Ok(self
            .utxos
            .read()
            .iter()
            .filter(|u| u.script_pubkey == script_pubkey && !u.spent)
            .cloned()
            .collect())
    }
}
