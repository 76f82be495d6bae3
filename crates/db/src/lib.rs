//! Logical chain records and the database interface the node is written
//! against. The concrete document store is external; the [`mem`] module
//! provides an in-memory implementation for tests and ephemeral runs.

pub mod errors;
pub mod mem;
pub mod traits;
pub mod types;

pub use errors::DbError;
pub use mem::MemDb;
pub use traits::{
    ContractDatabase, EpochDatabase, HeaderDatabase, NodeDatabase, ProgressDatabase,
    TransactionDatabase, WitnessDatabase,
};
pub use types::{
    ChecksumProof, ChecksumUpdate, ContractRecord, EpochRecord, HeaderRecord, IbdCounters,
    IbdPhase, IbdProgress, TransactionRecord, UtxoRecord, WitnessRecord,
};
