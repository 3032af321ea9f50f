//! Persistence
//!
//! Everything the node must not lose across restarts goes through
//! the [`Storage`] trait: the block log, the ledger snapshot (which
//! carries staking, pool and burn state), finality, the mempool and
//! the peer address book. The format behind the trait is opaque to
//! the rest of the node.

mod disk;
mod keyfiles;
mod mem;

pub use {
  disk::SledStore,
  keyfiles::{load_or_create_identity, load_or_create_validator_key},
  mem::MemStore,
};

use {
  crate::{
    consensus::FinalityTracker,
    ledger::{Block, Ledger, Transaction},
  },
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("serialization error: {0}")]
  Serialization(#[from] bincode::Error),

  #[error("storage engine error: {0}")]
  StorageEngine(#[from] sled::Error),

  #[error("system io error: {0}")]
  SystemIO(#[from] std::io::Error),

  #[error("corrupt on-disk state: {0}")]
  Corrupt(String),
}

/// Durable node state. Save operations are atomic at the level of
/// one call: a crash mid-save leaves the previous value intact.
pub trait Storage: Send + Sync {
  /// The stored block log in height order, starting at genesis.
  fn load_blocks(&self) -> Result<Vec<Block>, StorageError>;

  fn save_block(&self, block: &Block) -> Result<(), StorageError>;

  /// Discards stored blocks at and above `height` after a reorg.
  fn truncate_blocks_from(&self, height: u64) -> Result<(), StorageError>;

  fn load_snapshot(&self) -> Result<Option<Ledger>, StorageError>;
  fn save_snapshot(&self, ledger: &Ledger) -> Result<(), StorageError>;

  fn load_finality(&self)
    -> Result<Option<FinalityTracker>, StorageError>;
  fn save_finality(
    &self,
    finality: &FinalityTracker,
  ) -> Result<(), StorageError>;

  fn load_mempool(&self) -> Result<Vec<Transaction>, StorageError>;
  fn save_mempool(&self, txs: &[Transaction]) -> Result<(), StorageError>;

  fn load_peers(&self) -> Result<Vec<String>, StorageError>;
  fn save_peers(&self, peers: &[String]) -> Result<(), StorageError>;

  /// Blocks until everything saved so far is on disk.
  fn flush(&self) -> Result<(), StorageError>;
}
