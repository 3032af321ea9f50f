//! In-memory storage
//!
//! A `Storage` implementation with no disk behind it, used by tests
//! and throwaway devnet nodes. Semantics mirror the sled store:
//! blocks are keyed by height, everything else is a single slot,
//! and loading verifies the block log has no gaps.

use {
  super::{Storage, StorageError},
  crate::{
    consensus::FinalityTracker,
    ledger::{Block, Ledger, Transaction},
  },
  std::{collections::BTreeMap, sync::Mutex},
};

#[derive(Default)]
pub struct MemStore {
  blocks: Mutex<BTreeMap<u64, Block>>,
  snapshot: Mutex<Option<Ledger>>,
  finality: Mutex<Option<FinalityTracker>>,
  mempool: Mutex<Vec<Transaction>>,
  peers: Mutex<Vec<String>>,
}

impl Storage for MemStore {
  fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
    let blocks = self.blocks.lock().expect("storage lock poisoned");
    let mut out = Vec::with_capacity(blocks.len());
    for block in blocks.values() {
      if block.index as usize != out.len() {
        return Err(StorageError::Corrupt(format!(
          "block log has a gap at height {}",
          out.len()
        )));
      }
      out.push(block.clone());
    }
    Ok(out)
  }

  fn save_block(&self, block: &Block) -> Result<(), StorageError> {
    self
      .blocks
      .lock()
      .expect("storage lock poisoned")
      .insert(block.index, block.clone());
    Ok(())
  }

  fn truncate_blocks_from(&self, height: u64) -> Result<(), StorageError> {
    self
      .blocks
      .lock()
      .expect("storage lock poisoned")
      .retain(|index, _| *index < height);
    Ok(())
  }

  fn load_snapshot(&self) -> Result<Option<Ledger>, StorageError> {
    Ok(self.snapshot.lock().expect("storage lock poisoned").clone())
  }

  fn save_snapshot(&self, ledger: &Ledger) -> Result<(), StorageError> {
    *self.snapshot.lock().expect("storage lock poisoned") =
      Some(ledger.clone());
    Ok(())
  }

  fn load_finality(
    &self,
  ) -> Result<Option<FinalityTracker>, StorageError> {
    Ok(self.finality.lock().expect("storage lock poisoned").clone())
  }

  fn save_finality(
    &self,
    finality: &FinalityTracker,
  ) -> Result<(), StorageError> {
    *self.finality.lock().expect("storage lock poisoned") =
      Some(finality.clone());
    Ok(())
  }

  fn load_mempool(&self) -> Result<Vec<Transaction>, StorageError> {
    Ok(self.mempool.lock().expect("storage lock poisoned").clone())
  }

  fn save_mempool(&self, txs: &[Transaction]) -> Result<(), StorageError> {
    *self.mempool.lock().expect("storage lock poisoned") = txs.to_vec();
    Ok(())
  }

  fn load_peers(&self) -> Result<Vec<String>, StorageError> {
    Ok(self.peers.lock().expect("storage lock poisoned").clone())
  }

  fn save_peers(&self, peers: &[String]) -> Result<(), StorageError> {
    *self.peers.lock().expect("storage lock poisoned") = peers.to_vec();
    Ok(())
  }

  fn flush(&self) -> Result<(), StorageError> {
    Ok(())
  }
}
