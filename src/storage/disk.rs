//! Sled-backed storage
//!
//! Blocks live in their own tree keyed by big-endian height so that
//! range scans return them in order; everything else is a single
//! bincode value in the metadata tree.

use {
  super::{Storage, StorageError},
  crate::{
    consensus::FinalityTracker,
    ledger::{Block, Ledger, Transaction},
  },
  std::path::Path,
};

const BLOCKS_TREE: &str = "blocks";
const META_TREE: &str = "meta";

const SNAPSHOT_KEY: &str = "ledger";
const FINALITY_KEY: &str = "finality";
const MEMPOOL_KEY: &str = "mempool";
const PEERS_KEY: &str = "peers";

pub struct SledStore {
  db: sled::Db,
  blocks: sled::Tree,
  meta: sled::Tree,
}

impl SledStore {
  pub fn open(directory: impl AsRef<Path>) -> Result<Self, StorageError> {
    let db = sled::Config::new()
      .path(directory.as_ref().join("store"))
      .open()?;
    Ok(Self {
      blocks: db.open_tree(BLOCKS_TREE)?,
      meta: db.open_tree(META_TREE)?,
      db,
    })
  }

  fn put_meta<T: serde::Serialize>(
    &self,
    key: &str,
    value: &T,
  ) -> Result<(), StorageError> {
    self.meta.insert(key, bincode::serialize(value)?)?;
    self.meta.flush()?;
    Ok(())
  }

  fn get_meta<T: serde::de::DeserializeOwned>(
    &self,
    key: &str,
  ) -> Result<Option<T>, StorageError> {
    match self.meta.get(key)? {
      Some(raw) => Ok(Some(bincode::deserialize(&raw).map_err(|e| {
        StorageError::Corrupt(format!("{key}: {e}"))
      })?)),
      None => Ok(None),
    }
  }
}

impl Storage for SledStore {
  fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
    let mut blocks = Vec::new();
    for entry in self.blocks.iter() {
      let (key, value) = entry?;
      let block: Block = bincode::deserialize(&value).map_err(|e| {
        StorageError::Corrupt(format!("block {key:?}: {e}"))
      })?;
      // big-endian keys iterate in height order; verify anyway
      if block.index as usize != blocks.len() {
        return Err(StorageError::Corrupt(format!(
          "block log has a gap at height {}",
          blocks.len()
        )));
      }
      blocks.push(block);
    }
    Ok(blocks)
  }

  fn save_block(&self, block: &Block) -> Result<(), StorageError> {
    self
      .blocks
      .insert(block.index.to_be_bytes(), bincode::serialize(block)?)?;
    self.blocks.flush()?;
    Ok(())
  }

  fn truncate_blocks_from(&self, height: u64) -> Result<(), StorageError> {
    let doomed: Vec<_> = self
      .blocks
      .range(height.to_be_bytes()..)
      .keys()
      .collect::<Result<_, _>>()?;
    for key in doomed {
      self.blocks.remove(key)?;
    }
    self.blocks.flush()?;
    Ok(())
  }

  fn load_snapshot(&self) -> Result<Option<Ledger>, StorageError> {
    self.get_meta(SNAPSHOT_KEY)
  }

  fn save_snapshot(&self, ledger: &Ledger) -> Result<(), StorageError> {
    self.put_meta(SNAPSHOT_KEY, ledger)
  }

  fn load_finality(
    &self,
  ) -> Result<Option<FinalityTracker>, StorageError> {
    self.get_meta(FINALITY_KEY)
  }

  fn save_finality(
    &self,
    finality: &FinalityTracker,
  ) -> Result<(), StorageError> {
    self.put_meta(FINALITY_KEY, finality)
  }

  fn load_mempool(&self) -> Result<Vec<Transaction>, StorageError> {
    Ok(self.get_meta(MEMPOOL_KEY)?.unwrap_or_default())
  }

  fn save_mempool(&self, txs: &[Transaction]) -> Result<(), StorageError> {
    self.put_meta(MEMPOOL_KEY, &txs.to_vec())
  }

  fn load_peers(&self) -> Result<Vec<String>, StorageError> {
    Ok(self.get_meta(PEERS_KEY)?.unwrap_or_default())
  }

  fn save_peers(&self, peers: &[String]) -> Result<(), StorageError> {
    self.put_meta(PEERS_KEY, &peers.to_vec())
  }

  fn flush(&self) -> Result<(), StorageError> {
    self.db.flush()?;
    Ok(())
  }
}
