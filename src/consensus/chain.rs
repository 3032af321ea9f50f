//! Chain state
//!
//! Owns the ordered block log and the ledger derived from it.
//! Appending runs the full validation gauntlet: linkage, timestamps,
//! hash recomputation, producer election, seal verification and
//! deterministic re-execution of every transaction. Competing chains
//! offered by peers go through [`Chain::try_replace`], which applies
//! the fork-choice rule (longest finalized-safe chain, ties to the
//! lower tip hash) and refuses to discard finalized blocks or cross
//! recorded checkpoints.

use {
  super::{
    finality::{Attestation, AttestationError, FinalityEvent, FinalityTracker},
    schedule::elect_producer,
  },
  crate::{
    ledger::{Block, ErrorKind, GenesisConfig, Ledger, LedgerError},
    primitives::Address,
    staking::{BlockSeal, DoubleSignEvidence},
  },
  itertools::Itertools,
  rayon::prelude::*,
  std::collections::BTreeMap,
  thiserror::Error,
  tracing::{info, warn},
};

#[derive(Debug, Error, PartialEq)]
pub enum ChainError {
  #[error("block {actual} does not extend the chain at {expected}")]
  NotSequential { expected: u64, actual: u64 },

  #[error("block does not link to its parent hash")]
  UnknownParent,

  #[error("block timestamp is not after its parent")]
  TimestampOrder,

  #[error("block timestamp is too far in the future")]
  FutureTimestamp,

  #[error("block slot must be after the parent slot")]
  BadSlot,

  #[error("stored block hash does not recompute")]
  HashMismatch,

  #[error("block carries no producer")]
  NoProducer,

  #[error("block producer {actual} is not the elected {expected}")]
  WrongProducer { expected: Address, actual: Address },

  #[error("no electable producer for this slot")]
  NoElectableProducer,

  #[error("producer seal does not verify")]
  BadSeal,

  #[error("chain would discard a finalized block")]
  FinalizedReorg,

  #[error("chain crosses the checkpoint at height {0}")]
  CheckpointViolation(u64),

  #[error("candidate chain is empty or not sequential")]
  MalformedCandidate,

  #[error(transparent)]
  Ledger(#[from] LedgerError),
}

impl ChainError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ChainError::Ledger(inner) => inner.kind(),
      _ => ErrorKind::Consensus,
    }
  }
}

pub struct Chain {
  genesis: GenesisConfig,

  /// The full block log, genesis at index 0.
  blocks: Vec<Block>,

  /// Ledger state at the tip.
  ledger: Ledger,

  /// `(height, hash)` anchors recorded every checkpoint interval.
  checkpoints: BTreeMap<u64, String>,

  finality: FinalityTracker,

  /// Producer seals observed per height, for double-sign detection
  /// across competing blocks that never both enter the chain.
  seen_seals: BTreeMap<u64, Vec<(String, Address, String, u64)>>,
}

impl Chain {
  pub fn new(genesis: &GenesisConfig) -> Self {
    let block = genesis.genesis_block();
    let mut checkpoints = BTreeMap::new();
    checkpoints.insert(0, block.hash.clone());
    Self {
      ledger: Ledger::from_genesis(genesis),
      blocks: vec![block],
      checkpoints,
      finality: FinalityTracker::default(),
      genesis: genesis.clone(),
      seen_seals: BTreeMap::new(),
    }
  }

  /// Restores a chain from a stored block log by replaying it.
  pub fn from_blocks(
    genesis: &GenesisConfig,
    blocks: Vec<Block>,
    finality: FinalityTracker,
  ) -> Result<Self, ChainError> {
    let mut chain = Self::new(genesis);
    chain.finality = finality;
    for block in blocks.into_iter().skip(1) {
      // past blocks are exempt from the wall-clock bound
      chain.append(block, i64::MAX)?;
    }
    Ok(chain)
  }

  pub fn tip(&self) -> &Block {
    self.blocks.last().expect("chain always holds genesis")
  }

  pub fn height(&self) -> u64 {
    self.tip().index
  }

  pub fn ledger(&self) -> &Ledger {
    &self.ledger
  }

  pub fn genesis(&self) -> &GenesisConfig {
    &self.genesis
  }

  pub fn finality(&self) -> &FinalityTracker {
    &self.finality
  }

  pub fn block_at(&self, height: u64) -> Option<&Block> {
    self.blocks.get(height as usize)
  }

  /// A read-only slice for chunked backfill responses.
  pub fn blocks_from(&self, start: u64, limit: usize) -> &[Block] {
    let start = (start as usize).min(self.blocks.len());
    let end = start.saturating_add(limit).min(self.blocks.len());
    &self.blocks[start..end]
  }

  pub fn all_blocks(&self) -> &[Block] {
    &self.blocks
  }

  /// Routes an attestation into the finality tracker, weighted by
  /// the current staking state.
  pub fn record_attestation(
    &mut self,
    attestation: Attestation,
  ) -> Result<FinalityEvent, AttestationError> {
    let event = self.finality.record(attestation, &self.ledger.staking)?;
    if let FinalityEvent::Finalized { index, hash, .. } = &event {
      info!("finalized block {index} [{}]", &hash[..8.min(hash.len())]);
    }
    Ok(event)
  }

  /// Validates `block` against `parent` and the given parent-state
  /// ledger; returns the post-block ledger on success.
  fn validate_onto(
    &self,
    parent: &Block,
    ledger: &Ledger,
    block: &Block,
    now_ms: i64,
  ) -> Result<Ledger, ChainError> {
    if block.index != parent.index + 1 {
      return Err(ChainError::NotSequential {
        expected: parent.index + 1,
        actual: block.index,
      });
    }
    if block.previous_hash != parent.hash {
      return Err(ChainError::UnknownParent);
    }
    if block.timestamp <= parent.timestamp {
      return Err(ChainError::TimestampOrder);
    }
    if block.timestamp
      >= now_ms.saturating_add(self.genesis.consensus_params.clock_skew_ms)
    {
      return Err(ChainError::FutureTimestamp);
    }
    if !block.verify_hash() {
      return Err(ChainError::HashMismatch);
    }
    if block.slot <= parent.slot {
      return Err(ChainError::BadSlot);
    }

    let producer = block.producer.as_ref().ok_or(ChainError::NoProducer)?;
    let elected =
      elect_producer(&parent.hash, block.slot, ledger.staking.active_set())
        .ok_or(ChainError::NoElectableProducer)?;
    if elected.operator != *producer {
      return Err(ChainError::WrongProducer {
        expected: elected.operator.clone(),
        actual: producer.clone(),
      });
    }
    let key = elected
      .consensus_pubkey
      .ok_or(ChainError::BadSeal)?;
    if !block.verify_producer_signature(&self.genesis.chain_id, &key) {
      return Err(ChainError::BadSeal);
    }

    // cheap parallel pre-pass over wallet signatures before the
    // sequential state replay
    block
      .transactions
      .par_iter()
      .try_for_each(|tx| tx.verify_signature())
      .map_err(LedgerError::from)?;

    let mut scratch = ledger.clone();
    scratch.apply_block(block, parent.slot)?;
    Ok(scratch)
  }

  /// Appends one block to the tip.
  pub fn append(&mut self, block: Block, now_ms: i64) -> Result<(), ChainError> {
    let next = self.validate_onto(self.tip(), &self.ledger, &block, now_ms)?;

    if block.index % self.genesis.consensus_params.checkpoint_interval == 0 {
      self.checkpoints.insert(block.index, block.hash.clone());
    }
    info!("included {block}");
    self.ledger = next;
    self.blocks.push(block);
    Ok(())
  }

  /// Registers a producer seal seen anywhere (including blocks that
  /// lost the fork race) and reports double-sign evidence when the
  /// same producer sealed two hashes at one height.
  pub fn note_seal(&mut self, block: &Block) -> Option<DoubleSignEvidence> {
    let producer = block.producer.clone()?;
    if !block.verify_hash() {
      return None;
    }
    let key = self
      .ledger
      .staking
      .get(&producer)
      .and_then(|record| record.consensus_pubkey)?;
    if !block.verify_producer_signature(&self.genesis.chain_id, &key) {
      return None;
    }

    let seals = self.seen_seals.entry(block.index).or_default();
    let conflicting = seals.iter().find(|(hash, who, _, slot)| {
      *who == producer && *slot == block.slot && *hash != block.hash
    });

    if let Some((hash, _, signature, slot)) = conflicting {
      warn!("{producer} sealed two blocks at height {}", block.index);
      return Some(DoubleSignEvidence {
        producer,
        index: block.index,
        slot: *slot,
        first: BlockSeal {
          hash: hash.clone(),
          signature: signature.clone(),
        },
        second: BlockSeal {
          hash: block.hash.clone(),
          signature: block
            .producer_signature
            .clone()
            .expect("seal verified above"),
        },
        attestations: false,
      });
    }

    seals.push((
      block.hash.clone(),
      producer,
      block.producer_signature.clone()?,
      block.slot,
    ));
    None
  }

  /// Offers a competing chain suffix. Returns `Ok(true)` when the
  /// candidate won the fork choice and replaced the local suffix,
  /// `Ok(false)` when the local chain stands.
  pub fn try_replace(
    &mut self,
    candidate: Vec<Block>,
    now_ms: i64,
  ) -> Result<bool, ChainError> {
    let first = candidate.first().ok_or(ChainError::MalformedCandidate)?;
    let start = first.index;
    if start == 0 || start > self.height() + 1 {
      return Err(ChainError::MalformedCandidate);
    }
    if !candidate
      .iter()
      .tuple_windows()
      .all(|(a, b)| b.index == a.index + 1)
    {
      return Err(ChainError::MalformedCandidate);
    }

    let candidate_tip = candidate.last().expect("nonempty").index;

    // fork choice: longest chain, ties to the lower tip hash
    if candidate_tip < self.height() {
      return Ok(false);
    }
    if candidate_tip == self.height()
      && candidate.last().expect("nonempty").hash >= self.tip().hash
    {
      return Ok(false);
    }

    // never discard a finalized block or cross a checkpoint with a
    // different hash
    for replaced in start..=self.height() {
      let offered = candidate
        .get((replaced - start) as usize)
        .map(|b| b.hash.as_str());
      if let Some(final_hash) = self.finality.finalized_hash(replaced) {
        if offered != Some(final_hash) {
          return Err(ChainError::FinalizedReorg);
        }
      }
      if let Some(anchor) = self.checkpoints.get(&replaced) {
        if offered != Some(anchor.as_str()) {
          return Err(ChainError::CheckpointViolation(replaced));
        }
      }
    }

    // rebuild the ledger along the common prefix, then validate the
    // candidate suffix block by block on top of it
    let mut ledger = Ledger::from_genesis(&self.genesis);
    for pair in self.blocks[..start as usize].windows(2) {
      ledger
        .apply_block(&pair[1], pair[0].slot)
        .expect("own chain prefix replays cleanly");
    }

    let mut parent = self.blocks[start as usize - 1].clone();
    for block in &candidate {
      ledger = self.validate_onto(&parent, &ledger, block, now_ms)?;
      parent = block.clone();
    }

    info!(
      "fork choice: replacing {} block(s) from height {start} with a \
       chain of {}",
      self.height() + 1 - start,
      candidate.len()
    );

    self.blocks.truncate(start as usize);
    self.blocks.extend(candidate);
    self.ledger = ledger;

    // re-anchor checkpoints over the adopted suffix
    let interval = self.genesis.consensus_params.checkpoint_interval;
    self.checkpoints.retain(|height, _| *height < start);
    for block in &self.blocks[start as usize..] {
      if block.index % interval == 0 {
        self.checkpoints.insert(block.index, block.hash.clone());
      }
    }
    Ok(true)
  }
}
