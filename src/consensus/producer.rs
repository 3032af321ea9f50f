//! Block production
//!
//! When the local validator wins a slot it drains the mempool,
//! decrypts whatever private submissions became eligible, filters
//! the candidates against a scratch ledger so the block can never
//! fail its own validation, and seals the result with the consensus
//! key.

use {
  super::chain::Chain,
  crate::{
    ledger::{Block, Transaction, TxData, TxTarget, TxType},
    mempool::{EncryptedPool, Mempool},
    primitives::{Address, Amount, Keypair},
    staking::DoubleSignEvidence,
  },
  tracing::{debug, info},
};

pub struct BlockProducer {
  keypair: Keypair,
  chain_id: String,

  /// Double-sign evidence waiting to be included in the next block
  /// this node produces.
  evidence: Vec<DoubleSignEvidence>,
}

impl BlockProducer {
  pub fn new(keypair: Keypair, chain_id: String) -> Self {
    Self {
      keypair,
      chain_id,
      evidence: Vec::new(),
    }
  }

  pub fn consensus_key(&self) -> &Keypair {
    &self.keypair
  }

  /// Queues evidence observed by this node for inclusion.
  pub fn queue_evidence(&mut self, evidence: DoubleSignEvidence) {
    if !self.evidence.iter().any(|e| *e == evidence) {
      self.evidence.push(evidence);
    }
  }

  /// Assembles, executes and seals a block for `slot` on the
  /// current tip. Empty blocks are produced too: a regular block
  /// cadence is what drives epoch boundaries and keeps honest
  /// validators clear of the liveness counter.
  #[allow(clippy::too_many_arguments)]
  pub fn produce(
    &mut self,
    chain: &Chain,
    mempool: &mut Mempool,
    encrypted: &mut EncryptedPool,
    operator: &Address,
    slot: u64,
    now_ms: i64,
  ) -> Block {
    let tip = chain.tip();
    let next_index = tip.index + 1;
    // the block timestamp must advance past the parent even under
    // clock skew between producers
    let timestamp = now_ms.max(tip.timestamp + 1);

    // private submissions that became eligible go through the
    // normal public admission first
    let decrypted = encrypted.drain_eligible(next_index, |height| {
      chain.block_at(height).map(|b| b.hash.clone())
    });
    for tx in decrypted {
      if let Err(e) = mempool.add(tx, chain.ledger(), now_ms) {
        debug!("decrypted private submission not admitted: {e}");
      }
    }

    // run the boundary effects (epoch, missed slots) on a scratch
    // ledger so candidates are filtered against the exact state
    // they will execute in
    let mut scratch = chain.ledger().clone();
    let boundary_probe = Block::assemble(
      next_index,
      timestamp,
      tip.hash.clone(),
      vec![],
      operator.clone(),
      slot,
    );
    scratch
      .apply_block(&boundary_probe, tip.slot)
      .expect("empty block on own tip always applies");

    let mut transactions = Vec::new();

    // evidence first: it is protocol work, not fee competition
    self.evidence.retain(|evidence| {
      let offender = &evidence.producer;
      let jailed = scratch
        .staking
        .get(offender)
        .map(|record| record.jailed)
        .unwrap_or(true);
      if jailed {
        return false; // already punished or gone
      }
      let tx = Transaction::system(
        TxType::Transfer,
        TxTarget::Account(offender.clone()),
        Amount::ZERO,
        timestamp,
        &self.chain_id,
        Some(TxData::Evidence(evidence.clone())),
      );
      match scratch.apply_transaction(&tx, Some(operator), next_index) {
        Ok(()) => {
          transactions.push(tx);
          false
        }
        Err(e) => {
          debug!("queued evidence does not apply: {e}");
          false
        }
      }
    });

    let limit = chain.genesis().consensus_params.max_tx_per_block;
    for tx in mempool.select(chain.ledger(), limit) {
      if transactions.len() >= limit {
        break;
      }
      match scratch.apply_transaction(&tx, Some(operator), next_index) {
        Ok(()) => transactions.push(tx),
        Err(e) => debug!("selected transaction does not apply: {e}"),
      }
    }

    let mut block = Block::assemble(
      next_index,
      timestamp,
      tip.hash.clone(),
      transactions,
      operator.clone(),
      slot,
    );
    block.seal(&self.chain_id, &self.keypair);
    info!("produced {block}");
    block
  }
}
