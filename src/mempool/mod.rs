//! Transaction pool
//!
//! Two disjoint pools feed block production: the public pool holds
//! plaintext transactions in arrival order, the private pool holds
//! AES-GCM ciphertexts that only become selectable one block after
//! their submission height. Admission runs the checks in the fixed
//! order documented on [`Mempool::add`]; selection is deterministic
//! so that a given pool and ledger always produce the same block
//! contents.

mod encrypted;

pub use encrypted::{EncryptedPool, EncryptedTransaction};

use {
  crate::{
    ledger::{ErrorKind, Ledger, Transaction, TransactionError, TxType},
    primitives::{Address, Amount},
  },
  indexmap::IndexMap,
  std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
  thiserror::Error,
  tracing::debug,
  uuid::Uuid,
};

#[derive(Debug, Error, PartialEq)]
pub enum MempoolError {
  #[error("transaction is for another chain")]
  WrongChain,

  #[error(transparent)]
  Signature(#[from] TransactionError),

  #[error("system transactions are not accepted from outside")]
  SystemInjection,

  #[error("bad nonce: expected {expected}, got {actual}")]
  BadNonce { expected: u64, actual: u64 },

  #[error("fee below the minimum of {0}")]
  FeeTooLow(Amount),

  #[error("amount below the minimum of {0}")]
  AmountTooSmall(Amount),

  #[error("transaction id was already seen")]
  DuplicateId,

  #[error("nonce was already used by this sender")]
  NonceReused,

  #[error("sender is blacklisted")]
  Blacklisted,

  #[error("sender exceeded the transfer rate limit")]
  RateLimited,

  #[error("balance cannot cover this transaction and the pending ones")]
  InsufficientFunds,

  #[error("pool is full and the fee does not beat the cheapest entry")]
  Full,
}

impl MempoolError {
  pub fn kind(&self) -> ErrorKind {
    use MempoolError::*;
    match self {
      WrongChain | Signature(_) | SystemInjection | BadNonce { .. }
      | DuplicateId | NonceReused => ErrorKind::Validation,
      FeeTooLow(_) | AmountTooSmall(_) | Blacklisted | RateLimited | Full => {
        ErrorKind::Policy
      }
      InsufficientFunds => ErrorKind::Balance,
    }
  }
}

/// Node-local admission policy. Not consensus critical: blocks are
/// validated by the ledger, not by these thresholds.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
  pub max_pending: usize,
  pub min_fee: Amount,
  pub min_amount: Amount,

  /// Transfers accepted per sender within one rate window.
  pub max_per_window: usize,
  pub rate_window_ms: i64,

  /// How long replay-protection records are retained.
  pub seen_retention_ms: i64,
}

impl Default for MempoolConfig {
  fn default() -> Self {
    Self {
      max_pending: 5000,
      min_fee: Amount::from_units(10_000),    // 0.01
      min_amount: Amount::from_units(1),
      max_per_window: 30,
      rate_window_ms: 60_000,
      seen_retention_ms: 3_600_000,
    }
  }
}

/// The public transaction pool.
pub struct Mempool {
  config: MempoolConfig,

  /// Insertion-ordered pending transactions.
  pending: IndexMap<Uuid, Transaction>,

  /// Replay protection for ids and per-sender nonces that already
  /// passed through this pool. Aged out by [`prune`].
  seen_ids: HashSet<Uuid>,
  seen_nonces: BTreeMap<Address, BTreeSet<u64>>,
  seen_log: VecDeque<(i64, Uuid, Address, u64)>,

  /// Arrival timestamps per sender for rate limiting.
  arrivals: BTreeMap<Address, VecDeque<i64>>,

  blacklist: BTreeSet<Address>,
}

impl Mempool {
  pub fn new(config: MempoolConfig) -> Self {
    Self {
      config,
      pending: IndexMap::new(),
      seen_ids: HashSet::new(),
      seen_nonces: BTreeMap::new(),
      seen_log: VecDeque::new(),
      arrivals: BTreeMap::new(),
      blacklist: BTreeSet::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn contains(&self, id: &Uuid) -> bool {
    self.pending.contains_key(id)
  }

  pub fn pending(&self) -> impl Iterator<Item = &Transaction> {
    self.pending.values()
  }

  pub fn blacklist(&mut self, address: Address) {
    self.blacklist.insert(address);
  }

  /// Number of queued transactions from one sender.
  fn pending_count(&self, sender: &Address) -> u64 {
    self
      .pending
      .values()
      .filter(|tx| tx.from.as_ref() == Some(sender))
      .count() as u64
  }

  /// Native tokens the sender's queued transactions would spend.
  fn pending_outgoing(&self, sender: &Address) -> Amount {
    self
      .pending
      .values()
      .filter(|tx| tx.from.as_ref() == Some(sender))
      .map(spend_of)
      .sum()
  }

  /// Admits a transaction. Checks run in this order: well-formed
  /// system guard, chain id, signature and sender derivation,
  /// contiguous nonce (including queued transactions), minimum fee
  /// and amount, replay protection, blacklist, rate limit, balance
  /// coverage including everything already queued.
  pub fn add(
    &mut self,
    tx: Transaction,
    ledger: &Ledger,
    now_ms: i64,
  ) -> Result<(), MempoolError> {
    if tx.is_system() {
      return Err(MempoolError::SystemInjection);
    }
    if tx.chain_id != ledger.chain_id {
      return Err(MempoolError::WrongChain);
    }
    tx.verify_signature()?;
    let sender = tx.from.clone().expect("system guard above");

    let expected = ledger.nonce(&sender) + 1 + self.pending_count(&sender);
    if tx.nonce != expected {
      return Err(MempoolError::BadNonce {
        expected,
        actual: tx.nonce,
      });
    }

    if tx.fee < self.config.min_fee {
      return Err(MempoolError::FeeTooLow(self.config.min_fee));
    }
    if tx.amount < self.config.min_amount {
      return Err(MempoolError::AmountTooSmall(self.config.min_amount));
    }

    if self.pending.contains_key(&tx.id) || self.seen_ids.contains(&tx.id) {
      return Err(MempoolError::DuplicateId);
    }
    if self
      .seen_nonces
      .get(&sender)
      .map(|used| used.contains(&tx.nonce))
      .unwrap_or(false)
    {
      return Err(MempoolError::NonceReused);
    }

    if self.blacklist.contains(&sender) {
      return Err(MempoolError::Blacklisted);
    }

    let window_start = now_ms - self.config.rate_window_ms;
    let arrivals = self.arrivals.entry(sender.clone()).or_default();
    while arrivals.front().map(|t| *t < window_start).unwrap_or(false) {
      arrivals.pop_front();
    }
    if arrivals.len() >= self.config.max_per_window {
      return Err(MempoolError::RateLimited);
    }

    let needed = spend_of(&tx)
      .checked_add(self.pending_outgoing(&sender))
      .ok_or(MempoolError::InsufficientFunds)?;
    if ledger.balance(&sender) < needed {
      return Err(MempoolError::InsufficientFunds);
    }

    if self.pending.len() >= self.config.max_pending {
      self.evict_for(&tx)?;
    }

    self.arrivals.get_mut(&sender).expect("created above").push_back(now_ms);
    debug!("admitted {tx} from {sender}");
    self.pending.insert(tx.id, tx);
    Ok(())
  }

  /// Makes room by evicting the lowest-fee entry, ties broken by
  /// earliest arrival. Fails when the incoming transaction itself
  /// is the cheapest.
  fn evict_for(&mut self, incoming: &Transaction) -> Result<(), MempoolError> {
    let cheapest = self
      .pending
      .values()
      .enumerate()
      .min_by(|(ai, a), (bi, b)| a.fee.cmp(&b.fee).then(ai.cmp(bi)))
      .map(|(_, tx)| (tx.id, tx.fee));

    match cheapest {
      Some((id, fee)) if fee < incoming.fee => {
        debug!("evicting {id} (fee {fee}) for a better-paying transaction");
        self.pending.shift_remove(&id);
        Ok(())
      }
      _ => Err(MempoolError::Full),
    }
  }

  /// Deterministic block selection: `(fee desc, nonce asc, id asc)`
  /// while never letting a transaction jump ahead of its sender's
  /// lower nonces.
  pub fn select(&self, ledger: &Ledger, limit: usize) -> Vec<Transaction> {
    let mut candidates: Vec<&Transaction> = self.pending.values().collect();
    candidates.sort_by(|a, b| {
      b.fee
        .cmp(&a.fee)
        .then(a.nonce.cmp(&b.nonce))
        .then(a.id.cmp(&b.id))
    });

    let mut selected: Vec<Transaction> = Vec::new();
    let mut next_nonce: BTreeMap<Address, u64> = BTreeMap::new();

    // a pass may unlock nonces for later entries in sort order, so
    // iterate to a fixpoint
    loop {
      let before = selected.len();
      for tx in &candidates {
        if selected.len() >= limit {
          return selected;
        }
        let sender = tx.from.as_ref().expect("pool holds no system txs");
        let expected = *next_nonce
          .entry(sender.clone())
          .or_insert_with(|| ledger.nonce(sender) + 1);
        if tx.nonce == expected && !selected.iter().any(|s| s.id == tx.id) {
          selected.push((*tx).clone());
          next_nonce.insert(sender.clone(), expected + 1);
        }
      }
      if selected.len() == before {
        return selected;
      }
    }
  }

  /// Called after a block was applied: included transactions leave
  /// the pool and enter the replay-protection sets, and entries
  /// whose nonce was consumed by someone else's block are dropped.
  pub fn on_block_applied(
    &mut self,
    block_txs: &[Transaction],
    ledger: &Ledger,
    now_ms: i64,
  ) {
    for tx in block_txs {
      self.pending.shift_remove(&tx.id);
      if let Some(sender) = &tx.from {
        self.seen_ids.insert(tx.id);
        self
          .seen_nonces
          .entry(sender.clone())
          .or_default()
          .insert(tx.nonce);
        self
          .seen_log
          .push_back((now_ms, tx.id, sender.clone(), tx.nonce));
      }
    }

    // queued nonces that fell behind the ledger can never apply
    self.pending.retain(|_, tx| match &tx.from {
      Some(sender) => tx.nonce > ledger.nonce(sender),
      None => false,
    });
  }

  /// Ages out replay-protection and rate-limit records.
  pub fn prune(&mut self, now_ms: i64) {
    let horizon = now_ms - self.config.seen_retention_ms;
    while self
      .seen_log
      .front()
      .map(|(t, ..)| *t < horizon)
      .unwrap_or(false)
    {
      let (_, id, sender, nonce) =
        self.seen_log.pop_front().expect("checked above");
      self.seen_ids.remove(&id);
      if let Some(used) = self.seen_nonces.get_mut(&sender) {
        used.remove(&nonce);
        if used.is_empty() {
          self.seen_nonces.remove(&sender);
        }
      }
    }

    let window_start = now_ms - self.config.rate_window_ms;
    for arrivals in self.arrivals.values_mut() {
      while arrivals.front().map(|t| *t < window_start).unwrap_or(false) {
        arrivals.pop_front();
      }
    }
    self.arrivals.retain(|_, arrivals| !arrivals.is_empty());
  }
}

/// Native tokens a transaction removes from its sender's spendable
/// balance: amount plus fee for outgoing value, fee alone for
/// operations that move already-bonded stake.
fn spend_of(tx: &Transaction) -> Amount {
  match tx.tx_type {
    TxType::Transfer | TxType::Stake | TxType::Delegate | TxType::PoolOp => {
      tx.amount.checked_add(tx.fee).unwrap_or(Amount::from_units(u64::MAX))
    }
    TxType::Unstake | TxType::Undelegate => tx.fee,
  }
}

#[cfg(test)]
mod test {
  use {
    super::{Mempool, MempoolConfig, MempoolError},
    crate::{
      ledger::{GenesisConfig, Ledger, Transaction, TxTarget, TxType},
      primitives::{Amount, WalletKeypair},
    },
    chrono::TimeZone,
  };

  const CHAIN: &str = "lvenc-testnet-1";
  const NOW: i64 = 1_767_225_700_000;

  fn funded_ledger(wallet: &WalletKeypair) -> Ledger {
    let genesis = GenesisConfig::new(
      CHAIN,
      chrono::Utc.timestamp_millis_opt(1_767_225_600_000).unwrap(),
      "tLVE",
      wallet.address("tLVE"),
      Amount::from_whole(1_000_000),
    );
    Ledger::from_genesis(&genesis)
  }

  fn transfer(
    wallet: &WalletKeypair,
    nonce: u64,
    amount: u64,
    fee_units: u64,
  ) -> Transaction {
    let mut tx = Transaction::build(
      TxType::Transfer,
      wallet.address("tLVE"),
      TxTarget::Account(WalletKeypair::generate().address("tLVE")),
      Amount::from_whole(amount),
      Amount::from_units(fee_units),
      NOW,
      nonce,
      CHAIN,
      None,
    );
    tx.sign(wallet);
    tx
  }

  #[test]
  fn admission_happy_path_and_nonce_chain() {
    let wallet = WalletKeypair::generate();
    let ledger = funded_ledger(&wallet);
    let mut pool = Mempool::new(MempoolConfig::default());

    pool.add(transfer(&wallet, 1, 10, 100_000), &ledger, NOW).unwrap();
    pool.add(transfer(&wallet, 2, 10, 100_000), &ledger, NOW).unwrap();

    // a gap is rejected
    assert_eq!(
      pool.add(transfer(&wallet, 5, 10, 100_000), &ledger, NOW),
      Err(MempoolError::BadNonce {
        expected: 3,
        actual: 5
      })
    );
    assert_eq!(pool.len(), 2);
  }

  #[test]
  fn policy_checks() {
    let wallet = WalletKeypair::generate();
    let ledger = funded_ledger(&wallet);
    let mut pool = Mempool::new(MempoolConfig::default());

    // fee floor
    assert_eq!(
      pool.add(transfer(&wallet, 1, 10, 1), &ledger, NOW),
      Err(MempoolError::FeeTooLow(Amount::from_units(10_000)))
    );

    // wrong chain
    let mut foreign = transfer(&wallet, 1, 10, 100_000);
    foreign.chain_id = "lvenc-mainnet-1".to_owned();
    foreign.sign(&wallet);
    assert_eq!(
      pool.add(foreign, &ledger, NOW),
      Err(MempoolError::WrongChain)
    );

    // blacklisted sender
    pool.blacklist(wallet.address("tLVE"));
    assert_eq!(
      pool.add(transfer(&wallet, 1, 10, 100_000), &ledger, NOW),
      Err(MempoolError::Blacklisted)
    );
  }

  #[test]
  fn balance_covers_all_pending() {
    let wallet = WalletKeypair::generate();
    let ledger = funded_ledger(&wallet);
    let mut pool = Mempool::new(MempoolConfig::default());

    pool
      .add(transfer(&wallet, 1, 600_000, 100_000), &ledger, NOW)
      .unwrap();
    // another 600k would overdraw the million
    assert_eq!(
      pool.add(transfer(&wallet, 2, 600_000, 100_000), &ledger, NOW),
      Err(MempoolError::InsufficientFunds)
    );
  }

  #[test]
  fn eviction_prefers_low_fees() {
    let wallet_a = WalletKeypair::generate();
    let wallet_b = WalletKeypair::generate();
    let mut ledger = funded_ledger(&wallet_a);
    ledger
      .balances
      .insert(wallet_b.address("tLVE"), Amount::from_whole(1000));

    let mut pool = Mempool::new(MempoolConfig {
      max_pending: 1,
      ..Default::default()
    });

    let cheap = transfer(&wallet_a, 1, 10, 10_000);
    let cheap_id = cheap.id;
    pool.add(cheap, &ledger, NOW).unwrap();

    // an equally cheap transaction cannot push its way in
    assert_eq!(
      pool.add(transfer(&wallet_b, 1, 10, 10_000), &ledger, NOW),
      Err(MempoolError::Full)
    );

    // a better fee evicts the resident
    pool
      .add(transfer(&wallet_b, 1, 10, 500_000), &ledger, NOW)
      .unwrap();
    assert!(!pool.contains(&cheap_id));
    assert_eq!(pool.len(), 1);
  }

  #[test]
  fn selection_is_fee_ordered_and_nonce_safe() {
    let wallet_a = WalletKeypair::generate();
    let wallet_b = WalletKeypair::generate();
    let mut ledger = funded_ledger(&wallet_a);
    ledger
      .balances
      .insert(wallet_b.address("tLVE"), Amount::from_whole(1000));

    let mut pool = Mempool::new(MempoolConfig::default());
    // a: two chained txs, low fees; b: one high-fee tx
    pool.add(transfer(&wallet_a, 1, 10, 20_000), &ledger, NOW).unwrap();
    pool.add(transfer(&wallet_a, 2, 10, 900_000), &ledger, NOW).unwrap();
    pool.add(transfer(&wallet_b, 1, 10, 500_000), &ledger, NOW).unwrap();

    let selected = pool.select(&ledger, 10);
    assert_eq!(selected.len(), 3);
    // b's rich tx leads, but a's nonce-2 never precedes nonce-1
    assert_eq!(selected[0].from, Some(wallet_b.address("tLVE")));
    let a_positions: Vec<u64> = selected
      .iter()
      .filter(|tx| tx.from == Some(wallet_a.address("tLVE")))
      .map(|tx| tx.nonce)
      .collect();
    assert_eq!(a_positions, vec![1, 2]);

    // cap respected
    assert_eq!(pool.select(&ledger, 2).len(), 2);
  }

  #[test]
  fn replay_protection_after_inclusion() {
    let wallet = WalletKeypair::generate();
    let mut ledger = funded_ledger(&wallet);
    let mut pool = Mempool::new(MempoolConfig::default());

    let tx = transfer(&wallet, 1, 10, 100_000);
    pool.add(tx.clone(), &ledger, NOW).unwrap();

    // the block applies it
    ledger.nonces.insert(wallet.address("tLVE"), 1);
    pool.on_block_applied(std::slice::from_ref(&tx), &ledger, NOW);
    assert!(pool.is_empty());

    // the same id bounces
    assert_eq!(
      pool.add(tx, &ledger, NOW),
      Err(MempoolError::DuplicateId)
    );

    // and a fresh tx reusing the nonce bounces too
    assert_eq!(
      pool.add(transfer(&wallet, 1, 10, 100_000), &ledger, NOW),
      Err(MempoolError::NonceReused)
    );

    // but records age out eventually
    pool.prune(NOW + 4_000_000);
    assert_eq!(
      pool.add(transfer(&wallet, 1, 10, 100_000), &ledger, NOW),
      Err(MempoolError::BadNonce {
        expected: 2,
        actual: 1
      })
    );
  }

  #[test]
  fn rate_limit_per_sender() {
    let wallet = WalletKeypair::generate();
    let ledger = funded_ledger(&wallet);
    let mut pool = Mempool::new(MempoolConfig {
      max_per_window: 2,
      ..Default::default()
    });

    pool.add(transfer(&wallet, 1, 10, 100_000), &ledger, NOW).unwrap();
    pool.add(transfer(&wallet, 2, 10, 100_000), &ledger, NOW).unwrap();
    assert_eq!(
      pool.add(transfer(&wallet, 3, 10, 100_000), &ledger, NOW),
      Err(MempoolError::RateLimited)
    );

    // the window slides
    pool
      .add(transfer(&wallet, 3, 10, 100_000), &ledger, NOW + 61_000)
      .unwrap();
  }
}
