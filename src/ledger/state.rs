//! Ledger state
//!
//! The replicated state machine: balances, nonces, staking, the AMM
//! pool and the burn counters. The entire struct is a pure function
//! of the genesis configuration and the ordered block log; applying
//! the same blocks on any two nodes yields byte-identical state.
//!
//! Application is not transactional within a block: a failing
//! transaction invalidates the whole block, so callers always apply
//! candidate blocks to a scratch clone and swap it in on success.
//! That clone-and-swap is also what serves mempool dry-runs.

use {
  super::{
    block::Block,
    genesis::GenesisConfig,
    transaction::{Transaction, TransactionError, TxData, TxTarget, TxType},
  },
  crate::{
    amm::{PoolError, PoolInstruction, PoolState, PoolToken},
    consensus::elect_producer,
    primitives::{Address, Amount},
    staking::{
      advance_epoch, BurnReason, BurnState, EpochParams, StakingError,
      StakingState,
    },
  },
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
  thiserror::Error,
  tracing::{debug, info, warn},
};

/// Coarse error categories, used for peer scoring and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Validation,
  Balance,
  Policy,
  Consensus,
  Economics,
}

#[derive(Debug, Error, PartialEq)]
pub enum LedgerError {
  #[error("transaction is for chain {actual}, this is {expected}")]
  WrongChain { expected: String, actual: String },

  #[error(transparent)]
  Transaction(#[from] TransactionError),

  #[error("bad nonce: expected {expected}, got {actual}")]
  BadNonce { expected: u64, actual: u64 },

  #[error("insufficient balance for {0}")]
  InsufficientBalance(Address),

  #[error("insufficient USDT balance for {0}")]
  InsufficientUsdt(Address),

  #[error("transaction is missing its {0} payload")]
  MissingData(&'static str),

  #[error("transaction target must be {0}")]
  WrongTarget(&'static str),

  #[error("signed amount does not match the instruction operand")]
  AmountMismatch,

  #[error("system transactions of this shape are not accepted")]
  SystemForbidden,

  #[error("double-sign evidence does not verify")]
  EvidenceInvalid,

  #[error("fee-bearing transaction in a block without a producer")]
  MissingProducer,

  #[error("block height {actual} does not extend ledger height {expected}")]
  BadHeight { expected: u64, actual: u64 },

  #[error(transparent)]
  Staking(#[from] StakingError),

  #[error(transparent)]
  Pool(#[from] PoolError),
}

impl LedgerError {
  pub fn kind(&self) -> ErrorKind {
    use LedgerError::*;
    match self {
      WrongChain { .. } | BadHeight { .. } => ErrorKind::Consensus,
      InsufficientBalance(_) | InsufficientUsdt(_) => ErrorKind::Balance,
      Staking(StakingError::InsufficientStake) => ErrorKind::Balance,
      Staking(_) => ErrorKind::Policy,
      Pool(_) => ErrorKind::Policy,
      _ => ErrorKind::Validation,
    }
  }
}

/// The full economic state of the chain at some height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
  pub chain_id: String,
  pub address_prefix: String,

  pub balances: BTreeMap<Address, Amount>,

  /// Balances of the pool's quote asset. USDT only moves through
  /// AMM operations; transfers move the native token.
  pub usdt_balances: BTreeMap<Address, Amount>,

  pub nonces: BTreeMap<Address, u64>,

  /// Native tokens in existence: grows with inflation, shrinks
  /// with burns.
  pub total_supply: Amount,

  pub staking: StakingState,
  pub pool: PoolState,
  pub burn: BurnState,

  /// Index of the last applied block.
  pub height: u64,

  /// Last epoch whose boundary work ran. Consulted before every
  /// minting step so that restarts, reorgs and replays can never
  /// re-mint an epoch.
  pub epoch_applied: u64,

  pub liquidity_authority: Address,
  pub epoch_params: EpochParams,
}

impl Ledger {
  /// Seeds the state a genesis configuration describes: the faucet
  /// mint, extra balances and the bonded genesis validator set.
  pub fn from_genesis(genesis: &GenesisConfig) -> Self {
    let mut ledger = Self {
      chain_id: genesis.chain_id.clone(),
      address_prefix: genesis.address_prefix.clone(),
      balances: BTreeMap::new(),
      usdt_balances: BTreeMap::new(),
      nonces: BTreeMap::new(),
      total_supply: Amount::ZERO,
      staking: StakingState::default(),
      pool: PoolState::default(),
      burn: BurnState::default(),
      height: 0,
      epoch_applied: 0,
      liquidity_authority: genesis.liquidity_authority().clone(),
      epoch_params: genesis.epoch_params.clone(),
    };

    ledger.mint(&genesis.faucet_address, genesis.initial_supply);
    for entry in &genesis.initial_balances {
      ledger.mint(&entry.address, entry.amount);
    }
    for entry in &genesis.initial_usdt_balances {
      let balance = ledger
        .usdt_balances
        .entry(entry.address.clone())
        .or_insert(Amount::ZERO);
      *balance = balance.checked_add(entry.amount).expect("usdt overflow");
    }

    for validator in &genesis.validators {
      ledger.total_supply = ledger
        .total_supply
        .checked_add(validator.power)
        .expect("supply overflow");
      ledger
        .staking
        .stake(
          &validator.operator_address,
          validator.power,
          Some(validator.consensus_pubkey),
          Some(validator.commission_bps),
          validator.moniker.clone(),
        )
        .expect("genesis validator set is well formed");
      // genesis validators do not wait for an epoch boundary
      if let Some(record) =
        ledger.staking.validators.get_mut(&validator.operator_address)
      {
        record.active = record.self_stake >= genesis.epoch_params.min_validator_stake;
      }
    }

    ledger
  }

  pub fn balance(&self, address: &Address) -> Amount {
    self.balances.get(address).copied().unwrap_or(Amount::ZERO)
  }

  pub fn usdt_balance(&self, address: &Address) -> Amount {
    self
      .usdt_balances
      .get(address)
      .copied()
      .unwrap_or(Amount::ZERO)
  }

  pub fn nonce(&self, address: &Address) -> u64 {
    self.nonces.get(address).copied().unwrap_or(0)
  }

  /// Native tokens accounted for anywhere: spendable, bonded,
  /// unbonding or pooled. Equal to the total supply at all times.
  pub fn circulating_total(&self) -> Amount {
    let spendable: Amount = self.balances.values().copied().sum();
    spendable
      .checked_add(self.staking.total_bonded())
      .and_then(|a| a.checked_add(self.staking.total_unbonding()))
      .and_then(|a| a.checked_add(self.pool.reserve_a))
      .expect("supply overflow")
  }

  /// Applies a block to this state. `parent_slot` is the slot of
  /// the block this one builds on, used for deterministic liveness
  /// accounting of the skipped slots in between.
  ///
  /// On error the state is torn; apply to a clone and discard it.
  pub fn apply_block(
    &mut self,
    block: &Block,
    parent_slot: u64,
  ) -> Result<(), LedgerError> {
    if block.index != self.height + 1 {
      return Err(LedgerError::BadHeight {
        expected: self.height + 1,
        actual: block.index,
      });
    }

    self.account_missed_slots(block, parent_slot);

    // the epoch engine runs first when this block sits on an
    // epoch boundary, guarded by the applied-epoch marker
    let epoch_len = self.epoch_params.blocks_per_epoch;
    if block.index % epoch_len == 0 && block.index / epoch_len > self.epoch_applied
    {
      self.run_epoch(block.index);
    }

    for tx in &block.transactions {
      self.apply_transaction(tx, block.producer.as_ref(), block.index)?;
    }

    if let Some(producer) = &block.producer {
      self.staking.record_produced(producer);
    }

    self.height = block.index;
    Ok(())
  }

  /// Checks a transaction against a scratch copy of the state, the
  /// apply-then-revert dry run used by mempool admission.
  pub fn dry_run(&self, tx: &Transaction) -> Result<(), LedgerError> {
    let producer = self.liquidity_authority.clone();
    self
      .clone()
      .apply_transaction(tx, Some(&producer), self.height + 1)
  }

  /// Every expected producer between the parent's slot and this
  /// block's slot failed to publish in time; their miss counters
  /// grow and cross-threshold validators take the liveness slash.
  /// This is replayed identically on every node because it only
  /// depends on chain data.
  fn account_missed_slots(&mut self, block: &Block, parent_slot: u64) {
    if block.slot <= parent_slot + 1 {
      return;
    }
    let max_missed = self.epoch_params.max_missed_slots;
    for slot in parent_slot + 1..block.slot {
      let expected = elect_producer(
        &block.previous_hash,
        slot,
        self.staking.active_set(),
      )
      .map(|v| v.operator.clone());

      if let Some(operator) = expected {
        let missed = self.staking.record_missed_slot(&operator);
        if missed > max_missed {
          if let Ok(outcome) = self.staking.slash_liveness(&operator) {
            self.burn.record_slash(outcome.slashed);
            self.total_supply =
              self.total_supply.saturating_sub(outcome.slashed);
            warn!(
              "liveness slash: {} lost {} after {missed} missed slots",
              outcome.operator, outcome.slashed
            );
          }
        }
      }
    }
  }

  fn run_epoch(&mut self, height: u64) {
    let params = self.epoch_params.clone();
    let outcome = advance_epoch(
      &mut self.staking,
      &mut self.burn,
      self.total_supply,
      height,
      &params,
    );

    for entry in &outcome.released {
      self.credit(&entry.owner, entry.amount);
    }
    for (address, amount) in &outcome.rewards {
      self.mint(address, *amount);
    }
    self.epoch_applied = outcome.epoch;
    info!(
      "epoch {} applied at height {height}: minted {}, released {} unbonds",
      outcome.epoch,
      outcome.minted,
      outcome.released.len()
    );
  }

  /// Applies a single transaction at `height`. Outside of
  /// [`apply_block`] this is only for producers filtering
  /// candidates on a scratch clone.
  pub fn apply_transaction(
    &mut self,
    tx: &Transaction,
    producer: Option<&Address>,
    height: u64,
  ) -> Result<(), LedgerError> {
    if tx.chain_id != self.chain_id {
      return Err(LedgerError::WrongChain {
        expected: self.chain_id.clone(),
        actual: tx.chain_id.clone(),
      });
    }
    tx.verify_signature()?;

    if tx.is_system() {
      return self.apply_system(tx);
    }
    let from = tx.from.clone().expect("non-system transaction has a sender");

    let expected = self.nonce(&from) + 1;
    if tx.nonce != expected {
      return Err(LedgerError::BadNonce {
        expected,
        actual: tx.nonce,
      });
    }

    match tx.tx_type {
      TxType::Transfer => {
        let to = tx
          .to
          .account()
          .ok_or(LedgerError::WrongTarget("an account address"))?
          .clone();
        self.debit(&from, tx.amount, tx.fee)?;
        self.credit(&to, tx.amount);
      }

      TxType::Stake => {
        self.expect_stake_pool(tx)?;
        self.debit(&from, tx.amount, tx.fee)?;
        let (key, commission, moniker) = match &tx.data {
          Some(TxData::Validator {
            consensus_pubkey,
            commission_bps,
            moniker,
          }) => (Some(*consensus_pubkey), *commission_bps, moniker.clone()),
          _ => (None, None, None),
        };
        self.staking.stake(&from, tx.amount, key, commission, moniker)?;
      }

      TxType::Unstake => {
        self.expect_stake_pool(tx)?;
        self.debit(&from, Amount::ZERO, tx.fee)?;
        let matures = height + self.epoch_params.unbonding_blocks;
        self.staking.unstake(&from, tx.amount, matures)?;
      }

      TxType::Delegate => {
        self.expect_stake_pool(tx)?;
        let validator = self.delegation_target(tx)?;
        if tx.amount < self.epoch_params.min_delegation {
          return Err(StakingError::BelowMinimumDelegation.into());
        }
        self.debit(&from, tx.amount, tx.fee)?;
        self.staking.delegate(&from, &validator, tx.amount)?;
      }

      TxType::Undelegate => {
        self.expect_stake_pool(tx)?;
        let validator = self.delegation_target(tx)?;
        self.debit(&from, Amount::ZERO, tx.fee)?;
        let matures = height + self.epoch_params.unbonding_blocks;
        self
          .staking
          .undelegate(&from, &validator, tx.amount, matures)?;
      }

      TxType::PoolOp => {
        if tx.to != TxTarget::Pool {
          return Err(LedgerError::WrongTarget("POOL"));
        }
        let instruction = match &tx.data {
          Some(TxData::Pool(instruction)) => instruction.clone(),
          _ => return Err(LedgerError::MissingData("pool")),
        };
        self.apply_pool_op(&from, tx, &instruction)?;
      }
    }

    self.nonces.insert(from, tx.nonce);
    self.settle_fee(tx.fee, producer)?;
    Ok(())
  }

  /// The only system transactions accepted inside non-genesis
  /// blocks carry double-sign evidence. Everything else the
  /// protocol does (rewards, unbond releases) is a state effect,
  /// not a transaction.
  fn apply_system(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
    let evidence = match &tx.data {
      Some(TxData::Evidence(evidence)) => evidence,
      _ => return Err(LedgerError::SystemForbidden),
    };
    if !tx.amount.is_zero() || !tx.fee.is_zero() {
      return Err(LedgerError::SystemForbidden);
    }

    let key = self
      .staking
      .get(&evidence.producer)
      .and_then(|record| record.consensus_pubkey)
      .ok_or(LedgerError::EvidenceInvalid)?;
    if !evidence.verify(&key, &self.chain_id) {
      return Err(LedgerError::EvidenceInvalid);
    }

    let outcome = self.staking.slash_double_sign(&evidence.producer)?;
    self.burn.record_slash(outcome.slashed);
    self.total_supply = self.total_supply.saturating_sub(outcome.slashed);
    info!(
      "double-sign slash: {} lost {} and was jailed",
      outcome.operator, outcome.slashed
    );
    Ok(())
  }

  fn apply_pool_op(
    &mut self,
    from: &Address,
    tx: &Transaction,
    instruction: &PoolInstruction,
  ) -> Result<(), LedgerError> {
    match *instruction {
      PoolInstruction::Initialize { amount_a, amount_b } => {
        if *from != self.liquidity_authority {
          return Err(PoolError::Unauthorized.into());
        }
        if tx.amount != amount_a {
          return Err(LedgerError::AmountMismatch);
        }
        self.debit(from, amount_a, tx.fee)?;
        self.debit_usdt(from, amount_b)?;
        self.pool.initialize(from, amount_a, amount_b)?;
      }

      PoolInstruction::AddLiquidity { amount_a, amount_b } => {
        if tx.amount != amount_a {
          return Err(LedgerError::AmountMismatch);
        }
        self.debit(from, amount_a, tx.fee)?;
        self.debit_usdt(from, amount_b)?;
        self.pool.add_liquidity(from, amount_a, amount_b)?;
      }

      PoolInstruction::RemoveLiquidity { lp_amount } => {
        if tx.amount != lp_amount {
          return Err(LedgerError::AmountMismatch);
        }
        self.debit(from, Amount::ZERO, tx.fee)?;
        let (out_a, out_b) = self.pool.remove_liquidity(from, lp_amount)?;
        self.credit(from, out_a);
        self.credit_usdt(from, out_b);
      }

      PoolInstruction::Swap {
        token_in,
        amount_in,
        min_out,
      } => {
        if tx.amount != amount_in {
          return Err(LedgerError::AmountMismatch);
        }
        match token_in {
          PoolToken::Lve => self.debit(from, amount_in, tx.fee)?,
          PoolToken::Usdt => {
            self.debit(from, Amount::ZERO, tx.fee)?;
            self.debit_usdt(from, amount_in)?;
          }
        }

        let outcome = self.pool.swap(token_in, amount_in, min_out)?;
        match token_in {
          PoolToken::Lve => self.credit_usdt(from, outcome.amount_out),
          PoolToken::Usdt => self.credit(from, outcome.amount_out),
        }

        // 30% of the LVE fee share burns, subject to the epoch cap
        let cap = self.epoch_params.epoch_burn_cap(self.total_supply);
        let burnable = self.burn.burnable(outcome.burnable, cap);
        if !burnable.is_zero() {
          self.pool.burn_from_reserve(burnable);
          self.burn.record(BurnReason::SwapFee, burnable);
          self.total_supply = self.total_supply.saturating_sub(burnable);
        }
        debug!(
          "swap {amount_in} {:?} -> {} (fee {})",
          token_in, outcome.amount_out, outcome.fee
        );
      }
    }
    Ok(())
  }

  /// Splits a paid fee into its burned share and the producer's
  /// share.
  fn settle_fee(
    &mut self,
    fee: Amount,
    producer: Option<&Address>,
  ) -> Result<(), LedgerError> {
    if fee.is_zero() {
      return Ok(());
    }
    let producer = producer.ok_or(LedgerError::MissingProducer)?.clone();

    let share = fee.bps(self.epoch_params.tx_fee_burn_bps);
    let cap = self.epoch_params.epoch_burn_cap(self.total_supply);
    let burnable = self.burn.burnable(share, cap);
    self.burn.record(BurnReason::TxFee, burnable);
    self.total_supply = self.total_supply.saturating_sub(burnable);

    self.credit(&producer, fee.saturating_sub(burnable));
    Ok(())
  }

  fn expect_stake_pool(&self, tx: &Transaction) -> Result<(), LedgerError> {
    match tx.to {
      TxTarget::StakePool => Ok(()),
      _ => Err(LedgerError::WrongTarget("STAKE_POOL")),
    }
  }

  fn delegation_target(
    &self,
    tx: &Transaction,
  ) -> Result<Address, LedgerError> {
    match &tx.data {
      Some(TxData::Delegation { validator }) => Ok(validator.clone()),
      _ => Err(LedgerError::MissingData("delegation")),
    }
  }

  /// Removes `amount + fee` from a spendable balance.
  fn debit(
    &mut self,
    address: &Address,
    amount: Amount,
    fee: Amount,
  ) -> Result<(), LedgerError> {
    let needed = amount
      .checked_add(fee)
      .ok_or_else(|| LedgerError::InsufficientBalance(address.clone()))?;
    let balance = self.balance(address);
    let remaining = balance
      .checked_sub(needed)
      .ok_or_else(|| LedgerError::InsufficientBalance(address.clone()))?;
    if remaining.is_zero() {
      self.balances.remove(address);
    } else {
      self.balances.insert(address.clone(), remaining);
    }
    Ok(())
  }

  fn credit(&mut self, address: &Address, amount: Amount) {
    if amount.is_zero() {
      return;
    }
    let balance = self.balances.entry(address.clone()).or_insert(Amount::ZERO);
    *balance = balance.checked_add(amount).expect("balance overflow");
  }

  fn debit_usdt(
    &mut self,
    address: &Address,
    amount: Amount,
  ) -> Result<(), LedgerError> {
    let balance = self.usdt_balance(address);
    let remaining = balance
      .checked_sub(amount)
      .ok_or_else(|| LedgerError::InsufficientUsdt(address.clone()))?;
    if remaining.is_zero() {
      self.usdt_balances.remove(address);
    } else {
      self.usdt_balances.insert(address.clone(), remaining);
    }
    Ok(())
  }

  fn credit_usdt(&mut self, address: &Address, amount: Amount) {
    if amount.is_zero() {
      return;
    }
    let balance = self
      .usdt_balances
      .entry(address.clone())
      .or_insert(Amount::ZERO);
    *balance = balance.checked_add(amount).expect("usdt overflow");
  }

  /// Creates new supply in an account. Only genesis seeding and
  /// epoch rewards mint.
  fn mint(&mut self, address: &Address, amount: Amount) {
    self.credit(address, amount);
    self.total_supply = self
      .total_supply
      .checked_add(amount)
      .expect("supply overflow");
  }
}
