//! Epoch engine
//!
//! Every `blocks_per_epoch` blocks the chain crosses an epoch
//! boundary. The boundary work runs inline with block application in
//! a fixed order on every node: release matured unbonds, refresh the
//! active validator set, mint inflation, distribute rewards, reset
//! the burn cap. The height at which an epoch was applied is part of
//! ledger state, which makes the minting step idempotent across
//! restarts, reorgs and replays.

use {
  super::{burn::BurnState, StakingState, UnbondingEntry},
  crate::primitives::{Address, Amount},
  serde::{Deserialize, Serialize},
  tracing::debug,
};

/// Economic parameters, identical on every node of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EpochParams {
  pub blocks_per_epoch: u64,
  pub blocks_per_year: u64,
  pub unbonding_blocks: u64,
  pub min_validator_stake: Amount,
  pub min_delegation: Amount,

  /// Yearly inflation at a fully bonded supply.
  pub min_inflation_bps: u64,

  /// Yearly inflation when nothing is bonded.
  pub max_inflation_bps: u64,

  /// Yearly inflation exactly at the target bonded ratio.
  pub base_inflation_bps: u64,

  /// The bonded ratio the schedule steers toward.
  pub target_bonded_bps: u64,

  /// Share of every transaction fee that is burned; the rest goes
  /// to the block producer.
  pub tx_fee_burn_bps: u64,

  /// Cap on fee and swap burns per epoch, as a fraction of the
  /// total supply.
  pub max_burn_epoch_bps: u64,

  /// Consecutive missed slots that trigger a liveness slash.
  pub max_missed_slots: u64,
}

impl Default for EpochParams {
  fn default() -> Self {
    Self {
      blocks_per_epoch: 100,
      // 30 second slots
      blocks_per_year: 365 * 24 * 120,
      unbonding_blocks: 100,
      min_validator_stake: Amount::from_whole(100),
      min_delegation: Amount::from_whole(10),
      min_inflation_bps: 200,
      max_inflation_bps: 2000,
      base_inflation_bps: 800,
      target_bonded_bps: 5000,
      tx_fee_burn_bps: 5000,
      max_burn_epoch_bps: 100,
      max_missed_slots: 100,
    }
  }
}

impl EpochParams {
  /// The effective yearly inflation rate for a given bonded ratio:
  /// a kinked curve anchored at the base rate when bonding sits on
  /// target, rising linearly toward the maximum as bonding falls
  /// toward zero and falling toward the minimum as the whole supply
  /// bonds. An underbonded network pays more to attract stake.
  pub fn inflation_bps(&self, bonded: Amount, supply: Amount) -> u64 {
    if supply.is_zero() {
      return self.max_inflation_bps;
    }
    let ratio_bps = (bonded.units() as u128 * 10_000
      / supply.units() as u128)
      .min(10_000) as u64;

    let target = self.target_bonded_bps.clamp(1, 9_999);
    if ratio_bps <= target {
      let spread = self.max_inflation_bps - self.base_inflation_bps;
      self.max_inflation_bps - spread * ratio_bps / target
    } else {
      let spread = self.base_inflation_bps - self.min_inflation_bps;
      self.base_inflation_bps
        - spread * (ratio_bps - target) / (10_000 - target)
    }
  }

  /// The burn cap for one epoch at the given supply.
  pub fn epoch_burn_cap(&self, supply: Amount) -> Amount {
    supply.bps(self.max_burn_epoch_bps)
  }
}

/// Everything an epoch transition produced, for the ledger to apply
/// to balances and the supply counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochOutcome {
  pub epoch: u64,

  /// Newly minted reward credits, in canonical distribution order.
  pub rewards: Vec<(Address, Amount)>,

  /// Sum of all reward credits; the supply grows by exactly this.
  pub minted: Amount,

  /// Matured unbonds returning to spendable balances.
  pub released: Vec<UnbondingEntry>,
}

/// Runs one epoch transition at `height`. The caller is responsible
/// for checking that this boundary has not been applied yet.
pub fn advance_epoch(
  staking: &mut StakingState,
  burn: &mut BurnState,
  total_supply: Amount,
  height: u64,
  params: &EpochParams,
) -> EpochOutcome {
  let epoch = height / params.blocks_per_epoch;

  // 1. matured unbonds leave the queue
  let released = staking.drain_matured(height);

  // 2. refresh the active set: anyone with a registered consensus
  // key and enough self stake is in, jailed validators are out
  for record in staking.validators.values_mut() {
    record.active = !record.jailed
      && record.consensus_pubkey.is_some()
      && record.self_stake >= params.min_validator_stake;
  }

  // 3. deterministic inflation for this epoch
  let bonded = staking.total_bonded();
  let rate_bps = params.inflation_bps(bonded, total_supply);
  let epoch_reward = total_supply
    .bps(rate_bps)
    .mul_div(params.blocks_per_epoch, params.blocks_per_year)
    .unwrap_or(Amount::ZERO);

  // 4 + 5. mint and distribute proportionally to effective stake,
  // commission off the top, the rest pro rata across the
  // validator's own stake and its delegations
  let total_active: Amount =
    staking.active_set().map(|v| v.effective_stake()).sum();

  let mut rewards: Vec<(Address, Amount)> = Vec::new();
  if !total_active.is_zero() && !epoch_reward.is_zero() {
    for validator in staking.active_set() {
      let effective = validator.effective_stake();
      let share = epoch_reward
        .mul_div(effective.units(), total_active.units())
        .unwrap_or(Amount::ZERO);
      if share.is_zero() {
        continue;
      }

      let commission = share.bps(validator.commission_bps as u64);
      let pool = share.saturating_sub(commission);

      let mut distributed = Amount::ZERO;
      for (delegator, delegation) in &validator.delegations {
        let cut = pool
          .mul_div(delegation.units(), effective.units())
          .unwrap_or(Amount::ZERO);
        if !cut.is_zero() {
          rewards.push((delegator.clone(), cut));
          distributed = distributed.checked_add(cut).expect("reward overflow");
        }
      }

      // the operator earns commission, its self-stake share and
      // whatever rounding dust is left in this validator's share
      let operator_cut = share.saturating_sub(distributed);
      if !operator_cut.is_zero() {
        rewards.push((validator.operator.clone(), operator_cut));
      }
    }
  }

  let minted: Amount = rewards.iter().map(|(_, amount)| *amount).sum();

  // 6. the burn cap counter starts over
  burn.reset_epoch();

  debug!(
    "epoch {epoch} at height {height}: minted {minted} at {rate_bps} bps \
     to {} recipients, released {} unbonds",
    rewards.len(),
    released.len()
  );

  EpochOutcome {
    epoch,
    rewards,
    minted,
    released,
  }
}
