//! Staking ledger
//!
//! Tracks validator records, delegations and the unbonding queue.
//! Money movement (debiting and crediting wallet balances) is the
//! ledger's job; this module owns the bookkeeping of who staked what
//! with whom and when it unlocks.

mod burn;
mod epoch;
mod slashing;

pub use {
  burn::{BurnReason, BurnState},
  epoch::{advance_epoch, EpochOutcome, EpochParams},
  slashing::{BlockSeal, DoubleSignEvidence, SlashOutcome},
};

use {
  crate::primitives::{Address, Amount, Pubkey},
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
  thiserror::Error,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StakingError {
  #[error("validator {0} is not known")]
  UnknownValidator(Address),

  #[error("stake below the validator minimum")]
  BelowMinimumStake,

  #[error("delegation below the minimum")]
  BelowMinimumDelegation,

  #[error("not enough bonded stake for this operation")]
  InsufficientStake,

  #[error("validator {0} is jailed")]
  Jailed(Address),

  #[error("validator has no registered consensus key")]
  NoConsensusKey,

  #[error("commission must be between 0 and 10000 basis points")]
  CommissionOutOfRange,
}

/// A validator and the delegations pointed at it.
///
/// Delegators refer to validators by operator address only; the
/// record owns its delegation map, so there is no shared ownership
/// between the two sides of the relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRecord {
  pub operator: Address,

  /// Ed25519 key that signs blocks and attestations. Registered
  /// with the first STAKE transaction that carries one.
  pub consensus_pubkey: Option<Pubkey>,

  pub self_stake: Amount,

  /// Sum of all entries in [`delegations`].
  pub delegated_stake: Amount,

  pub delegations: BTreeMap<Address, Amount>,

  pub commission_bps: u16,

  pub active: bool,
  pub jailed: bool,

  /// Consecutive expected slots this validator failed to produce.
  pub missed_slots: u64,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub moniker: Option<String>,
}

impl ValidatorRecord {
  fn new(operator: Address) -> Self {
    Self {
      operator,
      consensus_pubkey: None,
      self_stake: Amount::ZERO,
      delegated_stake: Amount::ZERO,
      delegations: BTreeMap::new(),
      commission_bps: 0,
      active: false,
      jailed: false,
      missed_slots: 0,
      moniker: None,
    }
  }

  /// Stake that counts toward producer election and attestation
  /// weight. Unbonding amounts have already left both components.
  pub fn effective_stake(&self) -> Amount {
    self
      .self_stake
      .checked_add(self.delegated_stake)
      .expect("stake overflow")
  }
}

/// Stake waiting out the unbonding period before it returns to a
/// spendable balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnbondingEntry {
  pub owner: Address,
  pub amount: Amount,
  pub matures_at: u64,
}

/// The staking side of the ledger state.
#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct StakingState {
  pub validators: BTreeMap<Address, ValidatorRecord>,
  pub unbonding: Vec<UnbondingEntry>,
}

impl StakingState {
  /// Bonds `amount` as self-stake of `operator`, optionally
  /// registering the consensus key and commission on first use.
  /// Activation happens at the next epoch boundary.
  pub fn stake(
    &mut self,
    operator: &Address,
    amount: Amount,
    consensus_pubkey: Option<Pubkey>,
    commission_bps: Option<u16>,
    moniker: Option<String>,
  ) -> Result<(), StakingError> {
    if let Some(bps) = commission_bps {
      if bps > 10_000 {
        return Err(StakingError::CommissionOutOfRange);
      }
    }

    let record = self
      .validators
      .entry(operator.clone())
      .or_insert_with(|| ValidatorRecord::new(operator.clone()));

    if let Some(key) = consensus_pubkey {
      record.consensus_pubkey = Some(key);
    }
    if let Some(bps) = commission_bps {
      record.commission_bps = bps;
    }
    if moniker.is_some() {
      record.moniker = moniker;
    }

    record.self_stake = record
      .self_stake
      .checked_add(amount)
      .expect("stake overflow");
    Ok(())
  }

  /// Moves `amount` of self-stake into the unbonding queue. The
  /// validator deactivates at the next epoch boundary if it drops
  /// below the minimum.
  pub fn unstake(
    &mut self,
    operator: &Address,
    amount: Amount,
    matures_at: u64,
  ) -> Result<(), StakingError> {
    let record = self
      .validators
      .get_mut(operator)
      .ok_or_else(|| StakingError::UnknownValidator(operator.clone()))?;

    record.self_stake = record
      .self_stake
      .checked_sub(amount)
      .ok_or(StakingError::InsufficientStake)?;

    self.unbonding.push(UnbondingEntry {
      owner: operator.clone(),
      amount,
      matures_at,
    });
    self.retire_if_empty(operator);
    Ok(())
  }

  pub fn delegate(
    &mut self,
    delegator: &Address,
    validator: &Address,
    amount: Amount,
  ) -> Result<(), StakingError> {
    let record = self
      .validators
      .get_mut(validator)
      .ok_or_else(|| StakingError::UnknownValidator(validator.clone()))?;
    if record.jailed {
      return Err(StakingError::Jailed(validator.clone()));
    }

    let delegation = record
      .delegations
      .entry(delegator.clone())
      .or_insert(Amount::ZERO);
    *delegation = delegation
      .checked_add(amount)
      .expect("delegation overflow");
    record.delegated_stake = record
      .delegated_stake
      .checked_add(amount)
      .expect("delegation overflow");
    Ok(())
  }

  pub fn undelegate(
    &mut self,
    delegator: &Address,
    validator: &Address,
    amount: Amount,
    matures_at: u64,
  ) -> Result<(), StakingError> {
    let record = self
      .validators
      .get_mut(validator)
      .ok_or_else(|| StakingError::UnknownValidator(validator.clone()))?;

    let delegation = record
      .delegations
      .get(delegator)
      .copied()
      .unwrap_or(Amount::ZERO);
    let remaining = delegation
      .checked_sub(amount)
      .ok_or(StakingError::InsufficientStake)?;

    if remaining.is_zero() {
      record.delegations.remove(delegator);
    } else {
      record.delegations.insert(delegator.clone(), remaining);
    }
    record.delegated_stake = record
      .delegated_stake
      .checked_sub(amount)
      .ok_or(StakingError::InsufficientStake)?;

    self.unbonding.push(UnbondingEntry {
      owner: delegator.clone(),
      amount,
      matures_at,
    });
    self.retire_if_empty(validator);
    Ok(())
  }

  /// Removes and returns all unbonding entries that matured at or
  /// before `height`, for the ledger to re-credit.
  pub fn drain_matured(&mut self, height: u64) -> Vec<UnbondingEntry> {
    let (matured, pending): (Vec<_>, Vec<_>) = self
      .unbonding
      .drain(..)
      .partition(|entry| entry.matures_at <= height);
    self.unbonding = pending;
    matured
  }

  /// Active validators in canonical (ascending operator address)
  /// order. All nodes iterate validators in exactly this order.
  pub fn active_set(&self) -> impl Iterator<Item = &ValidatorRecord> {
    self.validators.values().filter(|v| v.active)
  }

  pub fn total_active_stake(&self) -> Amount {
    self.active_set().map(|v| v.effective_stake()).sum()
  }

  /// Total bonded stake across all validators, active or not.
  /// This is the "bonded supply" input to the inflation schedule.
  pub fn total_bonded(&self) -> Amount {
    self
      .validators
      .values()
      .map(|v| v.effective_stake())
      .sum()
  }

  /// Stake still locked in the unbonding queue.
  pub fn total_unbonding(&self) -> Amount {
    self.unbonding.iter().map(|e| e.amount).sum()
  }

  pub fn get(&self, operator: &Address) -> Option<&ValidatorRecord> {
    self.validators.get(operator)
  }

  /// Bumps the consecutive-miss counter for a validator that failed
  /// to produce in its slot. Returns the new count.
  pub fn record_missed_slot(&mut self, operator: &Address) -> u64 {
    match self.validators.get_mut(operator) {
      Some(record) => {
        record.missed_slots += 1;
        record.missed_slots
      }
      None => 0,
    }
  }

  /// Clears the miss counter after a successful production.
  pub fn record_produced(&mut self, operator: &Address) {
    if let Some(record) = self.validators.get_mut(operator) {
      record.missed_slots = 0;
    }
  }

  /// Drops a record once nothing is bonded to or through it.
  fn retire_if_empty(&mut self, operator: &Address) {
    let retired = match self.validators.get(operator) {
      Some(record) => {
        record.self_stake.is_zero()
          && record.delegated_stake.is_zero()
          && !record.jailed
      }
      None => false,
    };
    if retired {
      self.validators.remove(operator);
    }
  }
}
