//! Slashing
//!
//! Two offences are punished: producing two different blocks at the
//! same height (double-signing, 50% slash + jail) and extended
//! absence from assigned slots (0.1% per missed slot, no jail).
//! Double-sign evidence travels inside the chain as a system
//! transaction so that every replaying node applies the same
//! punishment at the same height.

use {
  super::{StakingError, StakingState},
  crate::primitives::{sha256, Address, Amount, Pubkey},
  serde::{Deserialize, Serialize},
};

/// Double-sign slash: half of the effective stake.
pub const DOUBLE_SIGN_SLASH_BPS: u64 = 5000;

/// Liveness slash: 0.1% (10 bps) per consecutively missed slot.
pub const LIVENESS_SLASH_BPS_PER_MISS: u64 = 10;

/// A producer seal over one block: enough to prove that the
/// validator's consensus key signed this exact `(index, hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSeal {
  pub hash: String,
  pub signature: String,
}

/// Proof that one validator signed two conflicting messages at the
/// same height: either two block seals (double production) or two
/// attestations for different hashes. Both carry the same penalty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoubleSignEvidence {
  pub producer: Address,
  pub index: u64,
  pub slot: u64,
  pub first: BlockSeal,
  pub second: BlockSeal,

  /// True when the two signatures are conflicting attestations
  /// rather than block seals; the signed pre-image differs.
  #[serde(default)]
  pub attestations: bool,
}

impl DoubleSignEvidence {
  /// The digest an attestation signature covers:
  /// `SHA256(index ‖ hash ‖ validator)`.
  pub fn attestation_digest(
    index: u64,
    hash: &str,
    validator: &Address,
  ) -> [u8; 32] {
    sha256(format!("{index}{hash}{validator}"))
  }

  /// Checks that both signatures are valid under `key` over
  /// distinct hashes at the claimed height.
  pub fn verify(&self, key: &Pubkey, chain_id: &str) -> bool {
    if self.first.hash == self.second.hash {
      return false;
    }
    let verify_one = |seal: &BlockSeal| {
      if self.attestations {
        let digest =
          Self::attestation_digest(self.index, &seal.hash, &self.producer);
        key.verify(&digest, &seal.signature)
      } else {
        let message = format!("{chain_id}:{}:{}", self.index, seal.hash);
        key.verify(message.as_bytes(), &seal.signature)
      }
    };
    verify_one(&self.first) && verify_one(&self.second)
  }
}

/// The result of applying a slash, for the ledger to burn and log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashOutcome {
  pub operator: Address,
  pub slashed: Amount,
  pub jailed: bool,
}

impl StakingState {
  /// Slashes a fraction of a validator's effective stake, reducing
  /// self-stake first and then delegations pro rata. Returns the
  /// amount actually removed.
  fn slash_bps(
    &mut self,
    operator: &Address,
    bps: u64,
  ) -> Result<Amount, StakingError> {
    let record = self
      .validators
      .get_mut(operator)
      .ok_or_else(|| StakingError::UnknownValidator(operator.clone()))?;

    let target = record.effective_stake().bps(bps.min(10_000));
    let from_self = std::cmp::min(record.self_stake, target);
    record.self_stake = record.self_stake.saturating_sub(from_self);

    let mut remainder = target.saturating_sub(from_self);
    if !remainder.is_zero() && !record.delegated_stake.is_zero() {
      let pool = record.delegated_stake;
      let mut taken = Amount::ZERO;
      for amount in record.delegations.values_mut() {
        let cut = amount
          .mul_div(remainder.units(), pool.units())
          .unwrap_or(Amount::ZERO);
        *amount = amount.saturating_sub(cut);
        taken = taken.checked_add(cut).expect("slash overflow");
      }
      record.delegations.retain(|_, amount| !amount.is_zero());
      record.delegated_stake = record.delegated_stake.saturating_sub(taken);
      remainder = remainder.saturating_sub(taken);
    }

    // pro-rata truncation can leave dust unslashed, never the
    // other way around
    Ok(target.saturating_sub(remainder))
  }

  /// Applies the double-sign penalty: 50% slash and jail. The
  /// burned amount is returned for supply accounting.
  pub fn slash_double_sign(
    &mut self,
    operator: &Address,
  ) -> Result<SlashOutcome, StakingError> {
    let slashed = self.slash_bps(operator, DOUBLE_SIGN_SLASH_BPS)?;
    let record = self
      .validators
      .get_mut(operator)
      .ok_or_else(|| StakingError::UnknownValidator(operator.clone()))?;
    record.jailed = true;
    record.active = false;
    Ok(SlashOutcome {
      operator: operator.clone(),
      slashed,
      jailed: true,
    })
  }

  /// Applies the liveness penalty once the miss counter crossed the
  /// threshold: `0.1% × missed` slash, counter reset, no jail.
  pub fn slash_liveness(
    &mut self,
    operator: &Address,
  ) -> Result<SlashOutcome, StakingError> {
    let missed = self
      .validators
      .get(operator)
      .ok_or_else(|| StakingError::UnknownValidator(operator.clone()))?
      .missed_slots;

    let slashed =
      self.slash_bps(operator, LIVENESS_SLASH_BPS_PER_MISS * missed)?;
    let record = self
      .validators
      .get_mut(operator)
      .ok_or_else(|| StakingError::UnknownValidator(operator.clone()))?;
    record.missed_slots = 0;
    Ok(SlashOutcome {
      operator: operator.clone(),
      slashed,
      jailed: false,
    })
  }
}

#[cfg(test)]
mod test {
  use {
    super::{BlockSeal, DoubleSignEvidence},
    crate::{
      primitives::{Address, Amount, Keypair},
      staking::StakingState,
    },
  };

  fn addr(tag: &str) -> Address {
    Address::from_public_key("tLVE", tag)
  }

  #[test]
  fn double_sign_slashes_half_and_jails() {
    let mut staking = StakingState::default();
    let operator = addr("op");
    let delegator = addr("del");

    staking
      .stake(&operator, Amount::from_whole(100), None, None, None)
      .unwrap();
    staking
      .delegate(&delegator, &operator, Amount::from_whole(100))
      .unwrap();

    let outcome = staking.slash_double_sign(&operator).unwrap();
    assert_eq!(outcome.slashed, Amount::from_whole(100));
    assert!(outcome.jailed);

    let record = staking.get(&operator).unwrap();
    assert!(record.jailed);
    assert!(!record.active);
    // self stake absorbed the full hit before delegations
    assert_eq!(record.self_stake, Amount::ZERO);
    assert_eq!(record.delegated_stake, Amount::from_whole(100));
  }

  #[test]
  fn liveness_slash_scales_with_misses() {
    let mut staking = StakingState::default();
    let operator = addr("op");
    staking
      .stake(&operator, Amount::from_whole(1000), None, None, None)
      .unwrap();

    for _ in 0..101 {
      staking.record_missed_slot(&operator);
    }
    let outcome = staking.slash_liveness(&operator).unwrap();
    // 0.1% * 101 = 10.1% of 1000
    assert_eq!(outcome.slashed, Amount::from_units(101_000_000));
    assert!(!outcome.jailed);
    assert_eq!(staking.get(&operator).unwrap().missed_slots, 0);
  }

  #[test]
  fn evidence_verification() {
    let keypair = Keypair::generate();
    let chain_id = "lvenc-testnet-1";
    let seal = |hash: &str| BlockSeal {
      hash: hash.to_owned(),
      signature: keypair.sign_hex(format!("{chain_id}:7:{hash}").as_bytes()),
    };

    let evidence = DoubleSignEvidence {
      producer: addr("op"),
      index: 7,
      slot: 17,
      first: seal("aaaa"),
      second: seal("bbbb"),
      attestations: false,
    };
    assert!(evidence.verify(&keypair.public(), chain_id));

    // same hash twice is not an offence
    let same = DoubleSignEvidence {
      second: seal("aaaa"),
      ..evidence.clone()
    };
    assert!(!same.verify(&keypair.public(), chain_id));

    // forged signature fails
    let other = Keypair::generate();
    assert!(!evidence.verify(&other.public(), chain_id));
  }
}
