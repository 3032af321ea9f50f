//! BFT finality
//!
//! Validators attest to every block they accept. Attestations are
//! accumulated per `(height, hash)`; once the attested stake for one
//! hash reaches two thirds of the total active stake, the block is
//! final and can never be reverted. Accumulation is commutative, so
//! attestation arrival order does not matter.

use {
  crate::{
    primitives::{Address, Amount, Keypair},
    staking::{BlockSeal, DoubleSignEvidence, StakingState},
  },
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
  thiserror::Error,
  tracing::warn,
};

#[derive(Debug, Error, PartialEq)]
pub enum AttestationError {
  #[error("attestation from inactive or unknown validator {0}")]
  UnknownValidator(Address),

  #[error("attestation signature does not verify")]
  BadSignature,

  #[error("attestation for an already finalized height")]
  StaleHeight,
}

/// A validator's signed vote that `block_hash` is the canonical
/// block at `block_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
  pub block_index: u64,
  pub block_hash: String,
  pub validator: Address,
  pub signature: String,
  pub timestamp: i64,
}

impl Attestation {
  /// Signs `SHA256(index ‖ hash ‖ validator)` with the consensus
  /// key.
  pub fn new(
    keypair: &Keypair,
    validator: Address,
    block_index: u64,
    block_hash: impl Into<String>,
    timestamp: i64,
  ) -> Self {
    let block_hash = block_hash.into();
    let digest = DoubleSignEvidence::attestation_digest(
      block_index,
      &block_hash,
      &validator,
    );
    Self {
      signature: keypair.sign_hex(&digest),
      block_index,
      block_hash,
      validator,
      timestamp,
    }
  }

  fn digest(&self) -> [u8; 32] {
    DoubleSignEvidence::attestation_digest(
      self.block_index,
      &self.block_hash,
      &self.validator,
    )
  }
}

/// What recording an attestation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalityEvent {
  /// Nothing new; the vote was counted (or was a duplicate).
  Counted,

  /// The attested block crossed the 2/3 threshold.
  Finalized {
    index: u64,
    hash: String,
    attested: Amount,
  },

  /// The validator attested two different hashes at one height;
  /// the evidence is ready to be included in a block.
  Conflict(Box<DoubleSignEvidence>),
}

/// Accumulates attestations and tracks finalized heights.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalityTracker {
  /// (height, hash) → validator → attestation.
  #[serde(skip)]
  pending: BTreeMap<(u64, String), BTreeMap<Address, Attestation>>,

  /// Finalized hashes by height; the irreversible record.
  finalized: BTreeMap<u64, String>,

  /// Highest finalized height, monotonically increasing.
  highest: u64,
}

impl FinalityTracker {
  /// Validates and counts one attestation. The staking state
  /// supplies the active set, consensus keys and stake weights.
  pub fn record(
    &mut self,
    attestation: Attestation,
    staking: &StakingState,
  ) -> Result<FinalityEvent, AttestationError> {
    if self.finalized.contains_key(&attestation.block_index) {
      return Err(AttestationError::StaleHeight);
    }

    let record = staking
      .get(&attestation.validator)
      .filter(|record| record.active)
      .ok_or_else(|| {
        AttestationError::UnknownValidator(attestation.validator.clone())
      })?;
    let key = record
      .consensus_pubkey
      .ok_or(AttestationError::BadSignature)?;
    if !key.verify(&attestation.digest(), &attestation.signature) {
      return Err(AttestationError::BadSignature);
    }

    // conflicting vote at the same height is a slashable offence
    if let Some(conflict) = self.find_conflict(&attestation) {
      warn!(
        "{} attested two hashes at height {}",
        attestation.validator, attestation.block_index
      );
      return Ok(FinalityEvent::Conflict(Box::new(conflict)));
    }

    let key = (attestation.block_index, attestation.block_hash.clone());
    let votes = self.pending.entry(key.clone()).or_default();
    votes.insert(attestation.validator.clone(), attestation);

    // stake-weighted tally against the 2/3 threshold
    let attested: Amount = votes
      .keys()
      .filter_map(|operator| staking.get(operator))
      .filter(|record| record.active)
      .map(|record| record.effective_stake())
      .sum();

    let total = staking.total_active_stake();
    let threshold = Amount::from_units((total.units() as u128 * 2 / 3) as u64);
    if !total.is_zero() && attested >= threshold {
      let (index, hash) = key;
      self.finalized.insert(index, hash.clone());
      if index > self.highest {
        self.highest = index;
      }
      // votes below the new finality line are settled
      self.pending.retain(|(height, _), _| *height > index);
      return Ok(FinalityEvent::Finalized {
        index,
        hash,
        attested,
      });
    }

    Ok(FinalityEvent::Counted)
  }

  fn find_conflict(
    &self,
    attestation: &Attestation,
  ) -> Option<DoubleSignEvidence> {
    let (index, validator) = (attestation.block_index, &attestation.validator);
    for ((height, hash), votes) in &self.pending {
      if *height != index || *hash == attestation.block_hash {
        continue;
      }
      if let Some(previous) = votes.get(validator) {
        return Some(DoubleSignEvidence {
          producer: validator.clone(),
          index,
          slot: index,
          first: BlockSeal {
            hash: previous.block_hash.clone(),
            signature: previous.signature.clone(),
          },
          second: BlockSeal {
            hash: attestation.block_hash.clone(),
            signature: attestation.signature.clone(),
          },
          attestations: true,
        });
      }
    }
    None
  }

  /// Highest finalized height so far.
  pub fn highest(&self) -> u64 {
    self.highest
  }

  pub fn finalized_hash(&self, height: u64) -> Option<&str> {
    self.finalized.get(&height).map(String::as_str)
  }

  pub fn is_finalized(&self, height: u64) -> bool {
    self.finalized.contains_key(&height)
  }
}
