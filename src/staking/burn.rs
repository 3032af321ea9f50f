//! Burn accounting.
//!
//! Every token permanently removed from circulation is recorded here
//! with the reason it was burned. Fee and swap burns are subject to a
//! per-epoch cap expressed as a fraction of the total supply;
//! slashing burns are punitive and ignore the cap.

use {
  crate::primitives::Amount,
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
  tracing::warn,
};

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum BurnReason {
  TxFee,
  SwapFee,
  Slash,
}

/// Cumulative burn counters, part of the replayed ledger state.
#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct BurnState {
  totals: BTreeMap<BurnReason, Amount>,
  epoch_burned: Amount,
}

impl BurnState {
  /// How much of `amount` may still be burned this epoch under the
  /// given cap. The unburnable excess is the caller's to keep in
  /// circulation; the cap hit is logged and never silently diverges
  /// between nodes because the cap is a pure function of ledger
  /// state.
  pub fn burnable(&self, amount: Amount, epoch_cap: Amount) -> Amount {
    let headroom = epoch_cap.saturating_sub(self.epoch_burned);
    if amount > headroom {
      warn!(
        "burn cap hit: requested {amount}, headroom {headroom} of {epoch_cap}"
      );
    }
    std::cmp::min(amount, headroom)
  }

  /// Records a capped burn. Callers must have sized `amount` with
  /// [`burnable`] first.
  pub fn record(&mut self, reason: BurnReason, amount: Amount) {
    if amount.is_zero() {
      return;
    }
    let total = self.totals.entry(reason).or_insert(Amount::ZERO);
    *total = total.checked_add(amount).expect("burn counter overflow");
    self.epoch_burned = self
      .epoch_burned
      .checked_add(amount)
      .expect("burn counter overflow");
  }

  /// Records a slashing burn, which bypasses the epoch cap.
  pub fn record_slash(&mut self, amount: Amount) {
    if amount.is_zero() {
      return;
    }
    let total = self.totals.entry(BurnReason::Slash).or_insert(Amount::ZERO);
    *total = total.checked_add(amount).expect("burn counter overflow");
  }

  /// Epoch boundary: the capped-burn counter starts over.
  pub fn reset_epoch(&mut self) {
    self.epoch_burned = Amount::ZERO;
  }

  pub fn total(&self, reason: BurnReason) -> Amount {
    self.totals.get(&reason).copied().unwrap_or(Amount::ZERO)
  }

  pub fn total_burned(&self) -> Amount {
    self.totals.values().copied().sum()
  }
}

#[cfg(test)]
mod test {
  use super::{Amount, BurnReason, BurnState};

  #[test]
  fn cap_limits_fee_burns() {
    let mut burn = BurnState::default();
    let cap = Amount::from_whole(10);

    let first = burn.burnable(Amount::from_whole(7), cap);
    assert_eq!(first, Amount::from_whole(7));
    burn.record(BurnReason::TxFee, first);

    let second = burn.burnable(Amount::from_whole(7), cap);
    assert_eq!(second, Amount::from_whole(3));
    burn.record(BurnReason::SwapFee, second);

    assert_eq!(burn.burnable(Amount::from_whole(1), cap), Amount::ZERO);

    burn.reset_epoch();
    assert_eq!(
      burn.burnable(Amount::from_whole(1), cap),
      Amount::from_whole(1)
    );
    assert_eq!(burn.total_burned(), Amount::from_whole(10));
  }

  #[test]
  fn slash_burns_ignore_cap() {
    let mut burn = BurnState::default();
    burn.record_slash(Amount::from_whole(1_000_000));
    assert_eq!(
      burn.total(BurnReason::Slash),
      Amount::from_whole(1_000_000)
    );
    // cap accounting untouched
    assert_eq!(
      burn.burnable(Amount::from_whole(5), Amount::from_whole(5)),
      Amount::from_whole(5)
    );
  }
}
