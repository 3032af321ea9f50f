//! Automated Market Maker
//!
//! A single two-asset constant-product pool (LVE / USDT) executed
//! deterministically from transaction payloads addressed to the
//! reserved `POOL` target. All math is integer fixed-point on raw
//! units; division truncates toward zero, and the truncation always
//! errs in the pool's favour so that the product of the reserves
//! never decreases.

use {
  crate::primitives::{Address, Amount},
  serde::{Deserialize, Serialize},
  std::collections::BTreeMap,
  thiserror::Error,
};

/// Swap fee: 30 basis points charged on the input amount.
const FEE_NUMERATOR: u64 = 997;
const FEE_DENOMINATOR: u64 = 1000;

/// Share of the LVE-denominated swap fee that is burned.
pub const SWAP_FEE_BURN_BPS: u64 = 3000;

/// Relative tolerance for imbalanced liquidity adds, in percent.
const ADD_TOLERANCE_PERCENT: u128 = 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
  #[error("pool is not initialized")]
  Uninitialized,

  #[error("pool is already initialized")]
  AlreadyInitialized,

  #[error("sender is not authorized to initialize the pool")]
  Unauthorized,

  #[error("insufficient liquidity for this operation")]
  InsufficientLiquidity,

  #[error("swap output below the requested minimum")]
  SlippageExceeded,

  #[error("zero amount")]
  ZeroAmount,

  #[error("add ratio deviates more than 1% from the pool ratio")]
  ImbalancedAdd,
}

/// The two sides of the pool.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash,
)]
pub enum PoolToken {
  #[serde(rename = "LVE")]
  Lve,
  #[serde(rename = "USDT")]
  Usdt,
}

/// A pool operation decoded from a POOL_OP transaction payload.
///
/// On the wire these are objects with an integer `op` discriminant
/// and named operands, e.g. `{"op":4,"tokenIn":"LVE","amountIn":
/// "1000","minOut":"49000"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolInstruction {
  /// One-shot bootstrap by the authorized liquidity provider.
  Initialize { amount_a: Amount, amount_b: Amount },

  /// Proportional deposit, minting LP shares.
  AddLiquidity { amount_a: Amount, amount_b: Amount },

  /// Burns LP shares for a proportional withdrawal.
  RemoveLiquidity { lp_amount: Amount },

  /// Constant-product swap with a slippage floor.
  Swap {
    token_in: PoolToken,
    amount_in: Amount,
    min_out: Amount,
  },
}

impl PoolInstruction {
  pub const OP_INITIALIZE: u8 = 1;
  pub const OP_ADD_LIQUIDITY: u8 = 2;
  pub const OP_REMOVE_LIQUIDITY: u8 = 3;
  pub const OP_SWAP: u8 = 4;
}

/// Wire form of [`PoolInstruction`]: integer opcode plus the union
/// of all operand fields.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInstruction {
  op: u8,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  amount_a: Option<Amount>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  amount_b: Option<Amount>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  lp_amount: Option<Amount>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  token_in: Option<PoolToken>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  amount_in: Option<Amount>,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  min_out: Option<Amount>,
}

impl Serialize for PoolInstruction {
  fn serialize<S: serde::Serializer>(
    &self,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    let mut raw = RawInstruction {
      op: 0,
      amount_a: None,
      amount_b: None,
      lp_amount: None,
      token_in: None,
      amount_in: None,
      min_out: None,
    };
    match *self {
      PoolInstruction::Initialize { amount_a, amount_b } => {
        raw.op = Self::OP_INITIALIZE;
        raw.amount_a = Some(amount_a);
        raw.amount_b = Some(amount_b);
      }
      PoolInstruction::AddLiquidity { amount_a, amount_b } => {
        raw.op = Self::OP_ADD_LIQUIDITY;
        raw.amount_a = Some(amount_a);
        raw.amount_b = Some(amount_b);
      }
      PoolInstruction::RemoveLiquidity { lp_amount } => {
        raw.op = Self::OP_REMOVE_LIQUIDITY;
        raw.lp_amount = Some(lp_amount);
      }
      PoolInstruction::Swap {
        token_in,
        amount_in,
        min_out,
      } => {
        raw.op = Self::OP_SWAP;
        raw.token_in = Some(token_in);
        raw.amount_in = Some(amount_in);
        raw.min_out = Some(min_out);
      }
    }
    raw.serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for PoolInstruction {
  fn deserialize<D: serde::Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Self, D::Error> {
    use serde::de::Error;
    let raw = RawInstruction::deserialize(deserializer)?;
    let missing = || D::Error::custom("missing pool operand");
    Ok(match raw.op {
      Self::OP_INITIALIZE => PoolInstruction::Initialize {
        amount_a: raw.amount_a.ok_or_else(missing)?,
        amount_b: raw.amount_b.ok_or_else(missing)?,
      },
      Self::OP_ADD_LIQUIDITY => PoolInstruction::AddLiquidity {
        amount_a: raw.amount_a.ok_or_else(missing)?,
        amount_b: raw.amount_b.ok_or_else(missing)?,
      },
      Self::OP_REMOVE_LIQUIDITY => PoolInstruction::RemoveLiquidity {
        lp_amount: raw.lp_amount.ok_or_else(missing)?,
      },
      Self::OP_SWAP => PoolInstruction::Swap {
        token_in: raw.token_in.ok_or_else(missing)?,
        amount_in: raw.amount_in.ok_or_else(missing)?,
        min_out: raw.min_out.ok_or_else(missing)?,
      },
      other => {
        return Err(D::Error::custom(format!("unknown pool opcode {other}")))
      }
    })
  }
}

/// Result of a swap, used by the ledger to settle balances and
/// route the burnable share of the fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapOutcome {
  pub amount_out: Amount,

  /// The full fee, denominated in the input token.
  pub fee: Amount,

  /// The LVE share of the fee eligible for burning (zero when the
  /// input token is USDT). The ledger caps it against the epoch
  /// burn budget and calls [`PoolState::burn_from_reserve`] with
  /// whatever survives the cap.
  pub burnable: Amount,
}

/// State of the constant-product pool. Part of the replayed ledger.
#[derive(
  Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
  pub initialized: bool,
  pub reserve_a: Amount,
  pub reserve_b: Amount,
  pub lp_total: Amount,
  pub lp_balances: BTreeMap<Address, Amount>,
}

impl PoolState {
  /// The constant-product invariant over raw units.
  pub fn k(&self) -> u128 {
    self.reserve_a.units() as u128 * self.reserve_b.units() as u128
  }

  /// First liquidity deposit. Sets the starting price and mints
  /// `floor(sqrt(a*b))` LP units to the provider.
  pub fn initialize(
    &mut self,
    provider: &Address,
    amount_a: Amount,
    amount_b: Amount,
  ) -> Result<Amount, PoolError> {
    if self.initialized {
      return Err(PoolError::AlreadyInitialized);
    }
    if amount_a.is_zero() || amount_b.is_zero() {
      return Err(PoolError::ZeroAmount);
    }

    let minted = Amount::from_units(isqrt(
      amount_a.units() as u128 * amount_b.units() as u128,
    ));

    self.initialized = true;
    self.reserve_a = amount_a;
    self.reserve_b = amount_b;
    self.lp_total = minted;
    self.lp_balances.insert(provider.clone(), minted);
    Ok(minted)
  }

  /// Deposits `(a, b)` at the current pool ratio (within 1%) and
  /// mints LP proportional to the smaller side.
  pub fn add_liquidity(
    &mut self,
    provider: &Address,
    amount_a: Amount,
    amount_b: Amount,
  ) -> Result<Amount, PoolError> {
    if !self.initialized {
      return Err(PoolError::Uninitialized);
    }
    if amount_a.is_zero() || amount_b.is_zero() {
      return Err(PoolError::ZeroAmount);
    }

    // a/reserve_a must match b/reserve_b within the tolerance,
    // compared by cross multiplication to stay in integers.
    let lhs = amount_a.units() as u128 * self.reserve_b.units() as u128;
    let rhs = amount_b.units() as u128 * self.reserve_a.units() as u128;
    let bound = rhs / 100 * ADD_TOLERANCE_PERCENT;
    if lhs.abs_diff(rhs) > bound {
      return Err(PoolError::ImbalancedAdd);
    }

    let minted = std::cmp::min(
      amount_a
        .mul_div(self.lp_total.units(), self.reserve_a.units())
        .ok_or(PoolError::InsufficientLiquidity)?,
      amount_b
        .mul_div(self.lp_total.units(), self.reserve_b.units())
        .ok_or(PoolError::InsufficientLiquidity)?,
    );
    if minted.is_zero() {
      return Err(PoolError::InsufficientLiquidity);
    }

    self.reserve_a = self
      .reserve_a
      .checked_add(amount_a)
      .ok_or(PoolError::InsufficientLiquidity)?;
    self.reserve_b = self
      .reserve_b
      .checked_add(amount_b)
      .ok_or(PoolError::InsufficientLiquidity)?;
    self.lp_total = self
      .lp_total
      .checked_add(minted)
      .ok_or(PoolError::InsufficientLiquidity)?;

    let share = self
      .lp_balances
      .entry(provider.clone())
      .or_insert(Amount::ZERO);
    *share = share
      .checked_add(minted)
      .ok_or(PoolError::InsufficientLiquidity)?;
    Ok(minted)
  }

  /// Burns LP shares and returns the proportional reserves.
  pub fn remove_liquidity(
    &mut self,
    provider: &Address,
    lp_amount: Amount,
  ) -> Result<(Amount, Amount), PoolError> {
    if !self.initialized {
      return Err(PoolError::Uninitialized);
    }
    if lp_amount.is_zero() {
      return Err(PoolError::ZeroAmount);
    }

    let share = self
      .lp_balances
      .get(provider)
      .copied()
      .unwrap_or(Amount::ZERO);
    if share < lp_amount || self.lp_total < lp_amount {
      return Err(PoolError::InsufficientLiquidity);
    }

    let out_a = self
      .reserve_a
      .mul_div(lp_amount.units(), self.lp_total.units())
      .ok_or(PoolError::InsufficientLiquidity)?;
    let out_b = self
      .reserve_b
      .mul_div(lp_amount.units(), self.lp_total.units())
      .ok_or(PoolError::InsufficientLiquidity)?;

    self.reserve_a = self.reserve_a.saturating_sub(out_a);
    self.reserve_b = self.reserve_b.saturating_sub(out_b);
    self.lp_total = self.lp_total.saturating_sub(lp_amount);

    let remaining = share.saturating_sub(lp_amount);
    if remaining.is_zero() {
      self.lp_balances.remove(provider);
    } else {
      self.lp_balances.insert(provider.clone(), remaining);
    }
    Ok((out_a, out_b))
  }

  /// Constant-product swap. The 0.30% fee is charged on the input
  /// and stays in the reserves; the reserve product strictly
  /// increases on every successful swap, and still increases after
  /// the caller burns the LVE fee share out of the reserve.
  pub fn swap(
    &mut self,
    token_in: PoolToken,
    amount_in: Amount,
    min_out: Amount,
  ) -> Result<SwapOutcome, PoolError> {
    if !self.initialized {
      return Err(PoolError::Uninitialized);
    }
    if amount_in.is_zero() {
      return Err(PoolError::ZeroAmount);
    }

    let (reserve_in, reserve_out) = match token_in {
      PoolToken::Lve => (self.reserve_a, self.reserve_b),
      PoolToken::Usdt => (self.reserve_b, self.reserve_a),
    };

    let after_fee = amount_in
      .mul_div(FEE_NUMERATOR, FEE_DENOMINATOR)
      .ok_or(PoolError::InsufficientLiquidity)?;
    let fee = amount_in.saturating_sub(after_fee);

    let denominator = reserve_in
      .checked_add(after_fee)
      .ok_or(PoolError::InsufficientLiquidity)?;
    let amount_out = reserve_out
      .mul_div(after_fee.units(), denominator.units())
      .ok_or(PoolError::InsufficientLiquidity)?;

    if amount_out < min_out {
      return Err(PoolError::SlippageExceeded);
    }
    if amount_out >= reserve_out {
      return Err(PoolError::InsufficientLiquidity);
    }

    let burnable = match token_in {
      PoolToken::Lve => fee.bps(SWAP_FEE_BURN_BPS),
      PoolToken::Usdt => Amount::ZERO,
    };

    let k_before = self.k();
    match token_in {
      PoolToken::Lve => {
        self.reserve_a = self
          .reserve_a
          .checked_add(amount_in)
          .ok_or(PoolError::InsufficientLiquidity)?;
        self.reserve_b = self.reserve_b.saturating_sub(amount_out);
      }
      PoolToken::Usdt => {
        self.reserve_b = self
          .reserve_b
          .checked_add(amount_in)
          .ok_or(PoolError::InsufficientLiquidity)?;
        self.reserve_a = self.reserve_a.saturating_sub(amount_out);
      }
    }
    debug_assert!(self.k() > k_before);

    Ok(SwapOutcome {
      amount_out,
      fee,
      burnable,
    })
  }

  /// Removes burned fee share from the LVE reserve. The amount must
  /// come from [`SwapOutcome::burnable`] (possibly reduced by the
  /// epoch burn cap), which keeps the reserve product above its
  /// pre-swap value.
  pub fn burn_from_reserve(&mut self, amount: Amount) {
    self.reserve_a = self.reserve_a.saturating_sub(amount);
  }
}

/// Integer square root, rounding down.
fn isqrt(value: u128) -> u64 {
  if value == 0 {
    return 0;
  }
  let mut x = value;
  let mut y = (x + 1) / 2;
  while y < x {
    x = y;
    y = (x + value / x) / 2;
  }
  x as u64
}

#[cfg(test)]
mod test {
  use {
    super::{isqrt, PoolError, PoolInstruction, PoolState, PoolToken},
    crate::primitives::{Address, Amount},
  };

  fn provider() -> Address {
    Address::from_public_key("tLVE", "02provider")
  }

  fn seeded_pool() -> PoolState {
    let mut pool = PoolState::default();
    pool
      .initialize(
        &provider(),
        Amount::from_whole(100_000),
        Amount::from_whole(5_000_000),
      )
      .unwrap();
    pool
  }

  #[test]
  fn isqrt_exact_and_floor() {
    assert_eq!(isqrt(0), 0);
    assert_eq!(isqrt(1), 1);
    assert_eq!(isqrt(4), 2);
    assert_eq!(isqrt(15), 3);
    assert_eq!(isqrt(10_000_000_000_000), 3_162_277);
  }

  #[test]
  fn initialize_mints_geometric_mean() {
    let pool = seeded_pool();
    // sqrt(100_000e6 * 5_000_000e6) units
    assert_eq!(pool.lp_total, Amount::from_units(707_106_781_186));
    assert_eq!(pool.lp_balances[&provider()], pool.lp_total);
    assert!(pool
      .clone()
      .initialize(&provider(), Amount::from_whole(1), Amount::from_whole(1))
      .is_err());
  }

  #[test]
  fn swap_quotes_and_increases_k() {
    let mut pool = seeded_pool();
    let k_before = pool.k();
    let outcome = pool
      .swap(
        PoolToken::Lve,
        Amount::from_whole(1000),
        Amount::from_whole(49_000),
      )
      .unwrap();

    // in after fee = 997 LVE, out = 5_000_000 * 997 / 100_997
    assert_eq!(outcome.fee, Amount::from_whole(3));
    assert_eq!(outcome.burnable, Amount::from_units(900_000));
    assert_eq!(
      outcome.amount_out,
      Amount::from_whole(5_000_000)
        .mul_div(997 * 1_000_000, 100_997 * 1_000_000)
        .unwrap()
    );
    assert!(pool.k() > k_before);
    assert_eq!(pool.reserve_a, Amount::from_whole(101_000));

    // burning the fee share still leaves k above its pre-swap value
    pool.burn_from_reserve(outcome.burnable);
    assert_eq!(pool.reserve_a, Amount::from_units(100_999_100_000));
    assert!(pool.k() > k_before);
  }

  #[test]
  fn swap_slippage_guard() {
    let mut pool = seeded_pool();
    let err = pool
      .swap(
        PoolToken::Lve,
        Amount::from_whole(1000),
        Amount::from_whole(50_000),
      )
      .unwrap_err();
    assert_eq!(err, PoolError::SlippageExceeded);
  }

  #[test]
  fn usdt_swaps_burn_nothing() {
    let mut pool = seeded_pool();
    let outcome = pool
      .swap(PoolToken::Usdt, Amount::from_whole(1000), Amount::ZERO)
      .unwrap();
    assert_eq!(outcome.burnable, Amount::ZERO);
    assert!(outcome.amount_out > Amount::ZERO);
  }

  #[test]
  fn add_and_remove_liquidity() {
    let mut pool = seeded_pool();
    let other = Address::from_public_key("tLVE", "02other");

    // balanced add at the pool ratio 1:50
    let minted = pool
      .add_liquidity(&other, Amount::from_whole(1000), Amount::from_whole(50_000))
      .unwrap();
    assert!(minted > Amount::ZERO);

    // imbalanced add is rejected
    assert_eq!(
      pool.add_liquidity(
        &other,
        Amount::from_whole(1000),
        Amount::from_whole(60_000)
      ),
      Err(PoolError::ImbalancedAdd)
    );

    let (out_a, out_b) = pool.remove_liquidity(&other, minted).unwrap();
    // proportional withdrawal returns what was deposited, modulo
    // truncation in the pool's favour
    assert!(out_a <= Amount::from_whole(1000));
    assert!(out_b <= Amount::from_whole(50_000));
    assert!(out_a >= Amount::from_units(999_999_000_000));
    assert!(pool.remove_liquidity(&other, minted).is_err());
  }

  #[test]
  fn remove_from_uninitialized_pool() {
    let mut pool = PoolState::default();
    assert_eq!(
      pool.remove_liquidity(&provider(), Amount::from_whole(1)),
      Err(PoolError::Uninitialized)
    );
    assert_eq!(
      pool.swap(PoolToken::Lve, Amount::from_whole(1), Amount::ZERO),
      Err(PoolError::Uninitialized)
    );
  }

  #[test]
  fn instruction_wire_form() {
    let swap = PoolInstruction::Swap {
      token_in: PoolToken::Lve,
      amount_in: Amount::from_whole(1000),
      min_out: Amount::from_whole(49_000),
    };
    let json = serde_json::to_string(&swap).unwrap();
    assert_eq!(
      json,
      r#"{"op":4,"tokenIn":"LVE","amountIn":"1000","minOut":"49000"}"#
    );
    let parsed: PoolInstruction = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, swap);

    let unknown = r#"{"op":9}"#;
    assert!(serde_json::from_str::<PoolInstruction>(unknown).is_err());
  }
}
