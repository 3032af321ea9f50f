use {
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Debug, Display, Formatter},
    iter::Sum,
    str::FromStr,
  },
  thiserror::Error,
};

/// Number of raw units in one whole token.
///
/// All monetary values on this chain are integer multiples of
/// one millionth of a token. There is no floating point anywhere
/// in the ledger, hashing pre-images or the wire protocol.
pub const SCALE: u64 = 1_000_000;

const DECIMALS: u32 = 6;

/// A non-negative fixed-point token amount.
///
/// Internally a count of raw units at [`SCALE`] units per token.
/// The canonical textual form is a decimal string with no trailing
/// zeros ("100", "0.1", "49351.960188"). That form is used in JSON,
/// in transaction signature pre-images and in block hash pre-images,
/// so it must be identical on every node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(u64);

#[derive(Debug, Error, PartialEq)]
pub enum AmountError {
  #[error("invalid amount literal: {0}")]
  Malformed(String),

  #[error("amount overflow")]
  Overflow,
}

impl Amount {
  pub const ZERO: Amount = Amount(0);

  /// Constructs an amount from raw units.
  pub const fn from_units(units: u64) -> Self {
    Self(units)
  }

  /// Constructs an amount from a count of whole tokens.
  pub const fn from_whole(tokens: u64) -> Self {
    Self(tokens * SCALE)
  }

  pub const fn units(&self) -> u64 {
    self.0
  }

  pub const fn is_zero(&self) -> bool {
    self.0 == 0
  }

  pub fn checked_add(self, other: Amount) -> Option<Amount> {
    self.0.checked_add(other.0).map(Amount)
  }

  pub fn checked_sub(self, other: Amount) -> Option<Amount> {
    self.0.checked_sub(other.0).map(Amount)
  }

  pub fn saturating_sub(self, other: Amount) -> Amount {
    Amount(self.0.saturating_sub(other.0))
  }

  /// `self * numerator / denominator` with a 128-bit intermediate,
  /// truncating toward zero. Returns None when the denominator is
  /// zero or the result does not fit in 64 bits.
  pub fn mul_div(self, numerator: u64, denominator: u64) -> Option<Amount> {
    if denominator == 0 {
      return None;
    }
    let scaled = (self.0 as u128).checked_mul(numerator as u128)?
      / denominator as u128;
    u64::try_from(scaled).ok().map(Amount)
  }

  /// Basis-point fraction of this amount, truncating toward zero.
  pub fn bps(self, bps: u64) -> Amount {
    self.mul_div(bps, 10_000).unwrap_or(Amount::ZERO)
  }
}

impl Sum for Amount {
  fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
    iter.fold(Amount::ZERO, |acc, a| {
      acc.checked_add(a).expect("amount sum overflow")
    })
  }
}

impl Display for Amount {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let whole = self.0 / SCALE;
    let frac = self.0 % SCALE;
    if frac == 0 {
      write!(f, "{whole}")
    } else {
      let digits = format!("{frac:06}");
      write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
  }
}

impl Debug for Amount {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Amount({self})")
  }
}

impl FromStr for Amount {
  type Err = AmountError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let malformed = || AmountError::Malformed(s.to_owned());
    let (whole, frac) = match s.split_once('.') {
      Some((w, f)) => (w, f),
      None => (s, ""),
    };

    if whole.is_empty()
      || frac.len() > DECIMALS as usize
      || !whole.bytes().all(|b| b.is_ascii_digit())
      || !frac.bytes().all(|b| b.is_ascii_digit())
    {
      return Err(malformed());
    }

    let whole: u64 = whole.parse().map_err(|_| malformed())?;
    let mut frac_units = 0u64;
    if !frac.is_empty() {
      let padding = 10u64.pow(DECIMALS - frac.len() as u32);
      frac_units = frac.parse::<u64>().map_err(|_| malformed())? * padding;
    }

    whole
      .checked_mul(SCALE)
      .and_then(|w| w.checked_add(frac_units))
      .map(Amount)
      .ok_or(AmountError::Overflow)
  }
}

impl Serialize for Amount {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for Amount {
  fn deserialize<D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Self, D::Error> {
    let literal = String::deserialize(deserializer)?;
    literal.parse().map_err(de::Error::custom)
  }
}
