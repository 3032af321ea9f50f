use {
  super::hash::sha256_hex,
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
  },
  thiserror::Error,
};

/// Length of the hex suffix derived from the account public key.
const SUFFIX_LEN: usize = 40;

/// Network prefixes recognized by this node software.
const PREFIXES: [&str; 2] = ["tLVE", "LVE"];

/// An account address.
///
/// Addresses are a network prefix (`LVE` on mainnet, `tLVE` on test
/// networks) followed by the first 40 hex characters of the SHA-256
/// digest of the hex-encoded account public key. They identify wallet
/// accounts and validator operators; balances are never embedded in
/// the address itself.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AddressError {
  #[error("unknown address prefix in {0}")]
  UnknownPrefix(String),

  #[error("malformed address suffix in {0}")]
  MalformedSuffix(String),
}

impl Address {
  /// Derives the address of a public key on the given network.
  ///
  /// The digest is taken over the lowercase hex encoding of the
  /// public key bytes, not the bytes themselves. This matches the
  /// signature verification path which recovers the key and then
  /// re-derives the address.
  pub fn from_public_key(prefix: &str, pubkey_hex: &str) -> Self {
    let digest = sha256_hex(pubkey_hex.as_bytes());
    Self(format!("{prefix}{}", &digest[..SUFFIX_LEN]))
  }

  /// The 40 hex characters that commit to the account public key.
  pub fn suffix(&self) -> &str {
    &self.0[self.0.len() - SUFFIX_LEN..]
  }

  pub fn prefix(&self) -> &str {
    &self.0[..self.0.len() - SUFFIX_LEN]
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Display for Address {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl Debug for Address {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Address({})", self.0)
  }
}

impl FromStr for Address {
  type Err = AddressError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let prefix = PREFIXES
      .iter()
      .find(|p| s.starts_with(*p) && s.len() == p.len() + SUFFIX_LEN)
      .ok_or_else(|| AddressError::UnknownPrefix(s.to_owned()))?;

    let suffix = &s[prefix.len()..];
    if !suffix
      .bytes()
      .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
      return Err(AddressError::MalformedSuffix(s.to_owned()));
    }

    Ok(Self(s.to_owned()))
  }
}

impl Serialize for Address {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.0)
  }
}

impl<'de> Deserialize<'de> for Address {
  fn deserialize<D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Self, D::Error> {
    let literal = String::deserialize(deserializer)?;
    literal.parse().map_err(de::Error::custom)
  }
}

#[cfg(test)]
mod test {
  use super::Address;

  #[test]
  fn derive_and_parse() {
    let addr = Address::from_public_key("tLVE", "02abcdef");
    assert_eq!(addr.prefix(), "tLVE");
    assert_eq!(addr.suffix().len(), 40);

    let reparsed: Address = addr.as_str().parse().unwrap();
    assert_eq!(reparsed, addr);
  }

  #[test]
  fn rejects_malformed() {
    assert!("LVE".parse::<Address>().is_err());
    assert!("XYZ0000000000000000000000000000000000000000"
      .parse::<Address>()
      .is_err());
    // uppercase hex is not canonical
    assert!("LVEABCDEF00000000000000000000000000000000ab"
      .parse::<Address>()
      .is_err());
    // valid shape
    assert!("LVE0123456789abcdef0123456789abcdef01234567"
      .parse::<Address>()
      .is_ok());
  }

  #[test]
  fn deterministic_derivation() {
    let a = Address::from_public_key("LVE", "02aa");
    let b = Address::from_public_key("LVE", "02aa");
    let c = Address::from_public_key("LVE", "02ab");
    assert_eq!(a, b);
    assert_ne!(a, c);
  }
}
