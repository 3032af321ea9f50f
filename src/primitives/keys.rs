use {
  super::address::Address,
  ed25519_dalek::{PublicKey, SecretKey, Signer, Verifier},
  k256::elliptic_curve::sec1::ToEncodedPoint,
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Debug, Display, Formatter},
    ops::Deref,
    str::FromStr,
  },
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum KeypairError {
  #[error("failed parsing hex string: {0}")]
  HexParse(#[from] hex::FromHexError),

  #[error("{0}")]
  Ed25519(#[from] ed25519_dalek::ed25519::Error),

  #[error("malformed secp256k1 key or signature")]
  Secp256k1,

  #[error("signature verification failed")]
  BadSignature,
}

/// An Ed25519 public key.
///
/// Used for validator consensus keys (block and attestation
/// signatures) and for node p2p identities. The canonical textual
/// form is lowercase hex of the 32 key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
  /// Verifies an Ed25519 signature over a message.
  pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
    let bytes = match hex::decode(signature_hex) {
      Ok(bytes) => bytes,
      Err(_) => return false,
    };
    let signature = match ed25519_dalek::Signature::from_bytes(&bytes) {
      Ok(signature) => signature,
      Err(_) => return false,
    };
    match PublicKey::from_bytes(&self.0) {
      Ok(key) => key.verify(message, &signature).is_ok(),
      Err(_) => false,
    }
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

impl Deref for Pubkey {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", self.to_hex())
  }
}

impl FromStr for Pubkey {
  type Err = KeypairError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s)?;
    // also rejects wrong lengths and non-curve points
    let key = PublicKey::from_bytes(&bytes)?;
    Ok(key.into())
  }
}

impl From<PublicKey> for Pubkey {
  fn from(p: PublicKey) -> Self {
    Self(*p.as_bytes())
  }
}

impl Serialize for Pubkey {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Self, D::Error> {
    let literal = String::deserialize(deserializer)?;
    literal.parse().map_err(de::Error::custom)
  }
}

/// An Ed25519 keypair for consensus signing and p2p identity.
///
/// The secret never leaves this process except through the key file
/// written by the keygen tool.
pub struct Keypair(ed25519_dalek::Keypair);

impl Keypair {
  /// Generates a fresh keypair from the OS entropy source.
  pub fn generate() -> Self {
    let mut seed = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut seed);
    Self::try_from(&seed[..]).expect("32 random bytes are a valid seed")
  }

  pub fn public(&self) -> Pubkey {
    self.0.public.into()
  }

  /// Signs a message and returns the signature as hex.
  pub fn sign_hex(&self, message: &[u8]) -> String {
    hex::encode(self.0.sign(message).to_bytes())
  }

  /// Hex encoding of the 32-byte secret seed, the on-disk format
  /// of `identity.key`.
  pub fn secret_hex(&self) -> String {
    hex::encode(self.0.secret.as_bytes())
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self(ed25519_dalek::Keypair::from_bytes(&self.0.to_bytes()).unwrap())
  }
}

impl Debug for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Keypair").field(&self.public()).finish()
  }
}

impl Display for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Keypair({})", self.public())
  }
}

impl TryFrom<&[u8]> for Keypair {
  type Error = KeypairError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    let secret = SecretKey::from_bytes(value)?;
    let public: PublicKey = (&secret).into();
    Ok(Self(ed25519_dalek::Keypair { secret, public }))
  }
}

impl FromStr for Keypair {
  type Err = KeypairError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let secret = hex::decode(value.trim())?;
    Self::try_from(secret.as_slice())
  }
}

/// A secp256k1 wallet keypair.
///
/// Wallets sign transactions with recoverable ECDSA; the signature
/// alone is enough to recover the signing key during verification
/// and re-derive the sender address from it.
pub struct WalletKeypair(k256::ecdsa::SigningKey);

impl WalletKeypair {
  pub fn generate() -> Self {
    Self(k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng))
  }

  pub fn from_seed(seed: &[u8]) -> Result<Self, KeypairError> {
    k256::ecdsa::SigningKey::from_slice(seed)
      .map(Self)
      .map_err(|_| KeypairError::Secp256k1)
  }

  /// Compressed SEC1 encoding of the public key, lowercase hex.
  /// Account addresses are derived from this exact string.
  pub fn public_key_hex(&self) -> String {
    hex::encode(self.0.verifying_key().to_encoded_point(true).as_bytes())
  }

  pub fn address(&self, prefix: &str) -> Address {
    Address::from_public_key(prefix, &self.public_key_hex())
  }

  /// Signs a 32-byte digest, producing a 65-byte recoverable
  /// signature (r ‖ s ‖ recovery id) encoded as hex.
  pub fn sign_prehash_hex(&self, prehash: &[u8; 32]) -> String {
    let (signature, recovery) = self
      .0
      .sign_prehash_recoverable(prehash)
      .expect("signing a 32-byte digest cannot fail");
    let mut bytes = signature.to_bytes().to_vec();
    bytes.push(recovery.to_byte());
    hex::encode(bytes)
  }
}

impl Debug for WalletKeypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("WalletKeypair")
      .field(&self.public_key_hex())
      .finish()
  }
}

/// Recovers the hex-encoded compressed public key that produced a
/// recoverable signature over the given digest.
pub fn recover_signer_hex(
  prehash: &[u8; 32],
  signature_hex: &str,
) -> Result<String, KeypairError> {
  let bytes = hex::decode(signature_hex)?;
  if bytes.len() != 65 {
    return Err(KeypairError::Secp256k1);
  }
  let signature = k256::ecdsa::Signature::from_slice(&bytes[..64])
    .map_err(|_| KeypairError::Secp256k1)?;
  let recovery = k256::ecdsa::RecoveryId::from_byte(bytes[64])
    .ok_or(KeypairError::Secp256k1)?;

  let key = k256::ecdsa::VerifyingKey::recover_from_prehash(
    prehash, &signature, recovery,
  )
  .map_err(|_| KeypairError::BadSignature)?;

  Ok(hex::encode(key.to_encoded_point(true).as_bytes()))
}

#[cfg(test)]
mod test {
  use {
    super::{recover_signer_hex, Keypair, WalletKeypair},
    crate::primitives::sha256,
  };

  #[test]
  fn ed25519_sign_verify() {
    let keypair = Keypair::generate();
    let signature = keypair.sign_hex(b"message");
    assert!(keypair.public().verify(b"message", &signature));
    assert!(!keypair.public().verify(b"other message", &signature));
    assert!(!keypair.public().verify(b"message", "00aabb"));
  }

  #[test]
  fn keypair_hex_roundtrip() {
    let keypair = Keypair::generate();
    let restored: Keypair = keypair.secret_hex().parse().unwrap();
    assert_eq!(restored.public(), keypair.public());
  }

  #[test]
  fn wallet_recovery_matches_signer() {
    let wallet = WalletKeypair::generate();
    let digest = sha256(b"transfer preimage");
    let signature = wallet.sign_prehash_hex(&digest);

    let recovered = recover_signer_hex(&digest, &signature).unwrap();
    assert_eq!(recovered, wallet.public_key_hex());

    // a different digest recovers a different key
    let other = recover_signer_hex(&sha256(b"tampered"), &signature);
    assert!(other.map(|k| k != wallet.public_key_hex()).unwrap_or(true));
  }
}
