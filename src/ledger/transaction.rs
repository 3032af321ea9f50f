//! Transactions
//!
//! The canonical transaction model of the chain. Wallets sign a
//! fixed concatenation pre-image with recoverable secp256k1, so a
//! verifier needs nothing but the transaction itself to check that
//! the claimed sender authorized it.

use {
  crate::{
    amm::PoolInstruction,
    primitives::{
      recover_signer_hex, sha256, Address, Amount, KeypairError, Pubkey,
      WalletKeypair,
    },
    staking::DoubleSignEvidence,
  },
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Display, Formatter},
    str::FromStr,
  },
  thiserror::Error,
  uuid::Uuid,
};

#[derive(Debug, Error, PartialEq)]
pub enum TransactionError {
  #[error("transaction carries no signature")]
  MissingSignature,

  #[error("system transactions never carry signatures")]
  UnexpectedSignature,

  #[error("{0}")]
  Signature(String),

  #[error("recovered key does not derive the sender address {0}")]
  SenderMismatch(Address),
}

impl From<KeypairError> for TransactionError {
  fn from(e: KeypairError) -> Self {
    Self::Signature(e.to_string())
  }
}

/// The operations the core state machine understands.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
  Transfer,
  Stake,
  Unstake,
  Delegate,
  Undelegate,
  PoolOp,
}

/// Where a transaction is addressed: a regular account or one of
/// the reserved protocol targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TxTarget {
  Account(Address),
  StakePool,
  Pool,
}

impl TxTarget {
  pub fn account(&self) -> Option<&Address> {
    match self {
      TxTarget::Account(address) => Some(address),
      _ => None,
    }
  }
}

impl Display for TxTarget {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      TxTarget::Account(address) => Display::fmt(address, f),
      TxTarget::StakePool => f.write_str("STAKE_POOL"),
      TxTarget::Pool => f.write_str("POOL"),
    }
  }
}

impl FromStr for TxTarget {
  type Err = crate::primitives::AddressError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "STAKE_POOL" => Ok(TxTarget::StakePool),
      "POOL" => Ok(TxTarget::Pool),
      other => other.parse().map(TxTarget::Account),
    }
  }
}

impl From<Address> for TxTarget {
  fn from(address: Address) -> Self {
    TxTarget::Account(address)
  }
}

impl Serialize for TxTarget {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for TxTarget {
  fn deserialize<D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Self, D::Error> {
    let literal = String::deserialize(deserializer)?;
    literal.parse().map_err(de::Error::custom)
  }
}

/// Optional structured payload. Not covered by the signature
/// pre-image; everything that moves money is in the signed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TxData {
  /// Names the validator a DELEGATE/UNDELEGATE applies to.
  #[serde(rename_all = "camelCase")]
  Delegation { validator: Address },

  /// Registers consensus credentials alongside a STAKE.
  #[serde(rename_all = "camelCase")]
  Validator {
    consensus_pubkey: Pubkey,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    commission_bps: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    moniker: Option<String>,
  },

  /// Operands of a POOL_OP.
  Pool(PoolInstruction),

  /// Double-sign proof carried by a protocol-emitted transaction.
  Evidence(DoubleSignEvidence),
}

/// A signed value transfer or protocol operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
  pub id: Uuid,

  #[serde(rename = "type")]
  pub tx_type: TxType,

  /// `None` marks a system transaction emitted by the protocol
  /// itself (genesis mint, slashing evidence). Those bypass
  /// signature checks and are only ever created by block
  /// producers or the genesis builder.
  pub from: Option<Address>,

  pub to: TxTarget,
  pub amount: Amount,
  pub fee: Amount,

  /// Milliseconds since the unix epoch.
  pub timestamp: i64,

  /// Strictly increasing per sender, starting at 1.
  pub nonce: u64,

  pub chain_id: String,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub signature: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub data: Option<TxData>,
}

impl Transaction {
  /// An unsigned wallet transaction. Call [`sign`] before
  /// submitting it anywhere.
  #[allow(clippy::too_many_arguments)]
  pub fn build(
    tx_type: TxType,
    from: Address,
    to: TxTarget,
    amount: Amount,
    fee: Amount,
    timestamp: i64,
    nonce: u64,
    chain_id: impl Into<String>,
    data: Option<TxData>,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      tx_type,
      from: Some(from),
      to,
      amount,
      fee,
      timestamp,
      nonce,
      chain_id: chain_id.into(),
      signature: None,
      data,
    }
  }

  /// A protocol-emitted transaction. The id is derived from the
  /// content so that independently constructed copies (for example
  /// the genesis mint on every node) are identical.
  pub fn system(
    tx_type: TxType,
    to: TxTarget,
    amount: Amount,
    timestamp: i64,
    chain_id: impl Into<String>,
    data: Option<TxData>,
  ) -> Self {
    let chain_id = chain_id.into();
    let mut tx = Self {
      id: Uuid::nil(),
      tx_type,
      from: None,
      to,
      amount,
      fee: Amount::ZERO,
      timestamp,
      nonce: 0,
      chain_id,
      signature: None,
      data,
    };
    let digest = sha256(format!("system:{}", tx.signing_preimage()));
    tx.id = Uuid::from_bytes(digest[..16].try_into().unwrap());
    tx
  }

  pub fn is_system(&self) -> bool {
    self.from.is_none()
  }

  /// The signed concatenation:
  /// `from ‖ to ‖ amount ‖ fee ‖ timestamp ‖ nonce ‖ chainId`.
  pub fn signing_preimage(&self) -> String {
    format!(
      "{}{}{}{}{}{}{}",
      self
        .from
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_default(),
      self.to,
      self.amount,
      self.fee,
      self.timestamp,
      self.nonce,
      self.chain_id,
    )
  }

  pub fn signing_digest(&self) -> [u8; 32] {
    sha256(self.signing_preimage())
  }

  /// Signs with the wallet key. The caller must have set `from` to
  /// the wallet's own address, otherwise verification will fail.
  pub fn sign(&mut self, wallet: &WalletKeypair) {
    self.signature = Some(wallet.sign_prehash_hex(&self.signing_digest()));
  }

  /// Verifies the wallet signature and that the signing key derives
  /// the claimed sender address. System transactions pass as-is;
  /// whether a system transaction is acceptable in context is the
  /// ledger's decision.
  pub fn verify_signature(&self) -> Result<(), TransactionError> {
    let from = match &self.from {
      None => {
        return match self.signature {
          None => Ok(()),
          Some(_) => Err(TransactionError::UnexpectedSignature),
        }
      }
      Some(from) => from,
    };

    let signature = self
      .signature
      .as_deref()
      .ok_or(TransactionError::MissingSignature)?;

    let recovered = recover_signer_hex(&self.signing_digest(), signature)?;
    let derived = Address::from_public_key(from.prefix(), &recovered);
    if derived != *from {
      return Err(TransactionError::SenderMismatch(from.clone()));
    }
    Ok(())
  }

  /// The canonical JSON encoding used in block hash pre-images.
  pub fn canonical_json(&self) -> String {
    serde_json::to_string(self).expect("transaction serialization is total")
  }
}

impl Display for Transaction {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "tx({:?} {} -> {})", self.tx_type, self.id, self.to)
  }
}
