//! Blocks
//!
//! A block is an ordered batch of transactions sealed by the slot's
//! elected producer. The block hash commits to the index, timestamp,
//! transaction contents and parent hash; the producer signature
//! commits to the hash under the chain id for domain separation.

use {
  super::transaction::Transaction,
  crate::primitives::{sha256_hex, Address, Keypair, Pubkey},
  serde::{Deserialize, Serialize},
  std::fmt::{Display, Formatter},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
  pub index: u64,

  /// Milliseconds since the unix epoch.
  pub timestamp: i64,

  pub previous_hash: String,

  pub transactions: Vec<Transaction>,

  /// Legacy proof-of-work fields, always zero on PoS blocks but
  /// still part of the hash pre-image.
  pub nonce: u64,
  pub difficulty: u64,

  /// Operator address of the producing validator. `None` only on
  /// the genesis block.
  pub producer: Option<Address>,

  #[serde(rename = "slotNumber")]
  pub slot: u64,

  /// Ed25519 signature over `chainId:index:hash` by the producer's
  /// consensus key.
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub producer_signature: Option<String>,

  pub hash: String,
}

impl Block {
  /// An unsealed block; [`seal`] computes the hash and signature.
  pub fn assemble(
    index: u64,
    timestamp: i64,
    previous_hash: impl Into<String>,
    transactions: Vec<Transaction>,
    producer: Address,
    slot: u64,
  ) -> Self {
    Self {
      index,
      timestamp,
      previous_hash: previous_hash.into(),
      transactions,
      nonce: 0,
      difficulty: 0,
      producer: Some(producer),
      slot,
      producer_signature: None,
      hash: String::new(),
    }
  }

  /// `index ‖ timestamp ‖ Σ JSON(tx) ‖ previousHash ‖ nonce ‖
  /// difficulty`, hashed with SHA-256.
  pub fn compute_hash(&self) -> String {
    let mut preimage = format!("{}{}", self.index, self.timestamp);
    for tx in &self.transactions {
      preimage.push_str(&tx.canonical_json());
    }
    preimage.push_str(&self.previous_hash);
    preimage.push_str(&self.nonce.to_string());
    preimage.push_str(&self.difficulty.to_string());
    sha256_hex(preimage)
  }

  /// The producer-signed message for this block's hash.
  pub fn seal_message(chain_id: &str, index: u64, hash: &str) -> String {
    format!("{chain_id}:{index}:{hash}")
  }

  /// Computes the hash and signs it with the validator consensus
  /// key.
  pub fn seal(&mut self, chain_id: &str, keypair: &Keypair) {
    self.hash = self.compute_hash();
    let message = Self::seal_message(chain_id, self.index, &self.hash);
    self.producer_signature = Some(keypair.sign_hex(message.as_bytes()));
  }

  /// True when the stored hash matches the recomputed one.
  pub fn verify_hash(&self) -> bool {
    self.hash == self.compute_hash()
  }

  pub fn verify_producer_signature(
    &self,
    chain_id: &str,
    key: &Pubkey,
  ) -> bool {
    match &self.producer_signature {
      Some(signature) => {
        let message = Self::seal_message(chain_id, self.index, &self.hash);
        key.verify(message.as_bytes(), signature)
      }
      None => false,
    }
  }
}

impl Display for Block {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let short = self.hash.get(..8).unwrap_or(&self.hash);
    write!(
      f,
      "block {} [{}] ({} txs, slot {})",
      self.index,
      short,
      self.transactions.len(),
      self.slot
    )
  }
}

#[cfg(test)]
mod test {
  use {
    super::Block,
    crate::{
      ledger::transaction::{Transaction, TxTarget, TxType},
      primitives::{Amount, Keypair, WalletKeypair},
    },
  };

  fn sample_block() -> Block {
    let wallet = WalletKeypair::generate();
    let mut tx = Transaction::build(
      TxType::Transfer,
      wallet.address("tLVE"),
      TxTarget::Account(wallet.address("tLVE")),
      Amount::from_whole(5),
      Amount::from_units(100_000),
      1_767_225_630_000,
      1,
      "lvenc-testnet-1",
      None,
    );
    tx.sign(&wallet);
    Block::assemble(
      1,
      1_767_225_630_000,
      "0".repeat(64),
      vec![tx],
      wallet.address("tLVE"),
      17,
    )
  }

  #[test]
  fn seal_and_verify() {
    let keypair = Keypair::generate();
    let mut block = sample_block();
    block.seal("lvenc-testnet-1", &keypair);

    assert!(block.verify_hash());
    assert!(block.verify_producer_signature("lvenc-testnet-1", &keypair.public()));

    // domain separation: the same block under another chain id
    // does not verify
    assert!(!block.verify_producer_signature("lvenc-mainnet-1", &keypair.public()));

    // a foreign key does not verify
    assert!(!block
      .verify_producer_signature("lvenc-testnet-1", &Keypair::generate().public()));
  }

  #[test]
  fn hash_commits_to_contents() {
    let keypair = Keypair::generate();
    let mut block = sample_block();
    block.seal("lvenc-testnet-1", &keypair);

    let mut tampered = block.clone();
    tampered.transactions[0].amount = Amount::from_whole(500);
    assert!(!tampered.verify_hash());

    let mut shifted = block.clone();
    shifted.timestamp += 1;
    assert!(!shifted.verify_hash());

    assert!(block.verify_hash());
  }

  #[test]
  fn wire_roundtrip() {
    let keypair = Keypair::generate();
    let mut block = sample_block();
    block.seal("lvenc-testnet-1", &keypair);

    let json = serde_json::to_string(&block).unwrap();
    assert!(json.contains(r#""slotNumber":17"#));
    let parsed: Block = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, block);
    assert!(parsed.verify_hash());
  }
}
