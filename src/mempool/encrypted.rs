//! Private (encrypted) mempool
//!
//! Submitters who want their transaction contents hidden until
//! inclusion encrypt them with AES-256-GCM under a key derived from
//! the sender, the submission height and a per-block secret. An
//! entry becomes selectable one block after its submission height,
//! at which point the producer decrypts it and pushes the plaintext
//! through the normal public admission checks.
//!
//! Known limitation, inherited by design: the per-block secret is a
//! hash of the submission block's hash, so the key is derivable by
//! anyone as soon as that block is known. This delays exposure by
//! one block but is not a true commit-reveal scheme; replacing it
//! with threshold encryption needs a versioned protocol change.

use {
  crate::{
    ledger::Transaction,
    primitives::{sha256, Address},
  },
  aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
  },
  indexmap::IndexMap,
  serde::{Deserialize, Serialize},
  thiserror::Error,
  tracing::debug,
  uuid::Uuid,
};

/// Pending encrypted entries are capped at this many.
const MAX_PENDING: usize = 1000;

/// Entries older than this many blocks past their target are
/// dropped.
const RETENTION_BLOCKS: u64 = 100;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq)]
pub enum EncryptedPoolError {
  #[error("encrypted pool is full")]
  Full,

  #[error("duplicate encrypted submission")]
  DuplicateId,

  #[error("malformed encrypted payload")]
  Malformed,
}

/// An encrypted submission as it travels and sits in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedTransaction {
  pub id: Uuid,
  pub ciphertext: String,
  pub iv: String,
  pub auth_tag: String,
  pub sender: Address,
  pub submit_block: u64,
  pub timestamp: i64,
}

/// The per-block secret: derivable only once the hash of the block
/// at the submission height is known.
fn per_block_secret(block_hash: &str) -> [u8; 32] {
  sha256(format!("lvenc-mempool-secret:{block_hash}"))
}

/// The AES-256 key for one submission:
/// `SHA256(sender ‖ submitBlock ‖ perBlockSecret)`.
fn entry_key(sender: &Address, submit_block: u64, block_hash: &str) -> [u8; 32] {
  let secret = per_block_secret(block_hash);
  sha256(format!("{sender}{submit_block}{}", hex::encode(secret)))
}

impl EncryptedTransaction {
  /// Encrypts a signed transaction for delayed inclusion.
  /// `tip_hash` is the hash of the current chain tip, whose height
  /// is `submit_block`.
  pub fn seal(
    tx: &Transaction,
    sender: Address,
    submit_block: u64,
    tip_hash: &str,
    timestamp: i64,
  ) -> Result<Self, EncryptedPoolError> {
    let key = entry_key(&sender, submit_block, tip_hash);
    let cipher = Aes256Gcm::new((&key).into());

    let mut iv = [0u8; IV_LEN];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut iv);

    let plaintext =
      serde_json::to_vec(tx).map_err(|_| EncryptedPoolError::Malformed)?;
    let mut sealed = cipher
      .encrypt(Nonce::from_slice(&iv), Payload::from(plaintext.as_slice()))
      .map_err(|_| EncryptedPoolError::Malformed)?;

    // the AEAD appends the 16-byte tag; the wire format carries it
    // as a separate field
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(Self {
      id: tx.id,
      ciphertext: hex::encode(sealed),
      iv: hex::encode(iv),
      auth_tag: hex::encode(tag),
      sender,
      submit_block,
      timestamp,
    })
  }

  /// Decrypts with the key reconstructed from the submission-height
  /// block hash. Returns None on any tampering or key mismatch;
  /// failed private decryptions are never reported to anyone.
  pub fn open(&self, submit_block_hash: &str) -> Option<Transaction> {
    let key = entry_key(&self.sender, self.submit_block, submit_block_hash);
    let cipher = Aes256Gcm::new((&key).into());

    let iv = hex::decode(&self.iv).ok()?;
    if iv.len() != IV_LEN {
      return None;
    }
    let mut sealed = hex::decode(&self.ciphertext).ok()?;
    let tag = hex::decode(&self.auth_tag).ok()?;
    if tag.len() != TAG_LEN {
      return None;
    }
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
      .decrypt(Nonce::from_slice(&iv), Payload::from(sealed.as_slice()))
      .ok()?;
    serde_json::from_slice(&plaintext).ok()
  }
}

/// Holds encrypted submissions until they become eligible.
#[derive(Default)]
pub struct EncryptedPool {
  entries: IndexMap<Uuid, EncryptedTransaction>,
}

impl EncryptedPool {
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn add(
    &mut self,
    entry: EncryptedTransaction,
  ) -> Result<(), EncryptedPoolError> {
    if self.entries.len() >= MAX_PENDING {
      return Err(EncryptedPoolError::Full);
    }
    if self.entries.contains_key(&entry.id) {
      return Err(EncryptedPoolError::DuplicateId);
    }
    if hex::decode(&entry.iv).map(|iv| iv.len() != IV_LEN).unwrap_or(true) {
      return Err(EncryptedPoolError::Malformed);
    }
    self.entries.insert(entry.id, entry);
    Ok(())
  }

  /// Removes and decrypts every entry eligible at `height`
  /// (`submitBlock + 1 ≤ height`). `block_hash` resolves a height
  /// to the hash of the block there; undecryptable entries are
  /// dropped silently.
  pub fn drain_eligible(
    &mut self,
    height: u64,
    block_hash: impl Fn(u64) -> Option<String>,
  ) -> Vec<Transaction> {
    let eligible: Vec<Uuid> = self
      .entries
      .values()
      .filter(|entry| entry.submit_block + 1 <= height)
      .map(|entry| entry.id)
      .collect();

    let mut opened = Vec::new();
    for id in eligible {
      let entry = self.entries.shift_remove(&id).expect("collected above");
      match block_hash(entry.submit_block)
        .and_then(|hash| entry.open(&hash))
      {
        Some(tx) => opened.push(tx),
        None => debug!("dropping undecryptable private submission {id}"),
      }
    }
    opened
  }

  /// Drops entries that overstayed the retention window.
  pub fn prune(&mut self, height: u64) {
    self
      .entries
      .retain(|_, entry| entry.submit_block + RETENTION_BLOCKS >= height);
  }
}

#[cfg(test)]
mod test {
  use {
    super::{EncryptedPool, EncryptedPoolError, EncryptedTransaction},
    crate::{
      ledger::{Transaction, TxTarget, TxType},
      primitives::{Amount, WalletKeypair},
    },
  };

  fn sample_tx(wallet: &WalletKeypair) -> Transaction {
    let mut tx = Transaction::build(
      TxType::Transfer,
      wallet.address("tLVE"),
      TxTarget::Account(WalletKeypair::generate().address("tLVE")),
      Amount::from_whole(5),
      Amount::from_units(100_000),
      1_767_225_700_000,
      1,
      "lvenc-testnet-1",
      None,
    );
    tx.sign(wallet);
    tx
  }

  #[test]
  fn seal_open_roundtrip() {
    let wallet = WalletKeypair::generate();
    let tx = sample_tx(&wallet);
    let sealed = EncryptedTransaction::seal(
      &tx,
      wallet.address("tLVE"),
      41,
      "tiphash",
      0,
    )
    .unwrap();

    assert_eq!(sealed.open("tiphash").unwrap(), tx);

    // wrong block hash means wrong key
    assert!(sealed.open("otherhash").is_none());

    // a flipped ciphertext byte fails the tag
    let mut tampered = sealed.clone();
    let mut raw = hex::decode(&tampered.ciphertext).unwrap();
    raw[0] ^= 0xff;
    tampered.ciphertext = hex::encode(raw);
    assert!(tampered.open("tiphash").is_none());
  }

  #[test]
  fn eligibility_gate() {
    let wallet = WalletKeypair::generate();
    let tx = sample_tx(&wallet);
    let sealed = EncryptedTransaction::seal(
      &tx,
      wallet.address("tLVE"),
      41,
      "tiphash",
      0,
    )
    .unwrap();

    let mut pool = EncryptedPool::default();
    pool.add(sealed).unwrap();

    // not yet: the target block is the current one
    let lookup = |height: u64| (height == 41).then(|| "tiphash".to_owned());
    assert!(pool.drain_eligible(41, lookup).is_empty());
    assert_eq!(pool.len(), 1);

    // one block later it opens
    let opened = pool.drain_eligible(42, lookup);
    assert_eq!(opened, vec![tx]);
    assert!(pool.is_empty());
  }

  #[test]
  fn duplicate_and_prune() {
    let wallet = WalletKeypair::generate();
    let sealed = EncryptedTransaction::seal(
      &sample_tx(&wallet),
      wallet.address("tLVE"),
      10,
      "tiphash",
      0,
    )
    .unwrap();

    let mut pool = EncryptedPool::default();
    pool.add(sealed.clone()).unwrap();
    assert_eq!(pool.add(sealed), Err(EncryptedPoolError::DuplicateId));

    pool.prune(110);
    assert_eq!(pool.len(), 1);
    pool.prune(111);
    assert!(pool.is_empty());
  }
}
