//! Genesis
//!
//! The genesis configuration fully determines the first block. All
//! nodes configured with the same chain id, genesis time, faucet and
//! initial allocations compute bit-identical genesis blocks, which
//! is what lets strangers agree they are on the same network before
//! exchanging a single block.

use {
  super::{
    block::Block,
    transaction::{Transaction, TxTarget, TxType},
  },
  crate::{
    primitives::{Address, Amount, Pubkey},
    staking::EpochParams,
  },
  chrono::{DateTime, Utc},
  once_cell::sync::OnceCell,
  serde::{Deserialize, Serialize},
  std::{path::Path, time::Duration},
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum GenesisError {
  #[error("cannot read genesis file: {0}")]
  Io(#[from] std::io::Error),

  #[error("malformed genesis file: {0}")]
  Json(#[from] serde_json::Error),
}

/// A validator bonded at genesis. Its power is minted as bonded
/// self-stake and the validator is active from the first slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisValidator {
  pub operator_address: Address,
  pub consensus_pubkey: Pubkey,
  pub power: Amount,
  #[serde(default)]
  pub commission_bps: u16,
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub moniker: Option<String>,
}

/// An account funded at genesis, on top of the faucet allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisBalance {
  pub address: Address,
  pub amount: Amount,
}

/// Consensus-critical timing and validation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsensusParams {
  /// Interval at which a checkpoint pins `(height, hash)` against
  /// deep reorgs.
  pub checkpoint_interval: u64,

  /// How far into the future a block timestamp may run ahead of
  /// the local clock.
  pub clock_skew_ms: i64,

  /// Upper bound on transactions selected into one block.
  pub max_tx_per_block: usize,
}

impl Default for ConsensusParams {
  fn default() -> Self {
    Self {
      checkpoint_interval: 100,
      clock_skew_ms: 120_000,
      max_tx_per_block: 500,
    }
  }
}

/// The genesis configuration file (`genesis.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisConfig {
  /// Globally unique identifier of this network. Baked into every
  /// signature pre-image as replay protection across chains.
  pub chain_id: String,

  /// When the network starts; slots are counted from this instant.
  pub genesis_time: DateTime<Utc>,

  /// Wall-clock length of one producer slot.
  #[serde(with = "humantime_serde")]
  pub slot_interval: Duration,

  /// Address prefix of this network (`LVE` or `tLVE`).
  pub address_prefix: String,

  /// The account that receives the initial supply.
  pub faucet_address: Address,

  pub initial_supply: Amount,

  #[serde(default)]
  pub initial_balances: Vec<GenesisBalance>,

  /// USDT allocations for the liquidity side of the AMM.
  #[serde(default)]
  pub initial_usdt_balances: Vec<GenesisBalance>,

  /// The only account allowed to initialize the AMM pool. Falls
  /// back to the faucet when absent.
  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub liquidity_authority: Option<Address>,

  #[serde(default)]
  pub validators: Vec<GenesisValidator>,

  #[serde(default)]
  pub epoch_params: EpochParams,

  #[serde(default)]
  pub consensus_params: ConsensusParams,

  #[serde(skip)]
  cached_hash: OnceCell<String>,
}

impl PartialEq for GenesisConfig {
  fn eq(&self, other: &Self) -> bool {
    // the cache is not part of identity
    self.genesis_block() == other.genesis_block()
  }
}

impl GenesisConfig {
  /// A minimal configuration with canonical parameters. Callers
  /// fill in validators, balances and parameter overrides on the
  /// public fields before the first [`hash`] call.
  pub fn new(
    chain_id: impl Into<String>,
    genesis_time: DateTime<Utc>,
    address_prefix: impl Into<String>,
    faucet_address: Address,
    initial_supply: Amount,
  ) -> Self {
    Self {
      chain_id: chain_id.into(),
      genesis_time,
      slot_interval: Duration::from_secs(30),
      address_prefix: address_prefix.into(),
      faucet_address,
      initial_supply,
      initial_balances: Vec::new(),
      initial_usdt_balances: Vec::new(),
      liquidity_authority: None,
      validators: Vec::new(),
      epoch_params: EpochParams::default(),
      consensus_params: ConsensusParams::default(),
      cached_hash: OnceCell::new(),
    }
  }

  /// Builds the deterministic first block: a single system mint of
  /// the initial supply to the faucet. Validator powers and extra
  /// balances are seeded into ledger state directly by
  /// [`crate::ledger::Ledger::from_genesis`].
  pub fn genesis_block(&self) -> Block {
    let timestamp = self.genesis_time.timestamp_millis();
    let mint = Transaction::system(
      TxType::Transfer,
      TxTarget::Account(self.faucet_address.clone()),
      self.initial_supply,
      timestamp,
      &self.chain_id,
      None,
    );

    let mut block = Block {
      index: 0,
      timestamp,
      previous_hash: "0".to_owned(),
      transactions: vec![mint],
      nonce: 0,
      difficulty: 0,
      producer: None,
      slot: 0,
      producer_signature: None,
      hash: String::new(),
    };
    block.hash = block.compute_hash();
    block
  }

  /// The genesis block hash, computed once.
  pub fn hash(&self) -> &str {
    self
      .cached_hash
      .get_or_init(|| self.genesis_block().hash)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, GenesisError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
  }

  /// The account authorized to bootstrap the AMM pool.
  pub fn liquidity_authority(&self) -> &Address {
    self
      .liquidity_authority
      .as_ref()
      .unwrap_or(&self.faucet_address)
  }
}

#[cfg(test)]
mod test {
  use {
    super::GenesisConfig,
    crate::primitives::{Address, Amount},
    chrono::TimeZone,
  };

  fn testnet_genesis() -> GenesisConfig {
    GenesisConfig::new(
      "lvenc-testnet-1",
      chrono::Utc.timestamp_millis_opt(1_767_225_600_000).unwrap(),
      "tLVE",
      Address::from_public_key("tLVE", "02faucet"),
      Amount::from_whole(1_000_000),
    )
  }

  #[test]
  fn genesis_block_is_reproducible() {
    let first = testnet_genesis();
    let second = testnet_genesis();
    assert_eq!(first.genesis_block(), second.genesis_block());
    assert_eq!(first.hash(), second.hash());
    assert_eq!(first.genesis_block().index, 0);
    assert_eq!(first.genesis_block().previous_hash, "0");
  }

  #[test]
  fn different_chain_ids_diverge() {
    let testnet = testnet_genesis();
    let mut other = testnet_genesis();
    other.chain_id = "lvenc-testnet-2".to_owned();
    assert_ne!(testnet.hash(), other.hash());
  }

  #[test]
  fn json_roundtrip() {
    let genesis = testnet_genesis();
    let json = serde_json::to_string_pretty(&genesis).unwrap();
    let parsed: GenesisConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.hash(), genesis.hash());
  }
}
