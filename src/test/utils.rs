//! Shared test fixtures: deterministic genesis configurations,
//! funded wallets and a driver that produces valid blocks with
//! whichever validator the election picks.

use {
  crate::{
    consensus::{elect_producer, Chain},
    ledger::{
      Block, GenesisBalance, GenesisConfig, GenesisValidator, Transaction,
      TxData, TxTarget, TxType,
    },
    primitives::{Address, Amount, Keypair, WalletKeypair},
    storage::{MemStore, Storage},
  },
  chrono::TimeZone,
  std::collections::HashMap,
};

pub const CHAIN_ID: &str = "lvenc-testnet-1";
pub const GENESIS_MS: i64 = 1_767_225_600_000;
pub const SLOT_MS: i64 = 30_000;

pub fn testnet_genesis(faucet: &Address) -> GenesisConfig {
  GenesisConfig::new(
    CHAIN_ID,
    chrono::Utc.timestamp_millis_opt(GENESIS_MS).unwrap(),
    "tLVE",
    faucet.clone(),
    Amount::from_whole(1_000_000),
  )
}

/// Adds `count` bonded validators with fresh consensus keys and
/// returns their signing keys keyed by operator address.
pub fn add_validators(
  genesis: &mut GenesisConfig,
  count: usize,
  stake: Amount,
) -> HashMap<Address, Keypair> {
  let mut keys = HashMap::new();
  for i in 0..count {
    let keypair = Keypair::generate();
    let operator = Address::from_public_key("tLVE", &format!("02op{i}"));
    genesis.validators.push(GenesisValidator {
      operator_address: operator.clone(),
      consensus_pubkey: keypair.public(),
      power: stake,
      commission_bps: 0,
      moniker: Some(format!("validator-{i}")),
    });
    keys.insert(operator, keypair);
  }
  keys
}

pub fn fund(genesis: &mut GenesisConfig, address: &Address, amount: Amount) {
  genesis.initial_balances.push(GenesisBalance {
    address: address.clone(),
    amount,
  });
}

pub fn fund_usdt(
  genesis: &mut GenesisConfig,
  address: &Address,
  amount: Amount,
) {
  genesis.initial_usdt_balances.push(GenesisBalance {
    address: address.clone(),
    amount,
  });
}

pub fn signed_tx(
  wallet: &WalletKeypair,
  tx_type: TxType,
  to: TxTarget,
  amount: Amount,
  fee: Amount,
  nonce: u64,
  data: Option<TxData>,
) -> Transaction {
  let mut tx = Transaction::build(
    tx_type,
    wallet.address("tLVE"),
    to,
    amount,
    fee,
    GENESIS_MS + nonce as i64,
    nonce,
    CHAIN_ID,
    data,
  );
  tx.sign(wallet);
  tx
}

/// Drives a chain forward with whichever validator the election
/// picks for each successive slot. Every appended block also goes
/// through the in-memory [`Storage`] implementation, the same way
/// the node persists to its sled store.
pub struct TestChain {
  pub chain: Chain,
  pub keys: HashMap<Address, Keypair>,
  pub store: MemStore,
}

impl TestChain {
  pub fn new(genesis: &GenesisConfig, keys: HashMap<Address, Keypair>) -> Self {
    let chain = Chain::new(genesis);
    let store = MemStore::default();
    store.save_block(chain.tip()).expect("in-memory save");
    Self { chain, keys, store }
  }

  /// Builds, seals and appends one block carrying `txs`. Panics if
  /// the block does not validate, which in tests means the fixture
  /// built an invalid transaction.
  pub fn produce(&mut self, txs: Vec<Transaction>) -> Block {
    self.produce_at_slot(txs, self.chain.tip().slot + 1)
  }

  pub fn produce_at_slot(
    &mut self,
    txs: Vec<Transaction>,
    slot: u64,
  ) -> Block {
    let block = self.sealed_candidate(txs, slot);
    self
      .chain
      .append(block.clone(), block.timestamp + 1)
      .expect("fixture produced an invalid block");
    self.store.save_block(&block).expect("in-memory save");
    block
  }

  /// Seals a candidate for an arbitrary slot without appending it.
  pub fn sealed_candidate(
    &self,
    txs: Vec<Transaction>,
    slot: u64,
  ) -> Block {
    let tip = self.chain.tip();
    let elected = elect_producer(
      &tip.hash,
      slot,
      self.chain.ledger().staking.active_set(),
    )
    .expect("an active validator exists")
    .operator
    .clone();

    let timestamp = GENESIS_MS + slot as i64 * SLOT_MS;
    let mut block = Block::assemble(
      tip.index + 1,
      timestamp,
      tip.hash.clone(),
      txs,
      elected.clone(),
      slot,
    );
    block.seal(CHAIN_ID, &self.keys[&elected]);
    block
  }

  /// Produces empty blocks until the chain reaches `height`.
  pub fn grow_to(&mut self, height: u64) {
    while self.chain.height() < height {
      self.produce(vec![]);
    }
  }

  /// Snapshots ledger and finality into the store, like the node's
  /// periodic persistence tick.
  pub fn persist(&self) {
    self
      .store
      .save_snapshot(self.chain.ledger())
      .expect("in-memory save");
    self
      .store
      .save_finality(self.chain.finality())
      .expect("in-memory save");
  }

  /// Rebuilds a chain from the stored block log, the restart path.
  pub fn restore(&self) -> Chain {
    let blocks = self.store.load_blocks().expect("in-memory load");
    let finality = self
      .store
      .load_finality()
      .expect("in-memory load")
      .unwrap_or_default();
    Chain::from_blocks(self.chain.genesis(), blocks, finality)
      .expect("stored chain replays")
  }
}
