//! End-to-end scenarios exercising the whole state machine through
//! real blocks: genesis determinism, transfers with fee burning,
//! staking and election, double-sign slashing, the AMM and BFT
//! finality, plus the global ledger invariants.

use {
  super::utils::{
    add_validators, fund, fund_usdt, signed_tx, testnet_genesis, CHAIN_ID,
    TestChain,
  },
  crate::{
    amm::{PoolInstruction, PoolToken},
    consensus::{elect_producer, Attestation, ChainError},
    ledger::{Ledger, TxData, TxTarget, TxType},
    primitives::{Amount, Keypair, WalletKeypair},
    staking::BurnReason,
    storage::Storage,
  },
};

/// E1: all nodes configured alike compute the same genesis, with
/// the full supply sitting in the faucet.
#[test]
fn genesis_allocates_supply_to_the_faucet() {
  let faucet = WalletKeypair::generate().address("tLVE");
  let genesis = testnet_genesis(&faucet);
  let ledger = Ledger::from_genesis(&genesis);

  assert_eq!(ledger.balance(&faucet), Amount::from_whole(1_000_000));
  assert_eq!(ledger.total_supply, Amount::from_whole(1_000_000));
  assert_eq!(ledger.circulating_total(), ledger.total_supply);

  // byte-for-byte reproducible on an independently configured node
  let again = testnet_genesis(&faucet);
  assert_eq!(genesis.hash(), again.hash());
  assert_eq!(
    serde_json::to_string(&genesis.genesis_block()).unwrap(),
    serde_json::to_string(&again.genesis_block()).unwrap()
  );
}

/// E2: a transfer moves value, burns half the fee and pays the
/// other half to the producer.
#[test]
fn transfer_splits_the_fee() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");
  let recipient = WalletKeypair::generate().address("tLVE");

  let mut genesis = testnet_genesis(&faucet);
  let keys = add_validators(&mut genesis, 1, Amount::from_whole(200));
  let producer = keys.keys().next().unwrap().clone();

  let mut net = TestChain::new(&genesis, keys);
  let tx = signed_tx(
    &faucet_wallet,
    TxType::Transfer,
    TxTarget::Account(recipient.clone()),
    Amount::from_whole(100),
    "0.1".parse().unwrap(),
    1,
    None,
  );
  net.produce(vec![tx]);

  let ledger = net.chain.ledger();
  assert_eq!(ledger.balance(&faucet).to_string(), "999899.9");
  assert_eq!(ledger.balance(&recipient), Amount::from_whole(100));
  assert_eq!(ledger.nonce(&faucet), 1);

  // 50% of the 0.1 fee burned, 50% to the producer
  assert_eq!(ledger.burn.total(BurnReason::TxFee).to_string(), "0.05");
  assert_eq!(ledger.balance(&producer).to_string(), "0.05");
  assert_eq!(
    ledger.total_supply,
    Amount::from_whole(1_000_200).saturating_sub("0.05".parse().unwrap())
  );
  assert_eq!(ledger.circulating_total(), ledger.total_supply);
}

/// E3: staking the minimum with a registered consensus key
/// activates at the epoch boundary, after which the election can
/// pick the new validator.
#[test]
fn stake_activates_and_gets_elected() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");
  let staker_wallet = WalletKeypair::generate();
  let staker = staker_wallet.address("tLVE");
  let staker_key = Keypair::generate();

  let mut genesis = testnet_genesis(&faucet);
  genesis.epoch_params.blocks_per_epoch = 5;
  fund(&mut genesis, &staker, Amount::from_whole(200));
  let keys = add_validators(&mut genesis, 1, Amount::from_whole(200));

  let mut net = TestChain::new(&genesis, keys);
  let stake = signed_tx(
    &staker_wallet,
    TxType::Stake,
    TxTarget::StakePool,
    Amount::from_whole(100),
    "0.1".parse().unwrap(),
    1,
    Some(TxData::Validator {
      consensus_pubkey: staker_key.public(),
      commission_bps: Some(500),
      moniker: None,
    }),
  );
  net.produce(vec![stake]);

  // bonded but not yet active
  let record = net.chain.ledger().staking.get(&staker).unwrap();
  assert_eq!(record.self_stake, Amount::from_whole(100));
  assert!(!record.active);

  // the epoch boundary at height 5 activates it
  net.grow_to(5);
  let record = net.chain.ledger().staking.get(&staker).unwrap();
  assert!(record.active);
  assert_eq!(net.chain.ledger().epoch_applied, 1);

  // with a fixed parent hash the weighted election deterministically
  // hands the new validator at least one slot within the next epoch
  let tip_hash = net.chain.tip().hash.clone();
  let tip_slot = net.chain.tip().slot;
  let elected_once = (tip_slot + 1..tip_slot + 101).any(|slot| {
    elect_producer(&tip_hash, slot, net.chain.ledger().staking.active_set())
      .unwrap()
      .operator
      == staker
  });
  assert!(elected_once);
}

/// E4: two sealed blocks at one height by one validator slash half
/// its stake, burn the slashed amount and jail it, also under
/// replay.
#[test]
fn double_sign_evidence_slashes_and_jails() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");

  let mut genesis = testnet_genesis(&faucet);
  let keys = add_validators(&mut genesis, 2, Amount::from_whole(200));

  let mut net = TestChain::new(&genesis, keys.clone());
  net.grow_to(1);

  // the offender seals two different candidates for the same slot
  let offender = elect_producer(
    &net.chain.tip().hash,
    17,
    net.chain.ledger().staking.active_set(),
  )
  .unwrap()
  .operator
  .clone();

  let mut first = net.sealed_candidate(vec![], 17);
  let mut second = net.sealed_candidate(vec![], 17);
  second.timestamp += 1;
  first.seal(CHAIN_ID, &keys[&offender]);
  second.seal(CHAIN_ID, &keys[&offender]);
  assert_ne!(first.hash, second.hash);

  assert!(net.chain.note_seal(&first).is_none());
  let evidence = net.chain.note_seal(&second).expect("conflict detected");
  assert_eq!(evidence.producer, offender);

  let supply_before = net.chain.ledger().total_supply;
  let evidence_tx = crate::ledger::Transaction::system(
    TxType::Transfer,
    TxTarget::Account(offender.clone()),
    Amount::ZERO,
    net.chain.tip().timestamp + 1,
    CHAIN_ID,
    Some(TxData::Evidence(evidence)),
  );
  net.produce(vec![evidence_tx]);

  let ledger = net.chain.ledger();
  let record = ledger.staking.get(&offender).unwrap();
  assert!(record.jailed);
  assert!(!record.active);
  assert_eq!(record.self_stake, Amount::from_whole(100));
  assert_eq!(
    ledger.burn.total(BurnReason::Slash),
    Amount::from_whole(100)
  );
  assert_eq!(
    ledger.total_supply,
    supply_before.saturating_sub(Amount::from_whole(100))
  );

  // canonical replay reaches the same verdict
  let replayed = replay(&genesis, &net);
  assert!(replayed.staking.get(&offender).unwrap().jailed);
  assert_eq!(replayed, *net.chain.ledger());
}

/// E5: pool bootstrap and a swap with the documented quote, fee
/// burn and non-decreasing reserve product.
#[test]
fn amm_swap_matches_the_quote() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");
  let trader_wallet = WalletKeypair::generate();
  let trader = trader_wallet.address("tLVE");

  let mut genesis = testnet_genesis(&faucet);
  fund(&mut genesis, &trader, Amount::from_whole(2000));
  fund_usdt(&mut genesis, &faucet, Amount::from_whole(6_000_000));
  let keys = add_validators(&mut genesis, 1, Amount::from_whole(200));

  let mut net = TestChain::new(&genesis, keys);

  let initialize = signed_tx(
    &faucet_wallet,
    TxType::PoolOp,
    TxTarget::Pool,
    Amount::from_whole(100_000),
    "0.1".parse().unwrap(),
    1,
    Some(TxData::Pool(PoolInstruction::Initialize {
      amount_a: Amount::from_whole(100_000),
      amount_b: Amount::from_whole(5_000_000),
    })),
  );
  let swap = signed_tx(
    &trader_wallet,
    TxType::PoolOp,
    TxTarget::Pool,
    Amount::from_whole(1000),
    "0.1".parse().unwrap(),
    1,
    Some(TxData::Pool(PoolInstruction::Swap {
      token_in: PoolToken::Lve,
      amount_in: Amount::from_whole(1000),
      min_out: Amount::from_whole(49_000),
    })),
  );
  net.produce(vec![initialize, swap]);

  let ledger = net.chain.ledger();
  let expected_out = Amount::from_whole(5_000_000)
    .mul_div(997 * 1_000_000, 100_997 * 1_000_000)
    .unwrap();

  assert_eq!(ledger.usdt_balance(&trader), expected_out);
  assert_eq!(ledger.balance(&trader).to_string(), "899.9");

  // 1000 in, 30% of the 3 LVE fee burned out of the reserve
  assert_eq!(ledger.pool.reserve_a.to_string(), "100999.1");
  assert_eq!(
    ledger.pool.reserve_b,
    Amount::from_whole(5_000_000).saturating_sub(expected_out)
  );
  assert_eq!(
    ledger.burn.total(BurnReason::SwapFee).to_string(),
    "0.9"
  );
  assert!(
    ledger.pool.k()
      > Amount::from_whole(100_000).units() as u128
        * Amount::from_whole(5_000_000).units() as u128
  );

  // the initial provider owns sqrt(a*b) LP units
  assert_eq!(
    ledger.pool.lp_balances[&faucet],
    Amount::from_units(707_106_781_186)
  );
  assert_eq!(ledger.circulating_total(), ledger.total_supply);
}

/// E6: four of five equal validators finalize a block; a longer
/// fork that would replace it is rejected.
#[test]
fn finalized_blocks_never_revert() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");

  let mut genesis = testnet_genesis(&faucet);
  let keys = add_validators(&mut genesis, 5, Amount::from_whole(200));

  let mut net = TestChain::new(&genesis, keys.clone());
  net.grow_to(2);
  let finalized_block = net.chain.block_at(1).unwrap().clone();

  // 4 * 200 = 800 >= floor(1000 * 2/3)
  for (operator, keypair) in keys.iter().take(4) {
    let attestation = Attestation::new(
      keypair,
      operator.clone(),
      1,
      finalized_block.hash.clone(),
      finalized_block.timestamp,
    );
    net.chain.record_attestation(attestation).unwrap();
  }
  assert!(net.chain.finality().is_finalized(1));
  assert_eq!(net.chain.finality().highest(), 1);

  // a longer competing chain diverging below the finalized height
  let mut fork = TestChain::new(&genesis, keys);
  fork.produce_at_slot(vec![], 2);
  fork.grow_to(3);
  let candidate = fork.chain.all_blocks()[1..].to_vec();
  assert_ne!(candidate[0].hash, finalized_block.hash);

  let verdict = net
    .chain
    .try_replace(candidate, fork.chain.tip().timestamp + 1);
  assert_eq!(verdict, Err(ChainError::FinalizedReorg));
  assert_eq!(net.chain.block_at(1).unwrap().hash, finalized_block.hash);
}

/// Reorgs may not cross recorded checkpoints either.
#[test]
fn checkpoints_bound_reorg_depth() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");

  let mut genesis = testnet_genesis(&faucet);
  genesis.consensus_params.checkpoint_interval = 2;
  let keys = add_validators(&mut genesis, 2, Amount::from_whole(200));

  let mut net = TestChain::new(&genesis, keys.clone());
  net.grow_to(4);

  let mut fork = TestChain::new(&genesis, keys);
  fork.produce_at_slot(vec![], 2);
  fork.grow_to(5);

  let verdict = net.chain.try_replace(
    fork.chain.all_blocks()[1..].to_vec(),
    fork.chain.tip().timestamp + 1,
  );
  assert_eq!(verdict, Err(ChainError::CheckpointViolation(2)));
}

/// Invariant 1 and 7: replaying the block log is a pure function
/// and epoch inflation mints exactly once per boundary.
#[test]
fn replay_is_deterministic_and_mints_once() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");
  let recipient = WalletKeypair::generate().address("tLVE");

  let mut genesis = testnet_genesis(&faucet);
  genesis.epoch_params.blocks_per_epoch = 5;
  let keys = add_validators(&mut genesis, 3, Amount::from_whole(200));

  let mut net = TestChain::new(&genesis, keys);
  let tx = signed_tx(
    &faucet_wallet,
    TxType::Transfer,
    TxTarget::Account(recipient),
    Amount::from_whole(50),
    "0.1".parse().unwrap(),
    1,
    None,
  );
  net.produce(vec![tx]);
  net.grow_to(7); // crosses the boundary at 5

  assert_eq!(net.chain.ledger().epoch_applied, 1);
  // inflation outweighs the one fee burn
  let minted_supply = net.chain.ledger().total_supply;
  assert!(minted_supply > Amount::from_whole(1_000_600));

  // two independent replays agree with the live ledger and with
  // each other, including the single inflation application
  let first = replay(&genesis, &net);
  let second = replay(&genesis, &net);
  assert_eq!(first, second);
  assert_eq!(first, *net.chain.ledger());
  assert_eq!(first.total_supply, minted_supply);
  assert_eq!(first.circulating_total(), first.total_supply);
}

/// Restarting from the storage layer reproduces the live chain and
/// matches the persisted snapshot.
#[test]
fn storage_restore_reproduces_the_chain() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");
  let recipient = WalletKeypair::generate().address("tLVE");

  let mut genesis = testnet_genesis(&faucet);
  let keys = add_validators(&mut genesis, 2, Amount::from_whole(200));

  let mut net = TestChain::new(&genesis, keys);
  let tx = signed_tx(
    &faucet_wallet,
    TxType::Transfer,
    TxTarget::Account(recipient),
    Amount::from_whole(25),
    "0.1".parse().unwrap(),
    1,
    None,
  );
  net.produce(vec![tx]);
  net.grow_to(3);
  net.persist();

  let restored = net.restore();
  assert_eq!(restored.height(), net.chain.height());
  assert_eq!(restored.tip().hash, net.chain.tip().hash);
  assert_eq!(restored.ledger(), net.chain.ledger());

  // the stored snapshot is exactly what the replay reproduces
  let snapshot = net.store.load_snapshot().unwrap().unwrap();
  assert_eq!(snapshot, *restored.ledger());
}

/// The mempool admission dry run never disturbs the live state.
#[test]
fn dry_run_leaves_state_untouched() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");

  let mut genesis = testnet_genesis(&faucet);
  let keys = add_validators(&mut genesis, 1, Amount::from_whole(200));
  let net = TestChain::new(&genesis, keys);

  let tx = signed_tx(
    &faucet_wallet,
    TxType::Transfer,
    TxTarget::Account(WalletKeypair::generate().address("tLVE")),
    Amount::from_whole(10),
    "0.1".parse().unwrap(),
    1,
    None,
  );

  let before = net.chain.ledger().clone();
  net.chain.ledger().dry_run(&tx).unwrap();
  assert_eq!(before, *net.chain.ledger());
  assert_eq!(before.balance(&faucet), Amount::from_whole(1_000_000));
}

fn replay(genesis: &crate::ledger::GenesisConfig, net: &TestChain) -> Ledger {
  let blocks = net.chain.all_blocks();
  let mut ledger = Ledger::from_genesis(genesis);
  for pair in blocks.windows(2) {
    ledger
      .apply_block(&pair[1], pair[0].slot)
      .expect("canonical chain replays");
  }
  ledger
}

/// Unbonding stake matures back into a spendable balance after the
/// unbonding window.
#[test]
fn unstake_matures_after_the_window() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");
  let staker_wallet = WalletKeypair::generate();
  let staker = staker_wallet.address("tLVE");
  let staker_key = Keypair::generate();

  let mut genesis = testnet_genesis(&faucet);
  genesis.epoch_params.blocks_per_epoch = 4;
  genesis.epoch_params.unbonding_blocks = 4;
  fund(&mut genesis, &staker, Amount::from_whole(500));
  let keys = add_validators(&mut genesis, 1, Amount::from_whole(200));

  let mut net = TestChain::new(&genesis, keys);
  let stake = signed_tx(
    &staker_wallet,
    TxType::Stake,
    TxTarget::StakePool,
    Amount::from_whole(300),
    "0.1".parse().unwrap(),
    1,
    Some(TxData::Validator {
      consensus_pubkey: staker_key.public(),
      commission_bps: None,
      moniker: None,
    }),
  );
  net.produce(vec![stake]);

  let unstake = signed_tx(
    &staker_wallet,
    TxType::Unstake,
    TxTarget::StakePool,
    Amount::from_whole(300),
    "0.1".parse().unwrap(),
    2,
    None,
  );
  net.produce(vec![unstake]);
  assert_eq!(
    net.chain.ledger().staking.total_unbonding(),
    Amount::from_whole(300)
  );
  assert_eq!(net.chain.ledger().balance(&staker).to_string(), "199.8");

  // unbonds mature at the epoch boundary after height 2 + 4
  net.grow_to(8);
  assert_eq!(net.chain.ledger().staking.total_unbonding(), Amount::ZERO);
  assert_eq!(net.chain.ledger().balance(&staker).to_string(), "499.8");
  assert_eq!(
    net.chain.ledger().circulating_total(),
    net.chain.ledger().total_supply
  );
}

/// Delegations earn their pro-rata share of epoch rewards.
#[test]
fn delegation_flows_and_rewards() {
  let faucet_wallet = WalletKeypair::generate();
  let faucet = faucet_wallet.address("tLVE");
  let delegator_wallet = WalletKeypair::generate();
  let delegator = delegator_wallet.address("tLVE");

  let mut genesis = testnet_genesis(&faucet);
  genesis.epoch_params.blocks_per_epoch = 4;
  fund(&mut genesis, &delegator, Amount::from_whole(100));
  let keys = add_validators(&mut genesis, 1, Amount::from_whole(200));
  let validator = keys.keys().next().unwrap().clone();

  let mut net = TestChain::new(&genesis, keys);
  let delegate = signed_tx(
    &delegator_wallet,
    TxType::Delegate,
    TxTarget::StakePool,
    Amount::from_whole(50),
    "0.1".parse().unwrap(),
    1,
    Some(TxData::Delegation {
      validator: validator.clone(),
    }),
  );
  net.produce(vec![delegate]);

  let record = net.chain.ledger().staking.get(&validator).unwrap();
  assert_eq!(record.delegated_stake, Amount::from_whole(50));
  assert_eq!(record.delegations[&delegator], Amount::from_whole(50));

  // after the boundary the delegator has earned something
  let before = net.chain.ledger().balance(&delegator);
  net.grow_to(4);
  let after = net.chain.ledger().balance(&delegator);
  assert!(after > before);
}
