//! Node coordinator
//!
//! Owns every piece of mutable chain state (chain log, ledger,
//! mempools, finality) and is the only writer to any of it. All
//! inputs (slot ticks, network events, maintenance timers) arrive
//! through one `select!` loop, so state transitions are totally
//! ordered without any locking. Network and disk I/O live on their
//! own tasks and communicate through channels.

use {
  crate::{
    consensus::{
      elect_producer, Attestation, BlockProducer, Chain, ChainError,
      FinalityEvent, SlotTicker,
    },
    ledger::{Block, ErrorKind, GenesisConfig},
    mempool::{EncryptedPool, Mempool, MempoolConfig},
    network::{
      score, HandshakeInfo, Message, Network, NetworkConfig, NetworkEvent,
      PeerId, TxEnvelope, SYNC_CHUNK,
    },
    primitives::{Address, Keypair},
    storage::{Storage, StorageError},
  },
  chrono::Utc,
  futures::StreamExt,
  std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc,
    },
    time::Duration,
  },
  thiserror::Error,
  tracing::{debug, info, warn},
};

/// How often volatile state is snapshotted to disk.
const SNAPSHOT_INTERVAL_SECS: u64 = 30;

/// Chunk-sync requests time out after this long.
const SYNC_TIMEOUT_MS: i64 = 60_000;

#[derive(Debug, Error)]
pub enum NodeError {
  /// Exit code 2: the stored chain belongs to another network.
  #[error("stored chain does not match the configured genesis")]
  GenesisMismatch,

  /// Exit code 3: stored state cannot be replayed.
  #[error("corrupt stored state: {0}")]
  CorruptState(String),

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl NodeError {
  pub fn exit_code(&self) -> i32 {
    match self {
      NodeError::GenesisMismatch => 2,
      NodeError::CorruptState(_) => 3,
      _ => 1,
    }
  }
}

struct SyncState {
  peer: PeerId,
  deadline_ms: i64,
}

pub struct Node {
  chain: Chain,
  mempool: Mempool,
  encrypted: EncryptedPool,
  producer: BlockProducer,
  network: Network,
  storage: Arc<dyn Storage>,

  height_gauge: Arc<AtomicU64>,
  ready_peers: HashMap<PeerId, HandshakeInfo>,
  known_addrs: BTreeSet<String>,
  sync: Option<SyncState>,
}

impl Node {
  /// Restores state from storage (or seeds it from genesis) and
  /// brings up the networking layer.
  pub async fn new(
    genesis: GenesisConfig,
    consensus_key: Keypair,
    storage: Arc<dyn Storage>,
    listen: SocketAddr,
    bootstrap: Vec<String>,
  ) -> Result<Self, NodeError> {
    let stored = storage.load_blocks()?;
    let chain = if stored.is_empty() {
      let chain = Chain::new(&genesis);
      storage.save_block(chain.tip())?;
      chain
    } else {
      if stored[0].hash != genesis.hash() {
        return Err(NodeError::GenesisMismatch);
      }
      let finality = storage.load_finality()?.unwrap_or_default();
      Chain::from_blocks(&genesis, stored, finality)
        .map_err(|e| NodeError::CorruptState(e.to_string()))?
    };

    // the snapshot is derived state; if the replayed chain does
    // not reproduce it, something on disk is lying
    if let Some(snapshot) = storage.load_snapshot()? {
      if snapshot.height == chain.height() && snapshot != *chain.ledger() {
        return Err(NodeError::CorruptState(
          "replayed chain does not reproduce the stored snapshot".into(),
        ));
      }
    }

    info!(
      "chain at height {} [{}]",
      chain.height(),
      &chain.tip().hash[..8]
    );

    let height_gauge = Arc::new(AtomicU64::new(chain.height()));
    let network = Network::new(NetworkConfig {
      listen,
      chain_id: genesis.chain_id.clone(),
      genesis_hash: genesis.hash().to_owned(),
      node_version: env!("CARGO_PKG_VERSION").to_owned(),
      height: Arc::clone(&height_gauge),
    })
    .await?;

    let mut known_addrs: BTreeSet<String> = bootstrap.into_iter().collect();
    for addr in storage.load_peers()? {
      known_addrs.insert(addr);
    }
    for addr in &known_addrs {
      network.connect(addr.clone());
    }

    let mut mempool = Mempool::new(MempoolConfig::default());
    let now = Utc::now().timestamp_millis();
    for tx in storage.load_mempool()? {
      if let Err(e) = mempool.add(tx, chain.ledger(), now) {
        debug!("stored mempool entry no longer admissible: {e}");
      }
    }

    let producer = BlockProducer::new(consensus_key, genesis.chain_id.clone());

    Ok(Self {
      chain,
      mempool,
      encrypted: EncryptedPool::default(),
      producer,
      network,
      storage,
      height_gauge,
      ready_peers: HashMap::new(),
      known_addrs,
      sync: None,
    })
  }

  /// The operator address this node's consensus key validates for,
  /// if it is registered on chain.
  fn our_operator(&self) -> Option<Address> {
    let our_key = self.producer.consensus_key().public();
    self
      .chain
      .ledger()
      .staking
      .validators
      .values()
      .find(|record| record.consensus_pubkey == Some(our_key))
      .map(|record| record.operator.clone())
  }

  /// The validator runloop. Returns on ctrl-c after flushing state.
  pub async fn run(mut self) -> Result<(), NodeError> {
    let genesis = self.chain.genesis().clone();
    let mut slots =
      SlotTicker::new(genesis.genesis_time, genesis.slot_interval);
    let mut snapshots = tokio::time::interval(Duration::from_secs(
      SNAPSHOT_INTERVAL_SECS,
    ));
    let mut maintenance = tokio::time::interval(Duration::from_secs(5));

    loop {
      tokio::select! {
        Some(slot) = slots.next() => self.on_slot(slot),

        Some(event) = self.network.poll() => self.on_network(event),

        _ = snapshots.tick() => {
          if let Err(e) = self.persist() {
            warn!("periodic snapshot failed: {e}");
          }
        }

        _ = maintenance.tick() => self.on_maintenance(),

        _ = tokio::signal::ctrl_c() => {
          info!("shutting down");
          self.persist()?;
          self.storage.flush()?;
          return Ok(());
        }
      }
    }
  }

  fn on_slot(&mut self, slot: u64) {
    let now = Utc::now().timestamp_millis();
    if slot <= self.chain.tip().slot {
      return;
    }

    let elected = elect_producer(
      &self.chain.tip().hash,
      slot,
      self.chain.ledger().staking.active_set(),
    )
    .map(|validator| validator.operator.clone());

    let elected = match elected {
      Some(elected) => elected,
      None => return,
    };
    debug!("slot {slot}: {elected} is expected to produce");

    let ours = match self.our_operator() {
      Some(operator) if operator == elected => operator,
      _ => return,
    };

    let block = self.producer.produce(
      &self.chain,
      &mut self.mempool,
      &mut self.encrypted,
      &ours,
      slot,
      now,
    );

    match self.chain.append(block.clone(), now) {
      Ok(()) => {
        self.after_append(&block, None);
        self
          .network
          .gossip(Message::NewBlock(Box::new(block)), None);
      }
      Err(e) => warn!("own block failed validation: {e}"),
    }
  }

  /// Common path for every block that made it into the chain.
  fn after_append(&mut self, block: &Block, origin: Option<PeerId>) {
    let now = Utc::now().timestamp_millis();

    if let Err(e) = self.storage.save_block(block) {
      warn!("failed to persist block {}: {e}", block.index);
    }
    self.height_gauge.store(block.index, Ordering::Relaxed);

    self
      .mempool
      .on_block_applied(&block.transactions, self.chain.ledger(), now);
    self.encrypted.prune(block.index);

    if let Some(origin) = origin {
      self
        .network
        .gossip(Message::NewBlock(Box::new(block.clone())), Some(origin));
    }

    // attest to every block we accept, if we validate
    if let Some(operator) = self.our_operator() {
      let active = self
        .chain
        .ledger()
        .staking
        .get(&operator)
        .map(|record| record.active)
        .unwrap_or(false);
      if active {
        let attestation = Attestation::new(
          self.producer.consensus_key(),
          operator,
          block.index,
          block.hash.clone(),
          now,
        );
        self.note_attestation(attestation.clone(), None);
        self
          .network
          .gossip(Message::Attestation(Box::new(attestation)), None);
      }
    }
  }

  fn note_attestation(
    &mut self,
    attestation: Attestation,
    origin: Option<PeerId>,
  ) {
    match self.chain.record_attestation(attestation.clone()) {
      Ok(FinalityEvent::Finalized { .. }) => {
        if let Err(e) = self.storage.save_finality(self.chain.finality()) {
          warn!("failed to persist finality: {e}");
        }
        self.forward_attestation(attestation, origin);
      }
      Ok(FinalityEvent::Counted) => {
        self.forward_attestation(attestation, origin)
      }
      Ok(FinalityEvent::Conflict(evidence)) => {
        warn!("conflicting attestations by {}", evidence.producer);
        self.producer.queue_evidence(*evidence);
      }
      Err(e) => {
        debug!("attestation rejected: {e}");
        if let Some(origin) = origin {
          self.network.penalize(origin, score::INVALID_MESSAGE);
        }
      }
    }
  }

  fn forward_attestation(
    &mut self,
    attestation: Attestation,
    origin: Option<PeerId>,
  ) {
    if let Some(origin) = origin {
      self
        .network
        .gossip(Message::Attestation(Box::new(attestation)), Some(origin));
    }
  }

  fn on_network(&mut self, event: NetworkEvent) {
    let now = Utc::now().timestamp_millis();
    match event {
      NetworkEvent::PeerReady { peer, info } => {
        let behind = info.block_height > self.chain.height();
        self.ready_peers.insert(peer, info);
        self.network.send(peer, Message::QueryTxPool);
        self.network.send(peer, Message::QueryPeers);
        if behind {
          self.start_sync(peer, now);
        }
      }
      NetworkEvent::PeerDisconnected { peer } => {
        self.ready_peers.remove(&peer);
        if self.sync.as_ref().map(|s| s.peer) == Some(peer) {
          self.sync = None;
          self.resync_with_another(now);
        }
      }

      NetworkEvent::BlockReceived { peer, block } => {
        self.on_block(peer, block, now)
      }

      NetworkEvent::TransactionReceived { peer, tx } => {
        match self.mempool.add(tx.clone(), self.chain.ledger(), now) {
          Ok(()) => {
            self.network.penalize(peer, score::VALID_TRANSACTION);
            self.network.gossip(
              Message::NewTransaction(Box::new(TxEnvelope::Plain(tx))),
              Some(peer),
            );
          }
          Err(e) => {
            debug!("gossiped transaction rejected: {e}");
            let delta = match e.kind() {
              ErrorKind::Validation => score::INVALID_MESSAGE,
              _ => -1,
            };
            self.network.penalize(peer, delta);
          }
        }
      }

      NetworkEvent::EncryptedReceived { peer, tx } => {
        match self.encrypted.add(tx.clone()) {
          Ok(()) => self.network.gossip(
            Message::NewTransaction(Box::new(TxEnvelope::Encrypted(tx))),
            Some(peer),
          ),
          Err(e) => {
            debug!("encrypted submission rejected: {e}");
            self.network.penalize(peer, -1);
          }
        }
      }

      NetworkEvent::AttestationReceived { peer, attestation } => {
        self.note_attestation(attestation, Some(peer));
      }

      NetworkEvent::LatestRequested { peer } => {
        let tip = self.chain.tip().clone();
        self
          .network
          .send(peer, Message::ResponseBlockchain(vec![tip]));
      }
      NetworkEvent::AllRequested { peer } => {
        let blocks = self.chain.all_blocks().to_vec();
        self
          .network
          .send(peer, Message::ResponseBlockchain(blocks));
      }
      NetworkEvent::BlocksRequested { peer, start, limit } => {
        let blocks = self.chain.blocks_from(start, limit as usize).to_vec();
        self
          .network
          .send(peer, Message::ResponseBlocks { start, blocks });
      }
      NetworkEvent::TxPoolRequested { peer } => {
        let txs: Vec<_> = self.mempool.pending().cloned().collect();
        self.network.send(peer, Message::ResponseTxPool(txs));
      }

      NetworkEvent::BlocksResponse { peer, blocks, .. } => {
        self.on_chain_offer(peer, blocks, now, true);
      }
      NetworkEvent::ChainResponse { peer, blocks } => {
        self.on_chain_offer(peer, blocks, now, false);
      }
      NetworkEvent::TxPoolResponse { peer, txs } => {
        for tx in txs {
          if let Err(e) = self.mempool.add(tx, self.chain.ledger(), now) {
            debug!("peer {peer} pool entry rejected: {e}");
          }
        }
      }

      NetworkEvent::PeersDiscovered { addrs } => {
        for addr in addrs {
          if self.known_addrs.insert(addr.clone()) {
            self.network.connect(addr);
          }
        }
      }
    }
  }

  fn on_block(&mut self, peer: PeerId, block: Block, now: i64) {
    // watch for double production regardless of what the fork
    // choice says about this particular block
    if let Some(evidence) = self.chain.note_seal(&block) {
      self.producer.queue_evidence(evidence);
    }

    let next = self.chain.height() + 1;
    if block.index == next {
      match self.chain.append(block.clone(), now) {
        Ok(()) => {
          self.network.penalize(peer, score::VALID_BLOCK);
          self.after_append(&block, Some(peer));
        }
        Err(e) => {
          debug!("gossiped block rejected: {e}");
          self.penalize_chain_error(peer, &e);
        }
      }
    } else if block.index > next {
      // we are behind; backfill in chunks
      self.start_sync(peer, now);
    } else {
      // a competing block for an occupied height
      match self.chain.try_replace(vec![block.clone()], now) {
        Ok(true) => {
          self.persist_reorg(block.index);
          self.after_append(&block, Some(peer));
        }
        Ok(false) => {}
        Err(ChainError::UnknownParent) => {
          // deep fork: ask for their whole view
          self.network.send(peer, Message::QueryAll);
        }
        Err(e) => self.penalize_chain_error(peer, &e),
      }
    }
  }

  /// A chunk (or whole chain) offered by a peer. Verified and
  /// applied atomically; a bad chunk costs the peer its reputation
  /// and we re-request elsewhere.
  fn on_chain_offer(
    &mut self,
    peer: PeerId,
    mut blocks: Vec<Block>,
    now: i64,
    chunked: bool,
  ) {
    if self.sync.as_ref().map(|s| s.peer) == Some(peer) {
      self.sync = None;
    }

    // never re-apply genesis
    if blocks.first().map(|b| b.index) == Some(0) {
      blocks.remove(0);
    }
    if blocks.is_empty() {
      return;
    }
    let start = blocks[0].index;

    // an unsolicited tip far ahead of us is a cue to backfill, not
    // a fork offer
    if start > self.chain.height() + 1 {
      self.start_sync(peer, now);
      return;
    }

    match self.chain.try_replace(blocks, now) {
      Ok(true) => {
        self.persist_reorg(start);
        let tip = self.chain.tip().clone();
        let now_ms = Utc::now().timestamp_millis();
        self
          .mempool
          .on_block_applied(&tip.transactions, self.chain.ledger(), now_ms);
        self.height_gauge.store(tip.index, Ordering::Relaxed);

        // keep pulling while the peer knows more
        let ahead = self
          .ready_peers
          .get(&peer)
          .map(|info| info.block_height > self.chain.height())
          .unwrap_or(false);
        if chunked && ahead {
          self.start_sync(peer, now);
        }
      }
      Ok(false) => {}
      Err(e) => {
        warn!("offered chain failed validation: {e}");
        self.network.penalize(peer, score::FAILED_SYNC);
        self.resync_with_another(now);
      }
    }
  }

  fn penalize_chain_error(&mut self, peer: PeerId, error: &ChainError) {
    let delta = match error.kind() {
      ErrorKind::Consensus => score::PROTOCOL_VIOLATION,
      ErrorKind::Validation => score::INVALID_MESSAGE,
      _ => -1,
    };
    self.network.penalize(peer, delta);
  }

  fn start_sync(&mut self, peer: PeerId, now: i64) {
    if let Some(sync) = &self.sync {
      if sync.deadline_ms > now {
        return; // one outstanding request at a time
      }
    }
    let start = self.chain.height() + 1;
    debug!("requesting blocks from {start} from peer {peer}");
    self.network.send(
      peer,
      Message::QueryBlocksFrom {
        start,
        limit: SYNC_CHUNK,
      },
    );
    self.sync = Some(SyncState {
      peer,
      deadline_ms: now + SYNC_TIMEOUT_MS,
    });
  }

  fn resync_with_another(&mut self, now: i64) {
    let candidate = self
      .ready_peers
      .iter()
      .find(|(_, info)| info.block_height > self.chain.height())
      .map(|(peer, _)| *peer);
    if let Some(peer) = candidate {
      self.sync = None;
      self.start_sync(peer, now);
    }
  }

  /// After a reorg, rewrite the stored suffix.
  fn persist_reorg(&mut self, from_height: u64) {
    if let Err(e) = self.storage.truncate_blocks_from(from_height) {
      warn!("failed to truncate stored blocks: {e}");
      return;
    }
    for block in self.chain.blocks_from(from_height, usize::MAX) {
      if let Err(e) = self.storage.save_block(block) {
        warn!("failed to persist block {}: {e}", block.index);
      }
    }
  }

  fn on_maintenance(&mut self) {
    let now = Utc::now().timestamp_millis();

    let timed_out = self
      .sync
      .as_ref()
      .map(|sync| sync.deadline_ms <= now)
      .unwrap_or(false);
    if timed_out {
      let peer = self.sync.take().expect("checked above").peer;
      warn!("sync request to peer {peer} timed out");
      self.network.penalize(peer, score::FAILED_SYNC);
      self.resync_with_another(now);
    }

    self.mempool.prune(now);
    self.encrypted.prune(self.chain.height());
  }

  fn persist(&mut self) -> Result<(), NodeError> {
    self.storage.save_snapshot(self.chain.ledger())?;
    self.storage.save_finality(self.chain.finality())?;
    let pending: Vec<_> = self.mempool.pending().cloned().collect();
    self.storage.save_mempool(&pending)?;
    let addrs: Vec<_> = self.known_addrs.iter().cloned().collect();
    self.storage.save_peers(&addrs)?;
    Ok(())
  }
}
