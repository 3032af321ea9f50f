//! P2P networking
//!
//! The [`Network`] facade hides a supervisor task that owns the
//! listener, the peer map and the peer-exchange address book. Peer
//! I/O runs on one reader and one writer task per connection; those
//! tasks never touch shared state, they only shuttle messages to
//! and from the supervisor. The node consumes [`NetworkEvent`]s and
//! steers the layer with [`NetworkCommand`]s, so everything that
//! needs chain state stays out of the networking code.

mod challenge;
mod peer;
mod wire;

pub use {
  peer::{score, PeerId},
  wire::{
    HandshakeInfo, Message, TxEnvelope, MAX_BLOCKS_PER_RESPONSE,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, SYNC_CHUNK,
  },
};

use {
  crate::{
    consensus::Attestation,
    ledger::{Block, Transaction},
    mempool::EncryptedTransaction,
  },
  challenge::{
    new_nonce, solve, verify, DIFFICULTY_BITS, MAX_SOLVE_BITS,
    SOLVE_TIMEOUT_SECS,
  },
  chrono::Utc,
  dashmap::DashMap,
  futures::{SinkExt, StreamExt},
  peer::{
    is_shareable_url, subnet_of, Peer, PeerStage, BAN_MS, MAX_CONNS_PER_IP,
    MAX_CONNS_PER_SUBNET, PEX_INTERVAL_MS, PEX_MAX_ADDRS,
  },
  std::{
    collections::{BTreeSet, HashMap},
    net::{IpAddr, SocketAddr},
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc,
    },
    time::Duration,
  },
  tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::timeout,
  },
  tokio_util::codec::Framed,
  tracing::{debug, info, warn},
  wire::Codec,
};

/// What the node learns from the wire.
#[derive(Debug)]
pub enum NetworkEvent {
  /// Peer passed handshake (and challenge, for inbound) and can be
  /// used for gossip and sync.
  PeerReady { peer: PeerId, info: HandshakeInfo },
  PeerDisconnected { peer: PeerId },

  BlockReceived { peer: PeerId, block: Block },
  TransactionReceived { peer: PeerId, tx: Transaction },
  EncryptedReceived { peer: PeerId, tx: EncryptedTransaction },
  AttestationReceived { peer: PeerId, attestation: Attestation },

  /// Answers to our sync queries.
  BlocksResponse {
    peer: PeerId,
    start: u64,
    blocks: Vec<Block>,
  },
  ChainResponse { peer: PeerId, blocks: Vec<Block> },
  TxPoolResponse { peer: PeerId, txs: Vec<Transaction> },

  /// The peer wants data only the node can serve.
  LatestRequested { peer: PeerId },
  AllRequested { peer: PeerId },
  BlocksRequested { peer: PeerId, start: u64, limit: u64 },
  TxPoolRequested { peer: PeerId },

  /// New dialable addresses learned through peer exchange.
  PeersDiscovered { addrs: Vec<String> },
}

/// What the node tells the network layer to do.
#[derive(Debug)]
pub enum NetworkCommand {
  Connect(String),
  SendTo(PeerId, Message),
  Gossip {
    message: Message,
    except: Option<PeerId>,
  },
  Penalize {
    peer: PeerId,
    delta: i32,
  },
  /// Disconnect and ban the peer's IP for an hour.
  Ban(PeerId),
  Disconnect(PeerId),
}

#[derive(Clone)]
pub struct NetworkConfig {
  pub listen: SocketAddr,
  pub chain_id: String,
  pub genesis_hash: String,
  pub node_version: String,

  /// Live chain height, bumped by the node after every append, so
  /// handshakes always advertise fresh state.
  pub height: Arc<AtomicU64>,
}

/// Handle held by the node; all the machinery lives on the
/// supervisor task.
pub struct Network {
  events: UnboundedReceiver<NetworkEvent>,
  commands: UnboundedSender<NetworkCommand>,
  local_addr: SocketAddr,
}

impl Network {
  pub async fn new(config: NetworkConfig) -> std::io::Result<Self> {
    let listener = TcpListener::bind(config.listen).await?;
    let local_addr = listener.local_addr()?;
    info!("p2p listening on {local_addr}");

    let (event_tx, event_rx) = unbounded_channel();
    let (command_tx, command_rx) = unbounded_channel();

    let supervisor = Supervisor::new(config, listener, event_tx);
    tokio::spawn(supervisor.run(command_rx));

    Ok(Self {
      events: event_rx,
      commands: command_tx,
      local_addr,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub async fn poll(&mut self) -> Option<NetworkEvent> {
    self.events.recv().await
  }

  fn command(&self, command: NetworkCommand) {
    let _ = self.commands.send(command);
  }

  pub fn connect(&self, addr: impl Into<String>) {
    self.command(NetworkCommand::Connect(addr.into()));
  }

  pub fn send(&self, peer: PeerId, message: Message) {
    self.command(NetworkCommand::SendTo(peer, message));
  }

  pub fn gossip(&self, message: Message, except: Option<PeerId>) {
    self.command(NetworkCommand::Gossip { message, except });
  }

  pub fn penalize(&self, peer: PeerId, delta: i32) {
    self.command(NetworkCommand::Penalize { peer, delta });
  }

  pub fn ban(&self, peer: PeerId) {
    self.command(NetworkCommand::Ban(peer));
  }

  pub fn disconnect(&self, peer: PeerId) {
    self.command(NetworkCommand::Disconnect(peer));
  }
}

/// What a reader task forwards to the supervisor.
enum Inbound {
  Frame(PeerId, Message),
  Garbage(PeerId),
  Closed(PeerId),
}

struct Supervisor {
  config: NetworkConfig,
  listener: TcpListener,
  events: UnboundedSender<NetworkEvent>,

  peers: HashMap<PeerId, Peer>,
  next_peer: PeerId,

  /// Dialable peer URLs for peer exchange and reconnects.
  book: BTreeSet<String>,

  /// IP → ban expiry.
  bans: Arc<DashMap<IpAddr, i64>>,

  inbound_tx: UnboundedSender<Inbound>,
  inbound_rx: UnboundedReceiver<Inbound>,

  dialed_tx: UnboundedSender<(String, Option<TcpStream>)>,
  dialed_rx: UnboundedReceiver<(String, Option<TcpStream>)>,
}

impl Supervisor {
  fn new(
    config: NetworkConfig,
    listener: TcpListener,
    events: UnboundedSender<NetworkEvent>,
  ) -> Self {
    let (inbound_tx, inbound_rx) = unbounded_channel();
    let (dialed_tx, dialed_rx) = unbounded_channel();
    Self {
      config,
      listener,
      events,
      peers: HashMap::new(),
      next_peer: 1,
      book: BTreeSet::new(),
      bans: Arc::new(DashMap::new()),
      inbound_tx,
      inbound_rx,
      dialed_tx,
      dialed_rx,
    }
  }

  fn emit(&self, event: NetworkEvent) {
    let _ = self.events.send(event);
  }

  fn our_handshake(&self) -> HandshakeInfo {
    HandshakeInfo {
      protocol_version: PROTOCOL_VERSION,
      min_protocol_version: MIN_PROTOCOL_VERSION,
      chain_id: self.config.chain_id.clone(),
      genesis_hash: self.config.genesis_hash.clone(),
      node_version: self.config.node_version.clone(),
      block_height: self.config.height.load(Ordering::Relaxed),
    }
  }

  async fn run(mut self, mut commands: UnboundedReceiver<NetworkCommand>) {
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    loop {
      tokio::select! {
        accepted = self.listener.accept() => {
          if let Ok((stream, addr)) = accepted {
            self.accept(stream, addr);
          }
        }

        Some(command) = commands.recv() => self.handle_command(command),

        Some(inbound) = self.inbound_rx.recv() => match inbound {
          Inbound::Frame(peer, message) => self.dispatch(peer, message),
          Inbound::Garbage(peer) => {
            self.adjust_score(peer, score::INVALID_MESSAGE);
          }
          Inbound::Closed(peer) => self.drop_peer(peer, None),
        },

        Some((url, stream)) = self.dialed_rx.recv() => match stream {
          Some(stream) => {
            if let Ok(addr) = stream.peer_addr() {
              self.book.insert(url);
              let id = self.spawn_peer(stream, addr, true);
              // the connector opens with its handshake
              if let Some(peer) = self.peers.get(&id) {
                peer.send(Message::Handshake(self.our_handshake()));
              }
            }
          }
          None => debug!("dial {url} failed"),
        },

        _ = sweep.tick() => self.sweep_deadlines(),
      }
    }
  }

  fn handle_command(&mut self, command: NetworkCommand) {
    match command {
      NetworkCommand::Connect(url) => self.dial(url),
      NetworkCommand::SendTo(peer, message) => {
        if let Some(peer) = self.peers.get(&peer) {
          peer.send(message);
        }
      }
      NetworkCommand::Gossip { message, except } => {
        for peer in self.peers.values() {
          if peer.is_ready() && Some(peer.id) != except {
            peer.send(message.clone());
          }
        }
      }
      NetworkCommand::Penalize { peer, delta } => {
        self.adjust_score(peer, delta)
      }
      NetworkCommand::Ban(peer) => {
        let until = Utc::now().timestamp_millis() + BAN_MS;
        self.drop_peer(peer, Some(until));
      }
      NetworkCommand::Disconnect(peer) => self.drop_peer(peer, None),
    }
  }

  fn dial(&mut self, url: String) {
    let dialed = self.dialed_tx.clone();
    tokio::spawn(async move {
      let stream = timeout(Duration::from_secs(5), TcpStream::connect(&url))
        .await
        .ok()
        .and_then(|result| result.ok());
      let _ = dialed.send((url, stream));
    });
  }

  fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
    let now = Utc::now().timestamp_millis();
    let ip = addr.ip();

    if self.bans.get(&ip).map(|until| *until > now).unwrap_or(false) {
      debug!("rejecting banned {ip}");
      return;
    }

    let per_ip = self.peers.values().filter(|p| p.addr.ip() == ip).count();
    if per_ip >= MAX_CONNS_PER_IP {
      debug!("per-ip cap reached for {ip}");
      return;
    }
    let subnet = subnet_of(&ip);
    let per_subnet = self
      .peers
      .values()
      .filter(|p| subnet_of(&p.addr.ip()) == subnet)
      .count();
    if per_subnet >= MAX_CONNS_PER_SUBNET {
      debug!("subnet cap reached for {subnet}");
      return;
    }

    self.spawn_peer(stream, addr, false);
  }

  /// Splits the connection into reader and writer tasks and
  /// registers the peer awaiting its handshake.
  fn spawn_peer(
    &mut self,
    stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
  ) -> PeerId {
    let id = self.next_peer;
    self.next_peer += 1;

    let framed = Framed::new(stream, Codec::default());
    let (mut sink, mut source) = framed.split();

    let (writer_tx, mut writer_rx) = unbounded_channel::<Message>();
    tokio::spawn(async move {
      while let Some(message) = writer_rx.recv().await {
        if sink.send(message).await.is_err() {
          break;
        }
      }
    });

    let inbound = self.inbound_tx.clone();
    tokio::spawn(async move {
      loop {
        match source.next().await {
          Some(Ok(message)) => {
            if inbound.send(Inbound::Frame(id, message)).is_err() {
              break;
            }
          }
          Some(Err(_)) => {
            let _ = inbound.send(Inbound::Garbage(id));
          }
          None => {
            let _ = inbound.send(Inbound::Closed(id));
            break;
          }
        }
      }
    });

    let deadline = Utc::now().timestamp_millis() + 10_000;
    let peer = Peer::new(id, addr, outbound, writer_tx, deadline);
    debug!(
      "{} connection {id} with {addr}",
      if outbound { "outbound" } else { "inbound" }
    );
    self.peers.insert(id, peer);
    id
  }

  fn adjust_score(&mut self, id: PeerId, delta: i32) {
    let score = match self.peers.get_mut(&id) {
      Some(peer) => {
        peer.score += delta;
        peer.score
      }
      None => return,
    };
    if score < 0 {
      info!("peer {id} scored out ({score})");
      let ban = (delta <= score::PROTOCOL_VIOLATION)
        .then(|| Utc::now().timestamp_millis() + BAN_MS);
      self.drop_peer(id, ban);
    }
  }

  fn drop_peer(&mut self, id: PeerId, ban: Option<i64>) {
    if let Some(peer) = self.peers.remove(&id) {
      if let Some(until) = ban {
        self.bans.insert(peer.addr.ip(), until);
        info!("banned {}", peer.addr.ip());
      }
      // dropping the sender ends the writer task; the reader ends
      // with the socket
      self.emit(NetworkEvent::PeerDisconnected { peer: id });
    }
  }

  fn sweep_deadlines(&mut self) {
    let now = Utc::now().timestamp_millis();

    let expired: Vec<(PeerId, bool)> = self
      .peers
      .values()
      .filter_map(|peer| match &peer.stage {
        PeerStage::AwaitHandshake { deadline_ms } if *deadline_ms < now => {
          Some((peer.id, false))
        }
        PeerStage::AwaitChallenge { deadline_ms, .. }
          if *deadline_ms < now =>
        {
          Some((peer.id, true))
        }
        _ => None,
      })
      .collect();

    for (id, challenge_expired) in expired {
      if challenge_expired {
        warn!("peer {id} failed to answer the challenge in time");
        self.adjust_score(id, score::EXPIRED_CHALLENGE);
      }
      self.drop_peer(id, None);
    }

    self.bans.retain(|_, until| *until > now);
  }

  fn dispatch(&mut self, id: PeerId, message: Message) {
    let now = Utc::now().timestamp_millis();

    #[derive(PartialEq, Clone, Copy)]
    enum Stage {
      Handshaking,
      Challenged,
      Ready,
    }
    let stage = match self.peers.get(&id) {
      Some(peer) => match peer.stage {
        PeerStage::AwaitHandshake { .. } => Stage::Handshaking,
        PeerStage::AwaitChallenge { .. } => Stage::Challenged,
        PeerStage::Ready => Stage::Ready,
      },
      None => return,
    };

    use Stage::*;
    match message {
      // admission traffic in its window
      Message::Handshake(info) if stage == Handshaking => {
        self.on_handshake(id, info, now)
      }
      Message::HandshakeAck(info) if stage == Handshaking => {
        self.on_handshake_ack(id, info)
      }
      Message::ChallengeResponse { solution } if stage == Challenged => {
        self.on_challenge_response(id, solution)
      }

      // the connector may be challenged at any point after dialing
      Message::Challenge { nonce, difficulty } => {
        let difficulty = difficulty.min(MAX_SOLVE_BITS);
        if let Some(peer) = self.peers.get(&id) {
          let sender = peer.sender.clone();
          tokio::spawn(async move {
            let solved =
              tokio::task::spawn_blocking(move || solve(&nonce, difficulty))
                .await;
            if let Ok(solution) = solved {
              let _ = sender.send(Message::ChallengeResponse { solution });
            }
          });
        }
      }

      // gossip and sync traffic from admitted peers
      Message::NewBlock(block) if stage == Ready => {
        self.emit(NetworkEvent::BlockReceived {
          peer: id,
          block: *block,
        })
      }
      Message::NewTransaction(envelope) if stage == Ready => {
        match *envelope {
          TxEnvelope::Plain(tx) => {
            self.emit(NetworkEvent::TransactionReceived { peer: id, tx })
          }
          TxEnvelope::Encrypted(tx) => {
            self.emit(NetworkEvent::EncryptedReceived { peer: id, tx })
          }
        }
      }
      Message::Attestation(attestation) if stage == Ready => {
        self.emit(NetworkEvent::AttestationReceived {
          peer: id,
          attestation: *attestation,
        })
      }

      Message::QueryLatest if stage == Ready => {
        self.emit(NetworkEvent::LatestRequested { peer: id })
      }
      Message::QueryAll if stage == Ready => {
        self.emit(NetworkEvent::AllRequested { peer: id })
      }
      Message::QueryBlocksFrom { start, limit } if stage == Ready => {
        self.emit(NetworkEvent::BlocksRequested {
          peer: id,
          start,
          limit: limit.min(MAX_BLOCKS_PER_RESPONSE),
        })
      }
      Message::QueryTxPool if stage == Ready => {
        self.emit(NetworkEvent::TxPoolRequested { peer: id })
      }

      Message::ResponseBlocks { start, blocks } if stage == Ready => {
        self.emit(NetworkEvent::BlocksResponse {
          peer: id,
          start,
          blocks,
        })
      }
      Message::ResponseBlockchain(blocks) if stage == Ready => {
        self.emit(NetworkEvent::ChainResponse { peer: id, blocks })
      }
      Message::ResponseTxPool(txs) if stage == Ready => {
        self.emit(NetworkEvent::TxPoolResponse { peer: id, txs })
      }

      Message::QueryPeers if stage == Ready => self.on_query_peers(id, now),
      Message::ResponsePeers(addrs) if stage == Ready => {
        let fresh: Vec<String> = addrs
          .into_iter()
          .filter(|addr| is_shareable_url(addr))
          .filter(|addr| self.book.insert(addr.clone()))
          .collect();
        if !fresh.is_empty() {
          self.emit(NetworkEvent::PeersDiscovered { addrs: fresh });
        }
      }

      // the peer refuses to talk to software this old
      Message::VersionReject {
        min_protocol_version,
        hint,
      } => {
        warn!(
          "peer {id} requires protocol {min_protocol_version} or newer: {hint}"
        );
        self.drop_peer(id, None);
      }

      // anything else is out of protocol for this stage
      _ => {
        debug!("peer {id} spoke out of turn");
        self.adjust_score(id, score::PROTOCOL_VIOLATION);
      }
    }
  }

  /// Inbound side: verify the handshake, acknowledge, challenge.
  fn on_handshake(&mut self, id: PeerId, info: HandshakeInfo, now: i64) {
    if info.chain_id != self.config.chain_id
      || info.genesis_hash != self.config.genesis_hash
    {
      warn!("peer {id} is on another network ({}), banning", info.chain_id);
      self.drop_peer(id, Some(i64::MAX));
      return;
    }
    if info.protocol_version < MIN_PROTOCOL_VERSION {
      if let Some(peer) = self.peers.get(&id) {
        peer.send(Message::VersionReject {
          min_protocol_version: MIN_PROTOCOL_VERSION,
          hint: format!(
            "please upgrade: this network speaks protocol {PROTOCOL_VERSION}"
          ),
        });
      }
      self.drop_peer(id, None);
      return;
    }

    let our = self.our_handshake();
    if let Some(peer) = self.peers.get_mut(&id) {
      peer.info = Some(info);
      peer.send(Message::HandshakeAck(our));

      let nonce = new_nonce();
      peer.send(Message::Challenge {
        nonce: nonce.clone(),
        difficulty: DIFFICULTY_BITS,
      });
      peer.stage = PeerStage::AwaitChallenge {
        nonce,
        deadline_ms: now + SOLVE_TIMEOUT_SECS as i64 * 1000,
      };
    }
  }

  /// Outbound side: the acceptor agreed; we are ready (it will
  /// still challenge us, which is handled in any stage).
  fn on_handshake_ack(&mut self, id: PeerId, info: HandshakeInfo) {
    if info.chain_id != self.config.chain_id
      || info.genesis_hash != self.config.genesis_hash
    {
      self.drop_peer(id, Some(i64::MAX));
      return;
    }
    if let Some(peer) = self.peers.get_mut(&id) {
      peer.info = Some(info.clone());
      peer.stage = PeerStage::Ready;
      self.emit(NetworkEvent::PeerReady { peer: id, info });
    }
  }

  fn on_challenge_response(&mut self, id: PeerId, solution: u64) {
    let verified = match self.peers.get(&id).map(|peer| &peer.stage) {
      Some(PeerStage::AwaitChallenge { nonce, .. }) => {
        verify(nonce, solution, DIFFICULTY_BITS)
      }
      _ => false,
    };

    if !verified {
      warn!("peer {id} sent a bogus challenge solution");
      let until = Utc::now().timestamp_millis() + BAN_MS;
      self.drop_peer(id, Some(until));
      return;
    }

    if let Some(peer) = self.peers.get_mut(&id) {
      peer.stage = PeerStage::Ready;
      let info = peer.info.clone().expect("handshake preceded challenge");
      self.emit(NetworkEvent::PeerReady { peer: id, info });
    }
  }

  fn on_query_peers(&mut self, id: PeerId, now: i64) {
    let addrs: Vec<String> = self
      .book
      .iter()
      .filter(|url| is_shareable_url(url))
      .take(PEX_MAX_ADDRS)
      .cloned()
      .collect();

    if let Some(peer) = self.peers.get_mut(&id) {
      if now - peer.last_pex_ms < PEX_INTERVAL_MS {
        debug!("peer {id} is polling peer exchange too fast");
        return;
      }
      peer.last_pex_ms = now;
      peer.send(Message::ResponsePeers(addrs));
    }
  }
}
