//! Peer bookkeeping
//!
//! One entry per live connection: where it came from, how far it
//! got through the admission protocol (handshake, then proof-of-work
//! challenge for inbound peers) and how it has behaved since. All
//! mutation happens on the supervisor task.

use {
  super::wire::{HandshakeInfo, Message},
  std::net::{IpAddr, SocketAddr},
  tokio::sync::mpsc::UnboundedSender,
};

pub type PeerId = u64;

/// Score deltas. Every peer starts at [`score::INITIAL`]; dropping
/// below zero disconnects it.
pub mod score {
  pub const INITIAL: i32 = 50;

  pub const VALID_BLOCK: i32 = 2;
  pub const VALID_TRANSACTION: i32 = 1;

  pub const INVALID_MESSAGE: i32 = -10;
  pub const PROTOCOL_VIOLATION: i32 = -25;
  pub const FAILED_SYNC: i32 = -20;
  pub const EXPIRED_CHALLENGE: i32 = -50;
}

/// Connection caps.
pub const MAX_CONNS_PER_IP: usize = 3;
pub const MAX_CONNS_PER_SUBNET: usize = 5;

/// Duration of an IP ban after a serious violation.
pub const BAN_MS: i64 = 3_600_000;

/// Minimum spacing between peer-exchange replies to one peer.
pub const PEX_INTERVAL_MS: i64 = 10_000;

/// Most addresses shared in one peer-exchange reply.
pub const PEX_MAX_ADDRS: usize = 10;

/// Where a connection is in the admission protocol.
#[derive(Debug)]
pub enum PeerStage {
  /// Waiting for HANDSHAKE (inbound) or HANDSHAKE_ACK (outbound).
  AwaitHandshake { deadline_ms: i64 },

  /// Inbound peer must answer this challenge nonce in time.
  AwaitChallenge { nonce: String, deadline_ms: i64 },

  Ready,
}

pub struct Peer {
  pub id: PeerId,
  pub addr: SocketAddr,
  pub outbound: bool,

  /// Handle to this peer's writer task.
  pub sender: UnboundedSender<Message>,

  pub score: i32,
  pub stage: PeerStage,
  pub info: Option<HandshakeInfo>,
  pub last_pex_ms: i64,
}

impl Peer {
  pub fn new(
    id: PeerId,
    addr: SocketAddr,
    outbound: bool,
    sender: UnboundedSender<Message>,
    deadline_ms: i64,
  ) -> Self {
    Self {
      id,
      addr,
      outbound,
      sender,
      score: score::INITIAL,
      stage: PeerStage::AwaitHandshake { deadline_ms },
      info: None,
      last_pex_ms: 0,
    }
  }

  pub fn is_ready(&self) -> bool {
    matches!(self.stage, PeerStage::Ready)
  }

  /// Queues a message on the writer task. Send failures mean the
  /// writer is gone; the reader side will surface the disconnect.
  pub fn send(&self, message: Message) {
    let _ = self.sender.send(message);
  }
}

/// The /24 bucket an IPv4 address belongs to (IPv6 uses /48).
pub fn subnet_of(ip: &IpAddr) -> String {
  match ip {
    IpAddr::V4(v4) => {
      let [a, b, c, _] = v4.octets();
      format!("{a}.{b}.{c}")
    }
    IpAddr::V6(v6) => {
      let segments = v6.segments();
      format!("{:x}:{:x}:{:x}", segments[0], segments[1], segments[2])
    }
  }
}

fn ip_is_private(ip: &IpAddr) -> bool {
  match ip {
    IpAddr::V4(v4) => {
      v4.is_private()
        || v4.is_loopback()
        || v4.is_link_local()
        || v4.is_unspecified()
    }
    IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
  }
}

/// Whether a `host:port` URL may be shared through peer exchange.
/// Private and loopback addresses never leave the node.
pub fn is_shareable_url(url: &str) -> bool {
  let (host, port) = match url.rsplit_once(':') {
    Some(parts) => parts,
    None => return false,
  };
  if port.parse::<u16>().is_err() {
    return false;
  }
  match host.parse::<IpAddr>() {
    Ok(ip) => !ip_is_private(&ip),
    // hostnames resolve elsewhere; share them as-is
    Err(_) => !host.is_empty(),
  }
}
