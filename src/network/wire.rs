//! Wire protocol
//!
//! JSON messages framed with a length prefix over plain TCP. Every
//! frame decodes to `{type, data}` with the tags fixed by the
//! protocol; unknown tags fail decoding and count against the
//! sending peer.

use {
  crate::{
    consensus::Attestation,
    ledger::{Block, Transaction},
    mempool::EncryptedTransaction,
  },
  bytes::{Bytes, BytesMut},
  serde::{Deserialize, Serialize},
  thiserror::Error,
  tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec},
};

/// Current and minimum-supported protocol versions.
pub const PROTOCOL_VERSION: u32 = 2;
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// Frames above this size are rejected before parsing.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Largest number of blocks served per backfill request.
pub const MAX_BLOCKS_PER_RESPONSE: u64 = 1000;

/// Chunk size this node requests while catching up.
pub const SYNC_CHUNK: u64 = 500;

#[derive(Debug, Error)]
pub enum WireError {
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("malformed frame: {0}")]
  Malformed(#[from] serde_json::Error),

  #[error("frame exceeds the size limit")]
  Oversized,
}

/// The handshake payload both sides exchange on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInfo {
  pub protocol_version: u32,
  pub min_protocol_version: u32,
  pub chain_id: String,
  pub genesis_hash: String,
  pub node_version: String,
  pub block_height: u64,
}

/// A transaction submission: plaintext, or an encrypted envelope
/// for the private mempool. Both travel under the NEW_TRANSACTION
/// tag and are told apart by shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxEnvelope {
  Plain(Transaction),
  Encrypted(EncryptedTransaction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
  tag = "type",
  content = "data",
  rename_all = "SCREAMING_SNAKE_CASE"
)]
pub enum Message {
  Handshake(HandshakeInfo),
  HandshakeAck(HandshakeInfo),
  VersionReject {
    #[serde(rename = "minProtocolVersion")]
    min_protocol_version: u32,
    hint: String,
  },
  QueryLatest,
  QueryAll,
  ResponseBlockchain(Vec<Block>),
  QueryBlocksFrom {
    start: u64,
    limit: u64,
  },
  ResponseBlocks {
    start: u64,
    blocks: Vec<Block>,
  },
  QueryTxPool,
  ResponseTxPool(Vec<Transaction>),
  NewBlock(Box<Block>),
  NewTransaction(Box<TxEnvelope>),
  QueryPeers,
  ResponsePeers(Vec<String>),
  Challenge {
    nonce: String,
    difficulty: u32,
  },
  ChallengeResponse {
    solution: u64,
  },
  Attestation(Box<Attestation>),
}

/// Length-prefixed JSON codec for [`Message`] frames.
pub struct Codec {
  frames: LengthDelimitedCodec,
}

impl Default for Codec {
  fn default() -> Self {
    Self {
      frames: LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec(),
    }
  }
}

impl Encoder<Message> for Codec {
  type Error = WireError;

  fn encode(
    &mut self,
    message: Message,
    dst: &mut BytesMut,
  ) -> Result<(), Self::Error> {
    let payload = serde_json::to_vec(&message)?;
    if payload.len() > MAX_FRAME_BYTES {
      return Err(WireError::Oversized);
    }
    self
      .frames
      .encode(Bytes::from(payload), dst)
      .map_err(WireError::Io)
  }
}

impl Decoder for Codec {
  type Item = Message;
  type Error = WireError;

  fn decode(
    &mut self,
    src: &mut BytesMut,
  ) -> Result<Option<Self::Item>, Self::Error> {
    // the length codec rejects oversized frames before any
    // allocation happens
    let frame = match self.frames.decode(src).map_err(|e| {
      if e.kind() == std::io::ErrorKind::InvalidData {
        WireError::Oversized
      } else {
        WireError::Io(e)
      }
    })? {
      Some(frame) => frame,
      None => return Ok(None),
    };
    Ok(Some(serde_json::from_slice(&frame)?))
  }
}
