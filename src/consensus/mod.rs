//! Consensus
//!
//! Slot-based proof-of-stake: a deterministic stake-weighted
//! election picks one producer per slot, peers validate and apply
//! its block, and a BFT attestation layer promotes blocks to
//! irreversible finality at a two-thirds stake quorum.

mod chain;
mod finality;
mod producer;
mod schedule;

pub use {
  chain::{Chain, ChainError},
  finality::{Attestation, AttestationError, FinalityEvent, FinalityTracker},
  producer::BlockProducer,
  schedule::{elect_producer, election_seed, slot_at, SlotTicker},
};
