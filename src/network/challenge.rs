//! Proof-of-work connection challenge
//!
//! Inbound connections are cheap to open in bulk; the acceptor
//! makes identities expensive by demanding a small proof of work
//! before a peer is admitted: find a solution such that
//! `SHA256(nonce ‖ solution)` starts with enough zero bits.

use crate::primitives::{leading_zero_bits, sha256};

/// Required leading zero bits for inbound peers.
pub const DIFFICULTY_BITS: u32 = 16;

/// Hardest challenge this node will agree to solve. Anything above
/// is a peer trying to burn our CPU.
pub const MAX_SOLVE_BITS: u32 = 20;

/// Seconds a connector has to answer before it is dropped.
pub const SOLVE_TIMEOUT_SECS: u64 = 30;

/// A fresh random challenge nonce.
pub fn new_nonce() -> String {
  let mut bytes = [0u8; 16];
  rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
  hex::encode(bytes)
}

pub fn verify(nonce: &str, solution: u64, difficulty: u32) -> bool {
  let digest = sha256(format!("{nonce}{solution}"));
  leading_zero_bits(&digest) >= difficulty
}

/// Brute-forces a solution. At 16 bits this takes ~65k hashes on
/// average; callers run it on a blocking worker thread.
pub fn solve(nonce: &str, difficulty: u32) -> u64 {
  let mut solution = 0u64;
  loop {
    if verify(nonce, solution, difficulty) {
      return solution;
    }
    solution += 1;
  }
}

#[cfg(test)]
mod test {
  use super::{new_nonce, solve, verify};

  #[test]
  fn solve_and_verify() {
    // low difficulty keeps the test fast while exercising the
    // whole path
    let nonce = new_nonce();
    let solution = solve(&nonce, 8);
    assert!(verify(&nonce, solution, 8));
  }

  #[test]
  fn rejects_insufficient_work() {
    let solution = solve("aaaa", 8);
    assert!(verify("aaaa", solution, 8));
    // the same work cannot satisfy an absurd difficulty
    assert!(!verify("aaaa", solution, 255));
  }

  #[test]
  fn nonces_are_unique() {
    assert_ne!(new_nonce(), new_nonce());
  }
}
