//! Slot schedule and producer election
//!
//! Wall-clock time is divided into fixed slots counted from the
//! genesis timestamp. For every slot exactly one validator is
//! expected to produce: the election hashes the parent block hash
//! together with the slot number and samples the active set weighted
//! by effective stake. Everything is integer arithmetic over a
//! canonically ordered validator set, so every node agrees on who
//! should have produced every slot.

use {
  crate::{
    primitives::sha256,
    staking::ValidatorRecord,
  },
  chrono::{DateTime, Utc},
  futures::{Future, Stream},
  std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
  },
  tokio::time::{sleep_until, Instant, Sleep},
};

/// The slot number a timestamp falls into, or None before genesis.
pub fn slot_at(
  genesis_time: DateTime<Utc>,
  slot_interval: Duration,
  now_ms: i64,
) -> Option<u64> {
  let elapsed = now_ms - genesis_time.timestamp_millis();
  if elapsed < 0 {
    return None;
  }
  Some(elapsed as u64 / slot_interval.as_millis() as u64)
}

/// The election seed for a slot: `SHA256(previousHash ‖ slot)`.
pub fn election_seed(previous_hash: &str, slot: u64) -> [u8; 32] {
  sha256(format!("{previous_hash}{slot}"))
}

/// Reduces a 32-byte seed modulo `modulus`, treating the seed as a
/// big-endian integer.
fn seed_mod(seed: &[u8; 32], modulus: u128) -> u128 {
  debug_assert!(modulus > 0);
  let mut r: u128 = 0;
  for byte in seed {
    r = (r * 256 + *byte as u128) % modulus;
  }
  r
}

/// Elects the producer for `slot` on top of the block with hash
/// `previous_hash`. The iterator must yield the active validator
/// set in canonical (ascending operator address) order; a cumulative
/// walk over effective stakes picks the winner.
pub fn elect_producer<'a>(
  previous_hash: &str,
  slot: u64,
  validators: impl Iterator<Item = &'a ValidatorRecord>,
) -> Option<&'a ValidatorRecord> {
  let validators: Vec<_> = validators.collect();
  let total: u128 = validators
    .iter()
    .map(|v| v.effective_stake().units() as u128)
    .sum();
  if total == 0 {
    return None;
  }

  let ticket = seed_mod(&election_seed(previous_hash, slot), total);
  let mut cumulative: u128 = 0;
  for validator in validators {
    cumulative += validator.effective_stake().units() as u128;
    if ticket < cumulative {
      return Some(validator);
    }
  }
  unreachable!("ticket is always below the cumulative total");
}

/// A stream of slot numbers, firing once at the start of every slot
/// aligned to the genesis time. If the node falls behind (or starts
/// late) intermediate slots are skipped rather than replayed.
pub struct SlotTicker {
  genesis_ms: i64,
  interval_ms: u64,
  next_slot: u64,
  timer: Pin<Box<Sleep>>,
}

impl SlotTicker {
  pub fn new(genesis_time: DateTime<Utc>, slot_interval: Duration) -> Self {
    let genesis_ms = genesis_time.timestamp_millis();
    let interval_ms = slot_interval.as_millis() as u64;
    let next_slot = slot_at(genesis_time, slot_interval, Utc::now().timestamp_millis())
      .map(|s| s + 1)
      .unwrap_or(0);
    Self {
      genesis_ms,
      interval_ms,
      next_slot,
      timer: Box::pin(sleep_until(Instant::now())),
    }
  }

  /// Milliseconds until the start of `slot`.
  fn until_slot(&self, slot: u64, now_ms: i64) -> i64 {
    self.genesis_ms + (slot * self.interval_ms) as i64 - now_ms
  }
}

impl Stream for SlotTicker {
  type Item = u64;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    loop {
      let now_ms = Utc::now().timestamp_millis();
      let remaining = self.until_slot(self.next_slot, now_ms);

      if remaining <= 0 {
        let slot = self.next_slot;
        // if we overslept by more than a slot, skip the stale ones
        let current = ((now_ms - self.genesis_ms) as u64) / self.interval_ms;
        self.next_slot = std::cmp::max(slot, current) + 1;
        return Poll::Ready(Some(std::cmp::max(slot, current)));
      }

      let deadline = Instant::now() + Duration::from_millis(remaining as u64);
      self.timer.as_mut().reset(deadline);
      match self.timer.as_mut().poll(cx) {
        Poll::Ready(()) => continue,
        Poll::Pending => return Poll::Pending,
      }
    }
  }
}
