mod address;
mod amount;
mod hash;
mod keys;

pub use {
  address::{Address, AddressError},
  amount::{Amount, AmountError, SCALE},
  hash::{leading_zero_bits, sha256, sha256_hex},
  keys::{recover_signer_hex, Keypair, KeypairError, Pubkey, WalletKeypair},
};
