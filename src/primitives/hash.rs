use sha2::{Digest, Sha256};

/// SHA-256 digest of the input bytes.
pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
  let mut hasher = Sha256::new();
  hasher.update(data.as_ref());
  hasher.finalize().into()
}

/// SHA-256 digest rendered as lowercase hex.
///
/// This is the hash representation used for block hashes,
/// transaction pre-images and everything else on the wire.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
  hex::encode(sha256(data))
}

/// Number of leading zero bits in a digest. Used by the proof-of-work
/// connection challenge to measure solution difficulty.
pub fn leading_zero_bits(digest: &[u8; 32]) -> u32 {
  let mut bits = 0;
  for byte in digest {
    if *byte == 0 {
      bits += 8;
    } else {
      bits += byte.leading_zeros();
      break;
    }
  }
  bits
}

#[cfg(test)]
mod test {
  use super::{leading_zero_bits, sha256_hex};

  #[test]
  fn known_digest() {
    assert_eq!(
      sha256_hex(b"abc"),
      "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
  }

  #[test]
  fn zero_bit_counting() {
    assert_eq!(leading_zero_bits(&[0u8; 32]), 256);
    let mut digest = [0u8; 32];
    digest[0] = 0b0000_0001;
    assert_eq!(leading_zero_bits(&digest), 7);
    digest[0] = 0b1000_0000;
    assert_eq!(leading_zero_bits(&digest), 0);
    digest[0] = 0;
    digest[2] = 0b0010_0000;
    assert_eq!(leading_zero_bits(&digest), 18);
  }
}
