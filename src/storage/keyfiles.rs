//! Key files
//!
//! `identity.key` holds the node's p2p identity seed as hex;
//! `priv_validator_key.json` holds the consensus signing key. Both
//! are created on first start and written with owner-only
//! permissions.

use {
  super::StorageError,
  crate::primitives::Keypair,
  serde::{Deserialize, Serialize},
  std::path::Path,
  tracing::info,
};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidatorKeyFile {
  consensus_pubkey: String,
  priv_key: String,
}

fn write_restricted(path: &Path, contents: &str) -> std::io::Result<()> {
  std::fs::write(path, contents)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
  }
  Ok(())
}

/// Loads the p2p identity, generating one on first run.
pub fn load_or_create_identity(
  path: impl AsRef<Path>,
) -> Result<Keypair, StorageError> {
  let path = path.as_ref();
  if path.exists() {
    let raw = std::fs::read_to_string(path)?;
    return raw
      .trim()
      .parse()
      .map_err(|e| StorageError::Corrupt(format!("{}: {e}", path.display())));
  }

  let keypair = Keypair::generate();
  write_restricted(path, &keypair.secret_hex())?;
  info!("generated node identity {}", keypair.public());
  Ok(keypair)
}

/// Loads the validator consensus key, generating one on first run.
pub fn load_or_create_validator_key(
  path: impl AsRef<Path>,
) -> Result<Keypair, StorageError> {
  let path = path.as_ref();
  if path.exists() {
    let raw = std::fs::read_to_string(path)?;
    let file: ValidatorKeyFile = serde_json::from_str(&raw).map_err(|e| {
      StorageError::Corrupt(format!("{}: {e}", path.display()))
    })?;
    return file
      .priv_key
      .parse()
      .map_err(|e| StorageError::Corrupt(format!("{}: {e}", path.display())));
  }

  let keypair = Keypair::generate();
  let file = ValidatorKeyFile {
    consensus_pubkey: keypair.public().to_hex(),
    priv_key: keypair.secret_hex(),
  };
  write_restricted(
    path,
    &serde_json::to_string_pretty(&file).expect("key file serializes"),
  )?;
  info!("generated validator consensus key {}", keypair.public());
  Ok(keypair)
}

#[cfg(test)]
mod test {
  use super::{load_or_create_identity, load_or_create_validator_key};

  #[test]
  fn identity_persists_across_loads() {
    let dir = std::env::temp_dir()
      .join(format!("lvenc-keys-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();

    let path = dir.join("identity.key");
    let first = load_or_create_identity(&path).unwrap();
    let second = load_or_create_identity(&path).unwrap();
    assert_eq!(first.public(), second.public());

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let mode = std::fs::metadata(&path).unwrap().permissions().mode();
      assert_eq!(mode & 0o777, 0o600);
    }
    std::fs::remove_dir_all(dir).ok();
  }

  #[test]
  fn validator_key_roundtrip() {
    let dir = std::env::temp_dir()
      .join(format!("lvenc-keys-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();

    let path = dir.join("priv_validator_key.json");
    let first = load_or_create_validator_key(&path).unwrap();
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains(&first.public().to_hex()));

    let second = load_or_create_validator_key(&path).unwrap();
    assert_eq!(first.public(), second.public());
    std::fs::remove_dir_all(dir).ok();
  }
}
