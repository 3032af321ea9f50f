//! Generates the key files a fresh validator needs: the node p2p
//! identity and the consensus signing key. Refuses to overwrite
//! existing keys.

use {
  clap::Parser,
  lvenc::storage::{load_or_create_identity, load_or_create_validator_key},
  std::path::PathBuf,
};

#[derive(Debug, Parser)]
#[clap(version, about = "generate node key files")]
struct KeygenOpts {
  #[clap(
    short,
    long,
    help = "directory to write key files into",
    default_value = "~/.lvenc"
  )]
  data_dir: String,
}

fn main() -> anyhow::Result<()> {
  let opts = KeygenOpts::parse();
  let dir = PathBuf::from(shellexpand::full(&opts.data_dir)?.as_ref());
  std::fs::create_dir_all(&dir)?;

  let identity_path = dir.join("identity.key");
  let existed = identity_path.exists();
  let identity = load_or_create_identity(&identity_path)?;
  println!(
    "identity.key: {} ({})",
    identity.public(),
    if existed { "existing" } else { "created" }
  );

  let validator_path = dir.join("priv_validator_key.json");
  let existed = validator_path.exists();
  let consensus = load_or_create_validator_key(&validator_path)?;
  println!(
    "priv_validator_key.json: {} ({})",
    consensus.public(),
    if existed { "existing" } else { "created" }
  );

  Ok(())
}
