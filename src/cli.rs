use {
  crate::ledger::{GenesisConfig, GenesisError},
  clap::Parser,
  std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
  },
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct CliOpts {
  #[clap(
    short,
    long,
    help = "listen address of the node",
    default_value = "0.0.0.0"
  )]
  pub addr: IpAddr,

  #[clap(short, long, help = "listen port of the node", default_value = "44668")]
  pub port: u16,

  #[clap(
    short,
    long,
    help = "directory for keys, chain store and snapshots",
    default_value = "~/.lvenc"
  )]
  pub data_dir: String,

  #[clap(
    short,
    long,
    help = "path to genesis.json (defaults to <data-dir>/genesis.json)"
  )]
  pub genesis: Option<String>,

  #[clap(
    long = "peer",
    help = "bootstrap peer address (host:port), repeatable",
    multiple_occurrences(true)
  )]
  pub peers: Vec<String>,

  #[clap(
    short,
    long,
    parse(from_occurrences),
    help = "Use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,
}

impl CliOpts {
  pub fn listen_addr(&self) -> SocketAddr {
    SocketAddr::new(self.addr, self.port)
  }

  pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
    let expanded = shellexpand::full(&self.data_dir)?;
    let path = PathBuf::from(expanded.as_ref());
    std::fs::create_dir_all(&path)?;
    Ok(path)
  }

  pub fn genesis(&self) -> Result<GenesisConfig, GenesisError> {
    let path = match &self.genesis {
      Some(path) => PathBuf::from(path),
      None => self
        .data_dir()
        .map_err(|e| {
          GenesisError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            e.to_string(),
          ))
        })?
        .join("genesis.json"),
    };
    GenesisConfig::load(path)
  }
}
