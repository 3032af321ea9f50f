use {
  clap::Parser,
  lvenc::{
    cli::CliOpts,
    node::Node,
    storage::{
      load_or_create_identity, load_or_create_validator_key, SledStore,
    },
  },
  std::sync::Arc,
  tracing::{error, info, Level},
  tracing_subscriber::{
    filter::filter_fn,
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    Layer,
  },
};

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn print_essentials(opts: &CliOpts) -> anyhow::Result<()> {
  info!("Starting LVE validator node");
  info!("Version: {}", env!("CARGO_PKG_VERSION"));
  info!("Listen address: {}", opts.listen_addr());
  info!("Data directory: {}", opts.data_dir()?.display());

  let genesis = opts.genesis()?;
  info!("Chain id: {}", genesis.chain_id);
  info!("Genesis hash: {}", genesis.hash());
  Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => Level::DEBUG,
    2 => Level::TRACE,
    _ => Level::INFO,
  };
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer().with_filter(filter_fn(
      move |metadata| {
        !metadata.target().starts_with("sled")
          && metadata.level() <= &loglevel
      },
    )))
    .init();

  print_essentials(&opts)?;

  let genesis = opts.genesis()?;
  let data_dir = opts.data_dir()?;

  // the p2p identity and the consensus signing key; both stay on
  // this machine with owner-only permissions
  let identity = load_or_create_identity(data_dir.join("identity.key"))?;
  info!("P2P identity: {}", identity.public());
  let consensus_key =
    load_or_create_validator_key(data_dir.join("priv_validator_key.json"))?;
  info!("Consensus key: {}", consensus_key.public());

  let storage = Arc::new(SledStore::open(&data_dir)?);

  let node = match Node::new(
    genesis,
    consensus_key,
    storage,
    opts.listen_addr(),
    opts.peers.clone(),
  )
  .await
  {
    Ok(node) => node,
    Err(e) => {
      error!("{e}");
      std::process::exit(e.exit_code());
    }
  };

  if let Err(e) = node.run().await {
    error!("{e}");
    std::process::exit(e.exit_code());
  }

  Ok(())
}
