mod block;
mod genesis;
mod state;
mod transaction;

pub use {
  block::Block,
  genesis::{
    ConsensusParams, GenesisBalance, GenesisConfig, GenesisError,
    GenesisValidator,
  },
  state::{ErrorKind, Ledger, LedgerError},
  transaction::{
    Transaction, TransactionError, TxData, TxTarget, TxType,
  },
};
