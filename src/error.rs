use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("I/O Error: {0}")]
  Io(#[from] io::Error),

  #[error("Bad trailing row CRC, file is sane up to offset {sane_offset}")]
  BadTailCrc { sane_offset: u64 },

  #[error("Corrupted WAL command record: {0}")]
  BadWalCommand(String),

  #[error("WAL shard layout mismatch: file has {found}, runtime expects {expected}")]
  ShardMismatch { expected: u64, found: u64 },

  #[error("Data Corruption: {0}")]
  Corruption(String),

  #[error("Configuration Error: {0}")]
  Config(String),

  #[error("Invalid identifier: {0}")]
  InvalidIdentifier(String),

  #[error("External command failed: {0}")]
  External(String),
}

impl Error {
  /// True for the repairable trailing-corruption case.
  pub fn is_bad_tail_crc(&self) -> bool {
    matches!(self, Error::BadTailCrc { .. })
  }
}
