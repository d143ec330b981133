use crate::config::Config;
use crate::error::Result;
use byteorder::{BigEndian, ByteOrder};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Tiny on-disk counter holding the next WAL sequence number for one shard,
/// monotonically increasing across restarts.
pub struct PersistentState {
  pub wal_index: u64,
  file: File,
}

impl PersistentState {
  /// Opens (creating if needed) `state-<shard:05>.bin` in the WAL folder.
  pub fn open(config: &Config, shard_index: u32) -> Result<Self> {
    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(state_path(config, shard_index))?;

    let mut state = Self { wal_index: 0, file };
    let mut buf = [0u8; 8];
    state.file.seek(SeekFrom::Start(0))?;
    let mut read = 0;
    while read < buf.len() {
      let n = state.file.read(&mut buf[read..])?;
      if n == 0 {
        break;
      }
      read += n;
    }
    if read == buf.len() {
      state.wal_index = BigEndian::read_u64(&buf);
    }
    Ok(state)
  }

  /// Persists the counter.
  pub fn save(&mut self) -> Result<()> {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, self.wal_index);
    self.file.seek(SeekFrom::Start(0))?;
    self.file.write_all(&buf)?;
    self.file.sync_data()?;
    Ok(())
  }
}

fn state_path(config: &Config, shard_index: u32) -> PathBuf {
  config
    .wal_folder
    .join(format!("state-{:05}.bin", shard_index))
}
