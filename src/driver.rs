//! Row-level entry point tying the packed codec to the sharded WAL.

use crate::buffer::Buffer;
use crate::config::Config;
use crate::error::Result;
use crate::ident::BucketId;
use crate::packed::{decode_rows, encode_rows, Row, Tail};
use crate::shard::{ArchiveConsumer, ShardWal};
use crate::wal::replicator::Replicator;
use std::collections::HashMap;
use std::sync::Arc;

/// Serves packed table files: appends row batches, reads them back with
/// automatic tail repair, and drives archive/flush/close on the underlying
/// sharded WAL.
pub struct Driver {
  config: Config,
  shard_wal: ShardWal,
}

impl Driver {
  pub fn open(config: Config, consumer: Option<Arc<dyn ArchiveConsumer>>) -> Result<Self> {
    let shard_wal = ShardWal::open(config.clone(), consumer)?;
    Ok(Self { config, shard_wal })
  }

  /// Encodes `rows` as framed packed rows and appends them to the
  /// identifier's file.
  pub fn append_rows(&self, id: &BucketId, rows: &[Row]) -> Result<()> {
    let mut frames = Buffer::new();
    encode_rows(rows, &mut frames)?;
    let mut engine = self.shard_wal.lock_for(id);
    engine.append_write(id, &[frames.as_slice()])
  }

  /// Reads every row of the identifier. A corrupt tail is repaired on the
  /// spot: the file is truncated to its sane offset and the rows before it
  /// are returned.
  pub fn read_all_rows(&self, id: &BucketId) -> Result<Vec<Row>> {
    let mut engine = self.shard_wal.lock_for(id);
    let mut buf = Buffer::new();
    engine.file_buffer(id, &mut buf)?;
    let decoded = decode_rows(&mut buf)?;
    if let Tail::BadCrc { sane_offset } = decoded.tail {
      tracing::warn!(
        target: "packdb",
        key = %id.key(),
        sane_offset,
        "bad trailing row crc, truncating to the last sane offset"
      );
      engine.truncate(id, sane_offset)?;
    }
    Ok(decoded.rows)
  }

  /// Reads the identifier's raw consistent content.
  pub fn read_file(&self, id: &BucketId, buf: &mut Buffer) -> Result<()> {
    self.shard_wal.lock_for(id).file_buffer(id, buf)
  }

  /// Current logical size of the identifier.
  pub fn cur_file_size(&self, id: &BucketId) -> Result<u64> {
    self.shard_wal.lock_for(id).cur_file_size(id)
  }

  /// Stages a truncate of the identifier to `offset` payload bytes.
  pub fn truncate(&self, id: &BucketId, offset: u64) -> Result<()> {
    self.shard_wal.lock_for(id).truncate(id, offset)
  }

  /// Stages an archive of the identifier's current content.
  pub fn archive(&self, id: &BucketId) -> Result<()> {
    self.shard_wal.lock_for(id).archive(id)
  }

  /// Checkpoints every shard, returning the count of operations whose
  /// apply failed.
  pub fn flush(&self) -> Result<usize> {
    self.shard_wal.flush_all()
  }

  /// Flushes and closes everything.
  pub fn close(mut self) -> Result<()> {
    self.shard_wal.close_all()
  }

  /// Builds a replicator over the WAL-archive event stream. Only the first
  /// call yields one; the stream has a single consumer.
  pub fn replicator(&mut self) -> Option<Replicator> {
    let rx = self.shard_wal.take_wal_archive_receiver()?;
    Some(Replicator::new(
      rx,
      self.config.replication_active_folder.clone(),
      self.config.replication_archive_folder.clone(),
      None,
    ))
  }

  /// Quiesces the engine and runs the configured sync command.
  pub fn exec_sync_command(&mut self, params: &HashMap<String, Vec<String>>) -> Result<Vec<u8>> {
    self.shard_wal.exec_sync_command(params)
  }

  pub fn shard_wal(&self) -> &ShardWal {
    &self.shard_wal
  }

  pub fn config(&self) -> &Config {
    &self.config
  }
}
