//! Per-shard WAL engine.
//!
//! Every mutation is staged as a command in the current WAL generation.
//! A checkpoint flushes the command stream, applies it through the
//! descriptor cache, stamps the success bitmap, archives the WAL file and
//! carries unapplied commands into the next generation with a bumped retry
//! count.

pub(crate) mod file;
pub mod replicator;
pub(crate) mod state;

use crate::buffer::Buffer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fileop::op::{error_for_item, FileBatchOp, Op, OpKind};
use crate::fileop::BucketFileOps;
use crate::ident::BucketId;
use file::{CmdKind, WalCmd, WalFile, HEADER_LEN, SUCCESS_OPERATION_COUNT};
use state::PersistentState;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::Instant;

const WAL_ARCHIVE_FILE_PREFIX: &str = "wal-";

/// A command that fails apply this many times is abandoned.
pub(crate) const MAX_RETRY_COUNT: u8 = 2;

/// Fixed per-record accounting overhead besides the payload.
fn record_overhead(key: &str) -> usize {
  key.len() + 27
}

/// One shard's WAL engine. Not internally synchronized: the shard
/// multiplexer guards each engine with its own mutex.
pub struct Wal {
  config: Config,
  shard_index: u32,
  file_ops: BucketFileOps,
  wal_file: WalFile,
  writer: Option<BufWriter<File>>,
  /// Number of command records already written to the live WAL file.
  flushed_cmds: usize,
  /// Accounted bytes of the current generation, for the soft size trigger.
  running_size: usize,
  last_checkpoint: Instant,
  /// Operation index at or below which pending writes must not be merged
  /// with: everything there may already be materialized on disk.
  merge_barrier: i64,
  /// Shared compare-and-swap slot serializing soft checkpoints.
  checkpoint_slot: Arc<AtomicI32>,
  persistent: PersistentState,
  wal_archive_tx: Option<SyncSender<PathBuf>>,
  archive_event_tx: Option<SyncSender<PathBuf>>,
}

impl Wal {
  /// Opens the engine for one shard, loading and checkpointing any WAL
  /// left behind by a previous run so no shard ever starts with pending
  /// work on disk.
  pub(crate) fn open(
    config: Config,
    shard_index: u32,
    checkpoint_slot: Arc<AtomicI32>,
    archive_event_tx: Option<SyncSender<PathBuf>>,
    wal_archive_tx: Option<SyncSender<PathBuf>>,
  ) -> Result<Self> {
    if let Some(folder) = &config.wal_archive_folder {
      fs::create_dir_all(folder)?;
    }
    fs::create_dir_all(&config.wal_folder)?;

    let mut persistent = PersistentState::open(&config, shard_index)?;
    let path = wal_path(&config, shard_index);
    let loaded = load_existing_wal_file(&path, &config, shard_index)?;

    let (wal_file, writer, flushed_cmds) = match loaded {
      Some(wal_file) => {
        // Reopen the live file so the recovery checkpoint can stamp the
        // bitmap and archive it. Its records are already on disk.
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::End(0))?;
        let flushed = wal_file.cmd_count();
        (wal_file, Some(writer), flushed)
      }
      None => {
        persistent.wal_index += 1;
        persistent.save()?;
        (
          WalFile::new(persistent.wal_index, shard_index as u64, config.shard_count as u64),
          None,
          0,
        )
      }
    };

    let file_ops = BucketFileOps::new(config.clone());
    let mut wal = Self {
      config,
      shard_index,
      file_ops,
      wal_file,
      writer,
      flushed_cmds,
      running_size: 0,
      last_checkpoint: Instant::now(),
      merge_barrier: -1,
      checkpoint_slot,
      persistent,
      wal_archive_tx,
      archive_event_tx,
    };

    if wal.wal_file.cmd_count() > 0 {
      let err_ops = wal.checkpointing()?;
      if err_ops > 0 {
        tracing::error!(
          target: "packdb",
          shard = wal.shard_index,
          failed_ops = err_ops,
          "recovery checkpoint finished with failed operations, carrying them over"
        );
      }
    }
    Ok(wal)
  }

  /// Current logical size of the identifier: derived from its last pending
  /// command, falling back to the on-disk header.
  pub fn cur_file_size(&mut self, id: &BucketId) -> Result<u64> {
    if let Some(idx) = self.wal_file.last_index_for(&id.key()) {
      let cmd = &self.wal_file.cmds()[idx];
      return Ok(match cmd.kind {
        CmdKind::Write => cmd.file_size,
        CmdKind::Archive => 0,
        CmdKind::Truncate => cmd.write_offset,
      });
    }
    self.file_ops.cur_file_size(id)
  }

  /// Appends `buffers` at the identifier's current logical end.
  pub fn append_write(&mut self, id: &BucketId, buffers: &[&[u8]]) -> Result<()> {
    let offset = self.cur_file_size(id)?;
    let total: u64 = buffers.iter().map(|b| b.len() as u64).sum();
    self.write(id, offset, offset + total, buffers)
  }

  /// Stages a write of `buffers` at `file_offset`, raising the logical
  /// size to `file_size`. Adjacent writes merge into the previous pending
  /// write command when it ends exactly at `file_offset` and sits above
  /// the merge barrier.
  pub fn write(
    &mut self,
    id: &BucketId,
    file_offset: u64,
    file_size: u64,
    buffers: &[&[u8]],
  ) -> Result<()> {
    self.checkpoint_if_necessary()?;

    let key = id.key();
    let merge_target = self.wal_file.last_index_for(&key).filter(|&idx| {
      let cmd = &self.wal_file.cmds()[idx];
      cmd.kind == CmdKind::Write
        && cmd.file_size == file_offset
        && cmd.operation_index as i64 > self.merge_barrier
    });

    if let Some(idx) = merge_target {
      let cmd = self.wal_file.cmd_mut(idx);
      let buffer = cmd.buffer.get_or_insert_with(|| Arc::new(Buffer::new()));
      let buffer = Arc::make_mut(buffer);
      let mut added = 0usize;
      for b in buffers {
        buffer.append(b);
        added += b.len();
      }
      cmd.file_size = file_size;
      self.running_size += added;
      return Ok(());
    }

    let mut buffer = Buffer::new();
    let mut end_offset = file_offset;
    for b in buffers {
      buffer.append(b);
      end_offset += b.len() as u64;
    }
    if end_offset > file_size {
      return Err(Error::Config(format!(
        "write would end at {} past the declared file size {}",
        end_offset, file_size
      )));
    }

    self.ensure_wal_open()?;
    self.running_size += record_overhead(&key) + buffer.full_len();
    let operation_index = self.wal_file.cmd_count() as u32;
    self.wal_file.add_cmd(WalCmd {
      id: id.clone(),
      kind: CmdKind::Write,
      buffer: Some(Arc::new(buffer)),
      write_offset: file_offset,
      file_size,
      operation_index,
      retry_count: 0,
    });
    Ok(())
  }

  /// Stages a truncate of the identifier to `offset` payload bytes.
  pub fn truncate(&mut self, id: &BucketId, offset: u64) -> Result<()> {
    self.checkpoint_if_necessary()?;

    let size = self.cur_file_size(id)?;
    if offset > size {
      return Err(Error::Config(format!(
        "could not truncate a file of size {} at {}",
        size, offset
      )));
    }

    self.ensure_wal_open()?;
    let operation_index = self.wal_file.cmd_count() as u32;
    self.wal_file.add_cmd(WalCmd {
      id: id.clone(),
      kind: CmdKind::Truncate,
      buffer: None,
      write_offset: offset,
      file_size: 0,
      operation_index,
      retry_count: 0,
    });
    Ok(())
  }

  /// Stages an archive of the identifier's current content.
  pub fn archive(&mut self, id: &BucketId) -> Result<()> {
    self.checkpoint_if_necessary()?;

    self.ensure_wal_open()?;
    let operation_index = self.wal_file.cmd_count() as u32;
    self.wal_file.add_cmd(WalCmd {
      id: id.clone(),
      kind: CmdKind::Archive,
      buffer: None,
      write_offset: 0,
      file_size: 0,
      operation_index,
      retry_count: 0,
    });
    Ok(())
  }

  /// Reads the identifier's consistent view: the committed on-disk content
  /// with every pending command replayed on top.
  pub fn file_buffer(&mut self, id: &BucketId, buf: &mut Buffer) -> Result<()> {
    buf.reset();
    self.file_ops.file_buffer(id, buf)?;

    let indices: Vec<usize> = self.wal_file.indices_for(&id.key()).to_vec();
    if indices.is_empty() {
      return Ok(());
    }

    // The last pending archive resets the view; only commands after it
    // contribute.
    let mut start = 0;
    for (pos, &idx) in indices.iter().enumerate().rev() {
      if self.wal_file.cmds()[idx].kind == CmdKind::Archive {
        start = pos + 1;
        buf.reset();
        break;
      }
    }

    for &idx in &indices[start..] {
      let cmd = &self.wal_file.cmds()[idx];
      match cmd.kind {
        CmdKind::Truncate => buf.truncate_to(cmd.write_offset as usize),
        CmdKind::Write => {
          if let Some(b) = &cmd.buffer {
            buf.append(b.as_slice());
          }
        }
        CmdKind::Archive => {}
      }
    }
    Ok(())
  }

  /// Checkpoints the current generation. Returns the number of operations
  /// whose apply failed (they are carried over or abandoned past the retry
  /// cap).
  pub fn flush(&mut self) -> Result<usize> {
    self.checkpointing()
  }

  /// Flushes, then closes every descriptor and drops the event senders.
  pub fn close(&mut self) -> Result<()> {
    let err_ops = self.flush()?;
    if err_ops > 0 {
      tracing::error!(
        target: "packdb",
        shard = self.shard_index,
        failed_ops = err_ops,
        "close flushed with failed operations"
      );
    }
    self.file_ops.close();
    self.wal_archive_tx = None;
    self.archive_event_tx = None;
    Ok(())
  }

  /// Flush + close descriptors, keeping event senders for a later resume.
  pub(crate) fn suspend(&mut self) -> Result<()> {
    self.flush()?;
    self.file_ops.close();
    Ok(())
  }

  pub(crate) fn set_archive_event_sender(&mut self, tx: Option<SyncSender<PathBuf>>) {
    self.archive_event_tx = tx;
  }

  fn checkpoint_if_necessary(&mut self) -> Result<()> {
    let mut do_checkpoint = false;
    if self.wal_file.cmd_count() >= SUCCESS_OPERATION_COUNT {
      // The hard limit cannot wait for the slot, but still claims it when
      // free so soft checkpoints elsewhere hold off.
      let _ = self.try_claim_slot();
      tracing::info!(target: "packdb", shard = self.shard_index, "checkpoint hard limit reached");
      do_checkpoint = true;
    } else if self.needs_soft_checkpoint() && self.try_claim_slot() {
      do_checkpoint = true;
    }

    if do_checkpoint {
      self.checkpointing()?;
    }
    Ok(())
  }

  fn needs_soft_checkpoint(&self) -> bool {
    self.running_size > self.config.max_wal_file_size
      || self.last_checkpoint.elapsed() > self.config.max_wal_file_duration
  }

  fn try_claim_slot(&self) -> bool {
    self
      .checkpoint_slot
      .compare_exchange(-1, self.shard_index as i32, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  fn checkpointing(&mut self) -> Result<usize> {
    let _slot = SlotRelease {
      slot: self.checkpoint_slot.clone(),
      shard: self.shard_index as i32,
    };

    if self.writer.is_none() {
      return Ok(0);
    }

    // 1. Flush the not-yet-persisted command records and fsync.
    let pending: Vec<WalCmd> = self.wal_file.cmds()[self.flushed_cmds..].to_vec();
    {
      let writer = self.writer.as_mut().expect("checked above");
      for cmd in &pending {
        WalFile::write_cmd(writer, cmd)?;
      }
      writer.flush()?;
      writer.get_ref().sync_data()?;
    }
    self.flushed_cmds = self.wal_file.cmd_count();

    // 2-3. Apply through the descriptor cache and stamp the bitmap.
    let err_ops = self.applying();

    // 4. Rewrite the bitmap at its fixed offset and fsync.
    {
      let writer = self.writer.as_mut().expect("checked above");
      self.wal_file.sync_success_bitmap(writer.get_mut())?;
    }

    // 5. Close the WAL descriptor.
    self.writer = None;

    // 6. Emit archive events for archive commands that applied.
    self.emit_archive_events();

    // 7. Advance the persistent counter.
    self.persistent.wal_index += 1;
    self.persistent.save()?;

    // 8. Carry unapplied commands into the next generation.
    let carried = self.prepare_carry_over();
    let new_index = self.persistent.wal_index;
    self.wal_file.reset_with(carried, new_index);
    self.flushed_cmds = 0;
    self.running_size = 0;
    self.merge_barrier = -1;

    // 9. Move the closed WAL to the archive folder, or delete it.
    let cur_path = wal_path(&self.config, self.shard_index);
    if let Some(folder) = &self.config.wal_archive_folder {
      let dest = folder.join(format!(
        "{}{:012}-s{:05}.bin",
        WAL_ARCHIVE_FILE_PREFIX, self.persistent.wal_index, self.shard_index
      ));
      move_file(&cur_path, &dest)?;
      if let Some(tx) = &self.wal_archive_tx {
        if tx.try_send(dest).is_err() {
          tracing::warn!(
            target: "packdb",
            shard = self.shard_index,
            "wal archive event channel full, dropping event"
          );
        }
      }
    } else {
      fs::remove_file(&cur_path)?;
    }

    self.last_checkpoint = Instant::now();
    Ok(err_ops)
  }

  /// Builds the batch of still-unapplied commands, sends it to the
  /// descriptor cache and marks successes in the bitmap. On a per-item
  /// failure only the operations strictly before the failing one are
  /// marked; a failure not tied to one operation marks nothing.
  fn applying(&mut self) -> usize {
    let batch = self.unsuccessful_ops();
    let errors = self.file_ops.apply_batch(&batch);
    let mut err_ops = 0;

    for (item_index, fop) in batch.iter().enumerate() {
      let mut last_applied: Option<u64> = fop.ops.last().map(|op| op.operation_index);
      if let Some(apply_err) = error_for_item(&errors, item_index) {
        err_ops += 1;
        tracing::error!(
          target: "packdb",
          shard = self.shard_index,
          key = %fop.id.key(),
          error = %apply_err.error,
          "wal apply operation failed"
        );
        last_applied = match apply_err.op_index {
          Some(failing) => fop
            .ops
            .iter()
            .take_while(|op| op.operation_index < failing)
            .last()
            .map(|op| op.operation_index),
          None => None,
        };
      }
      if let Some(last) = last_applied {
        for op in &fop.ops {
          self.wal_file.set_success(op.operation_index as usize, true);
          if op.operation_index == last {
            break;
          }
        }
      }
    }

    // Anything staged so far may now be on disk; later writes must not
    // merge into it.
    if let Some(last_cmd) = self.wal_file.cmds().last() {
      self.merge_barrier = last_cmd.operation_index as i64;
    }
    err_ops
  }

  fn unsuccessful_ops(&self) -> Vec<FileBatchOp> {
    let mut res = Vec::new();
    for key in self.wal_file.file_keys() {
      let indices = self.wal_file.indices_for(key);
      let id = self.wal_file.cmds()[indices[0]].id.clone();
      let mut ops = Vec::new();

      for &idx in indices {
        let cmd = &self.wal_file.cmds()[idx];
        if self.wal_file.success(cmd.operation_index as usize) {
          continue;
        }
        let op = match cmd.kind {
          CmdKind::Write => Op {
            kind: OpKind::Write,
            buffer: cmd.buffer.clone(),
            offset: cmd.write_offset,
            file_size: cmd.file_size,
            operation_index: cmd.operation_index as u64,
            archive_path: None,
          },
          CmdKind::Truncate => Op {
            kind: OpKind::Truncate,
            buffer: None,
            offset: cmd.write_offset,
            file_size: 0,
            operation_index: cmd.operation_index as u64,
            archive_path: None,
          },
          CmdKind::Archive => Op {
            kind: OpKind::Archive,
            buffer: None,
            offset: 0,
            file_size: 0,
            operation_index: cmd.operation_index as u64,
            archive_path: self.config.archive_folder.as_ref().map(|root| {
              id.archive_path(
                root,
                self.shard_index,
                self.wal_file.wal_index(),
                cmd.operation_index,
              )
            }),
          },
        };
        ops.push(op);
      }
      if !ops.is_empty() {
        res.push(FileBatchOp { id, ops });
      }
    }
    res
  }

  fn emit_archive_events(&self) {
    let (Some(tx), Some(root)) = (&self.archive_event_tx, &self.config.archive_folder) else {
      return;
    };
    for key in self.wal_file.file_keys() {
      for &idx in self.wal_file.indices_for(key) {
        let cmd = &self.wal_file.cmds()[idx];
        if cmd.kind != CmdKind::Archive || !self.wal_file.success(cmd.operation_index as usize) {
          continue;
        }
        let path = cmd.id.archive_path(
          root,
          self.shard_index,
          self.wal_file.wal_index(),
          cmd.operation_index,
        );
        if tx.try_send(path).is_err() {
          tracing::warn!(
            target: "packdb",
            shard = self.shard_index,
            key = %key,
            "archive event channel full, dropping event"
          );
        }
      }
    }
  }

  fn prepare_carry_over(&self) -> Vec<WalCmd> {
    let mut res = Vec::new();
    let mut new_index: u32 = 0;
    for key in self.wal_file.file_keys() {
      for &idx in self.wal_file.indices_for(key) {
        let cmd = &self.wal_file.cmds()[idx];
        if self.wal_file.success(cmd.operation_index as usize) {
          continue;
        }
        if cmd.retry_count >= MAX_RETRY_COUNT {
          tracing::warn!(
            target: "packdb",
            shard = self.shard_index,
            key = %key,
            retry_count = cmd.retry_count,
            "abandoning command after repeated failed applies"
          );
          continue;
        }
        res.push(WalCmd {
          id: cmd.id.clone(),
          kind: cmd.kind,
          buffer: cmd.buffer.clone(),
          write_offset: cmd.write_offset,
          file_size: cmd.file_size,
          operation_index: new_index,
          retry_count: cmd.retry_count + 1,
        });
        new_index += 1;
      }
    }
    res
  }

  /// Lazily creates the WAL file for this generation and writes its header.
  fn ensure_wal_open(&mut self) -> Result<()> {
    if self.writer.is_some() {
      return Ok(());
    }
    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .open(wal_path(&self.config, self.shard_index))?;
    let mut writer = BufWriter::new(file);
    self.wal_file.write_header(&mut writer)?;
    self.writer = Some(writer);
    self.flushed_cmds = 0;
    Ok(())
  }
}

/// Releases the global soft-checkpoint slot when a checkpoint attempt ends,
/// whichever way it ends.
struct SlotRelease {
  slot: Arc<AtomicI32>,
  shard: i32,
}

impl Drop for SlotRelease {
  fn drop(&mut self) {
    let _ = self
      .slot
      .compare_exchange(self.shard, -1, Ordering::AcqRel, Ordering::Acquire);
  }
}

pub(crate) fn wal_path(config: &Config, shard_index: u32) -> PathBuf {
  config
    .wal_folder
    .join(format!("wal-{:05}.bin", shard_index))
}

fn load_existing_wal_file(
  path: &std::path::Path,
  config: &Config,
  shard_index: u32,
) -> Result<Option<WalFile>> {
  let meta = match fs::metadata(path) {
    Ok(m) => m,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(Error::Io(e)),
  };
  if meta.len() < HEADER_LEN {
    // Crash before the header reached the disk: nothing recoverable.
    tracing::warn!(
      target: "packdb",
      shard = shard_index,
      bytes = meta.len(),
      "ignoring wal file shorter than its header"
    );
    return Ok(None);
  }

  let (wal_file, torn) = WalFile::read_from_path(path)?;
  if let Some(e) = torn {
    tracing::warn!(
      target: "packdb",
      shard = shard_index,
      error = %e,
      "wal file has corrupted trailing commands, keeping the valid prefix"
    );
  }
  if wal_file.shard_count() != config.shard_count as u64 {
    return Err(Error::ShardMismatch {
      expected: config.shard_count as u64,
      found: wal_file.shard_count(),
    });
  }
  if wal_file.shard_index() != shard_index as u64 {
    return Err(Error::ShardMismatch {
      expected: shard_index as u64,
      found: wal_file.shard_index(),
    });
  }
  Ok(Some(wal_file))
}

/// Rename, falling back to copy + unlink across filesystems.
fn move_file(from: &std::path::Path, to: &std::path::Path) -> Result<()> {
  if fs::rename(from, to).is_ok() {
    return Ok(());
  }
  let mut src = File::open(from)?;
  let mut dst = OpenOptions::new()
    .create(true)
    .write(true)
    .truncate(true)
    .open(to)?;
  std::io::copy(&mut src, &mut dst)?;
  dst.sync_all()?;
  drop(dst);
  drop(src);
  fs::remove_file(from)?;
  Ok(())
}
