//! Bounded descriptor cache and atomic active-file operations.
//!
//! Every active file starts with an 8-byte big-endian header holding
//! `payload + 8`. Mutations write the payload first and the header second,
//! so a crash mid-operation leaves the older, smaller header pointing only
//! at previously committed bytes.

pub mod op;

use crate::buffer::Buffer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ident::BucketId;
use byteorder::{BigEndian, ByteOrder};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use op::{ApplyError, FileBatchOp, Op, OpKind};

pub(crate) const HEADER_SIZE: u64 = 8;

/// Upper bound on batch-apply workers regardless of configuration.
const MAX_APPLY_WORKERS: usize = 100;

/// One open active-file descriptor, shareable with batch-apply workers.
/// `inner` is `None` once an archive operation deleted the file.
pub(crate) struct ActiveFile {
  path: PathBuf,
  inner: Mutex<Option<File>>,
}

impl ActiveFile {
  fn closed_error() -> Error {
    Error::Io(io::Error::new(
      io::ErrorKind::Other,
      "active-file descriptor is closed",
    ))
  }
}

/// Bounded LRU of open active-file descriptors plus the batch applier.
///
/// Used only inside a shard's critical section; the worker pool it spawns
/// during a batch apply joins before `apply_batch` returns.
pub struct BucketFileOps {
  config: Config,
  cache: LruCache<String, Arc<ActiveFile>>,
}

impl BucketFileOps {
  pub fn new(config: Config) -> Self {
    Self {
      config,
      cache: LruCache::unbounded(),
    }
  }

  /// Number of descriptors currently held open by the cache.
  pub fn open_files(&self) -> usize {
    self.cache.len()
  }

  /// Closes every descriptor and clears the cache.
  pub fn close(&mut self) {
    self.cache.clear();
  }

  /// Writes `buf` at `offset` and stamps the header with `file_size`.
  pub fn write_at(&mut self, id: &BucketId, buf: &[u8], offset: u64, file_size: u64) -> Result<()> {
    let fd = self.descriptor(id)?;
    let mut guard = fd.inner.lock();
    let file = guard.as_mut().ok_or_else(ActiveFile::closed_error)?;
    write_atomic(file, buf, offset, file_size)?;
    Ok(())
  }

  /// Shrinks the file to `offset` payload bytes and stamps the header.
  pub fn truncate_to(&mut self, id: &BucketId, offset: u64) -> Result<()> {
    let fd = self.descriptor(id)?;
    let mut guard = fd.inner.lock();
    let file = guard.as_mut().ok_or_else(ActiveFile::closed_error)?;
    truncate_atomic(file, offset)?;
    Ok(())
  }

  /// Snapshots the active file to its archive coordinate and then deletes
  /// it (`delete_active`) or truncates it to zero length. Archiving the
  /// same `(shard, wal, op)` tuple twice is a no-op. Returns whether the
  /// active file was deleted.
  pub fn archive(
    &mut self,
    id: &BucketId,
    shard_index: u32,
    wal_index: u64,
    op_index: u32,
    delete_active: bool,
  ) -> Result<bool> {
    let archive_path = match (&self.config.archive_folder, self.config.delete_instead_of_archiving) {
      (Some(root), false) => Some(id.archive_path(root, shard_index, wal_index, op_index)),
      _ => None,
    };
    let fd = self.descriptor(id)?;
    let deleted = {
      let mut guard = fd.inner.lock();
      archive_atomic(&mut guard, &fd.path, archive_path.as_deref(), delete_active)?
    };
    if deleted {
      self.cache.pop(&id.key());
    }
    Ok(deleted)
  }

  /// Reads the committed content (bounded by the header) into `buf`.
  pub fn file_buffer(&mut self, id: &BucketId, buf: &mut Buffer) -> Result<()> {
    let fd = self.descriptor(id)?;
    let mut guard = fd.inner.lock();
    let file = guard.as_mut().ok_or_else(ActiveFile::closed_error)?;
    file_buffer_from(file, buf)
  }

  /// Committed payload size: file length minus the header, 0 when empty.
  pub fn cur_file_size(&mut self, id: &BucketId) -> Result<u64> {
    let fd = self.descriptor(id)?;
    let mut guard = fd.inner.lock();
    let file = guard.as_mut().ok_or_else(ActiveFile::closed_error)?;
    let len = file.seek(SeekFrom::End(0))?;
    Ok(len.saturating_sub(HEADER_SIZE))
  }

  /// Fsyncs the identifier's descriptor.
  pub fn sync(&mut self, id: &BucketId) -> Result<()> {
    let fd = self.descriptor(id)?;
    let guard = fd.inner.lock();
    let file = guard.as_ref().ok_or_else(ActiveFile::closed_error)?;
    file.sync_data()?;
    Ok(())
  }

  /// Applies a batch across a worker pool, one worker per identifier at a
  /// time. Descriptor tokens bound the number of concurrently open
  /// descriptors at `max_file_open`; a finished worker returns its token so
  /// the dispatcher can close the descriptor before opening the next one.
  /// Per-item failures abort the remaining operations of that item only.
  pub fn apply_batch(&mut self, batch: &[FileBatchOp]) -> Vec<ApplyError> {
    if batch.is_empty() {
      return Vec::new();
    }

    let tokens = self.config.max_file_open.max(1);
    let worker_count = batch
      .len()
      .min(MAX_APPLY_WORKERS)
      .min(self.config.max_file_open)
      .max(1);

    let (job_tx, job_rx) = mpsc::sync_channel::<Job>(worker_count);
    let job_rx = Mutex::new(job_rx);
    let (err_tx, err_rx) = mpsc::channel::<ApplyError>();
    let (done_tx, done_rx) = mpsc::sync_channel::<DoneToken>(tokens);
    let delete_instead = self.config.delete_instead_of_archiving;

    thread::scope(|s| {
      for _ in 0..worker_count {
        let job_rx = &job_rx;
        let err_tx = err_tx.clone();
        let done_tx = done_tx.clone();
        s.spawn(move || run_worker(job_rx, &err_tx, &done_tx, delete_instead));
      }

      for _ in 0..tokens {
        let _ = done_tx.send(None);
      }

      for (item_index, fop) in batch.iter().enumerate() {
        match done_rx.recv() {
          Ok(Some(returned)) => {
            // A returned token means that descriptor is done for this
            // batch; close it to free the slot for the next open.
            self.cache.pop(&returned.key);
          }
          Ok(None) => {}
          Err(_) => break,
        }
        match self.descriptor(&fop.id) {
          Ok(fd) => {
            let job = Job {
              item_index,
              fop,
              fd,
              key: fop.id.key(),
            };
            if job_tx.send(job).is_err() {
              break;
            }
          }
          Err(error) => {
            let _ = err_tx.send(ApplyError {
              item_index,
              op_index: None,
              error,
            });
            let _ = done_tx.send(None);
          }
        }
      }
      drop(job_tx);
    });

    // Workers have joined. Recover tokens of still-running items and drop
    // descriptors that archive operations invalidated.
    for token in done_rx.try_iter() {
      if let Some(returned) = token {
        if returned.invalidated {
          self.cache.pop(&returned.key);
        }
      }
    }

    drop(err_tx);
    err_rx.try_iter().collect()
  }

  /// Fetches the identifier's descriptor, opening (and creating) the file
  /// on a miss. Touches the entry; evicts least-recently-used descriptors
  /// so the cache never exceeds `max_file_open`.
  fn descriptor(&mut self, id: &BucketId) -> Result<Arc<ActiveFile>> {
    let key = id.key();
    if let Some(fd) = self.cache.get(&key) {
      return Ok(fd.clone());
    }

    while self.cache.len() >= self.config.max_file_open.max(1) {
      self.cache.pop_lru();
    }

    let dir = id.active_dir(&self.config.active_folder);
    fs::create_dir_all(&dir)?;
    let path = id.active_path(&self.config.active_folder);
    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(&path)
      .map_err(|e| {
        Error::Io(io::Error::new(
          e.kind(),
          format!("could not open active file {}: {}", path.display(), e),
        ))
      })?;

    let fd = Arc::new(ActiveFile {
      path,
      inner: Mutex::new(Some(file)),
    });
    self.cache.put(key, fd.clone());
    Ok(fd)
  }
}

struct DoneInner {
  key: String,
  invalidated: bool,
}

type DoneToken = Option<DoneInner>;

struct Job<'a> {
  item_index: usize,
  fop: &'a FileBatchOp,
  fd: Arc<ActiveFile>,
  key: String,
}

fn run_worker(
  jobs: &Mutex<mpsc::Receiver<Job>>,
  err_tx: &mpsc::Sender<ApplyError>,
  done_tx: &mpsc::SyncSender<DoneToken>,
  delete_instead: bool,
) {
  loop {
    let job = {
      let rx = jobs.lock();
      match rx.recv() {
        Ok(j) => j,
        Err(_) => return,
      }
    };

    let mut invalidated = false;
    {
      let mut guard = job.fd.inner.lock();
      let mut failed = false;

      for (i, op) in job.fop.ops.iter().enumerate() {
        let is_last = i == job.fop.ops.len() - 1;
        if let Err(error) = apply_op(&mut guard, &job.fd.path, op, is_last, delete_instead, &mut invalidated) {
          let _ = err_tx.send(ApplyError {
            item_index: job.item_index,
            op_index: Some(op.operation_index),
            error,
          });
          failed = true;
          break;
        }
      }

      if !failed {
        if let Some(file) = guard.as_ref() {
          if let Err(e) = file.sync_data() {
            let _ = err_tx.send(ApplyError {
              item_index: job.item_index,
              op_index: None,
              error: Error::Io(e),
            });
          }
        }
      }
    }

    // The token goes back on every exit path so an apply error can never
    // leak a descriptor slot.
    let _ = done_tx.send(Some(DoneInner {
      key: job.key,
      invalidated,
    }));
  }
}

fn apply_op(
  slot: &mut Option<File>,
  active_path: &Path,
  op: &Op,
  is_last: bool,
  delete_instead: bool,
  invalidated: &mut bool,
) -> Result<()> {
  match op.kind {
    OpKind::Write => {
      let file = slot.as_mut().ok_or_else(ActiveFile::closed_error)?;
      let empty: &[u8] = &[];
      let payload = op.buffer.as_ref().map_or(empty, |b| b.as_slice());
      write_atomic(file, payload, op.offset, op.file_size)?;
    }
    OpKind::Truncate => {
      let file = slot.as_mut().ok_or_else(ActiveFile::closed_error)?;
      truncate_atomic(file, op.offset)?;
    }
    OpKind::Archive => {
      let archive_path = if delete_instead {
        None
      } else {
        op.archive_path.as_deref()
      };
      if archive_atomic(slot, active_path, archive_path, is_last)? {
        *invalidated = true;
      }
    }
  }
  Ok(())
}

/// Payload first, header second: a crash between the two leaves the older
/// header bounding only committed bytes.
pub(crate) fn write_atomic(file: &mut File, buf: &[u8], offset: u64, file_size: u64) -> Result<()> {
  write_all_at(file, buf, offset + HEADER_SIZE)?;
  let mut header = [0u8; 8];
  BigEndian::write_u64(&mut header, file_size + HEADER_SIZE);
  write_all_at(file, &header, 0)?;
  Ok(())
}

pub(crate) fn truncate_atomic(file: &mut File, offset: u64) -> Result<()> {
  file.set_len(offset + HEADER_SIZE)?;
  let mut header = [0u8; 8];
  BigEndian::write_u64(&mut header, offset + HEADER_SIZE);
  write_all_at(file, &header, 0)?;
  Ok(())
}

/// Copies the full descriptor content to `<archive_path>.tmp`, fsyncs and
/// renames it over the target — unless the target already exists, making a
/// repeated archive of the same coordinate a no-op. Then either deletes the
/// active file (returns `true`, descriptor invalidated) or truncates it to
/// zero length.
pub(crate) fn archive_atomic(
  slot: &mut Option<File>,
  active_path: &Path,
  archive_path: Option<&Path>,
  delete_active: bool,
) -> Result<bool> {
  {
    let file = slot.as_mut().ok_or_else(ActiveFile::closed_error)?;

    if let Some(dest) = archive_path {
      if !dest.exists() {
        if let Some(parent) = dest.parent() {
          fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(dest);
        let mut tmp_file = OpenOptions::new()
          .create(true)
          .write(true)
          .truncate(true)
          .open(&tmp)?;
        file.seek(SeekFrom::Start(0))?;
        io::copy(file, &mut tmp_file)?;
        tmp_file.sync_all()?;
        drop(tmp_file);
        fs::rename(&tmp, dest)?;
      }
    }

    if !delete_active {
      file.set_len(0)?;
      return Ok(false);
    }
  }

  // Close before unlinking.
  slot.take();
  fs::remove_file(active_path)?;
  Ok(true)
}

/// Reads the committed content of a packed active file into `buf`, bounded
/// by the 8-byte header. An empty file yields an empty buffer.
pub fn file_buffer_from(file: &mut File, buf: &mut Buffer) -> Result<()> {
  buf.reset();
  let len = file.seek(SeekFrom::End(0))?;
  if len == 0 {
    return Ok(());
  }

  file.seek(SeekFrom::Start(0))?;
  let mut header = [0u8; 8];
  file.read_exact(&mut header)?;
  let committed = BigEndian::read_u64(&header).saturating_sub(HEADER_SIZE);

  buf.read_from(file)?;
  buf.truncate_to((committed as usize).min(buf.len()));
  Ok(())
}

fn write_all_at(file: &mut File, buf: &[u8], offset: u64) -> io::Result<()> {
  file.seek(SeekFrom::Start(offset))?;
  file.write_all(buf)
}

fn tmp_path(dest: &Path) -> PathBuf {
  let mut os = dest.as_os_str().to_os_string();
  os.push(".tmp");
  PathBuf::from(os)
}
