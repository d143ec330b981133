//! Shard multiplexer: routes identifiers to per-shard WAL engines,
//! dispatches archive events to the consumer, and coordinates the global
//! quiesce around the external sync command.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ident::BucketId;
use crate::wal::{replicator, Wal};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicI32;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Capacity of the archive-event and WAL-archive-event queues. Sends are
/// best-effort: a full queue drops the event with a warning.
const EVENT_CHANNEL_CAPACITY: usize = 1_000_000;

/// Downstream consumer of archived files. Called under the
/// background-exclusive mutex, so it never runs concurrently with the
/// external sync command.
pub trait ArchiveConsumer: Send + Sync {
  fn on_archived_file(&self, path: &Path, id: &BucketId);
  fn close(&self) {}
}

struct ShardSlot {
  engine: Mutex<Wal>,
}

struct Dispatcher {
  handle: JoinHandle<()>,
  /// Our clone of the senders feeding the running dispatcher. Dropping it
  /// (after swapping the engines' clones) closes the channel.
  seed_tx: SyncSender<PathBuf>,
}

/// N independent WAL engines behind per-shard mutexes.
pub struct ShardWal {
  config: Config,
  shards: Vec<ShardSlot>,
  background: Arc<Mutex<()>>,
  consumer: Option<Arc<dyn ArchiveConsumer>>,
  dispatcher: Option<Dispatcher>,
  wal_archive_tx: SyncSender<PathBuf>,
  wal_archive_rx: Mutex<Option<Receiver<PathBuf>>>,
}

impl ShardWal {
  /// Opens every shard engine, seeds pending archive work from the
  /// existing trees and starts the archive-event dispatcher.
  pub fn open(config: Config, consumer: Option<Arc<dyn ArchiveConsumer>>) -> Result<Self> {
    if config.shard_count == 0 {
      return Err(Error::Config("shard_count must be greater than zero".into()));
    }

    let checkpoint_slot = Arc::new(AtomicI32::new(-1));
    let (archive_tx, archive_rx) = sync_channel::<PathBuf>(EVENT_CHANNEL_CAPACITY);
    let (wal_archive_tx, wal_archive_rx) = sync_channel::<PathBuf>(EVENT_CHANNEL_CAPACITY);

    let mut shards = Vec::with_capacity(config.shard_count as usize);
    for shard_index in 0..config.shard_count {
      let engine = Wal::open(
        config.clone(),
        shard_index,
        checkpoint_slot.clone(),
        consumer.as_ref().map(|_| archive_tx.clone()),
        Some(wal_archive_tx.clone()),
      )?;
      shards.push(ShardSlot {
        engine: Mutex::new(engine),
      });
    }

    let mut shard_wal = Self {
      config,
      shards,
      background: Arc::new(Mutex::new(())),
      consumer,
      dispatcher: None,
      wal_archive_tx,
      wal_archive_rx: Mutex::new(Some(wal_archive_rx)),
    };

    shard_wal.seed_wal_archive_events();
    shard_wal.start_dispatcher(archive_tx, archive_rx);
    Ok(shard_wal)
  }

  /// Shard routing for an identifier.
  pub fn shard_of(&self, id: &BucketId) -> u32 {
    id.shard_index(self.config.shard_count)
  }

  pub fn shard_count(&self) -> u32 {
    self.config.shard_count
  }

  /// Locks one shard and returns its engine. All engine operations run
  /// inside this critical section.
  pub fn lock_shard(&self, shard_index: u32) -> MutexGuard<'_, Wal> {
    self.shards[shard_index as usize].engine.lock()
  }

  /// Locks the identifier's shard.
  pub fn lock_for(&self, id: &BucketId) -> MutexGuard<'_, Wal> {
    self.lock_shard(self.shard_of(id))
  }

  /// Checkpoints every shard. Returns the total count of operations whose
  /// apply failed; the first checkpoint-level error wins after every shard
  /// had its chance.
  pub fn flush_all(&self) -> Result<usize> {
    let mut err_ops = 0;
    let mut first_error = None;
    for shard_index in 0..self.shards.len() {
      match self.lock_shard(shard_index as u32).flush() {
        Ok(n) => err_ops += n,
        Err(e) => {
          tracing::error!(target: "packdb", shard = shard_index, error = %e, "flush failed");
          first_error.get_or_insert(e);
        }
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(err_ops),
    }
  }

  /// Flushes and closes every shard, stops the dispatcher and closes the
  /// consumer.
  pub fn close_all(&mut self) -> Result<()> {
    let mut first_error = None;
    for shard_index in 0..self.shards.len() {
      if let Err(e) = self.lock_shard(shard_index as u32).close() {
        tracing::error!(target: "packdb", shard = shard_index, error = %e, "close failed");
        first_error.get_or_insert(e);
      }
    }

    self.stop_dispatcher_for_renewal();
    if let Some(consumer) = &self.consumer {
      consumer.close();
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  /// Hands out the WAL-archive event stream exactly once, for a
  /// [`replicator::Replicator`](crate::Replicator).
  pub fn take_wal_archive_receiver(&mut self) -> Option<Receiver<PathBuf>> {
    self.wal_archive_rx.lock().take()
  }

  /// Quiesces every shard and runs the configured sync command template.
  ///
  /// The archive-event channel is renewed and drained first (the old
  /// dispatcher processes its backlog and exits), then under the
  /// background-exclusive mutex every shard is locked in index order,
  /// suspended, and the expanded command runs synchronously. Engines
  /// resume on the way out and a fresh dispatcher is started.
  pub fn exec_sync_command(&mut self, params: &HashMap<String, Vec<String>>) -> Result<Vec<u8>> {
    self.stop_dispatcher_for_renewal();

    let result = self.exec_sync_command_quiesced(params);

    if self.consumer.is_some() {
      let (tx, rx) = sync_channel::<PathBuf>(EVENT_CHANNEL_CAPACITY);
      for slot in &self.shards {
        slot.engine.lock().set_archive_event_sender(Some(tx.clone()));
      }
      self.start_dispatcher(tx, rx);
    }
    result
  }

  fn exec_sync_command_quiesced(&self, params: &HashMap<String, Vec<String>>) -> Result<Vec<u8>> {
    let Some(template) = &self.config.rsync_command else {
      tracing::info!(target: "packdb", "no sync command configured");
      return Ok(Vec::new());
    };
    if replicator::replicator_running() {
      return Err(Error::Config(
        "could not launch the sync command while the replicator is running".into(),
      ));
    }

    let _background = self.background.lock();

    let mut guards: Vec<MutexGuard<'_, Wal>> =
      self.shards.iter().map(|slot| slot.engine.lock()).collect();
    for guard in guards.iter_mut() {
      guard.suspend()?;
    }

    let expanded = self.expand_template(template, params);
    tracing::info!(target: "packdb", cmd = %expanded, "running sync command and waiting for it to finish");
    let output = Command::new("/bin/sh").arg("-c").arg(&expanded).output()?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);

    // Re-seed archived WAL files once for the whole tree; the engines
    // themselves need no per-shard resume beyond their lazy reopen.
    drop(guards);
    self.seed_wal_archive_events();

    if !output.status.success() {
      tracing::warn!(target: "packdb", status = %output.status, "sync command failed");
      return Err(Error::External(format!(
        "sync command exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&combined)
      )));
    }
    tracing::info!(target: "packdb", "sync command finished successfully");
    Ok(combined)
  }

  fn expand_template(&self, template: &str, params: &HashMap<String, Vec<String>>) -> String {
    let path_str = |p: Option<&PathBuf>| {
      p.map(|p| p.display().to_string()).unwrap_or_default()
    };
    let mut expanded = template
      .replace("%act", &self.config.active_folder.display().to_string())
      .replace("%arc", &path_str(self.config.archive_folder.as_ref()))
      .replace("%walact", &self.config.wal_folder.display().to_string())
      .replace("%walarc", &path_str(self.config.wal_archive_folder.as_ref()));
    for (key, values) in params {
      expanded = expanded.replace(&format!("%{}", key), &values.join(","));
    }
    expanded
  }

  /// Pushes every file already present in the WAL archive folder onto the
  /// WAL-archive event queue, oldest name first.
  fn seed_wal_archive_events(&self) {
    let Some(folder) = &self.config.wal_archive_folder else {
      return;
    };
    let entries = match fs::read_dir(folder) {
      Ok(entries) => entries,
      Err(e) => {
        tracing::warn!(target: "packdb", error = %e, "could not list the wal archive folder");
        return;
      }
    };
    let mut names: Vec<PathBuf> = entries
      .filter_map(|e| e.ok())
      .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
      .map(|e| e.path())
      .filter(|p| {
        p.file_name()
          .and_then(|n| n.to_str())
          .map(|n| n.starts_with("wal-"))
          .unwrap_or(false)
      })
      .collect();
    names.sort();
    for path in names {
      if self.wal_archive_tx.try_send(path.clone()).is_err() {
        tracing::warn!(target: "packdb", path = %path.display(), "wal archive queue full, skipping file");
      }
    }
  }

  /// Starts the dispatcher over a fresh channel, seeding it with the files
  /// already sitting in the archive tree.
  fn start_dispatcher(&mut self, tx: SyncSender<PathBuf>, rx: Receiver<PathBuf>) {
    let Some(consumer) = self.consumer.clone() else {
      return;
    };
    if let Some(folder) = &self.config.archive_folder {
      seed_archive_tree(&tx, folder);
    }
    let background = self.background.clone();
    let handle = thread::spawn(move || dispatcher_loop(rx, consumer, background));
    self.dispatcher = Some(Dispatcher {
      handle,
      seed_tx: tx,
    });
  }

  /// Swaps every engine onto a dead-end channel, lets the running
  /// dispatcher drain its backlog and joins it.
  fn stop_dispatcher_for_renewal(&mut self) {
    let Some(dispatcher) = self.dispatcher.take() else {
      return;
    };
    for slot in &self.shards {
      slot.engine.lock().set_archive_event_sender(None);
    }
    drop(dispatcher.seed_tx);
    if dispatcher.handle.join().is_err() {
      tracing::error!(target: "packdb", "archive dispatcher panicked");
    }
  }
}

impl Drop for ShardWal {
  fn drop(&mut self) {
    // Join the dispatcher so its thread never outlives the consumer.
    self.stop_dispatcher_for_renewal();
  }
}

fn dispatcher_loop(
  rx: Receiver<PathBuf>,
  consumer: Arc<dyn ArchiveConsumer>,
  background: Arc<Mutex<()>>,
) {
  while let Ok(path) = rx.recv() {
    let _guard = background.lock();
    match BucketId::parse_archive_path(&path) {
      Ok((id, _, _, _)) => consumer.on_archived_file(&path, &id),
      Err(e) => {
        tracing::warn!(
          target: "packdb",
          path = %path.display(),
          error = %e,
          "file is not an archive file, discarded"
        );
      }
    }
  }
}

/// Recursive walk of the archive tree pushing every file (never
/// directories) onto the queue, dropping with a warning once full.
fn seed_archive_tree(tx: &SyncSender<PathBuf>, folder: &Path) {
  let entries = match fs::read_dir(folder) {
    Ok(entries) => entries,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
    Err(e) => {
      tracing::warn!(target: "packdb", folder = %folder.display(), error = %e, "could not walk the archive folder");
      return;
    }
  };
  for entry in entries.filter_map(|e| e.ok()) {
    let path = entry.path();
    match entry.file_type() {
      Ok(t) if t.is_dir() => seed_archive_tree(tx, &path),
      Ok(t) if t.is_file() => {
        if tx.try_send(path.clone()).is_err() {
          tracing::warn!(target: "packdb", path = %path.display(), "archive event queue full, skipping file");
        }
      }
      _ => {}
    }
  }
}
