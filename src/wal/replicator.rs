//! Offline replay of archived WAL files into a secondary directory tree.

use crate::error::Result;
use crate::wal::file::WalFile;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

static BACKGROUND_REPLICATOR_STARTED: AtomicBool = AtomicBool::new(false);

const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Whether a background replicator loop is currently running. The external
/// sync command refuses to run while one is.
pub fn replicator_running() -> bool {
  BACKGROUND_REPLICATOR_STARTED.load(Ordering::Acquire)
}

/// Replays archived WAL files into `active_folder`/`archive_folder`,
/// optionally runs a user archive command per file, then unlinks the
/// consumed WAL. Replay failures are retried every 10 seconds until they
/// pass or the replicator is stopped.
pub struct Replicator {
  rx: Receiver<PathBuf>,
  /// `None` disables replication; the archive command may still run.
  active_folder: Option<PathBuf>,
  archive_folder: Option<PathBuf>,
  /// Template with `%p` (full path) and `%f` (basename) substitutions.
  archive_cmd: Option<String>,
  stop: Arc<AtomicBool>,
  handle: Option<JoinHandle<()>>,
}

impl Replicator {
  pub fn new(
    rx: Receiver<PathBuf>,
    active_folder: Option<PathBuf>,
    archive_folder: Option<PathBuf>,
    archive_cmd: Option<String>,
  ) -> Self {
    Self {
      rx,
      active_folder,
      archive_folder,
      archive_cmd,
      stop: Arc::new(AtomicBool::new(false)),
      handle: None,
    }
  }

  /// One-shot replicator over a single archived WAL file, used when
  /// reprocessing one file by hand.
  pub fn with_file(
    path: PathBuf,
    active_folder: Option<PathBuf>,
    archive_folder: Option<PathBuf>,
    archive_cmd: Option<String>,
  ) -> Self {
    let (tx, rx) = sync_channel(1);
    tx.send(path).expect("bounded channel of one cannot be full");
    Self::new(rx, active_folder, archive_folder, archive_cmd)
  }

  /// Runs the replicator synchronously until its source channel closes,
  /// propagating the first failure instead of retrying.
  pub fn execute(self) -> Result<()> {
    while let Ok(path) = self.rx.recv() {
      let (wal_file, torn) = WalFile::read_from_path(&path)?;
      if let Some(e) = torn {
        tracing::warn!(target: "packdb", error = %e, "archived wal has corrupted trailing commands");
      }
      replay_once(&wal_file, &path, self.active_folder.as_deref(), self.archive_folder.as_deref())?;
    }
    Ok(())
  }

  /// Starts the background loop.
  pub fn start(&mut self) {
    if self.handle.is_some() {
      return;
    }
    BACKGROUND_REPLICATOR_STARTED.store(true, Ordering::Release);

    // The receiver moves into the loop; a stopped replicator is spent.
    let (_, dummy_rx) = sync_channel(1);
    let rx = std::mem::replace(&mut self.rx, dummy_rx);
    let active = self.active_folder.clone();
    let archive = self.archive_folder.clone();
    let cmd = self.archive_cmd.clone();
    let stop = self.stop.clone();

    self.handle = Some(thread::spawn(move || {
      run_loop(rx, active, archive, cmd, &stop);
      BACKGROUND_REPLICATOR_STARTED.store(false, Ordering::Release);
    }));
  }

  /// Asks the loop to stop after its current WAL and waits for it.
  pub fn stop(&mut self) {
    self.stop.store(true, Ordering::Release);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

fn run_loop(
  rx: Receiver<PathBuf>,
  active_folder: Option<PathBuf>,
  archive_folder: Option<PathBuf>,
  archive_cmd: Option<String>,
  stop: &AtomicBool,
) {
  while let Ok(path) = rx.recv() {
    if active_folder.is_some() {
      let wal_file = match WalFile::read_from_path(&path) {
        Ok((wal_file, torn)) => {
          if let Some(e) = torn {
            tracing::warn!(target: "packdb", path = %path.display(), error = %e, "archived wal has corrupted trailing commands");
          }
          wal_file
        }
        Err(e) => {
          tracing::error!(target: "packdb", path = %path.display(), error = %e, "replicator could not read archived wal");
          return;
        }
      };

      loop {
        match replay_once(
          &wal_file,
          &path,
          active_folder.as_deref(),
          archive_folder.as_deref(),
        ) {
          Ok(()) => break,
          Err(e) => {
            tracing::warn!(target: "packdb", error = %e, "cold replay failed, retrying in 10 seconds");
          }
        }
        if stop.load(Ordering::Acquire) {
          return;
        }
        thread::sleep(RETRY_DELAY);
      }
    }

    if let Some(cmd) = &archive_cmd {
      loop {
        let expanded = cmd
          .replace("%p", &path.display().to_string())
          .replace(
            "%f",
            &path
              .file_name()
              .map(|f| f.to_string_lossy().into_owned())
              .unwrap_or_default(),
          );
        tracing::info!(target: "packdb", cmd = %expanded, "running replicator archive command");
        match Command::new("/bin/sh").arg("-c").arg(&expanded).status() {
          Ok(status) if status.success() => break,
          Ok(status) => {
            tracing::warn!(target: "packdb", %status, "archive command failed, retrying in 10 seconds");
          }
          Err(e) => {
            tracing::warn!(target: "packdb", error = %e, "archive command could not start, retrying in 10 seconds");
          }
        }
        if stop.load(Ordering::Acquire) {
          return;
        }
        thread::sleep(RETRY_DELAY);
      }
    }

    if stop.load(Ordering::Acquire) {
      tracing::info!(target: "packdb", "replicator stopping on request");
      return;
    }
  }
  tracing::info!(target: "packdb", "replicator stopping, source channel closed");
}

/// Replays one WAL into the replication tree and unlinks it. Replay errors
/// on individual commands are logged; the WAL is still consumed so a
/// poisoned file cannot wedge the loop, but a failed unlink is an error the
/// caller retries.
fn replay_once(
  wal_file: &WalFile,
  path: &Path,
  active_folder: Option<&Path>,
  archive_folder: Option<&Path>,
) -> Result<()> {
  let Some(active) = active_folder else {
    return Ok(std::fs::remove_file(path)?);
  };

  let errors = wal_file.cold_replay(active, archive_folder);
  for e in &errors {
    tracing::error!(target: "packdb", path = %path.display(), error = %e, "cold replay command failed");
  }
  std::fs::remove_file(path)?;
  Ok(())
}
