use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration.
///
/// The active tree holds the mutable byte image of every identifier, the
/// archive tree holds frozen snapshots consumed downstream, and the WAL
/// folder holds one live WAL plus one persistent-state counter per shard.
#[derive(Debug, Clone)]
pub struct Config {
  /// Root of the active-file tree.
  pub active_folder: PathBuf,

  /// Root of the archive tree. `None` means archive commands delete the
  /// active file instead of snapshotting it.
  pub archive_folder: Option<PathBuf>,

  /// Directory holding the live WAL and state files, one pair per shard.
  pub wal_folder: PathBuf,

  /// Where checkpointed WAL files are moved. `None` means they are deleted
  /// after a successful checkpoint.
  pub wal_archive_folder: Option<PathBuf>,

  /// Active tree written by the replicator. `None` disables replication.
  pub replication_active_folder: Option<PathBuf>,

  /// Archive tree written by the replicator during cold replay.
  pub replication_archive_folder: Option<PathBuf>,

  /// Number of independent WAL engines. Must match the value recorded in
  /// any WAL file loaded at startup.
  pub shard_count: u32,

  /// Cap on concurrently open active-file descriptors per shard.
  /// Default: 100.
  pub max_file_open: usize,

  /// Soft size threshold of one WAL generation, in bytes of accounted
  /// command payload. Default: 16 MB.
  pub max_wal_file_size: usize,

  /// Soft age threshold of one WAL generation. Default: 10 minutes.
  pub max_wal_file_duration: Duration,

  /// Template for the external filesystem-sync command. Expanded with
  /// `%act`, `%arc`, `%walact`, `%walarc` and caller-supplied `%<key>`
  /// substitutions. `None` makes the sync operation a no-op.
  pub rsync_command: Option<String>,

  /// When set, archive operations skip the snapshot copy entirely and only
  /// delete or truncate the active file.
  pub delete_instead_of_archiving: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      active_folder: PathBuf::from("data/active"),
      archive_folder: Some(PathBuf::from("data/archive")),
      wal_folder: PathBuf::from("data"),
      wal_archive_folder: Some(PathBuf::from("data/wal-archive")),
      replication_active_folder: None,
      replication_archive_folder: None,
      shard_count: 4,
      max_file_open: 100,
      max_wal_file_size: 16_000_000,
      max_wal_file_duration: Duration::from_secs(10 * 60),
      rsync_command: None,
      delete_instead_of_archiving: false,
    }
  }
}

impl Config {
  /// Configuration rooted at `root`, sized for tests: more shards than a
  /// default deployment, a tight descriptor cap, and a duration threshold
  /// that never fires on its own.
  pub fn test_config(root: impl AsRef<Path>) -> Self {
    let root = root.as_ref();
    Self {
      active_folder: root.join("active"),
      archive_folder: Some(root.join("archive")),
      wal_folder: root.join("wal"),
      wal_archive_folder: Some(root.join("wal-archive")),
      replication_active_folder: Some(root.join("replication/active")),
      replication_archive_folder: Some(root.join("replication/archive")),
      shard_count: 8,
      max_file_open: 10,
      max_wal_file_size: 16_000_000,
      max_wal_file_duration: Duration::from_secs(u64::MAX / 4),
      rsync_command: None,
      delete_instead_of_archiving: false,
    }
  }
}
