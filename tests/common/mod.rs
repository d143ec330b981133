#![allow(dead_code)]

use packdb::{BucketId, Config};
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestEnv {
  pub config: Config,
  // The TempDir guard must be kept alive so the tree survives the test.
  pub _dir: TempDir,
  pub root: PathBuf,
}

impl TestEnv {
  pub fn new() -> Self {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    Self {
      config: Config::test_config(&root),
      _dir: dir,
      root,
    }
  }
}

pub fn test_id() -> BucketId {
  BucketId::new("app", "b1", "bb1", "inter").unwrap()
}

/// Big-endian u64 header of a packed active file.
pub fn read_header(path: &std::path::Path) -> u64 {
  let bytes = std::fs::read(path).unwrap();
  assert!(
    bytes.len() >= 8,
    "file {} shorter than its header",
    path.display()
  );
  u64::from_be_bytes(bytes[..8].try_into().unwrap())
}
