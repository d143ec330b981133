use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Four-part logical identifier of one stored table file.
///
/// The canonical key string is `container:bucket:sub_bucket:table`. The
/// bucket, sub-bucket and table names must stay free of `_` so the active
/// and archive file names can be split back into their parts; no component
/// may contain `:` or a path separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketId {
  container: String,
  bucket: String,
  sub_bucket: String,
  table: String,
}

impl BucketId {
  pub fn new(
    container: impl Into<String>,
    bucket: impl Into<String>,
    sub_bucket: impl Into<String>,
    table: impl Into<String>,
  ) -> Result<Self> {
    let id = Self {
      container: container.into(),
      bucket: bucket.into(),
      sub_bucket: sub_bucket.into(),
      table: table.into(),
    };
    validate_component(&id.container, false)?;
    validate_component(&id.bucket, true)?;
    validate_component(&id.sub_bucket, true)?;
    validate_component(&id.table, true)?;
    Ok(id)
  }

  pub fn container(&self) -> &str {
    &self.container
  }

  pub fn bucket(&self) -> &str {
    &self.bucket
  }

  pub fn sub_bucket(&self) -> &str {
    &self.sub_bucket
  }

  pub fn table(&self) -> &str {
    &self.table
  }

  /// Canonical key string `container:bucket:sub_bucket:table`.
  pub fn key(&self) -> String {
    format!(
      "{}:{}:{}:{}",
      self.container, self.bucket, self.sub_bucket, self.table
    )
  }

  /// Inverse of [`BucketId::key`].
  pub fn parse_key(key: &str) -> Result<Self> {
    let comps: Vec<&str> = key.split(':').collect();
    if comps.len() != 4 {
      return Err(Error::InvalidIdentifier(format!(
        "key '{}' does not have 4 parts",
        key
      )));
    }
    Self::new(comps[0], comps[1], comps[2], comps[3])
  }

  /// `<root>/<container>/<prefix4(bucket)>/<bucket>_<sub_bucket>_<table>`.
  pub fn active_path(&self, root: &Path) -> PathBuf {
    self.active_dir(root).join(self.file_name())
  }

  /// Directory holding the active file.
  pub fn active_dir(&self, root: &Path) -> PathBuf {
    root.join(&self.container).join(prefix4(&self.bucket))
  }

  /// `<root>/<container>/<prefix4(bucket)>/<sub_bucket>/<name>:<shard>:<wal>:<op>`.
  pub fn archive_path(&self, root: &Path, shard: u32, wal_index: u64, op_index: u32) -> PathBuf {
    root
      .join(&self.container)
      .join(prefix4(&self.bucket))
      .join(&self.sub_bucket)
      .join(format!(
        "{}:{}:{}:{}",
        self.file_name(),
        shard,
        wal_index,
        op_index
      ))
  }

  /// Recovers the identifier and its `(shard, wal, op)` coordinates from an
  /// archive path. Exact inverse of [`BucketId::archive_path`].
  pub fn parse_archive_path(path: &Path) -> Result<(Self, u32, u64, u32)> {
    let bad = |msg: &str| Error::InvalidIdentifier(format!("{}: {}", msg, path.display()));

    let file_name = path
      .file_name()
      .and_then(|n| n.to_str())
      .ok_or_else(|| bad("archive path has no file name"))?;

    let parts: Vec<&str> = file_name.split(':').collect();
    if parts.len() != 4 {
      return Err(bad("archive file name does not carry shard:wal:op"));
    }
    let name_parts: Vec<&str> = parts[0].split('_').collect();
    if name_parts.len() != 3 {
      return Err(bad("archive file name is not bucket_subbucket_table"));
    }
    let shard: u32 = parts[1].parse().map_err(|_| bad("bad shard index"))?;
    let wal_index: u64 = parts[2].parse().map_err(|_| bad("bad wal index"))?;
    let op_index: u32 = parts[3].parse().map_err(|_| bad("bad operation index"))?;

    // <container>/<prefix4>/<sub_bucket>/<file>: container is three levels up.
    let container = path
      .ancestors()
      .nth(3)
      .and_then(|p| p.file_name())
      .and_then(|n| n.to_str())
      .ok_or_else(|| bad("archive path is too shallow to carry a container"))?;

    let id = Self::new(container, name_parts[0], name_parts[1], name_parts[2])?;
    Ok((id, shard, wal_index, op_index))
  }

  /// Stable shard routing: `FNV-1a-32(container + ":" + bucket) % shard_count`.
  pub fn shard_index(&self, shard_count: u32) -> u32 {
    let mut h = fnv1a32(self.container.as_bytes());
    h = fnv1a32_continue(h, b":");
    h = fnv1a32_continue(h, self.bucket.as_bytes());
    h % shard_count
  }

  fn file_name(&self) -> String {
    format!("{}_{}_{}", self.bucket, self.sub_bucket, self.table)
  }
}

/// First four bytes of the bucket name, or the whole name when shorter.
/// Bucket names are validated ASCII so byte slicing is char-safe.
fn prefix4(bucket: &str) -> &str {
  &bucket[..bucket.len().min(4)]
}

fn validate_component(s: &str, reject_underscore: bool) -> Result<()> {
  if s.is_empty() {
    return Err(Error::InvalidIdentifier("empty identifier component".into()));
  }
  for c in s.chars() {
    let forbidden = !c.is_ascii()
      || c == ':'
      || c == '/'
      || c == '\\'
      || c == '\0'
      || (reject_underscore && c == '_');
    if forbidden {
      return Err(Error::InvalidIdentifier(format!(
        "component '{}' contains forbidden character '{}'",
        s, c
      )));
    }
  }
  Ok(())
}

const FNV_OFFSET_BASIS_32: u32 = 2166136261;
const FNV_PRIME_32: u32 = 16777619;

fn fnv1a32(bytes: &[u8]) -> u32 {
  fnv1a32_continue(FNV_OFFSET_BASIS_32, bytes)
}

fn fnv1a32_continue(mut hash: u32, bytes: &[u8]) -> u32 {
  for &b in bytes {
    hash ^= b as u32;
    hash = hash.wrapping_mul(FNV_PRIME_32);
  }
  hash
}

#[cfg(test)]
mod tests {
  use super::*;

  fn id() -> BucketId {
    BucketId::new("app", "b1", "bb1", "inter").unwrap()
  }

  #[test]
  fn test_key_round_trip() {
    let parsed = BucketId::parse_key(&id().key()).unwrap();
    assert_eq!(parsed, id());
  }

  #[test]
  fn test_key_rejects_wrong_arity() {
    assert!(BucketId::parse_key("a:b:c").is_err());
    assert!(BucketId::parse_key("a:b:c:d:e").is_err());
  }

  #[test]
  fn test_active_path_layout() {
    let p = id().active_path(Path::new("/act"));
    assert_eq!(p, Path::new("/act/app/b1/b1_bb1_inter"));

    let long = BucketId::new("app", "longbucket", "sb", "t").unwrap();
    let p = long.active_path(Path::new("/act"));
    assert_eq!(p, Path::new("/act/app/long/longbucket_sb_t"));
  }

  #[test]
  fn test_archive_path_round_trip() {
    let p = id().archive_path(Path::new("/arc"), 0, 1, 2);
    assert_eq!(p, Path::new("/arc/app/b1/bb1/b1_bb1_inter:0:1:2"));

    let (parsed, shard, wal, op) = BucketId::parse_archive_path(&p).unwrap();
    assert_eq!(parsed, id());
    assert_eq!((shard, wal, op), (0, 1, 2));
  }

  #[test]
  fn test_archive_path_rejects_garbage() {
    assert!(BucketId::parse_archive_path(Path::new("/arc/app/b1/bb1/noise")).is_err());
    assert!(BucketId::parse_archive_path(Path::new("/arc/app/b1/bb1/a_b:1:2:3")).is_err());
  }

  #[test]
  fn test_shard_determinism() {
    let a = BucketId::new("app", "b1", "bb1", "inter").unwrap();
    let b = BucketId::new("app", "b1", "other", "table").unwrap();

    // Sub-bucket and table do not participate in routing.
    for count in [1, 2, 4, 8, 31] {
      assert_eq!(a.shard_index(count), b.shard_index(count));
      assert!(a.shard_index(count) < count);
    }
  }

  #[test]
  fn test_component_validation() {
    assert!(BucketId::new("app", "a_b", "sb", "t").is_err());
    assert!(BucketId::new("a:b", "b", "sb", "t").is_err());
    assert!(BucketId::new("a/b", "b", "sb", "t").is_err());
    assert!(BucketId::new("", "b", "sb", "t").is_err());
    // Underscore is legal in the container, which is never split on it.
    assert!(BucketId::new("my_app", "b", "sb", "t").is_ok());
  }
}
