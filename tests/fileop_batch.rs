mod common;

use common::{read_header, test_id, TestEnv};
use packdb::fileop::op::{error_for_item, FileBatchOp, Op, OpKind};
use packdb::fileop::BucketFileOps;
use packdb::{Buffer, BucketId};
use std::fs;
use std::sync::Arc;

fn write_op(payload: &[u8], offset: u64, file_size: u64, index: u64) -> Op {
  let mut buf = Buffer::new();
  buf.append(payload);
  Op {
    kind: OpKind::Write,
    buffer: Some(Arc::new(buf)),
    offset,
    file_size,
    operation_index: index,
    archive_path: None,
  }
}

fn truncate_op(offset: u64, index: u64) -> Op {
  Op {
    kind: OpKind::Truncate,
    buffer: None,
    offset,
    file_size: 0,
    operation_index: index,
    archive_path: None,
  }
}

fn archive_op(env: &TestEnv, id: &BucketId, op: u32, index: u64) -> Op {
  let root = env.config.archive_folder.as_ref().unwrap();
  Op {
    kind: OpKind::Archive,
    buffer: None,
    offset: 0,
    file_size: 0,
    operation_index: index,
    archive_path: Some(id.archive_path(root, 0, 1, op)),
  }
}

#[test]
fn test_write_at_header_invariant() {
  let env = TestEnv::new();
  let mut ops = BucketFileOps::new(env.config.clone());
  let id = test_id();

  ops.write_at(&id, &[1u8; 20], 0, 20).unwrap();
  let path = id.active_path(&env.config.active_folder);
  assert_eq!(fs::metadata(&path).unwrap().len(), 28);
  assert_eq!(read_header(&path), 28);

  // Extending the file raises the header with it.
  ops.write_at(&id, &[2u8; 5], 20, 25).unwrap();
  assert_eq!(read_header(&path), 33);
  assert_eq!(ops.cur_file_size(&id).unwrap(), 25);
}

#[test]
fn test_truncate_shrinks_file_and_header() {
  let env = TestEnv::new();
  let mut ops = BucketFileOps::new(env.config.clone());
  let id = test_id();

  ops.write_at(&id, &[1u8; 20], 0, 20).unwrap();
  ops.truncate_to(&id, 10).unwrap();

  let path = id.active_path(&env.config.active_folder);
  assert_eq!(fs::metadata(&path).unwrap().len(), 18);
  assert_eq!(read_header(&path), 18);
  assert_eq!(ops.cur_file_size(&id).unwrap(), 10);
}

#[test]
fn test_archive_is_idempotent() {
  let env = TestEnv::new();
  let mut ops = BucketFileOps::new(env.config.clone());
  let id = test_id();

  ops.write_at(&id, &[1u8; 20], 0, 20).unwrap();
  let deleted = ops.archive(&id, 0, 1, 2, false).unwrap();
  assert!(!deleted);

  let archive_path =
    id.archive_path(env.config.archive_folder.as_ref().unwrap(), 0, 1, 2);
  let first = fs::read(&archive_path).unwrap();
  assert_eq!(first.len(), 28);

  // The active file was truncated to zero; write something new, then
  // archive the same coordinate again: the snapshot must not change.
  assert_eq!(ops.cur_file_size(&id).unwrap(), 0);
  ops.write_at(&id, &[9u8; 4], 0, 4).unwrap();
  ops.archive(&id, 0, 1, 2, false).unwrap();

  let second = fs::read(&archive_path).unwrap();
  assert_eq!(first, second);
}

#[test]
fn test_archive_delete_active() {
  let env = TestEnv::new();
  let mut ops = BucketFileOps::new(env.config.clone());
  let id = test_id();

  ops.write_at(&id, &[1u8; 8], 0, 8).unwrap();
  let deleted = ops.archive(&id, 0, 1, 0, true).unwrap();
  assert!(deleted);
  assert!(!id.active_path(&env.config.active_folder).exists());

  // The descriptor was invalidated and dropped; the next access starts a
  // fresh empty file.
  assert_eq!(ops.cur_file_size(&id).unwrap(), 0);
}

#[test]
fn test_apply_batch_runs_ops_in_order() {
  let env = TestEnv::new();
  let mut ops = BucketFileOps::new(env.config.clone());
  let id = test_id();

  let batch = vec![FileBatchOp {
    id: id.clone(),
    ops: vec![
      write_op(&[0u8; 20], 0, 20, 0),
      truncate_op(10, 1),
      archive_op(&env, &id, 2, 2),
    ],
  }];

  let errors = ops.apply_batch(&batch);
  assert!(errors.is_empty(), "unexpected errors: {:?}", errors);

  let archive_path =
    id.archive_path(env.config.archive_folder.as_ref().unwrap(), 0, 1, 2);
  assert_eq!(fs::metadata(&archive_path).unwrap().len(), 18);
  // Archive was the last op of the item: active file deleted.
  assert!(!id.active_path(&env.config.active_folder).exists());
}

#[test]
fn test_apply_batch_error_skips_rest_of_item_only() {
  let env = TestEnv::new();

  // Block one container: a plain file where the container directory should
  // be makes every descriptor open for it fail.
  fs::create_dir_all(&env.config.active_folder).unwrap();
  fs::write(env.config.active_folder.join("blocked"), b"not a dir").unwrap();

  let mut ops = BucketFileOps::new(env.config.clone());
  let bad = BucketId::new("blocked", "b1", "bb1", "t").unwrap();

  // More items than the descriptor cap (10) so tokens must recycle, with
  // the failing item in the middle.
  let mut batch = Vec::new();
  let mut good_ids = Vec::new();
  for i in 0..12 {
    let id = BucketId::new("app", "b1", "bb1", format!("t{}", i)).unwrap();
    good_ids.push(id.clone());
    batch.push(FileBatchOp {
      id,
      ops: vec![write_op(b"ok", 0, 2, i as u64)],
    });
  }
  batch.insert(
    6,
    FileBatchOp {
      id: bad.clone(),
      ops: vec![write_op(b"nope", 0, 4, 100), truncate_op(0, 101)],
    },
  );

  let errors = ops.apply_batch(&batch);
  assert_eq!(errors.len(), 1);
  let err = error_for_item(&errors, 6).expect("failing item is index 6");
  // The descriptor never opened, so the failure is not tied to one op.
  assert!(err.op_index.is_none());

  // Every other item applied despite the failure in the middle.
  for id in &good_ids {
    let path = id.active_path(&env.config.active_folder);
    assert_eq!(&fs::read(&path).unwrap()[8..], b"ok");
  }

  // Descriptor tokens were recycled: the cache is usable and bounded.
  assert!(ops.open_files() <= env.config.max_file_open);
}

#[test]
fn test_apply_batch_per_op_failure_reports_index() {
  let env = TestEnv::new();

  // Block the archive root so the archive op fails after the write
  // succeeded.
  fs::write(env.root.join("archive"), b"block").unwrap();

  let mut ops = BucketFileOps::new(env.config.clone());
  let id = test_id();

  let batch = vec![FileBatchOp {
    id: id.clone(),
    ops: vec![write_op(&[0u8; 20], 0, 20, 0), archive_op(&env, &id, 1, 1)],
  }];

  let errors = ops.apply_batch(&batch);
  assert_eq!(errors.len(), 1);
  assert_eq!(errors[0].op_index, Some(1));

  // The write before the failing archive landed.
  let path = id.active_path(&env.config.active_folder);
  assert_eq!(fs::metadata(&path).unwrap().len(), 28);
}

#[test]
fn test_descriptor_cap_is_never_exceeded() {
  let env = TestEnv::new();
  let mut ops = BucketFileOps::new(env.config.clone());

  for i in 0..50 {
    let id = BucketId::new("app", "b1", "bb1", format!("t{}", i)).unwrap();
    ops.write_at(&id, b"x", 0, 1).unwrap();
    assert!(
      ops.open_files() <= env.config.max_file_open,
      "descriptor cap exceeded at iteration {}",
      i
    );
  }

  // Touched entries survive eviction pressure: recently used files are
  // still readable.
  let id = BucketId::new("app", "b1", "bb1", "t49").unwrap();
  assert_eq!(ops.cur_file_size(&id).unwrap(), 1);
}

#[test]
fn test_file_buffer_respects_header_bound() {
  let env = TestEnv::new();
  let mut ops = BucketFileOps::new(env.config.clone());
  let id = test_id();

  ops.write_at(&id, &[7u8; 20], 0, 20).unwrap();

  // Shrink the header by hand: only the committed prefix may be read.
  let path = id.active_path(&env.config.active_folder);
  let mut bytes = fs::read(&path).unwrap();
  bytes[..8].copy_from_slice(&(12u64 + 8).to_be_bytes());
  fs::write(&path, &bytes).unwrap();
  ops.close();

  let mut buf = Buffer::new();
  ops.file_buffer(&id, &mut buf).unwrap();
  assert_eq!(buf.bytes(), &[7u8; 12][..]);
}
