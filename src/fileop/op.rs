use crate::buffer::Buffer;
use crate::error::Error;
use crate::ident::BucketId;
use std::path::PathBuf;
use std::sync::Arc;

/// Kind of one staged byte-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
  Write,
  Archive,
  Truncate,
}

/// One byte-level operation against an active file.
#[derive(Debug, Clone)]
pub struct Op {
  pub kind: OpKind,
  /// Payload of a write. Shared with the WAL command that staged it.
  pub buffer: Option<Arc<Buffer>>,
  /// Write offset, or the target size of a truncate.
  pub offset: u64,
  /// Logical file size after a write.
  pub file_size: u64,
  /// Position of the originating command inside its WAL.
  pub operation_index: u64,
  /// Snapshot destination of an archive. `None` skips the snapshot copy.
  pub archive_path: Option<PathBuf>,
}

/// All operations of one batch that target the same identifier, in staging
/// order.
#[derive(Debug, Clone)]
pub struct FileBatchOp {
  pub id: BucketId,
  pub ops: Vec<Op>,
}

/// A failure while applying a batch, anchored to the batch item and the
/// operation that failed. `op_index` is `None` when the failure was not
/// attributable to a single operation (descriptor open, final fsync) — in
/// that case nothing in the item may be considered applied.
#[derive(Debug)]
pub struct ApplyError {
  pub item_index: usize,
  pub op_index: Option<u64>,
  pub error: Error,
}

/// Finds the error recorded for one batch item, if any.
pub fn error_for_item(errors: &[ApplyError], item_index: usize) -> Option<&ApplyError> {
  errors.iter().find(|e| e.item_index == item_index)
}
