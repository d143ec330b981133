//! # packdb
//!
//! `packdb` is a crash-safe, sharded, append-oriented storage engine for
//! many small packed tabular files.
//!
//! Producers submit row batches keyed by a four-part identifier
//! (container, bucket, sub-bucket, table). Every mutation is journaled in a
//! per-shard write-ahead log, applied atomically to the backing active
//! file, and optionally relocated to an archive tree where a downstream
//! consumer ingests it into long-term per-table storage.
//!
//! ## Key properties
//!
//! * **Crash safety**: mutations are staged as WAL commands, applied at
//!   checkpoints, and replayed idempotently after a failure.
//! * **At most one writer per shard**: identifiers route deterministically
//!   to one of N engines, each behind its own mutex.
//! * **Per-row integrity**: every packed row frame carries a checksum, and
//!   a corrupt tail repairs itself on read.
//! * **Bounded resources**: open descriptors are capped by an LRU cache;
//!   event queues are bounded and drop with a warning instead of blocking.
//!
//! ## Example
//!
//! ```no_run
//! use packdb::{BucketId, ColumnValue, Config, Driver, Row};
//!
//! # fn main() -> packdb::Result<()> {
//! let driver = Driver::open(Config::default(), None)?;
//! let id = BucketId::new("app", "b1", "bb1", "events")?;
//!
//! driver.append_rows(&id, &[Row::new(vec![
//!   ColumnValue::Scalar(7),
//!   ColumnValue::Blob(b"hello".to_vec()),
//! ])])?;
//! driver.flush()?;
//!
//! let rows = driver.read_all_rows(&id)?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

mod buffer;
mod config;
mod driver;
mod error;
pub mod fileop;
mod ident;
pub mod packed;
mod shard;
mod wal;

pub use buffer::Buffer;
pub use config::Config;
pub use driver::Driver;
pub use error::{Error, Result};
pub use ident::BucketId;
pub use packed::schema::{ColumnDescriptor, ColumnKind, Table};
pub use packed::{ColumnValue, DecodedRows, Row, Tail};
pub use shard::{ArchiveConsumer, ShardWal};
pub use wal::replicator::Replicator;
pub use wal::Wal;
