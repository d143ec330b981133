//! On-disk WAL file codec.
//!
//! Layout: a fixed header `{version u8, walIndex u64, creationUnix u64,
//! shardCount u64, shardIndex u64, successBitmap[40000]}` followed by
//! self-delimited command records `{keyLen u8, key, kind u8, bufLen u64,
//! buf?, writeOffset u64, fileSize u64, retryCount u8}`. All integers are
//! big-endian. The success bitmap records which commands have already been
//! applied, making replay idempotent.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::fileop::{archive_atomic, truncate_atomic, write_atomic};
use crate::ident::BucketId;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const CUR_WAL_VERSION: u8 = 1;

/// Bitmap capacity in bits, which is also the hard cap on commands per WAL.
pub(crate) const SUCCESS_OPERATION_COUNT: usize = 40_000 * 8;

const SUCCESS_BITMAP_BYTES: usize = SUCCESS_OPERATION_COUNT / 8;

/// Byte offset of the bitmap inside the file: version + four u64 fields.
pub(crate) const SUCCESS_BITMAP_OFFSET: u64 = 1 + 8 + 8 + 8 + 8;

/// Full header size including the bitmap.
pub(crate) const HEADER_LEN: u64 = SUCCESS_BITMAP_OFFSET + SUCCESS_BITMAP_BYTES as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CmdKind {
  Write = 0,
  Archive = 1,
  Truncate = 2,
}

impl TryFrom<u8> for CmdKind {
  type Error = Error;
  fn try_from(v: u8) -> Result<Self> {
    match v {
      0 => Ok(CmdKind::Write),
      1 => Ok(CmdKind::Archive),
      2 => Ok(CmdKind::Truncate),
      _ => Err(Error::BadWalCommand(format!("unknown command kind {}", v))),
    }
  }
}

/// One staged command. Write commands share their payload buffer with the
/// byte-level operation derived from them and with their carry-over clone.
#[derive(Debug, Clone)]
pub(crate) struct WalCmd {
  pub id: BucketId,
  pub kind: CmdKind,
  pub buffer: Option<Arc<Buffer>>,
  pub write_offset: u64,
  pub file_size: u64,
  pub operation_index: u32,
  pub retry_count: u8,
}

/// In-memory image of one WAL generation: the command stream in staging
/// order, a per-identifier index preserving identifier insertion order, and
/// the success bitmap.
pub(crate) struct WalFile {
  cmds: Vec<WalCmd>,
  per_file: HashMap<String, Vec<usize>>,
  file_order: Vec<String>,
  wal_index: u64,
  shard_index: u64,
  shard_count: u64,
  unix_creation_time: u64,
  success: Vec<u8>,
}

impl WalFile {
  pub fn new(wal_index: u64, shard_index: u64, shard_count: u64) -> Self {
    Self {
      cmds: Vec::new(),
      per_file: HashMap::new(),
      file_order: Vec::new(),
      wal_index,
      shard_index,
      shard_count,
      unix_creation_time: unix_now(),
      success: vec![0u8; SUCCESS_BITMAP_BYTES],
    }
  }

  pub fn wal_index(&self) -> u64 {
    self.wal_index
  }

  pub fn shard_index(&self) -> u64 {
    self.shard_index
  }

  pub fn shard_count(&self) -> u64 {
    self.shard_count
  }

  pub fn cmd_count(&self) -> usize {
    self.cmds.len()
  }

  pub fn cmds(&self) -> &[WalCmd] {
    &self.cmds
  }

  pub fn cmd_mut(&mut self, index: usize) -> &mut WalCmd {
    &mut self.cmds[index]
  }

  /// Identifier keys in first-staged order.
  pub fn file_keys(&self) -> &[String] {
    &self.file_order
  }

  /// Command indices staged for one identifier, in staging order.
  pub fn indices_for(&self, key: &str) -> &[usize] {
    self.per_file.get(key).map_or(&[], |v| v.as_slice())
  }

  pub fn last_index_for(&self, key: &str) -> Option<usize> {
    self.per_file.get(key).and_then(|v| v.last().copied())
  }

  pub fn add_cmd(&mut self, cmd: WalCmd) {
    let key = cmd.id.key();
    let index = self.cmds.len();
    self.cmds.push(cmd);
    match self.per_file.get_mut(&key) {
      Some(indices) => indices.push(index),
      None => {
        self.per_file.insert(key.clone(), vec![index]);
        self.file_order.push(key);
      }
    }
  }

  pub fn set_success(&mut self, operation_index: usize, value: bool) {
    let byte = operation_index / 8;
    let bit = operation_index % 8;
    if value {
      self.success[byte] |= 1 << bit;
    } else {
      self.success[byte] &= !(1 << bit);
    }
  }

  pub fn success(&self, operation_index: usize) -> bool {
    let byte = operation_index / 8;
    let bit = operation_index % 8;
    (self.success[byte] & (1 << bit)) != 0
  }

  /// Replaces the command set for the next generation, clearing the bitmap.
  pub fn reset_with(&mut self, cmds: Vec<WalCmd>, wal_index: u64) {
    self.wal_index = wal_index;
    self.per_file.clear();
    self.file_order.clear();
    self.cmds.clear();
    for cmd in cmds {
      self.add_cmd(cmd);
    }
    self.success.iter_mut().for_each(|b| *b = 0);
  }

  /// Writes the header, stamping the creation time.
  pub fn write_header<W: Write>(&mut self, w: &mut W) -> Result<()> {
    self.unix_creation_time = unix_now();
    w.write_u8(CUR_WAL_VERSION)?;
    w.write_u64::<BigEndian>(self.wal_index)?;
    w.write_u64::<BigEndian>(self.unix_creation_time)?;
    w.write_u64::<BigEndian>(self.shard_count)?;
    w.write_u64::<BigEndian>(self.shard_index)?;
    w.write_all(&self.success)?;
    Ok(())
  }

  /// Appends one command record.
  pub fn write_cmd<W: Write>(w: &mut W, cmd: &WalCmd) -> Result<()> {
    let key = cmd.id.key();
    if key.len() > 255 {
      return Err(Error::InvalidIdentifier(format!(
        "key of {} bytes does not fit the record format",
        key.len()
      )));
    }
    w.write_u8(key.len() as u8)?;
    w.write_all(key.as_bytes())?;
    w.write_u8(cmd.kind as u8)?;
    let buf_len = cmd.buffer.as_ref().map_or(0, |b| b.full_len() as u64);
    w.write_u64::<BigEndian>(buf_len)?;
    if let Some(buffer) = &cmd.buffer {
      w.write_all(buffer.as_slice())?;
    }
    w.write_u64::<BigEndian>(cmd.write_offset)?;
    w.write_u64::<BigEndian>(cmd.file_size)?;
    w.write_u8(cmd.retry_count)?;
    Ok(())
  }

  /// Rewrites the success bitmap at its fixed offset and fsyncs.
  pub fn sync_success_bitmap(&self, file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(SUCCESS_BITMAP_OFFSET))?;
    file.write_all(&self.success)?;
    file.sync_data()?;
    Ok(())
  }

  /// Reads a WAL file back. A record that cannot be fully read terminates
  /// the scan: the valid prefix is kept and the torn-record condition is
  /// returned alongside for the caller to log.
  pub fn read_from_path(path: &Path) -> Result<(Self, Option<Error>)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut wal = Self::new(0, 0, 0);
    wal.read_header(&mut reader)?;

    let mut torn = None;
    let mut cur_index = 0u32;
    loop {
      match read_cmd(&mut reader, cur_index) {
        Ok(Some(cmd)) => {
          wal.add_cmd(cmd);
          cur_index += 1;
        }
        Ok(None) => break,
        Err(e) => {
          torn = Some(e);
          break;
        }
      }
    }
    Ok((wal, torn))
  }

  fn read_header<R: Read>(&mut self, r: &mut R) -> Result<()> {
    let version = r.read_u8()?;
    if version != CUR_WAL_VERSION {
      return Err(Error::Corruption(format!(
        "unsupported wal file version {}",
        version
      )));
    }
    self.wal_index = r.read_u64::<BigEndian>()?;
    self.unix_creation_time = r.read_u64::<BigEndian>()?;
    self.shard_count = r.read_u64::<BigEndian>()?;
    self.shard_index = r.read_u64::<BigEndian>()?;
    r.read_exact(&mut self.success)?;
    Ok(())
  }

  /// Re-executes every command of this WAL against an alternate directory
  /// tree. Used by the replicator on archived WAL files. Errors are
  /// collected per command; replay continues with the next command.
  pub fn cold_replay(&self, active_root: &Path, archive_root: Option<&Path>) -> Vec<Error> {
    let mut errors = Vec::new();

    for key in &self.file_order {
      let indices = &self.per_file[key];
      let id = self.cmds[indices[0]].id.clone();
      let path = id.active_path(active_root);

      if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
          errors.push(Error::Io(e));
          continue;
        }
      }
      let mut slot = match OpenOptions::new().create(true).read(true).write(true).open(&path) {
        Ok(f) => Some(f),
        Err(e) => {
          errors.push(Error::Io(e));
          continue;
        }
      };

      for (pos, &cmd_index) in indices.iter().enumerate() {
        let cmd = &self.cmds[cmd_index];
        let res: Result<()> = match cmd.kind {
          CmdKind::Write => slot
            .as_mut()
            .ok_or_else(|| {
              Error::Io(io::Error::new(io::ErrorKind::Other, "active file was deleted"))
            })
            .and_then(|f| {
              let empty: &[u8] = &[];
              let payload = cmd.buffer.as_ref().map_or(empty, |b| b.as_slice());
              write_atomic(f, payload, cmd.write_offset, cmd.file_size)
            }),
          CmdKind::Truncate => slot
            .as_mut()
            .ok_or_else(|| {
              Error::Io(io::Error::new(io::ErrorKind::Other, "active file was deleted"))
            })
            .and_then(|f| truncate_atomic(f, cmd.write_offset)),
          CmdKind::Archive => {
            let archive_path = archive_root.map(|root| {
              id.archive_path(
                root,
                self.shard_index as u32,
                self.wal_index,
                cmd.operation_index,
              )
            });
            archive_atomic(
              &mut slot,
              &path,
              archive_path.as_deref(),
              pos == indices.len() - 1,
            )
            .map(|_| ())
          }
        };
        if let Err(e) = res {
          errors.push(e);
        }
      }
    }
    errors
  }
}

fn read_cmd<R: Read>(r: &mut R, cur_index: u32) -> Result<Option<WalCmd>> {
  // Clean EOF at a record boundary is the normal end of the stream.
  let key_len = match r.read_u8() {
    Ok(n) => n,
    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
    Err(e) => return Err(Error::Io(e)),
  };

  let torn = |what: &str| Error::BadWalCommand(format!("record {} torn at {}", cur_index, what));

  let mut key_buf = vec![0u8; key_len as usize];
  r.read_exact(&mut key_buf).map_err(|_| torn("key"))?;
  let key = String::from_utf8(key_buf)
    .map_err(|_| Error::BadWalCommand(format!("record {} key is not utf-8", cur_index)))?;
  let id = BucketId::parse_key(&key)
    .map_err(|e| Error::BadWalCommand(format!("record {}: {}", cur_index, e)))?;

  let kind = CmdKind::try_from(r.read_u8().map_err(|_| torn("kind"))?)?;
  let buf_len = r.read_u64::<BigEndian>().map_err(|_| torn("buffer length"))?;

  let buffer = if buf_len > 0 {
    let mut buf = Buffer::with_capacity(buf_len as usize);
    let space = buf.extend_zeroed(buf_len as usize);
    r.read_exact(space).map_err(|_| torn("buffer payload"))?;
    Some(Arc::new(buf))
  } else {
    None
  };

  let write_offset = r.read_u64::<BigEndian>().map_err(|_| torn("write offset"))?;
  let file_size = r.read_u64::<BigEndian>().map_err(|_| torn("file size"))?;
  let retry_count = r.read_u8().map_err(|_| torn("retry count"))?;

  Ok(Some(WalCmd {
    id,
    kind,
    buffer,
    write_offset,
    file_size,
    operation_index: cur_index,
    retry_count,
  }))
}

fn unix_now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}
