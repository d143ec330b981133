//! Packed row codec.
//!
//! Rows are sequences of tagged varint columns. Each column is one unsigned
//! varint whose low bit flags a blob; scalar columns carry their value in
//! the remaining bits, blob columns carry the payload length and the
//! payload bytes follow. Rows are framed as `u16 BE length, body, u8 crc`
//! where the CRC is the additive 8-bit checksum with base 128.

pub mod json;
pub mod schema;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};

const MAX_VARINT_LEN: usize = 10;

/// One column: either a scalar (unsigned integer / enum ordinal) or a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
  Scalar(u64),
  Blob(Vec<u8>),
}

impl ColumnValue {
  /// The raw encoded value: the scalar itself, or the blob length.
  pub fn raw_value(&self) -> u64 {
    match self {
      ColumnValue::Scalar(v) => *v,
      ColumnValue::Blob(b) => b.len() as u64,
    }
  }

  pub fn blob(&self) -> Option<&[u8]> {
    match self {
      ColumnValue::Scalar(_) => None,
      ColumnValue::Blob(b) => Some(b),
    }
  }

  fn append_to(&self, out: &mut Vec<u8>) {
    match self {
      ColumnValue::Scalar(v) => write_uvarint(out, v << 1),
      ColumnValue::Blob(b) => {
        write_uvarint(out, ((b.len() as u64) << 1) | 1);
        out.extend_from_slice(b);
      }
    }
  }
}

/// Ordered sequence of column values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
  pub columns: Vec<ColumnValue>,
}

impl Row {
  pub fn new(columns: Vec<ColumnValue>) -> Self {
    Self { columns }
  }
}

/// How a decode run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
  /// Every frame decoded and the payload was fully consumed.
  Clean,
  /// The trailing frame was truncated or failed its CRC. `sane_offset` is
  /// the payload offset just past the last good row, suitable for a
  /// truncate command.
  BadCrc { sane_offset: u64 },
}

/// Result of decoding a packed payload: the rows that decoded cleanly plus
/// the tail condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRows {
  pub rows: Vec<Row>,
  pub tail: Tail,
}

/// Appends the framed encoding of `rows` to `out`.
pub fn encode_rows(rows: &[Row], out: &mut Buffer) -> Result<()> {
  let mut body = Vec::with_capacity(128);
  for row in rows {
    body.clear();
    for col in &row.columns {
      col.append_to(&mut body);
    }
    if body.len() > u16::MAX as usize {
      return Err(Error::Corruption(format!(
        "row body of {} bytes exceeds the 16-bit frame length",
        body.len()
      )));
    }
    let mut len_prefix = [0u8; 2];
    BigEndian::write_u16(&mut len_prefix, body.len() as u16);
    out.append(&len_prefix);
    out.append(&body);
    out.append_byte(crc8(&body));
  }
  Ok(())
}

/// Decodes row frames from the unread region of `buf`.
///
/// Trailing truncation or a trailing CRC mismatch ends the scan with
/// [`Tail::BadCrc`] and the rows decoded so far; a varint overflow or a
/// column overrunning its row body is a hard error.
pub fn decode_rows(buf: &mut Buffer) -> Result<DecodedRows> {
  let mut rows = Vec::new();
  let mut sane_offset = buf.read_offset() as u64;
  let base_offset = sane_offset;

  loop {
    if buf.is_empty() {
      return Ok(DecodedRows {
        rows,
        tail: Tail::Clean,
      });
    }
    if buf.len() < 3 {
      // Not even a length prefix and a CRC left: torn tail.
      return Ok(DecodedRows {
        rows,
        tail: Tail::BadCrc {
          sane_offset: sane_offset - base_offset,
        },
      });
    }

    let len_bytes = buf.read_next(2);
    let body_len = BigEndian::read_u16(len_bytes) as usize;
    if buf.len() < body_len + 1 {
      return Ok(DecodedRows {
        rows,
        tail: Tail::BadCrc {
          sane_offset: sane_offset - base_offset,
        },
      });
    }

    // Borrow juggling: take the body by offset so the CRC byte read does
    // not overlap the body borrow.
    let body_start = buf.read_offset();
    buf.read_next(body_len);
    let crc = buf.read_byte().expect("length was checked above");
    let body = &buf.as_slice()[body_start..body_start + body_len];

    if crc8(body) != crc {
      return Ok(DecodedRows {
        rows,
        tail: Tail::BadCrc {
          sane_offset: sane_offset - base_offset,
        },
      });
    }

    rows.push(decode_row_body(body)?);
    sane_offset = buf.read_offset() as u64;
  }
}

/// Decodes one row body into its columns. The body must be exactly consumed.
fn decode_row_body(body: &[u8]) -> Result<Row> {
  let mut columns = Vec::new();
  let mut pos = 0usize;
  while pos < body.len() {
    let (tag, n) = read_uvarint(&body[pos..])?;
    pos += n;
    if tag & 1 == 1 {
      let blob_len = (tag >> 1) as usize;
      if blob_len > body.len() - pos {
        return Err(Error::Corruption(format!(
          "blob of {} bytes overruns its row body",
          blob_len
        )));
      }
      columns.push(ColumnValue::Blob(body[pos..pos + blob_len].to_vec()));
      pos += blob_len;
    } else {
      columns.push(ColumnValue::Scalar(tag >> 1));
    }
  }
  Ok(Row { columns })
}

/// Additive 8-bit checksum with base 128.
pub(crate) fn crc8(body: &[u8]) -> u8 {
  body
    .iter()
    .fold(128u8, |acc, &b| acc.wrapping_add(b))
}

/// LEB128 unsigned varint, at most 10 bytes; the 10th byte may only be 0 or 1.
fn write_uvarint(out: &mut Vec<u8>, mut v: u64) {
  while v >= 0x80 {
    out.push((v as u8) | 0x80);
    v >>= 7;
  }
  out.push(v as u8);
}

fn read_uvarint(bytes: &[u8]) -> Result<(u64, usize)> {
  let mut x = 0u64;
  let mut shift = 0u32;
  for i in 0..MAX_VARINT_LEN {
    let b = *bytes
      .get(i)
      .ok_or_else(|| Error::Corruption("varint overruns its row body".into()))?;
    if b < 0x80 {
      if i == MAX_VARINT_LEN - 1 && b > 1 {
        return Err(Error::Corruption("varint overflows a 64-bit integer".into()));
      }
      return Ok((x | (b as u64) << shift, i + 1));
    }
    x |= ((b & 0x7f) as u64) << shift;
    shift += 7;
  }
  Err(Error::Corruption("varint overflows a 64-bit integer".into()))
}
