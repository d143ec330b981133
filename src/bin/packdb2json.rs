//! Dumps packed active files to JSON, one array per file.

use clap::Parser;
use packdb::fileop::file_buffer_from;
use packdb::packed::json::rows_to_json;
use packdb::packed::decode_rows;
use packdb::{Buffer, ColumnValue, Error, Table, Tail};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "packdb2json", about = "Decode packed table files to JSON")]
struct Args {
  /// Path to a JSON table descriptor. Without one, rows are dumped as
  /// positional maps.
  #[arg(long)]
  table: Option<PathBuf>,

  /// Tolerate a corrupt trailing row instead of failing.
  #[arg(long)]
  crc: bool,

  /// Packed files to decode.
  #[arg(required = true)]
  files: Vec<PathBuf>,
}

fn main() -> ExitCode {
  let args = Args::parse();

  let descriptor = match &args.table {
    Some(path) => match Table::from_json_file(path) {
      Ok(table) => Some(table),
      Err(e) => {
        eprintln!("could not read table descriptor: {}", e);
        return ExitCode::FAILURE;
      }
    },
    None => None,
  };

  for path in &args.files {
    match dump_file(path, descriptor.as_ref(), args.crc) {
      Ok(json) => println!("{}", json),
      Err(e) => {
        eprintln!("could not dump {}: {}", path.display(), e);
        return ExitCode::FAILURE;
      }
    }
  }
  ExitCode::SUCCESS
}

fn dump_file(path: &Path, descriptor: Option<&Table>, tolerate_crc: bool) -> packdb::Result<String> {
  let mut file = File::open(path)?;
  let mut buf = Buffer::new();
  file_buffer_from(&mut file, &mut buf)?;

  let decoded = decode_rows(&mut buf)?;
  if let Tail::BadCrc { sane_offset } = decoded.tail {
    if !tolerate_crc {
      return Err(Error::BadTailCrc { sane_offset });
    }
    eprintln!(
      "warning: {} has a corrupt trailing row, keeping {} sane bytes",
      path.display(),
      sane_offset
    );
  }

  match descriptor {
    Some(table) => {
      let mut out = Buffer::new();
      rows_to_json(&decoded.rows, table, &mut out)?;
      Ok(String::from_utf8_lossy(out.as_slice()).into_owned())
    }
    None => {
      // Positional dump: one map of column index to raw value per row.
      let rows: Vec<serde_json::Map<String, serde_json::Value>> = decoded
        .rows
        .iter()
        .map(|row| {
          row
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
              let rendered = match col {
                ColumnValue::Scalar(v) => v.to_string(),
                ColumnValue::Blob(b) => String::from_utf8_lossy(b).into_owned(),
              };
              (i.to_string(), serde_json::Value::String(rendered))
            })
            .collect()
        })
        .collect();
      serde_json::to_string(&rows)
        .map_err(|e| Error::Corruption(format!("could not serialize rows: {}", e)))
    }
  }
}
