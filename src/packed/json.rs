//! JSON rendering of decoded rows against a table descriptor.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::packed::schema::{ColumnKind, Table};
use crate::packed::{ColumnValue, Row};

/// Renders `rows` as a JSON array of objects into `out`.
///
/// Columns holding an empty blob are treated as absent and omitted from the
/// object. Enum ordinals render as their string name, strings are quoted
/// with `"` and `\` escaped, unsigned columns render as decimal integers.
/// Malformed cells (ordinal out of range, null string) render as `null`;
/// the first such defect is returned as an error once the full render is
/// done, mirroring what the CLI dumper treats as fatal.
pub fn rows_to_json(rows: &[Row], table: &Table, out: &mut Buffer) -> Result<()> {
  let mut defect: Option<Error> = None;

  out.append_byte(b'[');
  for (i, row) in rows.iter().enumerate() {
    if i > 0 {
      out.append_byte(b',');
    }
    if let Err(e) = append_row(row, table, out) {
      defect.get_or_insert(e);
    }
  }
  out.append_byte(b']');

  match defect {
    Some(e) => Err(e),
    None => Ok(()),
  }
}

fn append_row(row: &Row, table: &Table, out: &mut Buffer) -> Result<()> {
  if row.columns.len() < table.columns.len() {
    return Err(Error::Corruption(format!(
      "row has {} columns, descriptor expects {}",
      row.columns.len(),
      table.columns.len()
    )));
  }

  let mut defect: Option<Error> = None;
  let mut first = true;

  out.append_byte(b'{');
  for (descriptor, value) in table.columns.iter().zip(&row.columns) {
    // An empty blob body marks an absent column.
    if matches!(value, ColumnValue::Blob(b) if b.is_empty()) {
      continue;
    }
    if !first {
      out.append_byte(b',');
    }
    first = false;

    out.append_byte(b'"');
    out.append(descriptor.json_key.as_bytes());
    out.append(b"\":");

    let rendered = match descriptor.kind {
      ColumnKind::Uint => {
        out.append(value.raw_value().to_string().as_bytes());
        Ok(())
      }
      ColumnKind::Enum => append_enum(descriptor.enum_values.as_slice(), value, out),
      ColumnKind::String => append_string(value, out),
    };
    if let Err(e) = rendered {
      defect.get_or_insert(e);
    }
  }
  out.append_byte(b'}');

  match defect {
    Some(e) => Err(e),
    None => Ok(()),
  }
}

fn append_enum(enum_values: &[String], value: &ColumnValue, out: &mut Buffer) -> Result<()> {
  let ordinal = value.raw_value() as usize;
  match enum_values.get(ordinal) {
    Some(name) => {
      out.append_byte(b'"');
      out.append(name.as_bytes());
      out.append_byte(b'"');
      Ok(())
    }
    None => {
      out.append(b"null");
      Err(Error::Corruption(format!(
        "enum ordinal {} is outside its {} declared values",
        ordinal,
        enum_values.len()
      )))
    }
  }
}

fn append_string(value: &ColumnValue, out: &mut Buffer) -> Result<()> {
  let Some(bytes) = value.blob() else {
    out.append(b"null");
    return Err(Error::Corruption(
      "string column holds a scalar, not a blob".into(),
    ));
  };
  out.append_byte(b'"');
  for &b in bytes {
    if b == b'"' || b == b'\\' {
      out.append_byte(b'\\');
    }
    out.append_byte(b);
  }
  out.append_byte(b'"');
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::packed::schema::ColumnDescriptor;

  fn table() -> Table {
    Table {
      name: "events".into(),
      columns: vec![
        ColumnDescriptor {
          name: "id".into(),
          json_key: "id".into(),
          mandatory: true,
          enum_values: Vec::new(),
          not_nullable: false,
          kind: ColumnKind::Uint,
        },
        ColumnDescriptor {
          name: "kind".into(),
          json_key: "kind".into(),
          mandatory: false,
          enum_values: vec!["open".into(), "close".into()],
          not_nullable: false,
          kind: ColumnKind::Enum,
        },
        ColumnDescriptor {
          name: "label".into(),
          json_key: "label".into(),
          mandatory: false,
          enum_values: Vec::new(),
          not_nullable: false,
          kind: ColumnKind::String,
        },
      ],
    }
  }

  fn render(rows: &[Row]) -> (String, Result<()>) {
    let mut out = Buffer::new();
    let res = rows_to_json(rows, &table(), &mut out);
    (String::from_utf8(out.as_slice().to_vec()).unwrap(), res)
  }

  #[test]
  fn test_basic_render() {
    let rows = vec![Row::new(vec![
      ColumnValue::Scalar(7),
      ColumnValue::Scalar(1),
      ColumnValue::Blob(b"door".to_vec()),
    ])];
    let (json, res) = render(&rows);
    res.unwrap();
    assert_eq!(json, r#"[{"id":7,"kind":"close","label":"door"}]"#);
  }

  #[test]
  fn test_empty_blob_column_is_omitted() {
    let rows = vec![Row::new(vec![
      ColumnValue::Scalar(7),
      ColumnValue::Scalar(0),
      ColumnValue::Blob(Vec::new()),
    ])];
    let (json, res) = render(&rows);
    res.unwrap();
    assert_eq!(json, r#"[{"id":7,"kind":"open"}]"#);
  }

  #[test]
  fn test_string_escaping() {
    let rows = vec![Row::new(vec![
      ColumnValue::Scalar(1),
      ColumnValue::Scalar(0),
      ColumnValue::Blob(br#"a"b\c"#.to_vec()),
    ])];
    let (json, res) = render(&rows);
    res.unwrap();
    assert_eq!(json, r#"[{"id":1,"kind":"open","label":"a\"b\\c"}]"#);
  }

  #[test]
  fn test_enum_out_of_range_renders_null_and_errors() {
    let rows = vec![Row::new(vec![
      ColumnValue::Scalar(1),
      ColumnValue::Scalar(9),
      ColumnValue::Blob(b"x".to_vec()),
    ])];
    let (json, res) = render(&rows);
    assert!(res.is_err());
    assert_eq!(json, r#"[{"id":1,"kind":null,"label":"x"}]"#);
  }

  #[test]
  fn test_multiple_rows() {
    let row = Row::new(vec![
      ColumnValue::Scalar(1),
      ColumnValue::Scalar(0),
      ColumnValue::Blob(b"x".to_vec()),
    ]);
    let (json, res) = render(&[row.clone(), row]);
    res.unwrap();
    assert!(json.starts_with("[{"));
    assert!(json.contains("},{"));
  }
}
