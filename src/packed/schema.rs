use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Storage type of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
  Uint,
  Enum,
  String,
}

/// Descriptor of one storage column.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
  pub name: String,
  pub json_key: String,
  #[serde(default)]
  pub mandatory: bool,
  #[serde(default)]
  pub enum_values: Vec<String>,
  #[serde(default)]
  pub not_nullable: bool,
  #[serde(rename = "type")]
  pub kind: ColumnKind,
}

/// Table descriptor: an ordered set of columns.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
  pub name: String,
  pub columns: Vec<ColumnDescriptor>,
}

impl Table {
  /// Loads a descriptor from a JSON file.
  pub fn from_json_file(path: &Path) -> Result<Self> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
      .map_err(|e| Error::Config(format!("bad table descriptor {}: {}", path.display(), e)))
  }
}
