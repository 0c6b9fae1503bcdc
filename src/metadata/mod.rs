//! Tabular metadata records
//!
//! Protocols exchange micrograph, volume and coordinate lists as metadata
//! tables: ordered rows of labelled scalar values, optionally grouped into
//! named blocks inside one file. The on-disk format is owned by a
//! [`MetadataStore`] implementation; the runner only needs to open, iterate,
//! read, modify and write tables.

pub mod json_store;

pub use json_store::JsonMetadataStore;

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Well-known column labels
pub mod labels {
    pub const IMAGE: &str = "image";
    pub const MICROGRAPH: &str = "micrograph";
    pub const MICROGRAPH_TILTED: &str = "micrographTilted";
    pub const SAMPLING_RATE: &str = "samplingRate";
    pub const BOX_SIZE: &str = "boxSize";
    pub const X: &str = "xcoor";
    pub const Y: &str = "ycoor";
    pub const ITEM_ID: &str = "itemId";
    pub const ENABLED: &str = "enabled";
    pub const ORDER: &str = "order";
    pub const NMA_MODEFILE: &str = "nmaModefile";
    pub const REF: &str = "ref";
}

/// Block holding acquisition-wide values such as the sampling rate
pub const ACQUISITION_BLOCK: &str = "acquisition_info";

/// A single metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Float(_) => None,
            Value::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&Path> for Value {
    fn from(v: &Path) -> Self {
        Value::Text(v.to_string_lossy().into_owned())
    }
}

/// Row identifier, 1-based and stable for the lifetime of a table
pub type RowId = usize;

/// An ordered list of rows, each a map from column label to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    rows: Vec<BTreeMap<String, Value>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<BTreeMap<String, Value>>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[BTreeMap<String, Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterate over row ids in order
    pub fn iter(&self) -> impl Iterator<Item = RowId> {
        1..=self.rows.len()
    }

    pub fn first_row(&self) -> Option<RowId> {
        if self.rows.is_empty() {
            None
        } else {
            Some(1)
        }
    }

    pub fn row(&self, row: RowId) -> Option<&BTreeMap<String, Value>> {
        row.checked_sub(1).and_then(|i| self.rows.get(i))
    }

    pub fn get(&self, column: &str, row: RowId) -> Option<&Value> {
        self.row(row).and_then(|r| r.get(column))
    }

    /// Read a column that must be present, reporting `source` on failure
    pub fn require(&self, column: &str, row: RowId, source: &Path) -> Result<&Value> {
        self.get(column, row)
            .ok_or_else(|| PipelineError::MetadataFormat {
                column: column.to_string(),
                path: source.to_path_buf(),
            })
    }

    /// Set a value; returns false when the row does not exist
    pub fn set(&mut self, column: &str, row: RowId, value: impl Into<Value>) -> bool {
        match row.checked_sub(1).and_then(|i| self.rows.get_mut(i)) {
            Some(r) => {
                r.insert(column.to_string(), value.into());
                true
            }
            None => false,
        }
    }

    pub fn append_row(&mut self, values: BTreeMap<String, Value>) -> RowId {
        self.rows.push(values);
        self.rows.len()
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.rows.iter().any(|r| r.contains_key(column))
    }
}

/// How a write treats blocks already present in the target file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the whole file with the written block
    Overwrite,
    /// Keep other blocks, replacing only the written one
    Append,
}

/// File-backed metadata storage
pub trait MetadataStore: Send + Sync {
    /// Open a table, optionally a named block within the file
    fn open(&self, path: &Path, block: Option<&str>) -> Result<Table>;

    /// Write a table, optionally to a named block within the file
    fn write(&self, table: &Table, path: &Path, block: Option<&str>, mode: WriteMode) -> Result<()>;

    /// List block names present in a file
    fn blocks(&self, path: &Path) -> Result<Vec<String>>;
}
