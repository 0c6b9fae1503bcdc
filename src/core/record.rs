//! Records and record sets
//!
//! A record is one item of a processing set (a micrograph, a volume, a class)
//! identified by an id unique within its set. Record sets carry shared
//! acquisition values alongside the records.

use crate::core::params::ParameterSet;
use crate::error::{PipelineError, Result};
use crate::metadata::{labels, MetadataStore, Table, Value, WriteMode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One item of a record set
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: u64,
    pub location: PathBuf,
    pub attrs: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: u64, location: impl Into<PathBuf>) -> Self {
        Self {
            id,
            location: location.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(label.into(), value.into());
        self
    }

    pub fn attr(&self, label: &str) -> Option<&Value> {
        self.attrs.get(label)
    }

    /// File name without directory and extension, used to derive output paths
    pub fn stem(&self) -> String {
        self.location
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Ordered records plus values shared by the whole set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: Vec<Record>,
    pub shared: BTreeMap<String, Value>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<Record>) -> Result<Self> {
        let mut set = Self::new();
        for record in records {
            set.push(record)?;
        }
        Ok(set)
    }

    /// Append a record; ids must be unique within the set
    pub fn push(&mut self, record: Record) -> Result<()> {
        if self.records.iter().any(|r| r.id == record.id) {
            return Err(PipelineError::config(format!(
                "duplicate record id {} ({})",
                record.id,
                record.location.display()
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn get(&self, id: u64) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn set_shared(&mut self, label: impl Into<String>, value: impl Into<Value>) {
        self.shared.insert(label.into(), value.into());
    }

    pub fn sampling_rate(&self) -> Option<f64> {
        self.shared.get(labels::SAMPLING_RATE).and_then(Value::as_f64)
    }

    pub fn box_size(&self) -> Option<i64> {
        self.shared.get(labels::BOX_SIZE).and_then(Value::as_i64)
    }

    /// Build from metadata rows. Ids come from the `itemId` column when
    /// present, otherwise from the row position.
    pub fn from_table(table: &Table, location_column: &str, source: &Path) -> Result<Self> {
        let mut set = Self::new();
        for row in table.iter() {
            let location = table.require(location_column, row, source)?;
            let id = match table.get(labels::ITEM_ID, row).and_then(Value::as_i64) {
                Some(id) if id >= 0 => id as u64,
                _ => row as u64,
            };
            let mut record = Record::new(id, location.to_string());
            if let Some(values) = table.row(row) {
                for (label, value) in values {
                    if label != location_column && label != labels::ITEM_ID {
                        record.attrs.insert(label.clone(), value.clone());
                    }
                }
            }
            set.push(record)?;
        }
        Ok(set)
    }

    /// Rows for every record, location stored under `location_column`
    pub fn to_table(&self, location_column: &str) -> Table {
        let mut table = Table::new();
        for record in &self.records {
            let mut row = record.attrs.clone();
            row.insert(labels::ITEM_ID.to_string(), Value::Int(record.id as i64));
            row.insert(location_column.to_string(), Value::from(record.location.as_path()));
            table.append_row(row);
        }
        table
    }

    /// Load records from `block` and, if given, shared values from the first
    /// row of `shared_block`
    pub fn load(
        store: &dyn MetadataStore,
        path: &Path,
        block: Option<&str>,
        location_column: &str,
        shared_block: Option<&str>,
    ) -> Result<Self> {
        let table = store.open(path, block)?;
        let mut set = Self::from_table(&table, location_column, path)?;
        if let Some(shared_block) = shared_block {
            let shared = store.open(path, Some(shared_block))?;
            if let Some(row) = shared.first_row().and_then(|r| shared.row(r)) {
                set.shared = row.clone();
            }
        }
        Ok(set)
    }

    /// Write records to `block` and shared values to `shared_block`
    pub fn save(
        &self,
        store: &dyn MetadataStore,
        path: &Path,
        block: Option<&str>,
        location_column: &str,
        shared_block: &str,
    ) -> Result<()> {
        store.write(&self.to_table(location_column), path, block, WriteMode::Overwrite)?;
        if !self.shared.is_empty() {
            let mut shared = Table::new();
            shared.append_row(self.shared.clone());
            store.write(&shared, path, Some(shared_block), WriteMode::Append)?;
        }
        Ok(())
    }
}

/// Named input record sets handed to a protocol
#[derive(Debug, Clone, Default)]
pub struct InputSets {
    sets: BTreeMap<String, RecordSet>,
}

impl InputSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, set: RecordSet) -> Self {
        self.sets.insert(name.into(), set);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, set: RecordSet) {
        self.sets.insert(name.into(), set);
    }

    pub fn get(&self, name: &str) -> Option<&RecordSet> {
        self.sets.get(name)
    }

    /// Follow the reference parameter `param` to its record set
    pub fn resolve(&self, params: &ParameterSet, param: &str) -> Result<&RecordSet> {
        let name = params.get_reference(param)?;
        self.sets.get(name).ok_or_else(|| {
            PipelineError::config(format!(
                "input pointer '{}' resolves to no object ('{}')",
                param, name
            ))
        })
    }

    /// Like [`resolve`](Self::resolve), but an unset parameter yields `None`
    pub fn resolve_optional(&self, params: &ParameterSet, param: &str) -> Result<Option<&RecordSet>> {
        if params.contains(param) {
            self.resolve(params, param).map(Some)
        } else {
            Ok(None)
        }
    }
}
