//! JSON-backed metadata store
//!
//! Each file holds one JSON object mapping block names to arrays of rows.
//! Tables opened or written without a block name use [`DEFAULT_BLOCK`].

use crate::error::{PipelineError, Result};
use crate::metadata::{MetadataStore, Table, Value, WriteMode};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Block used when none is named
pub const DEFAULT_BLOCK: &str = "data";

type Blocks = BTreeMap<String, Vec<BTreeMap<String, Value>>>;

/// Metadata store writing pretty-printed JSON files
#[derive(Debug, Clone, Default)]
pub struct JsonMetadataStore;

impl JsonMetadataStore {
    pub fn new() -> Self {
        Self
    }

    fn read_blocks(path: &Path) -> Result<Blocks> {
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Blocks::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            PipelineError::Serialization(format!("{}: {}", path.display(), e))
        })
    }
}

impl MetadataStore for JsonMetadataStore {
    fn open(&self, path: &Path, block: Option<&str>) -> Result<Table> {
        let block = block.unwrap_or(DEFAULT_BLOCK);
        let mut blocks = Self::read_blocks(path)?;
        let rows = blocks.remove(block).ok_or_else(|| PipelineError::MissingBlock {
            block: block.to_string(),
            path: path.to_path_buf(),
        })?;
        debug!("Read {} rows from {}@{}", rows.len(), block, path.display());
        Ok(Table::from_rows(rows))
    }

    fn write(&self, table: &Table, path: &Path, block: Option<&str>, mode: WriteMode) -> Result<()> {
        let block = block.unwrap_or(DEFAULT_BLOCK);
        let mut blocks = match mode {
            WriteMode::Append if path.exists() => Self::read_blocks(path)?,
            _ => Blocks::new(),
        };
        blocks.insert(block.to_string(), table.rows().to_vec());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(&blocks)?;
        fs::write(path, content)?;
        debug!("Wrote {} rows to {}@{}", table.len(), block, path.display());
        Ok(())
    }

    fn blocks(&self, path: &Path) -> Result<Vec<String>> {
        Ok(Self::read_blocks(path)?.into_keys().collect())
    }
}
