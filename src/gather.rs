//! Result gathering
//!
//! After a graph has run, fully or partially, the gatherer turns the files
//! the item steps wrote back into a record set, carrying shared acquisition
//! values forward from the input set and adjusting them where the
//! processing changed them.

use crate::core::{Record, RecordSet};
use crate::error::{PipelineError, Result};
use crate::metadata::{MetadataStore, Table, Value, WriteMode, ACQUISITION_BLOCK};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File an item step was expected to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutput {
    /// Id of the input record the file was derived from
    pub record_id: u64,
    pub path: PathBuf,
}

impl ItemOutput {
    pub fn new(record_id: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            record_id,
            path: path.into(),
        }
    }
}

/// How missing item outputs are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatherMode {
    /// Items without output are left out
    #[default]
    Lenient,
    /// Any missing output fails the gather
    Strict,
}

/// Change applied to a shared value of the gathered set
#[derive(Debug, Clone, PartialEq)]
pub enum SharedAdjustment {
    /// Multiply a numeric value
    Scale { label: String, factor: f64 },
    /// Replace a value
    Set { label: String, value: Value },
}

impl SharedAdjustment {
    pub fn scale(label: impl Into<String>, factor: f64) -> Self {
        SharedAdjustment::Scale {
            label: label.into(),
            factor,
        }
    }

    pub fn set(label: impl Into<String>, value: impl Into<Value>) -> Self {
        SharedAdjustment::Set {
            label: label.into(),
            value: value.into(),
        }
    }

    fn apply(&self, values: &mut BTreeMap<String, Value>) {
        match self {
            SharedAdjustment::Scale { label, factor } => {
                if let Some(current) = values.get(label).and_then(Value::as_f64) {
                    values.insert(label.clone(), Value::Float(current * factor));
                }
            }
            SharedAdjustment::Set { label, value } => {
                values.insert(label.clone(), value.clone());
            }
        }
    }
}

/// Builds output record sets from item outputs
#[derive(Debug, Clone, Default)]
pub struct ResultGatherer {
    mode: GatherMode,
    adjustments: Vec<SharedAdjustment>,
}

impl ResultGatherer {
    pub fn new(mode: GatherMode) -> Self {
        Self {
            mode,
            adjustments: Vec::new(),
        }
    }

    pub fn with_adjustment(mut self, adjustment: SharedAdjustment) -> Self {
        self.adjustments.push(adjustment);
        self
    }

    pub fn mode(&self) -> GatherMode {
        self.mode
    }

    fn adjusted(&self, values: &mut BTreeMap<String, Value>) {
        for adjustment in &self.adjustments {
            adjustment.apply(values);
        }
    }

    fn adjusted_shared(&self, input: &RecordSet) -> BTreeMap<String, Value> {
        let mut shared = input.shared.clone();
        self.adjusted(&mut shared);
        shared
    }

    /// Fail in strict mode when any output is missing
    fn check_missing(&self, expected: usize, missing: Vec<PathBuf>) -> Result<()> {
        if missing.is_empty() {
            return Ok(());
        }
        match self.mode {
            GatherMode::Strict => Err(PipelineError::IncompleteResults { expected, missing }),
            GatherMode::Lenient => {
                warn!("{} of {} item outputs missing; left out", missing.len(), expected);
                Ok(())
            }
        }
    }

    /// One record per existing output file, located at that file
    ///
    /// Attributes come from the input record the file was derived from;
    /// shared values of the input set fill attributes the record lacks.
    pub fn gather(&self, outputs: &[ItemOutput], input: &RecordSet) -> Result<RecordSet> {
        let mut missing = Vec::new();
        let mut result = RecordSet::new();

        for output in outputs {
            if !output.path.exists() {
                debug!("Item output not found: {}", output.path.display());
                missing.push(output.path.clone());
                continue;
            }

            let mut attrs = input
                .get(output.record_id)
                .map(|r| r.attrs.clone())
                .unwrap_or_default();
            for (label, value) in &input.shared {
                attrs.entry(label.clone()).or_insert_with(|| value.clone());
            }
            self.adjusted(&mut attrs);

            result.push(Record {
                id: output.record_id,
                location: output.path.clone(),
                attrs,
            })?;
        }

        self.check_missing(outputs.len(), missing)?;
        result.shared = self.adjusted_shared(input);

        info!("Gathered {} of {} item outputs", result.len(), outputs.len());
        Ok(result)
    }

    /// Read per-item metadata files; every row becomes a record
    ///
    /// Each row must carry `location_column` and every column in `required`.
    pub fn gather_metadata(
        &self,
        store: &dyn MetadataStore,
        outputs: &[ItemOutput],
        input: &RecordSet,
        location_column: &str,
        required: &[&str],
    ) -> Result<RecordSet> {
        let mut missing = Vec::new();
        let mut result = RecordSet::new();
        let mut next_id = 1;

        for output in outputs {
            if !output.path.exists() {
                missing.push(output.path.clone());
                continue;
            }

            let table = store.open(&output.path, None)?;
            for row in table.iter() {
                let location = table.require(location_column, row, &output.path)?.to_string();
                for column in required {
                    table.require(column, row, &output.path)?;
                }

                let mut attrs = table.row(row).cloned().unwrap_or_default();
                attrs.remove(location_column);
                for (label, value) in &input.shared {
                    attrs.entry(label.clone()).or_insert_with(|| value.clone());
                }
                self.adjusted(&mut attrs);

                result.push(Record {
                    id: next_id,
                    location: PathBuf::from(location),
                    attrs,
                })?;
                next_id += 1;
            }
        }

        self.check_missing(outputs.len(), missing)?;
        result.shared = self.adjusted_shared(input);
        Ok(result)
    }

    /// Write records and shared values into one combined metadata file
    pub fn write_combined(
        &self,
        store: &dyn MetadataStore,
        set: &RecordSet,
        path: &Path,
        block: Option<&str>,
        location_column: &str,
    ) -> Result<()> {
        set.save(store, path, block, location_column, ACQUISITION_BLOCK)?;
        info!("Wrote {} records to {}", set.len(), path.display());
        Ok(())
    }

    /// Rewrite a metadata table through an input to output path map
    ///
    /// Values of `columns` found in `io_map` are replaced; the acquisition
    /// block of the input file, when present, is copied with the shared
    /// adjustments applied.
    pub fn convert_metadata(
        &self,
        store: &dyn MetadataStore,
        input: &Path,
        output: &Path,
        block: Option<&str>,
        io_map: &HashMap<String, PathBuf>,
        columns: &[&str],
    ) -> Result<Table> {
        let mut table = store.open(input, block)?;
        let rows: Vec<_> = table.iter().collect();

        for row in rows {
            for column in columns {
                let mapped = table
                    .get(column, row)
                    .map(|v| v.to_string())
                    .and_then(|v| io_map.get(&v).cloned());
                if let Some(new_path) = mapped {
                    table.set(column, row, new_path.as_path());
                }
            }
        }

        store.write(&table, output, block, WriteMode::Overwrite)?;

        if store.blocks(input)?.iter().any(|b| b == ACQUISITION_BLOCK) {
            let mut acquisition = store.open(input, Some(ACQUISITION_BLOCK))?;
            let rows: Vec<_> = acquisition.iter().collect();
            for row in rows {
                let mut values = acquisition.row(row).cloned().unwrap_or_default();
                self.adjusted(&mut values);
                for (label, value) in values {
                    acquisition.set(&label, row, value);
                }
            }
            store.write(&acquisition, output, Some(ACQUISITION_BLOCK), WriteMode::Append)?;
        }

        info!("Converted {} -> {}", input.display(), output.display());
        Ok(table)
    }
}
