//! Per-sample count tables and the merged count matrix.
//!
//! The merge is a left fold of pairwise inner joins starting from the first
//! table. Rows missing from any one table are dropped, and each fold step
//! logs how many. Row order follows the first table.

use std::path::Path;
use fxhash::{FxHashMap, FxHashSet};
use log::{debug, warn};
use ndarray::{concatenate, Array2, Axis};
use crate::config::defs::COUNT_TRAILER_ROWS;


#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeError {
    #[error("no count tables to merge")]
    NoTables,

    #[error("sample {0} appears more than once")]
    DuplicateSample(String),

    #[error("feature {feature} appears more than once in sample {sample}")]
    DuplicateFeature { sample: String, feature: String },

    #[error("sample {sample} shares no feature ids with {previous}")]
    DisjointKeys { sample: String, previous: String },

    #[error("{sample} line {line}: {reason}")]
    MalformedRow { sample: String, line: usize, reason: String },

    #[error("{sample} has {rows} rows, fewer than the {expected}-row counter trailer")]
    MissingTrailer { sample: String, rows: usize, expected: usize },

    #[error("{0} has no feature rows once the counter trailer is removed")]
    EmptyTable(String),

    #[error("sample {0} not present in the count matrix")]
    UnknownSample(String),

    #[error("matrix shape error: {0}")]
    Shape(String),

    #[error("IO error on {path}: {reason}")]
    Io { path: String, reason: String },
}


/// One sample's counts, trailer already removed.
#[derive(Debug, Clone, PartialEq)]
pub struct CountTable {
    pub sample: String,
    pub rows: Vec<(String, u64)>,
}

impl CountTable {
    pub fn new(sample: &str, rows: Vec<(String, u64)>) -> Result<Self, MergeError> {
        let mut seen = FxHashSet::default();
        for (feature, _) in &rows {
            if !seen.insert(feature.as_str()) {
                return Err(MergeError::DuplicateFeature {
                    sample: sample.to_string(),
                    feature: feature.clone(),
                });
            }
        }
        Ok(CountTable { sample: sample.to_string(), rows })
    }
}

/// Parses a counter output file: `feature<TAB>count` with no header and a
/// fixed trailer of summary rows (`__no_feature` .. `__alignment_not_unique`)
/// that is removed by position.
///
/// # Arguments
///
/// * `path` - Count file written by the counting stage.
/// * `sample` - Column label for this table.
///
/// # Returns
/// CountTable without the trailer rows.
pub fn read_count_table(path: &Path, sample: &str) -> Result<CountTable, MergeError> {
    let io_err = |e: csv::Error| MergeError::Io { path: path.display().to_string(), reason: e.to_string() };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(io_err)?;

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(io_err)?;
        let line = i + 1;
        if record.len() != 2 {
            return Err(MergeError::MalformedRow {
                sample: sample.to_string(),
                line,
                reason: format!("expected 2 columns, found {}", record.len()),
            });
        }
        let count = record[1].trim().parse::<u64>().map_err(|e| MergeError::MalformedRow {
            sample: sample.to_string(),
            line,
            reason: format!("count '{}': {}", &record[1], e),
        })?;
        rows.push((record[0].to_string(), count));
    }

    if rows.len() < COUNT_TRAILER_ROWS {
        return Err(MergeError::MissingTrailer {
            sample: sample.to_string(),
            rows: rows.len(),
            expected: COUNT_TRAILER_ROWS,
        });
    }
    let trailer = rows.split_off(rows.len() - COUNT_TRAILER_ROWS);
    if let Some((feature, _)) = trailer.iter().find(|(f, _)| !f.starts_with("__")) {
        warn!("{}: trailer row {} does not look like a counter summary row", sample, feature);
    }
    if rows.is_empty() {
        return Err(MergeError::EmptyTable(sample.to_string()));
    }
    CountTable::new(sample, rows)
}


/// Rows keyed by feature id, one column per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct CountMatrix {
    pub features: Vec<String>,
    pub samples: Vec<String>,
    pub counts: Array2<u64>,
}

impl CountMatrix {
    fn from_table(table: &CountTable) -> Result<Self, MergeError> {
        let features: Vec<String> = table.rows.iter().map(|(f, _)| f.clone()).collect();
        let values: Vec<u64> = table.rows.iter().map(|(_, c)| *c).collect();
        let counts = Array2::from_shape_vec((values.len(), 1), values)
            .map_err(|e| MergeError::Shape(e.to_string()))?;
        Ok(CountMatrix { features, samples: vec![table.sample.clone()], counts })
    }

    pub fn nrows(&self) -> usize {
        self.counts.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.counts.ncols()
    }

    pub fn get(&self, feature: &str, sample: &str) -> Option<u64> {
        let row = self.features.iter().position(|f| f == feature)?;
        let col = self.samples.iter().position(|s| s == sample)?;
        Some(self.counts[[row, col]])
    }

    /// Inner-joins one more table onto the matrix.
    fn join(self, table: &CountTable) -> Result<Self, MergeError> {
        if self.samples.contains(&table.sample) {
            return Err(MergeError::DuplicateSample(table.sample.clone()));
        }
        let lookup: FxHashMap<&str, u64> = table.rows.iter().map(|(f, c)| (f.as_str(), *c)).collect();

        let mut keep = Vec::with_capacity(self.features.len());
        let mut column = Vec::with_capacity(self.features.len());
        for (i, feature) in self.features.iter().enumerate() {
            if let Some(count) = lookup.get(feature.as_str()) {
                keep.push(i);
                column.push(*count);
            }
        }

        // A non-empty matrix never narrows to nothing, whatever the new table holds
        if keep.is_empty() && !self.features.is_empty() {
            return Err(MergeError::DisjointKeys {
                sample: table.sample.clone(),
                previous: self.samples.join(", "),
            });
        }
        let dropped = self.features.len() - keep.len();
        if dropped > 0 {
            warn!("Joining {} dropped {} feature(s) not present in every sample", table.sample, dropped);
        }
        let extra = table.rows.len() - keep.len();
        if extra > 0 {
            debug!("{} has {} feature(s) absent from earlier samples", table.sample, extra);
        }

        let narrowed = self.counts.select(Axis(0), &keep);
        let column = Array2::from_shape_vec((column.len(), 1), column)
            .map_err(|e| MergeError::Shape(e.to_string()))?;
        let counts = concatenate(Axis(1), &[narrowed.view(), column.view()])
            .map_err(|e| MergeError::Shape(e.to_string()))?;

        let features = keep.iter().map(|&i| self.features[i].clone()).collect();
        let mut samples = self.samples;
        samples.push(table.sample.clone());
        Ok(CountMatrix { features, samples, counts })
    }

    /// Reorders (and subsets) columns to `order`.
    pub fn select_columns(&self, order: &[String]) -> Result<CountMatrix, MergeError> {
        let mut indices = Vec::with_capacity(order.len());
        for sample in order {
            let idx = self
                .samples
                .iter()
                .position(|s| s == sample)
                .ok_or_else(|| MergeError::UnknownSample(sample.clone()))?;
            indices.push(idx);
        }
        Ok(CountMatrix {
            features: self.features.clone(),
            samples: order.to_vec(),
            counts: self.counts.select(Axis(1), &indices),
        })
    }

    /// Writes CSV: `<key_column>,<sample..>` header, one row per feature.
    pub fn write_csv(&self, path: &Path, key_column: &str) -> Result<(), MergeError> {
        let io_err = |e: csv::Error| MergeError::Io { path: path.display().to_string(), reason: e.to_string() };
        let mut writer = csv::Writer::from_path(path).map_err(io_err)?;
        let mut header = vec![key_column.to_string()];
        header.extend(self.samples.iter().cloned());
        writer.write_record(&header).map_err(io_err)?;
        for (feature, row) in self.features.iter().zip(self.counts.rows()) {
            let mut record = vec![feature.clone()];
            record.extend(row.iter().map(|c| c.to_string()));
            writer.write_record(&record).map_err(io_err)?;
        }
        writer.flush().map_err(|e| MergeError::Io { path: path.display().to_string(), reason: e.to_string() })?;
        Ok(())
    }
}


/// Folds `tables` into one matrix by sequential pairwise inner join.
///
/// # Arguments
///
/// * `tables` - Per-sample count tables, in sample order.
/// * `key_column` - Label of the shared row key, used only for logging here.
///
/// # Returns
/// CountMatrix with one column per table, in input order.
pub fn merge(tables: &[CountTable], key_column: &str) -> Result<CountMatrix, MergeError> {
    let (first, rest) = tables.split_first().ok_or(MergeError::NoTables)?;
    if first.rows.is_empty() {
        return Err(MergeError::EmptyTable(first.sample.clone()));
    }
    let mut matrix = CountMatrix::from_table(first)?;
    for table in rest {
        matrix = matrix.join(table)?;
        debug!(
            "Merged {} on '{}': {} rows x {} samples",
            table.sample,
            key_column,
            matrix.nrows(),
            matrix.ncols()
        );
    }
    Ok(matrix)
}
