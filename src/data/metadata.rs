//! Sample metadata handling and batch label extraction.

use crate::error::{AdjustError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A variable value that can be categorical or continuous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// Categorical variable with string levels.
    Categorical(String),
    /// Continuous numeric variable.
    Continuous(f64),
    /// Missing value.
    Missing,
}

impl Variable {
    /// Check if this is a missing value.
    pub fn is_missing(&self) -> bool {
        matches!(self, Variable::Missing)
    }

    /// Try to get as categorical string.
    pub fn as_categorical(&self) -> Option<&str> {
        match self {
            Variable::Categorical(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as continuous f64.
    pub fn as_continuous(&self) -> Option<f64> {
        match self {
            Variable::Continuous(v) => Some(*v),
            _ => None,
        }
    }

    /// Level label for grouping, regardless of the inferred type.
    /// Numeric-coded batch columns (e.g. "0"/"1") group by their literal
    /// representation.
    pub fn level_label(&self) -> Option<String> {
        match self {
            Variable::Categorical(s) => Some(s.clone()),
            Variable::Continuous(v) => Some(format!("{}", v)),
            Variable::Missing => None,
        }
    }
}

/// Type hint for columns when loading metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Categorical,
    Continuous,
}

/// Sample metadata containing variables for each sample.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Sample IDs in order.
    sample_ids: Vec<String>,
    /// Column names.
    column_names: Vec<String>,
    /// Data stored as sample_id -> column_name -> Variable.
    data: HashMap<String, HashMap<String, Variable>>,
    /// Type hints for each column.
    column_types: HashMap<String, VariableType>,
}

impl Metadata {
    /// Load metadata from a TSV file.
    ///
    /// Expected format:
    /// - First row: header with column names (first column is sample ID)
    /// - Subsequent rows: sample ID followed by variable values
    ///
    /// Columns are inferred as continuous if all values parse as numbers,
    /// otherwise categorical. Use [`Metadata::with_categorical`] to
    /// override.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| AdjustError::EmptyData("Empty metadata file".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        if header.len() < 2 {
            return Err(AdjustError::EmptyData(
                "Metadata must have at least one variable column".to_string(),
            ));
        }
        let column_names: Vec<String> = header[1..].iter().map(|s| s.to_string()).collect();

        let mut raw_data: Vec<(String, Vec<String>)> = Vec::new();
        for line_result in lines {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let sample_id = fields[0].to_string();
            let values: Vec<String> = fields[1..].iter().map(|s| s.to_string()).collect();
            raw_data.push((sample_id, values));
        }

        if raw_data.is_empty() {
            return Err(AdjustError::EmptyData("No samples in metadata".to_string()));
        }

        // Infer column types
        let mut column_types = HashMap::new();
        for (col_idx, col_name) in column_names.iter().enumerate() {
            let all_numeric = raw_data.iter().all(|(_, values)| {
                let v = match values.get(col_idx) {
                    Some(v) => v.trim(),
                    None => return true, // missing, skip
                };
                v.is_empty() || v == "NA" || v == "na" || v.parse::<f64>().is_ok()
            });
            let var_type = if all_numeric {
                VariableType::Continuous
            } else {
                VariableType::Categorical
            };
            column_types.insert(col_name.clone(), var_type);
        }

        let mut sample_ids = Vec::new();
        let mut data = HashMap::new();

        for (sample_id, values) in raw_data {
            sample_ids.push(sample_id.clone());
            let mut sample_data = HashMap::new();

            for (col_idx, col_name) in column_names.iter().enumerate() {
                let var = match values.get(col_idx).map(|v| v.trim()) {
                    None => Variable::Missing,
                    Some(raw) if raw.is_empty() || raw == "NA" || raw == "na" => Variable::Missing,
                    Some(raw) => match column_types.get(col_name) {
                        Some(VariableType::Continuous) => match raw.parse::<f64>() {
                            Ok(v) => Variable::Continuous(v),
                            Err(_) => Variable::Missing,
                        },
                        Some(VariableType::Categorical) | None => {
                            Variable::Categorical(raw.to_string())
                        }
                    },
                };
                sample_data.insert(col_name.clone(), var);
            }
            data.insert(sample_id, sample_data);
        }

        Ok(Self {
            sample_ids,
            column_names,
            data,
            column_types,
        })
    }

    /// Build metadata directly from columns of raw string values.
    /// Intended for tests and programmatic construction.
    pub fn from_columns(
        sample_ids: Vec<String>,
        columns: Vec<(String, Vec<String>)>,
    ) -> Result<Self> {
        let n = sample_ids.len();
        let mut column_names = Vec::new();
        let mut column_types = HashMap::new();
        let mut data: HashMap<String, HashMap<String, Variable>> = sample_ids
            .iter()
            .map(|sid| (sid.clone(), HashMap::new()))
            .collect();

        for (name, values) in columns {
            if values.len() != n {
                return Err(AdjustError::DimensionMismatch {
                    expected: n,
                    actual: values.len(),
                });
            }
            let all_numeric = values
                .iter()
                .all(|v| v.trim().is_empty() || v.trim().parse::<f64>().is_ok());
            let var_type = if all_numeric {
                VariableType::Continuous
            } else {
                VariableType::Categorical
            };
            for (sid, raw) in sample_ids.iter().zip(values.iter()) {
                let raw = raw.trim();
                let var = if raw.is_empty() || raw == "NA" {
                    Variable::Missing
                } else {
                    match var_type {
                        VariableType::Continuous => raw
                            .parse::<f64>()
                            .map(Variable::Continuous)
                            .unwrap_or(Variable::Missing),
                        VariableType::Categorical => Variable::Categorical(raw.to_string()),
                    }
                };
                data.get_mut(sid)
                    .expect("sample ids initialized above")
                    .insert(name.clone(), var);
            }
            column_types.insert(name.clone(), var_type);
            column_names.push(name);
        }

        Ok(Self {
            sample_ids,
            column_names,
            data,
            column_types,
        })
    }

    /// Force specific columns to be treated as categorical.
    pub fn with_categorical(mut self, columns: &[&str]) -> Self {
        for col_name in columns {
            self.column_types
                .insert(col_name.to_string(), VariableType::Categorical);
            for sample_data in self.data.values_mut() {
                if let Some(var) = sample_data.get_mut(*col_name) {
                    if let Variable::Continuous(v) = var {
                        *var = Variable::Categorical(format!("{}", v));
                    }
                }
            }
        }
        self
    }

    /// Sample IDs in order.
    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Column names.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Number of samples.
    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    /// Get a variable value for a specific sample and column.
    pub fn get(&self, sample_id: &str, column: &str) -> Option<&Variable> {
        self.data.get(sample_id).and_then(|m| m.get(column))
    }

    /// Get all values for a column, in sample order.
    pub fn column(&self, column: &str) -> Result<Vec<&Variable>> {
        if !self.has_column(column) {
            return Err(AdjustError::MissingColumn(column.to_string()));
        }
        Ok(self
            .sample_ids
            .iter()
            .map(|sid| {
                self.data
                    .get(sid)
                    .and_then(|m| m.get(column))
                    .unwrap_or(&Variable::Missing)
            })
            .collect())
    }

    /// Get the type of a column.
    pub fn column_type(&self, column: &str) -> Option<VariableType> {
        self.column_types.get(column).copied()
    }

    /// Get unique level labels for a column, sorted.
    pub fn levels(&self, column: &str) -> Result<Vec<String>> {
        let values = self.column(column)?;
        let mut levels: Vec<String> = values
            .iter()
            .filter_map(|v| v.level_label())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        levels.sort();
        Ok(levels)
    }

    /// Align metadata to the sample order of an abundance matrix.
    ///
    /// Matching is order-insensitive; the result preserves the order of
    /// `sample_ids`. Every requested sample must exist in the metadata and
    /// the metadata must not carry extra samples (1:1 alignment).
    pub fn align_to(&self, sample_ids: &[String]) -> Result<Self> {
        if self.sample_ids.len() != sample_ids.len() {
            return Err(AdjustError::SampleMismatch(format!(
                "Metadata has {} samples but matrix has {}",
                self.sample_ids.len(),
                sample_ids.len()
            )));
        }

        let mut new_data = HashMap::new();
        let mut new_sample_ids = Vec::new();

        for sid in sample_ids {
            match self.data.get(sid) {
                Some(sample_data) => {
                    new_data.insert(sid.clone(), sample_data.clone());
                    new_sample_ids.push(sid.clone());
                }
                None => {
                    return Err(AdjustError::SampleMismatch(format!(
                        "Sample '{}' not found in metadata",
                        sid
                    )));
                }
            }
        }

        Ok(Self {
            sample_ids: new_sample_ids,
            column_names: self.column_names.clone(),
            data: new_data,
            column_types: self.column_types.clone(),
        })
    }

    /// Check if a column exists.
    pub fn has_column(&self, column: &str) -> bool {
        self.column_names.iter().any(|c| c == column)
    }
}

/// Batch assignment derived from a designated metadata column.
///
/// Levels are sorted; each sample maps to a level index. Built once per
/// correction run, after metadata alignment.
#[derive(Debug, Clone)]
pub struct BatchLabels {
    /// Sorted batch level labels.
    levels: Vec<String>,
    /// Per-sample level index, in sample order.
    assignment: Vec<usize>,
}

impl BatchLabels {
    /// Extract batch labels from a metadata column.
    ///
    /// Fails with a configuration error if the column has fewer than two
    /// distinct levels or contains missing values.
    pub fn from_metadata(metadata: &Metadata, batch_column: &str) -> Result<Self> {
        let values = metadata.column(batch_column)?;
        let levels = metadata.levels(batch_column)?;

        if levels.len() < 2 {
            return Err(AdjustError::Configuration(format!(
                "Batch column '{}' must have at least two levels, found {}",
                batch_column,
                levels.len()
            )));
        }

        let mut assignment = Vec::with_capacity(values.len());
        for (i, v) in values.iter().enumerate() {
            let label = v.level_label().ok_or_else(|| {
                AdjustError::Configuration(format!(
                    "Batch column '{}' has a missing value for sample '{}'",
                    batch_column,
                    metadata.sample_ids()[i]
                ))
            })?;
            let idx = levels
                .iter()
                .position(|l| *l == label)
                .expect("label comes from levels()");
            assignment.push(idx);
        }

        Ok(Self { levels, assignment })
    }

    /// Sorted batch level labels.
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Number of batch levels.
    pub fn n_batches(&self) -> usize {
        self.levels.len()
    }

    /// Per-sample level index.
    pub fn assignment(&self) -> &[usize] {
        &self.assignment
    }

    /// Indices of samples belonging to a batch.
    pub fn samples_in(&self, batch: usize) -> Vec<usize> {
        self.assignment
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == batch)
            .map(|(j, _)| j)
            .collect()
    }
}
