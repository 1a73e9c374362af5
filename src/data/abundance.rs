//! Abundance matrix for feature-by-sample data.

use crate::error::{AdjustError, Result};
use nalgebra::DMatrix;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// A dense abundance matrix storing feature measurements across samples.
///
/// Rows represent features (taxa/genes), columns represent samples. Values
/// are non-negative and may be counts or proportions; zero-inflated inputs
/// are expected and exact zeros are preserved by the correction pipeline.
#[derive(Debug, Clone)]
pub struct AbundanceMatrix {
    /// Dense matrix (features × samples).
    data: DMatrix<f64>,
    /// Feature identifiers (row names).
    feature_ids: Vec<String>,
    /// Sample identifiers (column names).
    sample_ids: Vec<String>,
}

impl AbundanceMatrix {
    /// Create a new AbundanceMatrix from a dense matrix and identifiers.
    ///
    /// Fails if the identifier lengths do not match the matrix shape or if
    /// any entry is negative or non-finite.
    pub fn new(
        data: DMatrix<f64>,
        feature_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        let (nrows, ncols) = data.shape();
        if nrows != feature_ids.len() {
            return Err(AdjustError::DimensionMismatch {
                expected: nrows,
                actual: feature_ids.len(),
            });
        }
        if ncols != sample_ids.len() {
            return Err(AdjustError::DimensionMismatch {
                expected: ncols,
                actual: sample_ids.len(),
            });
        }
        if data.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(AdjustError::Configuration(
                "Abundance matrix must contain only finite non-negative values".to_string(),
            ));
        }
        Ok(Self {
            data,
            feature_ids,
            sample_ids,
        })
    }

    /// Load an abundance matrix from a TSV file.
    ///
    /// Expected format:
    /// - First row: header with sample IDs (first column is feature ID header)
    /// - Subsequent rows: feature ID followed by abundance values
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| AdjustError::EmptyData("Empty TSV file".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        if header.len() < 2 {
            return Err(AdjustError::EmptyData(
                "TSV must have at least one sample".to_string(),
            ));
        }
        let sample_ids: Vec<String> = header[1..].iter().map(|s| s.to_string()).collect();
        let n_samples = sample_ids.len();

        let mut feature_ids: Vec<String> = Vec::new();
        let mut values: Vec<f64> = Vec::new();

        for (row_idx, line_result) in lines.enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            feature_ids.push(fields[0].to_string());

            for col_idx in 0..n_samples {
                let raw = fields.get(col_idx + 1).map(|s| s.trim()).unwrap_or("");
                let value: f64 = raw.parse().map_err(|_| AdjustError::InvalidValue {
                    value: raw.to_string(),
                    row: row_idx,
                    col: col_idx,
                })?;
                values.push(value);
            }
        }

        let n_features = feature_ids.len();
        if n_features == 0 {
            return Err(AdjustError::EmptyData("No features in TSV".to_string()));
        }

        let data = DMatrix::from_row_slice(n_features, n_samples, &values);
        Self::new(data, feature_ids, sample_ids)
    }

    /// Write the abundance matrix to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        write!(writer, "feature_id")?;
        for sample_id in &self.sample_ids {
            write!(writer, "\t{}", sample_id)?;
        }
        writeln!(writer)?;

        for (row_idx, feature_id) in self.feature_ids.iter().enumerate() {
            write!(writer, "{}", feature_id)?;
            for col_idx in 0..self.n_samples() {
                write!(writer, "\t{}", self.data[(row_idx, col_idx)])?;
            }
            writeln!(writer)?;
        }

        Ok(())
    }

    /// Get the value at (row, col).
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[(row, col)]
    }

    /// Number of features (rows).
    #[inline]
    pub fn n_features(&self) -> usize {
        self.data.nrows()
    }

    /// Number of samples (columns).
    #[inline]
    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    /// Feature identifiers.
    #[inline]
    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    /// Sample identifiers.
    #[inline]
    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Get the underlying dense matrix.
    #[inline]
    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    /// Per-sample totals (column sums).
    pub fn sample_totals(&self) -> Vec<f64> {
        (0..self.n_samples())
            .map(|j| self.data.column(j).sum())
            .collect()
    }

    /// Whether every entry is integral, i.e. the matrix looks like a count
    /// table rather than proportions. Drives output rounding semantics.
    pub fn is_count_table(&self) -> bool {
        self.data.iter().all(|v| (v - v.round()).abs() < 1e-8)
    }
}
