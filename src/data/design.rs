//! Design matrix construction for batch correction models.
//!
//! The correction model regresses each feature on a design of the form
//! `[batch one-hot | covariate columns]`: one indicator column per batch
//! level (no intercept, the indicators span it), followed by covariate
//! columns built from named metadata columns. Continuous covariates
//! contribute one column each; categorical covariates are dummy-coded with
//! the alphabetically first level as reference.

use crate::data::metadata::{BatchLabels, Metadata, Variable, VariableType};
use crate::error::{AdjustError, Result};
use nalgebra::DMatrix;

/// Numeric rank via SVD, tolerance scaled to the largest singular value.
pub(crate) fn matrix_rank(m: &DMatrix<f64>) -> usize {
    if m.ncols() == 0 || m.nrows() == 0 {
        return 0;
    }
    m.clone().svd(false, false).rank(1e-8)
}

/// A design matrix with batch indicator columns first, covariates after.
#[derive(Debug, Clone)]
pub struct Design {
    /// The design matrix (samples × columns).
    matrix: DMatrix<f64>,
    /// Names of the columns.
    column_names: Vec<String>,
    /// Number of leading batch indicator columns.
    n_batch_cols: usize,
}

impl Design {
    /// Build the full correction design from batch labels and covariates.
    ///
    /// Fails with a configuration error if the resulting matrix is not of
    /// full column rank (e.g. a covariate perfectly confounded with batch).
    pub fn build(
        batch: &BatchLabels,
        metadata: &Metadata,
        covariates: &[String],
    ) -> Result<Self> {
        let n_samples = batch.assignment().len();
        let n_batches = batch.n_batches();

        let mut column_names: Vec<String> = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        // One-hot batch indicators, one column per level.
        for (b, level) in batch.levels().iter().enumerate() {
            column_names.push(format!("batch{}", level));
            let col: Vec<f64> = batch
                .assignment()
                .iter()
                .map(|&a| if a == b { 1.0 } else { 0.0 })
                .collect();
            columns.push(col);
        }

        if let Some(cov) = covariate_columns(metadata, covariates)? {
            let (names, cols) = cov;
            column_names.extend(names);
            columns.extend(cols);
        }

        let n_cols = columns.len();
        let mut matrix = DMatrix::zeros(n_samples, n_cols);
        for (col_idx, col) in columns.iter().enumerate() {
            for (row_idx, &val) in col.iter().enumerate() {
                matrix[(row_idx, col_idx)] = val;
            }
        }

        let rank = matrix_rank(&matrix);
        if rank != n_cols {
            return Err(AdjustError::Configuration(format!(
                "Design matrix is not full rank (rank {} < {} columns); \
                 batch and covariates are confounded",
                rank, n_cols
            )));
        }

        Ok(Self {
            matrix,
            column_names,
            n_batch_cols: n_batches,
        })
    }

    /// Get the design matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Get column names.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Number of samples (rows).
    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    /// Total number of columns.
    pub fn n_columns(&self) -> usize {
        self.matrix.ncols()
    }

    /// Number of leading batch indicator columns.
    pub fn n_batch_cols(&self) -> usize {
        self.n_batch_cols
    }

    /// Number of trailing covariate columns.
    pub fn n_covariate_cols(&self) -> usize {
        self.matrix.ncols() - self.n_batch_cols
    }
}

/// Build covariate columns from named metadata columns.
///
/// Returns `None` for an empty covariate set, which is distinct from a
/// design whose columns carry no effect. Rank checking is left to the
/// caller since the covariate block is validated jointly with the batch
/// indicators.
pub fn covariate_columns(
    metadata: &Metadata,
    covariates: &[String],
) -> Result<Option<(Vec<String>, Vec<Vec<f64>>)>> {
    if covariates.is_empty() {
        return Ok(None);
    }

    let mut names = Vec::new();
    let mut columns = Vec::new();

    for cov in covariates {
        let values = metadata.column(cov)?;
        if let Some(idx) = values.iter().position(|v| v.is_missing()) {
            return Err(AdjustError::Configuration(format!(
                "Covariate '{}' has a missing value for sample '{}'",
                cov,
                metadata.sample_ids()[idx]
            )));
        }

        match metadata.column_type(cov) {
            Some(VariableType::Continuous) => {
                names.push(cov.clone());
                let col: Vec<f64> = values
                    .iter()
                    .map(|v| match v {
                        Variable::Continuous(x) => *x,
                        _ => 0.0,
                    })
                    .collect();
                columns.push(col);
            }
            Some(VariableType::Categorical) | None => {
                // Dummy coding, alphabetically first level as reference.
                let levels = metadata.levels(cov)?;
                for level in levels.iter().skip(1) {
                    names.push(format!("{}{}", cov, level));
                    let col: Vec<f64> = values
                        .iter()
                        .map(|v| {
                            if v.as_categorical() == Some(level.as_str()) {
                                1.0
                            } else {
                                0.0
                            }
                        })
                        .collect();
                    columns.push(col);
                }
            }
        }
    }

    Ok(Some((names, columns)))
}
