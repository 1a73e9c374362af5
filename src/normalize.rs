//! Total-sum scaling and log transform for the correction model.
//!
//! The location-and-scale model operates on log2 relative abundances.
//! Zeros are either masked out (zero-inflated regime, the default) or
//! lifted with a small pseudo-count before taking logs.

use crate::data::AbundanceMatrix;
use crate::error::{AdjustError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;

/// Relative abundances obtained by total-sum scaling.
#[derive(Debug, Clone)]
pub struct RelativeAbundance {
    /// Proportions (features × samples); each column sums to 1.
    pub data: DMatrix<f64>,
    /// Original per-sample totals, kept for reconstruction.
    pub totals: Vec<f64>,
}

/// Scale each sample to proportions summing to 1.
///
/// A sample with zero total cannot be scaled and fails configuration
/// validation before any numeric work.
pub fn norm_tss(abd: &AbundanceMatrix) -> Result<RelativeAbundance> {
    let n_features = abd.n_features();
    let n_samples = abd.n_samples();

    if n_features == 0 || n_samples == 0 {
        return Err(AdjustError::EmptyData(
            "Cannot normalize an empty matrix".to_string(),
        ));
    }

    let totals = abd.sample_totals();
    for (j, &total) in totals.iter().enumerate() {
        if total <= 0.0 {
            return Err(AdjustError::Configuration(format!(
                "Sample '{}' has zero total abundance, cannot normalize",
                abd.sample_ids()[j]
            )));
        }
    }

    let normalized_cols: Vec<Vec<f64>> = (0..n_samples)
        .into_par_iter()
        .map(|j| {
            let total = totals[j];
            (0..n_features).map(|i| abd.get(i, j) / total).collect()
        })
        .collect();

    let mut data = DMatrix::zeros(n_features, n_samples);
    for (j, col) in normalized_cols.iter().enumerate() {
        for (i, &val) in col.iter().enumerate() {
            data[(i, j)] = val;
        }
    }

    Ok(RelativeAbundance { data, totals })
}

/// Half the smallest non-zero proportion, the default pseudo-count when
/// zeros are not treated as missing.
pub fn half_min_pseudocount(rel: &DMatrix<f64>) -> f64 {
    let min_nonzero = rel
        .iter()
        .filter(|&&v| v > 0.0)
        .fold(f64::INFINITY, |acc, &v| acc.min(v));
    if min_nonzero.is_finite() {
        min_nonzero / 2.0
    } else {
        // All-zero matrix; degenerate but keep the transform defined.
        0.5
    }
}

/// Log2-transform relative abundances.
///
/// With `zero_inflation`, zero entries become NaN markers and are excluded
/// from all downstream fitting. Otherwise `pseudo_count` (or the
/// half-minimum default) is added to every entry before the log.
pub fn log_transform(
    rel: &RelativeAbundance,
    zero_inflation: bool,
    pseudo_count: Option<f64>,
) -> DMatrix<f64> {
    if zero_inflation {
        rel.data
            .map(|v| if v > 0.0 { v.log2() } else { f64::NAN })
    } else {
        let pc = pseudo_count.unwrap_or_else(|| half_min_pseudocount(&rel.data));
        rel.data.map(|v| (v + pc).log2())
    }
}
