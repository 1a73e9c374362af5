//! Per-feature standardization against the batch + covariate design.
//!
//! Each eligible feature is fit by OLS on its restricted design. The
//! covariate location effects and the grand mean are removed and the
//! residual spread is scaled to unit pooled variance, leaving batch location
//! effects in place for the shrinkage stage to target.

use crate::correct::eligibility::{restrict, EligibilityIndex};
use crate::data::{BatchLabels, Design};
use crate::error::{AdjustError, Result};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// Variances below this are treated as numerically zero.
const VAR_EPS: f64 = 1e-12;

/// Standardization state for one eligible feature, consumed later when
/// covariate effects are added back.
#[derive(Debug, Clone)]
pub struct StandardizationFit {
    /// Pooled residual variance (1.0 substituted when numerically zero).
    pub pooled_var: f64,
    /// Per-sample fitted mean: grand mean plus covariate contribution.
    pub stand_mean: DVector<f64>,
}

/// Standardized values plus the per-feature fits.
#[derive(Debug, Clone)]
pub struct Standardized {
    /// Standardized residuals (features × samples). Only cells that are
    /// usable for an eligible feature are meaningful.
    pub z: DMatrix<f64>,
    /// One fit per feature; `None` for ineligible features, which pass
    /// through the pipeline unmodified.
    pub fits: Vec<Option<StandardizationFit>>,
}

/// Standardize all eligible features in parallel.
pub fn standardize(
    log_abd: &DMatrix<f64>,
    labels: &BatchLabels,
    design: &Design,
    index: &EligibilityIndex,
) -> Result<Standardized> {
    let n_features = log_abd.nrows();
    let n_samples = log_abd.ncols();

    let per_feature: Vec<Option<(StandardizationFit, Vec<(usize, f64)>)>> = (0..n_features)
        .into_par_iter()
        .map(|f| {
            if !index.is_feature_eligible(f) {
                return Ok(None);
            }
            standardize_feature(f, log_abd, labels, design, index).map(Some)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut z = DMatrix::zeros(n_features, n_samples);
    let mut fits = Vec::with_capacity(n_features);
    for (f, entry) in per_feature.into_iter().enumerate() {
        match entry {
            Some((fit, values)) => {
                for (j, v) in values {
                    z[(f, j)] = v;
                }
                fits.push(Some(fit));
            }
            None => fits.push(None),
        }
    }

    Ok(Standardized { z, fits })
}

/// OLS fit and standardization for a single eligible feature.
fn standardize_feature(
    feature: usize,
    log_abd: &DMatrix<f64>,
    labels: &BatchLabels,
    design: &Design,
    index: &EligibilityIndex,
) -> Result<(StandardizationFit, Vec<(usize, f64)>)> {
    let batch_cols = index.estimable_batches(feature);
    let mut in_fit = vec![false; labels.n_batches()];
    for &b in &batch_cols {
        in_fit[b] = true;
    }
    // Samples of dropped or non-estimable batches pass through untouched
    // and must not enter the fit.
    let usable_rows: Vec<usize> = index
        .usable_samples(feature)
        .into_iter()
        .filter(|&j| in_fit[labels.assignment()[j]])
        .collect();
    let n_usable = usable_rows.len();
    let n_batch = batch_cols.len();

    let mut cols: Vec<usize> = batch_cols.clone();
    cols.extend(design.n_batch_cols()..design.n_columns());

    if n_usable <= cols.len() || n_batch < 2 {
        return Err(AdjustError::InternalConsistency(format!(
            "Feature {} reached standardization with {} usable samples and {} design columns",
            feature,
            n_usable,
            cols.len()
        )));
    }

    let x = restrict(design.matrix(), &usable_rows, &cols);
    let y = DVector::from_iterator(
        n_usable,
        usable_rows.iter().map(|&j| log_abd[(feature, j)]),
    );

    // beta = (X'X)^-1 X'y; the restricted design was rank-checked when the
    // eligibility index was built.
    let xtx = x.transpose() * &x;
    let xtx_inv = xtx.try_inverse().ok_or_else(|| {
        AdjustError::InternalConsistency(format!(
            "Restricted design for feature {} is singular despite passing the rank check",
            feature
        ))
    })?;
    let beta = &xtx_inv * (x.transpose() * &y);

    // Grand mean: batch-column contribution weighted by usable batch sizes.
    let mut grand_mean = 0.0;
    for (bi, &b) in batch_cols.iter().enumerate() {
        let n_b = usable_rows
            .iter()
            .filter(|&&j| labels.assignment()[j] == b)
            .count();
        grand_mean += (n_b as f64 / n_usable as f64) * beta[bi];
    }

    // Covariate contribution over all samples, so the fitted mean is defined
    // even at masked positions.
    let n_samples = log_abd.ncols();
    let mut stand_mean = DVector::from_element(n_samples, grand_mean);
    for (ci, c) in (design.n_batch_cols()..design.n_columns()).enumerate() {
        let coef = beta[n_batch + ci];
        for j in 0..n_samples {
            stand_mean[j] += design.matrix()[(j, c)] * coef;
        }
    }

    // Pooled residual variance from the full fit.
    let fitted = &x * &beta;
    let rss: f64 = (&y - &fitted).iter().map(|e| e * e).sum();
    let mut pooled_var = rss / n_usable as f64;
    if pooled_var < VAR_EPS {
        pooled_var = 1.0;
    }

    let sd = pooled_var.sqrt();
    let values: Vec<(usize, f64)> = usable_rows
        .iter()
        .map(|&j| (j, (log_abd[(feature, j)] - stand_mean[j]) / sd))
        .collect();

    Ok((
        StandardizationFit {
            pooled_var,
            stand_mean,
        },
        values,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correct::eligibility::build_index;
    use crate::data::Metadata;
    use approx::assert_relative_eq;

    fn setup(
        log_rows: &[f64],
        n_features: usize,
        covariates: &[(&str, Vec<&str>)],
    ) -> (DMatrix<f64>, BatchLabels, Design) {
        let n_samples = log_rows.len() / n_features;
        let sample_ids: Vec<String> = (0..n_samples).map(|i| format!("S{}", i)).collect();
        let half = n_samples / 2;
        let batches: Vec<String> = (0..n_samples)
            .map(|i| if i < half { "a".into() } else { "b".into() })
            .collect();
        let mut columns = vec![("study".to_string(), batches)];
        for (name, vals) in covariates {
            columns.push((
                name.to_string(),
                vals.iter().map(|v| v.to_string()).collect(),
            ));
        }
        let meta = Metadata::from_columns(sample_ids, columns).unwrap();
        let labels = BatchLabels::from_metadata(&meta, "study").unwrap();
        let cov_names: Vec<String> = covariates.iter().map(|(n, _)| n.to_string()).collect();
        let design = Design::build(&labels, &meta, &cov_names).unwrap();
        let log = DMatrix::from_row_slice(n_features, n_samples, log_rows);
        (log, labels, design)
    }

    #[test]
    fn test_batch_effect_left_in_place() {
        // Two batches with clearly separated means and no covariates. After
        // standardization the batch means must still differ.
        let (log, labels, design) = setup(
            &[
                1.0, 1.2, 0.8, 1.1, 3.0, 3.2, 2.8, 3.1, //
                0.5, 0.6, 0.4, 0.5, 0.5, 0.6, 0.4, 0.5,
            ],
            2,
            &[],
        );
        let index = build_index(&log, &labels, &design, false).unwrap();
        let std = standardize(&log, &labels, &design, &index).unwrap();

        let mean_a: f64 = (0..4).map(|j| std.z[(0, j)]).sum::<f64>() / 4.0;
        let mean_b: f64 = (4..8).map(|j| std.z[(0, j)]).sum::<f64>() / 4.0;
        assert!((mean_b - mean_a).abs() > 1.0);
    }

    #[test]
    fn test_grand_mean_weighted_by_batch_size() {
        let (log, labels, design) = setup(
            &[1.0, 1.0, 1.0, 1.0, 3.0, 3.0, 3.0, 3.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0],
            2,
            &[],
        );
        let index = build_index(&log, &labels, &design, false).unwrap();
        let std = standardize(&log, &labels, &design, &index).unwrap();

        // Feature 0: batch means 1 and 3, equal sizes, grand mean 2.
        let fit = std.fits[0].as_ref().unwrap();
        assert_relative_eq!(fit.stand_mean[0], 2.0, epsilon = 1e-10);
    }

    #[test]
    fn test_zero_variance_substitution() {
        // Feature 1 is constant within each batch: residual variance is
        // exactly zero and the pooled variance must fall back to 1.0.
        let (log, labels, design) = setup(
            &[
                1.0, 1.2, 0.8, 1.1, 3.0, 3.2, 2.8, 3.1, //
                1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0,
            ],
            2,
            &[],
        );
        let index = build_index(&log, &labels, &design, false).unwrap();
        let std = standardize(&log, &labels, &design, &index).unwrap();

        let fit = std.fits[1].as_ref().unwrap();
        assert_relative_eq!(fit.pooled_var, 1.0);
    }

    #[test]
    fn test_covariate_effect_removed() {
        // Covariate "group" adds +2 to the second half of each batch.
        // Standardized values must no longer separate by group.
        let (log, labels, design) = setup(
            &[
                1.0, 1.0, 3.0, 3.0, 1.5, 1.5, 3.5, 3.5, //
                1.0, 1.1, 0.9, 1.0, 1.0, 1.1, 0.9, 1.0,
            ],
            2,
            &[("group", vec!["x", "x", "y", "y", "x", "x", "y", "y"])],
        );
        let index = build_index(&log, &labels, &design, false).unwrap();
        let std = standardize(&log, &labels, &design, &index).unwrap();

        // Group means of standardized feature 0 within batch "a".
        let mean_x = (std.z[(0, 0)] + std.z[(0, 1)]) / 2.0;
        let mean_y = (std.z[(0, 2)] + std.z[(0, 3)]) / 2.0;
        assert_relative_eq!(mean_x, mean_y, epsilon = 1e-8);
    }

    #[test]
    fn test_ineligible_feature_has_no_fit() {
        let nan = f64::NAN;
        let (log, labels, design) = setup(
            &[
                1.0, 1.2, 0.8, 1.1, nan, nan, nan, nan, //
                1.0, 1.1, 0.9, 1.2, 2.0, 2.1, 1.9, 2.2, //
                0.5, 0.6, 0.4, 0.5, 1.5, 1.6, 1.4, 1.5,
            ],
            3,
            &[],
        );
        let index = build_index(&log, &labels, &design, true).unwrap();
        let std = standardize(&log, &labels, &design, &index).unwrap();

        assert!(std.fits[0].is_none());
        assert!(std.fits[1].is_some());
    }
}
