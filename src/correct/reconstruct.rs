//! Reconstruction of the adjusted abundance matrix.
//!
//! Three steps: remove the shrunk batch location/scale from the
//! standardized values, restore covariate effects and the original spread,
//! then leave the log scale and re-impose the input's compositional and
//! count semantics.

use crate::correct::eligibility::EligibilityIndex;
use crate::correct::shrink::ShrunkParameters;
use crate::correct::standardize::Standardized;
use crate::data::{AbundanceMatrix, BatchLabels};
use crate::error::{AdjustError, Result};
use nalgebra::DMatrix;

/// Remove shrunk batch effects from the standardized values.
///
/// Verifies first that the shrunk-parameter sparsity pattern matches the
/// eligibility index exactly; a mismatch means the upstream bookkeeping is
/// broken and the run aborts.
pub fn relocate_scale(
    std: &Standardized,
    shrunk: &ShrunkParameters,
    labels: &BatchLabels,
    index: &EligibilityIndex,
) -> Result<DMatrix<f64>> {
    for f in 0..index.n_features() {
        for b in 0..index.n_batches() {
            let defined =
                !shrunk.gamma_star[(f, b)].is_nan() && !shrunk.delta_star[(f, b)].is_nan();
            if defined != index.is_estimable(f, b) {
                return Err(AdjustError::InternalConsistency(format!(
                    "Shrunk parameter presence disagrees with eligibility at feature {}, batch '{}'",
                    f,
                    labels.levels()[b]
                )));
            }
        }
    }

    let mut adjusted = std.z.clone();
    for b in 0..index.n_batches() {
        for f in index.eligible_features(b) {
            let gamma = shrunk.gamma_star[(f, b)];
            let scale = shrunk.delta_star[(f, b)].sqrt();
            for j in index.usable_in_batch(f, b, labels) {
                adjusted[(f, j)] = (std.z[(f, j)] - gamma) / scale;
            }
        }
    }
    Ok(adjusted)
}

/// Restore covariate effects and the original pooled spread.
///
/// Starts from the log-scale input so ineligible features and masked
/// entries pass through byte-identical; eligible cells in estimable batches
/// are rebuilt from the adjusted standardized values.
pub fn add_back_covariates(
    adjusted_z: &DMatrix<f64>,
    std: &Standardized,
    log_abd: &DMatrix<f64>,
    labels: &BatchLabels,
    index: &EligibilityIndex,
) -> DMatrix<f64> {
    let mut out = log_abd.clone();
    for (f, fit) in std.fits.iter().enumerate() {
        let fit = match fit {
            Some(fit) => fit,
            None => continue,
        };
        let sd = fit.pooled_var.sqrt();
        for b in index.estimable_batches(f) {
            for j in index.usable_in_batch(f, b, labels) {
                out[(f, j)] = adjusted_z[(f, j)] * sd + fit.stand_mean[j];
            }
        }
    }
    out
}

/// Leave the log2 analysis scale and restore the input's semantics.
///
/// Exponentiates, forces original zeros back to exactly zero, renormalizes
/// each sample to proportions, rescales by the original per-sample total,
/// and rounds when the input was a count table.
pub fn back_transform_abd(
    log_adj: &DMatrix<f64>,
    original: &AbundanceMatrix,
    totals: &[f64],
    counts: bool,
) -> Result<AbundanceMatrix> {
    let n_features = original.n_features();
    let n_samples = original.n_samples();

    let mut out = DMatrix::zeros(n_features, n_samples);
    for j in 0..n_samples {
        let mut col_sum = 0.0;
        for i in 0..n_features {
            // Zeros are forced back before the column sum so NaN markers
            // from masked entries never poison the renormalization.
            let v = if original.get(i, j) == 0.0 {
                0.0
            } else {
                log_adj[(i, j)].exp2()
            };
            out[(i, j)] = v;
            col_sum += v;
        }
        if col_sum > 0.0 {
            let scale = totals[j] / col_sum;
            for i in 0..n_features {
                out[(i, j)] *= scale;
            }
        }
        if counts {
            for i in 0..n_features {
                out[(i, j)] = out[(i, j)].round();
            }
        }
    }

    AbundanceMatrix::new(
        out,
        original.feature_ids().to_vec(),
        original.sample_ids().to_vec(),
    )
}
