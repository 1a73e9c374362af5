//! Method-of-moments estimation of the empirical-Bayes hyper-priors.
//!
//! Per eligible feature × batch cell, the frequentist location estimate is
//! the mean of the standardized values in that batch and the scale estimate
//! their sample variance. Pooling across eligible features per batch yields
//! a Normal prior on location (hyper-mean, hyper-variance) and an
//! Inverse-Gamma prior on scale (shape, scale by moment matching).

use crate::correct::eligibility::EligibilityIndex;
use crate::correct::standardize::Standardized;
use crate::data::BatchLabels;
use crate::error::{AdjustError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Hyper-parameters pooled over eligible features for one batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchHyper {
    /// Mean of location estimates across features.
    pub gamma_bar: f64,
    /// Variance of location estimates across features.
    pub t2: f64,
    /// Inverse-gamma prior shape on the scale parameter.
    pub a_prior: f64,
    /// Inverse-gamma prior scale on the scale parameter.
    pub b_prior: f64,
}

/// Frequentist per-cell estimates plus per-batch hyper-parameters.
#[derive(Debug, Clone)]
pub struct EbParameters {
    /// Location estimates (features × batches), NaN where ineligible.
    pub gamma_hat: DMatrix<f64>,
    /// Scale estimates (features × batches), NaN where ineligible.
    pub delta_hat: DMatrix<f64>,
    /// Hyper-parameters per batch; `None` for batches dropped by the
    /// eligibility index.
    pub hyper: Vec<Option<BatchHyper>>,
}

/// Estimate frequentist parameters and hyper-priors.
pub fn estimate_priors(
    std: &Standardized,
    labels: &BatchLabels,
    index: &EligibilityIndex,
) -> Result<EbParameters> {
    let n_features = index.n_features();
    let n_batches = index.n_batches();

    // Per-feature frequentist estimates, parallel across features.
    let rows: Vec<Vec<(f64, f64)>> = (0..n_features)
        .into_par_iter()
        .map(|f| {
            (0..n_batches)
                .map(|b| {
                    if !index.is_estimable(f, b) {
                        return (f64::NAN, f64::NAN);
                    }
                    let samples = index.usable_in_batch(f, b, labels);
                    cell_estimates(&std.z, f, &samples)
                })
                .collect()
        })
        .collect();

    let mut gamma_hat = DMatrix::from_element(n_features, n_batches, f64::NAN);
    let mut delta_hat = DMatrix::from_element(n_features, n_batches, f64::NAN);
    for (f, row) in rows.iter().enumerate() {
        for (b, &(g, d)) in row.iter().enumerate() {
            gamma_hat[(f, b)] = g;
            delta_hat[(f, b)] = d;
        }
    }

    // Pool per batch over eligible features.
    let mut hyper = Vec::with_capacity(n_batches);
    for b in 0..n_batches {
        let features = index.eligible_features(b);
        if features.is_empty() {
            hyper.push(None);
            continue;
        }
        if features.len() < 2 {
            // Upstream indexing guarantees at least two features per kept
            // batch; reaching here means the bookkeeping is broken.
            return Err(AdjustError::InternalConsistency(format!(
                "Batch '{}' reached prior estimation with {} eligible feature(s)",
                labels.levels()[b],
                features.len()
            )));
        }

        let gammas: Vec<f64> = features.iter().map(|&f| gamma_hat[(f, b)]).collect();
        let deltas: Vec<f64> = features.iter().map(|&f| delta_hat[(f, b)]).collect();

        let gamma_bar = mean(&gammas);
        let t2 = sample_var(&gammas, gamma_bar);

        let m = mean(&deltas);
        let mut s2 = sample_var(&deltas, m);
        if s2 == 0.0 {
            // A point-mass prior on scale is degenerate; widen it.
            s2 = 1.0;
        }
        let a_prior = (2.0 * s2 + m * m) / s2;
        let b_prior = (m * s2 + m * m * m) / s2;

        hyper.push(Some(BatchHyper {
            gamma_bar,
            t2,
            a_prior,
            b_prior,
        }));
    }

    Ok(EbParameters {
        gamma_hat,
        delta_hat,
        hyper,
    })
}

/// Location and scale estimates for one eligible cell.
fn cell_estimates(z: &DMatrix<f64>, feature: usize, samples: &[usize]) -> (f64, f64) {
    let n = samples.len();
    let values: Vec<f64> = samples.iter().map(|&j| z[(feature, j)]).collect();
    let g = mean(&values);
    // A single observation has no spread, and an exactly-zero spread breaks
    // the fixed point; both fall back to 1.0.
    let d = if n < 2 {
        1.0
    } else {
        let v = sample_var(&values, g);
        if v == 0.0 {
            1.0
        } else {
            v
        }
    };
    (g, d)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_var(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}
