//! Per-batch fixed-point iteration for the posterior location/scale
//! estimates.
//!
//! Batches are mutually independent: each iteration touches only that
//! batch's eligible features and its own scalar hyper-parameters, so the
//! solve parallelizes across batches with a plain scatter at the end.

use crate::correct::eligibility::EligibilityIndex;
use crate::correct::prior::{BatchHyper, EbParameters};
use crate::correct::standardize::Standardized;
use crate::data::BatchLabels;
use crate::error::{AdjustError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;

/// Sums of squares below this carry no signal and leave the scale estimate
/// untouched.
const SSQ_EPS: f64 = 1e-12;

/// Posterior (shrunk) parameters after fixed-point convergence.
#[derive(Debug, Clone)]
pub struct ShrunkParameters {
    /// Posterior locations (features × batches), NaN where ineligible.
    pub gamma_star: DMatrix<f64>,
    /// Posterior scales (features × batches), NaN where ineligible.
    pub delta_star: DMatrix<f64>,
    /// Iterations used per batch; `None` for dropped batches.
    pub iterations: Vec<Option<usize>>,
}

/// Run the shrinkage iteration for every kept batch in parallel.
pub fn solve(
    std: &Standardized,
    eb: &EbParameters,
    labels: &BatchLabels,
    index: &EligibilityIndex,
    conv: f64,
    maxit: usize,
) -> Result<ShrunkParameters> {
    let n_features = index.n_features();
    let n_batches = index.n_batches();

    let solved: Vec<Option<BatchSolution>> = (0..n_batches)
        .into_par_iter()
        .map(|b| match eb.hyper[b] {
            Some(hyper) => solve_batch(b, std, eb, &hyper, labels, index, conv, maxit).map(Some),
            None => Ok(None),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut gamma_star = DMatrix::from_element(n_features, n_batches, f64::NAN);
    let mut delta_star = DMatrix::from_element(n_features, n_batches, f64::NAN);
    let mut iterations = Vec::with_capacity(n_batches);
    for (b, solution) in solved.into_iter().enumerate() {
        match solution {
            Some(sol) => {
                for (i, &f) in sol.features.iter().enumerate() {
                    gamma_star[(f, b)] = sol.gamma[i];
                    delta_star[(f, b)] = sol.delta[i];
                }
                iterations.push(Some(sol.iterations));
            }
            None => iterations.push(None),
        }
    }

    Ok(ShrunkParameters {
        gamma_star,
        delta_star,
        iterations,
    })
}

struct BatchSolution {
    features: Vec<usize>,
    gamma: Vec<f64>,
    delta: Vec<f64>,
    iterations: usize,
}

/// EM-style fixed point for one batch.
#[allow(clippy::too_many_arguments)]
fn solve_batch(
    batch: usize,
    std: &Standardized,
    eb: &EbParameters,
    hyper: &BatchHyper,
    labels: &BatchLabels,
    index: &EligibilityIndex,
    conv: f64,
    maxit: usize,
) -> Result<BatchSolution> {
    let features = index.eligible_features(batch);
    let n_feat = features.len();

    let samples: Vec<Vec<usize>> = features
        .iter()
        .map(|&f| index.usable_in_batch(f, batch, labels))
        .collect();
    let counts: Vec<f64> = samples.iter().map(|s| s.len() as f64).collect();
    let gamma_hat: Vec<f64> = features.iter().map(|&f| eb.gamma_hat[(f, batch)]).collect();

    let mut gamma: Vec<f64> = gamma_hat.clone();
    let mut delta: Vec<f64> = features.iter().map(|&f| eb.delta_hat[(f, batch)]).collect();

    let mut iterations = 0;
    loop {
        iterations += 1;
        if iterations > maxit {
            return Err(AdjustError::Convergence {
                batch: labels.levels()[batch].clone(),
                maxit,
            });
        }

        let mut change: f64 = 0.0;
        for i in 0..n_feat {
            let n = counts[i];
            let g_new = (hyper.t2 * n * gamma_hat[i] + delta[i] * hyper.gamma_bar)
                / (hyper.t2 * n + delta[i]);

            let sum2: f64 = samples[i]
                .iter()
                .map(|&j| {
                    let r = std.z[(features[i], j)] - g_new;
                    r * r
                })
                .sum();
            let d_new = if sum2 < SSQ_EPS {
                // No signal; keep the current scale.
                delta[i]
            } else {
                (0.5 * sum2 + hyper.b_prior) / (n / 2.0 + hyper.a_prior - 1.0)
            };

            change = change
                .max(rel_change(g_new, gamma[i]))
                .max(rel_change(d_new, delta[i]));
            gamma[i] = g_new;
            delta[i] = d_new;
        }

        if change < conv {
            break;
        }
    }

    Ok(BatchSolution {
        features,
        gamma,
        delta,
        iterations,
    })
}

#[inline]
fn rel_change(new: f64, old: f64) -> f64 {
    (new - old).abs() / old.abs().max(f64::EPSILON)
}
