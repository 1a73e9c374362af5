//! Per-feature, per-batch eligibility bookkeeping under zero-inflation.
//!
//! Batch parameters can only be estimated for a feature where enough
//! non-missing data remains after masking zeros: at least two batches with a
//! usable observation, a full-rank restricted design, and strictly positive
//! residual degrees of freedom. Everything downstream trusts this index and
//! touches only the cells flagged here.

use crate::data::{matrix_rank, BatchLabels, Design};
use crate::error::{AdjustError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;

/// Co-indexed eligibility masks for one correction run.
#[derive(Debug, Clone)]
pub struct EligibilityIndex {
    /// Usable observations (features × samples). All true unless
    /// zero-inflation masked out zero entries.
    usable: DMatrix<bool>,
    /// Whether a batch is estimable for a feature (features × batches).
    estimable: DMatrix<bool>,
    /// Covariate columns retained in restricted fits. Covariates are never
    /// dropped, so this is always all-true; kept for shape symmetry with the
    /// batch mask.
    covariate_retained: Vec<bool>,
    /// Whether any batch is estimable for a feature.
    feature_eligible: Vec<bool>,
}

impl EligibilityIndex {
    /// Whether observation (feature, sample) enters any fit.
    #[inline]
    pub fn is_usable(&self, feature: usize, sample: usize) -> bool {
        self.usable[(feature, sample)]
    }

    /// Whether the (feature, batch) cell supports parameter estimation.
    #[inline]
    pub fn is_estimable(&self, feature: usize, batch: usize) -> bool {
        self.estimable[(feature, batch)]
    }

    /// Whether the feature participates in correction at all.
    #[inline]
    pub fn is_feature_eligible(&self, feature: usize) -> bool {
        self.feature_eligible[feature]
    }

    /// Covariate retention mask (always all-true).
    pub fn covariate_retained(&self) -> &[bool] {
        &self.covariate_retained
    }

    /// Number of features.
    pub fn n_features(&self) -> usize {
        self.usable.nrows()
    }

    /// Number of batches.
    pub fn n_batches(&self) -> usize {
        self.estimable.ncols()
    }

    /// Indices of features estimable in a batch.
    pub fn eligible_features(&self, batch: usize) -> Vec<usize> {
        (0..self.n_features())
            .filter(|&f| self.estimable[(f, batch)])
            .collect()
    }

    /// Usable sample indices for a feature, restricted to one batch.
    pub fn usable_in_batch(
        &self,
        feature: usize,
        batch: usize,
        labels: &BatchLabels,
    ) -> Vec<usize> {
        labels
            .assignment()
            .iter()
            .enumerate()
            .filter(|(j, &b)| b == batch && self.usable[(feature, *j)])
            .map(|(j, _)| j)
            .collect()
    }

    /// Usable sample indices for a feature across all batches.
    pub fn usable_samples(&self, feature: usize) -> Vec<usize> {
        (0..self.usable.ncols())
            .filter(|&j| self.usable[(feature, j)])
            .collect()
    }

    /// Estimable batch indices for a feature.
    pub fn estimable_batches(&self, feature: usize) -> Vec<usize> {
        (0..self.n_batches())
            .filter(|&b| self.estimable[(feature, b)])
            .collect()
    }
}

/// Build the eligibility index for a log-transformed matrix.
///
/// Under zero-inflation, masked entries are the NaN markers produced by the
/// log transform. A prior cannot be pooled from a single feature, so a
/// batch that ends with fewer than two eligible features is dropped; since
/// dropping a batch removes its samples from every remaining fit, feature
/// candidacy is re-validated until the drop cascade settles. Fails with a
/// configuration error when no feature is ever eligible, since correction
/// is then information-theoretically impossible.
pub fn build_index(
    log_abd: &DMatrix<f64>,
    labels: &BatchLabels,
    design: &Design,
    zero_inflation: bool,
) -> Result<EligibilityIndex> {
    let n_features = log_abd.nrows();
    let n_samples = log_abd.ncols();
    let n_batches = labels.n_batches();

    let usable_rows: Vec<Vec<bool>> = (0..n_features)
        .into_par_iter()
        .map(|f| {
            if zero_inflation {
                (0..n_samples).map(|j| !log_abd[(f, j)].is_nan()).collect()
            } else {
                vec![true; n_samples]
            }
        })
        .collect();
    let fully_usable: Vec<bool> = usable_rows
        .iter()
        .map(|row| row.iter().all(|&u| u))
        .collect();

    // With every sample usable the check reduces to the degrees-of-freedom
    // requirement; the full design is already rank-checked at construction.
    let full_ok = n_batches >= 2 && n_samples > design.n_columns();

    let mut allowed = vec![true; n_batches];
    let mut estimable_rows: Vec<Vec<bool>>;
    loop {
        let all_allowed = allowed.iter().all(|&a| a);
        estimable_rows = usable_rows
            .par_iter()
            .enumerate()
            .map(|(f, usable)| {
                if fully_usable[f] && all_allowed {
                    if full_ok {
                        allowed.clone()
                    } else {
                        vec![false; n_batches]
                    }
                } else {
                    check_feature(usable, &allowed, labels, design)
                }
            })
            .collect();

        let mut changed = false;
        for b in 0..n_batches {
            if !allowed[b] {
                continue;
            }
            let count = estimable_rows.iter().filter(|row| row[b]).count();
            if count < 2 {
                allowed[b] = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut usable = DMatrix::from_element(n_features, n_samples, false);
    let mut estimable = DMatrix::from_element(n_features, n_batches, false);
    for f in 0..n_features {
        for (j, &u) in usable_rows[f].iter().enumerate() {
            usable[(f, j)] = u;
        }
        for (b, &e) in estimable_rows[f].iter().enumerate() {
            estimable[(f, b)] = e;
        }
    }

    let feature_eligible: Vec<bool> = (0..n_features)
        .map(|f| (0..n_batches).any(|b| estimable[(f, b)]))
        .collect();

    if !feature_eligible.iter().any(|&e| e) {
        return Err(AdjustError::Configuration(
            "all features are single-batch-specific; batch effects cannot be estimated"
                .to_string(),
        ));
    }

    Ok(EligibilityIndex {
        usable,
        estimable,
        covariate_retained: vec![true; design.n_covariate_cols()],
        feature_eligible,
    })
}

/// Candidacy check for one feature against the batches still in play.
fn check_feature(
    usable: &[bool],
    allowed: &[bool],
    labels: &BatchLabels,
    design: &Design,
) -> Vec<bool> {
    let n_batches = labels.n_batches();
    let ineligible = vec![false; n_batches];

    // Kept batches that retain at least one usable sample can still
    // contribute a location/scale estimate.
    let mut has_usable = vec![false; n_batches];
    for (j, &b) in labels.assignment().iter().enumerate() {
        if usable[j] && allowed[b] {
            has_usable[b] = true;
        }
    }
    let candidates: Vec<usize> = (0..n_batches).filter(|&b| has_usable[b]).collect();
    if candidates.len() < 2 {
        return ineligible;
    }

    // Restrict the design to usable samples of candidate batches and to
    // (candidate batches ∪ covariates).
    let usable_rows: Vec<usize> = (0..usable.len())
        .filter(|&j| usable[j] && has_usable[labels.assignment()[j]])
        .collect();
    let mut cols: Vec<usize> = candidates.clone();
    cols.extend(design.n_batch_cols()..design.n_columns());

    if usable_rows.len() <= cols.len() {
        return ineligible;
    }

    let restricted = restrict(design.matrix(), &usable_rows, &cols);
    if matrix_rank(&restricted) != cols.len() {
        return ineligible;
    }

    let mut estimable = vec![false; n_batches];
    for &b in &candidates {
        estimable[b] = true;
    }
    estimable
}

/// Select a submatrix by row and column indices.
pub(crate) fn restrict(m: &DMatrix<f64>, rows: &[usize], cols: &[usize]) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(rows.len(), cols.len());
    for (ri, &r) in rows.iter().enumerate() {
        for (ci, &c) in cols.iter().enumerate() {
            out[(ri, ci)] = m[(r, c)];
        }
    }
    out
}
