//! Batch-effect correction pipeline.
//!
//! The stages run in a fixed order: design construction, eligibility
//! indexing, per-feature standardization, hyper-prior estimation, per-batch
//! shrinkage, reconstruction. All intermediate state lives for one call to
//! [`adjust_batch`] and the returned diagnostics.

pub mod eligibility;
pub mod prior;
pub mod reconstruct;
pub mod shrink;
pub mod standardize;

pub use eligibility::{build_index, EligibilityIndex};
pub use prior::{estimate_priors, BatchHyper, EbParameters};
pub use reconstruct::{add_back_covariates, back_transform_abd, relocate_scale};
pub use shrink::{solve, ShrunkParameters};
pub use standardize::{standardize, StandardizationFit, Standardized};

use crate::data::{AbundanceMatrix, BatchLabels, Design, Metadata};
use crate::error::{AdjustError, Result};
use crate::normalize::{log_transform, norm_tss};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Control parameters for a correction run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustConfig {
    /// Treat exact zeros as structurally missing rather than measured
    /// small values.
    pub zero_inflation: bool,
    /// Pseudo-count added before the log when zero-inflation is off.
    /// Defaults to half the smallest non-zero proportion.
    pub pseudo_count: Option<f64>,
    /// Convergence tolerance for the shrinkage fixed point.
    pub conv: f64,
    /// Iteration cap for the shrinkage fixed point.
    pub maxit: usize,
    /// Whether the output follows count semantics (rounded). Defaults to
    /// inferring from the integrality of the input.
    pub counts: Option<bool>,
}

impl Default for AdjustConfig {
    fn default() -> Self {
        Self {
            zero_inflation: true,
            pseudo_count: None,
            conv: 1e-4,
            maxit: 1000,
            counts: None,
        }
    }
}

impl AdjustConfig {
    /// Load from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(AdjustError::from)
    }

    /// Save to a YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(AdjustError::from)
    }

    fn validate(&self) -> Result<()> {
        if !(self.conv > 0.0) {
            return Err(AdjustError::Configuration(
                "Convergence tolerance must be positive".to_string(),
            ));
        }
        if self.maxit == 0 {
            return Err(AdjustError::Configuration(
                "Maximum iteration count must be positive".to_string(),
            ));
        }
        if let Some(pc) = self.pseudo_count {
            if !(pc > 0.0) {
                return Err(AdjustError::Configuration(
                    "Pseudo-count must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Adjusted matrix plus the diagnostic artifacts of one correction run.
///
/// Parameter matrices are features × batches with NaN marking ineligible
/// cells; they are consumed by external diagnostic tooling.
#[derive(Debug, Clone)]
pub struct AdjustOutput {
    /// Adjusted abundances, same shape and labels as the input.
    pub adjusted: AbundanceMatrix,
    /// Sorted batch level labels, the column order of the parameter
    /// matrices.
    pub batch_levels: Vec<String>,
    /// Frequentist location estimates.
    pub gamma_hat: DMatrix<f64>,
    /// Frequentist scale estimates.
    pub delta_hat: DMatrix<f64>,
    /// Posterior (shrunk) location estimates.
    pub gamma_star: DMatrix<f64>,
    /// Posterior (shrunk) scale estimates.
    pub delta_star: DMatrix<f64>,
    /// Eligible feature count per batch.
    pub n_eligible: Vec<usize>,
    /// Shrinkage iterations per batch; `None` for dropped batches.
    pub iterations: Vec<Option<usize>>,
}

/// Remove batch effects from an abundance matrix while preserving covariate
/// effects.
///
/// `metadata` is matched to the matrix sample axis order-insensitively;
/// `batch_column` must carry at least two levels; `covariates` name further
/// metadata columns whose effects are preserved.
pub fn adjust_batch(
    abd: &AbundanceMatrix,
    metadata: &Metadata,
    batch_column: &str,
    covariates: &[String],
    config: &AdjustConfig,
) -> Result<AdjustOutput> {
    config.validate()?;

    let metadata = metadata.align_to(abd.sample_ids())?;
    let labels = BatchLabels::from_metadata(&metadata, batch_column)?;
    let design = Design::build(&labels, &metadata, covariates)?;

    let rel = norm_tss(abd)?;
    let log_abd = log_transform(&rel, config.zero_inflation, config.pseudo_count);

    let index = build_index(&log_abd, &labels, &design, config.zero_inflation)?;
    let std = standardize(&log_abd, &labels, &design, &index)?;
    let eb = estimate_priors(&std, &labels, &index)?;
    let shrunk = solve(&std, &eb, &labels, &index, config.conv, config.maxit)?;

    let adjusted_z = relocate_scale(&std, &shrunk, &labels, &index)?;
    let log_adj = add_back_covariates(&adjusted_z, &std, &log_abd, &labels, &index);

    let counts = config.counts.unwrap_or_else(|| abd.is_count_table());
    let adjusted = back_transform_abd(&log_adj, abd, &rel.totals, counts)?;

    let n_eligible = (0..labels.n_batches())
        .map(|b| index.eligible_features(b).len())
        .collect();

    Ok(AdjustOutput {
        adjusted,
        batch_levels: labels.levels().to_vec(),
        gamma_hat: eb.gamma_hat,
        delta_hat: eb.delta_hat,
        gamma_star: shrunk.gamma_star,
        delta_star: shrunk.delta_star,
        n_eligible,
        iterations: shrunk.iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_two_batch_data() -> (AbundanceMatrix, Metadata) {
        // 4 features × 8 samples; batch "b" shifted up on every feature.
        let data = DMatrix::from_row_slice(
            4,
            8,
            &[
                10.0, 12.0, 9.0, 11.0, 40.0, 44.0, 38.0, 42.0, //
                20.0, 22.0, 19.0, 21.0, 60.0, 66.0, 57.0, 63.0, //
                30.0, 33.0, 28.0, 31.0, 50.0, 55.0, 48.0, 52.0, //
                40.0, 41.0, 39.0, 42.0, 70.0, 72.0, 68.0, 71.0,
            ],
        );
        let sample_ids: Vec<String> = (0..8).map(|i| format!("S{}", i)).collect();
        let abd = AbundanceMatrix::new(
            data,
            (0..4).map(|i| format!("feat_{}", i)).collect(),
            sample_ids.clone(),
        )
        .unwrap();

        let batches: Vec<String> = (0..8)
            .map(|i| if i < 4 { "a".into() } else { "b".into() })
            .collect();
        let meta =
            Metadata::from_columns(sample_ids, vec![("study".to_string(), batches)]).unwrap();
        (abd, meta)
    }

    #[test]
    fn test_config_defaults() {
        let config = AdjustConfig::default();
        assert!(config.zero_inflation);
        assert_relative_eq!(config.conv, 1e-4);
        assert_eq!(config.maxit, 1000);
        assert!(config.counts.is_none());
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let config = AdjustConfig {
            zero_inflation: false,
            pseudo_count: Some(1e-6),
            conv: 1e-5,
            maxit: 200,
            counts: Some(true),
        };
        let yaml = config.to_yaml().unwrap();
        let parsed = AdjustConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.maxit, 200);
        assert_eq!(parsed.counts, Some(true));
        assert!(!parsed.zero_inflation);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AdjustConfig::default();
        config.conv = 0.0;
        let (abd, meta) = create_two_batch_data();
        let result = adjust_batch(&abd, &meta, "study", &[], &config);
        assert!(matches!(result, Err(AdjustError::Configuration(_))));
    }

    #[test]
    fn test_adjust_preserves_shape_and_labels() {
        let (abd, meta) = create_two_batch_data();
        let out = adjust_batch(&abd, &meta, "study", &[], &AdjustConfig::default()).unwrap();

        assert_eq!(out.adjusted.n_features(), abd.n_features());
        assert_eq!(out.adjusted.n_samples(), abd.n_samples());
        assert_eq!(out.adjusted.feature_ids(), abd.feature_ids());
        assert_eq!(out.adjusted.sample_ids(), abd.sample_ids());
        assert_eq!(out.batch_levels, vec!["a", "b"]);
        assert_eq!(out.gamma_hat.shape(), (4, 2));
        assert_eq!(out.n_eligible, vec![4, 4]);
    }

    #[test]
    fn test_adjust_reduces_batch_shift() {
        let (abd, meta) = create_two_batch_data();
        let out = adjust_batch(&abd, &meta, "study", &[], &AdjustConfig::default()).unwrap();

        // Compare relative abundances: batch "b" doubled feature 0's share
        // in the raw data; after adjustment the gap must shrink.
        let rel_gap = |m: &AbundanceMatrix, f: usize| {
            let totals = m.sample_totals();
            let mean_a: f64 = (0..4).map(|j| m.get(f, j) / totals[j]).sum::<f64>() / 4.0;
            let mean_b: f64 = (4..8).map(|j| m.get(f, j) / totals[j]).sum::<f64>() / 4.0;
            (mean_b - mean_a).abs()
        };
        assert!(rel_gap(&out.adjusted, 0) < rel_gap(&abd, 0));
    }

    #[test]
    fn test_unaligned_metadata_fails() {
        let (abd, _) = create_two_batch_data();
        let other = Metadata::from_columns(
            vec!["X1".into(), "X2".into()],
            vec![("study".to_string(), vec!["a".into(), "b".into()])],
        )
        .unwrap();
        let result = adjust_batch(&abd, &other, "study", &[], &AdjustConfig::default());
        assert!(matches!(result, Err(AdjustError::SampleMismatch(_))));
    }

    #[test]
    fn test_single_level_batch_fails_before_numeric_work() {
        let (abd, _) = create_two_batch_data();
        let sample_ids: Vec<String> = (0..8).map(|i| format!("S{}", i)).collect();
        let meta = Metadata::from_columns(
            sample_ids,
            vec![("study".to_string(), vec!["a".into(); 8])],
        )
        .unwrap();
        let result = adjust_batch(&abd, &meta, "study", &[], &AdjustConfig::default());
        assert!(matches!(result, Err(AdjustError::Configuration(_))));
    }
}
