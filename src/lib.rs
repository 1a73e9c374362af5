//! Batch-effect adjustment for feature-by-sample abundance matrices.
//!
//! This library removes technical batch/study effects from abundance data
//! while preserving biological covariate effects, using a location-and-scale
//! empirical-Bayes shrinkage model (ComBat-style) with explicit handling of
//! zero-inflated observations.
//!
//! # Overview
//!
//! The library is organized into composable modules:
//!
//! - **data**: Core data structures (AbundanceMatrix, Metadata, Design)
//! - **normalize**: Total-sum scaling and the log2 analysis transform
//! - **correct**: The correction pipeline (eligibility indexing,
//!   standardization, prior estimation, shrinkage, reconstruction)
//!
//! # Example
//!
//! ```no_run
//! use batch_adjust::prelude::*;
//!
//! // Load data
//! let abundance = AbundanceMatrix::from_tsv("abundance.tsv").unwrap();
//! let metadata = Metadata::from_tsv("metadata.tsv").unwrap();
//!
//! // Remove the study effect, preserving the disease covariate
//! let output = adjust_batch(
//!     &abundance,
//!     &metadata,
//!     "study",
//!     &["disease".to_string()],
//!     &AdjustConfig::default(),
//! )
//! .unwrap();
//!
//! output.adjusted.to_tsv("adjusted.tsv").unwrap();
//! ```

pub mod correct;
pub mod data;
pub mod error;
pub mod normalize;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::correct::{
        adjust_batch, AdjustConfig, AdjustOutput, BatchHyper, EbParameters, EligibilityIndex,
        ShrunkParameters, StandardizationFit, Standardized,
    };
    pub use crate::data::{AbundanceMatrix, BatchLabels, Design, Metadata, Variable, VariableType};
    pub use crate::error::{AdjustError, Result};
    pub use crate::normalize::{half_min_pseudocount, log_transform, norm_tss, RelativeAbundance};
}
