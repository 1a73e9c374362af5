//! Data structures for batch-effect adjustment.

mod abundance;
mod design;
mod metadata;

pub use abundance::AbundanceMatrix;
pub use design::{covariate_columns, Design};
pub use metadata::{BatchLabels, Metadata, Variable, VariableType};

pub(crate) use design::matrix_rank;
