//! IMM-Tracker: multiple-model state estimation for target tracking
//!
//! Estimates position, velocity and acceleration of moving targets from noisy,
//! irregularly-timed measurements with a bank of competing Kalman filters
//! blended by an Interacting Multiple Model (IMM) mixer.
//!
//! # Features
//!
//! - **Symbolic system matrices**: matrix cells may be expressions such as
//!   `"sigma_a_sq*dt^4/4"`, parsed once and evaluated every cycle
//! - **Linear and extended filters** in one bank, sharing a single predict step
//! - **Heterogeneous state dimensions**: a 4-state constant-velocity filter can
//!   be mixed with a 6-state constant-acceleration filter through expansion and
//!   shrinking maps
//! - **Read-only extrapolation** for coasting tracks across sensor gaps
//!
//! # Example
//!
//! ```
//! use imm_tracker::prelude::*;
//! use nalgebra::{DMatrix, DVector};
//!
//! let spec = presets::cv_ca_bank(1.0);
//! let initial = DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
//! let mut imm = spec.build(&initial, Some(&DMatrix::identity(6, 6))).unwrap();
//!
//! imm.predict_update(1.0, &DVector::from_vec(vec![1.0, 0.5])).unwrap();
//! let total: f64 = imm.mode_probabilities().iter().sum();
//! assert!((total - 1.0).abs() < 1e-9);
//! ```

pub mod filters;
pub mod logging;
pub mod models;
pub mod tracking;
pub mod types;

pub mod prelude {
    pub use crate::filters::imm::*;
    pub use crate::filters::kalman::*;
    pub use crate::logging::*;
    pub use crate::models::config::*;
    pub use crate::models::presets;
    pub use crate::types::adapter::*;
    pub use crate::types::binding::*;
    pub use crate::types::expression::*;
    pub use crate::types::phase::*;
    pub use crate::types::symbolic::*;
    pub use crate::tracking::*;
    pub use crate::{ConfigError, ImmError, Result};
}

pub use types::expression::EvaluationError;

/// Configuration problems detected while building a filter bank.
///
/// These are fatal at track initiation: the track is not created.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Configuration document could not be decoded
    #[error("cannot decode configuration: {0}")]
    Parse(String),
    /// Matrix rows have differing lengths or a cell failed to parse
    #[error("malformed matrix '{matrix}': {reason}")]
    MalformedMatrix { matrix: String, reason: String },
    /// A matrix the filter type requires was not supplied
    #[error("filter '{filter}' is missing required matrix '{matrix}'")]
    MissingMatrix { filter: String, matrix: String },
    /// Filter type key is not one of the known filter types
    #[error("unknown filter type '{0}'")]
    UnknownFilterType(String),
    /// Cooperating matrices disagree on their dimensions
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: String,
        actual: String,
    },
    /// Mode probabilities or Markov rows are not valid distributions
    #[error("invalid probabilities: {0}")]
    InvalidProbabilities(String),
    /// A filter was configured in a way its type does not allow
    #[error("invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
    /// The filter bank is empty
    #[error("an interacting multiple model needs at least one filter")]
    EmptyFilterBank,
}

/// Error types for the library
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ImmError {
    /// Invalid configuration, raised while constructing filters or the IMM
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A symbolic matrix cell could not be evaluated
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    /// Innovation covariance of a filter is not invertible
    #[error("innovation covariance of filter '{filter}' is singular")]
    SingularUncertainty { filter: String },
    /// Normalised mode probabilities sum to more than one
    #[error("mode probabilities sum to {sum} after normalisation")]
    ModeProbabilityOverflow { sum: f64 },
    /// Numerical computation became unstable
    #[error("numerical instability: {0}")]
    NumericalInstability(String),
    /// A vector or matrix handed to an operation has the wrong shape
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: String,
        actual: String,
    },
}

pub type Result<T> = ::core::result::Result<T, ImmError>;
