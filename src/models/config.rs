//! Filter bank configuration
//!
//! Serde types describing a bank of filters and the IMM that blends them.
//! Matrix cells are numbers or expression strings:
//!
//! ```json
//! {
//!   "filters": [
//!     { "name": "KF", "transition_matrix": [[1, "dt"], [0, 1]], ... }
//!   ],
//!   "mode_probabilities": [1.0],
//!   "markov_transition_matrix": [[1.0]]
//! }
//! ```
//!
//! [`ImmSpec::build`] parses every cell once, cross-checks dimensions and
//! returns a ready [`InteractingMultipleModel`]. Any problem is a
//! [`ConfigError`] and no model is created.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::filters::imm::InteractingMultipleModel;
use crate::filters::kalman::{Filter, FilterKind, SymbolicSystem};
use crate::types::adapter::StateSpaceAdapter;
use crate::types::binding::{Binding, StateLayout, KNOWN_VARIABLES, POS_X, POS_Y, SIGMA_A_SQ};
use crate::types::symbolic::{MatrixSpec, SymbolicMatrix};
use crate::{ConfigError, ImmError, Result};

/// Owner name used in errors about IMM-level matrices.
const IMM_SCOPE: &str = "IMM";

// ============================================================================
// Filter Type
// ============================================================================

/// Filter variant selected by a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    Kalman,
    ExtendedKalman,
}

impl FilterType {
    /// Resolves an explicit type key.
    ///
    /// Accepts `KF`/`KalmanFilter` and `EKF`/`ExtendedKalmanFilter`.
    pub fn from_key(key: &str) -> ::core::result::Result<Self, ConfigError> {
        match key {
            "KF" | "KalmanFilter" => Ok(FilterType::Kalman),
            "EKF" | "ExtendedKalmanFilter" => Ok(FilterType::ExtendedKalman),
            other => Err(ConfigError::UnknownFilterType(other.to_string())),
        }
    }

    /// Infers the type from a numbered filter name such as `KF2` or `EKF`.
    pub fn from_name(name: &str) -> ::core::result::Result<Self, ConfigError> {
        let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
        match stem {
            "KF" => Ok(FilterType::Kalman),
            "EKF" => Ok(FilterType::ExtendedKalman),
            _ => Err(ConfigError::UnknownFilterType(name.to_string())),
        }
    }
}

// ============================================================================
// Filter Specification
// ============================================================================

/// Configuration of one filter in the bank.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Filter name, e.g. `KF1`
    pub name: String,
    /// Explicit type key; inferred from `name` when absent
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub filter_type: Option<String>,
    #[serde(default)]
    pub transition_matrix: MatrixSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_control_matrix: MatrixSpec,
    #[serde(default)]
    pub process_noise_matrix: MatrixSpec,
    #[serde(default)]
    pub measurement_control_matrix: MatrixSpec,
    #[serde(default)]
    pub measurement_uncertainty_matrix: MatrixSpec,
    /// Initial covariance, used when `build` receives none
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub covariance_matrix: MatrixSpec,
    /// Measurement Jacobian, required for extended filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jacobi_matrix: Option<MatrixSpec>,
}

impl FilterSpec {
    /// Resolved filter type.
    pub fn resolve_type(&self) -> ::core::result::Result<FilterType, ConfigError> {
        match &self.filter_type {
            Some(key) => FilterType::from_key(key),
            None => FilterType::from_name(&self.name),
        }
    }

    /// Parses every matrix of this filter.
    pub fn parse(&self) -> ::core::result::Result<SymbolicSystem, ConfigError> {
        let parse = |matrix: &str, spec: &MatrixSpec| {
            SymbolicMatrix::parse(&format!("{}.{matrix}", self.name), spec)
        };
        let required = |matrix: &str, spec: &MatrixSpec| {
            if spec.is_empty() {
                return Err(ConfigError::MissingMatrix {
                    filter: self.name.clone(),
                    matrix: matrix.to_string(),
                });
            }
            parse(matrix, spec)
        };

        let system = SymbolicSystem {
            transition: required("transition_matrix", &self.transition_matrix)?,
            input: parse("input_control_matrix", &self.input_control_matrix)?,
            process_noise: required("process_noise_matrix", &self.process_noise_matrix)?,
            measurement: required("measurement_control_matrix", &self.measurement_control_matrix)?,
            measurement_uncertainty: required(
                "measurement_uncertainty_matrix",
                &self.measurement_uncertainty_matrix,
            )?,
            jacobian: self
                .jacobi_matrix
                .as_ref()
                .map(|spec| required("jacobi_matrix", spec))
                .transpose()?,
        };

        for name in system.variables() {
            if !KNOWN_VARIABLES.contains(&name.as_str()) {
                return Err(ConfigError::MalformedMatrix {
                    matrix: self.name.clone(),
                    reason: format!("unknown variable '{name}'"),
                });
            }
        }
        Ok(system)
    }
}

// ============================================================================
// IMM Specification
// ============================================================================

/// Configuration of a complete filter bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImmSpec {
    pub filters: Vec<FilterSpec>,
    pub mode_probabilities: Vec<f64>,
    pub markov_transition_matrix: Vec<Vec<f64>>,
    /// Names of the common state components; defaults by dimension
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_variables: Vec<String>,
    /// Names of the measurement components
    #[serde(default = "default_measurement_variables")]
    pub measurement_variables: Vec<String>,
    /// Noise-scale constant bound to `sigma_a_sq`
    #[serde(default)]
    pub sigma_a_sq: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion_matrix: Option<MatrixSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion_matrix_covariance: Option<MatrixSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shrinking_matrix: Option<MatrixSpec>,
}

fn default_measurement_variables() -> Vec<String> {
    vec![POS_X.to_string(), POS_Y.to_string()]
}

impl ImmSpec {
    /// Decodes a JSON configuration document.
    pub fn from_json(json: &str) -> ::core::result::Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Encodes the configuration as pretty-printed JSON.
    pub fn to_json(&self) -> ::core::result::Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Structural checks that need no initial state; every filter matrix is parsed.
    pub fn validate(&self) -> ::core::result::Result<(), ConfigError> {
        if self.filters.is_empty() {
            return Err(ConfigError::EmptyFilterBank);
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if self.filters[..i].iter().any(|f| f.name == filter.name) {
                return Err(ConfigError::InvalidFilter {
                    filter: filter.name.clone(),
                    reason: "duplicate filter name".to_string(),
                });
            }
            filter.resolve_type()?;
            filter.parse()?;
        }

        let k = self.filters.len();
        if self.markov_transition_matrix.iter().any(|row| row.len() != k)
            || self.markov_transition_matrix.len() != k
        {
            return Err(ConfigError::DimensionMismatch {
                context: "markov_transition_matrix".to_string(),
                expected: format!("{k}x{k}"),
                actual: format!(
                    "{} rows of lengths {:?}",
                    self.markov_transition_matrix.len(),
                    self.markov_transition_matrix
                        .iter()
                        .map(Vec::len)
                        .collect::<Vec<_>>()
                ),
            });
        }
        if self.shrinking_matrix.is_some() && self.expansion_matrix.is_none() {
            return Err(ConfigError::MissingMatrix {
                filter: IMM_SCOPE.to_string(),
                matrix: "expansion_matrix".to_string(),
            });
        }
        if self.expansion_matrix.is_some() && self.shrinking_matrix.is_none() {
            return Err(ConfigError::MissingMatrix {
                filter: IMM_SCOPE.to_string(),
                matrix: "shrinking_matrix".to_string(),
            });
        }
        Ok(())
    }

    /// Names of the common state and measurement components.
    pub fn layout(&self, state_dim: usize) -> ::core::result::Result<StateLayout, ConfigError> {
        if self.state_variables.is_empty() {
            let mut layout = StateLayout::planar(state_dim);
            layout.measurement = self.measurement_variables.clone();
            return Ok(layout);
        }
        if self.state_variables.len() != state_dim {
            return Err(ConfigError::DimensionMismatch {
                context: "state_variables".to_string(),
                expected: state_dim.to_string(),
                actual: self.state_variables.len().to_string(),
            });
        }
        Ok(StateLayout::new(
            self.state_variables.clone(),
            self.measurement_variables.clone(),
        ))
    }

    /// Evaluates the expansion and shrinking matrices.
    pub fn adapter(&self, state_dim: usize) -> Result<StateSpaceAdapter> {
        let (Some(expansion), Some(shrinking)) = (&self.expansion_matrix, &self.shrinking_matrix)
        else {
            return Ok(StateSpaceAdapter::identity(state_dim));
        };

        let binding = Binding::new().with(SIGMA_A_SQ, self.sigma_a_sq);
        let evaluate = |name: &str, spec: &MatrixSpec| -> Result<DMatrix<f64>> {
            Ok(SymbolicMatrix::parse(name, spec)?.evaluate(&binding)?)
        };

        let expansion = evaluate("expansion_matrix", expansion)?;
        let expansion_covariance = self
            .expansion_matrix_covariance
            .as_ref()
            .map(|spec| evaluate("expansion_matrix_covariance", spec))
            .transpose()?;
        let shrinking = evaluate("shrinking_matrix", shrinking)?;

        if expansion.nrows() != state_dim {
            return Err(ConfigError::DimensionMismatch {
                context: "expansion_matrix".to_string(),
                expected: format!("{state_dim}x{state_dim}"),
                actual: format!("{}x{}", expansion.nrows(), expansion.ncols()),
            }
            .into());
        }
        Ok(StateSpaceAdapter::new(expansion, expansion_covariance, shrinking)?)
    }

    /// Builds the IMM at track initiation.
    ///
    /// # Arguments
    /// * `initial_state` - estimate in the common state space
    /// * `initial_covariance` - common-space covariance; when absent each
    ///   filter's `covariance_matrix` (or identity) is used
    ///
    /// System matrices are evaluated with `dt = 0` and the initial state to
    /// obtain starting values; they are re-evaluated every cycle.
    pub fn build(
        &self,
        initial_state: &DVector<f64>,
        initial_covariance: Option<&DMatrix<f64>>,
    ) -> Result<InteractingMultipleModel> {
        self.validate()?;

        let n = initial_state.len();
        if let Some(p) = initial_covariance {
            if p.shape() != (n, n) {
                return Err(ConfigError::DimensionMismatch {
                    context: "initial covariance".to_string(),
                    expected: format!("{n}x{n}"),
                    actual: format!("{}x{}", p.nrows(), p.ncols()),
                }
                .into());
            }
        }

        let layout = self.layout(n)?;
        let adapter = self.adapter(n)?;
        let binding = layout.binding(0.0, self.sigma_a_sq, initial_state, None);

        let mut filters = Vec::with_capacity(self.filters.len());
        for spec in &self.filters {
            filters.push(build_filter(spec, &adapter, &binding, initial_state, initial_covariance)?);
        }

        let probabilities = DVector::from_vec(self.mode_probabilities.clone());
        let k = self.filters.len();
        let markov = DMatrix::from_row_iterator(
            k,
            k,
            self.markov_transition_matrix.iter().flatten().copied(),
        );

        Ok(InteractingMultipleModel::new(filters, probabilities, markov, adapter)?
            .with_layout(layout)?
            .with_sigma_a_sq(self.sigma_a_sq))
    }
}

fn build_filter(
    spec: &FilterSpec,
    adapter: &StateSpaceAdapter,
    binding: &Binding,
    initial_state: &DVector<f64>,
    initial_covariance: Option<&DMatrix<f64>>,
) -> Result<Filter> {
    let system = spec.parse()?;
    let matrices = system.evaluate(binding)?;
    let dim = matrices.transition.nrows();

    if !adapter.supports(dim) {
        return Err(ConfigError::DimensionMismatch {
            context: format!("{}.transition_matrix", spec.name),
            expected: adapter.common_dim().to_string(),
            actual: dim.to_string(),
        }
        .into());
    }

    let state = adapter.shrink_state(initial_state, dim).map_err(to_config)?;
    let covariance = match initial_covariance {
        Some(p) => adapter.shrink_covariance(p, dim).map_err(to_config)?,
        None if !spec.covariance_matrix.is_empty() => {
            SymbolicMatrix::parse(&format!("{}.covariance_matrix", spec.name), &spec.covariance_matrix)?
                .evaluate(binding)?
        }
        None => DMatrix::identity(dim, dim),
    };

    let kind = match spec.resolve_type()? {
        FilterType::Kalman => FilterKind::Linear,
        FilterType::ExtendedKalman => FilterKind::Extended {
            measurement_fn: None,
        },
    };

    Ok(Filter::new(spec.name.clone(), kind, state, covariance, matrices)?
        .with_symbolic(Arc::new(system)))
}

fn to_config(err: ImmError) -> ImmError {
    match err {
        ImmError::DimensionMismatch {
            context,
            expected,
            actual,
        } => ConfigError::DimensionMismatch {
            context,
            expected,
            actual,
        }
        .into(),
        other => other,
    }
}
