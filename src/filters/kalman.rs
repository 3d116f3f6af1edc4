//! Linear and extended Kalman filters
//!
//! One [`Filter`] owns the state, covariance and system matrices of a single
//! motion hypothesis. Linear and extended variants share the predict step and
//! differ only in how the update linearises the measurement model:
//!
//! - [`FilterKind::Linear`]: expected measurement `H·x`, gain from `H`
//! - [`FilterKind::Extended`]: expected measurement `Hx(x)`, gain from the
//!   configured Jacobian
//!
//! System matrices may be symbolic; [`Filter::refresh`] re-evaluates them
//! for a new time step and binding before each cycle.
//!
//! # Example
//!
//! ```
//! use imm_tracker::filters::kalman::{Filter, SystemMatrices};
//! use nalgebra::{DMatrix, DVector};
//!
//! // Constant position model observed directly
//! let matrices = SystemMatrices {
//!     transition: DMatrix::identity(2, 2),
//!     input: DMatrix::zeros(0, 0),
//!     process_noise: DMatrix::zeros(2, 2),
//!     measurement: DMatrix::identity(2, 2),
//!     measurement_uncertainty: DMatrix::identity(2, 2),
//!     jacobian: None,
//! };
//! let mut filter = Filter::linear(
//!     "KF",
//!     DVector::zeros(2),
//!     DMatrix::identity(2, 2),
//!     matrices,
//! ).unwrap();
//!
//! filter.predict(None).unwrap();
//! filter.update(&DVector::from_vec(vec![5.0, 5.0])).unwrap();
//! assert!((filter.state()[0] - 2.5).abs() < 1e-12);
//! ```

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::types::binding::Binding;
use crate::types::expression::EvaluationError;
use crate::types::linalg::{
    ensure_len, ensure_shape, gaussian_likelihood, gaussian_log_likelihood,
    innovation_covariance, joseph_update, kalman_gain, round_vector,
};
use crate::types::symbolic::SymbolicMatrix;
use crate::{ConfigError, ImmError, Result};

/// Decimal places kept in the stored innovation.
const ERROR_DECIMALS: i32 = 9;

/// Nonlinear measurement function `Hx(state) -> expected measurement`.
pub type MeasurementFn = Arc<dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync>;

// ============================================================================
// Filter Kind
// ============================================================================

/// Measurement linearisation used by a filter.
#[derive(Clone)]
pub enum FilterKind {
    /// Standard Kalman filter
    Linear,
    /// Extended Kalman filter. Without a measurement function the expected
    /// measurement is `H·x`.
    Extended { measurement_fn: Option<MeasurementFn> },
}

impl FilterKind {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            FilterKind::Linear => "KF",
            FilterKind::Extended { .. } => "EKF",
        }
    }
}

impl fmt::Debug for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKind::Linear => f.write_str("Linear"),
            FilterKind::Extended { measurement_fn } => f
                .debug_struct("Extended")
                .field("measurement_fn", &measurement_fn.as_ref().map(|_| "<fn>"))
                .finish(),
        }
    }
}

// ============================================================================
// System Matrices
// ============================================================================

/// Numeric system matrices of one filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemMatrices {
    /// F, n×n
    pub transition: DMatrix<f64>,
    /// G, n×p; empty when the model takes no input
    pub input: DMatrix<f64>,
    /// Q, n×n
    pub process_noise: DMatrix<f64>,
    /// H, m×n
    pub measurement: DMatrix<f64>,
    /// R, m×m
    pub measurement_uncertainty: DMatrix<f64>,
    /// Measurement Jacobian, m×n, extended filters only
    pub jacobian: Option<DMatrix<f64>>,
}

impl SystemMatrices {
    /// Measurement dimension m.
    #[inline]
    pub fn measurement_dim(&self) -> usize {
        self.measurement.nrows()
    }

    /// Checks that all matrices agree with state dimension `n`.
    pub fn validate(&self, filter: &str, n: usize) -> Result<()> {
        let m = self.measurement_dim();
        let ctx = |matrix: &str| format!("{filter}.{matrix}");

        ensure_shape(&ctx("transition_matrix"), &self.transition, n, n)?;
        ensure_shape(&ctx("process_noise_matrix"), &self.process_noise, n, n)?;
        ensure_shape(&ctx("measurement_control_matrix"), &self.measurement, m, n)?;
        ensure_shape(&ctx("measurement_uncertainty_matrix"), &self.measurement_uncertainty, m, m)?;
        if !self.input.is_empty() {
            ensure_shape(&ctx("input_control_matrix"), &self.input, n, self.input.ncols())?;
        }
        if let Some(jacobian) = &self.jacobian {
            ensure_shape(&ctx("jacobi_matrix"), jacobian, m, n)?;
        }
        Ok(())
    }
}

/// Symbolic counterpart of [`SystemMatrices`], parsed once at configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicSystem {
    pub transition: SymbolicMatrix,
    pub input: SymbolicMatrix,
    pub process_noise: SymbolicMatrix,
    pub measurement: SymbolicMatrix,
    pub measurement_uncertainty: SymbolicMatrix,
    pub jacobian: Option<SymbolicMatrix>,
}

impl SymbolicSystem {
    /// Evaluates every matrix against the binding.
    pub fn evaluate(&self, binding: &Binding) -> ::core::result::Result<SystemMatrices, EvaluationError> {
        Ok(SystemMatrices {
            transition: self.transition.evaluate(binding)?,
            input: self.input.evaluate(binding)?,
            process_noise: self.process_noise.evaluate(binding)?,
            measurement: self.measurement.evaluate(binding)?,
            measurement_uncertainty: self.measurement_uncertainty.evaluate(binding)?,
            jacobian: self
                .jacobian
                .as_ref()
                .map(|j| j.evaluate(binding))
                .transpose()?,
        })
    }

    /// Returns `true` if any matrix references a variable.
    pub fn is_time_dependent(&self) -> bool {
        !self.all().all(SymbolicMatrix::is_constant)
    }

    /// Names of all variables referenced by any matrix.
    pub fn variables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in self.all().flat_map(SymbolicMatrix::variables) {
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }

    fn all(&self) -> impl Iterator<Item = &SymbolicMatrix> {
        [
            &self.transition,
            &self.input,
            &self.process_noise,
            &self.measurement,
            &self.measurement_uncertainty,
        ]
        .into_iter()
        .chain(self.jacobian.as_ref())
    }
}

// ============================================================================
// Filter
// ============================================================================

/// A single-model Kalman filter with persistent state.
#[derive(Debug, Clone)]
pub struct Filter {
    name: String,
    kind: FilterKind,
    state: DVector<f64>,
    covariance: DMatrix<f64>,
    matrices: SystemMatrices,
    symbolic: Option<Arc<SymbolicSystem>>,
    input: DVector<f64>,

    state_prior: DVector<f64>,
    covariance_prior: DMatrix<f64>,
    state_posterior: DVector<f64>,
    covariance_posterior: DMatrix<f64>,
    measurement: DVector<f64>,
    innovation_covariance: DMatrix<f64>,
    innovation_covariance_inverse: DMatrix<f64>,
    error: DVector<f64>,
    likelihood: Cell<Option<f64>>,
}

impl Filter {
    /// Creates a filter of the given kind.
    ///
    /// # Errors
    /// `ImmError::Config` if the matrices disagree with the state dimension
    /// or an extended filter has no Jacobian.
    pub fn new(
        name: impl Into<String>,
        kind: FilterKind,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
        matrices: SystemMatrices,
    ) -> Result<Self> {
        let name = name.into();
        let n = state.len();

        ensure_shape(&format!("{name}.covariance_matrix"), &covariance, n, n)
            .map_err(as_config_error)?;
        if matches!(kind, FilterKind::Extended { .. }) && matrices.jacobian.is_none() {
            return Err(ConfigError::MissingMatrix {
                filter: name,
                matrix: "jacobi_matrix".to_string(),
            }
            .into());
        }
        matrices.validate(&name, n).map_err(as_config_error)?;

        let m = matrices.measurement_dim();
        Ok(Self {
            name,
            kind,
            state_prior: state.clone(),
            covariance_prior: covariance.clone(),
            state_posterior: state.clone(),
            covariance_posterior: covariance.clone(),
            state,
            covariance,
            matrices,
            symbolic: None,
            input: DVector::zeros(0),
            measurement: DVector::zeros(m),
            innovation_covariance: DMatrix::zeros(0, 0),
            innovation_covariance_inverse: DMatrix::zeros(0, 0),
            error: DVector::zeros(0),
            likelihood: Cell::new(None),
        })
    }

    /// Creates a linear Kalman filter.
    pub fn linear(
        name: impl Into<String>,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
        matrices: SystemMatrices,
    ) -> Result<Self> {
        Self::new(name, FilterKind::Linear, state, covariance, matrices)
    }

    /// Creates an extended Kalman filter; `matrices.jacobian` is required.
    pub fn extended(
        name: impl Into<String>,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
        matrices: SystemMatrices,
        measurement_fn: Option<MeasurementFn>,
    ) -> Result<Self> {
        Self::new(
            name,
            FilterKind::Extended { measurement_fn },
            state,
            covariance,
            matrices,
        )
    }

    /// Attaches symbolic matrices re-evaluated by [`Filter::refresh`].
    pub fn with_symbolic(mut self, symbolic: Arc<SymbolicSystem>) -> Self {
        self.symbolic = Some(symbolic);
        self
    }

    /// Sets a constant input vector used when `predict` receives none.
    pub fn with_input(mut self, input: DVector<f64>) -> Self {
        self.input = input;
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> &FilterKind {
        &self.kind
    }

    /// Native state dimension n.
    #[inline]
    pub fn state_dim(&self) -> usize {
        self.state.len()
    }

    /// Measurement dimension m.
    #[inline]
    pub fn measurement_dim(&self) -> usize {
        self.matrices.measurement_dim()
    }

    #[inline]
    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }

    #[inline]
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    #[inline]
    pub fn matrices(&self) -> &SystemMatrices {
        &self.matrices
    }

    #[inline]
    pub fn symbolic(&self) -> Option<&SymbolicSystem> {
        self.symbolic.as_deref()
    }

    /// State after the last `predict`.
    #[inline]
    pub fn state_prior(&self) -> &DVector<f64> {
        &self.state_prior
    }

    #[inline]
    pub fn covariance_prior(&self) -> &DMatrix<f64> {
        &self.covariance_prior
    }

    /// State after the last successful `update`.
    #[inline]
    pub fn state_posterior(&self) -> &DVector<f64> {
        &self.state_posterior
    }

    #[inline]
    pub fn covariance_posterior(&self) -> &DMatrix<f64> {
        &self.covariance_posterior
    }

    /// Measurement used by the last successful `update`.
    #[inline]
    pub fn last_measurement(&self) -> &DVector<f64> {
        &self.measurement
    }

    /// S of the last update.
    #[inline]
    pub fn innovation_covariance(&self) -> &DMatrix<f64> {
        &self.innovation_covariance
    }

    /// S⁻¹ of the last update.
    #[inline]
    pub fn innovation_covariance_inverse(&self) -> &DMatrix<f64> {
        &self.innovation_covariance_inverse
    }

    /// Rounded innovation of the last update.
    #[inline]
    pub fn error(&self) -> &DVector<f64> {
        &self.error
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Replaces state and covariance, as done by the mixing step.
    pub fn set_estimate(&mut self, state: DVector<f64>, covariance: DMatrix<f64>) -> Result<()> {
        let n = self.state_dim();
        ensure_len(&format!("{} state", self.name), &state, n)?;
        ensure_shape(&format!("{} covariance", self.name), &covariance, n, n)?;
        self.state = state;
        self.covariance = covariance;
        Ok(())
    }

    /// Replaces R for subsequent updates.
    pub fn set_measurement_uncertainty(&mut self, r: DMatrix<f64>) -> Result<()> {
        let m = self.measurement_dim();
        ensure_shape(&format!("{} measurement uncertainty", self.name), &r, m, m)?;
        self.matrices.measurement_uncertainty = r;
        Ok(())
    }

    /// Installs the nonlinear measurement function of an extended filter.
    pub fn set_measurement_function(&mut self, f: MeasurementFn) -> Result<()> {
        match &mut self.kind {
            FilterKind::Extended { measurement_fn } => {
                *measurement_fn = Some(f);
                Ok(())
            }
            FilterKind::Linear => Err(ConfigError::InvalidFilter {
                filter: self.name.clone(),
                reason: "a linear filter takes no measurement function".to_string(),
            }
            .into()),
        }
    }

    /// Replaces the numeric system matrices.
    pub fn set_matrices(&mut self, matrices: SystemMatrices) -> Result<()> {
        matrices.validate(&self.name, self.state_dim())?;
        if matches!(self.kind, FilterKind::Extended { .. }) && matrices.jacobian.is_none() {
            return Err(ConfigError::MissingMatrix {
                filter: self.name.clone(),
                matrix: "jacobi_matrix".to_string(),
            }
            .into());
        }
        self.matrices = matrices;
        Ok(())
    }

    /// Re-evaluates symbolic system matrices against `binding`.
    ///
    /// Filters without symbolic matrices are left untouched. A constant
    /// symbolic R does not replace the current R, so a value installed with
    /// [`Filter::set_measurement_uncertainty`] survives the refresh.
    pub fn refresh(&mut self, binding: &Binding) -> Result<()> {
        let Some(symbolic) = &self.symbolic else {
            return Ok(());
        };
        let mut matrices = symbolic.evaluate(binding)?;
        if symbolic.measurement_uncertainty.is_constant() {
            matrices.measurement_uncertainty = self.matrices.measurement_uncertainty.clone();
        }
        self.set_matrices(matrices)
    }

    // ------------------------------------------------------------------------
    // Kalman Cycle
    // ------------------------------------------------------------------------

    /// Performs the prediction step.
    ///
    /// - x = F * x + G * u (input term only when G and u are non-empty)
    /// - P = F * P * F^T + Q
    ///
    /// # Arguments
    /// - `input`: optional input vector, replaces the stored one
    pub fn predict(&mut self, input: Option<&DVector<f64>>) -> Result<()> {
        if let Some(u) = input {
            self.input = u.clone();
        }

        let f = &self.matrices.transition;
        let g = &self.matrices.input;

        let mut state = f * &self.state;
        if !g.is_empty() && !self.input.is_empty() {
            ensure_len(&format!("{} input", self.name), &self.input, g.ncols())?;
            state += g * &self.input;
        }
        let covariance = f * &self.covariance * f.transpose() + &self.matrices.process_noise;

        self.state = state;
        self.covariance = covariance;

        self.state_prior = self.state.clone();
        self.covariance_prior = self.covariance.clone();
        Ok(())
    }

    /// Performs the update step with a measurement.
    ///
    /// - y = z - H * x (or z - Hx(x) for extended filters)
    /// - S = H * P * H^T + R
    /// - K = P * H^T * S^{-1}
    /// - x = x + K * y
    /// - P = (I - K*H) * P * (I - K*H)^T + K * R * K^T
    ///
    /// # Errors
    /// `ImmError::SingularUncertainty` if S is not invertible. The filter is
    /// left in its predicted state.
    pub fn update(&mut self, z: &DVector<f64>) -> Result<()> {
        let m = self.measurement_dim();
        ensure_len(&format!("{} measurement", self.name), z, m)?;

        let (h, expected) = match &self.kind {
            FilterKind::Linear => {
                let h = &self.matrices.measurement;
                (h, h * &self.state)
            }
            FilterKind::Extended { measurement_fn } => {
                let h = self.matrices.jacobian.as_ref().ok_or_else(|| {
                    ConfigError::MissingMatrix {
                        filter: self.name.clone(),
                        matrix: "jacobi_matrix".to_string(),
                    }
                })?;
                let expected = match measurement_fn {
                    Some(hx) => hx(&self.state),
                    None => &self.matrices.measurement * &self.state,
                };
                (h, expected)
            }
        };
        ensure_len(&format!("{} expected measurement", self.name), &expected, m)?;

        let r = &self.matrices.measurement_uncertainty;
        let y = z - expected;
        let s = innovation_covariance(&self.covariance, h, r);
        let s_inv = s
            .clone()
            .try_inverse()
            .filter(|inv| inv.iter().all(|v| v.is_finite()))
            .ok_or_else(|| ImmError::SingularUncertainty {
                filter: self.name.clone(),
            })?;

        let k = kalman_gain(&self.covariance, h, &s_inv);
        let state = &self.state + &k * &y;
        let covariance = joseph_update(&self.covariance, &k, h, r);

        self.state = state;
        self.covariance = covariance;
        self.innovation_covariance = s;
        self.innovation_covariance_inverse = s_inv;
        self.error = round_vector(&y, ERROR_DECIMALS);
        self.measurement = z.clone();
        self.state_posterior = self.state.clone();
        self.covariance_posterior = self.covariance.clone();
        self.likelihood.set(None);
        Ok(())
    }

    /// Performs a single predict-update cycle.
    pub fn predict_update(&mut self, input: Option<&DVector<f64>>, z: &DVector<f64>) -> Result<()> {
        self.predict(input)?;
        self.update(z)
    }

    /// Density of the last innovation under the last innovation covariance.
    ///
    /// Singular covariances are accepted; the value never drops below
    /// `f64::MIN_POSITIVE`. Cached until the next `update`.
    pub fn likelihood(&self) -> f64 {
        if let Some(cached) = self.likelihood.get() {
            return cached;
        }
        let value = gaussian_likelihood(&self.error, &self.innovation_covariance);
        self.likelihood.set(Some(value));
        value
    }

    /// Log-density of the last innovation, `-inf` if it cannot be computed.
    pub fn log_likelihood(&self) -> f64 {
        gaussian_log_likelihood(&self.error, &self.innovation_covariance)
            .unwrap_or(f64::NEG_INFINITY)
    }
}

fn as_config_error(err: ImmError) -> ImmError {
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
