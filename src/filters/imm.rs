//! Interacting Multiple Model estimator
//!
//! Blends a bank of [`Filter`]s, each tracking one motion hypothesis, into a
//! single estimate. Every measurement cycle runs:
//!
//! 1. refresh of time-dependent system matrices for the new time step
//! 2. mixing probabilities from the previous mode probabilities
//! 3. mixed initial state/covariance per filter
//! 4. predict of every filter
//! 5. combined prior estimate
//! 6. update of every filter, collecting measurement likelihoods
//! 7. new mode probabilities
//! 8. mixing probabilities for the next cycle
//! 9. combined posterior estimate
//!
//! A cycle is all-or-nothing: it runs on copies of the filters and commits
//! only when every step succeeded. A failed cycle leaves the model exactly as
//! it was before the call.

use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use super::kalman::Filter;
use crate::logging::{null_logger, ImmLogger};
use crate::types::adapter::StateSpaceAdapter;
use crate::types::binding::StateLayout;
use crate::types::linalg::{ensure_len, outer};
use crate::types::phase::CyclePhase;
use crate::{ConfigError, ImmError, Result};

/// Lower bound applied to every mode probability.
pub const MODE_PROBABILITY_FLOOR: f64 = 1e-9;

/// Tolerance of the post-normalisation sum check.
pub const MODE_PROBABILITY_TOLERANCE: f64 = 1e-9;

/// Tolerance used when validating configured distributions.
const DISTRIBUTION_TOLERANCE: f64 = 1e-6;

// ============================================================================
// Cycle Inputs and Outputs
// ============================================================================

/// Optional per-cycle inputs to [`InteractingMultipleModel::predict_update_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleInputs<'a> {
    /// Input vector u handed to every filter's predict
    pub input: Option<&'a DVector<f64>>,
    /// Measurement covariance installed as each filter's R from this cycle on
    pub measurement_uncertainty: Option<&'a DMatrix<f64>>,
}

/// A projected estimate produced without touching the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Extrapolation {
    pub state: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub mode_probabilities: DVector<f64>,
}

/// Weighted mixing result for one cycle.
struct Mixing {
    matrix: DMatrix<f64>,
    column_normalizer: DVector<f64>,
}

// ============================================================================
// Interacting Multiple Model
// ============================================================================

/// A bank of filters blended by mode probabilities.
#[derive(Clone)]
pub struct InteractingMultipleModel {
    filters: Vec<Filter>,
    mode_probabilities: DVector<f64>,
    markov: DMatrix<f64>,
    mixing_probability_matrix: DMatrix<f64>,
    column_normalizer: DVector<f64>,
    mixed_states: Vec<DVector<f64>>,
    mixed_covariances: Vec<DMatrix<f64>>,

    state: DVector<f64>,
    covariance: DMatrix<f64>,
    state_prior: DVector<f64>,
    covariance_prior: DMatrix<f64>,
    state_posterior: DVector<f64>,
    covariance_posterior: DMatrix<f64>,

    adapter: StateSpaceAdapter,
    layout: StateLayout,
    sigma_a_sq: f64,
    phase: CyclePhase,
    logger: Arc<dyn ImmLogger>,
}

impl InteractingMultipleModel {
    /// Creates an IMM over `filters`.
    ///
    /// # Arguments
    /// * `filters` - the filter bank, owned by the IMM from now on
    /// * `mode_probabilities` - initial probability of each filter
    /// * `markov` - k×k mode transition matrix, row i = P(next mode | i)
    /// * `adapter` - maps between filter-native and common state spaces
    ///
    /// # Errors
    /// `ImmError::Config` if the bank is empty, the probabilities are not
    /// distributions, or a filter dimension is not supported by the adapter.
    pub fn new(
        filters: Vec<Filter>,
        mode_probabilities: DVector<f64>,
        markov: DMatrix<f64>,
        adapter: StateSpaceAdapter,
    ) -> Result<Self> {
        if filters.is_empty() {
            return Err(ConfigError::EmptyFilterBank.into());
        }
        let k = filters.len();
        validate_distributions(&mode_probabilities, &markov, k)?;

        for filter in &filters {
            if !adapter.supports(filter.state_dim()) {
                return Err(ConfigError::DimensionMismatch {
                    context: format!("{} state", filter.name()),
                    expected: match adapter.native_dim() {
                        Some(native) => format!("{} or {native}", adapter.common_dim()),
                        None => adapter.common_dim().to_string(),
                    },
                    actual: filter.state_dim().to_string(),
                }
                .into());
            }
        }

        let expanded = expand_all(&adapter, &filters)?;
        let (state, covariance) = combine(&expanded, &mode_probabilities, adapter.common_dim());
        let mixing = compute_mixing(&mode_probabilities, &markov);
        let (mixed_states, mixed_covariances): (Vec<_>, Vec<_>) = expanded.into_iter().unzip();
        let layout = StateLayout::planar(adapter.common_dim());

        Ok(Self {
            filters,
            mode_probabilities,
            markov,
            mixing_probability_matrix: mixing.matrix,
            column_normalizer: mixing.column_normalizer,
            mixed_states,
            mixed_covariances,
            state_prior: state.clone(),
            covariance_prior: covariance.clone(),
            state_posterior: state.clone(),
            covariance_posterior: covariance.clone(),
            state,
            covariance,
            adapter,
            layout,
            sigma_a_sq: 0.0,
            phase: CyclePhase::Idle,
            logger: null_logger(),
        })
    }

    /// Sets the logging collaborator.
    pub fn with_logger(mut self, logger: Arc<dyn ImmLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Sets the names of the common state and measurement components.
    pub fn with_layout(mut self, layout: StateLayout) -> Result<Self> {
        if layout.state_dim() != self.adapter.common_dim() {
            return Err(ConfigError::DimensionMismatch {
                context: "state_variables".to_string(),
                expected: self.adapter.common_dim().to_string(),
                actual: layout.state_dim().to_string(),
            }
            .into());
        }
        self.layout = layout;
        Ok(self)
    }

    /// Sets the noise-scale constant bound to `sigma_a_sq`.
    pub fn with_sigma_a_sq(mut self, sigma_a_sq: f64) -> Self {
        self.sigma_a_sq = sigma_a_sq;
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    #[inline]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Looks up a filter by name.
    pub fn filter(&self, name: &str) -> Option<&Filter> {
        self.filters.iter().find(|f| f.name() == name)
    }

    /// Mutable access to a filter, e.g. to install a measurement function.
    pub fn filter_mut(&mut self, name: &str) -> Option<&mut Filter> {
        self.filters.iter_mut().find(|f| f.name() == name)
    }

    #[inline]
    pub fn mode_probabilities(&self) -> &DVector<f64> {
        &self.mode_probabilities
    }

    #[inline]
    pub fn markov_transition_matrix(&self) -> &DMatrix<f64> {
        &self.markov
    }

    /// Mixing probabilities for the next cycle; every column sums to one.
    #[inline]
    pub fn mixing_probability_matrix(&self) -> &DMatrix<f64> {
        &self.mixing_probability_matrix
    }

    /// Predicted mode probabilities `Σ_i markov[i][j] · μ_i`.
    #[inline]
    pub fn column_normalizer(&self) -> &DVector<f64> {
        &self.column_normalizer
    }

    /// Mixed states of the last cycle, in the common space.
    #[inline]
    pub fn mixed_states(&self) -> &[DVector<f64>] {
        &self.mixed_states
    }

    #[inline]
    pub fn mixed_covariances(&self) -> &[DMatrix<f64>] {
        &self.mixed_covariances
    }

    /// Combined estimate.
    #[inline]
    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }

    #[inline]
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Combined estimate after the predict step of the last cycle.
    #[inline]
    pub fn state_prior(&self) -> &DVector<f64> {
        &self.state_prior
    }

    #[inline]
    pub fn covariance_prior(&self) -> &DMatrix<f64> {
        &self.covariance_prior
    }

    /// Combined estimate after the update step of the last cycle.
    #[inline]
    pub fn state_posterior(&self) -> &DVector<f64> {
        &self.state_posterior
    }

    #[inline]
    pub fn covariance_posterior(&self) -> &DMatrix<f64> {
        &self.covariance_posterior
    }

    #[inline]
    pub fn adapter(&self) -> &StateSpaceAdapter {
        &self.adapter
    }

    #[inline]
    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    #[inline]
    pub fn sigma_a_sq(&self) -> f64 {
        self.sigma_a_sq
    }

    #[inline]
    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Re-evaluates every filter's symbolic matrices for time step `dt`.
    ///
    /// The binding is built from the current combined state and, if given,
    /// the measurement. Either all filters are refreshed or none is.
    pub fn refresh_time_dependent_matrices(
        &mut self,
        dt: f64,
        measurement: Option<&DVector<f64>>,
    ) -> Result<()> {
        let mut filters = self.filters.clone();
        self.refresh_filters(&mut filters, dt, measurement)?;
        self.filters = filters;
        Ok(())
    }

    /// Runs one full measurement cycle.
    pub fn predict_update(&mut self, dt: f64, z: &DVector<f64>) -> Result<()> {
        self.predict_update_with(dt, z, CycleInputs::default())
    }

    /// Runs one full measurement cycle with optional input and R override.
    ///
    /// # Errors
    /// Evaluation, dimension and numerical errors abort the cycle; the model
    /// keeps its pre-cycle state.
    pub fn predict_update_with(
        &mut self,
        dt: f64,
        z: &DVector<f64>,
        inputs: CycleInputs<'_>,
    ) -> Result<()> {
        let mut reached = self.phase;
        match self.run_cycle(dt, z, inputs, &mut reached) {
            Ok(()) => {
                self.logger.log(&format!(
                    "cycle dt={dt} mode probabilities={:?}",
                    self.mode_probabilities.as_slice()
                ));
                Ok(())
            }
            Err(err) => {
                let stage = if reached.is_cycle_boundary() {
                    "before mixing".to_string()
                } else {
                    format!("after {reached} phase")
                };
                self.logger.log(&format!("cycle dt={dt} aborted {stage}: {err}"));
                Err(err)
            }
        }
    }

    /// Projects the estimate `dt` ahead without changing the model.
    ///
    /// Works on copies: refreshes the matrices, mixes and predicts every
    /// filter, and combines the predictions with the predicted mode
    /// probabilities.
    pub fn extrapolate(&self, dt: f64, input: Option<&DVector<f64>>) -> Result<Extrapolation> {
        let mut filters = self.filters.clone();
        self.refresh_filters(&mut filters, dt, None)?;

        let mixing = compute_mixing(&self.mode_probabilities, &self.markov);
        self.assign_mixed(&mut filters, &mixing.matrix)?;
        for filter in &mut filters {
            filter.predict(input)?;
        }

        let predicted = expand_all(&self.adapter, &filters)?;
        let (state, covariance) = combine(
            &predicted,
            &mixing.column_normalizer,
            self.adapter.common_dim(),
        );

        Ok(Extrapolation {
            state,
            covariance,
            mode_probabilities: mixing.column_normalizer,
        })
    }

    // ------------------------------------------------------------------------
    // Cycle Steps
    // ------------------------------------------------------------------------

    /// Runs the cycle on copies, advancing `phase` as each stage completes.
    fn run_cycle(
        &mut self,
        dt: f64,
        z: &DVector<f64>,
        inputs: CycleInputs<'_>,
        phase: &mut CyclePhase,
    ) -> Result<()> {
        let n = self.adapter.common_dim();
        let mut filters = self.filters.clone();

        // 1. time-dependent matrices
        self.refresh_filters(&mut filters, dt, Some(z))?;

        // 2-3. mixing
        let mixing = compute_mixing(&self.mode_probabilities, &self.markov);
        let (mixed_states, mixed_covariances) = self.assign_mixed(&mut filters, &mixing.matrix)?;
        *phase = phase.next();

        // 4. predict
        for filter in &mut filters {
            filter.predict(inputs.input)?;
        }
        *phase = phase.next();

        // 5. prior
        let predicted = expand_all(&self.adapter, &filters)?;
        let (state_prior, covariance_prior) = combine(&predicted, &self.mode_probabilities, n);

        // 6. update
        let mut likelihoods = DVector::<f64>::zeros(filters.len());
        for (j, filter) in filters.iter_mut().enumerate() {
            let (z_native, r_native) = self.adapter.shrink_measurement(
                z,
                inputs.measurement_uncertainty,
                filter.measurement_dim(),
            )?;
            if let Some(r) = r_native {
                filter.set_measurement_uncertainty(r)?;
            }
            filter.update(&z_native)?;
            likelihoods[j] = filter.likelihood();
        }

        // 7. mode probabilities
        let mode_probabilities = update_mode_probabilities(&mixing.column_normalizer, &likelihoods)?;
        *phase = phase.next();

        // 8. mixing for the next cycle
        let next = compute_mixing(&mode_probabilities, &self.markov);

        // 9. posterior
        let updated = expand_all(&self.adapter, &filters)?;
        let (state, covariance) = combine(&updated, &mode_probabilities, n);
        *phase = phase.next();

        self.filters = filters;
        self.mode_probabilities = mode_probabilities;
        self.mixing_probability_matrix = next.matrix;
        self.column_normalizer = next.column_normalizer;
        self.mixed_states = mixed_states;
        self.mixed_covariances = mixed_covariances;
        self.state_prior = state_prior;
        self.covariance_prior = covariance_prior;
        self.state_posterior = state.clone();
        self.covariance_posterior = covariance.clone();
        self.state = state;
        self.covariance = covariance;
        self.phase = *phase;
        Ok(())
    }

    fn refresh_filters(
        &self,
        filters: &mut [Filter],
        dt: f64,
        measurement: Option<&DVector<f64>>,
    ) -> Result<()> {
        let binding = self
            .layout
            .binding(dt, self.sigma_a_sq, &self.state, measurement);
        for filter in filters.iter_mut() {
            filter.refresh(&binding)?;
        }
        Ok(())
    }

    /// Mixes the filters' current estimates and assigns the result to each.
    fn assign_mixed(
        &self,
        filters: &mut [Filter],
        mixing: &DMatrix<f64>,
    ) -> Result<(Vec<DVector<f64>>, Vec<DMatrix<f64>>)> {
        let expanded = expand_all(&self.adapter, filters)?;
        let (states, covariances) = mix(&expanded, mixing, self.adapter.common_dim());

        for (j, filter) in filters.iter_mut().enumerate() {
            let dim = filter.state_dim();
            let x = self.adapter.shrink_state(&states[j], dim)?;
            let p = self.adapter.shrink_covariance(&covariances[j], dim)?;
            filter.set_estimate(x, p)?;
        }
        Ok((states, covariances))
    }
}

impl fmt::Debug for InteractingMultipleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractingMultipleModel")
            .field("filters", &self.filters)
            .field("mode_probabilities", &self.mode_probabilities)
            .field("markov", &self.markov)
            .field("state", &self.state)
            .field("covariance", &self.covariance)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_distributions(probabilities: &DVector<f64>, markov: &DMatrix<f64>, k: usize) -> Result<()> {
    let invalid = |reason: String| -> ImmError { ConfigError::InvalidProbabilities(reason).into() };

    if probabilities.len() != k {
        return Err(invalid(format!(
            "{} mode probabilities for {k} filters",
            probabilities.len()
        )));
    }
    if probabilities.iter().any(|p| !(p.is_finite() && *p > 0.0)) {
        return Err(invalid("mode probabilities must be positive".to_string()));
    }
    let total: f64 = probabilities.sum();
    if (total - 1.0).abs() > DISTRIBUTION_TOLERANCE {
        return Err(invalid(format!("mode probabilities sum to {total}")));
    }

    if markov.shape() != (k, k) {
        return Err(ConfigError::DimensionMismatch {
            context: "markov_transition_matrix".to_string(),
            expected: format!("{k}x{k}"),
            actual: format!("{}x{}", markov.nrows(), markov.ncols()),
        }
        .into());
    }
    if markov.iter().any(|p| !(p.is_finite() && *p >= 0.0)) {
        return Err(invalid("markov transition probabilities must be non-negative".to_string()));
    }
    for (i, row) in markov.row_iter().enumerate() {
        let total = row.sum();
        if (total - 1.0).abs() > DISTRIBUTION_TOLERANCE {
            return Err(invalid(format!("markov row {i} sums to {total}")));
        }
    }
    for (j, column) in markov.column_iter().enumerate() {
        if column.iter().all(|p| *p == 0.0) {
            return Err(invalid(format!("mode {j} is unreachable")));
        }
    }
    Ok(())
}

/// `c_j = Σ_i markov[i][j] μ_i`, `mixing[i][j] = markov[i][j] μ_i / c_j`.
fn compute_mixing(probabilities: &DVector<f64>, markov: &DMatrix<f64>) -> Mixing {
    let k = probabilities.len();
    let column_normalizer = markov.transpose() * probabilities;

    let mut matrix = DMatrix::<f64>::zeros(k, k);
    for j in 0..k {
        for i in 0..k {
            matrix[(i, j)] = markov[(i, j)] * probabilities[i] / column_normalizer[j];
        }
    }
    Mixing {
        matrix,
        column_normalizer,
    }
}

fn expand_all(adapter: &StateSpaceAdapter, filters: &[Filter]) -> Result<Vec<(DVector<f64>, DMatrix<f64>)>> {
    filters
        .iter()
        .map(|f| {
            Ok((
                adapter.expand_state(f.state())?,
                adapter.expand_covariance(f.covariance())?,
            ))
        })
        .collect()
}

/// Mixed state and covariance for every target mode j.
fn mix(
    estimates: &[(DVector<f64>, DMatrix<f64>)],
    mixing: &DMatrix<f64>,
    n: usize,
) -> (Vec<DVector<f64>>, Vec<DMatrix<f64>>) {
    let k = estimates.len();
    let mut states = Vec::with_capacity(k);
    let mut covariances = Vec::with_capacity(k);

    for j in 0..k {
        let weights = mixing.column(j).into_owned();
        let (x, p) = combine(estimates, &weights, n);
        states.push(x);
        covariances.push(p);
    }
    (states, covariances)
}

/// Moment-matched combination `x = Σ w_i x_i`, `P = Σ w_i (P_i + d_i d_iᵀ)`.
fn combine(
    estimates: &[(DVector<f64>, DMatrix<f64>)],
    weights: &DVector<f64>,
    n: usize,
) -> (DVector<f64>, DMatrix<f64>) {
    let mut state = DVector::<f64>::zeros(n);
    for (w, (x, _)) in weights.iter().zip(estimates) {
        state += x * *w;
    }

    let mut covariance = DMatrix::<f64>::zeros(n, n);
    for (w, (x, p)) in weights.iter().zip(estimates) {
        let diff = x - &state;
        covariance += (p + outer(&diff, &diff)) * *w;
    }
    (state, covariance)
}

/// New mode probabilities from predicted probabilities and likelihoods.
fn update_mode_probabilities(
    column_normalizer: &DVector<f64>,
    likelihoods: &DVector<f64>,
) -> Result<DVector<f64>> {
    ensure_len("likelihoods", likelihoods, column_normalizer.len())?;

    let raw = column_normalizer.component_mul(likelihoods);
    let total = raw.sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(ImmError::NumericalInstability(format!(
            "mode likelihood total is {total}"
        )));
    }

    let mut probabilities = raw / total;
    probabilities.apply(|p| *p = p.max(MODE_PROBABILITY_FLOOR));
    let floored_total = probabilities.sum();
    probabilities /= floored_total;

    ensure_normalised(&probabilities)?;
    Ok(probabilities)
}

/// Sum check on freshly normalised mode probabilities.
fn ensure_normalised(probabilities: &DVector<f64>) -> Result<()> {
    let sum = probabilities.sum();
    if sum > 1.0 + MODE_PROBABILITY_TOLERANCE {
        return Err(ImmError::ModeProbabilityOverflow { sum });
    }
    Ok(())
}
