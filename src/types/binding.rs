//! Variable bindings for symbolic matrix evaluation
//!
//! A [`Binding`] maps variable names to numeric values for one evaluation.
//! [`StateLayout`] knows which state and measurement components carry the
//! physical quantities the expressions refer to.

use std::collections::HashMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Time step since the previous cycle.
pub const DT: &str = "dt";
/// Configured noise-scale constant.
pub const SIGMA_A_SQ: &str = "sigma_a_sq";
/// Current position estimate, x component.
pub const POS_X: &str = "x";
/// Current position estimate, y component.
pub const POS_Y: &str = "y";
/// Velocity estimate, x component.
pub const VEL_X: &str = "vx";
/// Velocity estimate, y component.
pub const VEL_Y: &str = "vy";
/// Acceleration estimate, x component.
pub const ACC_X: &str = "ax";
/// Acceleration estimate, y component.
pub const ACC_Y: &str = "ay";
/// Measured position, x component.
pub const MEAS_X: &str = "x_m";
/// Measured position, y component.
pub const MEAS_Y: &str = "y_m";

/// Every variable name a symbolic matrix may reference.
pub const KNOWN_VARIABLES: [&str; 10] = [
    DT, SIGMA_A_SQ, POS_X, POS_Y, VEL_X, VEL_Y, ACC_X, ACC_Y, MEAS_X, MEAS_Y,
];

/// Numeric values for the variables of one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Binding {
    values: HashMap<String, f64>,
}

impl Binding {
    /// Creates an empty binding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the binding with one more variable set.
    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.set(name, value);
        self
    }

    /// Sets or replaces a variable.
    pub fn set(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    /// Looks up a variable.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Number of bound variables.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Names of the components of the common state vector and of the measurement.
///
/// With `state = ["x", "vx", "ax", "y", "vy", "ay"]` the variable `vy` is read
/// from state component 4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLayout {
    /// Component names of the common (IMM-level) state vector
    pub state: Vec<String>,
    /// Component names of the measurement vector
    pub measurement: Vec<String>,
}

impl StateLayout {
    /// Creates a layout from component names.
    pub fn new<S: Into<String>>(
        state: impl IntoIterator<Item = S>,
        measurement: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            state: state.into_iter().map(Into::into).collect(),
            measurement: measurement.into_iter().map(Into::into).collect(),
        }
    }

    /// Default layout for planar kinematic states measured in position.
    ///
    /// Four states are read as `[x, vx, y, vy]`, six as
    /// `[x, vx, ax, y, vy, ay]`. Other sizes get unnamed components.
    pub fn planar(state_dim: usize) -> Self {
        let state: Vec<&str> = match state_dim {
            4 => vec![POS_X, VEL_X, POS_Y, VEL_Y],
            6 => vec![POS_X, VEL_X, ACC_X, POS_Y, VEL_Y, ACC_Y],
            _ => vec![""; state_dim],
        };
        Self::new(state, [POS_X, POS_Y])
    }

    /// Dimension of the common state.
    pub fn state_dim(&self) -> usize {
        self.state.len()
    }

    /// Index of a named state component.
    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.state.iter().position(|s| s == name)
    }

    /// Index of a named measurement component.
    pub fn measurement_index(&self, name: &str) -> Option<usize> {
        self.measurement.iter().position(|s| s == name)
    }

    /// Builds the binding for one refresh of the system matrices.
    ///
    /// Kinematic variables come from `state` (the previous combined estimate),
    /// `x_m`/`y_m` from the measurement components named `x` and `y`. Without a
    /// measurement the current position estimate is used for `x_m`/`y_m`.
    /// Components the layout does not name are bound to zero.
    pub fn binding(
        &self,
        dt: f64,
        sigma_a_sq: f64,
        state: &DVector<f64>,
        measurement: Option<&DVector<f64>>,
    ) -> Binding {
        let from_state = |name: &str| {
            self.state_index(name)
                .and_then(|i| state.get(i).copied())
                .unwrap_or(0.0)
        };

        let mut binding = Binding::new()
            .with(DT, dt)
            .with(SIGMA_A_SQ, sigma_a_sq);

        for name in [POS_X, POS_Y, VEL_X, VEL_Y, ACC_X, ACC_Y] {
            binding.set(name, from_state(name));
        }

        for (meas_name, component) in [(MEAS_X, POS_X), (MEAS_Y, POS_Y)] {
            let value = measurement
                .and_then(|z| {
                    self.measurement_index(component)
                        .and_then(|i| z.get(i).copied())
                })
                .unwrap_or_else(|| from_state(component));
            binding.set(meas_name, value);
        }

        binding
    }
}
