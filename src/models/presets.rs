//! Ready-made planar motion models
//!
//! Symbolic filter specifications for the two models most banks start from,
//! and a two-model bank mixing them.
//!
//! | Model | State | Process noise |
//! |-------|-------|---------------|
//! | [`constant_velocity_2d`] | `[x, vx, y, vy]` | white-noise acceleration |
//! | [`constant_acceleration_2d`] | `[x, vx, ax, y, vy, ay]` | white-noise jerk |
//!
//! Both observe position only, with `R = I`.

use crate::types::symbolic::{matrix_spec, MatrixSpec};

use super::config::{FilterSpec, ImmSpec};

/// Component names of the constant acceleration state.
pub const CA_STATE: [&str; 6] = ["x", "vx", "ax", "y", "vy", "ay"];

/// Component names of the constant velocity state.
pub const CV_STATE: [&str; 4] = ["x", "vx", "y", "vy"];

fn identity(n: usize) -> MatrixSpec {
    matrix_spec(
        (0..n)
            .map(|r| (0..n).map(|c| if r == c { 1.0 } else { 0.0 }).collect())
            .collect(),
    )
}

/// Position-only measurement matrix selecting `columns` of an n-state.
fn position_measurement(n: usize, columns: [usize; 2]) -> MatrixSpec {
    matrix_spec(
        columns
            .iter()
            .map(|&col| (0..n).map(|c| if c == col { 1.0 } else { 0.0 }).collect())
            .collect(),
    )
}

/// 2-D constant velocity model, state `[x, vx, y, vy]`.
///
/// Process noise is the discrete white-noise acceleration model scaled by
/// `sigma_a_sq`.
pub fn constant_velocity_2d(name: &str) -> FilterSpec {
    FilterSpec {
        name: name.to_string(),
        filter_type: Some("KF".to_string()),
        transition_matrix: matrix_spec(vec![
            vec!["1", "dt", "0", "0"],
            vec!["0", "1", "0", "0"],
            vec!["0", "0", "1", "dt"],
            vec!["0", "0", "0", "1"],
        ]),
        process_noise_matrix: matrix_spec(vec![
            vec!["sigma_a_sq*dt^4/4", "sigma_a_sq*dt^3/2", "0", "0"],
            vec!["sigma_a_sq*dt^3/2", "sigma_a_sq*dt^2", "0", "0"],
            vec!["0", "0", "sigma_a_sq*dt^4/4", "sigma_a_sq*dt^3/2"],
            vec!["0", "0", "sigma_a_sq*dt^3/2", "sigma_a_sq*dt^2"],
        ]),
        measurement_control_matrix: position_measurement(4, [0, 2]),
        measurement_uncertainty_matrix: identity(2),
        ..FilterSpec::default()
    }
}

/// 2-D constant acceleration model, state `[x, vx, ax, y, vy, ay]`.
pub fn constant_acceleration_2d(name: &str) -> FilterSpec {
    let q = |r: usize, c: usize| -> &'static str {
        const BLOCK: [[&str; 3]; 3] = [
            ["sigma_a_sq*dt^5/20", "sigma_a_sq*dt^4/8", "sigma_a_sq*dt^3/6"],
            ["sigma_a_sq*dt^4/8", "sigma_a_sq*dt^3/2", "sigma_a_sq*dt^2/2"],
            ["sigma_a_sq*dt^3/6", "sigma_a_sq*dt^2/2", "sigma_a_sq*dt"],
        ];
        if r / 3 == c / 3 {
            BLOCK[r % 3][c % 3]
        } else {
            "0"
        }
    };

    FilterSpec {
        name: name.to_string(),
        filter_type: Some("KF".to_string()),
        transition_matrix: matrix_spec(vec![
            vec!["1", "dt", "dt^2/2", "0", "0", "0"],
            vec!["0", "1", "dt", "0", "0", "0"],
            vec!["0", "0", "1", "0", "0", "0"],
            vec!["0", "0", "0", "1", "dt", "dt^2/2"],
            vec!["0", "0", "0", "0", "1", "dt"],
            vec!["0", "0", "0", "0", "0", "1"],
        ]),
        process_noise_matrix: matrix_spec(
            (0..6).map(|r| (0..6).map(|c| q(r, c)).collect()).collect(),
        ),
        measurement_control_matrix: position_measurement(6, [0, 3]),
        measurement_uncertainty_matrix: identity(2),
        ..FilterSpec::default()
    }
}

/// Constant velocity (`KF`) and constant acceleration (`KF1`) bank over the
/// common state `[x, vx, ax, y, vy, ay]`.
///
/// `sigma_a_sq` is the acceleration noise variance. It scales Q of both
/// models unchanged, and the covariance expansion gives the velocity model's
/// missing acceleration components that same variance.
pub fn cv_ca_bank(sigma_a_sq: f64) -> ImmSpec {
    // Ones-padded [x, vx, y, vy, 1, 1] -> [x, vx, ax, y, vy, ay]
    let expansion = matrix_spec(vec![
        vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    ]);
    let expansion_covariance = matrix_spec(vec![
        vec!["1", "0", "0", "0", "0", "0"],
        vec!["0", "1", "0", "0", "0", "0"],
        vec!["0", "0", "0", "0", "sigma_a_sq^0.5", "0"],
        vec!["0", "0", "1", "0", "0", "0"],
        vec!["0", "0", "0", "1", "0", "0"],
        vec!["0", "0", "0", "0", "0", "sigma_a_sq^0.5"],
    ]);
    let shrinking = matrix_spec(vec![
        vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    ]);

    ImmSpec {
        filters: vec![constant_velocity_2d("KF"), constant_acceleration_2d("KF1")],
        mode_probabilities: vec![0.5, 0.5],
        markov_transition_matrix: vec![vec![0.95, 0.05], vec![0.05, 0.95]],
        state_variables: CA_STATE.iter().map(|s| s.to_string()).collect(),
        measurement_variables: vec!["x".to_string(), "y".to_string()],
        sigma_a_sq,
        expansion_matrix: Some(expansion),
        expansion_matrix_covariance: Some(expansion_covariance),
        shrinking_matrix: Some(shrinking),
    }
}

/// Single constant velocity filter over `[x, vx, y, vy]`.
pub fn cv_only(sigma_a_sq: f64) -> ImmSpec {
    ImmSpec {
        filters: vec![constant_velocity_2d("KF")],
        mode_probabilities: vec![1.0],
        markov_transition_matrix: vec![vec![1.0]],
        state_variables: CV_STATE.iter().map(|s| s.to_string()).collect(),
        measurement_variables: vec!["x".to_string(), "y".to_string()],
        sigma_a_sq,
        expansion_matrix: None,
        expansion_matrix_covariance: None,
        shrinking_matrix: None,
    }
}
