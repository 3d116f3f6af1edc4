//! Dense linear algebra for the Kalman equations
//!
//! Free functions shared by every filter variant, operating on runtime-sized
//! `DMatrix<f64>` / `DVector<f64>`.

use ::core::f64::consts::PI;
use nalgebra::{DMatrix, DVector};

use crate::{ImmError, Result};

/// Relative eigenvalue cutoff below which a direction of a covariance is
/// treated as degenerate.
const EIGEN_CUTOFF: f64 = 1e6;

// ============================================================================
// Kalman Equations
// ============================================================================

/// Computes the innovation covariance.
///
/// S = H * P * H^T + R
pub fn innovation_covariance(
    state_cov: &DMatrix<f64>,
    obs_matrix: &DMatrix<f64>,
    meas_noise: &DMatrix<f64>,
) -> DMatrix<f64> {
    obs_matrix * state_cov * obs_matrix.transpose() + meas_noise
}

/// Computes the Kalman gain from an already inverted innovation covariance.
///
/// K = P * H^T * S^{-1}
pub fn kalman_gain(
    state_cov: &DMatrix<f64>,
    obs_matrix: &DMatrix<f64>,
    innovation_cov_inv: &DMatrix<f64>,
) -> DMatrix<f64> {
    state_cov * obs_matrix.transpose() * innovation_cov_inv
}

/// Updates state covariance using Joseph form for numerical stability.
///
/// P_updated = (I - K*H) * P * (I - K*H)^T + K * R * K^T
pub fn joseph_update(
    state_cov: &DMatrix<f64>,
    kalman_gain: &DMatrix<f64>,
    obs_matrix: &DMatrix<f64>,
    meas_noise: &DMatrix<f64>,
) -> DMatrix<f64> {
    let n = state_cov.nrows();
    let i_kh = DMatrix::<f64>::identity(n, n) - kalman_gain * obs_matrix;

    let term1 = &i_kh * state_cov * i_kh.transpose();
    let term2 = kalman_gain * meas_noise * kalman_gain.transpose();

    term1 + term2
}

/// Outer product a * b^T.
#[inline]
pub fn outer(a: &DVector<f64>, b: &DVector<f64>) -> DMatrix<f64> {
    a * b.transpose()
}

/// Rounds every component to `decimals` decimal places.
pub fn round_vector(v: &DVector<f64>, decimals: i32) -> DVector<f64> {
    let scale = 10f64.powi(decimals);
    v.map(|x| (x * scale).round() / scale)
}

// ============================================================================
// Gaussian Density
// ============================================================================

/// Log-density of a zero-mean Gaussian evaluated at `z`.
///
/// Singular (rank-deficient) covariances are accepted: the density is taken
/// on the support of the covariance using its pseudo-determinant and
/// pseudo-inverse. Returns `None` if the inputs disagree in shape or contain
/// non-finite values.
pub fn gaussian_log_likelihood(z: &DVector<f64>, covariance: &DMatrix<f64>) -> Option<f64> {
    let m = z.len();
    if covariance.shape() != (m, m) {
        return None;
    }
    if z.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
        return None;
    }
    if m == 0 {
        return Some(0.0);
    }

    // Symmetrise before decomposing
    let sym = (covariance + covariance.transpose()) * 0.5;
    let eigen = sym.symmetric_eigen();

    let max_abs = eigen
        .eigenvalues
        .iter()
        .fold(0.0_f64, |acc, l| acc.max(l.abs()));
    let eps = EIGEN_CUTOFF * f64::EPSILON * max_abs;

    let mut rank = 0usize;
    let mut log_pdet = 0.0;
    let mut mahal_sq = 0.0;
    for (k, &lambda) in eigen.eigenvalues.iter().enumerate() {
        if lambda > eps {
            rank += 1;
            log_pdet += lambda.ln();
            let proj = eigen.eigenvectors.column(k).dot(z);
            mahal_sq += proj * proj / lambda;
        }
    }

    let log_norm = 0.5 * (rank as f64 * (2.0 * PI).ln() + log_pdet);
    Some(-0.5 * mahal_sq - log_norm)
}

/// Density of a zero-mean Gaussian evaluated at `z`, clamped below at
/// `f64::MIN_POSITIVE`.
pub fn gaussian_likelihood(z: &DVector<f64>, covariance: &DMatrix<f64>) -> f64 {
    gaussian_log_likelihood(z, covariance)
        .map(f64::exp)
        .filter(|l| l.is_finite())
        .unwrap_or(0.0)
        .max(f64::MIN_POSITIVE)
}

// ============================================================================
// Shape Checks
// ============================================================================

/// Fails with `ImmError::DimensionMismatch` unless `matrix` is `rows × cols`.
pub fn ensure_shape(context: &str, matrix: &DMatrix<f64>, rows: usize, cols: usize) -> Result<()> {
    if matrix.shape() != (rows, cols) {
        return Err(ImmError::DimensionMismatch {
            context: context.to_string(),
            expected: format!("{rows}x{cols}"),
            actual: format!("{}x{}", matrix.nrows(), matrix.ncols()),
        });
    }
    Ok(())
}

/// Fails with `ImmError::DimensionMismatch` unless `v` has length `len`.
pub fn ensure_len(context: &str, v: &DVector<f64>, len: usize) -> Result<()> {
    if v.len() != len {
        return Err(ImmError::DimensionMismatch {
            context: context.to_string(),
            expected: len.to_string(),
            actual: v.len().to_string(),
        });
    }
    Ok(())
}
