//! Common helpers for the estimation integration tests

#![allow(dead_code)]

use imm_tracker::filters::imm::InteractingMultipleModel;
use imm_tracker::models::presets;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Creates a planar position measurement.
pub fn make_measurement(x: f64, y: f64) -> DVector<f64> {
    DVector::from_vec(vec![x, y])
}

/// CV/CA bank over `[x, vx, ax, y, vy, ay]` started at `(x, y)` at rest.
pub fn make_cv_ca_imm(sigma_a_sq: f64, x: f64, y: f64) -> InteractingMultipleModel {
    let initial = DVector::from_vec(vec![x, 0.0, 0.0, y, 0.0, 0.0]);
    let covariance = DMatrix::from_diagonal(&DVector::from_vec(vec![
        10.0, 100.0, 10.0, 10.0, 100.0, 10.0,
    ]));
    presets::cv_ca_bank(sigma_a_sq)
        .build(&initial, Some(&covariance))
        .unwrap()
}

/// Single constant velocity filter over `[x, vx, y, vy]`.
pub fn make_cv_imm(sigma_a_sq: f64, initial: DVector<f64>) -> InteractingMultipleModel {
    presets::cv_only(sigma_a_sq)
        .build(&initial, Some(&(DMatrix::identity(4, 4) * 100.0)))
        .unwrap()
}

/// Seeded random generator so noisy scenarios are repeatable.
pub fn make_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Noisy position plots of a target moving with constant velocity.
pub fn noisy_straight_track(
    rng: &mut StdRng,
    steps: usize,
    start: (f64, f64),
    velocity: (f64, f64),
    noise_std: f64,
) -> Vec<DVector<f64>> {
    let noise = Normal::new(0.0, noise_std).unwrap();
    (1..=steps)
        .map(|k| {
            let t = k as f64;
            make_measurement(
                start.0 + velocity.0 * t + noise.sample(rng),
                start.1 + velocity.1 * t + noise.sample(rng),
            )
        })
        .collect()
}

/// Random symmetric positive definite matrix.
pub fn random_spd(rng: &mut StdRng, n: usize) -> DMatrix<f64> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    let a = DMatrix::from_fn(n, n, |_, _| normal.sample(rng));
    &a * a.transpose() + DMatrix::identity(n, n)
}

/// Checks symmetry and non-negative eigenvalues up to a relative tolerance.
pub fn is_symmetric_psd(p: &DMatrix<f64>) -> bool {
    let scale = p.amax().max(1.0);
    if (p - p.transpose()).amax() > 1e-9 * scale {
        return false;
    }
    let eigen = SymmetricEigen::new(p.clone());
    eigen.eigenvalues.iter().all(|&l| l >= -1e-9 * scale)
}

/// Asserts mode probabilities are a distribution.
pub fn assert_on_simplex(probabilities: &DVector<f64>) {
    assert!(
        (probabilities.sum() - 1.0).abs() < 1e-9,
        "Mode probabilities sum to {}",
        probabilities.sum()
    );
    assert!(
        probabilities.iter().all(|&p| p > 0.0 && p <= 1.0),
        "Mode probabilities out of range: {:?}",
        probabilities.as_slice()
    );
}
